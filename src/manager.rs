// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hint dispatch: maps named power hints to node mutations and meta-actions,
//! tracks per-hint usage statistics, and owns the node scheduler.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::error;
use log::info;

use crate::config;
use crate::scheduler::NodeAction;
use crate::scheduler::NodeScheduler;
use crate::sync::NoPoison;

/// Side effect on another hint, run as part of DoHint/EndHint on the owning
/// hint. Mask disables its target on DoHint and re-enables it on EndHint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HintAction {
    Do(String),
    End(String),
    Mask(String),
}

/// Snapshot of a hint's usage counters. The two fields are read with relaxed
/// ordering and are only eventually consistent with each other.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HintStats {
    pub count: u32,
    pub duration_ms: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Deadline {
    At(Instant),
    Never,
}

struct Window {
    start: Instant,
    end: Deadline,
}

struct HintStatus {
    // 0 means the hint holds until an explicit end.
    max_timeout_ms: u64,
    window: Mutex<Window>,
    count: AtomicU32,
    duration_ms: AtomicU64,
}

impl HintStatus {
    fn new(max_timeout_ms: u64) -> HintStatus {
        let now = Instant::now();
        HintStatus {
            max_timeout_ms,
            window: Mutex::new(Window {
                start: now,
                end: Deadline::At(now),
            }),
            count: AtomicU32::new(0),
            duration_ms: AtomicU64::new(0),
        }
    }
}

/// One named hint from the configuration. Immutable after load except for
/// the enabled flag and the status counters.
pub struct Hint {
    node_actions: Vec<NodeAction>,
    hint_actions: Vec<HintAction>,
    enabled: AtomicBool,
    status: HintStatus,
}

impl Hint {
    pub fn new(node_actions: Vec<NodeAction>, hint_actions: Vec<HintAction>) -> Hint {
        // A zero node-action timeout means the whole hint holds until
        // cancelled; otherwise the hint is considered active for as long as
        // its longest node action.
        let max_timeout_ms = if node_actions.iter().any(|a| a.timeout_ms == 0) {
            0
        } else {
            node_actions.iter().map(|a| a.timeout_ms).max().unwrap_or(0)
        };
        Hint {
            node_actions,
            hint_actions,
            enabled: AtomicBool::new(true),
            status: HintStatus::new(max_timeout_ms),
        }
    }

    pub fn node_actions(&self) -> &[NodeAction] {
        &self.node_actions
    }

    pub fn hint_actions(&self) -> &[HintAction] {
        &self.hint_actions
    }
}

/// The engine's public surface, consumed by the HAL service layer. All
/// operations return bool rather than failing hard: an unknown hint, a
/// masked hint or a node write error logs and reports false.
pub struct HintManager {
    scheduler: Arc<NodeScheduler>,
    hints: HashMap<String, Hint>,
}

impl HintManager {
    pub fn new(scheduler: Arc<NodeScheduler>, hints: HashMap<String, Hint>) -> HintManager {
        HintManager { scheduler, hints }
    }

    /// Builds a manager from a JSON config file, optionally starting the
    /// scheduler (the usual service path).
    pub fn from_file<P: AsRef<Path>>(path: P, start: bool) -> Result<HintManager> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let (nodes, hints) = config::parse_config(&json)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        let manager = HintManager::new(Arc::new(NodeScheduler::new(nodes)), hints);
        info!("Initialized hint manager from {}", path.display());
        if start {
            manager.start();
        }
        Ok(manager)
    }

    pub fn start(&self) -> bool {
        self.scheduler.start()
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn is_hint_supported(&self, hint_type: &str) -> bool {
        if !self.hints.contains_key(hint_type) {
            info!("Hint type not present in actions: {}", hint_type);
            return false;
        }
        true
    }

    pub fn is_hint_enabled(&self, hint_type: &str) -> bool {
        match self.hints.get(hint_type) {
            Some(hint) => hint.enabled.load(Ordering::Relaxed),
            None => {
                info!("Hint type not present in actions: {}", hint_type);
                false
            }
        }
    }

    pub fn get_hints(&self) -> Vec<String> {
        self.hints.keys().cloned().collect()
    }

    pub fn get_hint_stats(&self, hint_type: &str) -> HintStats {
        match self.hints.get(hint_type) {
            Some(hint) => HintStats {
                count: hint.status.count.load(Ordering::Relaxed),
                duration_ms: hint.status.duration_ms.load(Ordering::Relaxed),
            },
            None => {
                info!("Hint type not present in actions: {}", hint_type);
                HintStats::default()
            }
        }
    }

    /// Fires a hint with its configured per-action timeouts.
    pub fn do_hint(&self, hint_type: &str) -> bool {
        debug!("Do hint: {}", hint_type);
        let hint = match self.validate(hint_type) {
            Some(hint) => hint,
            None => return false,
        };
        if !hint.enabled.load(Ordering::Relaxed) {
            info!("Hint {} is masked", hint_type);
            return false;
        }
        if !self.scheduler.request(&hint.node_actions, hint_type) {
            return false;
        }
        self.do_hint_status(hint, hint.status.max_timeout_ms);
        self.do_hint_actions(hint);
        true
    }

    /// Fires a hint with one override timeout applied to all of its node
    /// actions.
    pub fn do_hint_with_timeout(&self, hint_type: &str, timeout_ms: u64) -> bool {
        debug!("Do hint: {} for {}ms", hint_type, timeout_ms);
        let hint = match self.validate(hint_type) {
            Some(hint) => hint,
            None => return false,
        };
        if !hint.enabled.load(Ordering::Relaxed) {
            info!("Hint {} is masked", hint_type);
            return false;
        }
        let overridden: Vec<NodeAction> = hint
            .node_actions
            .iter()
            .map(|action| NodeAction {
                timeout_ms,
                ..action.clone()
            })
            .collect();
        if !self.scheduler.request(&overridden, hint_type) {
            return false;
        }
        self.do_hint_status(hint, timeout_ms);
        self.do_hint_actions(hint);
        true
    }

    /// Ends a hint early, reverting its nodes and closing its stats window.
    pub fn end_hint(&self, hint_type: &str) -> bool {
        debug!("End hint: {}", hint_type);
        let hint = match self.validate(hint_type) {
            Some(hint) => hint,
            None => return false,
        };
        if !self.scheduler.cancel(&hint.node_actions, hint_type) {
            return false;
        }
        self.end_hint_status(hint);
        self.end_hint_actions(hint);
        true
    }

    /// Node table between banners, then hint stats sorted by name.
    pub fn dump<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        writeln!(w, "========== Begin hintd nodes ==========")?;
        writeln!(w, "Node Name\tNode Path\tCurrent Index\tCurrent Value")?;
        self.scheduler.dump(w)?;
        writeln!(w, "==========  End hintd nodes  ==========")?;
        writeln!(w, "========== Begin hintd stats ==========")?;
        writeln!(w, "Hint Name\tCounts\tDuration")?;
        let mut names = self.get_hints();
        names.sort();
        for name in names {
            let stats = self.get_hint_stats(&name);
            writeln!(w, "{}\t{}\t{}", name, stats.count, stats.duration_ms)?;
        }
        writeln!(w, "==========  End hintd stats  ==========")?;
        Ok(())
    }

    fn validate(&self, hint_type: &str) -> Option<&Hint> {
        let hint = self.hints.get(hint_type);
        if hint.is_none() {
            info!("Hint type not present in actions: {}", hint_type);
        }
        hint
    }

    // Status window bookkeeping. A previous window that already expired is
    // folded into the cumulative duration only here, at the next
    // status-touching call, never live.
    fn do_hint_status(&self, hint: &Hint, timeout_ms: u64) {
        let mut window = hint.status.window.do_lock();
        hint.status.count.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        if let Deadline::At(end) = window.end {
            if now > end {
                let elapsed = end.saturating_duration_since(window.start);
                hint.status
                    .duration_ms
                    .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
                window.start = now;
            }
        }
        window.end = if timeout_ms == 0 {
            Deadline::Never
        } else {
            Deadline::At(now + Duration::from_millis(timeout_ms))
        };
    }

    fn end_hint_status(&self, hint: &Hint) {
        let mut window = hint.status.window.do_lock();
        let now = Instant::now();
        let open = match window.end {
            Deadline::Never => true,
            Deadline::At(end) => now < end,
        };
        if open {
            let elapsed = now.saturating_duration_since(window.start);
            hint.status
                .duration_ms
                .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
            window.end = Deadline::At(now);
        }
    }

    // Meta-actions run outside any status lock, so recursive dispatch into
    // other hints cannot deadlock. Reference cycles are rejected at load.
    fn do_hint_actions(&self, hint: &Hint) {
        for action in &hint.hint_actions {
            match action {
                HintAction::Do(target) => {
                    self.do_hint(target);
                }
                HintAction::End(target) => {
                    self.end_hint(target);
                }
                HintAction::Mask(target) => match self.hints.get(target) {
                    Some(masked) => masked.enabled.store(false, Ordering::Relaxed),
                    None => error!("Failed to find {} action", target),
                },
            }
        }
    }

    fn end_hint_actions(&self, hint: &Hint) {
        for action in &hint.hint_actions {
            if let HintAction::Mask(target) = action {
                if let Some(masked) = self.hints.get(target) {
                    masked.enabled.store(true, Ordering::Relaxed);
                }
            }
        }
    }
}

impl Drop for HintManager {
    // The worker must not outlive the engine that owns the node table.
    fn drop(&mut self) {
        self.scheduler.stop();
    }
}
