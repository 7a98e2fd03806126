// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Timed node actuation. The scheduler owns every [`Node`], accepts
//! request/cancel calls from any thread, arbitrates between overlapping
//! requests for the same node, and runs a background worker that reverts
//! nodes when requests expire.

use std::io::Write;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use log::error;
use log::info;
use log::warn;

use crate::node::Node;
use crate::sync::NoPoison;

/// One node mutation within a hint: which node, which value, and how long
/// it holds. A zero timeout holds until explicitly cancelled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeAction {
    pub node_index: usize,
    pub value_index: usize,
    pub timeout_ms: u64,
}

struct PendingRequest {
    owner: String,
    value_index: usize,
    // None means the request never expires on its own.
    expiry: Option<Instant>,
    // Issue order, used to break ties between equal expiries.
    seq: u64,
}

struct ManagedNode {
    node: Node,
    requests: Vec<PendingRequest>,
}

impl ManagedNode {
    /// The request currently in effect: an infinite request outranks any
    /// finite one, then the furthest-future expiry wins, then the most
    /// recently issued.
    fn winner(&self) -> Option<&PendingRequest> {
        self.requests
            .iter()
            .max_by_key(|r| (r.expiry.is_none(), r.expiry, r.seq))
    }

    /// Re-arbitrates and writes the winning value (or the default when no
    /// request remains) if it differs from what was last applied.
    fn resolve(&mut self) -> bool {
        let target = match self.winner() {
            Some(r) => r.value_index,
            None => self.node.default_index(),
        };
        if self.node.current_value().is_some() && target == self.node.current_index() {
            return true;
        }
        if let Err(e) = self.node.apply_value(target) {
            error!("Failed to actuate node {}: {:#}", self.node.name(), e);
            return false;
        }
        true
    }
}

struct SchedulerState {
    nodes: Vec<ManagedNode>,
    running: bool,
    next_seq: u64,
}

/// Owns the node table and the expiry worker. Callers interact through
/// [`request`](NodeScheduler::request) and [`cancel`](NodeScheduler::cancel);
/// every mutation of pending requests and node state happens under one
/// scheduler-wide lock, so writes to a given node are serialized.
pub struct NodeScheduler {
    state: Mutex<SchedulerState>,
    wakeup: Condvar,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl NodeScheduler {
    pub fn new(nodes: Vec<Node>) -> NodeScheduler {
        let nodes = nodes
            .into_iter()
            .map(|node| ManagedNode {
                node,
                requests: Vec::new(),
            })
            .collect();
        NodeScheduler {
            state: Mutex::new(SchedulerState {
                nodes,
                running: false,
                next_seq: 0,
            }),
            wakeup: Condvar::new(),
            worker: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.do_lock().running
    }

    /// Applies reset-on-init nodes to their defaults and starts the expiry
    /// worker. Idempotent; returns false only if the worker cannot be
    /// spawned.
    pub fn start(self: &Arc<Self>) -> bool {
        {
            let mut state = self.state.do_lock();
            if state.running {
                info!("Node scheduler already running");
                return true;
            }
            for managed in &mut state.nodes {
                if managed.node.reset_on_init() {
                    let default = managed.node.default_index();
                    if let Err(e) = managed.node.apply_value(default) {
                        error!("Failed to reset node {}: {:#}", managed.node.name(), e);
                    }
                }
            }
            state.running = true;
        }
        let scheduler = Arc::clone(self);
        match thread::Builder::new()
            .name("node-looper".to_string())
            .spawn(move || scheduler.worker_loop())
        {
            Ok(handle) => {
                *self.worker.do_lock() = Some(handle);
                true
            }
            Err(e) => {
                error!("Failed to spawn node looper: {}", e);
                self.state.do_lock().running = false;
                false
            }
        }
    }

    /// Stops and joins the worker. Pending requests stay queued but no
    /// further expiry processing happens until a new start.
    pub fn stop(&self) {
        {
            let mut state = self.state.do_lock();
            if !state.running {
                return;
            }
            state.running = false;
        }
        self.wakeup.notify_all();
        if let Some(handle) = self.worker.do_lock().take() {
            let _ = handle.join();
        }
    }

    /// Inserts or refreshes one pending request per action on behalf of
    /// `owner` and immediately actuates any node whose winner changed.
    /// Returns false if the scheduler is not running or any write failed.
    pub fn request(&self, actions: &[NodeAction], owner: &str) -> bool {
        let mut state = self.state.do_lock();
        if !state.running {
            warn!("Node scheduler not running, dropping request from {}", owner);
            return false;
        }
        let now = Instant::now();
        let mut ok = true;
        for action in actions {
            let seq = state.next_seq;
            state.next_seq += 1;
            let managed = match state.nodes.get_mut(action.node_index) {
                Some(managed) => managed,
                None => {
                    error!("Request from {} on unknown node {}", owner, action.node_index);
                    ok = false;
                    continue;
                }
            };
            let expiry = if action.timeout_ms == 0 {
                None
            } else {
                Some(now + Duration::from_millis(action.timeout_ms))
            };
            match managed.requests.iter_mut().find(|r| r.owner == owner) {
                Some(existing) => {
                    existing.value_index = action.value_index;
                    // Re-issuing only ever pushes the expiry later; a
                    // shorter timeout does not cut an in-flight window.
                    existing.expiry = match (existing.expiry, expiry) {
                        (Some(old), Some(new)) => Some(old.max(new)),
                        _ => None,
                    };
                    existing.seq = seq;
                }
                None => managed.requests.push(PendingRequest {
                    owner: owner.to_string(),
                    value_index: action.value_index,
                    expiry,
                    seq,
                }),
            }
            ok &= managed.resolve();
        }
        drop(state);
        self.wakeup.notify_all();
        ok
    }

    /// Drops `owner`'s pending requests on the given nodes and actuates the
    /// new winner (or the default if nothing else is pending).
    pub fn cancel(&self, actions: &[NodeAction], owner: &str) -> bool {
        let mut state = self.state.do_lock();
        if !state.running {
            warn!("Node scheduler not running, dropping cancel from {}", owner);
            return false;
        }
        let mut ok = true;
        for action in actions {
            let managed = match state.nodes.get_mut(action.node_index) {
                Some(managed) => managed,
                None => {
                    error!("Cancel from {} on unknown node {}", owner, action.node_index);
                    ok = false;
                    continue;
                }
            };
            let before = managed.requests.len();
            managed.requests.retain(|r| r.owner != owner);
            if managed.requests.len() != before {
                ok &= managed.resolve();
            }
        }
        drop(state);
        self.wakeup.notify_all();
        ok
    }

    /// One line per node in insertion order:
    /// name, path, current index, current value (empty until first write).
    pub fn dump<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        let state = self.state.do_lock();
        for managed in &state.nodes {
            writeln!(
                w,
                "{}\t{}\t{}\t{}",
                managed.node.name(),
                managed.node.path(),
                managed.node.current_index(),
                managed.node.current_value().unwrap_or("")
            )?;
        }
        Ok(())
    }

    fn worker_loop(&self) {
        let mut state = self.state.do_lock();
        loop {
            if !state.running {
                break;
            }
            let now = Instant::now();
            let mut next_expiry: Option<Instant> = None;
            for managed in &mut state.nodes {
                let before = managed.requests.len();
                managed
                    .requests
                    .retain(|r| r.expiry.map_or(true, |e| e > now));
                if managed.requests.len() != before {
                    managed.resolve();
                }
                for request in &managed.requests {
                    if let Some(expiry) = request.expiry {
                        next_expiry = Some(next_expiry.map_or(expiry, |n| n.min(expiry)));
                    }
                }
            }
            state = match next_expiry {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    self.wakeup
                        .wait_timeout(state, timeout)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
                None => self
                    .wakeup
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner()),
            };
        }
    }
}
