// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Tunable nodes: one sysfs file or system property each, with a fixed
//! ordered list of permitted values addressed by index.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;

use anyhow::Context;
use anyhow::Result;

use crate::properties;

enum Backend {
    File {
        hold_fd: bool,
        // Backing handle kept open across writes when hold_fd is set.
        held: Option<File>,
    },
    Property,
}

/// A single kernel-exposed tunable. Owned exclusively by the scheduler;
/// nothing else writes the backing file or property.
pub struct Node {
    name: String,
    path: String,
    values: Vec<String>,
    default_index: usize,
    reset_on_init: bool,
    backend: Backend,
    // Index last requested for actuation. Starts at default_index, but the
    // physical store is untouched until the first successful apply.
    current_index: usize,
    applied: bool,
}

impl Node {
    /// A node backed by a sysfs (or any plain) file.
    /// `default_index` must be in range of `values`.
    pub fn file(
        name: &str,
        path: &str,
        values: Vec<String>,
        default_index: usize,
        reset_on_init: bool,
        hold_fd: bool,
    ) -> Node {
        debug_assert!(default_index < values.len());
        Node {
            name: name.to_string(),
            path: path.to_string(),
            values,
            default_index,
            reset_on_init,
            backend: Backend::File {
                hold_fd,
                held: None,
            },
            current_index: default_index,
            applied: false,
        }
    }

    /// A node backed by a system property; `path` is the property key.
    pub fn property(
        name: &str,
        path: &str,
        values: Vec<String>,
        default_index: usize,
        reset_on_init: bool,
    ) -> Node {
        debug_assert!(default_index < values.len());
        Node {
            name: name.to_string(),
            path: path.to_string(),
            values,
            default_index,
            reset_on_init,
            backend: Backend::Property,
            current_index: default_index,
            applied: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn default_index(&self) -> usize {
        self.default_index
    }

    pub fn reset_on_init(&self) -> bool {
        self.reset_on_init
    }

    pub fn hold_fd(&self) -> bool {
        match self.backend {
            Backend::File { hold_fd, .. } => hold_fd,
            Backend::Property => false,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.backend, Backend::File { .. })
    }

    /// Exact string lookup used at config-parse time to translate a
    /// human-readable value into its index.
    pub fn value_index_of(&self, value: &str) -> Option<usize> {
        self.values.iter().position(|v| v == value)
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// The value last written to the backing store, if any write happened.
    pub fn current_value(&self) -> Option<&str> {
        if self.applied {
            Some(&self.values[self.current_index])
        } else {
            None
        }
    }

    /// Writes `values()[index]` to the backing store. On failure the
    /// physical state is treated as stale: `current_index` keeps its
    /// previous value and the caller decides whether to retry.
    pub fn apply_value(&mut self, index: usize) -> Result<()> {
        let value = self
            .values
            .get(index)
            .with_context(|| format!("Value index {} out of range for node {}", index, self.name))?
            .clone();
        match &mut self.backend {
            Backend::File { hold_fd, held } => {
                if *hold_fd {
                    if held.is_none() {
                        let file = OpenOptions::new()
                            .write(true)
                            .open(&self.path)
                            .with_context(|| format!("Failed to open {}", self.path))?;
                        *held = Some(file);
                    }
                    if let Some(file) = held {
                        // Held descriptors are rewound and truncated so a
                        // shorter value does not leave a stale tail behind.
                        file.set_len(0)
                            .and_then(|_| file.seek(SeekFrom::Start(0)))
                            .and_then(|_| file.write_all(value.as_bytes()))
                            .with_context(|| format!("Failed to write {}", self.path))?;
                    }
                } else {
                    std::fs::write(&self.path, value.as_bytes())
                        .with_context(|| format!("Failed to write {}", self.path))?;
                }
            }
            Backend::Property => {
                properties::set_property(&self.path, &value);
            }
        }
        self.current_index = index;
        self.applied = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::NamedTempFile;

    fn test_values() -> Vec<String> {
        vec!["384000".to_string(), "1134000".to_string(), "1512000".to_string()]
    }

    #[test]
    fn test_value_index_of() {
        let file = NamedTempFile::new().unwrap();
        let node = Node::file(
            "n0",
            file.path().to_str().unwrap(),
            test_values(),
            0,
            false,
            false,
        );
        assert_eq!(node.value_index_of("384000"), Some(0));
        assert_eq!(node.value_index_of("1512000"), Some(2));
        assert_eq!(node.value_index_of("96000"), None);
        assert_eq!(node.value_index_of(""), None);
    }

    #[test]
    fn test_file_node_apply() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let mut node = Node::file("n0", &path, test_values(), 0, false, false);
        assert_eq!(node.current_index(), 0);
        assert_eq!(node.current_value(), None);

        node.apply_value(2).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1512000");
        assert_eq!(node.current_index(), 2);
        assert_eq!(node.current_value(), Some("1512000"));

        node.apply_value(1).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1134000");
    }

    #[test]
    fn test_file_node_hold_fd() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let mut node = Node::file("n1", &path, test_values(), 0, false, true);
        node.apply_value(2).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1512000");
        // A shorter value written through the held descriptor must not leave
        // a tail of the longer previous value.
        node.apply_value(0).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "384000");
    }

    #[test]
    fn test_file_node_write_failure() {
        let mut node = Node::file(
            "n0",
            "/nonexistent-dir/no-such-node",
            test_values(),
            0,
            false,
            false,
        );
        assert!(node.apply_value(1).is_err());
        // Failed writes leave the bookkeeping untouched.
        assert_eq!(node.current_index(), 0);
        assert_eq!(node.current_value(), None);
    }

    #[test]
    fn test_property_node_apply() {
        let mut node = Node::property(
            "n2",
            "vendor.test.node_apply",
            vec!["HIGH".to_string(), "LOW".to_string(), "NONE".to_string()],
            2,
            false,
        );
        assert_eq!(node.current_value(), None);
        node.apply_value(0).unwrap();
        assert_eq!(properties::get_property("vendor.test.node_apply", ""), "HIGH");
        assert_eq!(node.current_value(), Some("HIGH"));
    }

    #[test]
    fn test_out_of_range_index() {
        let file = NamedTempFile::new().unwrap();
        let mut node = Node::file(
            "n0",
            file.path().to_str().unwrap(),
            test_values(),
            0,
            false,
            false,
        );
        assert!(node.apply_value(3).is_err());
    }
}
