// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! JSON configuration loader. Parsing is all-or-nothing: any malformed,
//! duplicated or unresolvable entry rejects the whole document and nothing
//! partially usable is returned.

use std::collections::HashMap;
use std::collections::HashSet;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::info;
use serde::Deserialize;

use crate::manager::Hint;
use crate::manager::HintAction;
use crate::node::Node;
use crate::scheduler::NodeAction;

#[derive(Deserialize)]
struct ConfigDoc {
    #[serde(rename = "Nodes")]
    nodes: Vec<NodeEntry>,
    #[serde(rename = "Actions")]
    actions: Vec<ActionEntry>,
}

#[derive(Deserialize)]
struct NodeEntry {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Path")]
    path: String,
    #[serde(rename = "Type", default)]
    node_type: Option<String>,
    #[serde(rename = "Values")]
    values: Vec<String>,
    #[serde(rename = "DefaultIndex", default)]
    default_index: Option<usize>,
    #[serde(rename = "ResetOnInit", default)]
    reset_on_init: Option<bool>,
    #[serde(rename = "HoldFd", default)]
    hold_fd: Option<bool>,
}

#[derive(Deserialize)]
struct ActionEntry {
    #[serde(rename = "PowerHint")]
    power_hint: String,
    #[serde(rename = "Type", default)]
    action_type: Option<String>,
    #[serde(rename = "Node", default)]
    node: Option<String>,
    #[serde(rename = "Value")]
    value: String,
    #[serde(rename = "Duration", default)]
    duration_ms: Option<u64>,
}

/// Parses a config document into the node table and hint table consumed by
/// the scheduler and the hint manager.
pub fn parse_config(json: &str) -> Result<(Vec<Node>, HashMap<String, Hint>)> {
    let doc: ConfigDoc = serde_json::from_str(json).context("Failed to parse JSON config")?;
    let nodes = parse_nodes(doc.nodes)?;
    let hints = parse_actions(doc.actions, &nodes)?;
    Ok((nodes, hints))
}

fn parse_nodes(entries: Vec<NodeEntry>) -> Result<Vec<Node>> {
    if entries.is_empty() {
        bail!("Nodes section is empty");
    }
    let mut nodes = Vec::with_capacity(entries.len());
    let mut names = HashSet::new();
    let mut paths = HashSet::new();
    for (i, entry) in entries.into_iter().enumerate() {
        if entry.name.is_empty() {
            bail!("Node[{}] has an empty Name", i);
        }
        if !names.insert(entry.name.clone()) {
            bail!("Node[{}] has a duplicate Name: {}", i, entry.name);
        }
        if entry.path.is_empty() {
            bail!("Node[{}] has an empty Path", i);
        }
        if !paths.insert(entry.path.clone()) {
            bail!("Node[{}] has a duplicate Path: {}", i, entry.path);
        }
        let is_file = match entry.node_type.as_deref() {
            None | Some("File") => true,
            Some("Property") => false,
            Some(other) => bail!(
                "Node[{}] has invalid Type {}: only File and Property supported",
                i,
                other
            ),
        };
        if entry.values.is_empty() {
            bail!("Node[{}] has no Values", i);
        }
        let mut seen_values = HashSet::new();
        for (j, value) in entry.values.iter().enumerate() {
            if !seen_values.insert(value.as_str()) {
                bail!("Node[{}] has a duplicate Value[{}]: {}", i, j, value);
            }
            // Only property nodes may carry an empty value (meaning
            // "clear the property").
            if is_file && value.is_empty() {
                bail!("Node[{}] has an empty Value[{}]", i, j);
            }
        }
        let default_index = entry.default_index.unwrap_or(entry.values.len() - 1);
        if default_index >= entry.values.len() {
            bail!(
                "Node[{}] DefaultIndex {} out of bound, max value index: {}",
                i,
                default_index,
                entry.values.len() - 1
            );
        }
        let reset_on_init = entry.reset_on_init.unwrap_or(false);
        if is_file {
            nodes.push(Node::file(
                &entry.name,
                &entry.path,
                entry.values,
                default_index,
                reset_on_init,
                entry.hold_fd.unwrap_or(false),
            ));
        } else {
            nodes.push(Node::property(
                &entry.name,
                &entry.path,
                entry.values,
                default_index,
                reset_on_init,
            ));
        }
    }
    info!("{} nodes parsed successfully", nodes.len());
    Ok(nodes)
}

struct HintEntry {
    node_actions: Vec<NodeAction>,
    hint_actions: Vec<HintAction>,
}

fn parse_actions(entries: Vec<ActionEntry>, nodes: &[Node]) -> Result<HashMap<String, Hint>> {
    if entries.is_empty() {
        bail!("Actions section is empty");
    }
    let node_index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, node)| (node.name(), i))
        .collect();
    let mut parsed: HashMap<String, HintEntry> = HashMap::new();
    for (i, entry) in entries.into_iter().enumerate() {
        if entry.power_hint.is_empty() {
            bail!("Action[{}] has an empty PowerHint", i);
        }
        let hint = parsed.entry(entry.power_hint).or_insert_with(|| HintEntry {
            node_actions: Vec::new(),
            hint_actions: Vec::new(),
        });
        match entry.action_type.as_deref() {
            None => {
                let node_name = entry.node.as_deref().unwrap_or("");
                let node_idx = match node_index.get(node_name) {
                    Some(idx) => *idx,
                    None => bail!(
                        "Action[{}] references Node [{}] missing from the Nodes section",
                        i,
                        node_name
                    ),
                };
                let value_index = match nodes[node_idx].value_index_of(&entry.value) {
                    Some(idx) => idx,
                    None => bail!(
                        "Action[{}] Value {} is not defined in Node [{}]",
                        i,
                        entry.value,
                        node_name
                    ),
                };
                let timeout_ms = match entry.duration_ms {
                    Some(ms) => ms,
                    None => bail!("Action[{}] has no Duration", i),
                };
                if hint.node_actions.iter().any(|a| a.node_index == node_idx) {
                    bail!("Action[{}] Node is duplicated with another Action", i);
                }
                hint.node_actions.push(NodeAction {
                    node_index: node_idx,
                    value_index,
                    timeout_ms,
                });
            }
            Some(action_type @ ("DoHint" | "EndHint" | "MaskHint")) => {
                if entry.value.is_empty() {
                    bail!("Action[{}] has an empty Value", i);
                }
                let action = match action_type {
                    "DoHint" => HintAction::Do(entry.value),
                    "EndHint" => HintAction::End(entry.value),
                    _ => HintAction::Mask(entry.value),
                };
                hint.hint_actions.push(action);
            }
            Some(other) => bail!("Action[{}] has invalid Type: {}", i, other),
        }
    }
    check_hint_cycles(&parsed)?;
    info!("{} hints parsed successfully", parsed.len());
    Ok(parsed
        .into_iter()
        .map(|(name, entry)| (name, Hint::new(entry.node_actions, entry.hint_actions)))
        .collect())
}

// DoHint meta-actions recurse into the dispatch path at runtime, so a
// reference cycle between defined hints would never terminate. Reject it
// here; references to undefined hints stay legal and only log at runtime.
// EndHint references cannot recurse (ending a hint runs no further
// DoHint/EndHint actions) and are not constrained.
fn check_hint_cycles(parsed: &HashMap<String, HintEntry>) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }

    fn visit<'a>(
        name: &'a str,
        parsed: &'a HashMap<String, HintEntry>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Result<()> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::InProgress) => bail!("Hint reference cycle involving {}", name),
            None => {}
        }
        marks.insert(name, Mark::InProgress);
        if let Some(entry) = parsed.get(name) {
            for action in &entry.hint_actions {
                let target = match action {
                    HintAction::Do(target) => target,
                    HintAction::End(_) | HintAction::Mask(_) => continue,
                };
                if parsed.contains_key(target.as_str()) {
                    visit(target, parsed, marks)?;
                }
            }
        }
        marks.insert(name, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for name in parsed.keys() {
        visit(name, parsed, &mut marks)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::NamedTempFile;

    const CONFIG_TEMPLATE: &str = r#"
{
    "Nodes": [
        {
            "Name": "CPUCluster0MinFreq",
            "Path": "__PATH0__",
            "Values": [
                "1512000",
                "1134000",
                "384000"
            ],
            "DefaultIndex": 2,
            "ResetOnInit": true
        },
        {
            "Name": "CPUCluster1MinFreq",
            "Path": "__PATH1__",
            "Values": [
                "1512000",
                "1134000",
                "384000"
            ],
            "HoldFd": true
        },
        {
            "Name": "ModeProperty",
            "Path": "__PROP__",
            "Values": [
                "HIGH",
                "LOW",
                "NONE"
            ],
            "Type": "Property"
        }
    ],
    "Actions": [
        {
            "PowerHint": "INTERACTION",
            "Node": "CPUCluster1MinFreq",
            "Value": "1134000",
            "Duration": 800
        },
        {
            "PowerHint": "INTERACTION",
            "Node": "ModeProperty",
            "Value": "LOW",
            "Duration": 800
        },
        {
            "PowerHint": "LAUNCH",
            "Node": "CPUCluster0MinFreq",
            "Value": "1134000",
            "Duration": 500
        },
        {
            "PowerHint": "LAUNCH",
            "Node": "ModeProperty",
            "Value": "HIGH",
            "Duration": 500
        },
        {
            "PowerHint": "LAUNCH",
            "Node": "CPUCluster1MinFreq",
            "Value": "1512000",
            "Duration": 2000
        },
        {
            "PowerHint": "MASK_LAUNCH_MODE",
            "Type": "MaskHint",
            "Value": "LAUNCH"
        },
        {
            "PowerHint": "END_LAUNCH_MODE",
            "Type": "EndHint",
            "Value": "LAUNCH"
        },
        {
            "PowerHint": "DO_LAUNCH_MODE",
            "Type": "DoHint",
            "Value": "LAUNCH"
        }
    ]
}
"#;

    fn test_config(path0: &str, path1: &str, prop: &str) -> String {
        CONFIG_TEMPLATE
            .replace("__PATH0__", path0)
            .replace("__PATH1__", path1)
            .replace("__PROP__", prop)
    }

    struct Files {
        path0: String,
        path1: String,
        _files: Vec<NamedTempFile>,
    }

    fn node_files() -> Files {
        let files: Vec<NamedTempFile> = (0..2).map(|_| NamedTempFile::new().unwrap()).collect();
        Files {
            path0: files[0].path().to_str().unwrap().to_string(),
            path1: files[1].path().to_str().unwrap().to_string(),
            _files: files,
        }
    }

    #[test]
    fn test_parse_config() {
        let f = node_files();
        let json = test_config(&f.path0, &f.path1, "vendor.pwhal.mode");
        let (nodes, hints) = parse_config(&json).unwrap();

        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].name(), "CPUCluster0MinFreq");
        assert_eq!(nodes[0].path(), f.path0);
        assert_eq!(
            nodes[0].values(),
            ["1512000".to_string(), "1134000".to_string(), "384000".to_string()]
        );
        assert_eq!(nodes[0].default_index(), 2);
        assert!(nodes[0].reset_on_init());
        assert!(!nodes[0].hold_fd());
        assert_eq!(nodes[1].name(), "CPUCluster1MinFreq");
        assert!(!nodes[1].reset_on_init());
        assert!(nodes[1].hold_fd());
        // DefaultIndex defaults to the last index.
        assert_eq!(nodes[1].default_index(), 2);
        assert_eq!(nodes[2].name(), "ModeProperty");
        assert_eq!(nodes[2].path(), "vendor.pwhal.mode");
        assert!(!nodes[2].is_file());

        assert_eq!(hints.len(), 5);
        assert_eq!(
            hints["INTERACTION"].node_actions(),
            [
                NodeAction {
                    node_index: 1,
                    value_index: 1,
                    timeout_ms: 800
                },
                NodeAction {
                    node_index: 2,
                    value_index: 1,
                    timeout_ms: 800
                },
            ]
        );
        assert_eq!(
            hints["LAUNCH"].node_actions(),
            [
                NodeAction {
                    node_index: 0,
                    value_index: 1,
                    timeout_ms: 500
                },
                NodeAction {
                    node_index: 2,
                    value_index: 0,
                    timeout_ms: 500
                },
                NodeAction {
                    node_index: 1,
                    value_index: 0,
                    timeout_ms: 2000
                },
            ]
        );
        assert_eq!(
            hints["MASK_LAUNCH_MODE"].hint_actions(),
            [HintAction::Mask("LAUNCH".to_string())]
        );
        assert_eq!(
            hints["END_LAUNCH_MODE"].hint_actions(),
            [HintAction::End("LAUNCH".to_string())]
        );
        assert_eq!(
            hints["DO_LAUNCH_MODE"].hint_actions(),
            [HintAction::Do("LAUNCH".to_string())]
        );
    }

    #[test]
    fn test_parse_is_deterministic() {
        let f = node_files();
        let json = test_config(&f.path0, &f.path1, "vendor.pwhal.mode");
        let (nodes_a, hints_a) = parse_config(&json).unwrap();
        let (nodes_b, hints_b) = parse_config(&json).unwrap();
        assert_eq!(nodes_a.len(), nodes_b.len());
        for (a, b) in nodes_a.iter().zip(nodes_b.iter()) {
            assert_eq!(a.name(), b.name());
            assert_eq!(a.path(), b.path());
            assert_eq!(a.values(), b.values());
            assert_eq!(a.default_index(), b.default_index());
            assert_eq!(a.reset_on_init(), b.reset_on_init());
            assert_eq!(a.hold_fd(), b.hold_fd());
        }
        assert_eq!(hints_a.len(), hints_b.len());
        for (name, a) in &hints_a {
            let b = &hints_b[name];
            assert_eq!(a.node_actions(), b.node_actions());
            assert_eq!(a.hint_actions(), b.hint_actions());
        }
    }

    #[test]
    fn test_parse_invalid_json() {
        assert!(parse_config("invalid json").is_err());
        assert!(parse_config("{}").is_err());
        assert!(parse_config(r#"{"Nodes": [], "Actions": []}"#).is_err());
    }

    #[test]
    fn test_parse_duplicate_node_name() {
        let f = node_files();
        let json = test_config(&f.path0, &f.path1, "vendor.pwhal.mode")
            .replace("CPUCluster0MinFreq", "CPUCluster1MinFreq");
        assert!(parse_config(&json).is_err());
    }

    #[test]
    fn test_parse_duplicate_node_path() {
        let f = node_files();
        let json = test_config(&f.path0, &f.path0, "vendor.pwhal.mode");
        assert!(parse_config(&json).is_err());
    }

    #[test]
    fn test_parse_duplicate_value() {
        let f = node_files();
        let json =
            test_config(&f.path0, &f.path1, "vendor.pwhal.mode").replacen("1512000", "1134000", 1);
        assert!(parse_config(&json).is_err());
    }

    #[test]
    fn test_parse_empty_file_value() {
        let f = node_files();
        let json = test_config(&f.path0, &f.path1, "vendor.pwhal.mode").replacen("384000", "", 1);
        assert!(parse_config(&json).is_err());
    }

    #[test]
    fn test_parse_empty_property_value_allowed() {
        let f = node_files();
        // An empty property value means "clear"; only the NONE value and the
        // action referencing LOW must stay resolvable.
        let json = test_config(&f.path0, &f.path1, "vendor.pwhal.mode").replace("\"NONE\"", "\"\"");
        let (nodes, _hints) = parse_config(&json).unwrap();
        assert_eq!(nodes[2].values(), ["HIGH".to_string(), "LOW".to_string(), "".to_string()]);
    }

    #[test]
    fn test_parse_default_index_out_of_bound() {
        let f = node_files();
        let json =
            test_config(&f.path0, &f.path1, "vendor.pwhal.mode").replace("\"DefaultIndex\": 2", "\"DefaultIndex\": 3");
        assert!(parse_config(&json).is_err());
    }

    #[test]
    fn test_parse_invalid_node_type() {
        let f = node_files();
        let json = test_config(&f.path0, &f.path1, "vendor.pwhal.mode")
            .replace("\"Type\": \"Property\"", "\"Type\": \"Socket\"");
        assert!(parse_config(&json).is_err());
    }

    #[test]
    fn test_parse_unknown_node_reference() {
        let f = node_files();
        let json = test_config(&f.path0, &f.path1, "vendor.pwhal.mode")
            .replace("\"Node\": \"ModeProperty\"", "\"Node\": \"NoSuchNode\"");
        assert!(parse_config(&json).is_err());
    }

    #[test]
    fn test_parse_unknown_value_reference() {
        let f = node_files();
        let json = test_config(&f.path0, &f.path1, "vendor.pwhal.mode")
            .replace("\"Value\": \"LOW\"", "\"Value\": \"MEDIUM\"");
        assert!(parse_config(&json).is_err());
    }

    #[test]
    fn test_parse_missing_duration() {
        let f = node_files();
        let json = test_config(&f.path0, &f.path1, "vendor.pwhal.mode")
            .replace("\"Value\": \"1134000\",\n            \"Duration\": 800", "\"Value\": \"1134000\"");
        assert!(parse_config(&json).is_err());
    }

    #[test]
    fn test_parse_duplicate_hint_node_pair() {
        let f = node_files();
        let json = test_config(&f.path0, &f.path1, "vendor.pwhal.mode").replacen(
            "\"Node\": \"CPUCluster0MinFreq\"",
            "\"Node\": \"CPUCluster1MinFreq\"",
            1,
        );
        assert!(parse_config(&json).is_err());
    }

    #[test]
    fn test_parse_invalid_action_type() {
        let f = node_files();
        let json = test_config(&f.path0, &f.path1, "vendor.pwhal.mode")
            .replace("\"Type\": \"MaskHint\"", "\"Type\": \"ToggleHint\"");
        assert!(parse_config(&json).is_err());
    }

    #[test]
    fn test_parse_rejects_hint_cycle() {
        let f = node_files();
        let json = test_config(&f.path0, &f.path1, "vendor.pwhal.mode").replace(
            r#"{
            "PowerHint": "DO_LAUNCH_MODE",
            "Type": "DoHint",
            "Value": "LAUNCH"
        }"#,
            r#"{
            "PowerHint": "DO_LAUNCH_MODE",
            "Type": "DoHint",
            "Value": "DO_RELAUNCH_MODE"
        },
        {
            "PowerHint": "DO_RELAUNCH_MODE",
            "Type": "DoHint",
            "Value": "DO_LAUNCH_MODE"
        }"#,
        );
        assert!(parse_config(&json).is_err());
    }

    #[test]
    fn test_parse_allows_unknown_hint_reference() {
        let f = node_files();
        // Meta-actions may reference hints that are not defined; they only
        // log at dispatch time.
        let json = test_config(&f.path0, &f.path1, "vendor.pwhal.mode")
            .replace("\"Value\": \"LAUNCH\"\n        },\n        {\n            \"PowerHint\": \"END_LAUNCH_MODE\"", "\"Value\": \"UNDEFINED\"\n        },\n        {\n            \"PowerHint\": \"END_LAUNCH_MODE\"");
        let (_nodes, hints) = parse_config(&json).unwrap();
        assert_eq!(
            hints["MASK_LAUNCH_MODE"].hint_actions(),
            [HintAction::Mask("UNDEFINED".to_string())]
        );
    }
}
