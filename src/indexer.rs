//! Element indexing: accessibility snapshot -> numbered outline.
//!
//! Ids are assigned from 0 in depth-first order on every call. They are only
//! meaningful for the observation built from the same snapshot.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::types::{AxNode, Bounds, INTERACTIVE_ROLES, NodeInfo, ObservationMetadata};

const MAX_NAME_CHARS: usize = 100;

/// Structural roles that carry no signal unless they are named.
const IGNORED_ROLES: &[&str] = &["generic", "none", "presentation"];

/// Emitted even when unnamed; filters and the dialog-button finder anchor on them.
const LANDMARK_ROLES: &[&str] = &[
    "RootWebArea",
    "navigation",
    "dialog",
    "alertdialog",
    "form",
    "Iframe",
];

/// Everything needed to dispatch an action against an indexed element.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementRef {
    pub xpath: String,
    pub role: String,
    pub name: String,
    pub bounds: Option<Bounds>,
    /// The outline line without indentation.
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexedTree {
    /// Outline lines, tab-indented by depth.
    pub lines: Vec<String>,
    pub refs: BTreeMap<usize, ElementRef>,
}

impl IndexedTree {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn get(&self, id: usize) -> Option<&ElementRef> {
        self.refs.get(&id)
    }

    pub fn max_id(&self) -> Option<usize> {
        self.refs.keys().next_back().copied()
    }

    pub fn metadata(&self) -> ObservationMetadata {
        ObservationMetadata {
            obs_nodes_info: self
                .refs
                .iter()
                .map(|(id, r)| {
                    (
                        *id,
                        NodeInfo {
                            text: r.text.clone(),
                            role: r.role.clone(),
                            name: r.name.clone(),
                            xpath: r.xpath.clone(),
                            bounds: r.bounds,
                        },
                    )
                })
                .collect(),
        }
    }
}

pub fn normalize_name(name: &str) -> String {
    let collapsed = name.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(MAX_NAME_CHARS).collect()
}

pub fn is_interactive(role: &str) -> bool {
    INTERACTIVE_ROLES.contains(&role)
}

/// Build the numbered outline. When `viewport` is given, nodes with bounds
/// outside it are left out (their children are still visited).
pub fn index_tree(nodes: &[AxNode], viewport: Option<&Bounds>) -> IndexedTree {
    let mut tree = IndexedTree::default();
    if nodes.is_empty() {
        return tree;
    }

    let by_id: HashMap<usize, &AxNode> = nodes.iter().map(|n| (n.node_id, n)).collect();
    let mut visited = HashSet::new();
    let root = nodes[0].node_id;
    let mut stack: Vec<(usize, usize, String)> = vec![(root, 0, String::new())];

    while let Some((node_id, depth, parent_name)) = stack.pop() {
        let Some(node) = by_id.get(&node_id) else {
            continue;
        };
        // snapshots come from the page; guard against malformed child lists
        if !visited.insert(node_id) {
            continue;
        }

        let name = normalize_name(&node.name);
        let child_depth = if should_emit(node, &name, &parent_name, viewport) {
            let id = tree.refs.len();
            let text = render_line(id, &node.role, &name, &node.properties);
            tree.lines.push(format!("{}{}", "\t".repeat(depth), text));
            tree.refs.insert(
                id,
                ElementRef {
                    xpath: node.xpath.clone(),
                    role: node.role.clone(),
                    name: name.clone(),
                    bounds: node.bounds,
                    text,
                },
            );
            depth + 1
        } else {
            depth
        };

        for child in node.children.iter().rev() {
            stack.push((*child, child_depth, name.clone()));
        }
    }

    tree
}

fn should_emit(node: &AxNode, name: &str, parent_name: &str, viewport: Option<&Bounds>) -> bool {
    let role = node.role.as_str();
    if let (Some(vp), Some(bounds)) = (viewport, node.bounds.as_ref()) {
        if !bounds.intersects(vp) {
            return false;
        }
    }
    if LANDMARK_ROLES.contains(&role) || is_interactive(role) {
        return true;
    }
    if name.is_empty() {
        return false;
    }
    if IGNORED_ROLES.contains(&role) {
        return true;
    }
    // text repeating its parent's accessible name
    !(role == "StaticText" && name == parent_name)
}

fn render_line(id: usize, role: &str, name: &str, properties: &[(String, String)]) -> String {
    let mut line = format!("[{id}] {role} '{name}'");
    for (key, value) in properties {
        line.push_str(&format!(" {key}: {value}"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: usize, role: &str, name: &str, children: &[usize]) -> AxNode {
        AxNode {
            node_id: id,
            role: role.to_string(),
            name: name.to_string(),
            properties: Vec::new(),
            children: children.to_vec(),
            xpath: format!("/html/body/n{id}"),
            bounds: None,
            tag: String::new(),
        }
    }

    fn form_page() -> Vec<AxNode> {
        let mut nodes = vec![
            node(0, "RootWebArea", "Sign up", &[1, 6]),
            node(1, "form", "", &[2, 3, 5]),
            node(2, "textbox", "", &[]),
            node(3, "button", "Submit", &[4]),
            node(4, "StaticText", "Submit", &[]),
            node(5, "generic", "", &[]),
            node(6, "StaticText", "We  value\nyour privacy", &[]),
        ];
        nodes[2].properties.push(("required".to_string(), "True".to_string()));
        nodes
    }

    #[test]
    fn test_outline_format_and_depth() {
        let tree = index_tree(&form_page(), None);
        assert_eq!(
            tree.lines,
            vec![
                "[0] RootWebArea 'Sign up'",
                "\t[1] form ''",
                "\t\t[2] textbox '' required: True",
                "\t\t[3] button 'Submit'",
                "\t[4] StaticText 'We value your privacy'",
            ]
        );
        assert_eq!(tree.get(2).unwrap().xpath, "/html/body/n2");
        assert_eq!(tree.max_id(), Some(4));
    }

    #[test]
    fn test_ids_unique_and_increasing_from_zero() {
        let tree = index_tree(&form_page(), None);
        let ids: Vec<usize> = tree
            .lines
            .iter()
            .map(|l| {
                let l = l.trim_start_matches('\t');
                l[1..l.find(']').unwrap()].parse().unwrap()
            })
            .collect();
        assert_eq!(ids, (0..ids.len()).collect::<Vec<_>>());
    }

    #[test]
    fn test_numbering_restarts_each_call() {
        let first = index_tree(&form_page(), None);
        let second = index_tree(&form_page(), None);
        assert_eq!(first, second);
    }

    #[test]
    fn test_unnamed_generic_is_transparent() {
        let nodes = vec![
            node(0, "RootWebArea", "", &[1]),
            node(1, "generic", "", &[2]),
            node(2, "link", "Privacy", &[]),
        ];
        let tree = index_tree(&nodes, None);
        assert_eq!(tree.lines[1], "\t[1] link 'Privacy'");
    }

    #[test]
    fn test_viewport_filter() {
        let mut nodes = vec![
            node(0, "RootWebArea", "", &[1, 2]),
            node(1, "button", "Visible", &[]),
            node(2, "button", "Below fold", &[]),
        ];
        nodes[1].bounds = Some(Bounds { x: 10.0, y: 10.0, width: 50.0, height: 20.0 });
        nodes[2].bounds = Some(Bounds { x: 10.0, y: 2000.0, width: 50.0, height: 20.0 });
        let viewport = Bounds { x: 0.0, y: 0.0, width: 1280.0, height: 720.0 };

        let tree = index_tree(&nodes, Some(&viewport));
        assert_eq!(tree.refs.len(), 2);
        assert_eq!(tree.get(1).unwrap().name, "Visible");
    }

    #[test]
    fn test_malformed_children_do_not_loop() {
        let nodes = vec![node(0, "RootWebArea", "", &[1, 0, 9]), node(1, "link", "a", &[0])];
        let tree = index_tree(&nodes, None);
        assert_eq!(tree.refs.len(), 2);
    }

    #[test]
    fn test_empty_snapshot() {
        assert!(index_tree(&[], None).lines.is_empty());
    }
}
