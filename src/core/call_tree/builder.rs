use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use crate::core::model::{CallEdge, MethodMeta};
use super::accessor::is_accessor;
use super::{CallTreeInfo, CallTreeNode, MethodSummaryEntry};

/// Builds bounded, cycle-free call trees from a project's call edges.
///
/// Pure: all inputs are borrowed and nothing is read from disk.
pub struct CallTreeBuilder<'a> {
    /// caller -> callees, in edge order
    outgoing: HashMap<&'a str, Vec<&'a str>>,
    callers: HashSet<&'a str>,
    valid_methods: &'a HashSet<String>,
    method_meta: &'a HashMap<String, MethodMeta>,
    max_depth: Option<usize>,
}

impl<'a> CallTreeBuilder<'a> {
    pub fn new(
        edges: &'a [CallEdge],
        valid_methods: &'a HashSet<String>,
        method_meta: &'a HashMap<String, MethodMeta>,
        max_depth: Option<usize>,
    ) -> Self {
        let mut outgoing: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut callers = HashSet::new();

        for edge in edges {
            outgoing
                .entry(edge.caller.as_str())
                .or_default()
                .push(edge.callee.as_str());
            callers.insert(edge.caller.as_str());
        }

        Self {
            outgoing,
            callers,
            valid_methods,
            method_meta,
            max_depth,
        }
    }

    /// Tree rooted at `entry_point`. The root is depth 1.
    pub fn build_tree(&self, entry_point: &str) -> CallTreeNode {
        self.expand(entry_point, 1, &HashSet::new())
    }

    /// Tree plus the derived sequence, depth and lookup maps
    pub fn build_info(
        &self,
        entry_point: &str,
        project_name: &str,
        file_path: &str,
        analyzed_at: &str,
    ) -> CallTreeInfo {
        let call_tree = self.build_tree(entry_point);
        let call_sequence = self.preorder(&call_tree);
        let depth = call_tree.max_depth();
        let (method_summary_map, method_comment_map) = self.method_maps(&call_sequence);

        debug!(
            "Call tree for {}: {} nodes, depth {}, {} in sequence",
            entry_point,
            call_tree.node_count(),
            depth,
            call_sequence.len()
        );

        CallTreeInfo {
            entry_point: entry_point.to_string(),
            call_tree,
            call_sequence,
            depth,
            method_summary_map,
            method_comment_map,
            project_name: project_name.to_string(),
            file_path: file_path.to_string(),
            analyzed_at: analyzed_at.to_string(),
        }
    }

    /// Whether a method may appear in a tree or sequence
    pub fn is_included(&self, method_fqn: &str) -> bool {
        if !self.valid_methods.contains(method_fqn) {
            return false;
        }
        if self.callers.contains(method_fqn) {
            return true;
        }
        !is_accessor(method_fqn, self.method_meta.get(method_fqn))
    }

    fn expand(&self, method_fqn: &str, depth: usize, path: &HashSet<&'a str>) -> CallTreeNode {
        let mut node = CallTreeNode::leaf(method_fqn);

        if let Some(limit) = self.max_depth {
            if depth >= limit {
                return node;
            }
        }

        let Some(callees) = self.outgoing.get(method_fqn) else {
            return node;
        };

        // Each child gets its own copy so siblings can reach the same method
        let mut path = path.clone();
        if let Some((caller, _)) = self.outgoing.get_key_value(method_fqn) {
            path.insert(*caller);
        }

        for callee in callees {
            if path.contains(callee) {
                debug!("Cycle back to {} skipped under {}", callee, method_fqn);
                continue;
            }
            if !self.is_included(callee) {
                continue;
            }
            node.calls.push(self.expand(callee, depth + 1, &path));
        }

        node
    }

    /// Pre-order flattening; a node that fails the inclusion checks is
    /// dropped together with its subtree
    pub fn preorder(&self, tree: &CallTreeNode) -> Vec<String> {
        let mut sequence = Vec::new();
        self.collect_preorder(tree, &mut sequence);
        sequence
    }

    fn collect_preorder(&self, node: &CallTreeNode, sequence: &mut Vec<String>) {
        if !self.is_included(&node.method_fqn) {
            debug!("{} excluded from call sequence", node.method_fqn);
            return;
        }
        sequence.push(node.method_fqn.clone());
        for child in &node.calls {
            self.collect_preorder(child, sequence);
        }
    }

    fn method_maps(
        &self,
        sequence: &[String],
    ) -> (BTreeMap<String, MethodSummaryEntry>, BTreeMap<String, String>) {
        let mut summaries = BTreeMap::new();
        let mut comments = BTreeMap::new();

        for fqn in sequence {
            let Some(meta) = self.method_meta.get(fqn) else {
                continue;
            };

            if let Some(summary) = &meta.summary {
                let return_type = if meta.return_type.is_empty() {
                    "void".to_string()
                } else {
                    meta.return_type.clone()
                };
                summaries.insert(
                    fqn.clone(),
                    MethodSummaryEntry {
                        summary: summary.clone(),
                        parameters: meta.parameters.clone(),
                        return_type,
                    },
                );
            }

            let display = match meta.comment.as_deref() {
                Some(comment) if !comment.is_empty() => comment.to_string(),
                _ if !meta.method_signature.is_empty() => {
                    format!("method: {}", meta.method_signature)
                }
                _ => format!("method: {}", fqn),
            };
            comments.insert(fqn.clone(), display);
        }

        (summaries, comments)
    }
}
