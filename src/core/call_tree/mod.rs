//! Per-entry-point call trees built from the parser's flat call edges

mod accessor;
mod builder;

pub use accessor::{display_name, is_accessor, simple_name};
pub use builder::CallTreeBuilder;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A method and the in-scope methods it calls, in edge order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTreeNode {
    pub method_fqn: String,
    pub calls: Vec<CallTreeNode>,
}

impl CallTreeNode {
    pub fn leaf(method_fqn: impl Into<String>) -> Self {
        Self {
            method_fqn: method_fqn.into(),
            calls: Vec::new(),
        }
    }

    /// 1 for a leaf, otherwise 1 + the deepest child
    pub fn max_depth(&self) -> usize {
        1 + self.calls.iter().map(|c| c.max_depth()).max().unwrap_or(0)
    }

    pub fn node_count(&self) -> usize {
        1 + self.calls.iter().map(|c| c.node_count()).sum::<usize>()
    }
}

/// Summary entry for a method in the call sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodSummaryEntry {
    pub summary: String,
    pub parameters: Vec<serde_json::Value>,
    pub return_type: String,
}

/// Everything derived from one entry point's tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallTreeInfo {
    pub entry_point: String,
    pub call_tree: CallTreeNode,
    pub call_sequence: Vec<String>,
    pub depth: usize,
    pub method_summary_map: BTreeMap<String, MethodSummaryEntry>,
    pub method_comment_map: BTreeMap<String, String>,
    pub project_name: String,
    pub file_path: String,
    pub analyzed_at: String,
}
