//! # Document Records
//!
//! A document is one ingested version of a policy: a header record plus a
//! tree of nodes. Nodes are addressed by `(policy_id, node_id)`, so a node id
//! is unique within a policy regardless of which version wrote it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub policy_id: String,
    pub version_id: String,
    /// Identifier assigned by the external page indexer, if any.
    #[serde(default)]
    pub page_index_doc_id: String,
    pub root_node_id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(policy_id: &str, version_id: &str, root_node_id: &str) -> Self {
        let now = Utc::now();
        Self {
            policy_id: policy_id.to_string(),
            version_id: version_id.to_string(),
            page_index_doc_id: String::new(),
            root_node_id: root_node_id.to_string(),
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// One section of a document tree.
///
/// `policy_id`, `version_id`, `child_ids` and `depth` are owned by
/// [`DocumentStore::store_document`](super::DocumentStore::store_document):
/// whatever the caller puts there is replaced when the node is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub policy_id: String,
    #[serde(default)]
    pub version_id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub page_start: i64,
    pub page_end: i64,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub text: String,
    /// Materialized path such as `"1.2.3"`.
    #[serde(default)]
    pub section_path: String,
    #[serde(default)]
    pub child_ids: Vec<String>,
    #[serde(default)]
    pub depth: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    pub fn new(node_id: &str, parent_id: Option<&str>, title: &str) -> Self {
        let now = Utc::now();
        Self {
            node_id: node_id.to_string(),
            policy_id: String::new(),
            version_id: String::new(),
            parent_id: parent_id.map(str::to_string),
            title: title.to_string(),
            page_start: 0,
            page_end: 0,
            summary: String::new(),
            text: String::new(),
            section_path: String::new(),
            child_ids: Vec::new(),
            depth: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_pages(mut self, start: i64, end: i64) -> Self {
        self.page_start = start;
        self.page_end = end;
        self
    }

    pub fn with_summary(mut self, summary: &str) -> Self {
        self.summary = summary.to_string();
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn with_section_path(mut self, path: &str) -> Self {
        self.section_path = path.to_string();
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn covers_page(&self, page: i64) -> bool {
        self.page_start <= page && page <= self.page_end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub node_id: String,
    pub policy_id: String,
    pub title: String,
    pub summary: String,
    pub score: u32,
    pub depth: u32,
    /// Text around the first match in the node body, empty when only the
    /// title or summary matched.
    pub snippet: String,
}

/// Options for [`DocumentStore::get_subtree`](super::DocumentStore::get_subtree).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// Levels below the start node to include; `None` walks to the leaves.
    pub max_depth: Option<u32>,
    pub include_text: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            max_depth: None,
            include_text: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_builder_sets_fields() {
        let node = Node::new("n1", Some("root"), "Coverage")
            .with_pages(3, 5)
            .with_section_path("1.2")
            .with_summary("what is covered");

        assert_eq!(node.parent_id.as_deref(), Some("root"));
        assert!(!node.is_root());
        assert!(node.covers_page(3));
        assert!(node.covers_page(5));
        assert!(!node.covers_page(6));
        assert_eq!(node.section_path, "1.2");
    }

    #[test]
    fn node_record_tolerates_missing_optional_fields() {
        let json = r#"{
            "node_id": "n1",
            "policy_id": "P",
            "parent_id": null,
            "title": "Root",
            "page_start": 1,
            "page_end": 2,
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z"
        }"#;
        let node: Node = serde_json::from_str(json).unwrap();
        assert!(node.is_root());
        assert!(node.child_ids.is_empty());
        assert_eq!(node.depth, 0);
    }
}
