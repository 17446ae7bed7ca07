use std::collections::BTreeMap;

use crate::document::Node;
use crate::metadata::MetadataEntry;
use crate::prompt::{Conversation, Message};
use crate::version::Version;

pub use crate::config::DEFAULT_QUERY_LIMIT;

/// Filter names understood by [`QueryEngine::execute`](super::QueryEngine::execute).
pub mod filter {
    pub const POLICY_ID: &str = "policyId";
    pub const NODE_ID: &str = "nodeId";
    /// Empty string selects the policy's root nodes.
    pub const PARENT_ID: &str = "parentId";
    pub const VERSION_ID: &str = "versionId";
    pub const TAG: &str = "tag";
    pub const KEY: &str = "key";
    pub const VALUE: &str = "value";
    pub const ENTITY_TYPE: &str = "entityType";
    pub const USER_ID: &str = "userId";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Document,
    Version,
    Metadata,
    Prompt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub kind: QueryType,
    pub filters: BTreeMap<String, String>,
    pub limit: usize,
    pub offset: usize,
}

impl Query {
    pub fn filter(&self, name: &str) -> Option<&str> {
        self.filters.get(name).map(String::as_str)
    }
}

/// Fluent construction of a [`Query`].
///
/// ```ignore
/// let query = QueryBuilder::new(QueryType::Document)
///     .filter(filter::POLICY_ID, "LCD-L34220")
///     .filter(filter::PARENT_ID, "root")
///     .limit(10)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    query: Query,
}

impl QueryBuilder {
    pub fn new(kind: QueryType) -> Self {
        Self {
            query: Query {
                kind,
                filters: BTreeMap::new(),
                limit: DEFAULT_QUERY_LIMIT,
                offset: 0,
            },
        }
    }

    pub fn filter(mut self, name: &str, value: &str) -> Self {
        self.query
            .filters
            .insert(name.to_string(), value.to_string());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.query.limit = limit;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.query.offset = offset;
        self
    }

    pub fn build(self) -> Query {
        self.query
    }
}

/// One page of a query's matches. Only the collection matching the query's
/// type is filled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub documents: Vec<Node>,
    pub versions: Vec<Version>,
    pub metadata: Vec<MetadataEntry>,
    pub conversations: Vec<Conversation>,
    /// Matches before pagination.
    pub total: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedDocument {
    pub node: Node,
    pub metadata: BTreeMap<String, String>,
    pub version: Option<Version>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedConversation {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    pub policy_id: String,
    pub query: String,
    /// 0 keeps every hit.
    pub limit: usize,
    pub min_score: u32,
}

impl SearchOptions {
    pub fn new(policy_id: &str, query: &str) -> Self {
        Self {
            policy_id: policy_id.to_string(),
            query: query.to_string(),
            limit: DEFAULT_QUERY_LIMIT,
            min_score: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub entity_type: String,
    pub entity_id: String,
    pub title: String,
    pub snippet: String,
    pub score: u32,
    pub metadata: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_and_overrides() {
        let q = QueryBuilder::new(QueryType::Version)
            .filter(filter::POLICY_ID, "P")
            .offset(5)
            .build();
        assert_eq!(q.limit, DEFAULT_QUERY_LIMIT);
        assert_eq!(q.offset, 5);
        assert_eq!(q.filter(filter::POLICY_ID), Some("P"));
        assert_eq!(q.filter(filter::TAG), None);
    }
}
