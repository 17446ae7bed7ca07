//! # Query Engine
//!
//! Cross-store reads. Every public call runs inside a single read
//! transaction, so a composite result never mixes two commit versions:
//!
//! ```text
//! get_enriched_document(policy, node, version?)
//!     ├─ NODE        (policy, node)
//!     ├─ METADATA    ("node", node, *)
//!     └─ VERSION     (policy, version)  or  LATEST_VERSION (policy)
//! ```

use std::collections::BTreeMap;

use eyre::{bail, Result};
use tracing::trace;

use super::types::{
    filter, EnrichedConversation, EnrichedDocument, Query, QueryResult, QueryType, SearchHit,
    SearchOptions,
};
use crate::database::{KvRead, TreeStore};
use crate::document::{self, DocumentStore, Node};
use crate::error::TreeStoreError;
use crate::metadata::{self, entity, EntityRef, MetadataStore};
use crate::prompt::{self, PromptStore};
use crate::version::{self, VersionStore};

/// `items[offset..offset + limit]`, the total before slicing, and whether
/// anything follows the page. A `limit` of 0 takes everything after `offset`.
fn paginate<T>(items: Vec<T>, limit: usize, offset: usize) -> (Vec<T>, usize, bool) {
    let total = items.len();
    let take = if limit == 0 { usize::MAX } else { limit };
    let page: Vec<T> = items.into_iter().skip(offset).take(take).collect();
    let has_more = total > offset.saturating_add(page.len());
    (page, total, has_more)
}

fn required<'q>(query: &'q Query, name: &str) -> Result<&'q str> {
    match query.filter(name) {
        Some(value) => Ok(value),
        None => bail!("{:?} queries require the {} filter", query.kind, name),
    }
}

/// Unified read access over the document, version, metadata and prompt
/// stores sharing one [`TreeStore`].
#[derive(Debug, Clone)]
pub struct QueryEngine {
    store: TreeStore,
}

impl QueryEngine {
    pub fn new(store: TreeStore) -> Self {
        Self { store }
    }

    pub fn documents(&self) -> DocumentStore {
        DocumentStore::new(self.store.clone())
    }

    pub fn versions(&self) -> VersionStore {
        VersionStore::new(self.store.clone())
    }

    pub fn metadata(&self) -> MetadataStore {
        MetadataStore::new(self.store.clone())
    }

    pub fn prompts(&self) -> PromptStore {
        PromptStore::new(self.store.clone())
    }

    /// Runs `query` and returns one page of matches.
    ///
    /// | type     | dispatch                                               |
    /// |----------|--------------------------------------------------------|
    /// | Document | `policyId` + `nodeId`, or `policyId` + `parentId`      |
    /// | Version  | `policyId` + `versionId`, `tag`, or every version      |
    /// | Metadata | `key` [+ `value`] [+ `entityType`]                     |
    /// | Prompt   | `userId` or `tag`                                      |
    ///
    /// A missing required filter is an error; no matches is an empty page.
    pub fn execute(&self, query: &Query) -> Result<QueryResult> {
        trace!(kind = ?query.kind, filters = query.filters.len(), "executing query");
        self.store.view(|txn| {
            let result = match query.kind {
                QueryType::Document => {
                    let policy_id = required(query, filter::POLICY_ID)?;
                    let nodes = if let Some(node_id) = query.filter(filter::NODE_ID) {
                        document::get_node_in(txn, policy_id, node_id)?
                            .into_iter()
                            .collect()
                    } else if let Some(parent_id) = query.filter(filter::PARENT_ID) {
                        let parent = (!parent_id.is_empty()).then_some(parent_id);
                        document::get_children_in(txn, policy_id, parent)?
                    } else {
                        bail!("document queries require the nodeId or parentId filter");
                    };
                    let (documents, total, has_more) = paginate(nodes, query.limit, query.offset);
                    QueryResult {
                        documents,
                        total,
                        has_more,
                        ..Default::default()
                    }
                }
                QueryType::Version => {
                    let policy_id = required(query, filter::POLICY_ID)?;
                    let versions = if let Some(version_id) = query.filter(filter::VERSION_ID) {
                        version::get_version_in(txn, policy_id, version_id)?
                            .into_iter()
                            .collect()
                    } else if let Some(tag) = query.filter(filter::TAG) {
                        version::get_version_by_tag_in(txn, policy_id, tag)?
                            .into_iter()
                            .collect()
                    } else {
                        version::list_versions_in(txn, policy_id, 0, true)?
                    };
                    let (versions, total, has_more) = paginate(versions, query.limit, query.offset);
                    QueryResult {
                        versions,
                        total,
                        has_more,
                        ..Default::default()
                    }
                }
                QueryType::Metadata => {
                    let key = required(query, filter::KEY)?;
                    let entity_type = query.filter(filter::ENTITY_TYPE);
                    let entries = match query.filter(filter::VALUE) {
                        Some(value) => {
                            metadata::query_by_key_value_in(txn, key, value, entity_type, 0)?
                        }
                        None => metadata::query_by_key_in(txn, key, entity_type, 0)?,
                    };
                    let (metadata, total, has_more) = paginate(entries, query.limit, query.offset);
                    QueryResult {
                        metadata,
                        total,
                        has_more,
                        ..Default::default()
                    }
                }
                QueryType::Prompt => {
                    let conversations = if let Some(user_id) = query.filter(filter::USER_ID) {
                        prompt::list_by_user_in(txn, user_id, 0)?
                    } else if let Some(tag) = query.filter(filter::TAG) {
                        prompt::list_by_tag_in(txn, tag, 0)?
                    } else {
                        bail!("prompt queries require the userId or tag filter");
                    };
                    let (conversations, total, has_more) =
                        paginate(conversations, query.limit, query.offset);
                    QueryResult {
                        conversations,
                        total,
                        has_more,
                        ..Default::default()
                    }
                }
            };
            Ok(result)
        })
    }

    /// The node with its metadata and the requested version, or the policy's
    /// latest version when `version_id` is `None`.
    pub fn get_enriched_document(
        &self,
        policy_id: &str,
        node_id: &str,
        version_id: Option<&str>,
    ) -> Result<Option<EnrichedDocument>> {
        self.store.view(|txn| {
            let Some(node) = document::get_node_in(txn, policy_id, node_id)? else {
                return Ok(None);
            };
            let metadata = metadata::get_all_metadata_in(txn, entity::NODE, node_id)?;
            let version = match version_id {
                Some(id) => version::get_version_in(txn, policy_id, id)?,
                None => version::get_latest_version_in(txn, policy_id)?,
            };
            Ok(Some(EnrichedDocument {
                node,
                metadata,
                version,
            }))
        })
    }

    pub fn get_enriched_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<EnrichedConversation>> {
        self.store.view(|txn| {
            let Some(conversation) = prompt::get_conversation_in(txn, conversation_id)? else {
                return Ok(None);
            };
            Ok(Some(EnrichedConversation {
                conversation,
                messages: prompt::get_messages_in(txn, conversation_id)?,
                metadata: metadata::get_all_metadata_in(
                    txn,
                    entity::CONVERSATION,
                    conversation_id,
                )?,
            }))
        })
    }

    /// Resolves many node ids against one snapshot, in request order.
    /// Unknown ids are skipped.
    pub fn batch_get_nodes<S: AsRef<str>>(
        &self,
        policy_id: &str,
        node_ids: &[S],
    ) -> Result<Vec<Node>> {
        self.store.view(|txn| {
            let mut nodes = Vec::with_capacity(node_ids.len());
            for id in node_ids {
                if let Some(node) = document::get_node_in(txn, policy_id, id.as_ref())? {
                    nodes.push(node);
                }
            }
            Ok(nodes)
        })
    }

    /// Other entities whose `via_key` attribute has the same value as the
    /// given entity's.
    ///
    /// Fails with [`TreeStoreError::NotFound`] when the entity has no
    /// `via_key` attribute. `limit` 0 means no limit.
    pub fn find_related(
        &self,
        entity_type: &str,
        entity_id: &str,
        via_key: &str,
        limit: usize,
    ) -> Result<Vec<EntityRef>> {
        self.store.view(|txn| {
            let Some(source) = metadata::get_metadata_in(txn, entity_type, entity_id, via_key)?
            else {
                bail!(TreeStoreError::not_found(
                    "metadata",
                    format!("{}/{}/{}", entity_type, entity_id, via_key)
                ));
            };

            let mut related: Vec<EntityRef> =
                metadata::query_by_key_value_in(txn, via_key, &source.value, None, 0)?
                    .into_iter()
                    .filter(|e| !(e.entity_type == entity_type && e.entity_id == entity_id))
                    .map(|e| EntityRef {
                        entity_type: e.entity_type,
                        entity_id: e.entity_id,
                    })
                    .collect();
            if limit > 0 {
                related.truncate(limit);
            }
            Ok(related)
        })
    }

    /// Keyword search over a policy's nodes, dropping hits below
    /// `min_score`. Each hit carries the node's metadata.
    pub fn search(&self, opts: &SearchOptions) -> Result<Vec<SearchHit>> {
        self.store.view(|txn| {
            let mut hits = Vec::new();
            for result in document::search_in(txn, &opts.policy_id, &opts.query, 0)? {
                if result.score < opts.min_score {
                    continue;
                }
                if opts.limit > 0 && hits.len() >= opts.limit {
                    break;
                }
                let metadata = node_metadata(txn, &result.node_id)?;
                hits.push(SearchHit {
                    entity_type: entity::NODE.to_string(),
                    snippet: if result.snippet.is_empty() {
                        result.summary
                    } else {
                        result.snippet
                    },
                    entity_id: result.node_id,
                    title: result.title,
                    score: result.score,
                    metadata,
                });
            }
            Ok(hits)
        })
    }
}

fn node_metadata<R: KvRead + ?Sized>(txn: &R, node_id: &str) -> Result<BTreeMap<String, String>> {
    metadata::get_all_metadata_in(txn, entity::NODE, node_id)
}
