//! # Document Store
//!
//! Index layout, all under one policy id:
//!
//! ```text
//! DOCUMENT   (policy, version)               -> Document
//! DOC_NODES  (policy, version, node)         -> ()
//! NODE       (policy, node)                  -> Node
//! CHILDREN   (policy, parent or "", node)    -> ()
//! PATH       (policy, section_path, node)    -> ()
//! PAGE       (policy, page_start, node)      -> ()
//! ```
//!
//! `store_document` replaces a `(policy, version)` wholesale inside one write
//! transaction: the previous node set is unlinked from every index before the
//! new one is written, so readers see either the old tree or the new one.
//!
//! The `*_in` functions take any [`KvRead`] so the query engine can run
//! several lookups against a single snapshot.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use eyre::{bail, Result};
use tracing::{debug, info};

use super::types::{Document, Node, QueryOptions, SearchResult};
use crate::btree::ScanEnd;
use crate::database::{KvRead, TreeStore, WriteTxn};
use crate::encoding::{decode_record, encode_record, str_field, table, KeyEncoder};
use crate::error::TreeStoreError;

/// Characters of context kept on each side of the first match.
const SNIPPET_RADIUS: usize = 60;

fn document_key(policy_id: &str, version_id: &str) -> Vec<u8> {
    KeyEncoder::new(table::DOCUMENT)
        .str(policy_id)
        .str(version_id)
        .finish()
}

fn doc_nodes_key(policy_id: &str, version_id: &str, node_id: &str) -> Vec<u8> {
    KeyEncoder::new(table::DOC_NODES)
        .str(policy_id)
        .str(version_id)
        .str(node_id)
        .finish()
}

fn node_key(policy_id: &str, node_id: &str) -> Vec<u8> {
    KeyEncoder::new(table::NODE)
        .str(policy_id)
        .str(node_id)
        .finish()
}

fn children_prefix(policy_id: &str, parent_id: Option<&str>) -> Vec<u8> {
    KeyEncoder::new(table::CHILDREN)
        .str(policy_id)
        .str(parent_id.unwrap_or(""))
        .finish()
}

fn children_key(node: &Node) -> Vec<u8> {
    KeyEncoder::new(table::CHILDREN)
        .str(&node.policy_id)
        .str(node.parent_id.as_deref().unwrap_or(""))
        .str(&node.node_id)
        .finish()
}

fn path_key(node: &Node) -> Vec<u8> {
    KeyEncoder::new(table::PATH)
        .str(&node.policy_id)
        .str(&node.section_path)
        .str(&node.node_id)
        .finish()
}

fn page_key(node: &Node) -> Vec<u8> {
    KeyEncoder::new(table::PAGE)
        .str(&node.policy_id)
        .int64(node.page_start)
        .str(&node.node_id)
        .finish()
}

pub(crate) fn get_document_in<R: KvRead + ?Sized>(
    txn: &R,
    policy_id: &str,
    version_id: &str,
) -> Result<Option<Document>> {
    txn.get(&document_key(policy_id, version_id))?
        .map(|bytes| decode_record(&bytes))
        .transpose()
}

pub(crate) fn get_node_in<R: KvRead + ?Sized>(
    txn: &R,
    policy_id: &str,
    node_id: &str,
) -> Result<Option<Node>> {
    txn.get(&node_key(policy_id, node_id))?
        .map(|bytes| decode_record(&bytes))
        .transpose()
}

/// Ids stored under `prefix`, read from the key field at `index`.
fn index_ids<R: KvRead + ?Sized>(txn: &R, prefix: &[u8], index: usize) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    for entry in txn.scan_prefix(prefix)? {
        let (key, _) = entry?;
        ids.push(str_field(&key, index)?);
    }
    Ok(ids)
}

/// Loads every id from `ids`, treating a dangling index entry as corruption.
fn load_nodes<R: KvRead + ?Sized>(txn: &R, policy_id: &str, ids: &[String]) -> Result<Vec<Node>> {
    ids.iter()
        .map(|id| {
            get_node_in(txn, policy_id, id)?.ok_or_else(|| {
                TreeStoreError::corruption(format!(
                    "index entry for node {}/{} has no record",
                    policy_id, id
                ))
                .into()
            })
        })
        .collect()
}

pub(crate) fn get_children_in<R: KvRead + ?Sized>(
    txn: &R,
    policy_id: &str,
    parent_id: Option<&str>,
) -> Result<Vec<Node>> {
    let ids = index_ids(txn, &children_prefix(policy_id, parent_id), 2)?;
    load_nodes(txn, policy_id, &ids)
}

/// Breadth-first from `node_id`, start node first.
pub(crate) fn get_subtree_in<R: KvRead + ?Sized>(
    txn: &R,
    policy_id: &str,
    node_id: &str,
    opts: &QueryOptions,
) -> Result<Vec<Node>> {
    let Some(start) = get_node_in(txn, policy_id, node_id)? else {
        return Ok(Vec::new());
    };

    let mut seen = HashSet::from([start.node_id.clone()]);
    let mut queue = VecDeque::from([(start.node_id.clone(), 0u32)]);
    let mut nodes = vec![start];

    while let Some((id, level)) = queue.pop_front() {
        if opts.max_depth.is_some_and(|max| level >= max) {
            continue;
        }
        for child in get_children_in(txn, policy_id, Some(&id))? {
            if !seen.insert(child.node_id.clone()) {
                continue;
            }
            queue.push_back((child.node_id.clone(), level + 1));
            nodes.push(child);
        }
    }

    if !opts.include_text {
        for node in &mut nodes {
            node.text.clear();
        }
    }
    Ok(nodes)
}

/// Root first, ending with `node_id` itself. Empty when the node is absent.
pub(crate) fn get_ancestor_path_in<R: KvRead + ?Sized>(
    txn: &R,
    policy_id: &str,
    node_id: &str,
) -> Result<Vec<Node>> {
    let mut path = Vec::new();
    let mut seen = HashSet::new();
    let mut current = Some(node_id.to_string());

    while let Some(id) = current {
        if !seen.insert(id.clone()) {
            bail!(TreeStoreError::corruption(format!(
                "parent cycle through node {}/{}",
                policy_id, id
            )));
        }
        let node = match get_node_in(txn, policy_id, &id)? {
            Some(node) => node,
            None if path.is_empty() => return Ok(Vec::new()),
            None => bail!(TreeStoreError::corruption(format!(
                "node {}/{} references missing parent {}",
                policy_id,
                path.last().map(|n: &Node| n.node_id.as_str()).unwrap_or(""),
                id
            ))),
        };
        current = node.parent_id.clone();
        path.push(node);
    }

    path.reverse();
    Ok(path)
}

fn score_node(node: &Node, terms: &[String]) -> u32 {
    let title = node.title.to_lowercase();
    let summary = node.summary.to_lowercase();
    let text = node.text.to_lowercase();

    terms
        .iter()
        .map(|term| {
            let mut score = 0;
            if title.contains(term.as_str()) {
                score += 3;
            }
            if summary.contains(term.as_str()) {
                score += 2;
            }
            if text.contains(term.as_str()) {
                score += 1;
            }
            score
        })
        .sum()
}

fn snippet(text: &str, terms: &[String]) -> String {
    let lower = text.to_lowercase();
    let Some(pos) = terms.iter().filter_map(|t| lower.find(t.as_str())).min() else {
        return String::new();
    };

    let total = text.chars().count();
    let center = lower[..pos].chars().count().min(total);
    let start = center.saturating_sub(SNIPPET_RADIUS);
    let end = (center + SNIPPET_RADIUS).min(total);

    let mut out = String::new();
    if start > 0 {
        out.push_str("...");
    }
    out.extend(text.chars().skip(start).take(end - start));
    if end < total {
        out.push_str("...");
    }
    out
}

/// Keyword search over every node of a policy. A `limit` of 0 keeps every hit.
pub(crate) fn search_in<R: KvRead + ?Sized>(
    txn: &R,
    policy_id: &str,
    query: &str,
    limit: usize,
) -> Result<Vec<SearchResult>> {
    let terms: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if terms.is_empty() {
        return Ok(Vec::new());
    }

    let prefix = KeyEncoder::new(table::NODE).str(policy_id).finish();
    let mut results = Vec::new();
    for entry in txn.scan_prefix(&prefix)? {
        let (_, value) = entry?;
        let node: Node = decode_record(&value)?;
        let score = score_node(&node, &terms);
        if score == 0 {
            continue;
        }
        results.push(SearchResult {
            snippet: snippet(&node.text, &terms),
            node_id: node.node_id,
            policy_id: node.policy_id,
            title: node.title,
            summary: node.summary,
            score,
            depth: node.depth,
        });
    }

    results.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then(a.depth.cmp(&b.depth))
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    if limit > 0 {
        results.truncate(limit);
    }
    Ok(results)
}

pub(crate) fn get_node_by_path_in<R: KvRead + ?Sized>(
    txn: &R,
    policy_id: &str,
    section_path: &str,
) -> Result<Option<Node>> {
    let prefix = KeyEncoder::new(table::PATH)
        .str(policy_id)
        .str(section_path)
        .finish();
    let first = match txn.scan_prefix(&prefix)?.next() {
        Some(entry) => entry?,
        None => return Ok(None),
    };
    get_node_in(txn, policy_id, &str_field(&first.0, 2)?)
}

pub(crate) fn get_nodes_for_page_in<R: KvRead + ?Sized>(
    txn: &R,
    policy_id: &str,
    page: i64,
) -> Result<Vec<Node>> {
    let start = KeyEncoder::new(table::PAGE).str(policy_id).finish();
    let end = KeyEncoder::new(table::PAGE)
        .str(policy_id)
        .int64(page)
        .finish_partial();

    let mut ids = Vec::new();
    for entry in txn.scan(&start, ScanEnd::Inclusive(end))? {
        let (key, _) = entry?;
        ids.push(str_field(&key, 2)?);
    }

    let mut nodes = load_nodes(txn, policy_id, &ids)?;
    nodes.retain(|node| node.covers_page(page));
    Ok(nodes)
}

fn write_node(txn: &mut WriteTxn<'_>, node: &Node) -> Result<()> {
    txn.insert(&node_key(&node.policy_id, &node.node_id), &encode_record(node)?)?;
    txn.insert(&children_key(node), &[])?;
    if !node.section_path.is_empty() {
        txn.insert(&path_key(node), &[])?;
    }
    txn.insert(&page_key(node), &[])?;
    txn.insert(
        &doc_nodes_key(&node.policy_id, &node.version_id, &node.node_id),
        &[],
    )?;
    Ok(())
}

fn unlink_node(txn: &mut WriteTxn<'_>, node: &Node) -> Result<()> {
    txn.delete(&node_key(&node.policy_id, &node.node_id))?;
    txn.delete(&children_key(node))?;
    if !node.section_path.is_empty() {
        txn.delete(&path_key(node))?;
    }
    txn.delete(&page_key(node))?;
    txn.delete(&doc_nodes_key(
        &node.policy_id,
        &node.version_id,
        &node.node_id,
    ))?;
    Ok(())
}

/// Removes the stored node set of `(policy, version)` and returns the ids of
/// the unlinked nodes. Nodes since overwritten by another version keep their
/// record and only lose this version's membership entry.
fn remove_version_nodes(
    txn: &mut WriteTxn<'_>,
    policy_id: &str,
    version_id: &str,
) -> Result<Vec<String>> {
    let prefix = KeyEncoder::new(table::DOC_NODES)
        .str(policy_id)
        .str(version_id)
        .finish();
    let ids = index_ids(&*txn, &prefix, 2)?;

    let mut removed = Vec::new();
    for id in &ids {
        match get_node_in(&*txn, policy_id, id)? {
            Some(node) if node.version_id == version_id => {
                unlink_node(txn, &node)?;
                removed.push(node);
            }
            _ => {
                txn.delete(&doc_nodes_key(policy_id, version_id, id))?;
            }
        }
    }

    let removed_ids: HashSet<&str> = removed.iter().map(|n| n.node_id.as_str()).collect();
    for node in &removed {
        let Some(parent_id) = node.parent_id.as_deref() else {
            continue;
        };
        if removed_ids.contains(parent_id) {
            continue;
        }
        if let Some(mut parent) = get_node_in(&*txn, policy_id, parent_id)? {
            parent.child_ids.retain(|c| c != &node.node_id);
            txn.insert(&node_key(policy_id, parent_id), &encode_record(&parent)?)?;
        }
    }

    Ok(removed.into_iter().map(|n| n.node_id).collect())
}

/// Fails with `Conflict` when a surviving node outside `keep` still hangs
/// below one of the `removed` ids and `keep` does not put that id back.
fn ensure_no_orphans(
    txn: &WriteTxn<'_>,
    policy_id: &str,
    removed: &[String],
    keep: &HashMap<&str, &Node>,
) -> Result<()> {
    for id in removed {
        if keep.contains_key(id.as_str()) {
            continue;
        }
        let survivors = index_ids(txn, &children_prefix(policy_id, Some(id)), 2)?;
        if let Some(child) = survivors.iter().find(|c| !keep.contains_key(c.as_str())) {
            bail!(TreeStoreError::Conflict(format!(
                "node {}/{} is still the parent of {}",
                policy_id, id, child
            )));
        }
    }
    Ok(())
}

/// Depth of `id`: roots are 0, batch parents are resolved recursively and
/// stored parents contribute their recorded depth.
fn resolve_depth(
    id: &str,
    batch: &HashMap<&str, &Node>,
    stored: &HashMap<String, Node>,
    depths: &mut HashMap<String, u32>,
    visiting: &mut HashSet<String>,
) -> Result<u32> {
    if let Some(&depth) = depths.get(id) {
        return Ok(depth);
    }
    if !visiting.insert(id.to_string()) {
        bail!(TreeStoreError::Conflict(format!(
            "node {} is its own ancestor",
            id
        )));
    }

    let node = batch[id];
    let depth = match node.parent_id.as_deref() {
        None => 0,
        Some(parent) if batch.contains_key(parent) => {
            resolve_depth(parent, batch, stored, depths, visiting)? + 1
        }
        Some(parent) => stored.get(parent).map(|p| p.depth + 1).unwrap_or(1),
    };

    depths.insert(id.to_string(), depth);
    Ok(depth)
}

fn replace_document(txn: &mut WriteTxn<'_>, doc: &Document, nodes: &[Node]) -> Result<usize> {
    let policy_id = doc.policy_id.as_str();

    let mut batch: HashMap<&str, &Node> = HashMap::with_capacity(nodes.len());
    for node in nodes {
        if batch.insert(node.node_id.as_str(), node).is_some() {
            bail!(TreeStoreError::Conflict(format!(
                "node id {} appears twice in document {}/{}",
                node.node_id, policy_id, doc.version_id
            )));
        }
    }
    if !batch.contains_key(doc.root_node_id.as_str()) {
        bail!(TreeStoreError::Conflict(format!(
            "root node {} is not part of document {}/{}",
            doc.root_node_id, policy_id, doc.version_id
        )));
    }

    let removed = remove_version_nodes(txn, policy_id, &doc.version_id)?;
    ensure_no_orphans(txn, policy_id, &removed, &batch)?;
    let replaced = removed.len();

    let mut stored_parents: HashMap<String, Node> = HashMap::new();
    for node in nodes {
        let Some(parent_id) = node.parent_id.as_deref() else {
            continue;
        };
        if batch.contains_key(parent_id) || stored_parents.contains_key(parent_id) {
            continue;
        }
        let Some(parent) = get_node_in(&*txn, policy_id, parent_id)? else {
            bail!(TreeStoreError::Conflict(format!(
                "node {} references unknown parent {} in policy {}",
                node.node_id, parent_id, policy_id
            )));
        };
        stored_parents.insert(parent_id.to_string(), parent);
    }

    let mut depths = HashMap::with_capacity(nodes.len());
    let mut visiting = HashSet::new();
    for node in nodes {
        resolve_depth(
            &node.node_id,
            &batch,
            &stored_parents,
            &mut depths,
            &mut visiting,
        )?;
    }

    let mut batch_children: HashMap<&str, Vec<String>> = HashMap::new();
    for node in nodes {
        if let Some(parent_id) = node.parent_id.as_deref() {
            batch_children
                .entry(parent_id)
                .or_default()
                .push(node.node_id.clone());
        }
    }

    let now = Utc::now();
    for node in nodes {
        let mut record = node.clone();
        record.policy_id = doc.policy_id.clone();
        record.version_id = doc.version_id.clone();
        record.depth = depths.get(&node.node_id).copied().unwrap_or(0);
        record.updated_at = now;

        let mut child_ids = batch_children
            .get(node.node_id.as_str())
            .cloned()
            .unwrap_or_default();
        let existing = index_ids(&*txn, &children_prefix(policy_id, Some(&node.node_id)), 2)?;
        for id in existing {
            if !batch.contains_key(id.as_str()) {
                child_ids.push(id);
            }
        }
        record.child_ids = child_ids;

        // same node id written by another version: drop its index entries
        if let Some(previous) = get_node_in(&*txn, policy_id, &node.node_id)? {
            unlink_node(txn, &previous)?;
        }
        write_node(txn, &record)?;
    }

    for (parent_id, mut parent) in stored_parents {
        if let Some(children) = batch_children.get(parent_id.as_str()) {
            for child in children {
                if !parent.child_ids.contains(child) {
                    parent.child_ids.push(child.clone());
                }
            }
            parent.updated_at = now;
            txn.insert(&node_key(policy_id, &parent_id), &encode_record(&parent)?)?;
        }
    }

    let mut header = doc.clone();
    header.updated_at = now;
    txn.insert(
        &document_key(policy_id, &doc.version_id),
        &encode_record(&header)?,
    )?;

    Ok(replaced)
}

/// Hierarchical document storage over a [`TreeStore`].
#[derive(Debug, Clone)]
pub struct DocumentStore {
    store: TreeStore,
}

impl DocumentStore {
    pub fn new(store: TreeStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &TreeStore {
        &self.store
    }

    /// Writes `doc` and its nodes, replacing any node set previously stored
    /// for the same `(policy_id, version_id)`.
    ///
    /// Fails with [`TreeStoreError::Conflict`] when the root id is not in
    /// `nodes`, a node id repeats, a parent is neither in the batch nor
    /// stored under the policy, or the parent links form a cycle. Nothing is
    /// written in that case.
    pub fn store_document(&self, doc: &Document, nodes: &[Node]) -> Result<()> {
        let replaced = self
            .store
            .update(|txn| replace_document(txn, doc, nodes))?;
        if replaced > 0 {
            info!(
                policy_id = %doc.policy_id,
                version_id = %doc.version_id,
                replaced,
                stored = nodes.len(),
                "document replaced"
            );
        } else {
            debug!(
                policy_id = %doc.policy_id,
                version_id = %doc.version_id,
                stored = nodes.len(),
                "document stored"
            );
        }
        Ok(())
    }

    pub fn get_document(&self, policy_id: &str, version_id: &str) -> Result<Option<Document>> {
        self.store
            .view(|txn| get_document_in(txn, policy_id, version_id))
    }

    /// Every stored version of a policy, ordered by version id.
    pub fn list_documents(&self, policy_id: &str) -> Result<Vec<Document>> {
        self.store.view(|txn| {
            let prefix = KeyEncoder::new(table::DOCUMENT).str(policy_id).finish();
            txn.scan_prefix(&prefix)?
                .map(|entry| decode_record(&entry?.1))
                .collect()
        })
    }

    /// Removes the document header and its nodes. Returns false when no
    /// such document was stored.
    pub fn delete_document(&self, policy_id: &str, version_id: &str) -> Result<bool> {
        let removed = self.store.update(|txn| {
            let existed = txn.delete(&document_key(policy_id, version_id))?;
            let removed = remove_version_nodes(txn, policy_id, version_id)?;
            ensure_no_orphans(txn, policy_id, &removed, &HashMap::new())?;
            Ok(existed.then_some(removed.len()))
        })?;
        if let Some(nodes) = removed {
            info!(%policy_id, %version_id, nodes, "document deleted");
        }
        Ok(removed.is_some())
    }

    pub fn get_node(&self, policy_id: &str, node_id: &str) -> Result<Option<Node>> {
        self.store
            .view(|txn| get_node_in(txn, policy_id, node_id))
    }

    /// Children of `parent_id`, or the policy's root nodes for `None`.
    pub fn get_children(&self, policy_id: &str, parent_id: Option<&str>) -> Result<Vec<Node>> {
        self.store
            .view(|txn| get_children_in(txn, policy_id, parent_id))
    }

    pub fn get_subtree(
        &self,
        policy_id: &str,
        node_id: &str,
        opts: &QueryOptions,
    ) -> Result<Vec<Node>> {
        self.store
            .view(|txn| get_subtree_in(txn, policy_id, node_id, opts))
    }

    pub fn get_ancestor_path(&self, policy_id: &str, node_id: &str) -> Result<Vec<Node>> {
        self.store
            .view(|txn| get_ancestor_path_in(txn, policy_id, node_id))
    }

    /// Top `limit` nodes by keyword score (0 for all). Each term adds 3 when
    /// found in the title, 2 in the summary and 1 in the text. Ties go to the
    /// shallower node, then the smaller node id.
    pub fn search(&self, policy_id: &str, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        self.store
            .view(|txn| search_in(txn, policy_id, query, limit))
    }

    pub fn get_node_by_path(&self, policy_id: &str, section_path: &str) -> Result<Option<Node>> {
        self.store
            .view(|txn| get_node_by_path_in(txn, policy_id, section_path))
    }

    /// Nodes whose page range covers `page`, ordered by first page.
    pub fn get_nodes_for_page(&self, policy_id: &str, page: i64) -> Result<Vec<Node>> {
        self.store
            .view(|txn| get_nodes_for_page_in(txn, policy_id, page))
    }
}
