//! # B+Tree Operations
//!
//! Point lookup, insert, delete and range scan over a root page id. All
//! mutations are copy-on-write: the path from the root to the touched leaf is
//! rebuilt, the new pages are allocated through [`PageStore::alloc_node`]
//! and the superseded ones are released through [`PageStore::free_page`].
//!
//! ## Splitting
//!
//! A node rebuilt during insert may reach two pages. [`split3`] cuts it into
//! one, two or three page-sized pieces. The left piece is filled to about
//! three quarters of a page so sequential inserts leave mostly full pages
//! behind; a third piece is needed only when a very large entry keeps the
//! left half oversized.
//!
//! ## Merging
//!
//! After a delete, a child at or under a quarter page is merged with its left
//! sibling, otherwise its right sibling, when the merged node fits one page.
//! Underfull nodes that cannot merge are left as they are.

use eyre::{ensure, Result};

use super::iter::{RangeScan, ScanEnd, TreeCursor};
use super::node::{Node, NodeKind};
use super::{PageReader, PageStore};
use crate::config::{
    MAX_KEY_SIZE, MERGE_THRESHOLD, NODE_HEADER_SIZE, PAGE_SIZE, SPLIT_FILL_TARGET,
};
use crate::error::{check_entry_size, TreeStoreError};

/// Deepest tree accepted before a descent is treated as a pointer cycle.
const MAX_DESCENT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BTree {
    root: u64,
}

/// Shape summary produced by [`BTree::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeStats {
    pub depth: usize,
    pub internal_nodes: usize,
    pub leaves: usize,
    /// Live keys, not counting the leftmost sentinel.
    pub keys: usize,
}

/// One to three page-sized pieces of a node that outgrew its page.
struct Split {
    count: u16,
    nodes: [Option<Node>; 3],
}

impl Split {
    fn one(node: Node) -> Self {
        Self {
            count: 1,
            nodes: [Some(node), None, None],
        }
    }

    fn two(left: Node, right: Node) -> Self {
        Self {
            count: 2,
            nodes: [Some(left), Some(right), None],
        }
    }

    fn three(left: Node, middle: Node, right: Node) -> Self {
        Self {
            count: 3,
            nodes: [Some(left), Some(middle), Some(right)],
        }
    }

    fn into_nodes(self) -> impl Iterator<Item = Node> {
        self.nodes.into_iter().flatten()
    }
}

enum Merge {
    None,
    Left(Node),
    Right(Node),
}

impl BTree {
    pub fn new(root: u64) -> Self {
        Self { root }
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root == 0
    }

    pub fn get<P: PageReader + ?Sized>(&self, pages: &P, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.root == 0 || key.is_empty() {
            return Ok(None);
        }

        let mut node = read_node(pages, self.root)?;
        for _ in 0..MAX_DESCENT {
            let idx = node.lookup_le(key);
            match node.kind() {
                NodeKind::Leaf => {
                    return Ok((node.key(idx) == key).then(|| node.value(idx).to_vec()));
                }
                NodeKind::Internal => {
                    let child = node.ptr(idx);
                    node = read_node(pages, child)?;
                }
            }
        }
        Err(TreeStoreError::corruption(format!(
            "descent from root {} exceeded {} levels",
            self.root, MAX_DESCENT
        ))
        .into())
    }

    /// Inserts or replaces `key`. Size limits are checked before any page is
    /// read or allocated.
    pub fn insert<S: PageStore + ?Sized>(
        &mut self,
        pages: &mut S,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        check_entry_size(key, value)?;

        if self.root == 0 {
            let mut root = Node::new(NodeKind::Leaf, 2);
            root.append_kv(0, 0, &[], &[])?;
            root.append_kv(1, 0, key, value)?;
            self.root = pages.alloc_node(root)?;
            return Ok(());
        }

        let old_root = read_node(pages, self.root)?;
        let updated = tree_insert(pages, &old_root, key, value)?;
        let split = split3(updated)?;
        pages.free_page(self.root)?;

        if split.count > 1 {
            let mut root = Node::new(NodeKind::Internal, split.count);
            for (i, piece) in split.into_nodes().enumerate() {
                let first = piece.key(0).to_vec();
                let ptr = pages.alloc_node(piece)?;
                root.append_kv(i as u16, ptr, &first, &[])?;
            }
            self.root = pages.alloc_node(root)?;
        } else {
            let mut pieces = split.into_nodes();
            let only = pieces
                .next()
                .ok_or_else(|| eyre::eyre!("split of the root produced no nodes"))?;
            self.root = pages.alloc_node(only)?;
        }
        Ok(())
    }

    /// Removes `key`; returns false and leaves the tree untouched when absent.
    pub fn delete<S: PageStore + ?Sized>(&mut self, pages: &mut S, key: &[u8]) -> Result<bool> {
        if key.len() > MAX_KEY_SIZE {
            return Err(TreeStoreError::KeyTooLarge { len: key.len() }.into());
        }
        if self.root == 0 || key.is_empty() {
            return Ok(false);
        }

        let old_root = read_node(pages, self.root)?;
        let Some(updated) = tree_delete(pages, &old_root, key)? else {
            return Ok(false);
        };
        pages.free_page(self.root)?;

        self.root = if updated.nkeys() == 0 {
            0
        } else if updated.kind() == NodeKind::Internal && updated.nkeys() == 1 {
            updated.ptr(0)
        } else {
            pages.alloc_node(updated)?
        };
        Ok(true)
    }

    /// Forward scan from the first key `>= start` until `end` stops it.
    pub fn scan<'p, P: PageReader + ?Sized>(
        &self,
        pages: &'p P,
        start: &[u8],
        end: ScanEnd,
    ) -> Result<RangeScan<'p, P>> {
        let cursor = TreeCursor::seek_ge(pages, self.root, start)?;
        Ok(RangeScan::forward(cursor, end))
    }

    /// Backward scan from the last key `<= from` until `end` stops it.
    pub fn scan_rev<'p, P: PageReader + ?Sized>(
        &self,
        pages: &'p P,
        from: &[u8],
        end: ScanEnd,
    ) -> Result<RangeScan<'p, P>> {
        let cursor = TreeCursor::seek_le(pages, self.root, from)?;
        Ok(RangeScan::backward(cursor, end))
    }

    /// All entries with `start <= key <= end`, ascending.
    pub fn range<'p, P: PageReader + ?Sized>(
        &self,
        pages: &'p P,
        start: &[u8],
        end: &[u8],
    ) -> Result<RangeScan<'p, P>> {
        self.scan(pages, start, ScanEnd::Inclusive(end.to_vec()))
    }

    /// All entries whose key starts with `prefix`, ascending.
    pub fn scan_prefix<'p, P: PageReader + ?Sized>(
        &self,
        pages: &'p P,
        prefix: &[u8],
    ) -> Result<RangeScan<'p, P>> {
        self.scan(pages, prefix, ScanEnd::Prefix(prefix.to_vec()))
    }

    /// Walks every reachable page and verifies the structural invariants:
    /// page-sized nodes, sorted keys, separators that bound their subtrees
    /// and leaves at a single depth.
    pub fn check<P: PageReader + ?Sized>(&self, pages: &P) -> Result<TreeStats> {
        let mut stats = TreeStats::default();
        if self.root == 0 {
            return Ok(stats);
        }
        let mut leaf_depth = None;
        check_node(
            pages,
            self.root,
            &[],
            None,
            1,
            &mut leaf_depth,
            &mut stats,
        )?;
        stats.depth = leaf_depth.unwrap_or(0);
        Ok(stats)
    }
}

fn read_node<P: PageReader + ?Sized>(pages: &P, ptr: u64) -> Result<Node> {
    let node = pages.read_node(ptr)?;
    ensure!(
        node.nkeys() > 0,
        TreeStoreError::corruption(format!("page {} holds an empty {:?} node", ptr, node.kind()))
    );
    Ok(node)
}

fn tree_insert<S: PageStore + ?Sized>(
    pages: &mut S,
    node: &Node,
    key: &[u8],
    value: &[u8],
) -> Result<Node> {
    let idx = node.lookup_le(key);
    match node.kind() {
        NodeKind::Leaf => {
            let existing = node.key(idx);
            if existing == key {
                leaf_update(node, idx, key, value)
            } else if existing < key {
                leaf_insert(node, idx + 1, key, value)
            } else {
                leaf_insert(node, idx, key, value)
            }
        }
        NodeKind::Internal => node_insert(pages, node, idx, key, value),
    }
}

fn leaf_insert(old: &Node, idx: u16, key: &[u8], value: &[u8]) -> Result<Node> {
    let mut new = Node::new(NodeKind::Leaf, old.nkeys() + 1);
    new.append_range(old, 0, 0, idx)?;
    new.append_kv(idx, 0, key, value)?;
    new.append_range(old, idx + 1, idx, old.nkeys() - idx)?;
    Ok(new)
}

fn leaf_update(old: &Node, idx: u16, key: &[u8], value: &[u8]) -> Result<Node> {
    let mut new = Node::new(NodeKind::Leaf, old.nkeys());
    new.append_range(old, 0, 0, idx)?;
    new.append_kv(idx, 0, key, value)?;
    new.append_range(old, idx + 1, idx + 1, old.nkeys() - (idx + 1))?;
    Ok(new)
}

fn node_insert<S: PageStore + ?Sized>(
    pages: &mut S,
    node: &Node,
    idx: u16,
    key: &[u8],
    value: &[u8],
) -> Result<Node> {
    let child_ptr = node.ptr(idx);
    let child = read_node(pages, child_ptr)?;
    let updated = tree_insert(pages, &child, key, value)?;
    let split = split3(updated)?;
    pages.free_page(child_ptr)?;
    replace_kids(pages, node, idx, split)
}

/// Replaces the link at `idx` with links to every piece of `kids`.
fn replace_kids<S: PageStore + ?Sized>(
    pages: &mut S,
    old: &Node,
    idx: u16,
    kids: Split,
) -> Result<Node> {
    let inc = kids.count;
    let mut new = Node::new(NodeKind::Internal, old.nkeys() + inc - 1);
    new.append_range(old, 0, 0, idx)?;
    for (i, kid) in kids.into_nodes().enumerate() {
        let first = kid.key(0).to_vec();
        let ptr = pages.alloc_node(kid)?;
        new.append_kv(idx + i as u16, ptr, &first, &[])?;
    }
    new.append_range(old, idx + inc, idx + 1, old.nkeys() - (idx + 1))?;
    Ok(new)
}

fn split2(old: &Node) -> Result<(Node, Node)> {
    let nkeys = old.nkeys();
    ensure!(nkeys >= 2, "cannot split a node holding {} keys", nkeys);

    let mut nleft = 1u16;
    while nleft < nkeys - 1 && old.range_bytes(0, nleft) < SPLIT_FILL_TARGET {
        nleft += 1;
    }
    if nleft > 1 && old.range_bytes(0, nleft) > PAGE_SIZE {
        nleft -= 1;
    }
    while nleft < nkeys - 1 && old.range_bytes(nleft, nkeys) > PAGE_SIZE {
        nleft += 1;
    }

    let mut left = Node::new(old.kind(), nleft);
    left.append_range(old, 0, 0, nleft)?;
    let mut right = Node::new(old.kind(), nkeys - nleft);
    right.append_range(old, 0, nleft, nkeys - nleft)?;
    Ok((left, right))
}

fn split3(old: Node) -> Result<Split> {
    if old.fits_page() {
        return Ok(Split::one(old));
    }

    let (left, right) = split2(&old)?;
    if left.fits_page() {
        ensure!(
            right.fits_page(),
            "two-way split left a {} byte right node",
            right.nbytes()
        );
        return Ok(Split::two(left, right));
    }

    let (left_left, middle) = split2(&left)?;
    ensure!(
        left_left.fits_page() && middle.fits_page() && right.fits_page(),
        "three-way split produced an oversized node ({}, {}, {} bytes)",
        left_left.nbytes(),
        middle.nbytes(),
        right.nbytes()
    );
    Ok(Split::three(left_left, middle, right))
}

fn tree_delete<S: PageStore + ?Sized>(
    pages: &mut S,
    node: &Node,
    key: &[u8],
) -> Result<Option<Node>> {
    let idx = node.lookup_le(key);
    match node.kind() {
        NodeKind::Leaf => {
            if node.key(idx) != key {
                return Ok(None);
            }
            let mut new = Node::new(NodeKind::Leaf, node.nkeys() - 1);
            new.append_range(node, 0, 0, idx)?;
            new.append_range(node, idx, idx + 1, node.nkeys() - (idx + 1))?;
            Ok(Some(new))
        }
        NodeKind::Internal => node_delete(pages, node, idx, key),
    }
}

fn node_delete<S: PageStore + ?Sized>(
    pages: &mut S,
    node: &Node,
    idx: u16,
    key: &[u8],
) -> Result<Option<Node>> {
    let child_ptr = node.ptr(idx);
    let child = read_node(pages, child_ptr)?;
    let Some(updated) = tree_delete(pages, &child, key)? else {
        return Ok(None);
    };
    pages.free_page(child_ptr)?;

    let new = match merge_target(pages, node, idx, &updated)? {
        Merge::Left(sibling) => {
            let merged = merge_nodes(&sibling, &updated)?;
            pages.free_page(node.ptr(idx - 1))?;
            replace_two_kids(pages, node, idx - 1, merged)?
        }
        Merge::Right(sibling) => {
            let merged = merge_nodes(&updated, &sibling)?;
            pages.free_page(node.ptr(idx + 1))?;
            replace_two_kids(pages, node, idx, merged)?
        }
        Merge::None if updated.nkeys() == 0 => remove_kid(node, idx)?,
        Merge::None => replace_kids(pages, node, idx, Split::one(updated))?,
    };
    Ok(Some(new))
}

fn merge_target<S: PageStore + ?Sized>(
    pages: &S,
    node: &Node,
    idx: u16,
    updated: &Node,
) -> Result<Merge> {
    if updated.nbytes() > MERGE_THRESHOLD {
        return Ok(Merge::None);
    }

    if idx > 0 {
        let sibling = read_node(pages, node.ptr(idx - 1))?;
        if sibling.nbytes() + updated.nbytes() - NODE_HEADER_SIZE <= PAGE_SIZE {
            return Ok(Merge::Left(sibling));
        }
    }
    if idx + 1 < node.nkeys() {
        let sibling = read_node(pages, node.ptr(idx + 1))?;
        if sibling.nbytes() + updated.nbytes() - NODE_HEADER_SIZE <= PAGE_SIZE {
            return Ok(Merge::Right(sibling));
        }
    }
    Ok(Merge::None)
}

fn merge_nodes(left: &Node, right: &Node) -> Result<Node> {
    ensure!(
        left.kind() == right.kind(),
        "cannot merge {:?} node with {:?} node",
        left.kind(),
        right.kind()
    );
    let mut new = Node::new(left.kind(), left.nkeys() + right.nkeys());
    new.append_range(left, 0, 0, left.nkeys())?;
    new.append_range(right, left.nkeys(), 0, right.nkeys())?;
    Ok(new)
}

/// Replaces the two adjacent links at `idx` and `idx + 1` with one.
fn replace_two_kids<S: PageStore + ?Sized>(
    pages: &mut S,
    old: &Node,
    idx: u16,
    merged: Node,
) -> Result<Node> {
    let first = merged.key(0).to_vec();
    let ptr = pages.alloc_node(merged)?;
    let mut new = Node::new(NodeKind::Internal, old.nkeys() - 1);
    new.append_range(old, 0, 0, idx)?;
    new.append_kv(idx, ptr, &first, &[])?;
    new.append_range(old, idx + 1, idx + 2, old.nkeys() - (idx + 2))?;
    Ok(new)
}

/// Drops the link at `idx`; used when a child emptied and had no sibling.
fn remove_kid(old: &Node, idx: u16) -> Result<Node> {
    let mut new = Node::new(NodeKind::Internal, old.nkeys() - 1);
    new.append_range(old, 0, 0, idx)?;
    new.append_range(old, idx, idx + 1, old.nkeys() - (idx + 1))?;
    Ok(new)
}

fn check_node<P: PageReader + ?Sized>(
    pages: &P,
    ptr: u64,
    lower: &[u8],
    upper: Option<&[u8]>,
    depth: usize,
    leaf_depth: &mut Option<usize>,
    stats: &mut TreeStats,
) -> Result<()> {
    ensure!(
        depth <= MAX_DESCENT,
        TreeStoreError::corruption(format!("page {} is deeper than {} levels", ptr, MAX_DESCENT))
    );
    let node = read_node(pages, ptr)?;
    ensure!(
        node.fits_page(),
        TreeStoreError::corruption(format!("page {} encodes {} bytes", ptr, node.nbytes()))
    );
    ensure!(
        node.key(0) >= lower,
        TreeStoreError::corruption(format!(
            "first key of page {} sorts below its parent separator",
            ptr
        ))
    );
    if let Some(upper) = upper {
        ensure!(
            node.key(node.nkeys() - 1) < upper,
            TreeStoreError::corruption(format!(
                "last key of page {} reaches the next separator",
                ptr
            ))
        );
    }

    match node.kind() {
        NodeKind::Leaf => {
            stats.leaves += 1;
            stats.keys += (0..node.nkeys()).filter(|&i| !node.key(i).is_empty()).count();
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(d) => ensure!(
                    d == depth,
                    TreeStoreError::corruption(format!(
                        "leaf page {} at depth {}, expected {}",
                        ptr, depth, d
                    ))
                ),
            }
        }
        NodeKind::Internal => {
            stats.internal_nodes += 1;
            for i in 0..node.nkeys() {
                let child_upper = if i + 1 < node.nkeys() {
                    Some(node.key(i + 1))
                } else {
                    upper
                };
                check_node(
                    pages,
                    node.ptr(i),
                    node.key(i),
                    child_upper,
                    depth + 1,
                    leaf_depth,
                    stats,
                )?;
            }
        }
    }
    Ok(())
}
