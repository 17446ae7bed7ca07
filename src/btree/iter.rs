//! # Cursor and Range Scans
//!
//! [`TreeCursor`] keeps the full root-to-leaf path so it can step to the
//! neighbouring leaf without sibling links: moving past the end of a leaf
//! climbs to the nearest ancestor with a next (or previous) slot and
//! descends again along its leftmost (or rightmost) edge.
//!
//! [`RangeScan`] wraps a cursor into an iterator of owned key/value pairs,
//! skips the leftmost sentinel and stops at a [`ScanEnd`] bound.

use eyre::{ensure, Result};
use smallvec::SmallVec;

use super::node::Node;
use super::PageReader;
use crate::config::MAX_TREE_DEPTH;
use crate::error::TreeStoreError;

pub struct TreeCursor<'p, P: PageReader + ?Sized> {
    pages: &'p P,
    path: SmallVec<[Node; MAX_TREE_DEPTH]>,
    pos: SmallVec<[u16; MAX_TREE_DEPTH]>,
    valid: bool,
}

impl<'p, P: PageReader + ?Sized> TreeCursor<'p, P> {
    fn descend(pages: &'p P, root: u64, key: &[u8]) -> Result<Self> {
        let mut cursor = Self {
            pages,
            path: SmallVec::new(),
            pos: SmallVec::new(),
            valid: false,
        };
        if root == 0 {
            return Ok(cursor);
        }

        let mut ptr = root;
        loop {
            let node = cursor.load(ptr)?;
            let idx = node.lookup_le(key);
            let next = (!node.is_leaf()).then(|| node.ptr(idx));
            cursor.path.push(node);
            cursor.pos.push(idx);
            match next {
                Some(child) => ptr = child,
                None => break,
            }
        }
        cursor.valid = true;
        Ok(cursor)
    }

    fn load(&self, ptr: u64) -> Result<Node> {
        ensure!(
            self.path.len() < 4 * MAX_TREE_DEPTH,
            TreeStoreError::corruption(format!("cursor descent through page {} is too deep", ptr))
        );
        let node = self.pages.read_node(ptr)?;
        ensure!(
            node.nkeys() > 0,
            TreeStoreError::corruption(format!("page {} holds an empty node", ptr))
        );
        Ok(node)
    }

    /// Positions on the last key `<= key`; invalid when there is none.
    pub fn seek_le(pages: &'p P, root: u64, key: &[u8]) -> Result<Self> {
        let mut cursor = Self::descend(pages, root, key)?;
        if matches!(cursor.current(), Some((k, _)) if k > key) {
            cursor.prev()?;
        }
        Ok(cursor)
    }

    /// Positions on the first key `>= key`; invalid when there is none.
    pub fn seek_ge(pages: &'p P, root: u64, key: &[u8]) -> Result<Self> {
        let mut cursor = Self::descend(pages, root, key)?;
        if matches!(cursor.current(), Some((k, _)) if k < key) {
            cursor.next()?;
        }
        Ok(cursor)
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn current(&self) -> Option<(&[u8], &[u8])> {
        if !self.valid {
            return None;
        }
        let leaf = self.path.last()?;
        let idx = *self.pos.last()?;
        Some((leaf.key(idx), leaf.value(idx)))
    }

    /// Advances to the next key. Returns false once past the last key.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<bool> {
        if !self.valid {
            return Ok(false);
        }
        let leaf = self.path.len() - 1;
        let mut level = leaf;
        loop {
            if self.pos[level] + 1 < self.path[level].nkeys() {
                self.pos[level] += 1;
                break;
            }
            if level == 0 {
                self.valid = false;
                return Ok(false);
            }
            level -= 1;
        }
        for l in level + 1..=leaf {
            let child = self.path[l - 1].ptr(self.pos[l - 1]);
            let node = self.load(child)?;
            self.path[l] = node;
            self.pos[l] = 0;
        }
        Ok(true)
    }

    /// Steps back to the previous key. Returns false once before the first.
    pub fn prev(&mut self) -> Result<bool> {
        if !self.valid {
            return Ok(false);
        }
        let leaf = self.path.len() - 1;
        let mut level = leaf;
        loop {
            if self.pos[level] > 0 {
                self.pos[level] -= 1;
                break;
            }
            if level == 0 {
                self.valid = false;
                return Ok(false);
            }
            level -= 1;
        }
        for l in level + 1..=leaf {
            let child = self.path[l - 1].ptr(self.pos[l - 1]);
            let node = self.load(child)?;
            self.pos[l] = node.nkeys() - 1;
            self.path[l] = node;
        }
        Ok(true)
    }
}

/// Where a scan stops, in the direction it travels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEnd {
    Unbounded,
    /// Forward scans stop after this key, backward scans before it.
    Inclusive(Vec<u8>),
    /// Stop at the first key without this prefix.
    Prefix(Vec<u8>),
}

impl ScanEnd {
    fn admits(&self, key: &[u8], forward: bool) -> bool {
        match self {
            ScanEnd::Unbounded => true,
            ScanEnd::Inclusive(bound) if forward => key <= bound.as_slice(),
            ScanEnd::Inclusive(bound) => key >= bound.as_slice(),
            ScanEnd::Prefix(prefix) => key.starts_with(prefix),
        }
    }
}

pub struct RangeScan<'p, P: PageReader + ?Sized> {
    cursor: TreeCursor<'p, P>,
    end: ScanEnd,
    forward: bool,
    started: bool,
    done: bool,
}

impl<'p, P: PageReader + ?Sized> RangeScan<'p, P> {
    pub fn forward(cursor: TreeCursor<'p, P>, end: ScanEnd) -> Self {
        Self {
            cursor,
            end,
            forward: true,
            started: false,
            done: false,
        }
    }

    pub fn backward(cursor: TreeCursor<'p, P>, end: ScanEnd) -> Self {
        Self {
            cursor,
            end,
            forward: false,
            started: false,
            done: false,
        }
    }

    fn step(&mut self) -> Result<bool> {
        if self.forward {
            self.cursor.next()
        } else {
            self.cursor.prev()
        }
    }
}

impl<P: PageReader + ?Sized> Iterator for RangeScan<'_, P> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if self.started {
                match self.step() {
                    Ok(true) => {}
                    Ok(false) => {
                        self.done = true;
                        return None;
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }
            self.started = true;

            let Some((key, value)) = self.cursor.current() else {
                self.done = true;
                return None;
            };
            if key.is_empty() {
                continue;
            }
            if !self.end.admits(key, self.forward) {
                self.done = true;
                return None;
            }
            return Some(Ok((key.to_vec(), value.to_vec())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::tree::tests::MemPages;
    use crate::btree::BTree;

    fn build(n: usize) -> (MemPages, BTree) {
        let mut pages = MemPages::default();
        let mut tree = BTree::default();
        for i in 0..n {
            let key = format!("k{:04}", i);
            tree.insert(&mut pages, key.as_bytes(), &[b'v'; 120]).unwrap();
        }
        (pages, tree)
    }

    fn keys(scan: RangeScan<'_, MemPages>) -> Vec<String> {
        scan.map(|r| String::from_utf8(r.unwrap().0).unwrap()).collect()
    }

    #[test]
    fn empty_tree_yields_nothing() {
        let pages = MemPages::default();
        let tree = BTree::default();
        assert!(tree.scan(&pages, b"a", ScanEnd::Unbounded).unwrap().next().is_none());
        assert!(!TreeCursor::seek_le(&pages, 0, b"a").unwrap().is_valid());
    }

    #[test]
    fn range_is_inclusive_on_both_ends() {
        let (pages, tree) = build(300);
        let got = keys(tree.range(&pages, b"k0100", b"k0104").unwrap());
        assert_eq!(got, vec!["k0100", "k0101", "k0102", "k0103", "k0104"]);
    }

    #[test]
    fn range_start_between_keys_begins_at_successor() {
        let (pages, tree) = build(50);
        let got = keys(tree.range(&pages, b"k0010x", b"k0013").unwrap());
        assert_eq!(got, vec!["k0011", "k0012", "k0013"]);
    }

    #[test]
    fn forward_scan_crosses_leaves_and_skips_sentinel() {
        let (pages, tree) = build(500);
        assert!(tree.check(&pages).unwrap().leaves > 1);

        let got = keys(tree.scan(&pages, b"", ScanEnd::Unbounded).unwrap());
        assert_eq!(got.len(), 500);
        assert_eq!(got.first().map(String::as_str), Some("k0000"));
        assert!(got.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn backward_scan_visits_keys_in_descending_order() {
        let (pages, tree) = build(500);
        let got = keys(
            tree.scan_rev(&pages, b"k0250", ScanEnd::Inclusive(b"k0240".to_vec()))
                .unwrap(),
        );
        let expected: Vec<String> = (240..=250).rev().map(|i| format!("k{:04}", i)).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn prefix_scan_stops_at_first_mismatch() {
        let (pages, tree) = build(300);
        let got = keys(tree.scan_prefix(&pages, b"k012").unwrap());
        assert_eq!(got.len(), 10);
        assert!(got.iter().all(|k| k.starts_with("k012")));
    }

    #[test]
    fn seek_le_below_every_key_lands_on_sentinel() {
        let (pages, tree) = build(10);
        let cursor = TreeCursor::seek_le(&pages, tree.root(), b"a").unwrap();
        assert_eq!(cursor.current().map(|(k, _)| k.to_vec()), Some(Vec::new()));
    }
}
