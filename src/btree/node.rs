//! # B+Tree Node Codec
//!
//! A [`Node`] is a typed view over one page (or, while it is being built, a
//! two-page working buffer). All field access goes through methods that
//! compute offsets from the header, and [`Node::from_page`] validates every
//! offset before a page read from disk can be used.
//!
//! ## Page Layout
//!
//! ```text
//! Offset              Size        Field
//! ------------------  ----------  ------------------------------------------
//! 0                   2           kind (1 = internal, 2 = leaf), u16 LE
//! 2                   2           nkeys, u16 LE
//! 4                   8 * nkeys   child page ids (internal nodes only)
//! ..                  2 * nkeys   cumulative offsets of entries 1..=nkeys
//! ..                  ...         packed entries
//! ```
//!
//! Each entry is `klen u16 | vlen u16 | key | value`. Internal nodes store a
//! zero `vlen`. The offset of entry 0 is implicitly zero, so the offset table
//! holds the *end* of every entry, and entry `i` spans
//! `offset(i)..offset(i + 1)` of the payload area.
//!
//! ## Building Nodes
//!
//! Nodes are never edited in place. A replacement is created with
//! [`Node::new`] sized for its final key count, then filled left to right
//! with [`Node::append_range`] (bulk copy from an existing node) and
//! [`Node::append_kv`]. The working buffer is two pages, so a node may
//! temporarily exceed one page until the tree splits it.

use std::cmp::Ordering;

use eyre::{ensure, Result};
use zerocopy::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{
    KV_HEADER_SIZE, MAX_KEY_SIZE, MAX_VALUE_SIZE, NODE_HEADER_SIZE, NODE_KIND_INTERNAL,
    NODE_KIND_LEAF, OFFSET_SIZE, PAGE_SIZE, POINTER_SIZE, WORKING_NODE_SIZE,
};
use crate::error::TreeStoreError;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Internal = NODE_KIND_INTERNAL,
    Leaf = NODE_KIND_LEAF,
}

impl NodeKind {
    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            NODE_KIND_INTERNAL => Some(NodeKind::Internal),
            NODE_KIND_LEAF => Some(NodeKind::Leaf),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct NodeHeader {
    kind: U16,
    nkeys: U16,
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HEADER_SIZE);

impl NodeHeader {
    fn new(kind: NodeKind, nkeys: u16) -> Self {
        Self {
            kind: U16::new(kind as u16),
            nkeys: U16::new(nkeys),
        }
    }

    zerocopy_accessors! {
        kind: u16,
        nkeys: u16,
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Node {
    data: Vec<u8>,
    kind: NodeKind,
    nkeys: u16,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("kind", &self.kind)
            .field("nkeys", &self.nkeys)
            .field("nbytes", &self.nbytes())
            .finish()
    }
}

impl Node {
    /// Creates an empty working node that will hold exactly `nkeys` entries.
    pub fn new(kind: NodeKind, nkeys: u16) -> Self {
        let mut data = vec![0u8; WORKING_NODE_SIZE];
        data[..NODE_HEADER_SIZE].copy_from_slice(NodeHeader::new(kind, nkeys).as_bytes());
        Self { data, kind, nkeys }
    }

    /// Decodes a page read from storage, validating the header, the offset
    /// table and every entry boundary.
    pub fn from_page(data: Vec<u8>) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            TreeStoreError::corruption(format!(
                "node page has {} bytes, expected {}",
                data.len(),
                PAGE_SIZE
            ))
        );

        let header = NodeHeader::read_from_bytes(&data[..NODE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse node header: {:?}", e))?;

        let kind = NodeKind::from_tag(header.kind()).ok_or_else(|| {
            TreeStoreError::corruption(format!("unknown node kind tag {}", header.kind()))
        })?;

        let node = Self {
            data,
            kind,
            nkeys: header.nkeys(),
        };
        node.validate()?;
        Ok(node)
    }

    fn validate(&self) -> Result<()> {
        let payload_start = self.payload_start();
        ensure!(
            payload_start <= PAGE_SIZE,
            TreeStoreError::corruption(format!(
                "{:?} node claims {} keys, which overflows the page",
                self.kind, self.nkeys
            ))
        );

        let mut prev_end = 0usize;
        for i in 0..self.nkeys {
            let end = self.offset(i + 1) as usize;
            ensure!(
                end >= prev_end + KV_HEADER_SIZE && payload_start + end <= PAGE_SIZE,
                TreeStoreError::corruption(format!(
                    "entry {} ends at offset {} (previous end {}) outside the page",
                    i, end, prev_end
                ))
            );

            let pos = payload_start + prev_end;
            let klen = read_u16(&self.data, pos) as usize;
            let vlen = read_u16(&self.data, pos + 2) as usize;
            ensure!(
                KV_HEADER_SIZE + klen + vlen == end - prev_end,
                TreeStoreError::corruption(format!(
                    "entry {} lengths {}+{} disagree with offset table span {}",
                    i,
                    klen,
                    vlen,
                    end - prev_end
                ))
            );
            ensure!(
                klen <= MAX_KEY_SIZE && vlen <= MAX_VALUE_SIZE,
                TreeStoreError::corruption(format!("entry {} exceeds size limits", i))
            );
            ensure!(
                self.kind == NodeKind::Leaf || vlen == 0,
                TreeStoreError::corruption(format!("internal entry {} carries a value", i))
            );

            if i > 0 {
                ensure!(
                    self.key(i - 1) < self.key(i),
                    TreeStoreError::corruption(format!("keys out of order at entry {}", i))
                );
            }
            prev_end = end;
        }
        Ok(())
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    pub fn nkeys(&self) -> u16 {
        self.nkeys
    }

    fn pointer_area(&self) -> usize {
        match self.kind {
            NodeKind::Internal => POINTER_SIZE * self.nkeys as usize,
            NodeKind::Leaf => 0,
        }
    }

    fn payload_start(&self) -> usize {
        NODE_HEADER_SIZE + self.pointer_area() + OFFSET_SIZE * self.nkeys as usize
    }

    pub fn ptr(&self, idx: u16) -> u64 {
        debug_assert!(self.kind == NodeKind::Internal && idx < self.nkeys);
        let pos = NODE_HEADER_SIZE + POINTER_SIZE * idx as usize;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.data[pos..pos + POINTER_SIZE]);
        u64::from_le_bytes(buf)
    }

    fn set_ptr(&mut self, idx: u16, ptr: u64) {
        let pos = NODE_HEADER_SIZE + POINTER_SIZE * idx as usize;
        self.data[pos..pos + POINTER_SIZE].copy_from_slice(&ptr.to_le_bytes());
    }

    fn offset(&self, idx: u16) -> u16 {
        if idx == 0 {
            return 0;
        }
        let pos = NODE_HEADER_SIZE + self.pointer_area() + OFFSET_SIZE * (idx as usize - 1);
        read_u16(&self.data, pos)
    }

    fn set_offset(&mut self, idx: u16, offset: u16) {
        let pos = NODE_HEADER_SIZE + self.pointer_area() + OFFSET_SIZE * (idx as usize - 1);
        self.data[pos..pos + 2].copy_from_slice(&offset.to_le_bytes());
    }

    /// Byte position of entry `idx` (or the end of the payload for `nkeys`).
    fn kv_pos(&self, idx: u16) -> usize {
        self.payload_start() + self.offset(idx) as usize
    }

    pub fn key(&self, idx: u16) -> &[u8] {
        debug_assert!(idx < self.nkeys);
        let pos = self.kv_pos(idx);
        let klen = read_u16(&self.data, pos) as usize;
        &self.data[pos + KV_HEADER_SIZE..pos + KV_HEADER_SIZE + klen]
    }

    pub fn value(&self, idx: u16) -> &[u8] {
        debug_assert!(idx < self.nkeys);
        let pos = self.kv_pos(idx);
        let klen = read_u16(&self.data, pos) as usize;
        let vlen = read_u16(&self.data, pos + 2) as usize;
        let start = pos + KV_HEADER_SIZE + klen;
        &self.data[start..start + vlen]
    }

    /// Encoded size of the node in bytes.
    pub fn nbytes(&self) -> usize {
        self.kv_pos(self.nkeys)
    }

    /// Index of the last key `<= key`, or 0 when every key is greater.
    ///
    /// The first key of a node is a lower bound for its subtree, so during
    /// descent 0 is the only valid answer for keys below it.
    pub fn lookup_le(&self, key: &[u8]) -> u16 {
        let mut lo = 0u16;
        let mut hi = self.nkeys;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key(mid).cmp(key) {
                Ordering::Less | Ordering::Equal => lo = mid + 1,
                Ordering::Greater => hi = mid,
            }
        }
        lo.saturating_sub(1)
    }

    /// Copies `n` entries of `old` starting at `src` into slots `dst..dst + n`.
    pub fn append_range(&mut self, old: &Node, dst: u16, src: u16, n: u16) -> Result<()> {
        ensure!(
            src as usize + n as usize <= old.nkeys as usize,
            "source range {}+{} out of bounds for {} keys",
            src,
            n,
            old.nkeys
        );
        ensure!(
            dst as usize + n as usize <= self.nkeys as usize,
            "destination range {}+{} out of bounds for {} keys",
            dst,
            n,
            self.nkeys
        );
        if n == 0 {
            return Ok(());
        }

        if self.kind == NodeKind::Internal {
            for i in 0..n {
                self.set_ptr(dst + i, old.ptr(src + i));
            }
        }

        let dst_begin = self.offset(dst);
        let src_begin = old.offset(src);
        for i in 1..=n {
            let offset = dst_begin + (old.offset(src + i) - src_begin);
            self.set_offset(dst + i, offset);
        }

        let begin = old.kv_pos(src);
        let end = old.kv_pos(src + n);
        let to = self.kv_pos(dst);
        ensure!(
            to + (end - begin) <= self.data.len(),
            "working node overflow while copying {} bytes",
            end - begin
        );
        self.data[to..to + (end - begin)].copy_from_slice(&old.data[begin..end]);
        Ok(())
    }

    /// Writes one entry into slot `idx`; slots must be filled in order.
    pub fn append_kv(&mut self, idx: u16, ptr: u64, key: &[u8], value: &[u8]) -> Result<()> {
        ensure!(
            idx < self.nkeys,
            "slot {} out of bounds for {} keys",
            idx,
            self.nkeys
        );
        if self.kind == NodeKind::Internal {
            self.set_ptr(idx, ptr);
        }

        let pos = self.kv_pos(idx);
        let entry_len = KV_HEADER_SIZE + key.len() + value.len();
        ensure!(
            pos + entry_len <= self.data.len(),
            "working node overflow while appending {} bytes",
            entry_len
        );

        self.data[pos..pos + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
        self.data[pos + 2..pos + 4].copy_from_slice(&(value.len() as u16).to_le_bytes());
        self.data[pos + KV_HEADER_SIZE..pos + KV_HEADER_SIZE + key.len()].copy_from_slice(key);
        self.data[pos + KV_HEADER_SIZE + key.len()..pos + entry_len].copy_from_slice(value);

        let next = self.offset(idx) as usize + entry_len;
        self.set_offset(idx + 1, next as u16);
        Ok(())
    }

    /// Size in bytes of a node holding entries `from..to` of this node.
    pub fn range_bytes(&self, from: u16, to: u16) -> usize {
        let n = (to - from) as usize;
        let pointers = match self.kind {
            NodeKind::Internal => POINTER_SIZE * n,
            NodeKind::Leaf => 0,
        };
        let payload = (self.offset(to) - self.offset(from)) as usize;
        NODE_HEADER_SIZE + pointers + OFFSET_SIZE * n + payload
    }

    pub fn fits_page(&self) -> bool {
        self.nbytes() <= PAGE_SIZE
    }

    /// Truncates the working buffer to one page.
    pub fn into_page(mut self) -> Result<Vec<u8>> {
        ensure!(
            self.fits_page(),
            "node of {} bytes does not fit a {} byte page",
            self.nbytes(),
            PAGE_SIZE
        );
        self.data.resize(PAGE_SIZE, 0);
        Ok(self.data)
    }
}

fn read_u16(data: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([data[pos], data[pos + 1]])
}
