//! On-page formats of B+Tree indexes.
//!
//! ```text
//! common   | lsn(8) | type(1) |
//! meta     | root(8) | leaf_cap(2) | internal_cap(2) | unique(1) | cmp_len(2) | cmp |
//! leaf     | count(2) | prev(8) | next(8) | { klen(2) vlen(2) key value }* |
//! internal | count(2) | leftmost(8) | { klen(2) vlen(2) key value child(8) }* |
//! ```
//!
//! Integers are little endian, page ids use their 8-byte encoding and the
//! rest of the page is zero. Encodings are canonical: equal contents give
//! equal bytes apart from the LSN. Capacities of 0 mean "bounded by bytes
//! only". Separators of unique indexes carry an empty value.

use bytes::{Buf, BufMut};

use crate::buffer::{PageId, PAGE_LSN_LEN};
use crate::error::{QuillStoreError, QuillStoreResult};

pub const PAGE_TYPE_FREE: u8 = 0;
pub const PAGE_TYPE_META: u8 = 1;
pub const PAGE_TYPE_LEAF: u8 = 2;
pub const PAGE_TYPE_INTERNAL: u8 = 3;
/// Emptied by a merge and never referenced again.
pub const PAGE_TYPE_RETIRED: u8 = 4;

const TYPE_OFFSET: usize = PAGE_LSN_LEN;
pub const LEAF_HEADER_LEN: usize = PAGE_LSN_LEN + 1 + 2 + 8 + 8;
pub const INTERNAL_HEADER_LEN: usize = PAGE_LSN_LEN + 1 + 2 + 8;
const LEAF_ENTRY_OVERHEAD: usize = 4;
const INTERNAL_ENTRY_OVERHEAD: usize = 4 + 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaPage {
    pub root: PageId,
    pub leaf_capacity: Option<u16>,
    pub internal_capacity: Option<u16>,
    pub unique: bool,
    pub comparator: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeafPage {
    pub prev: Option<PageId>,
    pub next: Option<PageId>,
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
}

/// `(separator key, separator value, child)`; every key in `child` is at or
/// above the separator.
pub type InternalEntry = (Vec<u8>, Vec<u8>, PageId);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalPage {
    pub leftmost: PageId,
    pub entries: Vec<InternalEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BPlusTreePage {
    Leaf(LeafPage),
    Internal(InternalPage),
}

pub fn leaf_entry_len(key: &[u8], value: &[u8]) -> usize {
    LEAF_ENTRY_OVERHEAD + key.len() + value.len()
}

pub fn internal_entry_len(key: &[u8], value: &[u8]) -> usize {
    INTERNAL_ENTRY_OVERHEAD + key.len() + value.len()
}

/// Largest leaf entry an index accepts. A quarter of a leaf guarantees that
/// both halves of a split can take one more entry and that a separator always
/// fits an internal page.
pub fn max_entry_len(page_size: usize) -> usize {
    (page_size - LEAF_HEADER_LEN) / 4 - (INTERNAL_ENTRY_OVERHEAD - LEAF_ENTRY_OVERHEAD)
}

pub fn page_type(bytes: &[u8]) -> u8 {
    bytes.get(TYPE_OFFSET).copied().unwrap_or(PAGE_TYPE_FREE)
}

impl LeafPage {
    pub fn encoded_len(&self) -> usize {
        LEAF_HEADER_LEN
            + self
                .entries
                .iter()
                .map(|(key, value)| leaf_entry_len(key, value))
                .sum::<usize>()
    }

    pub fn fits(&self, page_size: usize, capacity: Option<u16>) -> bool {
        capacity.map_or(true, |cap| self.entries.len() <= cap as usize)
            && self.encoded_len() <= page_size
    }
}

impl InternalPage {
    pub fn new(leftmost: PageId) -> Self {
        Self {
            leftmost,
            entries: Vec::new(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        INTERNAL_HEADER_LEN
            + self
                .entries
                .iter()
                .map(|(key, value, _)| internal_entry_len(key, value))
                .sum::<usize>()
    }

    pub fn fits(&self, page_size: usize, capacity: Option<u16>) -> bool {
        capacity.map_or(true, |cap| self.entries.len() <= cap as usize)
            && self.encoded_len() <= page_size
    }

    /// Children in key order, starting with the leftmost one.
    pub fn children(&self) -> impl Iterator<Item = PageId> + '_ {
        std::iter::once(self.leftmost).chain(self.entries.iter().map(|(_, _, child)| *child))
    }

    pub fn child_at(&self, index: usize) -> Option<PageId> {
        if index == 0 {
            Some(self.leftmost)
        } else {
            self.entries.get(index - 1).map(|(_, _, child)| *child)
        }
    }

    pub fn position_of(&self, child: PageId) -> Option<usize> {
        self.children().position(|id| id == child)
    }
}

impl BPlusTreePage {
    pub fn is_leaf(&self) -> bool {
        matches!(self, BPlusTreePage::Leaf(_))
    }

    pub fn len(&self) -> usize {
        match self {
            BPlusTreePage::Leaf(leaf) => leaf.entries.len(),
            BPlusTreePage::Internal(internal) => internal.entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            BPlusTreePage::Leaf(leaf) => leaf.encoded_len(),
            BPlusTreePage::Internal(internal) => internal.encoded_len(),
        }
    }
}

fn check_size(page_size: usize, needed: usize, what: &str) -> QuillStoreResult<()> {
    if page_size < needed {
        return Err(QuillStoreError::IndexOperation(format!(
            "{} needs {} bytes but the page has {}",
            what,
            needed,
            page_size
        )));
    }
    Ok(())
}

fn truncated(what: &str) -> QuillStoreError {
    QuillStoreError::IndexOperation(format!("truncated {}", what))
}

fn get_page_id(buf: &mut &[u8]) -> QuillStoreResult<Option<PageId>> {
    if buf.remaining() < PageId::ENCODED_LEN {
        return Err(truncated("page id"));
    }
    let id = PageId::read_from(buf);
    buf.advance(PageId::ENCODED_LEN);
    Ok(id)
}

fn get_u16(buf: &mut &[u8], what: &str) -> QuillStoreResult<u16> {
    if buf.remaining() < 2 {
        return Err(truncated(what));
    }
    Ok(buf.get_u16_le())
}

fn get_bytes(buf: &mut &[u8], len: usize, what: &str) -> QuillStoreResult<Vec<u8>> {
    if buf.remaining() < len {
        return Err(truncated(what));
    }
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Ok(bytes)
}

fn finish_page(mut body: Vec<u8>, page_size: usize) -> Vec<u8> {
    body.resize(page_size, 0);
    body
}

fn header(page_type: u8) -> Vec<u8> {
    let mut bytes = vec![0; PAGE_LSN_LEN];
    bytes.put_u8(page_type);
    bytes
}

pub struct MetaPageCodec;

impl MetaPageCodec {
    pub fn encode(page: &MetaPage, page_size: usize) -> QuillStoreResult<Vec<u8>> {
        let mut bytes = header(PAGE_TYPE_META);
        bytes.put_slice(&page.root.encode());
        bytes.put_u16_le(page.leaf_capacity.unwrap_or(0));
        bytes.put_u16_le(page.internal_capacity.unwrap_or(0));
        bytes.put_u8(page.unique as u8);
        bytes.put_u16_le(page.comparator.len() as u16);
        bytes.put_slice(page.comparator.as_bytes());
        check_size(page_size, bytes.len(), "meta page")?;
        Ok(finish_page(bytes, page_size))
    }

    pub fn decode(bytes: &[u8]) -> QuillStoreResult<MetaPage> {
        if page_type(bytes) != PAGE_TYPE_META {
            return Err(QuillStoreError::IndexAccess(format!(
                "page type {} is not an index meta page",
                page_type(bytes)
            )));
        }
        let mut buf = &bytes[TYPE_OFFSET + 1..];
        let root = get_page_id(&mut buf)?
            .ok_or_else(|| QuillStoreError::IndexAccess("meta page has no root".to_string()))?;
        let leaf_capacity = get_u16(&mut buf, "meta page")?;
        let internal_capacity = get_u16(&mut buf, "meta page")?;
        if !buf.has_remaining() {
            return Err(truncated("meta page"));
        }
        let unique = buf.get_u8() != 0;
        let name_len = get_u16(&mut buf, "meta page")? as usize;
        let name = get_bytes(&mut buf, name_len, "comparator name")?;
        let comparator = String::from_utf8(name).map_err(|_| {
            QuillStoreError::IndexAccess("comparator name is not UTF-8".to_string())
        })?;
        Ok(MetaPage {
            root,
            leaf_capacity: (leaf_capacity > 0).then_some(leaf_capacity),
            internal_capacity: (internal_capacity > 0).then_some(internal_capacity),
            unique,
            comparator,
        })
    }
}

pub struct BPlusTreePageCodec;

impl BPlusTreePageCodec {
    pub fn encode(page: &BPlusTreePage, page_size: usize) -> QuillStoreResult<Vec<u8>> {
        match page {
            BPlusTreePage::Leaf(leaf) => Self::encode_leaf(leaf, page_size),
            BPlusTreePage::Internal(internal) => Self::encode_internal(internal, page_size),
        }
    }

    pub fn encode_leaf(leaf: &LeafPage, page_size: usize) -> QuillStoreResult<Vec<u8>> {
        check_size(page_size, leaf.encoded_len(), "leaf page")?;
        let mut bytes = header(PAGE_TYPE_LEAF);
        bytes.put_u16_le(leaf.entries.len() as u16);
        bytes.put_slice(&PageId::encode_opt(leaf.prev));
        bytes.put_slice(&PageId::encode_opt(leaf.next));
        for (key, value) in &leaf.entries {
            bytes.put_u16_le(key.len() as u16);
            bytes.put_u16_le(value.len() as u16);
            bytes.put_slice(key);
            bytes.put_slice(value);
        }
        Ok(finish_page(bytes, page_size))
    }

    pub fn encode_internal(internal: &InternalPage, page_size: usize) -> QuillStoreResult<Vec<u8>> {
        check_size(page_size, internal.encoded_len(), "internal page")?;
        let mut bytes = header(PAGE_TYPE_INTERNAL);
        bytes.put_u16_le(internal.entries.len() as u16);
        bytes.put_slice(&internal.leftmost.encode());
        for (key, value, child) in &internal.entries {
            bytes.put_u16_le(key.len() as u16);
            bytes.put_u16_le(value.len() as u16);
            bytes.put_slice(key);
            bytes.put_slice(value);
            bytes.put_slice(&child.encode());
        }
        Ok(finish_page(bytes, page_size))
    }

    pub fn decode(bytes: &[u8]) -> QuillStoreResult<BPlusTreePage> {
        match page_type(bytes) {
            PAGE_TYPE_LEAF => Self::decode_leaf(bytes).map(BPlusTreePage::Leaf),
            PAGE_TYPE_INTERNAL => Self::decode_internal(bytes).map(BPlusTreePage::Internal),
            other => Err(QuillStoreError::IndexOperation(format!(
                "page type {} is not a tree node",
                other
            ))),
        }
    }

    pub fn decode_leaf(bytes: &[u8]) -> QuillStoreResult<LeafPage> {
        if page_type(bytes) != PAGE_TYPE_LEAF {
            return Err(QuillStoreError::IndexOperation(format!(
                "page type {} is not a leaf",
                page_type(bytes)
            )));
        }
        let mut buf = &bytes[TYPE_OFFSET + 1..];
        let count = get_u16(&mut buf, "leaf header")? as usize;
        let prev = get_page_id(&mut buf)?;
        let next = get_page_id(&mut buf)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key_len = get_u16(&mut buf, "leaf entry")? as usize;
            let value_len = get_u16(&mut buf, "leaf entry")? as usize;
            let key = get_bytes(&mut buf, key_len, "leaf key")?;
            let value = get_bytes(&mut buf, value_len, "leaf value")?;
            entries.push((key, value));
        }
        Ok(LeafPage {
            prev,
            next,
            entries,
        })
    }

    pub fn decode_internal(bytes: &[u8]) -> QuillStoreResult<InternalPage> {
        if page_type(bytes) != PAGE_TYPE_INTERNAL {
            return Err(QuillStoreError::IndexOperation(format!(
                "page type {} is not an internal node",
                page_type(bytes)
            )));
        }
        let mut buf = &bytes[TYPE_OFFSET + 1..];
        let count = get_u16(&mut buf, "internal header")? as usize;
        let leftmost = get_page_id(&mut buf)?.ok_or_else(|| {
            QuillStoreError::IndexOperation("internal page without leftmost child".to_string())
        })?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key_len = get_u16(&mut buf, "separator")? as usize;
            let value_len = get_u16(&mut buf, "separator")? as usize;
            let key = get_bytes(&mut buf, key_len, "separator key")?;
            let value = get_bytes(&mut buf, value_len, "separator value")?;
            let child = get_page_id(&mut buf)?.ok_or_else(|| {
                QuillStoreError::IndexOperation("separator without child".to_string())
            })?;
            entries.push((key, value, child));
        }
        Ok(InternalPage { leftmost, entries })
    }

    /// Image of a page taken out of the tree.
    pub fn retired(page_size: usize) -> Vec<u8> {
        finish_page(header(PAGE_TYPE_RETIRED), page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 256;

    #[test]
    fn leaf_encoding_is_canonical() {
        let leaf = LeafPage {
            prev: None,
            next: Some(PageId::new(3, 9)),
            entries: vec![(b"a".to_vec(), b"1".to_vec()), (b"bb".to_vec(), vec![])],
        };
        let bytes = BPlusTreePageCodec::encode(&BPlusTreePage::Leaf(leaf.clone()), PAGE).unwrap();
        assert_eq!(bytes.len(), PAGE);
        assert_eq!(page_type(&bytes), PAGE_TYPE_LEAF);
        assert_eq!(BPlusTreePageCodec::decode_leaf(&bytes).unwrap(), leaf);
        assert!(bytes[leaf.encoded_len()..].iter().all(|b| *b == 0));

        let mut stamped = bytes.clone();
        stamped[..8].copy_from_slice(&77u64.to_le_bytes());
        let again = BPlusTreePageCodec::decode_leaf(&stamped).unwrap();
        assert_eq!(
            BPlusTreePageCodec::encode(&BPlusTreePage::Leaf(again), PAGE).unwrap(),
            bytes
        );
    }

    #[test]
    fn internal_and_meta_decode() {
        let internal = InternalPage {
            leftmost: PageId::new(2, 1),
            entries: vec![(b"m".to_vec(), vec![], PageId::new(2, 5))],
        };
        let bytes =
            BPlusTreePageCodec::encode(&BPlusTreePage::Internal(internal.clone()), PAGE).unwrap();
        assert_eq!(
            BPlusTreePageCodec::decode(&bytes).unwrap(),
            BPlusTreePage::Internal(internal.clone())
        );
        assert_eq!(internal.position_of(PageId::new(2, 5)), Some(1));

        let meta = MetaPage {
            root: PageId::new(2, 2),
            leaf_capacity: Some(3),
            internal_capacity: None,
            unique: true,
            comparator: "bytes".to_string(),
        };
        let bytes = MetaPageCodec::encode(&meta, PAGE).unwrap();
        assert_eq!(MetaPageCodec::decode(&bytes).unwrap(), meta);
    }

    #[test]
    fn wrong_page_types_are_rejected() {
        let zero = vec![0u8; PAGE];
        assert!(matches!(
            MetaPageCodec::decode(&zero),
            Err(QuillStoreError::IndexAccess(_))
        ));
        assert!(matches!(
            BPlusTreePageCodec::decode(&zero),
            Err(QuillStoreError::IndexOperation(_))
        ));
        assert_eq!(page_type(&BPlusTreePageCodec::retired(PAGE)), PAGE_TYPE_RETIRED);
    }

    #[test]
    fn oversized_pages_do_not_encode() {
        let leaf = LeafPage {
            entries: vec![(vec![1; 200], vec![2; 100])],
            ..LeafPage::default()
        };
        assert!(!leaf.fits(PAGE, None));
        assert!(BPlusTreePageCodec::encode(&BPlusTreePage::Leaf(leaf), PAGE).is_err());
    }
}
