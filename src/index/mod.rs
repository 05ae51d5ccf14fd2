pub mod btree_index;
pub mod btree_iterator;
pub mod bulk;
pub mod comparator;
pub mod page;
#[cfg(test)]
pub(crate) mod test_util;

pub use btree_index::{BPlusTreeIndex, IndexOptions, LogMode, TreeStats};
pub use btree_iterator::TreeIndexIterator;
pub use bulk::BulkInsertContext;
pub use comparator::{
    BytesComparator, BytesDescComparator, ComparatorRef, ComparatorRegistry, FieldComparator,
    I64Comparator, U64Comparator,
};
