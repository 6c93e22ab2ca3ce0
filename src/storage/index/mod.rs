mod b_plus_tree;
mod b_plus_tree_iterator;
pub mod comparator;

pub use b_plus_tree::BPlusTreeIndex;
pub use b_plus_tree_iterator::TreeIndexIterator;
