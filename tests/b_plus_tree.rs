use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

use vellumdb::buffer::{BufferPoolManager, PageId, INVALID_PAGE_ID};
use vellumdb::storage::codec::BPlusTreePageCodec;
use vellumdb::storage::disk_manager::DiskManager;
use vellumdb::storage::index::comparator::default_comparator;
use vellumdb::storage::index::{BPlusTreeIndex, TreeIndexIterator};
use vellumdb::storage::page::{BPlusTreePage, RecordId};

const KEY_SIZE: usize = 4;

fn key(i: u32) -> Vec<u8> {
    i.to_be_bytes().to_vec()
}

fn rid(i: u32) -> RecordId {
    RecordId::new(i, i)
}

fn setup_tree(
    pool_size: usize,
    leaf_max_size: u32,
    internal_max_size: u32,
) -> (TempDir, Arc<BPlusTreeIndex>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let temp_dir = TempDir::new().unwrap();
    let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
    let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, disk_manager));
    let index = Arc::new(BPlusTreeIndex::new(
        buffer_pool,
        default_comparator,
        KEY_SIZE,
        leaf_max_size,
        internal_max_size,
    ));
    (temp_dir, index)
}

fn decode_page(index: &Arc<BPlusTreeIndex>, page_id: PageId) -> BPlusTreePage {
    let guard = index.buffer_pool.fetch_page_read(page_id).unwrap();
    let (page, _) = BPlusTreePageCodec::decode(guard.data(), index.key_size, index.comparator).unwrap();
    page
}

/// Audits the structural invariants: key ranges per subtree, size bounds on
/// non-root nodes, parent pointers, and equal depth for all leaves. Returns
/// the keys in leaf-chain order.
fn check_tree(index: &Arc<BPlusTreeIndex>) -> Vec<Vec<u8>> {
    let root_page_id = index.root_page_id();
    if root_page_id == INVALID_PAGE_ID {
        return Vec::new();
    }
    let mut leaf_depths = BTreeSet::new();
    let mut first_leaf = INVALID_PAGE_ID;
    audit_node(
        index,
        root_page_id,
        INVALID_PAGE_ID,
        None,
        None,
        0,
        &mut leaf_depths,
        &mut first_leaf,
    );
    assert!(leaf_depths.len() <= 1, "leaves at unequal depths");

    // walk the chain and confirm strictly ascending keys across leaves
    let mut keys = Vec::new();
    let mut next = first_leaf;
    while next != INVALID_PAGE_ID {
        let BPlusTreePage::Leaf(leaf) = decode_page(index, next) else {
            panic!("leaf chain reached a non-leaf page");
        };
        for (k, _) in leaf.array.iter() {
            if let Some(prev) = keys.last() {
                assert!(prev < k, "leaf chain keys are not strictly ascending");
            }
            keys.push(k.clone());
        }
        next = leaf.header.next_page_id;
    }
    keys
}

#[allow(clippy::too_many_arguments)]
fn audit_node(
    index: &Arc<BPlusTreeIndex>,
    page_id: PageId,
    expected_parent: PageId,
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
    depth: usize,
    leaf_depths: &mut BTreeSet<usize>,
    first_leaf: &mut PageId,
) {
    let is_root = expected_parent == INVALID_PAGE_ID;
    match decode_page(index, page_id) {
        BPlusTreePage::Leaf(leaf) => {
            assert_eq!(leaf.header.page_id, page_id);
            assert_eq!(leaf.header.parent_page_id, expected_parent);
            if !is_root {
                assert!(leaf.header.current_size >= leaf.min_size());
            }
            assert!(leaf.header.current_size <= leaf.header.max_size);
            for (k, _) in leaf.array.iter() {
                if let Some(lo) = &lower {
                    assert!(k >= lo, "leaf key below its subtree range");
                }
                if let Some(hi) = &upper {
                    assert!(k < hi, "leaf key at or above its subtree range");
                }
            }
            leaf_depths.insert(depth);
            if *first_leaf == INVALID_PAGE_ID && lower.is_none() {
                *first_leaf = page_id;
            }
        }
        BPlusTreePage::Internal(internal) => {
            assert_eq!(internal.header.page_id, page_id);
            assert_eq!(internal.header.parent_page_id, expected_parent);
            if is_root {
                assert!(internal.header.current_size >= 2, "internal root too small");
            } else {
                assert!(internal.header.current_size >= internal.min_size());
            }
            assert!(internal.header.current_size <= internal.header.max_size);
            let size = internal.array.len();
            for i in 0..size {
                let child_lower = if i == 0 {
                    lower.clone()
                } else {
                    Some(internal.key_at(i).to_vec())
                };
                let child_upper = if i + 1 < size {
                    Some(internal.key_at(i + 1).to_vec())
                } else {
                    upper.clone()
                };
                audit_node(
                    index,
                    internal.value_at(i),
                    page_id,
                    child_lower,
                    child_upper,
                    depth + 1,
                    leaf_depths,
                    first_leaf,
                );
            }
        }
    }
}

#[test]
fn empty_tree_behaviour() {
    let (_tmp, index) = setup_tree(32, 3, 4);
    assert!(index.is_empty());
    assert_eq!(index.get(&key(1)).unwrap(), None);
    index.remove(&key(1)).unwrap();

    let mut iter = TreeIndexIterator::begin(index.clone()).unwrap();
    assert!(iter.is_end());
    assert_eq!(iter.next().unwrap(), None);
}

#[test]
fn sequential_insert_splits_into_two_leaves() {
    let (_tmp, index) = setup_tree(32, 3, 4);
    for i in 1..=5u32 {
        assert!(index.insert(&key(i), rid(i)).unwrap());
    }
    let root_page_id = index.root_page_id();

    // root is internal with a single separator over two chained leaves
    let BPlusTreePage::Internal(root) = decode_page(&index, root_page_id) else {
        panic!("root should be internal after the split");
    };
    assert_eq!(root.header.current_size, 2);

    let BPlusTreePage::Leaf(left) = decode_page(&index, root.value_at(0)) else {
        panic!("expected a leaf");
    };
    let BPlusTreePage::Leaf(right) = decode_page(&index, root.value_at(1)) else {
        panic!("expected a leaf");
    };
    assert_eq!(left.header.next_page_id, right.header.page_id);
    assert_eq!(
        left.array.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
        vec![key(1), key(2)]
    );
    assert_eq!(
        right.array.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
        vec![key(3), key(4), key(5)]
    );
    check_tree(&index);
}

#[test]
fn delete_merges_back_into_a_single_leaf_keeping_root_id() {
    let (_tmp, index) = setup_tree(32, 3, 4);
    for i in 1..=5u32 {
        assert!(index.insert(&key(i), rid(i)).unwrap());
    }
    let root_page_id = index.root_page_id();

    index.remove(&key(4)).unwrap();
    index.remove(&key(5)).unwrap();

    // the two leaves merged and the root page id survived the collapse
    assert_eq!(index.root_page_id(), root_page_id);
    let BPlusTreePage::Leaf(root) = decode_page(&index, root_page_id) else {
        panic!("root should be a leaf again");
    };
    assert_eq!(
        root.array.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
        vec![key(1), key(2), key(3)]
    );
    assert_eq!(root.header.next_page_id, INVALID_PAGE_ID);
    for i in 1..=3u32 {
        assert_eq!(index.get(&key(i)).unwrap(), Some(rid(i)));
    }
    assert_eq!(index.get(&key(4)).unwrap(), None);
}

#[test]
fn duplicate_insert_keeps_first_value() {
    let (_tmp, index) = setup_tree(32, 3, 4);
    assert!(index.insert(&key(7), rid(7)).unwrap());
    assert!(!index.insert(&key(7), rid(999)).unwrap());
    assert_eq!(index.get(&key(7)).unwrap(), Some(rid(7)));
}

#[test]
fn root_page_id_is_stable_across_growth() {
    let (_tmp, index) = setup_tree(64, 3, 3);
    assert!(index.insert(&key(1), rid(1)).unwrap());
    let root_page_id = index.root_page_id();
    for i in 2..=200u32 {
        assert!(index.insert(&key(i), rid(i)).unwrap());
        assert_eq!(index.root_page_id(), root_page_id);
    }
    check_tree(&index);
}

#[test]
fn random_round_trip_with_deletions() {
    let (_tmp, index) = setup_tree(128, 4, 4);
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);

    let mut keys: Vec<u32> = (1..=300).collect();
    keys.shuffle(&mut rng);
    for &i in &keys {
        assert!(index.insert(&key(i), rid(i)).unwrap());
    }
    let listed = check_tree(&index);
    assert_eq!(listed.len(), 300);

    // delete a shuffled third and audit after the dust settles
    let mut to_delete: Vec<u32> = (1..=300).filter(|i| i % 3 == 0).collect();
    to_delete.shuffle(&mut rng);
    for &i in &to_delete {
        index.remove(&key(i)).unwrap();
    }

    let remaining = check_tree(&index);
    let expected: Vec<Vec<u8>> = (1..=300u32).filter(|i| i % 3 != 0).map(key).collect();
    assert_eq!(remaining, expected);
    for i in 1..=300u32 {
        let found = index.get(&key(i)).unwrap();
        if i % 3 == 0 {
            assert_eq!(found, None);
        } else {
            assert_eq!(found, Some(rid(i)));
        }
    }
}

#[test]
fn delete_everything_then_reuse() {
    let (_tmp, index) = setup_tree(64, 3, 3);
    for i in 1..=50u32 {
        assert!(index.insert(&key(i), rid(i)).unwrap());
    }
    for i in 1..=50u32 {
        index.remove(&key(i)).unwrap();
    }
    for i in 1..=50u32 {
        assert_eq!(index.get(&key(i)).unwrap(), None);
    }
    // the tree still works after being emptied
    assert!(index.insert(&key(9), rid(9)).unwrap());
    assert_eq!(index.get(&key(9)).unwrap(), Some(rid(9)));
    check_tree(&index);
}

#[test]
fn iterator_scans_in_order_and_survives_the_end() {
    let (_tmp, index) = setup_tree(64, 3, 4);
    for i in (1..=40u32).rev() {
        assert!(index.insert(&key(i), rid(i)).unwrap());
    }

    let mut iter = TreeIndexIterator::begin(index.clone()).unwrap();
    let mut seen = Vec::new();
    while let Some((k, _)) = iter.next().unwrap() {
        seen.push(k);
    }
    assert_eq!(seen, (1..=40u32).map(key).collect::<Vec<_>>());

    // an exhausted cursor stays usable
    assert!(iter.is_end());
    assert_eq!(iter.next().unwrap(), None);
    assert_eq!(iter.next().unwrap(), None);
}

#[test]
fn iterator_seeks_to_lower_bound() {
    let (_tmp, index) = setup_tree(64, 3, 4);
    for i in (2..=40u32).step_by(2) {
        assert!(index.insert(&key(i), rid(i)).unwrap());
    }

    // positioned at the first key >= 11, which is 12
    let mut iter = TreeIndexIterator::begin_at(index.clone(), &key(11)).unwrap();
    let (first, first_rid) = iter.next().unwrap().unwrap();
    assert_eq!(first, key(12));
    assert_eq!(first_rid, rid(12));

    let mut rest = Vec::new();
    while let Some((k, _)) = iter.next().unwrap() {
        rest.push(k);
    }
    assert_eq!(rest, (14..=40u32).step_by(2).map(key).collect::<Vec<_>>());
}

#[test]
fn no_pins_leak_after_tree_operations() {
    let (_tmp, index) = setup_tree(16, 3, 3);
    for i in 1..=100u32 {
        assert!(index.insert(&key(i), rid(i)).unwrap());
    }
    for i in (1..=100u32).step_by(2) {
        index.remove(&key(i)).unwrap();
    }
    let pool = &index.buffer_pool;
    assert_eq!(
        pool.evictable_count() + pool.free_frame_count(),
        pool.pool_size(),
        "some frame is still pinned after all guards were dropped"
    );
}

#[test]
fn concurrent_disjoint_inserts() {
    const THREADS: u32 = 4;
    const PER_THREAD: u32 = 150;
    let (_tmp, index) = setup_tree(256, 4, 4);

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let index = index.clone();
        handles.push(thread::spawn(move || {
            for i in 0..PER_THREAD {
                let k = t * PER_THREAD + i + 1;
                assert!(index.insert(&key(k), rid(k)).unwrap());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let listed = check_tree(&index);
    assert_eq!(listed.len(), (THREADS * PER_THREAD) as usize);
    for k in 1..=THREADS * PER_THREAD {
        assert_eq!(index.get(&key(k)).unwrap(), Some(rid(k)));
    }
}

#[test]
fn concurrent_readers_during_writes() {
    let (_tmp, index) = setup_tree(128, 4, 4);
    for i in 1..=100u32 {
        assert!(index.insert(&key(i), rid(i)).unwrap());
    }

    let writer = {
        let index = index.clone();
        thread::spawn(move || {
            for i in 101..=300u32 {
                assert!(index.insert(&key(i), rid(i)).unwrap());
            }
        })
    };
    let mut readers = Vec::new();
    for _ in 0..3 {
        let index = index.clone();
        readers.push(thread::spawn(move || {
            for _ in 0..20 {
                for i in 1..=100u32 {
                    assert_eq!(index.get(&key(i)).unwrap(), Some(rid(i)));
                }
            }
        }));
    }

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    check_tree(&index);
}
