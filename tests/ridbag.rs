//! RidBag behavior across both representations: sizes, save-time
//! transitions, persistence round-trips, rollback restoration, and
//! free-space reuse of the backing collection files.

use madrone::{RecordId, RecordStore, StorageConfig};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

const CLUSTER: i32 = 1;

fn rid(position: i64) -> RecordId {
    RecordId::new(CLUSTER, position)
}

fn sorted(mut rids: Vec<RecordId>) -> Vec<RecordId> {
    rids.sort();
    rids
}

fn tight_thresholds() -> StorageConfig {
    StorageConfig {
        top_threshold: 5,
        bottom_threshold: 4,
        ..StorageConfig::default()
    }
}

#[test]
fn size_matches_insert_count_in_both_representations() {
    let dir = tempdir().expect("temp dir");
    let store = RecordStore::open(dir.path(), tight_thresholds()).expect("open store");
    let mut session = store.session();

    for n in [0usize, 1, 4, 6, 40] {
        let mut bag = session.new_bag();
        for position in 0..n {
            bag.add(rid(position as i64));
        }
        assert_eq!(bag.size(), n as i64, "size before save, n = {n}");
        session.save_bag(&mut bag, CLUSTER).expect("save bag");
        assert_eq!(bag.size(), n as i64, "size after save, n = {n}");
        assert_eq!(bag.is_embedded(), n <= 5, "representation for n = {n}");
        session.delete_bag(&mut bag).expect("drop bag");
    }
}

#[test]
fn threshold_hysteresis_promotes_and_demotes() {
    let dir = tempdir().expect("temp dir");
    let store = RecordStore::open(dir.path(), tight_thresholds()).expect("open store");
    let mut session = store.session();

    let mut bag = session.new_bag();
    for position in 0..6 {
        bag.add(rid(position));
    }
    session.save_bag(&mut bag, CLUSTER).expect("save six entries");
    assert!(!bag.is_embedded(), "6 > top threshold 5 forces the tree form");

    for position in 0..3 {
        assert!(bag.remove(rid(position)), "remove entry {position}");
    }
    assert_eq!(bag.size(), 3);
    session.save_bag(&mut bag, CLUSTER).expect("save three entries");
    assert!(bag.is_embedded(), "3 < bottom threshold 4 forces embedded");
    assert_eq!(
        sorted(bag.to_vec().expect("contents")),
        vec![rid(3), rid(4), rid(5)]
    );
}

#[test]
fn boundary_sizes_do_not_transition() {
    let dir = tempdir().expect("temp dir");
    let store = RecordStore::open(dir.path(), tight_thresholds()).expect("open store");
    let mut session = store.session();

    // Exactly top_threshold entries stay embedded.
    let mut bag = session.new_bag();
    for position in 0..5 {
        bag.add(rid(position));
    }
    session.save_bag(&mut bag, CLUSTER).expect("save at top");
    assert!(bag.is_embedded());

    // Exactly bottom_threshold entries stay tree-backed.
    bag.add(rid(5));
    session.save_bag(&mut bag, CLUSTER).expect("promote");
    assert!(!bag.is_embedded());
    assert!(bag.remove(rid(0)));
    assert!(bag.remove(rid(1)));
    session.save_bag(&mut bag, CLUSTER).expect("save at bottom");
    assert!(!bag.is_embedded(), "4 is not below bottom threshold 4");
}

#[test]
fn disabled_top_threshold_never_promotes() {
    let dir = tempdir().expect("temp dir");
    let store = RecordStore::open(dir.path(), StorageConfig::embedded_only()).expect("open store");
    let mut session = store.session();

    let mut bag = session.new_bag();
    for position in 0..1000 {
        bag.add(rid(position));
    }
    session.save_bag(&mut bag, CLUSTER).expect("save large bag");
    assert!(bag.is_embedded(), "threshold -1 disables promotion");
    assert_eq!(bag.size(), 1000);
}

#[test]
fn embedded_round_trip_through_a_record() {
    let dir = tempdir().expect("temp dir");
    let store = RecordStore::open(dir.path(), StorageConfig::default()).expect("open store");

    let expected: Vec<RecordId> = (0..10).map(rid).collect();
    let record_id = {
        let mut session = store.session();
        let mut bag = session.new_bag();
        for entry in &expected {
            bag.add(*entry);
        }
        let bytes = session.save_bag(&mut bag, CLUSTER).expect("save bag");
        session.create_record(CLUSTER, &bytes).expect("save record")
    };

    let mut fresh = store.session();
    let (bytes, _) = fresh.load_record(record_id).expect("load record");
    let mut reloaded = fresh.load_bag(&bytes).expect("load bag");
    assert!(reloaded.is_embedded());
    assert_eq!(sorted(reloaded.to_vec().expect("contents")), sorted(expected));
}

#[test]
fn tree_round_trip_preserves_the_multiset() {
    let dir = tempdir().expect("temp dir");
    let store = RecordStore::open(dir.path(), tight_thresholds()).expect("open store");

    // Duplicates included: the bag is a multiset, not a set. Insertion
    // order is shuffled; the round-trip contract is order-independent.
    let mut expected: Vec<RecordId> = (0..30).map(rid).collect();
    expected.push(rid(7));
    expected.push(rid(7));
    expected.shuffle(&mut ChaCha8Rng::seed_from_u64(7));

    let record_id = {
        let mut session = store.session();
        let mut bag = session.new_bag();
        for entry in &expected {
            bag.add(*entry);
        }
        let bytes = session.save_bag(&mut bag, CLUSTER).expect("save bag");
        assert!(!bag.is_embedded(), "32 entries force the tree form");
        session.create_record(CLUSTER, &bytes).expect("save record")
    };

    let mut fresh = store.session();
    let (bytes, _) = fresh.load_record(record_id).expect("load record");
    let mut reloaded = fresh.load_bag(&bytes).expect("load bag");
    assert!(!reloaded.is_embedded());
    assert_eq!(reloaded.size(), expected.len() as i64);
    assert_eq!(sorted(reloaded.to_vec().expect("contents")), sorted(expected));
}

#[test]
fn iteration_is_repeatable_within_a_session() {
    let dir = tempdir().expect("temp dir");
    let store = RecordStore::open(dir.path(), tight_thresholds()).expect("open store");
    let mut session = store.session();

    let mut bag = session.new_bag();
    for position in 0..20 {
        bag.add(rid(position));
    }
    session.save_bag(&mut bag, CLUSTER).expect("save bag");

    let first = bag.to_vec().expect("first pass");
    let second = bag.to_vec().expect("second pass");
    assert_eq!(first, second, "each iterate call restarts from the top");
}

#[test]
fn add_remove_cancellation_within_one_window() {
    let dir = tempdir().expect("temp dir");
    let store = RecordStore::open(dir.path(), StorageConfig::default()).expect("open store");
    let mut session = store.session();

    let mut bag = session.new_bag();
    bag.add(rid(1));
    bag.add(rid(2));
    assert!(bag.remove(rid(2)), "pending add is cancellable");
    assert_eq!(bag.size(), 1);
    assert_eq!(bag.to_vec().expect("contents"), vec![rid(1)]);

    // Remove of an entry the bag never held is rejected outright while the
    // base contents are known.
    assert!(!bag.remove(rid(9)));
    assert_eq!(bag.size(), 1);
}

#[test]
fn remove_takes_one_occurrence_of_a_duplicate() {
    let dir = tempdir().expect("temp dir");
    let store = RecordStore::open(dir.path(), tight_thresholds()).expect("open store");
    let mut session = store.session();

    let mut bag = session.new_bag();
    for _ in 0..5 {
        bag.add(rid(7));
    }
    bag.add(rid(8));
    session.save_bag(&mut bag, CLUSTER).expect("save bag");
    assert!(!bag.is_embedded());

    assert!(bag.remove(rid(7)));
    assert_eq!(bag.size(), 5);
    session.save_bag(&mut bag, CLUSTER).expect("save after remove");
    assert_eq!(
        sorted(bag.to_vec().expect("contents")),
        vec![rid(7), rid(7), rid(7), rid(7), rid(8)]
    );
}

#[test]
fn rollback_restores_contents_of_an_embedded_bag() {
    let dir = tempdir().expect("temp dir");
    let store = RecordStore::open(dir.path(), StorageConfig::default()).expect("open store");
    let mut session = store.session();

    let mut bag = session.new_bag();
    for position in 0..3 {
        bag.add(rid(position));
    }
    session.save_bag(&mut bag, CLUSTER).expect("save baseline");

    session.begin();
    bag.add(rid(10));
    bag.add(rid(11));
    assert!(bag.remove(rid(0)));
    assert_eq!(bag.size(), 4);
    session.rollback().expect("rollback");

    assert!(bag.is_embedded());
    assert_eq!(bag.size(), 3);
    assert_eq!(
        sorted(bag.to_vec().expect("contents")),
        vec![rid(0), rid(1), rid(2)]
    );
}

#[test]
fn rollback_undoes_an_in_transaction_promotion() {
    let dir = tempdir().expect("temp dir");
    let store = RecordStore::open(dir.path(), tight_thresholds()).expect("open store");
    let mut session = store.session();

    let mut bag = session.new_bag();
    for position in 0..3 {
        bag.add(rid(position));
    }
    session.save_bag(&mut bag, CLUSTER).expect("save baseline");
    let baseline_pages = store.collection_file_pages(CLUSTER).expect("pages");

    session.begin();
    for position in 3..10 {
        bag.add(rid(position));
    }
    let bytes = session.save_bag(&mut bag, CLUSTER).expect("save inside tx");
    assert!(!bag.is_embedded(), "promotion decided at save time");
    assert_eq!(bag.size(), 10, "reads merge the deferred flush");
    session.rollback().expect("rollback");

    assert!(bag.is_embedded(), "representation restored");
    assert_eq!(
        sorted(bag.to_vec().expect("contents")),
        vec![rid(0), rid(1), rid(2)]
    );
    drop(bytes);

    // The eagerly created tree went back to the free list: recreating a
    // bag of the same shape must not grow the file past the rollback point.
    let after_rollback = store.collection_file_pages(CLUSTER).expect("pages");
    assert!(after_rollback >= baseline_pages);
    let mut redo = session.new_bag();
    for position in 0..10 {
        redo.add(rid(position));
    }
    session.save_bag(&mut redo, CLUSTER).expect("redo save");
    assert_eq!(
        store.collection_file_pages(CLUSTER).expect("pages"),
        after_rollback,
        "redo reuses the reclaimed pages"
    );
}

#[test]
fn commit_makes_an_in_transaction_promotion_durable() {
    let dir = tempdir().expect("temp dir");
    let store = RecordStore::open(dir.path(), tight_thresholds()).expect("open store");

    let expected: Vec<RecordId> = (0..12).map(rid).collect();
    let record_id = {
        let mut session = store.session();
        session.begin();
        let mut bag = session.new_bag();
        for entry in &expected {
            bag.add(*entry);
        }
        let bytes = session.save_bag(&mut bag, CLUSTER).expect("save inside tx");
        assert!(!bag.is_embedded());
        let record_id = session.create_record(CLUSTER, &bytes).expect("save record");
        session.commit().expect("commit");
        assert_eq!(bag.size(), 12, "bag folds the flushed delta after commit");
        record_id
    };

    let mut fresh = store.session();
    let (bytes, _) = fresh.load_record(record_id).expect("load record");
    let mut reloaded = fresh.load_bag(&bytes).expect("load bag");
    assert_eq!(reloaded.size(), 12);
    assert_eq!(sorted(reloaded.to_vec().expect("contents")), expected);
}

#[test]
fn tree_demotion_merges_pending_changes() {
    let dir = tempdir().expect("temp dir");
    let store = RecordStore::open(dir.path(), tight_thresholds()).expect("open store");
    let mut session = store.session();

    let mut bag = session.new_bag();
    for position in 0..6 {
        bag.add(rid(position));
    }
    session.save_bag(&mut bag, CLUSTER).expect("promote");
    assert!(!bag.is_embedded());

    assert!(bag.remove(rid(0)));
    assert!(bag.remove(rid(1)));
    assert!(bag.remove(rid(2)));
    bag.add(rid(99));
    assert!(bag.remove(rid(3)));
    assert_eq!(bag.size(), 3);
    session.save_bag(&mut bag, CLUSTER).expect("demote");
    assert!(bag.is_embedded());
    assert_eq!(
        sorted(bag.to_vec().expect("contents")),
        vec![rid(4), rid(5), rid(99)]
    );
}

#[test]
fn collection_churn_reuses_freed_pages() {
    let dir = tempdir().expect("temp dir");
    let store =
        RecordStore::open(dir.path(), StorageConfig::churn_tolerant()).expect("open store");
    let mut session = store.session();

    let mut lengths = Vec::new();
    for _ in 0..100 {
        let mut bag = session.new_bag();
        for position in 0..60 {
            bag.add(rid(position));
        }
        let bytes = session.save_bag(&mut bag, CLUSTER).expect("save bag");
        assert!(!bag.is_embedded(), "60 entries exceed the default threshold");
        let record_id = session.create_record(CLUSTER, &bytes).expect("save owner");

        session.delete_bag(&mut bag).expect("delete bag");
        session.delete_record(record_id).expect("delete owner");
        lengths.push(store.collection_file_pages(CLUSTER).expect("pages"));
    }

    let settled = lengths[1];
    assert!(
        lengths[2..].iter().all(|&len| len == settled),
        "file length must stay stable after the first reuse cycle: {lengths:?}"
    );
}
