use fluxkv::{NodeState, OrderedIndex};
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

fn key(i: u32) -> Vec<u8> {
    format!("{:05}", i).into_bytes()
}

#[test]
fn test_new_index() {
    let index: OrderedIndex<u64> = OrderedIndex::new();
    assert_eq!(index.len(), 0);
    assert!(index.is_empty());
    assert_eq!(index.max_level(), fluxkv::MAX_LEVEL);
}

#[test]
fn test_insert_and_find() {
    let index = OrderedIndex::new();
    index.insert(b"c", 3u64).unwrap();
    index.insert(b"a", 1u64).unwrap();
    index.insert(b"b", 2u64).unwrap();

    let guard = &crossbeam_epoch::pin();
    assert_eq!(index.len(), 3);
    assert_eq!(index.find(b"a", guard), Some(&1));
    assert_eq!(index.find(b"b", guard), Some(&2));
    assert_eq!(index.find(b"c", guard), Some(&3));
    assert_eq!(index.find(b"d", guard), None);
}

#[test]
fn test_insert_existing_key_replaces_payload() {
    let index = OrderedIndex::new();
    index.insert(b"a", 1u64).unwrap();
    index.insert(b"a", 2u64).unwrap();

    let guard = &crossbeam_epoch::pin();
    assert_eq!(index.len(), 1);
    assert_eq!(index.find(b"a", guard), Some(&2));
}

#[test]
fn test_empty_key_is_rejected() {
    let index = OrderedIndex::new();
    assert!(matches!(
        index.insert(b"", 1u64),
        Err(fluxkv::Error::InvalidArgument(_))
    ));
    assert!(index.is_empty());
}

#[test]
fn test_delete() {
    let index = OrderedIndex::new();
    for i in 0..3 {
        index.insert(&key(i), i as u64).unwrap();
    }

    assert!(index.delete(&key(1)));
    assert!(!index.delete(&key(1)));
    assert!(!index.delete(&key(9)));
    assert_eq!(index.len(), 2);
    assert!(!index.contains_key(&key(1)));
    assert!(index.node_state(&key(1)).is_none());
    assert_eq!(index.node_state(&key(2)), Some(NodeState::Valid));
}

#[test]
fn test_keys_are_ordered_bytewise() {
    let index = OrderedIndex::new();
    for k in [&b"b"[..], b"a", b"ab", b"\xff", b"\x00", b"aa"] {
        index.insert(k, 0u64).unwrap();
    }
    let mut keys = Vec::new();
    index.for_each(|k, _| keys.push(k.to_vec()));
    let expected: Vec<Vec<u8>> = vec![
        b"\x00".to_vec(),
        b"a".to_vec(),
        b"aa".to_vec(),
        b"ab".to_vec(),
        b"b".to_vec(),
        b"\xff".to_vec(),
    ];
    assert_eq!(keys, expected);
}

#[test]
fn test_range_for_each_is_inclusive() {
    let index = OrderedIndex::new();
    for i in 0..10 {
        index.insert(&key(i), i as u64).unwrap();
    }
    let mut seen = Vec::new();
    index.range_for_each(&key(3), &key(6), |_, v| seen.push(*v));
    assert_eq!(seen, vec![3, 4, 5, 6]);
}

#[test]
fn test_concurrent_insert() {
    let index = Arc::new(OrderedIndex::new());
    let handles: Vec<_> = (0..8u32)
        .map(|t| {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                for i in 0..500 {
                    let k = t * 500 + i;
                    index.insert(&key(k), k as u64).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(index.len(), 4000);
    let mut previous: Option<Vec<u8>> = None;
    let mut count = 0;
    index.for_each(|k, v| {
        if let Some(prev) = &previous {
            assert!(prev.as_slice() < k);
        }
        assert_eq!(k, key(*v as u32).as_slice());
        previous = Some(k.to_vec());
        count += 1;
    });
    assert_eq!(count, 4000);
}

#[test]
fn test_concurrent_insert_and_delete() {
    let index = Arc::new(OrderedIndex::new());
    for i in 0..2000 {
        index.insert(&key(i), i as u64).unwrap();
    }

    let handles: Vec<_> = (0..4u32)
        .map(|t| {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                // Each thread deletes its own even keys and inserts fresh keys.
                for i in (t * 500..(t + 1) * 500).filter(|i| i % 2 == 0) {
                    assert!(index.delete(&key(i)));
                    index.insert(&key(10_000 + i), i as u64).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(index.len(), 2000);
    for i in 0..2000 {
        assert_eq!(index.contains_key(&key(i)), i % 2 == 1, "key {}", i);
        assert_eq!(index.contains_key(&key(10_000 + i)), i % 2 == 0, "key {}", 10_000 + i);
    }
}

#[test]
fn test_contended_keys_end_in_a_sequential_state() {
    // Threads race on a small key space. Each thread owns a disjoint subset of
    // the final decision (the last operation it applies to its keys), so the
    // resulting set must equal the union of those decisions.
    let index = Arc::new(OrderedIndex::new());
    let threads = 8u32;
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                let mut rng = rand::rngs::StdRng::seed_from_u64(t as u64);
                let mut kept = BTreeSet::new();
                for _ in 0..2000 {
                    let k = rng.gen_range(0..64u32) * threads + t;
                    if rng.gen_bool(0.5) {
                        index.insert(&key(k), k as u64).unwrap();
                        kept.insert(k);
                    } else {
                        index.delete(&key(k));
                        kept.remove(&k);
                    }
                    // Readers of other threads' keys must never see torn state.
                    let probe = rng.gen_range(0..64u32 * threads);
                    let guard = &crossbeam_epoch::pin();
                    if let Some(v) = index.find(&key(probe), guard) {
                        assert_eq!(*v, probe as u64);
                    }
                }
                kept
            })
        })
        .collect();

    let mut expected = BTreeSet::new();
    for handle in handles {
        expected.extend(handle.join().unwrap());
    }

    let mut actual = BTreeSet::new();
    index.for_each(|_, v| {
        actual.insert(*v as u32);
    });
    assert_eq!(actual, expected);
    assert_eq!(index.len(), expected.len());
}

#[test]
fn test_get_or_insert_with_races_to_one_winner() {
    let index = Arc::new(OrderedIndex::new());
    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                let guard = &crossbeam_epoch::pin();
                *index.get_or_insert_with(b"shared", || t, guard).unwrap()
            })
        })
        .collect();
    let winners: BTreeSet<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(index.len(), 1);
}

#[test]
fn test_small_max_level_still_works() {
    let index = OrderedIndex::with_max_level(1);
    for i in (0..200).rev() {
        index.insert(&key(i), i as u64).unwrap();
    }
    let mut seen = Vec::new();
    index.for_each(|_, v| seen.push(*v));
    assert_eq!(seen, (0..200).map(|i| i as u64).collect::<Vec<_>>());
}
