//! Replicas that have seen the same set of operations must hold the same
//! document, regardless of delivery order or duplication.

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tandem_core::{Document, Operation, ReplicaId, StateVector};

fn replica(n: u128) -> ReplicaId {
    ReplicaId::from_u128(n)
}

fn all_ops(doc: &Document) -> Vec<Operation> {
    doc.operations_since(&StateVector::new())
}

fn deliver(ops: &[Operation], to: &mut Document) {
    for op in ops {
        to.apply(op.clone()).unwrap();
    }
}

fn order(doc: &Document) -> Vec<String> {
    doc.elements().iter().map(|e| e.id.to_string()).collect()
}

#[test]
fn test_concurrent_insert_at_start_smaller_replica_first() {
    let mut a = Document::new(replica(1));
    let mut b = Document::new(replica(2));
    a.insert(0, "ab").unwrap();
    b.insert(0, "c").unwrap();

    let (from_a, from_b) = (all_ops(&a), all_ops(&b));
    deliver(&from_b, &mut a);
    deliver(&from_a, &mut b);

    assert_eq!(a.visible_content(), "abc");
    assert_eq!(b.visible_content(), "abc");
}

#[test]
fn test_concurrent_insert_at_start_larger_replica_last() {
    // Same edits with the replica ids swapped.
    let mut a = Document::new(replica(2));
    let mut b = Document::new(replica(1));
    a.insert(0, "ab").unwrap();
    b.insert(0, "c").unwrap();

    let (from_a, from_b) = (all_ops(&a), all_ops(&b));
    deliver(&from_b, &mut a);
    deliver(&from_a, &mut b);

    assert_eq!(a.visible_content(), "cab");
    assert_eq!(b.visible_content(), "cab");
}

#[test]
fn test_concurrent_delete_and_insert_inside_range() {
    let mut a = Document::new(replica(1));
    let mut b = Document::new(replica(2));
    a.insert(0, "hello").unwrap();
    deliver(&all_ops(&a), &mut b);

    b.delete(2, 2).unwrap();
    a.insert(2, "X").unwrap();

    let missing_on_b = a.operations_since(&b.state_vector());
    let missing_on_a = b.operations_since(&a.state_vector());
    deliver(&missing_on_b, &mut b);
    deliver(&missing_on_a, &mut a);

    assert_eq!(a.visible_content(), "heXo");
    assert_eq!(b.visible_content(), "heXo");
}

#[test]
fn test_three_way_merge_order_does_not_matter() {
    let mut a = Document::new(replica(1));
    let mut b = Document::new(replica(2));
    let mut c = Document::new(replica(3));
    a.insert(0, "base").unwrap();
    deliver(&all_ops(&a), &mut b);
    deliver(&all_ops(&a), &mut c);

    a.insert(2, "AA").unwrap();
    b.insert(2, "BB").unwrap();
    c.delete(1, 2).unwrap();
    c.insert(1, "C").unwrap();

    let ops: Vec<Vec<Operation>> = vec![all_ops(&a), all_ops(&b), all_ops(&c)];

    let mut first = Document::new(replica(10));
    for batch in [&ops[0], &ops[1], &ops[2]] {
        deliver(batch, &mut first);
    }
    let mut second = Document::new(replica(11));
    for batch in [&ops[2], &ops[0], &ops[1]] {
        deliver(batch, &mut second);
    }
    let mut third = Document::new(replica(12));
    for batch in [&ops[1], &ops[2], &ops[0]] {
        deliver(batch.iter().rev().cloned().collect::<Vec<_>>().as_slice(), &mut third);
    }

    assert_eq!(first.visible_content(), second.visible_content());
    assert_eq!(first.visible_content(), third.visible_content());
    assert_eq!(order(&first), order(&second));
    assert_eq!(order(&first), order(&third));
    assert_eq!(third.pending_len(), 0);
}

#[derive(Debug, Clone)]
enum Step {
    Insert { replica: usize, pos: usize, text: String },
    Delete { replica: usize, pos: usize, len: usize },
    Sync { from: usize, to: usize },
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (0..3usize, any::<usize>(), "[a-z]{1,3}")
            .prop_map(|(replica, pos, text)| Step::Insert { replica, pos, text }),
        2 => (0..3usize, any::<usize>(), 1..4usize)
            .prop_map(|(replica, pos, len)| Step::Delete { replica, pos, len }),
        1 => (0..3usize, 0..3usize).prop_map(|(from, to)| Step::Sync { from, to }),
    ]
}

fn run(steps: &[Step]) -> Vec<Document> {
    let mut docs: Vec<Document> = (1..=3).map(|n| Document::new(replica(n))).collect();
    for s in steps {
        match s {
            Step::Insert { replica, pos, text } => {
                let doc = &mut docs[*replica];
                let at = pos % (doc.len() + 1);
                doc.insert(at, text).unwrap();
            }
            Step::Delete { replica, pos, len } => {
                let doc = &mut docs[*replica];
                if doc.is_empty() {
                    continue;
                }
                let at = pos % doc.len();
                let n = (*len).min(doc.len() - at);
                doc.delete(at, n).unwrap();
            }
            Step::Sync { from, to } if from != to => {
                let missing = docs[*from].operations_since(&docs[*to].state_vector());
                deliver(&missing, &mut docs[*to]);
            }
            Step::Sync { .. } => {}
        }
    }
    docs
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn test_shuffled_delivery_converges(
        steps in proptest::collection::vec(step(), 1..40),
        seed: u64,
    ) {
        let docs = run(&steps);
        let mut ops: Vec<Operation> = docs.iter().flat_map(all_ops).collect();

        let mut rng = StdRng::seed_from_u64(seed);
        ops.shuffle(&mut rng);
        let dupes: Vec<Operation> = ops.iter().step_by(3).cloned().collect();
        ops.extend(dupes);
        ops.shuffle(&mut rng);

        let mut fresh = Document::new(replica(99));
        deliver(&ops, &mut fresh);
        prop_assert_eq!(fresh.pending_len(), 0);

        let mut replicas = docs;
        for doc in replicas.iter_mut() {
            deliver(&ops, doc);
        }
        for doc in &replicas {
            prop_assert_eq!(doc.visible_content(), fresh.visible_content());
            prop_assert_eq!(order(doc), order(&fresh));
        }
    }

    #[test]
    fn test_remote_edits_mirror_content(
        steps in proptest::collection::vec(step(), 1..30),
        seed: u64,
    ) {
        let docs = run(&steps);
        let mut ops: Vec<Operation> = docs.iter().flat_map(all_ops).collect();
        ops.shuffle(&mut StdRng::seed_from_u64(seed));

        let mut doc = Document::new(replica(99));
        let mut mirror = String::new();
        for op in ops {
            if let tandem_core::ApplyOutcome::Integrated { edits } = doc.apply(op).unwrap() {
                for edit in edits {
                    edit.apply_to(&mut mirror);
                }
            }
        }
        prop_assert_eq!(mirror, doc.visible_content());
    }

    #[test]
    fn test_tombstones_never_resurrect(
        steps in proptest::collection::vec(step(), 1..30),
    ) {
        let docs = run(&steps);
        let deletes: Vec<Operation> = docs
            .iter()
            .flat_map(all_ops)
            .filter(|op| matches!(op, Operation::Delete { .. }))
            .collect();
        let inserts: Vec<Operation> = docs
            .iter()
            .flat_map(all_ops)
            .filter(|op| matches!(op, Operation::Insert(_)))
            .collect();

        let mut doc = Document::new(replica(99));
        deliver(&deletes, &mut doc);
        deliver(&inserts, &mut doc);
        deliver(&inserts, &mut doc);

        for op in &deletes {
            if let Operation::Delete { target, .. } = op {
                let element = doc.elements().iter().find(|e| e.id == *target);
                prop_assert!(element.map_or(false, |e| e.deleted));
            }
        }
    }
}
