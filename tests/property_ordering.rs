use proptest::prelude::*;

use offsync::{
    op::SyncOperation,
    runtime::coordinator::processing_order,
    types::{Identity, OpKind, Partition},
};

const CROPS: Partition = Partition::named("crops");

fn ops_strategy() -> impl Strategy<Value = Vec<(i32, u64)>> {
    prop::collection::vec((-3i32..6, 0u64..50), 0..40)
}

fn build(specs: &[(i32, u64)]) -> Vec<SyncOperation> {
    specs
        .iter()
        .enumerate()
        .map(|(i, (priority, at))| {
            SyncOperation::new(
                OpKind::Update,
                format!("/crops/{i}"),
                CROPS,
                Identity::canonical(i.to_string()),
                None,
                *at,
            )
            .with_priority(*priority)
        })
        .collect()
}

proptest! {
    #[test]
    fn order_is_priority_desc_then_oldest_first(specs in ops_strategy()) {
        let ops = build(&specs);
        let ordered = processing_order(ops.clone());

        prop_assert_eq!(ordered.len(), ops.len());
        for pair in ordered.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            prop_assert!(a.priority >= b.priority);
            if a.priority == b.priority {
                prop_assert!(a.enqueued_at_ms <= b.enqueued_at_ms);
            }
        }

        let mut before: Vec<_> = ops.iter().map(|o| o.id).collect();
        let mut after: Vec<_> = ordered.iter().map(|o| o.id).collect();
        before.sort();
        after.sort();
        prop_assert_eq!(before, after);
    }

    #[test]
    fn full_ties_keep_enqueue_order(n in 1usize..30, priority in 0i32..4) {
        let specs = vec![(priority, 7u64); n];
        let ops = build(&specs);
        let ordered = processing_order(ops.clone());
        let expected: Vec<_> = ops.iter().map(|o| o.id).collect();
        let got: Vec<_> = ordered.iter().map(|o| o.id).collect();
        prop_assert_eq!(expected, got);
    }
}
