//! Property tests for the VFS-op-to-lock-plan mapping's deadlock-avoidance
//! invariant: any two operations touching the same path set must agree on
//! acquisition order.

use gate_proto::LockMode;
use gate_proxy_core::{plan_for, VfsOp};
use proptest::prelude::*;

fn arb_path() -> impl Strategy<Value = String> {
    prop_oneof!["/a", "/b", "/c", "/dir/x", "/dir/y"].prop_map(str::to_string)
}

proptest! {
    #[test]
    fn rename_lock_order_depends_only_on_the_path_set(
        a in arb_path(), b in arb_path(), c in arb_path(), d in arb_path(),
    ) {
        let forward = plan_for(&VfsOp::Rename {
            src_parent: a.clone(), dst_parent: b.clone(), src: c.clone(), dst: d.clone(),
        });
        let backward = plan_for(&VfsOp::Rename {
            src_parent: b, dst_parent: a, src: d, dst: c,
        });
        prop_assert_eq!(forward, backward);
    }

    #[test]
    fn every_multi_path_plan_is_sorted_and_deduped(
        parent in arb_path(), new_path in arb_path(),
    ) {
        let plan = plan_for(&VfsOp::CreateEntry { parent, new_path });
        let paths: Vec<_> = plan.steps.iter().map(|s| s.path.clone()).collect();
        let mut sorted = paths.clone();
        sorted.sort();
        sorted.dedup();
        prop_assert_eq!(paths, sorted);
    }

    #[test]
    fn multi_path_plans_are_all_write_locks(parent in arb_path(), path in arb_path()) {
        let plan = plan_for(&VfsOp::RemoveEntry { parent, path });
        prop_assert!(plan.steps.iter().all(|s| s.mode == LockMode::Write));
    }
}
