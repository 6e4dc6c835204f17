//! Pure VFS-operation-to-lock-plan mapping (§4.2). No I/O: given an
//! operation and the paths it touches, returns the ordered list of
//! `(path, mode)` acquisitions a caller must obtain before performing the
//! underlying filesystem call, and release in reverse order afterward.

use gate_proto::{LockMode, PathKey};

/// A VFS-level operation the proxy may receive from the kernel.
#[derive(Debug, Clone)]
pub enum VfsOp {
    /// lookup, getattr, listdir, readlink.
    ReadMetadata { path: PathKey },
    /// open for read only.
    OpenRead { path: PathKey },
    /// open for write, or open with O_CREAT.
    OpenWrite { path: PathKey },
    /// truncate, chmod, chown, utimens.
    WriteMetadata { path: PathKey },
    /// mkdir, create, symlink, mknod.
    CreateEntry { parent: PathKey, new_path: PathKey },
    /// unlink, rmdir.
    RemoveEntry { parent: PathKey, path: PathKey },
    /// rename(src -> dst).
    Rename { src_parent: PathKey, dst_parent: PathKey, src: PathKey, dst: PathKey },
}

/// One acquisition step in a lock plan: acquire in list order, release in
/// reverse order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStep {
    pub path: PathKey,
    pub mode: LockMode,
}

/// The full ordered set of locks an operation requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockPlan {
    pub steps: Vec<LockStep>,
}

impl LockPlan {
    fn single(path: PathKey, mode: LockMode) -> Self {
        Self { steps: vec![LockStep { path, mode }] }
    }
}

/// Compute the lock plan for `op`.
///
/// Multi-path operations acquire in a canonical (lexicographic-by-path)
/// order so that two concurrent operations touching an overlapping path set
/// (e.g. a cross-rename `a -> b` racing `b -> a`) always request locks in
/// the same relative order and cannot deadlock against each other.
#[must_use]
pub fn plan_for(op: &VfsOp) -> LockPlan {
    match op {
        VfsOp::ReadMetadata { path } => LockPlan::single(path.clone(), LockMode::Read),
        VfsOp::OpenRead { path } => LockPlan::single(path.clone(), LockMode::Read),
        VfsOp::OpenWrite { path } => LockPlan::single(path.clone(), LockMode::Write),
        VfsOp::WriteMetadata { path } => LockPlan::single(path.clone(), LockMode::Write),
        VfsOp::CreateEntry { parent, new_path } => {
            canonical_plan(vec![parent.clone(), new_path.clone()])
        }
        VfsOp::RemoveEntry { parent, path } => canonical_plan(vec![parent.clone(), path.clone()]),
        VfsOp::Rename { src_parent, dst_parent, src, dst } => {
            canonical_plan(vec![src_parent.clone(), dst_parent.clone(), src.clone(), dst.clone()])
        }
    }
}

/// Sort, dedup, and turn a set of paths needing write locks into a
/// lexicographically-ordered plan.
fn canonical_plan(mut paths: Vec<PathKey>) -> LockPlan {
    paths.sort();
    paths.dedup();
    LockPlan {
        steps: paths.into_iter().map(|path| LockStep { path, mode: LockMode::Write }).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_metadata_takes_a_single_read_lock() {
        let plan = plan_for(&VfsOp::ReadMetadata { path: "/a".into() });
        assert_eq!(plan.steps, vec![LockStep { path: "/a".into(), mode: LockMode::Read }]);
    }

    #[test]
    fn open_write_takes_a_single_write_lock() {
        let plan = plan_for(&VfsOp::OpenWrite { path: "/a".into() });
        assert_eq!(plan.steps, vec![LockStep { path: "/a".into(), mode: LockMode::Write }]);
    }

    #[test]
    fn create_entry_locks_parent_then_new_path_in_lexicographic_order() {
        let plan = plan_for(&VfsOp::CreateEntry { parent: "/z".into(), new_path: "/a/new".into() });
        let paths: Vec<_> = plan.steps.iter().map(|s| s.path.clone()).collect();
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);
        assert!(plan.steps.iter().all(|s| s.mode == LockMode::Write));
    }

    #[test]
    fn cross_rename_plans_are_order_compatible() {
        // a -> b
        let forward = plan_for(&VfsOp::Rename {
            src_parent: "/".into(),
            dst_parent: "/".into(),
            src: "/a".into(),
            dst: "/b".into(),
        });
        // b -> a: touches the same path set, so must yield the same
        // acquisition order to avoid an AB/BA deadlock.
        let backward = plan_for(&VfsOp::Rename {
            src_parent: "/".into(),
            dst_parent: "/".into(),
            src: "/b".into(),
            dst: "/a".into(),
        });
        assert_eq!(forward, backward);
    }

    #[test]
    fn rename_dedupes_a_same_directory_parent() {
        let plan = plan_for(&VfsOp::Rename {
            src_parent: "/dir".into(),
            dst_parent: "/dir".into(),
            src: "/dir/a".into(),
            dst: "/dir/b".into(),
        });
        assert_eq!(plan.steps.len(), 3, "parent appears once despite being src_parent and dst_parent");
    }
}
