//! Integration tests for [`OwnerRegistry`] across concurrent opens on
//! unrelated paths, matching §4.2's "new opens never reuse another open's
//! token" requirement.

use gate_proxy_core::OwnerRegistry;
use std::sync::Arc;

#[tokio::test]
async fn concurrent_opens_on_distinct_paths_never_collide() {
    let registry = Arc::new(OwnerRegistry::new());
    let mut tasks = Vec::new();
    for i in 0..32 {
        let registry = Arc::clone(&registry);
        tasks.push(tokio::spawn(async move {
            let path = format!("/file-{i}");
            registry.open(&path)
        }));
    }

    let mut tokens = std::collections::HashSet::new();
    for task in tasks {
        tokens.insert(task.await.unwrap());
    }
    assert_eq!(tokens.len(), 32, "every concurrent open on a distinct path got a unique token");
}

#[tokio::test]
async fn reopen_after_every_close_never_reuses_the_old_token() {
    let registry = OwnerRegistry::new();
    let path = "/f".to_string();
    let mut seen = Vec::new();
    for _ in 0..8 {
        let token = registry.open(&path);
        assert!(registry.close(&path));
        assert!(!seen.contains(&token));
        seen.push(token);
    }
}
