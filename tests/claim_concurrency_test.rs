//! Concurrent claimers against one file-backed queue.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use taskloop::domain::models::{WorkItem, WorkResult, WorkStatus};
use taskloop::domain::ports::WorkStore;

use common::setup_file_store;

const ITEMS: usize = 40;
const CLAIMERS: usize = 8;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_hand_out_an_item_twice() {
    let (_dir, store) = setup_file_store(CLAIMERS as u32).await;
    for i in 0..ITEMS {
        store
            .add(WorkItem::new(format!("Item {i}"), "work"))
            .await
            .expect("add");
    }

    let handles: Vec<_> = (0..CLAIMERS)
        .map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(item) = store.claim_next().await.expect("claim") {
                    assert_eq!(item.status, WorkStatus::Active);
                    assert_eq!(item.attempts, 1);
                    claimed.push(item.id);
                }
                claimed
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.expect("claimer panicked"));
    }

    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), ITEMS, "every item claimed exactly once");
    assert_eq!(unique.len(), ITEMS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_claims_on_one_item_have_one_winner() {
    let (_dir, store) = setup_file_store(CLAIMERS as u32).await;
    let id = store.add(WorkItem::new("Contended", "work")).await.unwrap();

    let handles: Vec<_> = (0..CLAIMERS)
        .map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.claim(id).await.expect("claim") })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let completed = store
        .complete(id, WorkResult::default(), Duration::from_millis(5))
        .await
        .unwrap();
    assert_eq!(completed.attempts, 1);
}
