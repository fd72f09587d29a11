//! Helpers shared by the store integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use strata_core::Status;
use strata_store::{Query, QuerySubscription, Store};
use strata_test_utils::{init_test_tracing, MockOntology};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn store_with(mock: MockOntology) -> (Store, Arc<MockOntology>) {
    init_test_tracing();
    let mock = Arc::new(mock);
    let store = Store::new(mock.clone());
    (store, mock)
}

/// Receive until `pred` holds, failing after [`WAIT`].
pub async fn next_matching<Q, F>(sub: &mut QuerySubscription<Q>, pred: F) -> Q::Payload
where
    Q: Query,
    F: Fn(&Q::Payload) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let payload = sub.recv().await.expect("subscription closed");
            if pred(&payload) {
                return payload;
            }
        }
    })
    .await
    .expect("timed out waiting for payload")
}

/// Statuses seen up to and including `last`, with repeats collapsed.
pub async fn status_trail<Q, F>(sub: &mut QuerySubscription<Q>, last: Status, status: F) -> Vec<Status>
where
    Q: Query,
    F: Fn(&Q::Payload) -> Status,
{
    let mut trail: Vec<Status> = Vec::new();
    while trail.last() != Some(&last) {
        let payload = tokio::time::timeout(WAIT, sub.recv())
            .await
            .expect("timed out waiting for status")
            .expect("subscription closed");
        let next = status(&payload);
        if trail.last() != Some(&next) {
            trail.push(next);
        }
    }
    trail
}

/// Poll `cond` until it holds, failing after [`WAIT`].
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held")
}

/// Let spawned tasks run.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
