//! Per-key publish/subscribe channels.
//!
//! A subject remembers the last payload it published. Subscribing sends that
//! payload to the new receiver before attaching it, and both steps happen
//! under the store lock, so a subscriber can neither miss an update nor see
//! one twice. Sends go to unbounded channels and never run subscriber code
//! while the store is locked.

use std::sync::Arc;
use strata_core::{Entry, ObjectInstance};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;

/// Raw notification for one cache key.
#[derive(Debug, Clone)]
pub struct SubjectPayload {
    pub entry: Arc<Entry>,
    /// The visible value differs from the truth layer's value.
    pub is_optimistic: bool,
    /// Resolved member objects, for list and link keys with a value.
    pub members: Option<Arc<Vec<Arc<ObjectInstance>>>>,
}

pub(crate) struct Subject {
    last: SubjectPayload,
    subscribers: Vec<UnboundedSender<SubjectPayload>>,
}

impl Subject {
    pub(crate) fn new(initial: SubjectPayload) -> Self {
        Self {
            last: initial,
            subscribers: Vec::new(),
        }
    }

    pub(crate) fn subscribe(&mut self) -> UnboundedReceiver<SubjectPayload> {
        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(self.last.clone()).is_ok() {
            self.subscribers.push(tx);
        }
        rx
    }

    pub(crate) fn next(&mut self, payload: SubjectPayload) {
        trace!(
            cache_key = %payload.entry.cache_key,
            status = %payload.entry.status,
            receivers = self.subscribers.len(),
            "Subject emit"
        );
        self.subscribers
            .retain(|tx| tx.send(payload.clone()).is_ok());
        self.last = payload;
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.iter().filter(|tx| !tx.is_closed()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{CacheKeys, Status};

    fn payload(status: Status) -> SubjectPayload {
        let mut keys = CacheKeys::new();
        let key = keys.object("Employee", &1.into());
        SubjectPayload {
            entry: Arc::new(Entry::new(key, None, status)),
            is_optimistic: false,
            members: None,
        }
    }

    #[test]
    fn test_subscribe_replays_last() {
        let mut subject = Subject::new(payload(Status::Init));
        subject.next(payload(Status::Loaded));
        let mut rx = subject.subscribe();
        assert_eq!(rx.try_recv().unwrap().entry.status, Status::Loaded);
        assert!(rx.try_recv().is_err());

        subject.next(payload(Status::Error));
        assert_eq!(rx.try_recv().unwrap().entry.status, Status::Error);
    }

    #[test]
    fn test_dropped_receivers_are_pruned() {
        let mut subject = Subject::new(payload(Status::Init));
        let rx = subject.subscribe();
        let _kept = subject.subscribe();
        drop(rx);
        assert_eq!(subject.subscriber_count(), 1);
        subject.next(payload(Status::Loading));
        assert_eq!(subject.subscribers.len(), 1);
    }
}
