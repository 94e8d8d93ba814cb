// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Batched Acknowledgments
//!
//! Calling `ack()`, `nack()` or `reject()` on a message only records the
//! outcome in the queue's [`AckBatch`]. A periodic tick (or, for `no_batch`
//! queues, an immediate notification) flushes every recorded outcome in one
//! pass.
//!
//! A flush walks the tracked delivery tags in order. The settled prefix is
//! collapsed into runs of equal outcome and each run longer than one message
//! is sent as a single `multiple` operation on its last tag. Everything before
//! that tag is settled by then, so a multiple operation never covers a tag that
//! is still pending. Settled tags behind a pending one go out individually.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::Notify;

/// Outcome recorded for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Pending,
    Ack,
    /// Negative acknowledgment, the broker requeues the message.
    Nack,
    /// Rejection without requeue, the broker drops or dead-letters the message.
    Reject,
}

/// One broker operation produced by a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOperation {
    pub delivery_tag: u64,
    pub multiple: bool,
    pub status: AckStatus,
}

/// Tracks the outcome of every unsettled delivery of one consumer channel.
#[derive(Default)]
pub struct AckBatch {
    entries: Mutex<BTreeMap<u64, AckStatus>>,
    immediate: bool,
    notify: Notify,
}

impl AckBatch {
    /// `immediate` batches wake their flusher on every settlement.
    pub fn new(immediate: bool) -> AckBatch {
        AckBatch {
            entries: Mutex::new(BTreeMap::new()),
            immediate,
            notify: Notify::new(),
        }
    }

    pub fn is_immediate(&self) -> bool {
        self.immediate
    }

    /// Starts tracking a delivery.
    pub fn track(&self, delivery_tag: u64) {
        self.entries.lock().insert(delivery_tag, AckStatus::Pending);
    }

    /// Records an outcome. Returns false when the tag was unknown or already settled.
    pub fn settle(&self, delivery_tag: u64, status: AckStatus) -> bool {
        let settled = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&delivery_tag) {
                Some(current) if *current == AckStatus::Pending => {
                    *current = status;
                    true
                }
                _ => false,
            }
        };

        if settled && self.immediate {
            self.notify.notify_one();
        }
        settled
    }

    /// Resolves when an immediate batch has something to flush.
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    pub fn pending(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|status| **status == AckStatus::Pending)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Forgets every tag, e.g. after the consumer channel was replaced.
    pub fn reset(&self) {
        self.entries.lock().clear();
    }

    /// Removes every settled entry and returns the operations to send.
    pub fn drain(&self) -> Vec<AckOperation> {
        let mut entries = self.entries.lock();
        let operations = plan(&entries);
        entries.retain(|_, status| *status == AckStatus::Pending);
        operations
    }
}

/// Computes the operations that settle every non-pending entry.
pub fn plan(entries: &BTreeMap<u64, AckStatus>) -> Vec<AckOperation> {
    let mut operations = vec![];
    let mut iter = entries.iter().peekable();

    // settled prefix, collapsed into runs
    let mut run: Option<(u64, AckStatus, usize)> = None;
    while let Some((tag, status)) = iter.peek() {
        if **status == AckStatus::Pending {
            break;
        }
        run = match run {
            Some((_, current, len)) if current == **status => Some((**tag, current, len + 1)),
            Some((last, current, len)) => {
                operations.push(AckOperation {
                    delivery_tag: last,
                    multiple: len > 1,
                    status: current,
                });
                Some((**tag, **status, 1))
            }
            None => Some((**tag, **status, 1)),
        };
        iter.next();
    }
    if let Some((last, status, len)) = run {
        operations.push(AckOperation {
            delivery_tag: last,
            multiple: len > 1,
            status,
        });
    }

    // anything settled behind a pending delivery goes out on its own
    for (tag, status) in iter {
        if *status != AckStatus::Pending {
            operations.push(AckOperation {
                delivery_tag: *tag,
                multiple: false,
                status: *status,
            });
        }
    }

    operations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(items: &[(u64, AckStatus)]) -> BTreeMap<u64, AckStatus> {
        items.iter().copied().collect()
    }

    #[test]
    fn settled_prefix_collapses_into_one_multiple_ack() {
        let ops = plan(&entries(&[
            (1, AckStatus::Ack),
            (2, AckStatus::Ack),
            (3, AckStatus::Ack),
        ]));
        assert_eq!(
            ops,
            vec![AckOperation {
                delivery_tag: 3,
                multiple: true,
                status: AckStatus::Ack
            }]
        );
    }

    #[test]
    fn runs_of_different_outcomes_are_split_in_tag_order() {
        let ops = plan(&entries(&[
            (1, AckStatus::Ack),
            (2, AckStatus::Ack),
            (3, AckStatus::Nack),
            (4, AckStatus::Reject),
            (5, AckStatus::Reject),
        ]));
        assert_eq!(
            ops,
            vec![
                AckOperation {
                    delivery_tag: 2,
                    multiple: true,
                    status: AckStatus::Ack
                },
                AckOperation {
                    delivery_tag: 3,
                    multiple: false,
                    status: AckStatus::Nack
                },
                AckOperation {
                    delivery_tag: 5,
                    multiple: true,
                    status: AckStatus::Reject
                },
            ]
        );
    }

    #[test]
    fn never_multiple_acks_across_a_pending_tag() {
        let ops = plan(&entries(&[
            (1, AckStatus::Ack),
            (2, AckStatus::Pending),
            (3, AckStatus::Ack),
            (4, AckStatus::Ack),
        ]));
        assert_eq!(
            ops,
            vec![
                AckOperation {
                    delivery_tag: 1,
                    multiple: false,
                    status: AckStatus::Ack
                },
                AckOperation {
                    delivery_tag: 3,
                    multiple: false,
                    status: AckStatus::Ack
                },
                AckOperation {
                    delivery_tag: 4,
                    multiple: false,
                    status: AckStatus::Ack
                },
            ]
        );
    }

    #[test]
    fn drain_keeps_pending_entries_and_settle_is_terminal() {
        let batch = AckBatch::new(false);
        batch.track(1);
        batch.track(2);
        assert!(batch.settle(1, AckStatus::Ack));
        assert!(!batch.settle(1, AckStatus::Nack));
        assert!(!batch.settle(9, AckStatus::Ack));

        assert_eq!(batch.drain().len(), 1);
        assert_eq!(batch.pending(), 1);
        assert!(batch.drain().is_empty());
        assert!(batch.settle(2, AckStatus::Reject));
        assert_eq!(batch.drain()[0].status, AckStatus::Reject);
        assert!(batch.is_empty());
    }
}
