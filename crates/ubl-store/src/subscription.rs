// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ordered, backfilling event subscriptions.
//!
//! The fan-out channel is lossy under back-pressure (a bounded broadcast),
//! but subscriptions are not: a subscriber that falls behind detects the
//! gap — either an explicit lag error or a sequence skip — and backfills
//! from the log before resuming live delivery. The result is strict
//! per-sequence ordering with at-least-once delivery.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use ubl_core::filter::EventFilter;
use ubl_core::{Event, LedgerResult};

/// Read access to a contiguous slice of the log, used for backfill.
#[async_trait]
pub trait EventRange: Send + Sync {
    /// Events with sequence in `[from, to]` (open-ended when `to` is absent).
    async fn range(&self, from: u64, to: Option<u64>) -> LedgerResult<Vec<Event>>;

    /// Observability hook: a subscriber fell behind and resynced.
    fn note_lagged_resync(&self) {}
}

/// A handle yielding matching events in strict sequence order.
///
/// Dropping the subscription removes it from the fan-out set.
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    filter: EventFilter,
    /// Next global sequence this subscriber has not yet accounted for.
    next_sequence: u64,
    pending: VecDeque<Event>,
    backfill: Arc<dyn EventRange>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("next_sequence", &self.next_sequence)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub(crate) fn new(
        rx: broadcast::Receiver<Event>,
        filter: EventFilter,
        next_sequence: u64,
        pending: VecDeque<Event>,
        backfill: Arc<dyn EventRange>,
    ) -> Self {
        Self {
            rx,
            filter,
            next_sequence,
            pending,
            backfill,
        }
    }

    /// The next global sequence this subscription will account for.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.next_sequence
    }

    /// Receive the next matching event, waiting asynchronously.
    ///
    /// Returns `None` when the store has been dropped and the local queue is
    /// exhausted.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            // Drain queued (caught-up or backfilled) events first.
            while let Some(ev) = self.pending.pop_front() {
                self.next_sequence = ev.sequence + 1;
                if self.filter.matches(&ev) {
                    return Some(ev);
                }
            }

            match self.rx.recv().await {
                Ok(ev) => {
                    if ev.sequence < self.next_sequence {
                        // Already delivered via backfill.
                        continue;
                    }
                    if ev.sequence > self.next_sequence {
                        // Missed events between our position and this one.
                        self.resync(Some(ev)).await?;
                        continue;
                    }
                    self.next_sequence = ev.sequence + 1;
                    if self.filter.matches(&ev) {
                        return Some(ev);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    self.resync(None).await?;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive without blocking. Returns `None` when nothing is
    /// immediately available.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            while let Some(ev) = self.pending.pop_front() {
                self.next_sequence = ev.sequence + 1;
                if self.filter.matches(&ev) {
                    return Some(ev);
                }
            }
            match self.rx.try_recv() {
                Ok(ev) if ev.sequence < self.next_sequence => continue,
                Ok(ev) if ev.sequence == self.next_sequence => {
                    self.next_sequence = ev.sequence + 1;
                    if self.filter.matches(&ev) {
                        return Some(ev);
                    }
                }
                Ok(ev) => {
                    // Gap detected; queue the live event behind whatever we
                    // still owe, then loop to drain.
                    self.pending.push_back(ev);
                    return None;
                }
                Err(_) => return None,
            }
        }
    }

    /// Backfill `[next_sequence, ..]` from the log. `upto` is a live event
    /// to re-queue behind the backfilled range.
    async fn resync(&mut self, upto: Option<Event>) -> Option<()> {
        self.backfill.note_lagged_resync();
        let to = upto.as_ref().map(|ev| ev.sequence - 1);
        tracing::debug!(
            target: "ubl.store",
            from = self.next_sequence,
            ?to,
            "subscriber resyncing from log"
        );
        let missed = self.backfill.range(self.next_sequence, to).await.ok()?;
        self.pending.extend(missed);
        if let Some(ev) = upto {
            self.pending.push_back(ev);
        }
        Some(())
    }
}
