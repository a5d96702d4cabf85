// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hash chain verification over event sequences.
//!
//! Every event records the hash of its predecessor in global order, making
//! the ledger a tamper-evident chain. [`verify_chain`] walks a contiguous
//! slice and reports the first break, if any.

use crate::{event_hash, Event, LedgerResult, GENESIS_HASH};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Outcome of walking a chain segment.
///
/// `valid == true` implies `invalid_at` and `error` are absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ChainReport {
    /// Whether every event in the range passed self-hash and link checks.
    pub valid: bool,
    /// Sequence of the first failing event, when invalid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_at: Option<u64>,
    /// Description of the first failure, when invalid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChainReport {
    /// A report for a fully valid range.
    #[must_use]
    pub fn valid() -> Self {
        Self {
            valid: true,
            invalid_at: None,
            error: None,
        }
    }

    /// A report pinpointing the first failure.
    #[must_use]
    pub fn broken_at(sequence: u64, error: impl Into<String>) -> Self {
        Self {
            valid: false,
            invalid_at: Some(sequence),
            error: Some(error.into()),
        }
    }
}

/// Verify a contiguous run of events in ascending global order.
///
/// Checks, per event: the stored hash matches the recomputed canonical
/// hash, and `previous_hash` matches the prior event's hash. When the
/// slice starts at sequence 1 the first event's `previous_hash` must be
/// the genesis literal; otherwise the caller is expected to have sliced
/// at a trusted boundary and the first link is taken on faith.
///
/// # Errors
///
/// Returns an error only if an event cannot be serialized for hashing;
/// chain breaks are reported in the [`ChainReport`], not as errors.
pub fn verify_chain(events: &[Event]) -> LedgerResult<ChainReport> {
    let mut previous: Option<&Event> = None;
    for event in events {
        let recomputed = event_hash(event)?;
        if event.hash != recomputed {
            return Ok(ChainReport::broken_at(
                event.sequence,
                format!("stored hash does not match canonical hash of event {}", event.id),
            ));
        }
        match previous {
            Some(prev) => {
                if event.sequence != prev.sequence + 1 {
                    return Ok(ChainReport::broken_at(
                        event.sequence,
                        format!("sequence gap: {} follows {}", event.sequence, prev.sequence),
                    ));
                }
                if event.previous_hash != prev.hash {
                    return Ok(ChainReport::broken_at(
                        event.sequence,
                        "previous_hash does not match prior event's hash",
                    ));
                }
            }
            None => {
                if event.sequence == 1 && event.previous_hash != GENESIS_HASH {
                    return Ok(ChainReport::broken_at(
                        1,
                        "first event must link to the genesis literal",
                    ));
                }
            }
        }
        previous = Some(event);
    }
    Ok(ChainReport::valid())
}
