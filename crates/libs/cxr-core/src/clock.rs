//! Monotonic sequence/response identifiers and the message header.
//!
//! Every outbound message carries a header drawn from a shared
//! [`MessageClock`]. The clock is created once per process and passed by
//! `Arc` to everything that constructs messages, never held as global
//! mutable state, so tests control sequencing deterministically.
//!
//! Identifiers roll over to 1 after exceeding [`ROLLOVER_THRESHOLD`]. Ids
//! across rollover epochs can collide; they are local ordering heuristics,
//! not globally unique.

use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

/// Counter value beyond which sequence and response ids reset to 1.
pub const ROLLOVER_THRESHOLD: u32 = 1_000_000;

/// Header timestamp layout, matching the Python and Unity peers:
/// `yyyy-MM-dd HH:mm:ss.fff`.
const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]");

/// Monotonic counter with rollover. Never decremented, never reset except
/// by rollover.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    value: Mutex<u32>,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the counter and return the new value.
    pub fn increment(&self) -> u32 {
        let mut value = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        *value = if *value >= ROLLOVER_THRESHOLD { 1 } else { *value + 1 };
        *value
    }
}

/// Response-id counter: same rollover rule as [`SequenceCounter`], plus a
/// reconcile operation used to judge whether a response to a given request
/// is fresh.
#[derive(Debug, Default)]
pub struct ResponseCounter {
    value: Mutex<u32>,
}

impl ResponseCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the counter and return the new value.
    pub fn increment(&self) -> u32 {
        let mut value = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        *value = if *value >= ROLLOVER_THRESHOLD { 1 } else { *value + 1 };
        *value
    }

    /// Reconcile against an observed response id. A repeated value means the
    /// continuation is stale and the counter advances past it; a diverging
    /// value becomes the new current value. Returns the resulting value.
    pub fn reconcile(&self, observed: u32) -> u32 {
        let mut value = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        if observed == *value {
            *value = if *value >= ROLLOVER_THRESHOLD { 1 } else { *value + 1 };
        } else {
            *value = observed;
        }
        *value
    }
}

/// Process-wide id source stamping every outbound message.
#[derive(Debug, Default)]
pub struct MessageClock {
    sequence: SequenceCounter,
    response: ResponseCounter,
    last_response: Mutex<Option<u32>>,
}

impl MessageClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence id: strictly increasing within a rollover epoch.
    pub fn next_sequence_id(&self) -> u32 {
        self.sequence.increment()
    }

    /// Next response id. The shared counter is advanced an extra step when
    /// the observed continuation diverges from the last issued id, which is
    /// what lets receivers tell a fresh response from a stale one.
    pub fn next_response_id(&self) -> u32 {
        let mut last = self
            .last_response
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let issued = match *last {
            None => self.response.increment(),
            Some(prev) => {
                let probe = self.response.increment();
                if prev == probe {
                    self.response.increment()
                } else {
                    self.response.increment();
                    self.response.increment()
                }
            }
        };
        *last = Some(issued);
        issued
    }

    /// Build a header for an outbound message, advancing both counters.
    pub fn header(&self, device_id: &str) -> Header {
        Header {
            sequence_id: self.next_sequence_id(),
            response_id: self.next_response_id(),
            device_id: device_id.to_owned(),
            time_stamp: timestamp(),
        }
    }
}

fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(TIMESTAMP_FORMAT)
        .unwrap_or_default()
}

/// Header nested under the `header` key of every wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub sequence_id: u32,
    pub response_id: u32,
    pub device_id: String,
    pub time_stamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_ids_increase() {
        let counter = SequenceCounter::new();
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increment(), 2);
        assert_eq!(counter.increment(), 3);
    }

    #[test]
    fn sequence_rolls_over_after_threshold() {
        let counter = SequenceCounter::new();
        for _ in 0..ROLLOVER_THRESHOLD {
            counter.increment();
        }
        // 1,000,000 increments from zero land on the threshold itself.
        assert_eq!(counter.increment(), 1);
    }

    #[test]
    fn reconcile_advances_on_stale_value() {
        let counter = ResponseCounter::new();
        counter.increment();
        assert_eq!(counter.reconcile(1), 2);
        assert_eq!(counter.reconcile(7), 7);
    }

    #[test]
    fn headers_share_the_sequence_counter() {
        let clock = MessageClock::new();
        let first = clock.header("device-a");
        let second = clock.header("device-b");
        assert_eq!(first.sequence_id, 1);
        assert_eq!(second.sequence_id, 2);
        assert!(second.response_id > first.response_id);
    }

    #[test]
    fn timestamp_matches_wire_layout() {
        let stamp = timestamp();
        // yyyy-MM-dd HH:mm:ss.fff
        assert_eq!(stamp.len(), 23);
        assert_eq!(&stamp[4..5], "-");
        assert_eq!(&stamp[10..11], " ");
        assert_eq!(&stamp[19..20], ".");
    }
}
