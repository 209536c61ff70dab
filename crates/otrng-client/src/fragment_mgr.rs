//! Outgoing fragmentation policy and the expiry sweep timer for
//! in-progress incoming fragment contexts.
//!
//! Reassembly itself lives on each `Conversation` (one
//! `FragmentReassembler` per peer) — this module is the `Client`-level
//! wrapper around it: deciding whether an outbound wire
//! message needs to be split at all (`original_source/src/fragment.c`'s
//! `otrng_fragment_message`) and how often `Client::expire_fragments`
//! should run (`client.h`'s `otrng_client_expire_fragments`, which the
//! C host is expected to call on a timer rather than per-message).

use chrono::{DateTime, Utc};

use otrng_proto::fragment::fragment_message;

use crate::error::ClientError;

/// Transport frame-size limit past which an outbound wire message is
/// split into `?OTR|...` fragments. IRC's historical 512-byte line
/// limit is the canonical motivating case.
#[derive(Debug, Clone, Copy)]
pub struct FragmentPolicy {
    pub max_size: usize,
}

impl Default for FragmentPolicy {
    fn default() -> Self {
        Self { max_size: 16_384 }
    }
}

impl FragmentPolicy {
    /// Split `wire` into frames if it exceeds `max_size`, otherwise
    /// return it unchanged as the sole element.
    pub fn maybe_fragment(
        &self,
        wire: &str,
        our_instance_tag: u32,
        their_instance_tag: u32,
    ) -> Result<Vec<String>, ClientError> {
        if wire.len() <= self.max_size {
            return Ok(vec![wire.to_string()]);
        }
        Ok(fragment_message(wire, self.max_size, our_instance_tag, their_instance_tag)?)
    }
}

/// Drives how often `Client::expire_fragments` actually sweeps every
/// conversation's `FragmentReassembler`, so a host polling on every UI
/// tick doesn't redo the same O(conversations) sweep needlessly.
#[derive(Debug, Clone)]
pub struct ExpirySchedule {
    interval: std::time::Duration,
    last_run: Option<DateTime<Utc>>,
}

impl ExpirySchedule {
    pub fn new(interval: std::time::Duration) -> Self {
        Self { interval, last_run: None }
    }

    /// Returns true (and records `now`) if at least `interval` has
    /// passed since the last sweep.
    pub fn due(&mut self, now: DateTime<Utc>) -> bool {
        let due = match self.last_run {
            None => true,
            Some(last) => {
                let elapsed = now.signed_duration_since(last);
                elapsed.to_std().map(|e| e >= self.interval).unwrap_or(true)
            }
        };
        if due {
            self.last_run = Some(now);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_message_is_not_fragmented() {
        let policy = FragmentPolicy { max_size: 64 };
        let out = policy.maybe_fragment("hi", 1, 2).unwrap();
        assert_eq!(out, vec!["hi".to_string()]);
    }

    #[test]
    fn long_message_is_split_into_multiple_frames() {
        let policy = FragmentPolicy { max_size: 64 };
        let long = "x".repeat(500);
        let out = policy.maybe_fragment(&long, 1, 2).unwrap();
        assert!(out.len() > 1);
        for frame in &out {
            assert!(frame.len() <= 64);
        }
    }

    #[test]
    fn schedule_fires_once_then_waits_for_interval() {
        let mut sched = ExpirySchedule::new(std::time::Duration::from_secs(600));
        let t0 = Utc::now();
        assert!(sched.due(t0));
        assert!(!sched.due(t0 + chrono::Duration::seconds(1)));
        assert!(sched.due(t0 + chrono::Duration::seconds(700)));
    }
}
