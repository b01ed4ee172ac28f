//! Resend-until-acknowledged delivery for host packets.
//!
//! Trackers are keyed by `(destination client id, sequence)`. A scheduled
//! packet first waits out its delay, then is sent and retried at the ACK
//! timeout until either an ACK removes it or the retry budget runs out.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// One in-flight reliable packet.
#[derive(Debug)]
struct AckTracker {
    frame: Vec<u8>,
    sent_at: Instant,
    retries: u32,
}

/// A packet scheduled for its first send.
#[derive(Debug)]
struct DelayedSend {
    destination: u8,
    sequence: u16,
    frame: Vec<u8>,
    due: Instant,
}

/// What one processing pass decided.
#[derive(Debug, Default)]
pub struct ReliableActions {
    /// Frames to put on the wire now (first sends and retries).
    pub sends: Vec<(u8, Vec<u8>)>,
    /// How many of those are retries.
    pub retry_count: u32,
    /// Deliveries abandoned after the retry budget.
    pub failures: Vec<(u8, u16)>,
}

/// Central ACK tracker.
#[derive(Debug, Default)]
pub struct ReliableQueue {
    pending: HashMap<(u8, u16), AckTracker>,
    delayed: Vec<DelayedSend>,
}

impl ReliableQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a frame for reliable delivery at `due`.
    pub fn schedule(&mut self, destination: u8, sequence: u16, frame: Vec<u8>, due: Instant) {
        self.delayed.push(DelayedSend {
            destination,
            sequence,
            frame,
            due,
        });
    }

    /// Remove the tracker for an ACKed sequence. Unknown sequences are
    /// duplicates or stale and return false with no other effect.
    pub fn acknowledge(&mut self, destination: u8, sequence: u16) -> bool {
        if self.pending.remove(&(destination, sequence)).is_some() {
            return true;
        }
        // The ACK may have outrun the delayed first send.
        let before = self.delayed.len();
        self.delayed
            .retain(|d| !(d.destination == destination && d.sequence == sequence));
        before != self.delayed.len()
    }

    /// Forget everything addressed to a departed client.
    pub fn drop_destination(&mut self, destination: u8) {
        self.pending.retain(|(dest, _), _| *dest != destination);
        self.delayed.retain(|d| d.destination != destination);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.delayed.is_empty()
    }

    pub fn pending_for(&self, destination: u8) -> usize {
        self.pending
            .keys()
            .filter(|(dest, _)| *dest == destination)
            .count()
            + self
                .delayed
                .iter()
                .filter(|d| d.destination == destination)
                .count()
    }

    /// Move due delayed sends onto the wire and retry or abandon stale
    /// trackers.
    pub fn process(
        &mut self,
        now: Instant,
        ack_timeout: Duration,
        max_retries: u32,
    ) -> ReliableActions {
        let mut actions = ReliableActions::default();

        let mut waiting = Vec::new();
        for delayed in self.delayed.drain(..) {
            if now >= delayed.due {
                actions
                    .sends
                    .push((delayed.destination, delayed.frame.clone()));
                self.pending.insert(
                    (delayed.destination, delayed.sequence),
                    AckTracker {
                        frame: delayed.frame,
                        sent_at: now,
                        retries: 0,
                    },
                );
            } else {
                waiting.push(delayed);
            }
        }
        self.delayed = waiting;

        let mut abandoned = Vec::new();
        for (key, tracker) in self.pending.iter_mut() {
            if now.duration_since(tracker.sent_at) < ack_timeout {
                continue;
            }
            if tracker.retries < max_retries {
                tracker.retries += 1;
                tracker.sent_at = now;
                actions.sends.push((key.0, tracker.frame.clone()));
                actions.retry_count += 1;
            } else {
                abandoned.push(*key);
            }
        }
        for key in abandoned {
            self.pending.remove(&key);
            actions.failures.push(key);
        }

        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[test]
    fn delayed_send_waits_for_its_due_time() {
        let t0 = Instant::now();
        let mut queue = ReliableQueue::new();
        queue.schedule(2, 1, vec![1, 2, 3], t0 + Duration::from_millis(50));

        let actions = queue.process(t0, TIMEOUT, 5);
        assert!(actions.sends.is_empty());

        let actions = queue.process(t0 + Duration::from_millis(50), TIMEOUT, 5);
        assert_eq!(actions.sends, vec![(2, vec![1, 2, 3])]);
        assert!(!queue.is_empty());
    }

    #[test]
    fn retries_then_reports_failure() {
        let t0 = Instant::now();
        let mut queue = ReliableQueue::new();
        queue.schedule(2, 1, vec![9], t0);
        queue.process(t0, TIMEOUT, 2);

        // First timeout: retry 1.
        let actions = queue.process(t0 + TIMEOUT, TIMEOUT, 2);
        assert_eq!(actions.sends.len(), 1);
        assert_eq!(actions.retry_count, 1);

        // Second timeout: retry 2 (the budget).
        let actions = queue.process(t0 + TIMEOUT * 2, TIMEOUT, 2);
        assert_eq!(actions.retry_count, 1);

        // Third timeout: abandoned.
        let actions = queue.process(t0 + TIMEOUT * 3, TIMEOUT, 2);
        assert!(actions.sends.is_empty());
        assert_eq!(actions.failures, vec![(2, 1)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn acknowledge_is_idempotent() {
        let t0 = Instant::now();
        let mut queue = ReliableQueue::new();
        queue.schedule(2, 1, vec![9], t0);
        queue.process(t0, TIMEOUT, 5);

        assert!(queue.acknowledge(2, 1));
        assert!(!queue.acknowledge(2, 1));
        assert!(!queue.acknowledge(2, 99));
        assert!(queue.is_empty());

        // Nothing left to retry.
        let actions = queue.process(t0 + TIMEOUT * 10, TIMEOUT, 5);
        assert!(actions.sends.is_empty() && actions.failures.is_empty());
    }

    #[test]
    fn ack_can_cancel_a_delayed_send() {
        let t0 = Instant::now();
        let mut queue = ReliableQueue::new();
        queue.schedule(2, 1, vec![9], t0 + Duration::from_secs(1));
        assert!(queue.acknowledge(2, 1));
        assert!(queue.is_empty());
    }

    #[test]
    fn drop_destination_clears_both_queues() {
        let t0 = Instant::now();
        let mut queue = ReliableQueue::new();
        queue.schedule(2, 1, vec![1], t0);
        queue.schedule(3, 1, vec![2], t0);
        queue.schedule(2, 2, vec![3], t0 + Duration::from_secs(5));
        queue.process(t0, TIMEOUT, 5);

        queue.drop_destination(2);
        assert_eq!(queue.pending_for(2), 0);
        assert_eq!(queue.pending_for(3), 1);
    }
}
