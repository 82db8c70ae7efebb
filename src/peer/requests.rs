//! The request/response tracker.
//!
//! Outbound queries (`getheaders`, the verack wait, the legacy
//! `havewitness` probe, ...) register an entry keyed by the command of
//! the reply they expect. Inbound packets resolve the head entry of
//! their command's FIFO queue; entries that outlive their deadline are
//! expired by the tick and removed by id, never by position.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::wire::message::{Command, Packet};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A matcher decides whether the head entry is satisfied by this packet
/// or should keep waiting for a later one in the same category.
pub enum Respond {
    Consume,
    Keep,
}

type Matcher = Box<dyn FnMut(&Packet) -> Respond + Send>;

pub struct RequestEntry {
    pub id: u64,
    pub cmd: Command,
    pub deadline: Instant,
    /// `None` means any packet of the right command satisfies the wait.
    matcher: Option<Matcher>,
}

#[derive(Default)]
pub struct RequestTracker {
    queues: HashMap<Command, VecDeque<RequestEntry>>,
    next_id: u64,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a wait for the next `cmd` packet. Ids are unique per
    /// peer and strictly increasing in insertion order.
    pub fn request(&mut self, cmd: Command, now: Instant) -> u64 {
        self.request_matching(cmd, now, None)
    }

    pub fn request_matching(
        &mut self,
        cmd: Command,
        now: Instant,
        matcher: Option<Matcher>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        self.queues.entry(cmd).or_default().push_back(RequestEntry {
            id,
            cmd,
            deadline: now + REQUEST_TIMEOUT,
            matcher,
        });

        id
    }

    /// Offers an inbound packet to the head entry of its command queue.
    /// Returns true when a pending request was resolved. Unsolicited
    /// packets (no queue) are a no-op.
    pub fn response(&mut self, packet: &Packet) -> bool {
        let cmd = packet.command();
        let Some(queue) = self.queues.get_mut(&cmd) else {
            return false;
        };
        let Some(entry) = queue.front_mut() else {
            self.queues.remove(&cmd);
            return false;
        };

        let outcome = match &mut entry.matcher {
            Some(matcher) => matcher(packet),
            None => Respond::Consume,
        };

        if let Respond::Consume = outcome {
            queue.pop_front();
            if queue.is_empty() {
                self.queues.remove(&cmd);
            }
        }

        true
    }

    pub fn pending(&self, cmd: Command) -> usize {
        self.queues.get(&cmd).map_or(0, |queue| queue.len())
    }

    /// Earliest deadline across all queues, for the driving loop's
    /// sleep computation.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queues
            .values()
            .flat_map(|queue| queue.iter())
            .map(|entry| entry.deadline)
            .min()
    }

    /// Removes and returns every entry whose deadline has passed.
    /// Removal is by id equality, so FIFO order survives entries timing
    /// out from the middle of a queue.
    pub fn expire(&mut self, now: Instant) -> Vec<(Command, u64)> {
        let mut expired = vec![];

        for (cmd, queue) in self.queues.iter_mut() {
            let due: Vec<u64> = queue
                .iter()
                .filter(|entry| entry.deadline <= now)
                .map(|entry| entry.id)
                .collect();
            for id in due {
                queue.retain(|entry| entry.id != id);
                expired.push((*cmd, id));
            }
        }
        self.queues.retain(|_, queue| !queue.is_empty());

        expired.sort_by_key(|&(_, id)| id);
        expired
    }

    /// Drops every pending entry; used by destroy.
    pub fn clear(&mut self) -> usize {
        let count = self.queues.values().map(|queue| queue.len()).sum();
        self.queues.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn ids_are_unique_and_strictly_increasing() {
        let mut tracker = RequestTracker::new();
        let t = now();

        let a = tracker.request(Command::Headers, t);
        let b = tracker.request(Command::Headers, t);
        let c = tracker.request(Command::Verack, t);

        assert!(a < b && b < c);
        assert_eq!(tracker.pending(Command::Headers), 2);
        assert_eq!(tracker.pending(Command::Verack), 1);
    }

    #[test]
    fn response_resolves_fifo_head() {
        let mut tracker = RequestTracker::new();
        let t = now();

        tracker.request(Command::Verack, t);
        tracker.request(Command::Verack, t);

        assert!(tracker.response(&Packet::Verack));
        assert_eq!(tracker.pending(Command::Verack), 1);
        assert!(tracker.response(&Packet::Verack));
        assert_eq!(tracker.pending(Command::Verack), 0);

        // Unsolicited: queue is gone, no-op.
        assert!(!tracker.response(&Packet::Verack));
    }

    #[test]
    fn keep_matcher_retains_the_entry() {
        let mut tracker = RequestTracker::new();
        let t = now();

        let mut seen = 0;
        tracker.request_matching(
            Command::Pong,
            t,
            Some(Box::new(move |_| {
                seen += 1;
                if seen < 2 {
                    Respond::Keep
                } else {
                    Respond::Consume
                }
            })),
        );

        assert!(tracker.response(&Packet::Pong(1)));
        assert_eq!(tracker.pending(Command::Pong), 1);
        assert!(tracker.response(&Packet::Pong(2)));
        assert_eq!(tracker.pending(Command::Pong), 0);
    }

    #[test]
    fn expire_removes_by_id_and_reports_command() {
        let mut tracker = RequestTracker::new();
        let t = now();

        let a = tracker.request(Command::Headers, t);
        // Registered later, so it expires later.
        let b = tracker.request(Command::Headers, t + Duration::from_secs(5));

        let expired = tracker.expire(t + REQUEST_TIMEOUT);
        assert_eq!(expired, vec![(Command::Headers, a)]);
        assert_eq!(tracker.pending(Command::Headers), 1);

        let expired = tracker.expire(t + REQUEST_TIMEOUT + Duration::from_secs(5));
        assert_eq!(expired, vec![(Command::Headers, b)]);
        assert_eq!(tracker.pending(Command::Headers), 0);
        assert_eq!(tracker.next_deadline(), None);
    }

    #[test]
    fn next_deadline_is_the_minimum() {
        let mut tracker = RequestTracker::new();
        let t = now();

        tracker.request(Command::Headers, t + Duration::from_secs(3));
        tracker.request(Command::Verack, t);

        assert_eq!(tracker.next_deadline(), Some(t + REQUEST_TIMEOUT));
    }

    #[test]
    fn clear_counts_dropped_entries() {
        let mut tracker = RequestTracker::new();
        let t = now();

        tracker.request(Command::Headers, t);
        tracker.request(Command::Verack, t);
        assert_eq!(tracker.clear(), 2);
        assert_eq!(tracker.pending(Command::Headers), 0);
    }
}
