use parley_proto::{Envelope, UserId};
use std::collections::{HashMap, VecDeque};

/// Per-destination FIFO of envelopes waiting for their recipient to register.
/// Volatile: nothing survives a relay restart.
#[derive(Debug, Default)]
pub struct OfflineQueue {
    pending: HashMap<UserId, VecDeque<Envelope>>,
    total: usize,
}

impl OfflineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `envelope` for `to`; returns the destination's queue depth.
    pub fn enqueue(&mut self, to: &UserId, envelope: Envelope) -> usize {
        let queue = self.pending.entry(to.clone()).or_default();
        queue.push_back(envelope);
        self.total += 1;
        queue.len()
    }

    /// Remove and return everything pending for `to`, oldest first.
    pub fn flush(&mut self, to: &UserId) -> Vec<Envelope> {
        let drained: Vec<Envelope> = self
            .pending
            .remove(to)
            .map(Vec::from)
            .unwrap_or_default();
        self.total -= drained.len();
        drained
    }

    pub fn pending(&self, to: &UserId) -> usize {
        self.pending.get(to).map(VecDeque::len).unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(n: usize) -> Envelope {
        Envelope::text(UserId::from("a"), UserId::from("b"), format!("m{n}"))
    }

    #[test_timeout::timeout]
    fn flush_returns_arrival_order_and_empties() {
        let mut queue = OfflineQueue::new();
        let b = UserId::from("b");
        for n in 0..3 {
            queue.enqueue(&b, text(n));
        }
        queue.enqueue(&UserId::from("c"), text(9));
        assert_eq!(queue.total(), 4);

        let flushed = queue.flush(&b);
        let texts: Vec<_> = flushed
            .iter()
            .map(|e| match e {
                Envelope::TextMessage { text, .. } => text.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(texts, vec!["m0", "m1", "m2"]);
        assert_eq!(queue.pending(&b), 0);
        assert_eq!(queue.total(), 1);
        assert!(queue.flush(&b).is_empty());
    }
}
