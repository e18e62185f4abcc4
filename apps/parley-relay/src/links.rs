use parley_proto::UserId;
use std::collections::{HashMap, HashSet};

/// Symmetric relation of identities that are negotiating or in a call with
/// each other. Only used to fan out offline notices; owns no connections.
#[derive(Debug, Default)]
pub struct PeerLinks {
    edges: HashMap<UserId, HashSet<UserId>>,
}

impl PeerLinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&mut self, a: &UserId, b: &UserId) {
        self.edges.entry(a.clone()).or_default().insert(b.clone());
        self.edges.entry(b.clone()).or_default().insert(a.clone());
    }

    pub fn unlink(&mut self, a: &UserId, b: &UserId) {
        self.remove_half(a, b);
        self.remove_half(b, a);
    }

    /// Drop every edge touching `identity`, returning its former partners.
    pub fn take(&mut self, identity: &UserId) -> Vec<UserId> {
        let partners: Vec<UserId> = self
            .edges
            .remove(identity)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for partner in &partners {
            self.remove_half(partner, identity);
        }
        partners
    }

    pub fn is_linked(&self, a: &UserId, b: &UserId) -> bool {
        self.edges.get(a).map(|set| set.contains(b)).unwrap_or(false)
    }

    pub fn partners(&self, identity: &UserId) -> Vec<UserId> {
        self.edges
            .get(identity)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn remove_half(&mut self, from: &UserId, to: &UserId) {
        let now_empty = match self.edges.get_mut(from) {
            Some(set) => {
                set.remove(to);
                set.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.edges.remove(from);
        }
    }
}
