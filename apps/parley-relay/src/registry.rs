use parley_proto::{Envelope, UserId};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Work item for a connection's socket writer.
#[derive(Debug)]
pub enum Outbound {
    Envelope(Envelope),
    Close,
}

/// Handle to one transport connection. Liveness is read from the writer
/// channel on every call; nothing is cached.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Connection {
    pub fn new(outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbound,
        }
    }

    /// Connection plus the receiver its socket writer drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Queue an envelope for the writer. The envelope is handed back when the
    /// writer is gone.
    pub fn send(&self, envelope: Envelope) -> Result<(), Envelope> {
        match self.outbound.send(Outbound::Envelope(envelope)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(Outbound::Envelope(envelope))) => Err(envelope),
            Err(mpsc::error::SendError(Outbound::Close)) => Ok(()),
        }
    }

    /// Ask the writer to send a close frame and stop.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    /// Resolves once the writer has stopped.
    pub async fn closed(&self) {
        self.outbound.closed().await
    }
}

/// Identity to connection map; at most one connection per identity.
/// Identities that registered at least once are remembered after they go
/// offline so envelopes can be held for them.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: HashMap<UserId, Connection>,
    bound: HashMap<ConnectionId, UserId>,
    known: HashSet<UserId>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `connection` for `identity`, closing whichever connection held
    /// the identity before.
    pub fn register(&mut self, identity: UserId, connection: Connection) -> Connection {
        if let Some(previous) = self.entries.remove(&identity) {
            self.bound.remove(&previous.id());
            if previous.id() != connection.id() {
                info!(
                    user = %identity,
                    evicted = %previous.id(),
                    replacement = %connection.id(),
                    "identity re-registered; closing previous connection"
                );
                previous.close();
            }
        }
        self.known.insert(identity.clone());
        self.bound.insert(connection.id(), identity.clone());
        self.entries.insert(identity, connection.clone());
        connection
    }

    /// Remove `identity` if it is still bound to `connection`. Returns false
    /// when a newer connection has taken the identity over.
    pub fn unregister(&mut self, identity: &UserId, connection: ConnectionId) -> bool {
        match self.entries.get(identity) {
            Some(current) if current.id() == connection => {
                self.entries.remove(identity);
                self.bound.remove(&connection);
                true
            }
            Some(current) => {
                debug!(
                    user = %identity,
                    stale = %connection,
                    current = %current.id(),
                    "ignoring unregister from superseded connection"
                );
                false
            }
            None => false,
        }
    }

    /// Identity currently registered on `connection`, if any.
    pub fn identity_of(&self, connection: ConnectionId) -> Option<&UserId> {
        self.bound.get(&connection)
    }

    pub fn lookup(&self, identity: &UserId) -> Option<&Connection> {
        self.entries.get(identity)
    }

    /// Whether `identity` has ever registered with this relay.
    pub fn is_known(&self, identity: &UserId) -> bool {
        self.known.contains(identity)
    }

    pub fn is_reachable(&self, identity: &UserId) -> bool {
        self.entries
            .get(identity)
            .map(Connection::is_open)
            .unwrap_or(false)
    }

    pub fn all_identities(&self) -> Vec<UserId> {
        self.entries.keys().cloned().collect()
    }

    /// Reachable identities other than `identity`.
    pub fn reachable_except(&self, identity: &UserId) -> Vec<UserId> {
        self.entries
            .iter()
            .filter(|(id, connection)| *id != identity && connection.is_open())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn reachable_count(&self) -> usize {
        self.entries.values().filter(|c| c.is_open()).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> Vec<(UserId, Connection)> {
        self.bound.clear();
        self.entries.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn second_registration_closes_first() {
        let mut registry = PresenceRegistry::new();
        let (first, mut first_rx) = Connection::channel();
        let (second, _second_rx) = Connection::channel();
        let alice = UserId::from("alice");

        registry.register(alice.clone(), first.clone());
        registry.register(alice.clone(), second.clone());

        assert!(matches!(first_rx.try_recv(), Ok(Outbound::Close)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(&alice).map(Connection::id), Some(second.id()));
    }

    #[test_timeout::timeout]
    fn stale_unregister_keeps_newer_connection() {
        let mut registry = PresenceRegistry::new();
        let (first, _first_rx) = Connection::channel();
        let (second, _second_rx) = Connection::channel();
        let alice = UserId::from("alice");

        registry.register(alice.clone(), first.clone());
        registry.register(alice.clone(), second.clone());

        assert!(!registry.unregister(&alice, first.id()));
        assert!(registry.is_reachable(&alice));
        assert!(registry.unregister(&alice, second.id()));
        assert!(registry.lookup(&alice).is_none());
    }

    #[test_timeout::timeout]
    fn reachability_follows_writer_state() {
        let mut registry = PresenceRegistry::new();
        let (conn, rx) = Connection::channel();
        let bob = UserId::from("bob");
        registry.register(bob.clone(), conn);
        assert!(registry.is_reachable(&bob));

        drop(rx);
        assert!(!registry.is_reachable(&bob));
        assert_eq!(registry.all_identities(), vec![bob.clone()]);
        assert!(registry.reachable_except(&UserId::from("carol")).is_empty());
    }

    #[test_timeout::timeout]
    fn identity_of_follows_the_current_binding() {
        let mut registry = PresenceRegistry::new();
        let (first, _first_rx) = Connection::channel();
        let (second, _second_rx) = Connection::channel();
        let alice = UserId::from("alice");

        assert_eq!(registry.identity_of(first.id()), None);
        registry.register(alice.clone(), first.clone());
        assert_eq!(registry.identity_of(first.id()), Some(&alice));

        registry.register(alice.clone(), second.clone());
        assert_eq!(registry.identity_of(first.id()), None);
        assert_eq!(registry.identity_of(second.id()), Some(&alice));

        assert!(registry.unregister(&alice, second.id()));
        assert_eq!(registry.identity_of(second.id()), None);
    }

    #[test_timeout::timeout]
    fn identities_stay_known_after_unregister() {
        let mut registry = PresenceRegistry::new();
        let (conn, _rx) = Connection::channel();
        let alice = UserId::from("alice");
        assert!(!registry.is_known(&alice));

        registry.register(alice.clone(), conn.clone());
        assert!(registry.unregister(&alice, conn.id()));
        assert!(registry.lookup(&alice).is_none());
        assert!(registry.is_known(&alice));
        assert!(!registry.is_known(&UserId::from("ghost")));
    }

    #[test_timeout::timeout]
    fn re_registering_same_connection_does_not_close_it() {
        let mut registry = PresenceRegistry::new();
        let (conn, mut rx) = Connection::channel();
        let alice = UserId::from("alice");
        registry.register(alice.clone(), conn.clone());
        registry.register(alice.clone(), conn);
        assert!(rx.try_recv().is_err());
    }
}
