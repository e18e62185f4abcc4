//! Message routing over the shared presence, link and queue state.
//!
//! All three tables live behind one mutex. Delivery only pushes onto
//! unbounded writer channels, so the lock is never held across I/O, and a
//! register-then-flush always completes before any envelope routed later
//! for the same identity reaches its writer.

use parking_lot::Mutex;
use parley_proto::{Envelope, EnvelopeKind, PresenceStatus, UserId, UserPresence};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::links::PeerLinks;
use crate::metrics;
use crate::queue::OfflineQueue;
use crate::registry::{Connection, ConnectionId, PresenceRegistry};

/// What happened to one routed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    Queued,
    Dropped,
    Answered,
    Ignored,
}

impl RouteOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteOutcome::Delivered => "delivered",
            RouteOutcome::Queued => "queued",
            RouteOutcome::Dropped => "dropped",
            RouteOutcome::Answered => "answered",
            RouteOutcome::Ignored => "ignored",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub online: usize,
    pub queued: usize,
}

#[derive(Debug, Default)]
struct RelayState {
    registry: PresenceRegistry,
    links: PeerLinks,
    queue: OfflineQueue,
}

impl RelayState {
    fn deliver_or_queue(&mut self, envelope: Envelope) -> RouteOutcome {
        let kind = envelope.kind();
        let Some(to) = envelope.recipient().cloned() else {
            return RouteOutcome::Ignored;
        };
        if !self.registry.is_known(&to) {
            info!(%kind, to = %to, "recipient never registered; dropped");
            return RouteOutcome::Dropped;
        }
        let envelope = match self.registry.lookup(&to) {
            Some(connection) if connection.is_open() => match connection.send(envelope) {
                Ok(()) => {
                    debug!(%kind, to = %to, "delivered");
                    return RouteOutcome::Delivered;
                }
                Err(envelope) => envelope,
            },
            _ => envelope,
        };
        let depth = self.queue.enqueue(&to, envelope);
        debug!(%kind, to = %to, depth, "recipient offline; queued");
        RouteOutcome::Queued
    }

    fn flush_to(&mut self, identity: &UserId, connection: &Connection) -> usize {
        let pending = self.queue.flush(identity);
        let mut delivered = 0;
        let mut rest = pending.into_iter();
        for envelope in rest.by_ref() {
            let kind = envelope.kind();
            match connection.send(envelope) {
                Ok(()) => {
                    delivered += 1;
                    metrics::record_envelope(kind.as_str(), "flushed");
                }
                Err(envelope) => {
                    // Writer died mid-flush; keep the remainder in order.
                    self.queue.enqueue(identity, envelope);
                    break;
                }
            }
        }
        for envelope in rest {
            self.queue.enqueue(identity, envelope);
        }
        delivered
    }

    fn broadcast(&self, except: &UserId, envelope: &Envelope) {
        for identity in self.registry.reachable_except(except) {
            if let Some(connection) = self.registry.lookup(&identity) {
                let _ = connection.send(envelope.clone());
            }
        }
    }

    fn stats(&self) -> RelayStats {
        RelayStats {
            online: self.registry.reachable_count(),
            queued: self.queue.total(),
        }
    }

    fn publish_occupancy(&self) {
        metrics::set_occupancy(self.registry.len(), self.queue.total());
    }
}

/// Shared routing core handed to every connection task.
#[derive(Debug, Clone, Default)]
pub struct Relay {
    state: Arc<Mutex<RelayState>>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `identity` to `connection`, acknowledge, flush anything queued for
    /// it, then announce it to every other reachable identity.
    pub fn register(&self, identity: UserId, connection: Connection) -> Connection {
        let mut state = self.state.lock();
        let installed = state.registry.register(identity.clone(), connection);

        let online_users = state.registry.reachable_except(&identity);
        let _ = installed.send(Envelope::Registered {
            user_id: identity.clone(),
            online_users,
        });

        let flushed = state.flush_to(&identity, &installed);
        state.broadcast(
            &identity,
            &Envelope::UserOnline {
                user_id: identity.clone(),
            },
        );
        state.publish_occupancy();

        info!(
            user = %identity,
            connection = %installed.id(),
            flushed,
            online = state.registry.len(),
            "user registered"
        );
        installed
    }

    /// Tear down `identity` if `connection` still owns it, notifying its
    /// reachable link partners. Returns false for a superseded connection.
    pub fn disconnect(&self, identity: &UserId, connection: ConnectionId) -> bool {
        let mut state = self.state.lock();
        if !state.registry.unregister(identity, connection) {
            return false;
        }
        let partners = state.links.take(identity);
        let notice = Envelope::UserOffline {
            user_id: identity.clone(),
        };
        for partner in &partners {
            if let Some(peer) = state.registry.lookup(partner).filter(|c| c.is_open()) {
                let _ = peer.send(notice.clone());
            }
        }
        state.publish_occupancy();
        info!(
            user = %identity,
            notified = partners.len(),
            online = state.registry.len(),
            "user disconnected"
        );
        true
    }

    /// Route one envelope received on `requester`.
    pub fn route(&self, requester: &Connection, envelope: Envelope) -> RouteOutcome {
        let kind = envelope.kind();
        let mut state = self.state.lock();
        let outcome = match envelope {
            Envelope::Offer { .. } => {
                if let (Some(from), Some(to)) = (envelope.sender(), envelope.recipient()) {
                    state.links.link(from, to);
                }
                state.deliver_or_queue(envelope)
            }
            Envelope::Answer { .. } | Envelope::IceCandidate { .. } | Envelope::TextMessage { .. } => {
                state.deliver_or_queue(envelope)
            }
            Envelope::CallEnd { from, to } => {
                state.links.unlink(&from, &to);
                match state.registry.lookup(&to).filter(|c| c.is_open()) {
                    Some(connection) => {
                        match connection.send(Envelope::CallEnd {
                            from: from.clone(),
                            to: to.clone(),
                        }) {
                            Ok(()) => RouteOutcome::Delivered,
                            Err(_) => RouteOutcome::Dropped,
                        }
                    }
                    None => {
                        debug!(from = %from, to = %to, "call-end for unreachable peer dropped");
                        RouteOutcome::Dropped
                    }
                }
            }
            Envelope::GetUsers { user_id } => {
                match state.registry.identity_of(requester.id()).cloned() {
                    Some(requester_id) => {
                        if requester_id != user_id {
                            debug!(
                                user = %requester_id,
                                claimed = %user_id,
                                "get-users names another identity; answering for the sender"
                            );
                        }
                        let users = state
                            .registry
                            .reachable_except(&requester_id)
                            .into_iter()
                            .map(|id| UserPresence {
                                id,
                                status: PresenceStatus::Online,
                            })
                            .collect();
                        match requester.send(Envelope::UsersList { users }) {
                            Ok(()) => RouteOutcome::Answered,
                            Err(_) => RouteOutcome::Dropped,
                        }
                    }
                    None => {
                        debug!(
                            connection = %requester.id(),
                            claimed = %user_id,
                            "get-users from unregistered connection ignored"
                        );
                        RouteOutcome::Ignored
                    }
                }
            }
            Envelope::Register { .. }
            | Envelope::Registered { .. }
            | Envelope::UserOnline { .. }
            | Envelope::UserOffline { .. }
            | Envelope::UsersList { .. } => {
                warn!(%kind, connection = %requester.id(), "unexpected envelope from client ignored");
                RouteOutcome::Ignored
            }
        };
        if matches!(outcome, RouteOutcome::Queued) {
            state.publish_occupancy();
        }
        metrics::record_envelope(kind.as_str(), outcome.as_str());
        outcome
    }

    pub fn is_reachable(&self, identity: &UserId) -> bool {
        self.state.lock().registry.is_reachable(identity)
    }

    pub fn is_linked(&self, a: &UserId, b: &UserId) -> bool {
        self.state.lock().links.is_linked(a, b)
    }

    pub fn pending_for(&self, identity: &UserId) -> usize {
        self.state.lock().queue.pending(identity)
    }

    pub fn identities(&self) -> Vec<UserId> {
        self.state.lock().registry.all_identities()
    }

    pub fn stats(&self) -> RelayStats {
        self.state.lock().stats()
    }

    /// Close every registered connection. Queued envelopes are discarded with
    /// the process.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        let entries = state.registry.drain();
        for (_, connection) in &entries {
            connection.close();
        }
        state.publish_occupancy();
        info!(closed = entries.len(), "relay shutting down");
    }
}

/// Log reachable identities and queue depth on a fixed cadence.
pub fn spawn_stats_reporter(relay: Relay, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let stats = relay.stats();
            info!(online = stats.online, queued = stats.queued, "relay occupancy");
        }
    })
}
