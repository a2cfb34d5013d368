use std::collections::{BTreeMap, HashSet};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::net::handshake::{Identity, PeerKind, Rejection};
use crate::protocol::{Classifier, Message};
use crate::scheduler::ClientStatus;

/// Sending half of a session's write loop.
pub type Outbox = mpsc::UnboundedSender<Message>;

/// A connected worker as the coordinator sees it.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub name: String,
    pub status: ClientStatus,
    pub job: Option<i64>,
    pub allocation: Option<i64>,
    pub task: Option<i64>,
    pub session: Uuid,
    /// `None` while the handshake is still being upgraded
    pub outbox: Option<Outbox>,
}

impl ClientRecord {
    pub fn set_idle(&mut self) {
        self.status = ClientStatus::Idle;
        self.job = None;
        self.allocation = None;
        self.task = None;
    }

    pub fn summary(&self) -> Value {
        json!({
            "name": self.name,
            "status": self.status.as_str(),
            "job": self.job,
            "allocation": self.allocation,
            "task": self.task,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ConsoleRecord {
    pub name: String,
    pub session: Uuid,
    pub outbox: Option<Outbox>,
}

/// Client and console records, keyed by display name.
///
/// A name is reserved during the handshake, before the upgrade completes,
/// so two dialers using one name cannot both pass the duplicate check.
/// Every record carries the session id that reserved it; a stale session
/// can never remove or overwrite its successor's record.
#[derive(Debug, Default)]
pub struct Registry {
    clients: BTreeMap<String, ClientRecord>,
    consoles: BTreeMap<String, ConsoleRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, identity: &Identity) -> Result<Uuid, Rejection> {
        let session = Uuid::new_v4();
        let name = identity.name.clone();
        match identity.kind {
            PeerKind::Client => {
                if self.clients.contains_key(&name) {
                    return Err(Rejection::DuplicateName(name));
                }
                let record = ClientRecord {
                    name: name.clone(),
                    status: identity.status.unwrap_or(ClientStatus::Idle),
                    job: identity.job,
                    allocation: identity.allocation,
                    task: identity.task,
                    session,
                    outbox: None,
                };
                self.clients.insert(name, record);
            }
            PeerKind::Console => {
                if self.consoles.contains_key(&name) {
                    return Err(Rejection::DuplicateName(name));
                }
                let record = ConsoleRecord {
                    name: name.clone(),
                    session,
                    outbox: None,
                };
                self.consoles.insert(name, record);
            }
        }
        Ok(session)
    }

    /// Bind the session's outbox to its reservation.
    pub fn attach(&mut self, kind: PeerKind, name: &str, session: Uuid, outbox: Outbox) -> bool {
        let slot = match kind {
            PeerKind::Client => self
                .clients
                .get_mut(name)
                .filter(|r| r.session == session)
                .map(|r| &mut r.outbox),
            PeerKind::Console => self
                .consoles
                .get_mut(name)
                .filter(|r| r.session == session)
                .map(|r| &mut r.outbox),
        };
        match slot {
            Some(slot) => {
                *slot = Some(outbox);
                true
            }
            None => false,
        }
    }

    /// Remove the record `session` created. Returns whether it was present.
    pub fn remove(&mut self, kind: PeerKind, name: &str, session: Uuid) -> bool {
        let owned = match kind {
            PeerKind::Client => self.clients.get(name).is_some_and(|r| r.session == session),
            PeerKind::Console => self.consoles.get(name).is_some_and(|r| r.session == session),
        };
        if owned {
            match kind {
                PeerKind::Client => {
                    self.clients.remove(name);
                }
                PeerKind::Console => {
                    self.consoles.remove(name);
                }
            }
        }
        owned
    }

    pub fn client(&self, name: &str) -> Option<&ClientRecord> {
        self.clients.get(name)
    }

    pub fn client_mut(&mut self, name: &str) -> Option<&mut ClientRecord> {
        self.clients.get_mut(name)
    }

    pub fn clients(&self) -> impl Iterator<Item = &ClientRecord> {
        self.clients.values()
    }

    pub fn clients_mut(&mut self) -> impl Iterator<Item = &mut ClientRecord> {
        self.clients.values_mut()
    }

    pub fn console_names(&self) -> Vec<String> {
        self.consoles.keys().cloned().collect()
    }

    /// Names of every registered client, for allocation eligibility checks.
    pub fn connected_clients(&self) -> HashSet<String> {
        self.clients.keys().cloned().collect()
    }

    /// Idle clients whose session is fully established.
    pub fn idle_clients(&self) -> Vec<String> {
        self.clients
            .values()
            .filter(|r| r.status == ClientStatus::Idle && r.outbox.is_some())
            .map(|r| r.name.clone())
            .collect()
    }

    pub fn send_to_client(&self, name: &str, message: Message) -> bool {
        self.clients
            .get(name)
            .and_then(|r| r.outbox.as_ref())
            .is_some_and(|outbox| outbox.send(message).is_ok())
    }

    pub fn send_to_console(&self, name: &str, message: Message) -> bool {
        self.consoles
            .get(name)
            .and_then(|r| r.outbox.as_ref())
            .is_some_and(|outbox| outbox.send(message).is_ok())
    }

    /// Send to every console. Returns how many accepted the message.
    pub fn broadcast_consoles(&self, message: &Message) -> usize {
        self.consoles
            .values()
            .filter_map(|r| r.outbox.as_ref())
            .filter(|outbox| outbox.send(message.clone()).is_ok())
            .count()
    }

    /// Forward `message` to every client `classifier` selects. Returns the
    /// names it was delivered to.
    pub fn relay(&self, classifier: &Classifier, message: &Message) -> Vec<String> {
        self.clients
            .values()
            .filter(|r| classifier.matches(&r.name))
            .filter(|r| {
                r.outbox
                    .as_ref()
                    .is_some_and(|outbox| outbox.send(message.clone()).is_ok())
            })
            .map(|r| r.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Target;

    fn client(name: &str) -> Identity {
        Identity::client(name, "secret")
    }

    fn attach_client(registry: &mut Registry, name: &str) -> (Uuid, mpsc::UnboundedReceiver<Message>) {
        let session = registry.reserve(&client(name)).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        assert!(registry.attach(PeerKind::Client, name, session, tx));
        (session, rx)
    }

    #[test]
    fn duplicate_names_are_rejected_per_kind() {
        let mut registry = Registry::new();
        registry.reserve(&client("A")).unwrap();
        assert_eq!(
            registry.reserve(&client("A")),
            Err(Rejection::DuplicateName("A".into()))
        );
        // A console may share a worker's name.
        registry.reserve(&Identity::console("A", "secret")).unwrap();
    }

    #[test]
    fn stale_session_cannot_remove_successor() {
        let mut registry = Registry::new();
        let first = registry.reserve(&client("A")).unwrap();
        assert!(registry.remove(PeerKind::Client, "A", first));
        let second = registry.reserve(&client("A")).unwrap();

        assert!(!registry.remove(PeerKind::Client, "A", first));
        assert!(registry.client("A").is_some());
        assert!(registry.remove(PeerKind::Client, "A", second));
    }

    #[test]
    fn reserved_clients_are_not_idle_until_attached() {
        let mut registry = Registry::new();
        registry.reserve(&client("A")).unwrap();
        assert!(registry.idle_clients().is_empty());
        assert!(registry.connected_clients().contains("A"));

        let _rx = attach_client(&mut registry, "B");
        assert_eq!(registry.idle_clients(), vec!["B".to_string()]);
    }

    #[test]
    fn reconnect_state_is_restored() {
        let mut registry = Registry::new();
        let identity = client("A").with_state(ClientStatus::Working, Some(1), Some(2), Some(3));
        registry.reserve(&identity).unwrap();
        let record = registry.client("A").unwrap();
        assert_eq!(record.status, ClientStatus::Working);
        assert_eq!(record.allocation, Some(2));
    }

    #[test]
    fn relay_reaches_only_selected_clients() {
        let mut registry = Registry::new();
        let (_, mut rx1) = attach_client(&mut registry, "render01");
        let (_, mut rx2) = attach_client(&mut registry, "render02");
        let (_, mut rx3) = attach_client(&mut registry, "comp01");

        let message = Message::health_check(Target::Client, "console");
        let classifier = Classifier::parse("render*").unwrap();
        let mut delivered = registry.relay(&classifier, &message);
        delivered.sort();
        assert_eq!(delivered, vec!["render01", "render02"]);

        assert_eq!(rx1.try_recv().unwrap(), message);
        assert_eq!(rx2.try_recv().unwrap(), message);
        assert!(rx3.try_recv().is_err());
    }
}
