//! Name-based broker that pairs clients with exposed backends.
//!
//! Everything goes through one control connection returned by [`Hub::spawn`].
//! A backend sends `expose NAME` with a connection descriptor attached. A
//! client sends `NAME ...` with its own descriptor. For each client the hub
//! picks a backend exposed under the first word, creates a fresh connection
//! pair and hands one end to each side: the backend receives the client's
//! message, the client receives the backend's. Backends are reused after
//! every handoff; a client whose backend turned out to be dead is retried
//! with the next one.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::os::fd::AsFd;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use bytes::Bytes;
use tracing::{debug, info, warn};

use beam_transport::{Conn, ConnConfig, RawMessage, TransportError};

use crate::error::{Result, SessionError};

/// First word of a backend announcement.
pub const EXPOSE: &str = "expose";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Backend,
}

struct Offer {
    side: Side,
    data: Bytes,
    conn: Conn,
}

/// Which half of a handoff failed.
enum Handoff {
    Pair(TransportError),
    Backend(TransportError),
    Client(TransportError),
}

/// The broker loop. Owns the inside end of the hub connection and one queue
/// per exposed name.
pub struct Hub {
    inside: Conn,
    config: ConnConfig,
    routes: HashMap<String, Sender<Offer>>,
}

impl Hub {
    /// Start a hub on its own thread and return the connection to talk to it.
    ///
    /// The hub stops, closing every queued descriptor, once the returned
    /// connection is dropped.
    pub fn spawn() -> Result<Conn> {
        Self::spawn_with_config(ConnConfig::default())
    }

    pub fn spawn_with_config(config: ConnConfig) -> Result<Conn> {
        let (inside, outside) = Conn::pair_with_config(config.clone())?;
        let hub = Hub {
            inside,
            config,
            routes: HashMap::new(),
        };
        thread::Builder::new()
            .name("beam-hub".into())
            .spawn(move || hub.run())
            .map_err(SessionError::Spawn)?;
        Ok(outside)
    }

    fn run(mut self) {
        loop {
            let message = match self.inside.receive() {
                Ok(message) => message,
                Err(err) => {
                    if !err.is_shutdown() {
                        warn!(error = %err, "hub connection failed");
                    }
                    break;
                }
            };
            if let Some((name, offer)) = self.parse(message) {
                self.forward(name, offer);
            }
        }
        info!(routes = self.routes.len(), "hub stopped");
    }

    fn parse(&self, message: RawMessage) -> Option<(String, Offer)> {
        let RawMessage {
            payload,
            fds,
            truncated,
        } = message;
        if truncated {
            warn!("hub request truncated, dropping");
            return None;
        }
        let Ok(text) = std::str::from_utf8(&payload) else {
            warn!("hub request is not UTF-8, dropping");
            return None;
        };
        let mut words = text.split(' ');
        let (side, name) = match words.next() {
            Some(EXPOSE) => match words.next() {
                Some(name) if !name.is_empty() => (Side::Backend, name),
                _ => {
                    warn!("usage: expose NAME; dropping");
                    return None;
                }
            },
            Some(name) if !name.is_empty() => (Side::Client, name),
            _ => {
                warn!(request = %text, "hub request without a name, dropping");
                return None;
            }
        };
        let Some(fd) = fds.into_iter().next() else {
            debug!(name, ?side, "hub request without descriptor, dropping");
            return None;
        };
        let offer = Offer {
            side,
            data: payload.clone(),
            conn: Conn::from_owned_fd(fd, self.config.clone()),
        };
        Some((name.to_string(), offer))
    }

    fn forward(&mut self, name: String, offer: Offer) {
        let route = match self.routes.entry(name) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::channel();
                let route_name = entry.key().clone();
                let spawned = thread::Builder::new()
                    .name(format!("beam-hub-{route_name}"))
                    .spawn(move || route_loop(&route_name, rx));
                if let Err(err) = spawned {
                    warn!(name = %entry.key(), error = %err, "failed to start hub route");
                    return;
                }
                debug!(name = %entry.key(), "hub route created");
                entry.insert(tx)
            }
        };
        // The route thread only stops when its sender is dropped.
        let _ = route.send(offer);
    }
}

/// Pair queued clients with queued backends until one side runs dry.
fn route_loop(name: &str, offers: Receiver<Offer>) {
    let mut clients: VecDeque<Offer> = VecDeque::new();
    let mut backends: VecDeque<Offer> = VecDeque::new();

    for offer in offers {
        match offer.side {
            Side::Client => clients.push_back(offer),
            Side::Backend => backends.push_back(offer),
        }

        while !clients.is_empty() && !backends.is_empty() {
            let (Some(client), Some(backend)) = (clients.pop_front(), backends.pop_front()) else {
                break;
            };
            match join(&client, &backend) {
                Ok(()) => {
                    debug!(name, "client handed to backend");
                    backends.push_back(backend);
                }
                Err(Handoff::Backend(err)) => {
                    debug!(name, error = %err, "backend gone, retrying client");
                    clients.push_front(client);
                }
                Err(Handoff::Client(err)) => {
                    debug!(name, error = %err, "client gone, keeping backend");
                    backends.push_front(backend);
                }
                Err(Handoff::Pair(err)) => {
                    warn!(name, error = %err, "can't create connection pair");
                    clients.push_front(client);
                    backends.push_front(backend);
                    break;
                }
            }
        }
    }
    debug!(
        name,
        clients = clients.len(),
        backends = backends.len(),
        "hub route closed"
    );
}

fn join(client: &Offer, backend: &Offer) -> std::result::Result<(), Handoff> {
    let (a, b) = Conn::pair_with_config(client.conn.config().clone()).map_err(Handoff::Pair)?;
    backend
        .conn
        .send(&client.data, &[a.as_fd()])
        .map_err(Handoff::Backend)?;
    client
        .conn
        .send(&backend.data, &[b.as_fd()])
        .map_err(Handoff::Client)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Send `request` to the hub with a fresh connection attached and keep
    /// the local end.
    fn send_pipe(hub: &Conn, request: &str) -> Conn {
        let (local, remote) = Conn::pair().expect("pair should open");
        hub.send(request.as_bytes(), &[remote.as_fd()])
            .expect("hub request should send");
        local
    }

    fn take_conn(message: RawMessage) -> Conn {
        let fd = message
            .fds
            .into_iter()
            .next()
            .expect("handoff should carry a descriptor");
        Conn::from_owned_fd(fd, ConnConfig::default())
    }

    #[test]
    fn backend_then_client() {
        let hub = Hub::spawn().expect("hub should start");
        let backend = send_pipe(&hub, "expose foo");
        let client = send_pipe(&hub, "foo bar");

        let to_backend = backend.receive().expect("backend should get the client");
        assert_eq!(&to_backend.payload[..], b"foo bar");
        let to_client = client.receive().expect("client should get the backend");
        assert_eq!(&to_client.payload[..], b"expose foo");

        let backend_side = take_conn(to_backend);
        let client_side = take_conn(to_client);
        client_side.send(b"ping", &[]).unwrap();
        let ping = backend_side.receive().unwrap();
        assert_eq!(&ping.payload[..], b"ping");
    }

    #[test]
    fn ten_clients_share_one_backend() {
        let hub = Hub::spawn().expect("hub should start");
        let clients: Vec<Conn> = (0..10)
            .map(|i| send_pipe(&hub, &format!("foo {i}")))
            .collect();
        let backend = send_pipe(&hub, "expose foo");

        let served: Vec<String> = (0..10)
            .map(|_| {
                let message = backend.receive().expect("backend should be reused");
                String::from_utf8(message.payload.to_vec()).unwrap()
            })
            .collect();
        let expected: Vec<String> = (0..10).map(|i| format!("foo {i}")).collect();
        assert_eq!(served, expected);

        for client in &clients {
            let message = client.receive().expect("every client should be served");
            assert_eq!(&message.payload[..], b"expose foo");
            assert_eq!(message.fds.len(), 1);
        }
    }

    #[test]
    fn dead_backend_is_skipped() {
        let hub = Hub::spawn().expect("hub should start");
        let gone = send_pipe(&hub, "expose foo first");
        drop(gone);
        let _live = send_pipe(&hub, "expose foo second");

        let client = send_pipe(&hub, "foo");
        let message = client.receive().expect("client should reach the live backend");
        assert_eq!(&message.payload[..], b"expose foo second");
    }

    #[test]
    fn expose_without_name_is_refused() {
        let hub = Hub::spawn().expect("hub should start");
        let backend = send_pipe(&hub, "expose");
        let err = backend.receive().expect_err("hub should close the descriptor");
        assert!(err.is_shutdown());
    }

    #[test]
    fn unserved_client_is_closed_with_the_hub() {
        let hub = Hub::spawn().expect("hub should start");
        let client = send_pipe(&hub, "nobody home");
        drop(hub);

        let err = client.receive().expect_err("no backend should answer");
        assert!(err.is_shutdown());
    }
}
