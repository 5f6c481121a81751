// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host pipe broker pairing pipe clients with registered servers
//! OWNERS: @runtime
//!
//! Accept handshake (broker unit -> server unit, over a fresh accept channel):
//!   1. Data: UTF-8 server version requested by the client
//!   2. Capability: channel client -> server (server inbound)
//!   3. Capability: channel server -> client (server outbound)
//! The broker closes the accept channel afterwards; closing it early (server
//! close, unit termination) aborts a pending accept with `ClosedChannel`.
//!
//! ERROR CONDITIONS:
//!   - Error::ConnectionNotFound: no compatible server, server not accepting, unknown server id
//!   - Error::InvalidArgument: malformed version string
//!   - Error::IllegalState: accept by a foreign unit or while another accept is pending

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use nexus_ipc::{Broker, Channel, Error, Message, Result, ServerId, Transfer, TransportConfig, Unit};
use parking_lot::Mutex;

use crate::version::Version;

/// Well-known id the pipe broker registers under.
pub const PIPE_SERVICE_ID: &str = "nexus.pipe";

struct ServerEndpoint {
    name: String,
    version_text: String,
    version: Version,
    unit: Unit,
    accept: Option<Channel>,
}

/// In-memory broker acting as its own execution unit.
pub struct PipeService {
    unit: Unit,
    config: TransportConfig,
    next_id: AtomicU64,
    servers: Mutex<BTreeMap<ServerId, ServerEndpoint>>,
}

impl PipeService {
    /// Creates a broker operating as `unit`, which must be running.
    pub fn new(unit: Unit) -> Result<Self> {
        Self::with_config(unit, TransportConfig::default())
    }

    /// Creates a broker whose channels follow `config`.
    pub fn with_config(unit: Unit, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        if !unit.is_running() {
            return Err(Error::IllegalState(format!("{} not running", unit.id())));
        }
        Ok(Self { unit, config, next_id: AtomicU64::new(1), servers: Mutex::new(BTreeMap::new()) })
    }

    /// Publishes this broker in `directory` under [`PIPE_SERVICE_ID`].
    pub fn register_service(
        self: &std::sync::Arc<Self>,
        directory: &crate::Registry,
    ) -> crate::Result<crate::ServiceHandle> {
        directory.register(PIPE_SERVICE_ID, std::sync::Arc::clone(self) as std::sync::Arc<dyn Broker>)
    }

    /// Number of registered servers.
    pub fn server_count(&self) -> usize {
        self.servers.lock().len()
    }

    /// Returns `true` while `server` has an accept pending.
    pub fn is_accepting(&self, server: ServerId) -> bool {
        self.servers
            .lock()
            .get(&server)
            .is_some_and(|endpoint| endpoint.accept.as_ref().is_some_and(Channel::is_open))
    }

    fn channel(&self, sender: &Unit, receiver: &Unit) -> Result<Channel> {
        Channel::create_with(sender, receiver, &self.config)
    }

    /// Picks the first live, version-compatible server named `name`; prunes dead ones.
    fn find_server(&self, name: &str, requested: Version) -> Result<(ServerId, String, Unit, Channel)> {
        let mut servers = self.servers.lock();
        servers.retain(|id, server| {
            let alive = !server.unit.is_terminated();
            if !alive {
                log::warn!("pipe: pruning server {} ({}) of terminated {}", id.value(), server.name, server.unit.id());
            }
            alive
        });
        let (id, server) = servers
            .iter_mut()
            .find(|(_, server)| server.name == name && server.version.satisfies(requested))
            .ok_or_else(|| Error::ConnectionNotFound("no pipe server found for given request".into()))?;
        match server.accept.take() {
            Some(accept) if accept.is_open() => Ok((*id, server.version_text.clone(), server.unit.clone(), accept)),
            _ => Err(Error::ConnectionNotFound("server is not accepting connections".into())),
        }
    }

    /// Hands an untouched accept channel back to its server, or closes it when
    /// the server is gone or already waits on a newer one.
    fn restore_accept(&self, server: ServerId, accept: Channel) {
        let mut servers = self.servers.lock();
        match servers.get_mut(&server) {
            Some(endpoint) if endpoint.accept.is_none() => endpoint.accept = Some(accept),
            _ => accept.close(),
        }
    }

    fn expect_channel(accept: &Channel, unit: &Unit) -> Result<Channel> {
        match accept.receive(unit)? {
            Message::Capability(channel) => Ok(channel),
            other => Err(Error::Io(format!("pipe accept: expected channel capability, got {other:?}"))),
        }
    }
}

impl Broker for PipeService {
    fn bind_server(&self, unit: &Unit, name: &str, version: &str) -> Result<ServerId> {
        let parsed: Version = version.parse()?;
        if !unit.is_running() {
            return Err(Error::IllegalState(format!("{} not running", unit.id())));
        }
        let id = ServerId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.servers.lock().insert(
            id,
            ServerEndpoint {
                name: name.to_string(),
                version_text: version.to_string(),
                version: parsed,
                unit: unit.clone(),
                accept: None,
            },
        );
        log::debug!("pipe: bound server {name} {version} as {} for {}", id.value(), unit.id());
        Ok(id)
    }

    fn accept_by_server(&self, unit: &Unit, server: ServerId) -> Result<Transfer> {
        let (accept, name, version_text) = {
            let mut servers = self.servers.lock();
            let endpoint = servers
                .get_mut(&server)
                .ok_or_else(|| Error::ConnectionNotFound(format!("no such pipe server {}", server.value())))?;
            if endpoint.unit != *unit {
                return Err(Error::IllegalState(format!("{} does not own pipe server {}", unit.id(), server.value())));
            }
            if endpoint.accept.as_ref().is_some_and(Channel::is_open) {
                return Err(Error::IllegalState(format!("accept already pending on {}", server.value())));
            }
            let accept = self.channel(&self.unit, unit)?;
            endpoint.accept = Some(accept.clone());
            (accept, endpoint.name.clone(), endpoint.version_text.clone())
        };
        log::debug!("pipe: server {} waiting for a client", server.value());

        let requested = match accept.receive(unit)? {
            Message::Data(payload) => String::from_utf8(payload.as_slice().to_vec())
                .map_err(|_| Error::Io("pipe accept: requested version is not UTF-8".into()))?,
            other => return Err(Error::Io(format!("pipe accept: expected version data, got {other:?}"))),
        };
        let inbound = Self::expect_channel(&accept, unit)?;
        let outbound = Self::expect_channel(&accept, unit)?;
        log::debug!("pipe: server {} accepted client asking for {requested}", server.value());
        Ok(Transfer::new(inbound, outbound, name, requested, version_text))
    }

    fn close_server(&self, server: ServerId) -> Result<()> {
        let endpoint = self
            .servers
            .lock()
            .remove(&server)
            .ok_or_else(|| Error::ConnectionNotFound(format!("no such pipe server {}", server.value())))?;
        if let Some(accept) = endpoint.accept {
            accept.close();
        }
        log::debug!("pipe: closed server {} ({})", server.value(), endpoint.name);
        Ok(())
    }

    fn bind_client(&self, unit: &Unit, name: &str, version: &str) -> Result<Transfer> {
        let requested: Version = version.parse()?;
        let (server, server_version, server_unit, accept) = self.find_server(name, requested)?;

        // Nothing was sent yet, so a failure here leaves the server accepting.
        let channels = self
            .channel(&server_unit, unit)
            .and_then(|to_client| match self.channel(unit, &server_unit) {
                Ok(from_client) => Ok((to_client, from_client)),
                Err(err) => {
                    to_client.close();
                    Err(err)
                }
            });
        let (to_client, from_client) = match channels {
            Ok(pair) => pair,
            Err(err) => {
                self.restore_accept(server, accept);
                return Err(err);
            }
        };
        let handshake = [
            Message::from_bytes(version.as_bytes()),
            Message::Capability(from_client.clone()),
            Message::Capability(to_client.clone()),
        ];
        for message in handshake {
            if let Err(err) = accept.send(&self.unit, message) {
                to_client.close();
                from_client.close();
                accept.close();
                return Err(err);
            }
        }
        accept.close();
        log::debug!("pipe: connected {} to {name} {server_version}", unit.id());
        Ok(Transfer::new(to_client, from_client, name, version, server_version))
    }
}
