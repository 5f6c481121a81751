// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Pipe server binding and client connect over a broker
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - trait Broker: name/version resolution collaborator (host impl lives in samgr)
//!   - struct Transfer: inbound/outbound channel pair handed out by the broker
//!   - struct PipeServer: registered server producing one stream per accepted client
//!   - connect(): client side bind + establish
//!
//! The broker decides which server a client reaches and creates the channel
//! pair; this module only turns its transfers into established streams.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::stream::{DuplexStream, Mode};
use crate::unit::Unit;
use crate::{Error, Result};

/// Broker-assigned identifier of a registered server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerId(u64);

impl ServerId {
    /// Wraps a raw identifier issued by a broker.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Exposes the raw numeric value.
    pub const fn value(self) -> u64 {
        self.0
    }
}

/// Channel pair scoped to one connected peer, as seen from the local unit.
#[derive(Clone)]
pub struct Transfer {
    inbound: Channel,
    outbound: Channel,
    server_name: String,
    requested_version: String,
    server_version: String,
}

impl Transfer {
    /// Creates a transfer context.
    pub fn new(
        inbound: Channel,
        outbound: Channel,
        server_name: impl Into<String>,
        requested_version: impl Into<String>,
        server_version: impl Into<String>,
    ) -> Self {
        Self {
            inbound,
            outbound,
            server_name: server_name.into(),
            requested_version: requested_version.into(),
            server_version: server_version.into(),
        }
    }

    /// Channel the local unit receives on.
    pub fn inbound_channel(&self) -> Channel {
        self.inbound.clone()
    }

    /// Channel the local unit sends on.
    pub fn outbound_channel(&self) -> Channel {
        self.outbound.clone()
    }

    /// Name of the server.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Version requested by the client.
    pub fn requested_version(&self) -> &str {
        &self.requested_version
    }

    /// Version the server registered with.
    pub fn server_version(&self) -> &str {
        &self.server_version
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("inbound", &self.inbound.id())
            .field("outbound", &self.outbound.id())
            .field("server_name", &self.server_name)
            .field("requested_version", &self.requested_version)
            .finish()
    }
}

/// Resolves server names to channel pairs.
pub trait Broker: Send + Sync {
    /// Registers `unit` as the server `name` at `version`.
    fn bind_server(&self, unit: &Unit, name: &str, version: &str) -> Result<ServerId>;

    /// Blocks until a client binds to `server`, returning the server-side transfer.
    fn accept_by_server(&self, unit: &Unit, server: ServerId) -> Result<Transfer>;

    /// Unregisters `server`, aborting a pending accept.
    fn close_server(&self, server: ServerId) -> Result<()>;

    /// Connects `unit` to a server matching `name` and `version`, returning the client-side transfer.
    fn bind_client(&self, unit: &Unit, name: &str, version: &str) -> Result<Transfer>;
}

/// A registered pipe server.
pub struct PipeServer {
    broker: Arc<dyn Broker>,
    unit: Unit,
    id: ServerId,
    name: String,
    version: String,
    mode: Mode,
    closed: AtomicBool,
    accept_lock: Mutex<()>,
}

impl PipeServer {
    /// Registers `name`/`version` with `broker` on behalf of `unit`.
    pub fn register(
        broker: Arc<dyn Broker>,
        unit: &Unit,
        name: &str,
        version: &str,
        mode: Mode,
    ) -> Result<Self> {
        unit.ensure_running()?;
        let id = broker.bind_server(unit, name, version)?;
        log::debug!("{}: pipe server {name} {version} registered as {}", unit.id(), id.0);
        Ok(Self {
            broker,
            unit: unit.clone(),
            id,
            name: name.to_string(),
            version: version.to_string(),
            mode,
            closed: AtomicBool::new(false),
            accept_lock: Mutex::new(()),
        })
    }

    /// Broker-assigned server id.
    pub fn id(&self) -> ServerId {
        self.id
    }

    /// Registered server name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registered server version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Blocks until a client connects and returns the established stream.
    ///
    /// Concurrent callers are served one at a time.
    pub fn accept_and_open(&self) -> Result<DuplexStream> {
        let _serial = self.accept_lock.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::illegal(format!("pipe server {} closed", self.name)));
        }
        let transfer = self.broker.accept_by_server(&self.unit, self.id)?;
        log::debug!("{}: pipe server {} accepted a client", self.unit.id(), self.name);
        DuplexStream::establish(&self.unit, transfer, self.mode)
    }

    /// Unregisters the server; pending and later accepts fail. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log::debug!("{}: pipe server {} closing", self.unit.id(), self.name);
        self.broker.close_server(self.id)
    }
}

impl Drop for PipeServer {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::debug!("pipe server {} close on drop: {err}", self.name);
        }
    }
}

impl fmt::Debug for PipeServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeServer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Connects `unit` to the server `name`/`version` and establishes a stream.
pub fn connect(broker: &dyn Broker, unit: &Unit, name: &str, version: &str, mode: Mode) -> Result<DuplexStream> {
    unit.ensure_running()?;
    let transfer = broker.bind_client(unit, name, version)?;
    DuplexStream::establish(unit, transfer, mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Broker with exactly one pre-wired connection and no name resolution.
    struct OneShot {
        server_side: Mutex<Option<Transfer>>,
        client_side: Mutex<Option<Transfer>>,
        closed: AtomicBool,
    }

    impl Broker for OneShot {
        fn bind_server(&self, _unit: &Unit, _name: &str, _version: &str) -> Result<ServerId> {
            Ok(ServerId::new(7))
        }

        fn accept_by_server(&self, _unit: &Unit, _server: ServerId) -> Result<Transfer> {
            self.server_side.lock().take().ok_or(Error::ClosedChannel)
        }

        fn close_server(&self, _server: ServerId) -> Result<()> {
            self.closed.store(true, Ordering::Release);
            Ok(())
        }

        fn bind_client(&self, _unit: &Unit, _name: &str, _version: &str) -> Result<Transfer> {
            self.client_side
                .lock()
                .take()
                .ok_or_else(|| Error::ConnectionNotFound("no pipe server found for given request".into()))
        }
    }

    fn running(name: &str) -> Unit {
        let unit = Unit::new(name);
        unit.start().unwrap();
        unit
    }

    fn one_shot(client: &Unit, server: &Unit) -> Arc<OneShot> {
        let to_server = Channel::create(client, server).unwrap();
        let to_client = Channel::create(server, client).unwrap();
        Arc::new(OneShot {
            server_side: Mutex::new(Some(Transfer::new(to_server.clone(), to_client.clone(), "echo", "1.0", "1.2"))),
            client_side: Mutex::new(Some(Transfer::new(to_client, to_server, "echo", "1.0", "1.2"))),
            closed: AtomicBool::new(false),
        })
    }

    #[test]
    fn accept_and_connect_produce_linked_streams() {
        let (client_unit, server_unit) = (running("client"), running("server"));
        let broker = one_shot(&client_unit, &server_unit);
        let server = PipeServer::register(broker.clone(), &server_unit, "echo", "1.2", Mode::ReadWrite).unwrap();

        let accepted = thread::spawn(move || {
            let stream = server.accept_and_open().unwrap();
            let mut buf = [0u8; 16];
            let n = stream.read(&mut buf).unwrap().unwrap();
            stream.write(&buf[..n]).unwrap();
            stream.close_output();
            stream
        });

        let client = connect(broker.as_ref(), &client_unit, "echo", "1.0", Mode::ReadWrite).unwrap();
        assert_eq!(client.server_name(), "echo");
        assert_eq!(client.server_version(), "1.2");
        client.write(b"ping").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).unwrap(), Some(4));
        assert_eq!(&buf[..4], b"ping");
        assert_eq!(client.read(&mut buf).unwrap(), None);
        drop(accepted.join().unwrap());
        assert!(broker.closed.load(Ordering::Acquire));
    }

    #[test]
    fn closed_server_rejects_accept() {
        let (client_unit, server_unit) = (running("client"), running("server"));
        let broker = one_shot(&client_unit, &server_unit);
        let server = PipeServer::register(broker.clone(), &server_unit, "echo", "1.2", Mode::ReadWrite).unwrap();
        server.close().unwrap();
        server.close().unwrap();
        assert!(matches!(server.accept_and_open(), Err(Error::IllegalState(_))));
    }

    #[test]
    fn connect_surfaces_broker_failure() {
        let (client_unit, server_unit) = (running("client"), running("server"));
        let broker = one_shot(&client_unit, &server_unit);
        broker.client_side.lock().take();
        let err = connect(broker.as_ref(), &client_unit, "echo", "1.0", Mode::ReadWrite).unwrap_err();
        assert!(matches!(err, Error::ConnectionNotFound(_)));
    }
}
