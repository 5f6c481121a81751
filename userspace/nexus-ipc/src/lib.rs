// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cross-unit message passing and pipe streams
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests per module + integration tests under tests/
//!
//! PUBLIC API:
//!   - Unit: isolated execution unit with a Created/Running/Terminated lifecycle
//!   - Channel: unidirectional capability between one sender and one receiver unit
//!   - Message: closed set of payloads (bytes, channel capability, command)
//!   - PortalRegistry: bootstrap table handing initial channels to a new unit
//!   - DuplexStream: ordered byte stream over an inbound/outbound channel pair
//!   - PipeServer / Broker / connect(): named server binding and client connect
//!   - TransportConfig: channel queue depth and unit thread settings
//!   - Error: error taxonomy shared by every operation
//!
//! DEPENDENCIES:
//!   - parking_lot: Mutex/Condvar hand-off for every blocking primitive
//!   - thiserror: error derive
//!   - serde + toml: transport configuration
//!   - log: lifecycle diagnostics
//!

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

use std::io;

pub mod binding;
pub mod channel;
pub mod config;
pub mod message;
pub mod portal;
pub mod stream;
pub mod unit;

pub use binding::{connect, Broker, PipeServer, ServerId, Transfer};
pub use channel::{Channel, ChannelId};
pub use config::TransportConfig;
pub use message::{Command, Message, Payload, CLOSE_OUTPUT_TOKEN};
pub use portal::PortalRegistry;
pub use stream::{DuplexStream, Mode};
pub use unit::{Unit, UnitId, UnitState};

/// Result type returned by IPC operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced by the IPC runtime.
///
/// Values are `Clone` so a stream can cache its first terminal failure and
/// replay it to every later reader.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The channel is permanently closed.
    #[error("channel closed")]
    ClosedChannel,
    /// The calling unit terminated while the call was blocked.
    #[error("blocking call interrupted")]
    Interrupted,
    /// API misuse: wrong calling unit, unit not running, wrong message variant.
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// A data message range does not fit its buffer.
    #[error("range {offset}+{length} outside buffer of {capacity} bytes")]
    IndexRange {
        /// Requested start offset.
        offset: usize,
        /// Requested length.
        length: usize,
        /// Length of the backing buffer.
        capacity: usize,
    },
    /// Generic transport or protocol failure.
    #[error("i/o failure: {0}")]
    Io(String),
    /// A non-blocking operation could not make progress.
    #[error("operation would block")]
    WouldBlock,
    /// No server matched a client bind request.
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),
    /// Caller supplied a malformed argument (e.g. a server version string).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Transport configuration could not be loaded or failed validation.
    #[error("invalid transport config: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn illegal(what: impl Into<String>) -> Self {
        Self::IllegalState(what.into())
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::ClosedChannel => io::ErrorKind::BrokenPipe,
            // Not ErrorKind::Interrupted: std retries those, and a cached
            // terminal status would be replayed forever.
            Error::Interrupted => io::ErrorKind::ConnectionAborted,
            Error::WouldBlock => io::ErrorKind::WouldBlock,
            Error::ConnectionNotFound(_) => io::ErrorKind::NotFound,
            Error::IndexRange { .. } | Error::InvalidArgument(_) | Error::Config(_) => {
                io::ErrorKind::InvalidInput
            }
            Error::IllegalState(_) | Error::Io(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
