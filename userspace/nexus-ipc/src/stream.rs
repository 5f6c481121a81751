// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Duplex byte stream over a channel pair ("pipe")
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! A stream pairs one inbound and one outbound [`Channel`]. Each `write` is one
//! `Data` message; a receiver task turns inbound messages into a FIFO of byte
//! chunks that `read` drains with a cursor, so byte order always matches the
//! peer's write order regardless of chunk sizes on either side.
//!
//! Shutdown handshake: `close_output` offers the close-output sentinel and then
//! closes the outbound channel. The peer's receiver reports EOF on either the
//! sentinel or the channel closing (after draining buffered data).
//!
//! INVARIANTS:
//!   - The first terminal status observed is cached and replayed to every later read
//!   - Write-closed is irreversible and reached only after the sentinel was offered
//!   - `read` returns `None` (EOF) only once every buffered byte has been consumed

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::binding::Transfer;
use crate::channel::Channel;
use crate::message::{Command, Message};
use crate::unit::Unit;
use crate::{Error, Result};

/// Directions a stream is opened for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Inbound only.
    Read,
    /// Outbound only.
    Write,
    /// Both directions.
    ReadWrite,
}

impl Mode {
    /// Returns `true` when the mode includes reading.
    pub const fn readable(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    /// Returns `true` when the mode includes writing.
    pub const fn writable(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Status {
    Open,
    Eof,
    Failed(Error),
}

struct Inbox {
    chunks: VecDeque<Arc<[u8]>>,
    cursor: usize,
    buffered: usize,
    status: Status,
    read_open: bool,
}

impl Inbox {
    /// Records `status` unless a terminal status is already cached.
    fn settle(&mut self, status: Status) {
        if self.status == Status::Open {
            self.status = status;
        }
    }

    fn drain_into(&mut self, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < buf.len() {
            let Some(head) = self.chunks.front() else { break };
            let available = &head[self.cursor..];
            let take = available.len().min(buf.len() - copied);
            buf[copied..copied + take].copy_from_slice(&available[..take]);
            copied += take;
            self.cursor += take;
            if self.cursor == head.len() {
                self.chunks.pop_front();
                self.cursor = 0;
            }
        }
        self.buffered -= copied;
        copied
    }
}

struct Shared {
    inbox: Mutex<Inbox>,
    arrived: Condvar,
}

/// Bidirectional byte stream built from an inbound and an outbound channel.
pub struct DuplexStream {
    unit: Unit,
    mode: Mode,
    inbound: Channel,
    outbound: Channel,
    server_name: String,
    requested_version: String,
    server_version: String,
    shared: Arc<Shared>,
    write_open: Mutex<bool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl DuplexStream {
    /// Takes the channel pair from `transfer` and opens the stream for `mode`.
    ///
    /// `unit` must be the inbound channel's receiver and the outbound channel's
    /// sender. A readable stream starts its receiver task on `unit`.
    pub fn establish(unit: &Unit, transfer: Transfer, mode: Mode) -> Result<Self> {
        let (inbound, outbound) = (transfer.inbound_channel(), transfer.outbound_channel());
        if inbound.receiver() != unit.id() || outbound.sender() != unit.id() {
            return Err(Error::illegal(format!("{} does not own the transfer channels", unit.id())));
        }
        let shared = Arc::new(Shared {
            inbox: Mutex::new(Inbox {
                chunks: VecDeque::new(),
                cursor: 0,
                buffered: 0,
                status: Status::Open,
                read_open: mode.readable(),
            }),
            arrived: Condvar::new(),
        });
        let receiver = if mode.readable() {
            let task_shared = Arc::clone(&shared);
            let task_inbound = inbound.clone();
            Some(unit.spawn(move |me| receive_loop(&me, &task_inbound, &task_shared))?)
        } else {
            None
        };
        log::debug!(
            "{}: stream established on {} mode={mode:?} (in={}, out={})",
            unit.id(),
            transfer.server_name(),
            inbound.id().value(),
            outbound.id().value()
        );
        Ok(Self {
            unit: unit.clone(),
            mode,
            inbound,
            outbound,
            server_name: transfer.server_name().to_string(),
            requested_version: transfer.requested_version().to_string(),
            server_version: transfer.server_version().to_string(),
            shared,
            write_open: Mutex::new(mode.writable()),
            receiver: Mutex::new(receiver),
        })
    }

    /// Returns the mode the stream was opened with.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Name of the pipe server this stream belongs to.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Server version requested by the client.
    pub fn requested_version(&self) -> &str {
        &self.requested_version
    }

    /// Version the server registered with.
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Number of received bytes not yet read.
    pub fn available(&self) -> usize {
        self.shared.inbox.lock().buffered
    }

    /// Reads into `buf`; `Ok(None)` signals end of stream.
    ///
    /// Blocks only while nothing is buffered and no terminal status exists.
    /// Returns as soon as at least one byte was copied.
    pub fn read(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        if !self.mode.readable() {
            return Err(Error::illegal("stream not opened for reading"));
        }
        let mut inbox = self.shared.inbox.lock();
        if !inbox.read_open {
            return replay(&inbox.status);
        }
        if buf.is_empty() {
            return Ok(Some(0));
        }
        while inbox.chunks.is_empty() && inbox.status == Status::Open {
            self.shared.arrived.wait(&mut inbox);
            if !inbox.read_open {
                break;
            }
        }
        if inbox.chunks.is_empty() {
            let status = inbox.status.clone();
            drop(inbox);
            self.close_input();
            return replay(&status);
        }
        Ok(Some(inbox.drain_into(buf)))
    }

    /// Sends all of `buf` as one message; either everything is transmitted or an error is returned.
    pub fn write(&self, buf: &[u8]) -> Result<()> {
        if !self.mode.writable() {
            return Err(Error::illegal("stream not opened for writing"));
        }
        if !*self.write_open.lock() {
            return Err(Error::Io("output stream closed".into()));
        }
        if buf.is_empty() {
            return Ok(());
        }
        self.outbound.send(&self.unit, Message::from_bytes(buf))
    }

    /// Signals end of output to the peer and closes the outbound channel. Idempotent.
    ///
    /// A stream never opened for writing only closes the channel.
    pub fn close_output(&self) {
        let mut write_open = self.write_open.lock();
        if self.mode.writable() && self.outbound.is_open() {
            // Best effort: when the queue is full the peer observes the
            // channel closing instead, which it also reads as EOF.
            if let Err(err) = self.outbound.try_send(&self.unit, Message::close_output()) {
                log::debug!("{}: close-output sentinel not delivered: {err}", self.unit.id());
            }
        }
        *write_open = false;
        self.outbound.close();
    }

    /// Stops reading and closes the inbound channel. Idempotent.
    pub fn close_input(&self) {
        let mut inbox = self.shared.inbox.lock();
        inbox.read_open = false;
        inbox.settle(Status::Failed(Error::Io("input closed locally".into())));
        drop(inbox);
        self.shared.arrived.notify_all();
        self.inbound.close();
    }

    /// Closes both directions and waits for the receiver task to exit. Idempotent.
    pub fn close(&self) {
        self.close_input();
        self.close_output();
        let handle = self.receiver.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::warn!("{}: stream receiver panicked", self.unit.id());
            }
        }
    }
}

impl Drop for DuplexStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for DuplexStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexStream")
            .field("unit", &self.unit.id())
            .field("mode", &self.mode)
            .field("inbound", &self.inbound.id())
            .field("outbound", &self.outbound.id())
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl io::Read for &DuplexStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(DuplexStream::read(self, buf)?.unwrap_or(0))
    }
}

impl io::Write for &DuplexStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        DuplexStream::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn replay(status: &Status) -> Result<Option<usize>> {
    match status {
        Status::Eof => Ok(None),
        Status::Failed(err) => Err(err.clone()),
        Status::Open => Err(Error::illegal("input closed")),
    }
}

fn receive_loop(unit: &Unit, inbound: &Channel, shared: &Shared) {
    log::debug!("{}: receiver started on channel {}", unit.id(), inbound.id().value());
    loop {
        let outcome = match inbound.receive(unit) {
            Ok(Message::Data(payload)) => {
                let chunk = payload.to_shared();
                let mut inbox = shared.inbox.lock();
                if !inbox.read_open {
                    None
                } else {
                    if !chunk.is_empty() {
                        inbox.buffered += chunk.len();
                        inbox.chunks.push_back(chunk);
                        drop(inbox);
                        shared.arrived.notify_all();
                    }
                    continue;
                }
            }
            Ok(Message::Command(Command::CloseOutput)) => Some(Status::Eof),
            Ok(Message::Command(Command::Other(text))) => {
                Some(Status::Failed(Error::Io(format!("unsupported command: {text}"))))
            }
            Ok(Message::Capability(channel)) => Some(Status::Failed(Error::illegal(format!(
                "unexpected channel capability {} on byte stream",
                channel.id().value()
            )))),
            // Channel closure is the ordinary end of the shutdown handshake.
            Err(Error::ClosedChannel) => Some(Status::Eof),
            Err(err) => Some(Status::Failed(err)),
        };
        let mut inbox = shared.inbox.lock();
        if let Some(status) = outcome {
            if let Status::Failed(err) = &status {
                if inbox.read_open {
                    log::warn!("{}: receiver stopped: {err}", unit.id());
                }
            }
            inbox.settle(status);
        }
        drop(inbox);
        shared.arrived.notify_all();
        break;
    }
    log::debug!("{}: receiver finished", unit.id());
}
