// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Unidirectional channels between two execution units
//!
//! OWNERS: @runtime
//!
//! SECURITY INVARIANTS:
//!   - Only the designated sender unit may send; only the designated receiver may receive
//!   - A closed channel never reopens
//!   - Messages are delivered whole, in send order
//!
//! ERROR CONDITIONS:
//!   - Error::ClosedChannel: channel closed (receive: closed and drained)
//!   - Error::Interrupted: calling unit terminated (before or while blocked)
//!   - Error::IllegalState: caller is not the designated endpoint, or a unit is not running
//!   - Error::WouldBlock: `try_send` found the queue full
//!
//! Messages buffered before a close remain receivable; the duplex stream
//! relies on this to drain data ahead of the shutdown it observes.

use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::config::TransportConfig;
use crate::message::Message;
use crate::unit::{Unit, UnitId};
use crate::{Error, Result};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle identifying a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Exposes the raw numeric value.
    pub const fn value(self) -> u64 {
        self.0
    }
}

struct State {
    open: bool,
    queue: VecDeque<Message>,
}

pub(crate) struct Shared {
    id: ChannelId,
    sender: UnitId,
    receiver: UnitId,
    depth: usize,
    state: Mutex<State>,
    readable: Condvar,
    writable: Condvar,
}

impl Shared {
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        if !state.open {
            return;
        }
        state.open = false;
        drop(state);
        log::debug!("channel {} ({} -> {}) closed", self.id.0, self.sender, self.receiver);
        self.readable.notify_all();
        self.writable.notify_all();
    }
}

/// A unidirectional capability from one sender unit to one receiver unit.
///
/// Clones share the underlying channel; equality is by handle.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
}

impl Channel {
    /// Creates a channel using the sender unit's transport configuration.
    pub fn create(sender: &Unit, receiver: &Unit) -> Result<Self> {
        Self::create_with(sender, receiver, sender.config())
    }

    /// Creates a channel whose queue depth follows `config`.
    pub fn create_with(sender: &Unit, receiver: &Unit, config: &TransportConfig) -> Result<Self> {
        config.validate()?;
        sender.ensure_running()?;
        receiver.ensure_running()?;
        let shared = Arc::new(Shared {
            id: ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)),
            sender: sender.id(),
            receiver: receiver.id(),
            depth: config.queue_depth,
            state: Mutex::new(State { open: true, queue: VecDeque::new() }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        });
        // Either unit may terminate between the check above and here; attach
        // rechecks under the unit lock and the half-built channel is closed.
        let attached = sender.attach(&shared).and_then(|()| {
            if receiver == sender {
                Ok(())
            } else {
                receiver.attach(&shared)
            }
        });
        if let Err(err) = attached {
            shared.close();
            return Err(err);
        }
        log::debug!("channel {} created ({} -> {})", shared.id.0, shared.sender, shared.receiver);
        Ok(Self { shared })
    }

    /// Returns the channel handle.
    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    /// Returns the designated sender unit.
    pub fn sender(&self) -> UnitId {
        self.shared.sender
    }

    /// Returns the designated receiver unit.
    pub fn receiver(&self) -> UnitId {
        self.shared.receiver
    }

    /// Returns `true` until either side closes the channel or either unit terminates.
    pub fn is_open(&self) -> bool {
        self.shared.state.lock().open
    }

    /// Closes the channel permanently. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Sends `message`, blocking while the queue is full.
    pub fn send(&self, caller: &Unit, message: Message) -> Result<()> {
        self.check_caller(caller, self.shared.sender, "send")?;
        if caller.is_terminated() {
            return Err(Error::Interrupted);
        }
        let mut state = self.shared.state.lock();
        if !state.open {
            return Err(Error::ClosedChannel);
        }
        while state.open && state.queue.len() >= self.shared.depth {
            self.shared.writable.wait(&mut state);
            if caller.is_terminated() {
                return Err(Error::Interrupted);
            }
        }
        if !state.open {
            return Err(Error::ClosedChannel);
        }
        self.enqueue(&mut state, message);
        Ok(())
    }

    /// Sends `message` only if the queue has room.
    pub fn try_send(&self, caller: &Unit, message: Message) -> Result<()> {
        self.check_caller(caller, self.shared.sender, "send")?;
        let mut state = self.shared.state.lock();
        if !state.open {
            return Err(Error::ClosedChannel);
        }
        if state.queue.len() >= self.shared.depth {
            return Err(Error::WouldBlock);
        }
        self.enqueue(&mut state, message);
        Ok(())
    }

    /// Receives the next message, blocking until one is available.
    pub fn receive(&self, caller: &Unit) -> Result<Message> {
        self.check_caller(caller, self.shared.receiver, "receive")?;
        if caller.is_terminated() {
            return Err(Error::Interrupted);
        }
        let mut state = self.shared.state.lock();
        loop {
            if let Some(message) = state.queue.pop_front() {
                drop(state);
                self.shared.writable.notify_one();
                log::trace!("channel {} delivered message", self.shared.id.0);
                return Ok(message);
            }
            if !state.open {
                return Err(Error::ClosedChannel);
            }
            self.shared.readable.wait(&mut state);
            if caller.is_terminated() {
                return Err(Error::Interrupted);
            }
        }
    }

    fn enqueue(&self, state: &mut State, message: Message) {
        state.queue.push_back(message);
        self.shared.readable.notify_one();
        log::trace!("channel {} accepted message ({} queued)", self.shared.id.0, state.queue.len());
    }

    fn check_caller(&self, caller: &Unit, expected: UnitId, op: &str) -> Result<()> {
        if caller.id() == expected {
            Ok(())
        } else {
            Err(Error::illegal(format!(
                "{} may not {op} on channel {} (designated {expected})",
                caller.id(),
                self.shared.id.0
            )))
        }
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for Channel {}

impl Hash for Channel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shared.id.hash(state);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id.0)
            .field("sender", &self.shared.sender)
            .field("receiver", &self.shared.receiver)
            .finish()
    }
}
