// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Execution units (isolated schedulable contexts)
//! OWNERS: @runtime
//!
//! A unit owns no memory shared with other units; the only things crossing a
//! unit boundary are messages over channels. Terminating a unit closes every
//! channel it takes part in, which unblocks any of its threads parked in a
//! channel operation with [`Error::Interrupted`]. Other blocking primitives
//! (the portal registry) register a termination hook to be woken as well.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::channel;
use crate::config::TransportConfig;
use crate::{Error, Result};

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of an execution unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(u64);

impl UnitId {
    /// Exposes the raw numeric value.
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit#{}", self.0)
    }
}

/// Lifecycle of a unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitState {
    /// Constructed, not yet started.
    Created,
    /// Started and able to own channels.
    Running,
    /// Terminated; never runs again.
    Terminated,
}

type TerminationHook = Box<dyn FnOnce() + Send>;

struct Core {
    state: UnitState,
    channels: Vec<Weak<channel::Shared>>,
    hooks: Vec<TerminationHook>,
}

struct Inner {
    id: UnitId,
    name: String,
    config: TransportConfig,
    core: Mutex<Core>,
}

/// Handle to an execution unit. Clones refer to the same unit.
#[derive(Clone)]
pub struct Unit {
    inner: Arc<Inner>,
}

impl Unit {
    /// Creates a unit in the [`UnitState::Created`] state.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, TransportConfig::default())
    }

    /// Creates a unit whose spawned threads and outgoing channels follow `config`.
    pub fn with_config(name: impl Into<String>, config: TransportConfig) -> Self {
        let id = UnitId(NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            inner: Arc::new(Inner {
                id,
                name: name.into(),
                config,
                core: Mutex::new(Core { state: UnitState::Created, channels: Vec::new(), hooks: Vec::new() }),
            }),
        }
    }

    /// Returns the unit identifier.
    pub fn id(&self) -> UnitId {
        self.inner.id
    }

    /// Returns the human readable name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the transport configuration this unit was created with.
    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> UnitState {
        self.inner.core.lock().state
    }

    /// Returns `true` while the unit is started and not terminated.
    pub fn is_running(&self) -> bool {
        self.state() == UnitState::Running
    }

    /// Returns `true` once the unit has terminated.
    pub fn is_terminated(&self) -> bool {
        self.state() == UnitState::Terminated
    }

    /// Moves the unit from `Created` to `Running`.
    pub fn start(&self) -> Result<()> {
        let mut core = self.inner.core.lock();
        match core.state {
            UnitState::Created => {
                core.state = UnitState::Running;
                log::debug!("{} ({}) started", self.inner.id, self.inner.name);
                Ok(())
            }
            UnitState::Running => Err(Error::illegal(format!("{} already started", self.inner.id))),
            UnitState::Terminated => Err(Error::illegal(format!("{} terminated", self.inner.id))),
        }
    }

    /// Terminates the unit and closes every channel it takes part in. Idempotent.
    pub fn terminate(&self) {
        let (channels, hooks) = {
            let mut core = self.inner.core.lock();
            if core.state == UnitState::Terminated {
                return;
            }
            core.state = UnitState::Terminated;
            (std::mem::take(&mut core.channels), std::mem::take(&mut core.hooks))
        };
        log::debug!("{} ({}) terminated; closing {} channel(s)", self.inner.id, self.inner.name, channels.len());
        for shared in channels.iter().filter_map(Weak::upgrade) {
            shared.close();
        }
        // Hooks run without the unit lock held; they may take their own locks.
        for hook in hooks {
            hook();
        }
    }

    /// Runs `f` on a dedicated thread acting as this unit.
    pub fn spawn<F, T>(&self, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce(Unit) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_running()?;
        let mut builder = thread::Builder::new().name(format!("{}-{}", self.inner.name, self.inner.id.0));
        if let Some(size) = self.inner.config.thread_stack_size {
            builder = builder.stack_size(size);
        }
        let unit = self.clone();
        builder.spawn(move || f(unit)).map_err(|err| Error::Io(format!("spawn failed: {err}")))
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        match self.state() {
            UnitState::Running => Ok(()),
            UnitState::Created => Err(Error::illegal(format!("{} not started", self.inner.id))),
            UnitState::Terminated => Err(Error::illegal(format!("{} terminated", self.inner.id))),
        }
    }

    /// Runs `hook` once when the unit terminates.
    ///
    /// Fails with [`Error::Interrupted`] if the unit already terminated; the
    /// hook is dropped unrun in that case.
    pub(crate) fn on_terminate(&self, hook: TerminationHook) -> Result<()> {
        let mut core = self.inner.core.lock();
        if core.state == UnitState::Terminated {
            return Err(Error::Interrupted);
        }
        core.hooks.push(hook);
        Ok(())
    }

    /// Ties a channel's lifetime to this unit. Fails once the unit stopped running.
    pub(crate) fn attach(&self, shared: &Arc<channel::Shared>) -> Result<()> {
        let mut core = self.inner.core.lock();
        if core.state != UnitState::Running {
            return Err(Error::illegal(format!("{} not running", self.inner.id)));
        }
        core.channels.retain(|weak| weak.strong_count() > 0);
        core.channels.push(Arc::downgrade(shared));
        Ok(())
    }
}

impl PartialEq for Unit {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Unit {}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}
