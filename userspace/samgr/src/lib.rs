// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Userspace service manager: service directory plus the host pipe broker.
//!
//! The [`Registry`] maps well-known service ids to brokers so a client unit
//! can locate the pipe service without ambient globals. [`PipeService`] is the
//! in-memory broker that pairs pipe clients with registered pipe servers.

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

pub mod cli;
pub mod pipe;
pub mod version;

pub use cli::{execute, help, run};
pub use pipe::{PipeService, PIPE_SERVICE_ID};
pub use version::Version;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nexus_ipc::Broker;
use parking_lot::Mutex;

/// Result alias for service directory operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced by the service directory.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// A service with the provided name already exists.
    #[error("service already registered")]
    Duplicate,
    /// The requested service does not exist.
    #[error("service not found")]
    NotFound,
}

/// Monotonic counter distinguishing successive registrations of a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    /// Exposes the raw numeric value primarily for testing.
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Handle returned by registration and resolution requests.
#[derive(Clone)]
pub struct ServiceHandle {
    /// Well-known service id.
    pub name: String,
    /// Broker serving the id.
    pub broker: Arc<dyn Broker>,
    /// Generation of the registration.
    pub generation: Generation,
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("name", &self.name)
            .field("generation", &self.generation)
            .finish()
    }
}

impl PartialEq for ServiceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.generation == other.generation
    }
}

struct ServiceRecord {
    broker: Arc<dyn Broker>,
    generation: Generation,
}

/// Directory of system services keyed by well-known id.
#[derive(Default)]
pub struct Registry {
    services: Mutex<HashMap<String, ServiceRecord>>,
    last_generation: AtomicU64,
}

impl Registry {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `broker` under `name` if the name is unknown.
    pub fn register(&self, name: impl Into<String>, broker: Arc<dyn Broker>) -> Result<ServiceHandle> {
        let name = name.into();
        let mut services = self.services.lock();
        if services.contains_key(&name) {
            return Err(Error::Duplicate);
        }
        let generation = Generation(self.last_generation.fetch_add(1, Ordering::Relaxed) + 1);
        services.insert(name.clone(), ServiceRecord { broker: Arc::clone(&broker), generation });
        log::debug!("samgr: registered {name} (generation {})", generation.0);
        Ok(ServiceHandle { name, broker, generation })
    }

    /// Resolves the broker registered under `name`.
    pub fn resolve(&self, name: &str) -> Result<ServiceHandle> {
        let services = self.services.lock();
        let record = services.get(name).ok_or(Error::NotFound)?;
        Ok(ServiceHandle {
            name: name.to_string(),
            broker: Arc::clone(&record.broker),
            generation: record.generation,
        })
    }

    /// Removes the registration for `name`.
    pub fn unregister(&self, name: &str) -> Result<()> {
        self.services.lock().remove(name).map(|_| ()).ok_or(Error::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_ipc::Unit;
    use proptest::prelude::*;

    fn broker() -> Arc<dyn Broker> {
        let unit = Unit::new("pipe-service");
        unit.start().unwrap();
        Arc::new(PipeService::new(unit).unwrap())
    }

    #[test]
    fn register_and_resolve_roundtrip() {
        let registry = Registry::new();
        let handle = registry.register(PIPE_SERVICE_ID, broker()).expect("register succeeds");
        let resolved = registry.resolve(PIPE_SERVICE_ID).expect("resolve succeeds");
        assert_eq!(handle, resolved);
        assert!(Arc::ptr_eq(&handle.broker, &resolved.broker));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let registry = Registry::new();
        registry.register("svc", broker()).expect("initial register");
        let err = registry.register("svc", broker()).expect_err("duplicate rejected");
        assert_eq!(err, Error::Duplicate);
    }

    #[test]
    fn unregister_then_resolve_fails() {
        let registry = Registry::new();
        registry.register("svc", broker()).unwrap();
        registry.unregister("svc").unwrap();
        assert_eq!(registry.resolve("svc").unwrap_err(), Error::NotFound);
        assert_eq!(registry.unregister("svc").unwrap_err(), Error::NotFound);
    }

    proptest! {
        #[test]
        fn reregistration_advances_generation(rounds in 1usize..6) {
            let registry = Registry::new();
            let shared = broker();
            let mut last = None;
            for _ in 0..rounds {
                let handle = registry.register("svc", Arc::clone(&shared)).unwrap();
                if let Some(previous) = last {
                    prop_assert!(handle.generation > previous);
                }
                last = Some(handle.generation);
                registry.unregister("svc").unwrap();
            }
        }
    }
}
