// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Portal registry: hands the initial channel set to a freshly started unit.
//!
//! The creator publishes with [`PortalRegistry::set_channels`]; the new unit
//! blocks in [`PortalRegistry::get_channels`] until an entry exists. The
//! registry is an ordinary value shared by `Arc`, not process-global state.
//! A waiter whose unit terminates is woken through a unit termination hook
//! and fails with [`Error::Interrupted`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::channel::Channel;
use crate::unit::{Unit, UnitId};
use crate::{Error, Result};

#[derive(Default)]
struct Slot {
    channels: Option<Vec<Channel>>,
    published: Arc<Condvar>,
    waiters: usize,
    watched: bool,
}

impl Slot {
    fn is_idle(&self) -> bool {
        self.channels.is_none() && self.waiters == 0
    }
}

/// Table of bootstrap channel sets keyed by unit id.
#[derive(Default)]
pub struct PortalRegistry {
    slots: Arc<Mutex<HashMap<UnitId, Slot>>>,
}

impl PortalRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes (or with `None`, clears) the channel set for `unit` and wakes its waiters.
    pub fn set_channels(&self, unit: &Unit, channels: Option<Vec<Channel>>) -> Result<()> {
        unit.ensure_running()?;
        let id = unit.id();
        let mut slots = self.slots.lock();
        let slot = slots.entry(id).or_default();
        log::debug!(
            "portal: {} for {id}",
            match &channels {
                Some(set) => format!("published {} channel(s)", set.len()),
                None => "cleared entry".to_string(),
            }
        );
        slot.channels = channels;
        slot.published.notify_all();
        if slot.is_idle() {
            slots.remove(&id);
        }
        Ok(())
    }

    /// Blocks until a channel set is published for `unit` and returns a snapshot of it.
    pub fn get_channels(&self, unit: &Unit) -> Result<Vec<Channel>> {
        if unit.is_terminated() {
            return Err(Error::illegal(format!("{} terminated", unit.id())));
        }
        let id = unit.id();
        let mut slots = self.slots.lock();
        loop {
            let slot = slots.entry(id).or_default();
            if let Some(channels) = &slot.channels {
                return Ok(channels.clone());
            }
            // Checked under the table lock; the termination hook needs that
            // lock to notify, so the wake cannot slip in before the wait.
            let watching = if slot.watched { Ok(()) } else { unit.on_terminate(self.wake_on_terminate(id)) };
            if watching.is_err() || unit.is_terminated() {
                if slot.is_idle() {
                    slots.remove(&id);
                }
                return Err(Error::Interrupted);
            }
            slot.watched = true;
            // Wakes may be stale (entry cleared again before we ran); recheck.
            slot.waiters += 1;
            let published = Arc::clone(&slot.published);
            published.wait(&mut slots);
            if let Some(slot) = slots.get_mut(&id) {
                slot.waiters -= 1;
            }
        }
    }

    fn wake_on_terminate(&self, id: UnitId) -> Box<dyn FnOnce() + Send> {
        let table = Arc::downgrade(&self.slots);
        Box::new(move || {
            if let Some(table) = table.upgrade() {
                if let Some(slot) = table.lock().get(&id) {
                    slot.published.notify_all();
                }
            }
        })
    }

    /// Returns the published channel set without blocking.
    pub fn try_get_channels(&self, unit: &Unit) -> Option<Vec<Channel>> {
        self.slots.lock().get(&unit.id()).and_then(|slot| slot.channels.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn running(name: &str) -> Unit {
        let unit = Unit::new(name);
        unit.start().unwrap();
        unit
    }

    #[test]
    fn publish_then_lookup() {
        let portal = PortalRegistry::new();
        let (a, b) = (running("a"), running("b"));
        let c = Channel::create(&a, &b).unwrap();
        let c_back = Channel::create(&b, &a).unwrap();
        portal.set_channels(&b, Some(vec![c.clone(), c_back.clone()])).unwrap();

        let got = portal.get_channels(&b).unwrap();
        assert_eq!(got, vec![c.clone(), c_back]);

        c.send(&a, Message::from_bytes(&[1, 2, 3])).unwrap();
        assert_eq!(got[0].receive(&b).unwrap(), Message::from_bytes(&[1, 2, 3]));
    }

    #[test]
    fn set_requires_running_unit() {
        let portal = PortalRegistry::new();
        let unit = Unit::new("fresh");
        assert!(matches!(portal.set_channels(&unit, Some(Vec::new())), Err(Error::IllegalState(_))));
        unit.start().unwrap();
        unit.terminate();
        assert!(matches!(portal.set_channels(&unit, None), Err(Error::IllegalState(_))));
        assert!(matches!(portal.get_channels(&unit), Err(Error::IllegalState(_))));
    }

    #[test]
    fn clearing_makes_lookups_block_again() {
        let portal = PortalRegistry::new();
        let (a, b) = (running("a"), running("b"));
        let c = Channel::create(&a, &b).unwrap();
        portal.set_channels(&b, Some(vec![c])).unwrap();
        assert!(portal.try_get_channels(&b).is_some());
        portal.set_channels(&b, None).unwrap();
        assert!(portal.try_get_channels(&b).is_none());
    }

    #[test]
    fn concurrent_waiters_all_observe_same_snapshot() {
        let portal = Arc::new(PortalRegistry::new());
        let (a, b) = (running("a"), running("b"));
        let barrier = Arc::new(Barrier::new(5));
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let portal = Arc::clone(&portal);
                let barrier = Arc::clone(&barrier);
                b.spawn(move |me| {
                    barrier.wait();
                    portal.get_channels(&me)
                })
                .unwrap()
            })
            .collect();
        barrier.wait();
        thread::sleep(Duration::from_millis(20));
        // A clear while they wait must not release anyone.
        portal.set_channels(&b, None).unwrap();
        let c = Channel::create(&a, &b).unwrap();
        portal.set_channels(&b, Some(vec![c.clone()])).unwrap();
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap().unwrap(), vec![c.clone()]);
        }
    }

    #[test]
    fn termination_interrupts_blocked_lookup() {
        let portal = Arc::new(PortalRegistry::new());
        let unit = running("orphan");
        let waiter = {
            let portal = Arc::clone(&portal);
            unit.spawn(move |me| portal.get_channels(&me)).unwrap()
        };
        thread::sleep(Duration::from_millis(20));
        unit.terminate();
        assert_eq!(waiter.join().unwrap(), Err(Error::Interrupted));
        assert!(portal.try_get_channels(&unit).is_none());
    }
}
