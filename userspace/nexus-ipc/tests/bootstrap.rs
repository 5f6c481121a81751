// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integration tests for unit bootstrap over the portal registry
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 3 integration tests
//!
//! TEST_SCENARIOS:
//!   - parent_hands_stream_channels_to_child(): portal-delivered pair carries a duplex stream
//!   - capability_forwarding_links_grandchild(): a channel received as a message is usable by its receiver
//!   - child_termination_ends_parent_stream(): terminating the child reads as end of stream
//!
//! DEPENDENCIES:
//!   - nexus_ipc::PortalRegistry: bootstrap table
//!   - nexus_ipc::DuplexStream: stream over the delivered pair

use std::io::{Read, Write};
use std::sync::Arc;

use nexus_ipc::{Channel, DuplexStream, Message, Mode, PortalRegistry, Transfer, Unit};

fn running(name: &str) -> Unit {
    let unit = Unit::new(name);
    unit.start().unwrap();
    unit
}

/// Publishes `[parent -> child, child -> parent]` for `child` and returns the parent's stream.
fn bootstrap(portal: &PortalRegistry, parent: &Unit, child: &Unit) -> DuplexStream {
    let down = Channel::create(parent, child).unwrap();
    let up = Channel::create(child, parent).unwrap();
    portal.set_channels(child, Some(vec![down.clone(), up.clone()])).unwrap();
    DuplexStream::establish(parent, Transfer::new(up, down, "portal", "1.0", "1.0"), Mode::ReadWrite).unwrap()
}

fn child_stream(portal: &PortalRegistry, child: &Unit) -> DuplexStream {
    let channels = portal.get_channels(child).unwrap();
    let (down, up) = (channels[0].clone(), channels[1].clone());
    DuplexStream::establish(child, Transfer::new(down, up, "portal", "1.0", "1.0"), Mode::ReadWrite).unwrap()
}

#[test]
fn parent_hands_stream_channels_to_child() {
    let portal = Arc::new(PortalRegistry::new());
    let (parent, child) = (running("parent"), running("child"));

    let worker = {
        let portal = Arc::clone(&portal);
        child
            .spawn(move |me| {
                let stream = child_stream(&portal, &me);
                let mut text = String::new();
                (&stream).read_to_string(&mut text).unwrap();
                (&stream).write_all(text.to_uppercase().as_bytes()).unwrap();
                stream.close();
            })
            .unwrap()
    };

    let stream = bootstrap(&portal, &parent, &child);
    stream.write(b"shout ").unwrap();
    stream.write(b"this").unwrap();
    stream.close_output();
    let mut reply = String::new();
    (&stream).read_to_string(&mut reply).unwrap();
    assert_eq!(reply, "SHOUT THIS");
    worker.join().unwrap();
}

#[test]
fn capability_forwarding_links_grandchild() {
    let portal = PortalRegistry::new();
    let (parent, child) = (running("parent"), running("child"));
    let grandchild = running("grandchild");

    let control = Channel::create(&parent, &child).unwrap();
    portal.set_channels(&child, Some(vec![control.clone()])).unwrap();

    let direct = Channel::create(&grandchild, &child).unwrap();
    control.send(&parent, Message::Capability(direct.clone())).unwrap();

    let delivered = portal.get_channels(&child).unwrap();
    let forwarded = delivered[0].receive(&child).unwrap().extract_channel().unwrap();
    assert_eq!(forwarded, direct);

    direct.send(&grandchild, Message::from_bytes(b"hi")).unwrap();
    let payload = forwarded.receive(&child).unwrap().extract_data().unwrap();
    assert_eq!(&payload[..], b"hi");
}

#[test]
fn child_termination_ends_parent_stream() {
    let portal = PortalRegistry::new();
    let (parent, child) = (running("parent"), running("child"));
    let stream = bootstrap(&portal, &parent, &child);

    child.terminate();
    let mut buf = [0u8; 8];
    assert_eq!(stream.read(&mut buf).unwrap(), None);
    assert!(portal.get_channels(&child).is_err());
}
