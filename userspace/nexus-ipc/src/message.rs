// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Messages carried by channels.
//!
//! A message is one of three immutable variants: bytes, a channel capability,
//! or a short command. Commands are typed so the close-output sentinel cannot
//! be confused with any other string: `Command::parse` maps the reserved wire
//! token to [`Command::CloseOutput`] unconditionally.

use std::fmt;
use std::sync::Arc;

use crate::channel::Channel;
use crate::{Error, Result};

/// Wire token signalling that the peer closed its output side.
///
/// Must stay bit-for-bit identical for interoperability with other peers.
pub const CLOSE_OUTPUT_TOKEN: &str = "closeOutputStream";

/// Control payload of a [`Message::Command`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    /// Peer closed its output side; no more data follows.
    CloseOutput,
    /// Any other command string.
    Other(String),
}

impl Command {
    /// Decodes a wire string.
    pub fn parse(text: &str) -> Self {
        if text == CLOSE_OUTPUT_TOKEN {
            Self::CloseOutput
        } else {
            Self::Other(text.to_string())
        }
    }

    /// Returns the wire string.
    pub fn as_str(&self) -> &str {
        match self {
            Self::CloseOutput => CLOSE_OUTPUT_TOKEN,
            Self::Other(text) => text,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte range over a shared buffer.
#[derive(Clone)]
pub struct Payload {
    buffer: Arc<[u8]>,
    offset: usize,
    len: usize,
}

impl Payload {
    fn new(buffer: Arc<[u8]>, offset: usize, len: usize) -> Result<Self> {
        let capacity = buffer.len();
        match offset.checked_add(len) {
            Some(end) if end <= capacity => Ok(Self { buffer, offset, len }),
            _ => Err(Error::IndexRange { offset, length: len, capacity }),
        }
    }

    /// Returns the bytes in range.
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[self.offset..self.offset + self.len]
    }

    /// Number of bytes in range.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` when the range is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the original buffer when the range covers it, else a copy of the range.
    pub fn to_shared(&self) -> Arc<[u8]> {
        if self.offset == 0 && self.len == self.buffer.len() {
            Arc::clone(&self.buffer)
        } else {
            Arc::from(self.as_slice())
        }
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Payload {}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload").field("len", &self.len).finish()
    }
}

/// A value carried by a [`Channel`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Raw bytes.
    Data(Payload),
    /// A transferable channel capability.
    Capability(Channel),
    /// A short control string.
    Command(Command),
}

impl Message {
    /// Builds a data message over `buffer[offset..offset + length]`.
    pub fn data(buffer: impl Into<Arc<[u8]>>, offset: usize, length: usize) -> Result<Self> {
        Payload::new(buffer.into(), offset, length).map(Self::Data)
    }

    /// Builds a data message holding a copy of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let len = bytes.len();
        Self::Data(Payload { buffer: Arc::from(bytes), offset: 0, len })
    }

    /// Builds a command message from its wire string.
    pub fn command(text: &str) -> Self {
        Self::Command(Command::parse(text))
    }

    /// Builds the close-output sentinel.
    pub fn close_output() -> Self {
        Self::Command(Command::CloseOutput)
    }

    /// Extracts the data payload; see [`Payload::to_shared`] for when it is copied.
    pub fn extract_data(&self) -> Result<Arc<[u8]>> {
        match self {
            Self::Data(payload) => Ok(payload.to_shared()),
            other => Err(wrong_variant("data", other)),
        }
    }

    /// Extracts the carried channel capability.
    pub fn extract_channel(&self) -> Result<Channel> {
        match self {
            Self::Capability(channel) => Ok(channel.clone()),
            other => Err(wrong_variant("capability", other)),
        }
    }

    /// Extracts the command.
    pub fn extract_command(&self) -> Result<&Command> {
        match self {
            Self::Command(command) => Ok(command),
            other => Err(wrong_variant("command", other)),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Data(_) => "data",
            Self::Capability(_) => "capability",
            Self::Command(_) => "command",
        }
    }
}

fn wrong_variant(wanted: &str, found: &Message) -> Error {
    Error::illegal(format!("expected {wanted} message, found {}", found.kind()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn data_range_validated() {
        let buffer: Arc<[u8]> = Arc::from(&[0u8; 10][..]);
        assert!(Message::data(Arc::clone(&buffer), 0, 10).is_ok());
        assert!(Message::data(Arc::clone(&buffer), 10, 0).is_ok());
        assert_eq!(
            Message::data(Arc::clone(&buffer), 4, 8).unwrap_err(),
            Error::IndexRange { offset: 4, length: 8, capacity: 10 }
        );
        assert!(matches!(Message::data(buffer, usize::MAX, 2), Err(Error::IndexRange { .. })));
    }

    #[test]
    fn full_range_extraction_shares_buffer() {
        let buffer: Arc<[u8]> = Arc::from(&[1u8, 2, 3][..]);
        let msg = Message::data(Arc::clone(&buffer), 0, 3).unwrap();
        let extracted = msg.extract_data().unwrap();
        assert!(Arc::ptr_eq(&buffer, &extracted));
    }

    #[test]
    fn subrange_extraction_copies() {
        let buffer: Arc<[u8]> = Arc::from(&[1u8, 2, 3, 4][..]);
        let msg = Message::data(Arc::clone(&buffer), 1, 2).unwrap();
        let extracted = msg.extract_data().unwrap();
        assert!(!Arc::ptr_eq(&buffer, &extracted));
        assert_eq!(&extracted[..], &[2, 3]);
    }

    #[test]
    fn wrong_variant_is_illegal_state() {
        let msg = Message::command("hello");
        assert!(matches!(msg.extract_data(), Err(Error::IllegalState(_))));
        assert!(matches!(msg.extract_channel(), Err(Error::IllegalState(_))));
        assert!(matches!(Message::from_bytes(b"x").extract_command(), Err(Error::IllegalState(_))));
    }

    #[test]
    fn sentinel_token_is_reserved() {
        assert_eq!(Command::parse("closeOutputStream"), Command::CloseOutput);
        assert_eq!(Command::CloseOutput.as_str(), "closeOutputStream");
        assert_eq!(Message::command("closeOutputStream"), Message::close_output());
        assert_eq!(Command::parse("ping"), Command::Other("ping".into()));
    }

    #[test]
    fn data_equality_is_by_content() {
        let a = Message::data(vec![9u8, 1, 2, 3], 1, 3).unwrap();
        assert_eq!(a, Message::from_bytes(&[1, 2, 3]));
    }

    proptest! {
        #[test]
        fn data_accepts_exactly_in_bounds_ranges(
            bytes in proptest::collection::vec(any::<u8>(), 0..64),
            offset in 0usize..80,
            length in 0usize..80,
        ) {
            let result = Message::data(bytes.clone(), offset, length);
            if offset + length <= bytes.len() {
                let extracted = result.unwrap().extract_data().unwrap();
                prop_assert_eq!(&extracted[..], &bytes[offset..offset + length]);
            } else {
                prop_assert!(matches!(result, Err(Error::IndexRange { .. })), "out of range accepted");
            }
        }
    }
}
