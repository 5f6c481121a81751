// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Pipe server versions: `major.minor[.micro]`, decimal components.

use std::fmt;
use std::str::FromStr;

use nexus_ipc::Error;

/// Parsed server version. Ordering is numeric, component by component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    major: u32,
    minor: u32,
    micro: u32,
}

impl Version {
    /// Builds a version from its components.
    pub const fn new(major: u32, minor: u32, micro: u32) -> Self {
        Self { major, minor, micro }
    }

    /// Returns `true` when a server at `self` satisfies a client asking for `requested`:
    /// same major version, and not older than requested.
    pub fn satisfies(self, requested: Version) -> bool {
        self.major == requested.major && self >= requested
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let malformed = || Error::InvalidArgument(format!("malformed server version: {text:?}"));
        let mut parts = text.split('.');
        let mut component = |required: bool| -> Result<u32, Error> {
            match parts.next() {
                Some(part) if !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()) => {
                    part.parse().map_err(|_| malformed())
                }
                None if !required => Ok(0),
                _ => Err(malformed()),
            }
        };
        let major = component(true)?;
        let minor = component(true)?;
        let micro = component(false)?;
        if parts.next().is_some() {
            return Err(malformed());
        }
        Ok(Self { major, minor, micro })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}
