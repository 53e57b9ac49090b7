// Copyright (c) 2024 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::{
    fmt::{Debug, Display, Error as FmtError, Formatter},
    num::ParseIntError,
    str::FromStr,
};

/// Represents an API version, as reported by platforms and devices or attached to extensions.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    /// Major version number.
    pub major: u32,
    /// Minor version number.
    pub minor: u32,
    /// Patch version number.
    pub patch: u32,
}

impl Version {
    pub const V1_0: Version = Version::major_minor(1, 0);
    pub const V1_1: Version = Version::major_minor(1, 1);
    pub const V1_2: Version = Version::major_minor(1, 2);
    pub const V2_0: Version = Version::major_minor(2, 0);
    pub const V2_1: Version = Version::major_minor(2, 1);
    pub const V2_2: Version = Version::major_minor(2, 2);
    pub const V3_0: Version = Version::major_minor(3, 0);

    /// Constructs a `Version` from the given major and minor version numbers.
    #[inline]
    pub const fn major_minor(major: u32, minor: u32) -> Version {
        Version {
            major,
            minor,
            patch: 0,
        }
    }

    /// Parses a version string of the form `OpenCL <major>.<minor> <vendor-specific>`, as
    /// reported by platform and device version queries.
    pub fn from_version_string(version: &str) -> Option<Version> {
        let rest = version.strip_prefix("OpenCL ")?;
        let numbers = rest.split_whitespace().next()?;
        numbers.parse().ok()
    }
}

impl Default for Version {
    #[inline]
    fn default() -> Self {
        Self::V1_0
    }
}

impl FromStr for Version {
    type Err = ParseIntError;

    /// Parses `<major>.<minor>` or `<major>.<minor>.<patch>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut iter = s.splitn(3, '.');
        let major: u32 = iter.next().unwrap_or_default().parse()?;
        let minor: u32 = iter.next().unwrap_or("0").parse()?;
        let patch: u32 = iter.next().unwrap_or("0").parse()?;

        Ok(Version {
            major,
            minor,
            patch,
        })
    }
}

impl Debug for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        Debug::fmt(self, f)
    }
}
