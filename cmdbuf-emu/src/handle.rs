// Copyright (c) 2024 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Opaque handles to objects owned by the downstream implementation.
//!
//! The layer never looks inside these. They are compared, hashed, stored and passed back down.

use std::fmt::{Debug, Error as FmtError, Formatter};

/// An opaque handle to a downstream object.
pub trait Handle: Copy + Eq + Debug {
    /// The name of the object type, used in logs and error contexts.
    const NAME: &'static str;

    /// Wraps a raw handle value.
    fn from_raw(raw: u64) -> Self;

    /// Returns the raw handle value.
    fn as_raw(self) -> u64;

    /// Returns the null handle.
    #[inline]
    fn null() -> Self {
        Self::from_raw(0)
    }

    /// Returns whether this is the null handle.
    #[inline]
    fn is_null(self) -> bool {
        self.as_raw() == 0
    }
}

macro_rules! handles {
    {
        $(
            $(#[doc = $doc:literal])*
            $ty:ident,
        )+
    } => {
        $(
            $(#[doc = $doc])*
            #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
            #[repr(transparent)]
            pub struct $ty(u64);

            impl Handle for $ty {
                const NAME: &'static str = stringify!($ty);

                #[inline]
                fn from_raw(raw: u64) -> Self {
                    Self(raw)
                }

                #[inline]
                fn as_raw(self) -> u64 {
                    self.0
                }
            }

            impl Debug for $ty {
                fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
                    write!(f, "{}({:#x})", stringify!($ty), self.0)
                }
            }
        )+
    };
}

handles! {
    /// A platform.
    Platform,

    /// A device belonging to a platform.
    Device,

    /// A context grouping devices and the objects created for them.
    Context,

    /// An in-order or out-of-order queue that commands are enqueued on.
    Queue,

    /// A memory object: a buffer or an image.
    Mem,

    /// A kernel, with its currently bound arguments.
    Kernel,

    /// An event that is signaled when a command completes.
    Event,

    /// A handle to a recorded command that can be updated after finalization.
    ///
    /// Updatable commands are not supported; this type only exists so that a request for one
    /// can be represented and rejected.
    MutableCommand,
}
