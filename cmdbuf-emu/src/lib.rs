// Copyright (c) 2024 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Record-once, replay-many command buffers layered over a compute dispatch API.
//!
//! # Brief summary
//!
//! - The downstream implementation is represented by the [`Dispatch`] trait. It provides the
//!   immediate-mode primitives (barriers, copies, fills, kernel dispatches) and the basic object
//!   lifetime calls. Anything the layer does not emulate is forwarded to it unchanged.
//!
//! - A [`Layer`] sits on top of a `Dispatch`. It implements `Dispatch` itself, so layers can be
//!   stacked, and additionally exposes the command buffer entry points through opaque
//!   [`CommandBufferHandle`]s. The entry points can be looked up by name with
//!   [`Layer::get_extension_function_address`].
//!
//! - A [`CommandBuffer`](command_buffer::CommandBuffer) is created in the recording state with
//!   exactly one queue. Every successfully recorded command stores a value snapshot of its
//!   arguments and returns a new [`SyncPoint`]. Kernel dispatches clone the kernel at record
//!   time, so later argument changes on the original kernel are not observed on replay.
//!
//! - Once finalized, a command buffer can be enqueued any number of times, on its own queue or
//!   on an explicitly supplied one. Commands are replayed in insertion order and the first
//!   downstream failure stops the replay. Already issued commands are not rolled back.
//!
//! - [`host::HostDispatch`] is a reference downstream implementation that executes every
//!   primitive immediately on host memory. It is used by the tests and is handy for trying the
//!   layer out without a driver.

pub use crate::{
    entry::{CommandBufferHandle, EntryPoint, LAYER_API_VERSION},
    fns::{
        ChannelOrder, ChannelType, CommandBufferCapabilities, CommandType,
        DeviceEnqueueCapabilities, Dispatch, ExtensionFunction, ImageFormat, NameVersion,
        ProfilingInfo, QueueProperties,
    },
    handle::{Context, Device, Event, Handle, Kernel, Mem, MutableCommand, Platform, Queue},
    layer::{Layer, LayerCreateInfo, EXTENSION_NAME, EXTENSION_VERSION},
    version::Version,
};
use std::{
    borrow::Cow,
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
};

mod macros;

pub mod command_buffer;
mod entry;
mod fns;
mod handle;
pub mod host;
mod layer;
pub mod param;
mod version;

pub use crate::command_buffer::SyncPoint;

/// A status code that was returned by a command, or that is returned across the API boundary.
///
/// `Success` is not part of this type; successful calls return `Ok`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ClError {
    DeviceNotFound,
    DeviceNotAvailable,
    CompilerNotAvailable,
    MemObjectAllocationFailure,
    OutOfResources,
    OutOfHostMemory,
    ProfilingInfoNotAvailable,
    MemCopyOverlap,
    ImageFormatMismatch,
    ImageFormatNotSupported,
    MisalignedSubBufferOffset,
    ExecStatusErrorForEventsInWaitList,
    InvalidValue,
    InvalidDeviceType,
    InvalidPlatform,
    InvalidDevice,
    InvalidContext,
    InvalidQueueProperties,
    InvalidCommandQueue,
    InvalidHostPtr,
    InvalidMemObject,
    InvalidImageFormatDescriptor,
    InvalidImageSize,
    InvalidSampler,
    InvalidKernel,
    InvalidArgIndex,
    InvalidArgValue,
    InvalidArgSize,
    InvalidKernelArgs,
    InvalidWorkDimension,
    InvalidWorkGroupSize,
    InvalidWorkItemSize,
    InvalidGlobalOffset,
    InvalidEventWaitList,
    InvalidEvent,
    InvalidOperation,
    InvalidBufferSize,
    InvalidGlobalWorkSize,
    InvalidProperty,
    InvalidCommandBuffer,
    InvalidSyncPointWaitList,
    IncompatibleCommandQueue,
    InvalidMutableCommand,
    /// A status code that this crate does not know about.
    Unnamed(i32),
}

impl ClError {
    /// Converts a raw, non-zero status code into a `ClError`.
    pub fn from_raw(code: i32) -> Self {
        match code {
            -1 => Self::DeviceNotFound,
            -2 => Self::DeviceNotAvailable,
            -3 => Self::CompilerNotAvailable,
            -4 => Self::MemObjectAllocationFailure,
            -5 => Self::OutOfResources,
            -6 => Self::OutOfHostMemory,
            -7 => Self::ProfilingInfoNotAvailable,
            -8 => Self::MemCopyOverlap,
            -9 => Self::ImageFormatMismatch,
            -10 => Self::ImageFormatNotSupported,
            -13 => Self::MisalignedSubBufferOffset,
            -14 => Self::ExecStatusErrorForEventsInWaitList,
            -30 => Self::InvalidValue,
            -31 => Self::InvalidDeviceType,
            -32 => Self::InvalidPlatform,
            -33 => Self::InvalidDevice,
            -34 => Self::InvalidContext,
            -35 => Self::InvalidQueueProperties,
            -36 => Self::InvalidCommandQueue,
            -37 => Self::InvalidHostPtr,
            -38 => Self::InvalidMemObject,
            -39 => Self::InvalidImageFormatDescriptor,
            -40 => Self::InvalidImageSize,
            -41 => Self::InvalidSampler,
            -48 => Self::InvalidKernel,
            -49 => Self::InvalidArgIndex,
            -50 => Self::InvalidArgValue,
            -51 => Self::InvalidArgSize,
            -52 => Self::InvalidKernelArgs,
            -53 => Self::InvalidWorkDimension,
            -54 => Self::InvalidWorkGroupSize,
            -55 => Self::InvalidWorkItemSize,
            -56 => Self::InvalidGlobalOffset,
            -57 => Self::InvalidEventWaitList,
            -58 => Self::InvalidEvent,
            -59 => Self::InvalidOperation,
            -61 => Self::InvalidBufferSize,
            -63 => Self::InvalidGlobalWorkSize,
            -64 => Self::InvalidProperty,
            -1138 => Self::InvalidCommandBuffer,
            -1139 => Self::InvalidSyncPointWaitList,
            -1140 => Self::IncompatibleCommandQueue,
            -1141 => Self::InvalidMutableCommand,
            code => Self::Unnamed(code),
        }
    }

    /// Returns the raw status code.
    pub fn as_raw(self) -> i32 {
        match self {
            Self::DeviceNotFound => -1,
            Self::DeviceNotAvailable => -2,
            Self::CompilerNotAvailable => -3,
            Self::MemObjectAllocationFailure => -4,
            Self::OutOfResources => -5,
            Self::OutOfHostMemory => -6,
            Self::ProfilingInfoNotAvailable => -7,
            Self::MemCopyOverlap => -8,
            Self::ImageFormatMismatch => -9,
            Self::ImageFormatNotSupported => -10,
            Self::MisalignedSubBufferOffset => -13,
            Self::ExecStatusErrorForEventsInWaitList => -14,
            Self::InvalidValue => -30,
            Self::InvalidDeviceType => -31,
            Self::InvalidPlatform => -32,
            Self::InvalidDevice => -33,
            Self::InvalidContext => -34,
            Self::InvalidQueueProperties => -35,
            Self::InvalidCommandQueue => -36,
            Self::InvalidHostPtr => -37,
            Self::InvalidMemObject => -38,
            Self::InvalidImageFormatDescriptor => -39,
            Self::InvalidImageSize => -40,
            Self::InvalidSampler => -41,
            Self::InvalidKernel => -48,
            Self::InvalidArgIndex => -49,
            Self::InvalidArgValue => -50,
            Self::InvalidArgSize => -51,
            Self::InvalidKernelArgs => -52,
            Self::InvalidWorkDimension => -53,
            Self::InvalidWorkGroupSize => -54,
            Self::InvalidWorkItemSize => -55,
            Self::InvalidGlobalOffset => -56,
            Self::InvalidEventWaitList => -57,
            Self::InvalidEvent => -58,
            Self::InvalidOperation => -59,
            Self::InvalidBufferSize => -61,
            Self::InvalidGlobalWorkSize => -63,
            Self::InvalidProperty => -64,
            Self::InvalidCommandBuffer => -1138,
            Self::InvalidSyncPointWaitList => -1139,
            Self::IncompatibleCommandQueue => -1140,
            Self::InvalidMutableCommand => -1141,
            Self::Unnamed(code) => code,
        }
    }

    /// Turns a raw status code into a `Result`. Zero is success.
    #[inline]
    pub fn check(code: i32) -> Result<(), ClError> {
        match code {
            0 => Ok(()),
            code => Err(Self::from_raw(code)),
        }
    }
}

impl Error for ClError {}

impl Display for ClError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        let msg = match self {
            Self::DeviceNotFound => "no device matching the request was found",
            Self::DeviceNotAvailable => "the device is currently not available",
            Self::CompilerNotAvailable => "no compiler is available",
            Self::MemObjectAllocationFailure => "a memory object allocation has failed",
            Self::OutOfResources => "the device ran out of resources",
            Self::OutOfHostMemory => "a host memory allocation has failed",
            Self::ProfilingInfoNotAvailable => "profiling information is not available",
            Self::MemCopyOverlap => "the source and destination regions of a copy overlap",
            Self::ImageFormatMismatch => "the images do not use the same format",
            Self::ImageFormatNotSupported => "the image format is not supported",
            Self::MisalignedSubBufferOffset => "a sub-buffer offset is not aligned",
            Self::ExecStatusErrorForEventsInWaitList => {
                "an event in the wait list completed with an error"
            }
            Self::InvalidValue => "an argument has an invalid value",
            Self::InvalidDeviceType => "the device type is not valid",
            Self::InvalidPlatform => "the platform is not valid",
            Self::InvalidDevice => "the device is not valid",
            Self::InvalidContext => "the context is not valid",
            Self::InvalidQueueProperties => "the queue properties are not supported",
            Self::InvalidCommandQueue => "the command queue is not valid",
            Self::InvalidHostPtr => "the host pointer is not valid",
            Self::InvalidMemObject => "the memory object is not valid",
            Self::InvalidImageFormatDescriptor => "the image format descriptor is not valid",
            Self::InvalidImageSize => "the image size is not valid",
            Self::InvalidSampler => "the sampler is not valid",
            Self::InvalidKernel => "the kernel is not valid",
            Self::InvalidArgIndex => "the kernel argument index is not valid",
            Self::InvalidArgValue => "the kernel argument value is not valid",
            Self::InvalidArgSize => "the kernel argument size is not valid",
            Self::InvalidKernelArgs => "not all kernel arguments have been set",
            Self::InvalidWorkDimension => "the work dimension is not valid",
            Self::InvalidWorkGroupSize => "the work-group size is not valid",
            Self::InvalidWorkItemSize => "the work-item size is not valid",
            Self::InvalidGlobalOffset => "the global offset is not valid",
            Self::InvalidEventWaitList => "the event wait list is not valid",
            Self::InvalidEvent => "the event is not valid",
            Self::InvalidOperation => "the operation is not valid in the current state",
            Self::InvalidBufferSize => "the buffer size is not valid",
            Self::InvalidGlobalWorkSize => "the global work size is not valid",
            Self::InvalidProperty => "a property is not valid",
            Self::InvalidCommandBuffer => "the command buffer is not valid",
            Self::InvalidSyncPointWaitList => "the sync point wait list is not valid",
            Self::IncompatibleCommandQueue => "the command queue is not compatible",
            Self::InvalidMutableCommand => "the mutable command is not valid",
            Self::Unnamed(code) => return write!(f, "unnamed status code {}", code),
        };

        write!(f, "{}", msg)
    }
}

/// A wrapper for error types of functions that can return validation errors.
#[derive(Clone)]
pub enum Validated<E> {
    /// A non-validation error occurred.
    Error(E),

    /// A validation error occurred.
    ValidationError(Box<ValidationError>),
}

impl<E> Validated<E> {
    /// Maps the inner `Error` value using the provided function, or does nothing if the value is
    /// `ValidationError`.
    #[inline]
    pub fn map<F>(self, f: impl FnOnce(E) -> F) -> Validated<F> {
        match self {
            Self::Error(err) => Validated::Error(f(err)),
            Self::ValidationError(err) => Validated::ValidationError(err),
        }
    }

    /// Returns the inner `Error` value, or panics if it contains `ValidationError`.
    #[inline(always)]
    #[track_caller]
    pub fn unwrap(self) -> E {
        match self {
            Self::Error(err) => err,
            Self::ValidationError(err) => {
                panic!(
                    "called `Validated::unwrap` on a `ValidationError` value: {:?}",
                    err
                )
            }
        }
    }
}

impl Validated<ClError> {
    /// Returns the status code that is reported across the API boundary for this error.
    #[inline]
    pub fn code(&self) -> ClError {
        match self {
            Self::Error(err) => *err,
            Self::ValidationError(err) => err.code,
        }
    }
}

impl<E> Error for Validated<E>
where
    E: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Error(err) => Some(err),
            Self::ValidationError(err) => Some(err),
        }
    }
}

impl<E> Display for Validated<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::Error(_) => write!(f, "a non-validation error occurred"),
            Self::ValidationError(_) => write!(f, "a validation error occurred"),
        }
    }
}

impl<E> std::fmt::Debug for Validated<E>
where
    E: std::fmt::Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::Error(err) => write!(f, "a non-validation error occurred: {:?}", err),
            Self::ValidationError(err) => {
                write!(f, "a validation error occurred\n\nCaused by:\n    {}", err)
            }
        }
    }
}

impl<E> From<Box<ValidationError>> for Validated<E> {
    #[inline]
    fn from(err: Box<ValidationError>) -> Self {
        Self::ValidationError(err)
    }
}

impl From<ClError> for Validated<ClError> {
    #[inline]
    fn from(err: ClError) -> Self {
        Self::Error(err)
    }
}

impl From<Validated<ClError>> for ClError {
    #[inline]
    fn from(err: Validated<ClError>) -> Self {
        err.code()
    }
}

/// The arguments or other context of a call did not meet the requirements of the API.
///
/// Validation happens before anything is forwarded downstream, so a validation error never
/// leaves partial state behind.
#[derive(Clone, Debug)]
pub struct ValidationError {
    /// The context in which the problem exists (e.g. a specific parameter).
    pub context: Cow<'static, str>,

    /// A description of the problem.
    pub problem: Cow<'static, str>,

    /// The status code that is reported across the API boundary.
    pub code: ClError,
}

impl ValidationError {
    pub(crate) fn new(
        code: ClError,
        context: impl Into<Cow<'static, str>>,
        problem: impl Into<Cow<'static, str>>,
    ) -> Box<Self> {
        Box::new(ValidationError {
            context: context.into(),
            problem: problem.into(),
            code,
        })
    }

    pub(crate) fn add_context(
        mut self: Box<Self>,
        context: impl Into<Cow<'static, str>>,
    ) -> Box<Self> {
        if self.context.is_empty() {
            self.context = context.into();
        } else {
            self.context = format!("{}.{}", context.into(), self.context).into();
        }

        self
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        if self.context.is_empty() {
            write!(f, "{}", self.problem)?;
        } else {
            write!(f, "{}: {}", self.context, self.problem)?;
        }

        write!(f, " ({:?})", self.code)
    }
}

impl Error for ValidationError {}

/// Used in struct fields to make the struct non-exhaustive while still allowing the use of
/// functional record update syntax (`..Default::default()`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct NonExhaustive(pub(crate) ());
