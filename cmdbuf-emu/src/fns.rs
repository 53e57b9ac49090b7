// Copyright (c) 2024 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The table of downstream entry points, and the plain data types that flow through it.

use crate::{
    command_buffer::{
        CopyBufferInfo, CopyBufferRectInfo, CopyBufferToImageInfo, CopyImageInfo,
        CopyImageToBufferInfo, FillBufferInfo, FillImageInfo, NdRangeKernelInfo,
    },
    entry::EntryPoint,
    handle::{Context, Device, Event, Kernel, Mem, Platform, Queue},
    macros::{cl_bitflags, cl_enum},
    ClError, Version,
};
use std::num::NonZeroUsize;

/// The entry points of the next implementation down the stack.
///
/// Everything the layer does not emulate itself is passed through one of these methods without
/// modification. The immediate-mode primitives (`enqueue_*`) are the building blocks that
/// recorded commands are replayed with; they never take a wait list, because replay is strictly
/// sequential on an in-order queue.
///
/// A [`Layer`](crate::Layer) also implements this trait, so layers can be stacked.
pub trait Dispatch: Send + Sync {
    /// Returns the space-separated extension string of a platform.
    fn platform_extensions(&self, platform: Platform) -> Result<String, ClError>;

    /// Returns the extensions of a platform together with their versions.
    fn platform_extensions_with_version(
        &self,
        platform: Platform,
    ) -> Result<Vec<NameVersion>, ClError>;

    /// Returns the version string of a platform, e.g. `OpenCL 3.0 Vendor`.
    fn platform_version(&self, platform: Platform) -> Result<String, ClError>;

    /// Returns the space-separated extension string of a device.
    fn device_extensions(&self, device: Device) -> Result<String, ClError>;

    /// Returns the extensions of a device together with their versions.
    fn device_extensions_with_version(&self, device: Device)
        -> Result<Vec<NameVersion>, ClError>;

    /// Returns the version string of a device.
    fn device_version(&self, device: Device) -> Result<String, ClError>;

    /// Returns the queue properties that the device supports.
    fn device_queue_properties(&self, device: Device) -> Result<QueueProperties, ClError>;

    /// Returns the device-side enqueue capabilities of the device.
    fn device_enqueue_capabilities(
        &self,
        device: Device,
    ) -> Result<DeviceEnqueueCapabilities, ClError>;

    /// Returns the command buffer capabilities of the device, for implementations that support
    /// command buffers natively.
    fn device_command_buffer_capabilities(
        &self,
        device: Device,
    ) -> Result<CommandBufferCapabilities, ClError>;

    /// Returns the queue properties that a queue must have to be used with a command buffer.
    fn device_command_buffer_required_queue_properties(
        &self,
        device: Device,
    ) -> Result<QueueProperties, ClError>;

    /// Returns the context that a queue was created in.
    fn queue_context(&self, queue: Queue) -> Result<Context, ClError>;

    /// Returns the device that a queue submits to.
    fn queue_device(&self, queue: Queue) -> Result<Device, ClError>;

    /// Blocks until every command enqueued on the queue has completed.
    fn finish(&self, queue: Queue) -> Result<(), ClError>;

    fn retain_queue(&self, queue: Queue) -> Result<(), ClError>;
    fn release_queue(&self, queue: Queue) -> Result<(), ClError>;
    fn retain_mem(&self, mem: Mem) -> Result<(), ClError>;
    fn release_mem(&self, mem: Mem) -> Result<(), ClError>;
    fn retain_kernel(&self, kernel: Kernel) -> Result<(), ClError>;
    fn release_kernel(&self, kernel: Kernel) -> Result<(), ClError>;
    fn retain_event(&self, event: Event) -> Result<(), ClError>;
    fn release_event(&self, event: Event) -> Result<(), ClError>;

    /// Returns the format of an image memory object.
    fn image_format(&self, image: Mem) -> Result<ImageFormat, ClError>;

    /// Creates a new kernel with the same program and a copy of every argument currently bound
    /// to `kernel`. The two kernels are independent afterwards.
    fn clone_kernel(&self, kernel: Kernel) -> Result<Kernel, ClError>;

    /// Binds the bytes of `value` as argument `index` of `kernel`.
    fn set_kernel_arg(&self, kernel: Kernel, index: u32, value: &[u8]) -> Result<(), ClError>;

    /// Returns the type of the command that an event belongs to.
    fn event_command_type(&self, event: Event) -> Result<CommandType, ClError>;

    /// Returns a profiling timestamp of the command that an event belongs to, in nanoseconds.
    fn event_profiling_info(&self, event: Event, info: ProfilingInfo) -> Result<u64, ClError>;

    /// Looks up an extension function by name.
    fn extension_function_address(
        &self,
        platform: Platform,
        name: &str,
    ) -> Option<ExtensionFunction>;

    /// Enqueues a barrier that waits for every event in `wait_list`, or for every previously
    /// enqueued command if the list is empty. If `signal` is true, an event is returned that is
    /// signaled when the barrier completes.
    fn enqueue_barrier_with_wait_list(
        &self,
        queue: Queue,
        wait_list: &[Event],
        signal: bool,
    ) -> Result<Option<Event>, ClError>;

    fn enqueue_copy_buffer(&self, queue: Queue, info: &CopyBufferInfo) -> Result<(), ClError>;

    fn enqueue_copy_buffer_rect(
        &self,
        queue: Queue,
        info: &CopyBufferRectInfo,
    ) -> Result<(), ClError>;

    fn enqueue_copy_buffer_to_image(
        &self,
        queue: Queue,
        info: &CopyBufferToImageInfo,
    ) -> Result<(), ClError>;

    fn enqueue_copy_image(&self, queue: Queue, info: &CopyImageInfo) -> Result<(), ClError>;

    fn enqueue_copy_image_to_buffer(
        &self,
        queue: Queue,
        info: &CopyImageToBufferInfo,
    ) -> Result<(), ClError>;

    fn enqueue_fill_buffer(&self, queue: Queue, info: &FillBufferInfo) -> Result<(), ClError>;

    fn enqueue_fill_image(&self, queue: Queue, info: &FillImageInfo) -> Result<(), ClError>;

    fn enqueue_nd_range_kernel(
        &self,
        queue: Queue,
        info: &NdRangeKernelInfo,
    ) -> Result<(), ClError>;
}

/// The result of an extension function lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtensionFunction {
    /// The address of a function that the downstream implementation provides.
    Native(NonZeroUsize),

    /// A function that a layer emulates.
    Emulated(EntryPoint),
}

/// The name and version of an extension.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NameVersion {
    pub name: String,
    pub version: Version,
}

impl NameVersion {
    #[inline]
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        NameVersion {
            name: name.into(),
            version,
        }
    }
}

/// The format of an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageFormat {
    pub channel_order: ChannelOrder,
    pub channel_data_type: ChannelType,
}

impl ImageFormat {
    /// Returns the number of channels of each texel.
    pub fn channel_count(self) -> usize {
        match self.channel_order {
            ChannelOrder::R
            | ChannelOrder::A
            | ChannelOrder::Intensity
            | ChannelOrder::Luminance
            | ChannelOrder::Depth => 1,
            ChannelOrder::RG | ChannelOrder::RA | ChannelOrder::DepthStencil => 2,
            ChannelOrder::RGB => 3,
            ChannelOrder::RGBA | ChannelOrder::BGRA | ChannelOrder::ARGB => 4,
        }
    }

    /// Returns the size in bytes of one texel, or `None` for packed formats.
    pub fn texel_size(self) -> Option<usize> {
        let component_size = match self.channel_data_type {
            ChannelType::SnormInt8
            | ChannelType::UnormInt8
            | ChannelType::SignedInt8
            | ChannelType::UnsignedInt8 => 1,
            ChannelType::SnormInt16
            | ChannelType::UnormInt16
            | ChannelType::SignedInt16
            | ChannelType::UnsignedInt16
            | ChannelType::HalfFloat => 2,
            ChannelType::SignedInt32 | ChannelType::UnsignedInt32 | ChannelType::Float => 4,
            ChannelType::UnormShort565
            | ChannelType::UnormShort555
            | ChannelType::UnormInt101010
            | ChannelType::UnormInt24 => return None,
        };

        Some(component_size * self.channel_count())
    }
}

cl_enum! {
    /// The order and meaning of the channels of an image format.
    ChannelOrder = u32;

    R = 0x10B0,
    A = 0x10B1,
    RG = 0x10B2,
    RA = 0x10B3,
    RGB = 0x10B4,
    RGBA = 0x10B5,
    BGRA = 0x10B6,
    ARGB = 0x10B7,
    Intensity = 0x10B8,
    Luminance = 0x10B9,
    Depth = 0x10BD,
    DepthStencil = 0x10BE,
}

cl_enum! {
    /// The representation of each channel of an image format.
    ChannelType = u32;

    SnormInt8 = 0x10D0,
    SnormInt16 = 0x10D1,
    UnormInt8 = 0x10D2,
    UnormInt16 = 0x10D3,
    UnormShort565 = 0x10D4,
    UnormShort555 = 0x10D5,
    UnormInt101010 = 0x10D6,
    SignedInt8 = 0x10D7,
    SignedInt16 = 0x10D8,
    SignedInt32 = 0x10D9,
    UnsignedInt8 = 0x10DA,
    UnsignedInt16 = 0x10DB,
    UnsignedInt32 = 0x10DC,
    HalfFloat = 0x10DD,
    Float = 0x10DE,
    UnormInt24 = 0x10DF,
}

cl_bitflags! {
    /// Properties of a command queue.
    QueueProperties = u64;

    /// Commands may execute out of order.
    OUT_OF_ORDER_EXEC_MODE_ENABLE = 1 << 0,

    /// Events record profiling timestamps.
    PROFILING_ENABLE = 1 << 1,

    /// The queue is a device-side queue.
    ON_DEVICE = 1 << 2,

    /// The queue is the default device-side queue.
    ON_DEVICE_DEFAULT = 1 << 3,
}

cl_bitflags! {
    /// Device-side enqueue support of a device.
    DeviceEnqueueCapabilities = u64;

    SUPPORTED = 1 << 0,
    REPLACEABLE_DEFAULT = 1 << 1,
}

cl_bitflags! {
    /// What command buffers can do on a device.
    CommandBufferCapabilities = u64;

    /// Kernels that call `printf` may be recorded.
    KERNEL_PRINTF = 1 << 0,

    /// Kernels that enqueue device-side work may be recorded.
    DEVICE_SIDE_ENQUEUE = 1 << 1,

    /// A command buffer may be enqueued again while a previous submission is still pending.
    SIMULTANEOUS_USE = 1 << 2,

    /// Command buffers may be created with out-of-order queues.
    OUT_OF_ORDER = 1 << 3,
}

cl_enum! {
    /// The kind of command that an event belongs to.
    CommandType = u32;

    NdRangeKernel = 0x11F0,
    Task = 0x11F1,
    NativeKernel = 0x11F2,
    ReadBuffer = 0x11F3,
    WriteBuffer = 0x11F4,
    CopyBuffer = 0x11F5,
    ReadImage = 0x11F6,
    WriteImage = 0x11F7,
    CopyImage = 0x11F8,
    CopyImageToBuffer = 0x11F9,
    CopyBufferToImage = 0x11FA,
    MapBuffer = 0x11FB,
    MapImage = 0x11FC,
    UnmapMemObject = 0x11FD,
    Marker = 0x11FE,
    ReadBufferRect = 0x1201,
    WriteBufferRect = 0x1202,
    CopyBufferRect = 0x1203,
    User = 0x1204,
    Barrier = 0x1205,
    MigrateMemObjects = 0x1206,
    FillBuffer = 0x1207,
    FillImage = 0x1208,
    /// The event of a command buffer submission.
    CommandBufferKhr = 0x12A8,
}

cl_enum! {
    /// A profiling timestamp of a command.
    ProfilingInfo = u32;

    /// When the command was enqueued.
    Queued = 0x1280,

    /// When the command was submitted to the device.
    Submit = 0x1281,

    /// When the command started executing.
    Start = 0x1282,

    /// When the command finished executing.
    End = 0x1283,

    /// When the command and every child command it enqueued finished executing.
    Complete = 0x1284,
}
