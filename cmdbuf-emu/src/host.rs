// Copyright (c) 2024 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! A downstream implementation that executes everything immediately, on host memory.
//!
//! There is one platform with one device and one context. Queues, buffers, images, kernels and
//! events are created through the inherent methods of [`HostDispatch`], and are reference
//! counted the same way a driver would count them. Kernels are Rust closures that receive their
//! bound arguments and can write into buffers passed as arguments.
//!
//! Every call to an `enqueue_*` primitive is appended to a call log before it executes, and a
//! failure can be injected into the n-th primitive call. Together these make the order and the
//! extent of a replay observable.

use crate::{
    command_buffer::{
        CopyBufferInfo, CopyBufferRectInfo, CopyBufferToImageInfo, CopyImageInfo,
        CopyImageToBufferInfo, FillBufferInfo, FillColor, FillImageInfo, NdRangeKernelInfo,
    },
    fns::{
        ChannelOrder, ChannelType, CommandBufferCapabilities, CommandType,
        DeviceEnqueueCapabilities, Dispatch, ExtensionFunction, ImageFormat, NameVersion,
        ProfilingInfo, QueueProperties,
    },
    handle::{Context, Device, Event, Handle, Kernel, Mem, Platform, Queue},
    ClError, NonExhaustive, Version,
};
use bytemuck::AnyBitPattern;
use foldhash::HashMap;
use half::f16;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    hash::Hash,
    mem::size_of,
    num::NonZeroUsize,
    ops::Range,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// The body of a kernel. It is called once per dispatch, for the whole range.
pub type KernelFn = Arc<dyn Fn(&mut KernelInvocation<'_>) -> Result<(), ClError> + Send + Sync>;

/// Parameters to create a `HostDispatch`.
#[derive(Clone, Debug)]
pub struct HostCreateInfo {
    /// The version string reported for the platform.
    ///
    /// The default value is `OpenCL 3.0 Host`.
    pub platform_version: String,

    /// The version string reported for the device.
    ///
    /// The default value is `OpenCL 3.0 Host`.
    pub device_version: String,

    /// The extensions reported for both the platform and the device.
    ///
    /// The default value contains `cl_khr_byte_addressable_store` and `cl_khr_fp16`.
    pub extensions: Vec<NameVersion>,

    /// The queue properties that the device supports.
    ///
    /// The default value is `OUT_OF_ORDER_EXEC_MODE_ENABLE | PROFILING_ENABLE`.
    pub queue_properties: QueueProperties,

    /// The device-side enqueue capabilities of the device.
    ///
    /// The default value is empty.
    pub device_enqueue_capabilities: DeviceEnqueueCapabilities,

    /// Names of extension functions that the implementation provides itself.
    ///
    /// The default value is empty.
    pub native_functions: Vec<String>,

    pub _ne: NonExhaustive,
}

impl Default for HostCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            platform_version: "OpenCL 3.0 Host".to_owned(),
            device_version: "OpenCL 3.0 Host".to_owned(),
            extensions: vec![
                NameVersion::new("cl_khr_byte_addressable_store", Version::V1_0),
                NameVersion::new("cl_khr_fp16", Version::V1_0),
            ],
            queue_properties: QueueProperties::OUT_OF_ORDER_EXEC_MODE_ENABLE
                | QueueProperties::PROFILING_ENABLE,
            device_enqueue_capabilities: DeviceEnqueueCapabilities::empty(),
            native_functions: Vec::new(),
            _ne: NonExhaustive(()),
        }
    }
}

/// One call to an immediate-mode primitive, as recorded in the call log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HostCall {
    Barrier {
        queue: Queue,
        wait_list: usize,
        signal: bool,
    },
    CopyBuffer {
        queue: Queue,
        src: Mem,
        dst: Mem,
    },
    CopyBufferRect {
        queue: Queue,
        src: Mem,
        dst: Mem,
    },
    CopyBufferToImage {
        queue: Queue,
        src: Mem,
        dst: Mem,
    },
    CopyImage {
        queue: Queue,
        src: Mem,
        dst: Mem,
    },
    CopyImageToBuffer {
        queue: Queue,
        src: Mem,
        dst: Mem,
    },
    FillBuffer {
        queue: Queue,
        buffer: Mem,
    },
    FillImage {
        queue: Queue,
        image: Mem,
    },
    NdRangeKernel {
        queue: Queue,
        kernel: Kernel,
    },
}

impl HostCall {
    /// Returns the queue that the call was made on.
    pub fn queue(&self) -> Queue {
        match *self {
            Self::Barrier { queue, .. }
            | Self::CopyBuffer { queue, .. }
            | Self::CopyBufferRect { queue, .. }
            | Self::CopyBufferToImage { queue, .. }
            | Self::CopyImage { queue, .. }
            | Self::CopyImageToBuffer { queue, .. }
            | Self::FillBuffer { queue, .. }
            | Self::FillImage { queue, .. }
            | Self::NdRangeKernel { queue, .. } => queue,
        }
    }
}

/// A downstream implementation that runs on the host.
pub struct HostDispatch {
    create_info: HostCreateInfo,
    platform: Platform,
    device: Device,
    context: Context,
    next_handle: AtomicU64,
    state: Mutex<HostState>,
}

#[derive(Default)]
struct HostState {
    queues: HashMap<Queue, QueueObject>,
    mems: HashMap<Mem, MemObject>,
    kernels: HashMap<Kernel, KernelObject>,
    events: HashMap<Event, EventObject>,
    calls: Vec<HostCall>,
    image_format_queries: usize,
    clock: u64,
    failure: Option<(usize, ClError)>,
}

trait RefCounted {
    fn ref_count(&mut self) -> &mut u32;
}

struct QueueObject {
    ref_count: u32,
}

struct MemObject {
    ref_count: u32,
    data: Vec<u8>,
    image: Option<ImageDesc>,
}

#[derive(Clone, Copy)]
struct ImageDesc {
    format: ImageFormat,
    extent: [usize; 3],
    texel_size: usize,
}

struct KernelObject {
    ref_count: u32,
    function: KernelFn,
    args: Vec<Option<Vec<u8>>>,
}

struct EventObject {
    ref_count: u32,
    command_type: CommandType,
    timestamps: Option<[u64; 4]>,
}

macro_rules! impl_ref_counted {
    ($($ty:ident),+) => {
        $(
            impl RefCounted for $ty {
                #[inline]
                fn ref_count(&mut self) -> &mut u32 {
                    &mut self.ref_count
                }
            }
        )+
    };
}

impl_ref_counted!(QueueObject, MemObject, KernelObject, EventObject);

impl HostDispatch {
    /// Creates a new `HostDispatch` with no queues or objects.
    pub fn new(create_info: HostCreateInfo) -> Self {
        HostDispatch {
            create_info,
            platform: Platform::from_raw(1),
            device: Device::from_raw(2),
            context: Context::from_raw(3),
            next_handle: AtomicU64::new(0x100),
            state: Mutex::new(HostState {
                clock: 1000,
                ..Default::default()
            }),
        }
    }

    fn allocate_handle<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn platform(&self) -> Platform {
        self.platform
    }

    #[inline]
    pub fn device(&self) -> Device {
        self.device
    }

    #[inline]
    pub fn context(&self) -> Context {
        self.context
    }

    /// Creates a queue with a reference count of 1.
    pub fn create_queue(&self) -> Queue {
        let queue = self.allocate_handle();
        self.state
            .lock()
            .queues
            .insert(queue, QueueObject { ref_count: 1 });

        queue
    }

    /// Creates a zero-initialized buffer with a reference count of 1.
    pub fn create_buffer(&self, size: usize) -> Mem {
        let mem = self.allocate_handle();
        self.state.lock().mems.insert(
            mem,
            MemObject {
                ref_count: 1,
                data: vec![0; size],
                image: None,
            },
        );

        mem
    }

    /// Creates a zero-initialized image with a reference count of 1. Unused dimensions of
    /// `extent` must be 1. Packed formats are not supported.
    pub fn create_image(&self, format: ImageFormat, extent: [usize; 3]) -> Result<Mem, ClError> {
        let texel_size = format
            .texel_size()
            .ok_or(ClError::ImageFormatNotSupported)?;

        if extent.contains(&0) {
            return Err(ClError::InvalidImageSize);
        }

        let mem = self.allocate_handle();
        self.state.lock().mems.insert(
            mem,
            MemObject {
                ref_count: 1,
                data: vec![0; extent.iter().product::<usize>() * texel_size],
                image: Some(ImageDesc {
                    format,
                    extent,
                    texel_size,
                }),
            },
        );

        Ok(mem)
    }

    /// Creates a kernel with `num_args` unset arguments and a reference count of 1.
    pub fn create_kernel<F>(&self, num_args: u32, function: F) -> Kernel
    where
        F: Fn(&mut KernelInvocation<'_>) -> Result<(), ClError> + Send + Sync + 'static,
    {
        let kernel = self.allocate_handle();
        self.state.lock().kernels.insert(
            kernel,
            KernelObject {
                ref_count: 1,
                function: Arc::new(function),
                args: vec![None; num_args as usize],
            },
        );

        kernel
    }

    /// Creates an event that is not tied to a command, with a reference count of 1.
    pub fn create_user_event(&self) -> Event {
        let event = self.allocate_handle();
        self.state.lock().events.insert(
            event,
            EventObject {
                ref_count: 1,
                command_type: CommandType::User,
                timestamps: None,
            },
        );

        event
    }

    /// Returns a copy of the contents of a buffer or image.
    pub fn read_mem(&self, mem: Mem) -> Option<Vec<u8>> {
        self.state.lock().mems.get(&mem).map(|object| object.data.clone())
    }

    /// Overwrites part of the contents of a buffer or image.
    pub fn write_mem(&self, mem: Mem, offset: usize, bytes: &[u8]) -> Result<(), ClError> {
        let mut state = self.state.lock();
        let object = state.mems.get_mut(&mem).ok_or(ClError::InvalidMemObject)?;
        let range = checked_range(offset, bytes.len(), object.data.len())?;
        object.data[range].copy_from_slice(bytes);

        Ok(())
    }

    pub fn queue_reference_count(&self, queue: Queue) -> Option<u32> {
        self.state.lock().queues.get(&queue).map(|o| o.ref_count)
    }

    pub fn mem_reference_count(&self, mem: Mem) -> Option<u32> {
        self.state.lock().mems.get(&mem).map(|o| o.ref_count)
    }

    pub fn kernel_reference_count(&self, kernel: Kernel) -> Option<u32> {
        self.state.lock().kernels.get(&kernel).map(|o| o.ref_count)
    }

    pub fn event_reference_count(&self, event: Event) -> Option<u32> {
        self.state.lock().events.get(&event).map(|o| o.ref_count)
    }

    /// Returns the number of kernels that have not been fully released.
    pub fn live_kernels(&self) -> usize {
        self.state.lock().kernels.len()
    }

    /// Returns the number of events that have not been fully released.
    pub fn live_events(&self) -> usize {
        self.state.lock().events.len()
    }

    /// Returns how many times the format of an image has been queried.
    pub fn image_format_queries(&self) -> usize {
        self.state.lock().image_format_queries
    }

    /// Returns the call log.
    pub fn calls(&self) -> Vec<HostCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Makes the primitive call `n` calls from now (counting from zero) fail with `error`,
    /// without executing. The call is still logged.
    pub fn fail_nth_enqueue(&self, n: usize, error: ClError) {
        self.state.lock().failure = Some((n, error));
    }

    fn check_platform(&self, platform: Platform) -> Result<(), ClError> {
        if platform == self.platform {
            Ok(())
        } else {
            Err(ClError::InvalidPlatform)
        }
    }

    fn check_device(&self, device: Device) -> Result<(), ClError> {
        if device == self.device {
            Ok(())
        } else {
            Err(ClError::InvalidDevice)
        }
    }

    fn extension_string(&self) -> String {
        let names: Vec<&str> = self
            .create_info
            .extensions
            .iter()
            .map(|extension| extension.name.as_str())
            .collect();

        names.join(" ")
    }
}

impl HostState {
    /// Logs a primitive call and decides whether it may run.
    fn begin_enqueue(&mut self, call: HostCall) -> Result<(), ClError> {
        let queue = call.queue();
        self.calls.push(call);

        match self.failure {
            Some((0, error)) => {
                self.failure = None;
                return Err(error);
            }
            Some((ref mut remaining, _)) => *remaining -= 1,
            None => (),
        }

        if !self.queues.contains_key(&queue) {
            return Err(ClError::InvalidCommandQueue);
        }

        Ok(())
    }

    fn buffer(&self, mem: Mem) -> Result<&[u8], ClError> {
        match self.mems.get(&mem) {
            Some(object) if object.image.is_none() => Ok(&object.data),
            _ => Err(ClError::InvalidMemObject),
        }
    }

    fn buffer_mut(&mut self, mem: Mem) -> Result<&mut [u8], ClError> {
        match self.mems.get_mut(&mem) {
            Some(object) if object.image.is_none() => Ok(&mut object.data),
            _ => Err(ClError::InvalidMemObject),
        }
    }

    fn image(&self, mem: Mem) -> Result<(ImageDesc, &[u8]), ClError> {
        match self.mems.get(&mem) {
            Some(MemObject {
                image: Some(desc),
                data,
                ..
            }) => Ok((*desc, data)),
            _ => Err(ClError::InvalidMemObject),
        }
    }

    fn image_mut(&mut self, mem: Mem) -> Result<(ImageDesc, &mut [u8]), ClError> {
        match self.mems.get_mut(&mem) {
            Some(MemObject {
                image: Some(desc),
                data,
                ..
            }) => Ok((*desc, data)),
            _ => Err(ClError::InvalidMemObject),
        }
    }

    fn create_event(&mut self, handle: Event, command_type: CommandType) -> Event {
        let t = self.clock;
        self.clock += 10;
        self.events.insert(
            handle,
            EventObject {
                ref_count: 1,
                command_type,
                timestamps: Some([t, t + 1, t + 2, t + 3]),
            },
        );

        handle
    }
}

fn retain_object<H, T>(
    map: &mut HashMap<H, T>,
    handle: H,
    error: ClError,
) -> Result<(), ClError>
where
    H: Hash + Eq,
    T: RefCounted,
{
    let object = map.get_mut(&handle).ok_or(error)?;
    *object.ref_count() += 1;

    Ok(())
}

fn release_object<H, T>(
    map: &mut HashMap<H, T>,
    handle: H,
    error: ClError,
) -> Result<(), ClError>
where
    H: Hash + Eq,
    T: RefCounted,
{
    let object = map.get_mut(&handle).ok_or(error)?;
    let ref_count = object.ref_count();
    *ref_count -= 1;

    if *ref_count == 0 {
        map.remove(&handle);
    }

    Ok(())
}

fn checked_range(offset: usize, size: usize, len: usize) -> Result<Range<usize>, ClError> {
    match offset.checked_add(size) {
        Some(end) if end <= len => Ok(offset..end),
        _ => Err(ClError::InvalidValue),
    }
}

/// Returns the byte ranges of the rows of a region of an image, in order.
fn image_rows(
    desc: &ImageDesc,
    origin: [usize; 3],
    region: [usize; 3],
) -> Result<Vec<Range<usize>>, ClError> {
    for i in 0..3 {
        match origin[i].checked_add(region[i]) {
            Some(end) if end <= desc.extent[i] => (),
            _ => return Err(ClError::InvalidValue),
        }
    }

    let row_pitch = desc.extent[0] * desc.texel_size;
    let slice_pitch = row_pitch * desc.extent[1];

    rows(
        origin[0] * desc.texel_size,
        origin,
        region[0] * desc.texel_size,
        region,
        row_pitch,
        slice_pitch,
        slice_pitch * desc.extent[2],
    )
}

/// Returns the byte ranges of the rows of a region, failing if any of them would end past
/// `limit` or if the arithmetic overflows.
fn rows(
    x_offset: usize,
    origin: [usize; 3],
    row_size: usize,
    region: [usize; 3],
    row_pitch: usize,
    slice_pitch: usize,
    limit: usize,
) -> Result<Vec<Range<usize>>, ClError> {
    let mut rows = Vec::new();

    for z in 0..region[2] {
        for y in 0..region[1] {
            let start = origin[2]
                .checked_add(z)
                .and_then(|z| z.checked_mul(slice_pitch))
                .and_then(|offset| {
                    origin[1]
                        .checked_add(y)
                        .and_then(|y| y.checked_mul(row_pitch))
                        .and_then(|row| offset.checked_add(row))
                })
                .and_then(|offset| offset.checked_add(x_offset))
                .ok_or(ClError::InvalidValue)?;
            let end = start
                .checked_add(row_size)
                .filter(|&end| end <= limit)
                .ok_or(ClError::InvalidValue)?;
            rows.push(start..end);
        }
    }

    Ok(rows)
}

fn gather(data: &[u8], rows: &[Range<usize>]) -> Result<Vec<u8>, ClError> {
    let mut bytes = Vec::new();

    for row in rows {
        bytes.extend_from_slice(data.get(row.clone()).ok_or(ClError::InvalidValue)?);
    }

    Ok(bytes)
}

fn scatter(data: &mut [u8], rows: &[Range<usize>], mut bytes: &[u8]) -> Result<(), ClError> {
    if rows.iter().any(|row| row.end > data.len()) {
        return Err(ClError::InvalidValue);
    }

    for row in rows {
        let (head, tail) = bytes.split_at(row.len());
        data[row.clone()].copy_from_slice(head);
        bytes = tail;
    }

    Ok(())
}

/// Encodes one texel of `format` filled with `color`.
fn encode_texel(format: ImageFormat, color: FillColor) -> Result<SmallVec<[u8; 16]>, ClError> {
    let channels: &[usize] = match format.channel_order {
        ChannelOrder::R | ChannelOrder::Intensity | ChannelOrder::Luminance => &[0],
        ChannelOrder::A => &[3],
        ChannelOrder::RG => &[0, 1],
        ChannelOrder::RA => &[0, 3],
        ChannelOrder::RGB => &[0, 1, 2],
        ChannelOrder::RGBA => &[0, 1, 2, 3],
        ChannelOrder::BGRA => &[2, 1, 0, 3],
        ChannelOrder::ARGB => &[3, 0, 1, 2],
        ChannelOrder::Depth => &[0],
        ChannelOrder::DepthStencil => return Err(ClError::ImageFormatNotSupported),
    };
    let is_depth = format.channel_order == ChannelOrder::Depth;
    let ty = format.channel_data_type;
    let mut texel = SmallVec::new();

    match color {
        FillColor::Depth(depth) if is_depth => encode_float(ty, depth, &mut texel)?,
        FillColor::Float(color) if !is_depth => {
            for &channel in channels {
                encode_float(ty, color[channel], &mut texel)?;
            }
        }
        FillColor::Int(color) if !is_depth => {
            for &channel in channels {
                let value = color[channel];

                match ty {
                    ChannelType::SignedInt8 => {
                        texel.push(value.clamp(i8::MIN.into(), i8::MAX.into()) as i8 as u8)
                    }
                    ChannelType::SignedInt16 => texel.extend_from_slice(
                        &(value.clamp(i16::MIN.into(), i16::MAX.into()) as i16).to_ne_bytes(),
                    ),
                    ChannelType::SignedInt32 => texel.extend_from_slice(&value.to_ne_bytes()),
                    _ => return Err(ClError::InvalidValue),
                }
            }
        }
        FillColor::Uint(color) if !is_depth => {
            for &channel in channels {
                let value = color[channel];

                match ty {
                    ChannelType::UnsignedInt8 => texel.push(value.min(u8::MAX.into()) as u8),
                    ChannelType::UnsignedInt16 => texel
                        .extend_from_slice(&(value.min(u16::MAX.into()) as u16).to_ne_bytes()),
                    ChannelType::UnsignedInt32 => texel.extend_from_slice(&value.to_ne_bytes()),
                    _ => return Err(ClError::InvalidValue),
                }
            }
        }
        _ => return Err(ClError::InvalidValue),
    }

    Ok(texel)
}

fn encode_float(
    ty: ChannelType,
    value: f32,
    texel: &mut SmallVec<[u8; 16]>,
) -> Result<(), ClError> {
    match ty {
        ChannelType::Float => texel.extend_from_slice(&value.to_ne_bytes()),
        ChannelType::HalfFloat => {
            texel.extend_from_slice(bytemuck::bytes_of(&f16::from_f32(value)))
        }
        ChannelType::UnormInt8 => texel.push((value.clamp(0.0, 1.0) * 255.0).round() as u8),
        ChannelType::UnormInt16 => texel.extend_from_slice(
            &((value.clamp(0.0, 1.0) * 65535.0).round() as u16).to_ne_bytes(),
        ),
        ChannelType::SnormInt8 => {
            texel.push((value.clamp(-1.0, 1.0) * 127.0).round() as i8 as u8)
        }
        ChannelType::SnormInt16 => texel.extend_from_slice(
            &((value.clamp(-1.0, 1.0) * 32767.0).round() as i16).to_ne_bytes(),
        ),
        ChannelType::UnormShort565
        | ChannelType::UnormShort555
        | ChannelType::UnormInt101010
        | ChannelType::UnormInt24 => return Err(ClError::ImageFormatNotSupported),
        _ => return Err(ClError::InvalidValue),
    }

    Ok(())
}

/// What a kernel body sees when it is dispatched.
pub struct KernelInvocation<'a> {
    args: &'a [Option<Vec<u8>>],
    mems: &'a mut HashMap<Mem, MemObject>,
    work_dim: u32,
    global_work_offset: &'a [usize],
    global_work_size: &'a [usize],
}

impl KernelInvocation<'_> {
    /// Returns the bytes bound to argument `index`.
    pub fn arg(&self, index: u32) -> Option<&[u8]> {
        self.args.get(index as usize)?.as_deref()
    }

    /// Returns argument `index` as a `T`, if its size matches.
    pub fn arg_value<T: AnyBitPattern>(&self, index: u32) -> Option<T> {
        let bytes = self.arg(index)?;

        (bytes.len() == size_of::<T>()).then(|| bytemuck::pod_read_unaligned(bytes))
    }

    /// Returns the contents of the buffer whose handle is bound to argument `index`.
    pub fn buffer_mut(&mut self, index: u32) -> Result<&mut [u8], ClError> {
        let mem = Mem::from_raw(self.arg_value::<u64>(index).ok_or(ClError::InvalidArgValue)?);

        match self.mems.get_mut(&mem) {
            Some(object) if object.image.is_none() => Ok(&mut object.data),
            _ => Err(ClError::InvalidMemObject),
        }
    }

    #[inline]
    pub fn work_dim(&self) -> u32 {
        self.work_dim
    }

    /// Returns the global ID of every work-item, in linear order.
    pub fn global_ids(&self) -> impl Iterator<Item = [usize; 3]> + '_ {
        let dim = |i: usize, values: &[usize], default: usize| -> usize {
            values.get(i).copied().unwrap_or(default)
        };
        let size = [
            dim(0, self.global_work_size, 1),
            dim(1, self.global_work_size, 1),
            dim(2, self.global_work_size, 1),
        ];
        let offset = [
            dim(0, self.global_work_offset, 0),
            dim(1, self.global_work_offset, 0),
            dim(2, self.global_work_offset, 0),
        ];

        (0..size[2]).flat_map(move |z| {
            (0..size[1]).flat_map(move |y| {
                (0..size[0]).map(move |x| [offset[0] + x, offset[1] + y, offset[2] + z])
            })
        })
    }
}

impl Dispatch for HostDispatch {
    fn platform_extensions(&self, platform: Platform) -> Result<String, ClError> {
        self.check_platform(platform)?;

        Ok(self.extension_string())
    }

    fn platform_extensions_with_version(
        &self,
        platform: Platform,
    ) -> Result<Vec<NameVersion>, ClError> {
        self.check_platform(platform)?;

        Ok(self.create_info.extensions.clone())
    }

    fn platform_version(&self, platform: Platform) -> Result<String, ClError> {
        self.check_platform(platform)?;

        Ok(self.create_info.platform_version.clone())
    }

    fn device_extensions(&self, device: Device) -> Result<String, ClError> {
        self.check_device(device)?;

        Ok(self.extension_string())
    }

    fn device_extensions_with_version(
        &self,
        device: Device,
    ) -> Result<Vec<NameVersion>, ClError> {
        self.check_device(device)?;

        Ok(self.create_info.extensions.clone())
    }

    fn device_version(&self, device: Device) -> Result<String, ClError> {
        self.check_device(device)?;

        Ok(self.create_info.device_version.clone())
    }

    fn device_queue_properties(&self, device: Device) -> Result<QueueProperties, ClError> {
        self.check_device(device)?;

        Ok(self.create_info.queue_properties)
    }

    fn device_enqueue_capabilities(
        &self,
        device: Device,
    ) -> Result<DeviceEnqueueCapabilities, ClError> {
        self.check_device(device)?;

        Ok(self.create_info.device_enqueue_capabilities)
    }

    fn device_command_buffer_capabilities(
        &self,
        device: Device,
    ) -> Result<CommandBufferCapabilities, ClError> {
        self.check_device(device)?;

        // Command buffers are not supported natively.
        Err(ClError::InvalidValue)
    }

    fn device_command_buffer_required_queue_properties(
        &self,
        device: Device,
    ) -> Result<QueueProperties, ClError> {
        self.check_device(device)?;

        Err(ClError::InvalidValue)
    }

    fn queue_context(&self, queue: Queue) -> Result<Context, ClError> {
        if self.state.lock().queues.contains_key(&queue) {
            Ok(self.context)
        } else {
            Err(ClError::InvalidCommandQueue)
        }
    }

    fn queue_device(&self, queue: Queue) -> Result<Device, ClError> {
        if self.state.lock().queues.contains_key(&queue) {
            Ok(self.device)
        } else {
            Err(ClError::InvalidCommandQueue)
        }
    }

    fn finish(&self, queue: Queue) -> Result<(), ClError> {
        // Everything has already executed.
        self.queue_context(queue).map(drop)
    }

    fn retain_queue(&self, queue: Queue) -> Result<(), ClError> {
        retain_object(
            &mut self.state.lock().queues,
            queue,
            ClError::InvalidCommandQueue,
        )
    }

    fn release_queue(&self, queue: Queue) -> Result<(), ClError> {
        release_object(
            &mut self.state.lock().queues,
            queue,
            ClError::InvalidCommandQueue,
        )
    }

    fn retain_mem(&self, mem: Mem) -> Result<(), ClError> {
        retain_object(&mut self.state.lock().mems, mem, ClError::InvalidMemObject)
    }

    fn release_mem(&self, mem: Mem) -> Result<(), ClError> {
        release_object(&mut self.state.lock().mems, mem, ClError::InvalidMemObject)
    }

    fn retain_kernel(&self, kernel: Kernel) -> Result<(), ClError> {
        retain_object(&mut self.state.lock().kernels, kernel, ClError::InvalidKernel)
    }

    fn release_kernel(&self, kernel: Kernel) -> Result<(), ClError> {
        release_object(&mut self.state.lock().kernels, kernel, ClError::InvalidKernel)
    }

    fn retain_event(&self, event: Event) -> Result<(), ClError> {
        retain_object(&mut self.state.lock().events, event, ClError::InvalidEvent)
    }

    fn release_event(&self, event: Event) -> Result<(), ClError> {
        release_object(&mut self.state.lock().events, event, ClError::InvalidEvent)
    }

    fn image_format(&self, image: Mem) -> Result<ImageFormat, ClError> {
        let mut state = self.state.lock();
        state.image_format_queries += 1;
        let (desc, _) = state.image(image)?;

        Ok(desc.format)
    }

    fn clone_kernel(&self, kernel: Kernel) -> Result<Kernel, ClError> {
        let clone = self.allocate_handle();
        let mut state = self.state.lock();
        let object = state.kernels.get(&kernel).ok_or(ClError::InvalidKernel)?;
        let object = KernelObject {
            ref_count: 1,
            function: object.function.clone(),
            args: object.args.clone(),
        };
        state.kernels.insert(clone, object);

        Ok(clone)
    }

    fn set_kernel_arg(&self, kernel: Kernel, index: u32, value: &[u8]) -> Result<(), ClError> {
        let mut state = self.state.lock();
        let object = state.kernels.get_mut(&kernel).ok_or(ClError::InvalidKernel)?;
        let arg = object
            .args
            .get_mut(index as usize)
            .ok_or(ClError::InvalidArgIndex)?;
        *arg = Some(value.to_vec());

        Ok(())
    }

    fn event_command_type(&self, event: Event) -> Result<CommandType, ClError> {
        let state = self.state.lock();
        let object = state.events.get(&event).ok_or(ClError::InvalidEvent)?;

        Ok(object.command_type)
    }

    fn event_profiling_info(&self, event: Event, info: ProfilingInfo) -> Result<u64, ClError> {
        let state = self.state.lock();
        let object = state.events.get(&event).ok_or(ClError::InvalidEvent)?;
        let timestamps = object
            .timestamps
            .ok_or(ClError::ProfilingInfoNotAvailable)?;

        Ok(match info {
            ProfilingInfo::Queued => timestamps[0],
            ProfilingInfo::Submit => timestamps[1],
            ProfilingInfo::Start => timestamps[2],
            ProfilingInfo::End | ProfilingInfo::Complete => timestamps[3],
        })
    }

    fn extension_function_address(
        &self,
        platform: Platform,
        name: &str,
    ) -> Option<ExtensionFunction> {
        self.check_platform(platform).ok()?;

        let index = self
            .create_info
            .native_functions
            .iter()
            .position(|native| native == name)?;

        NonZeroUsize::new(0x1000 + index * 0x10).map(ExtensionFunction::Native)
    }

    fn enqueue_barrier_with_wait_list(
        &self,
        queue: Queue,
        wait_list: &[Event],
        signal: bool,
    ) -> Result<Option<Event>, ClError> {
        let handle = self.allocate_handle();
        let mut state = self.state.lock();
        state.begin_enqueue(HostCall::Barrier {
            queue,
            wait_list: wait_list.len(),
            signal,
        })?;

        if wait_list.iter().any(|event| !state.events.contains_key(event)) {
            return Err(ClError::InvalidEventWaitList);
        }

        Ok(signal.then(|| state.create_event(handle, CommandType::Barrier)))
    }

    fn enqueue_copy_buffer(&self, queue: Queue, info: &CopyBufferInfo) -> Result<(), ClError> {
        let mut state = self.state.lock();
        state.begin_enqueue(HostCall::CopyBuffer {
            queue,
            src: info.src_buffer,
            dst: info.dst_buffer,
        })?;

        let src = state.buffer(info.src_buffer)?;
        let src_range = checked_range(info.src_offset, info.size, src.len())?;
        let bytes = src[src_range.clone()].to_vec();

        let dst = state.buffer_mut(info.dst_buffer)?;
        let dst_range = checked_range(info.dst_offset, info.size, dst.len())?;

        if info.src_buffer == info.dst_buffer
            && src_range.start < dst_range.end
            && dst_range.start < src_range.end
        {
            return Err(ClError::MemCopyOverlap);
        }

        dst[dst_range].copy_from_slice(&bytes);

        Ok(())
    }

    fn enqueue_copy_buffer_rect(
        &self,
        queue: Queue,
        info: &CopyBufferRectInfo,
    ) -> Result<(), ClError> {
        let mut state = self.state.lock();
        state.begin_enqueue(HostCall::CopyBufferRect {
            queue,
            src: info.src_buffer,
            dst: info.dst_buffer,
        })?;

        let region = info.region;
        if region.contains(&0) {
            return Err(ClError::InvalidValue);
        }

        let pitches = |row_pitch: usize, slice_pitch: usize| {
            let row_pitch = if row_pitch == 0 { region[0] } else { row_pitch };
            let slice_pitch = if slice_pitch == 0 {
                region[1].checked_mul(row_pitch)
            } else {
                Some(slice_pitch)
            };

            slice_pitch
                .map(|slice_pitch| (row_pitch, slice_pitch))
                .ok_or(ClError::InvalidValue)
        };
        let (src_row_pitch, src_slice_pitch) = pitches(info.src_row_pitch, info.src_slice_pitch)?;
        let (dst_row_pitch, dst_slice_pitch) = pitches(info.dst_row_pitch, info.dst_slice_pitch)?;

        let src_rows = rows(
            info.src_origin[0],
            info.src_origin,
            region[0],
            region,
            src_row_pitch,
            src_slice_pitch,
            state.buffer(info.src_buffer)?.len(),
        )?;
        let dst_rows = rows(
            info.dst_origin[0],
            info.dst_origin,
            region[0],
            region,
            dst_row_pitch,
            dst_slice_pitch,
            state.buffer(info.dst_buffer)?.len(),
        )?;

        let bytes = gather(state.buffer(info.src_buffer)?, &src_rows)?;
        scatter(state.buffer_mut(info.dst_buffer)?, &dst_rows, &bytes)
    }

    fn enqueue_copy_buffer_to_image(
        &self,
        queue: Queue,
        info: &CopyBufferToImageInfo,
    ) -> Result<(), ClError> {
        let mut state = self.state.lock();
        state.begin_enqueue(HostCall::CopyBufferToImage {
            queue,
            src: info.src_buffer,
            dst: info.dst_image,
        })?;

        let (desc, _) = state.image(info.dst_image)?;
        let dst_rows = image_rows(&desc, info.dst_origin, info.region)?;
        let size = dst_rows.iter().map(|row| row.len()).sum();

        let src = state.buffer(info.src_buffer)?;
        let src_range = checked_range(info.src_offset, size, src.len())?;
        let bytes = src[src_range].to_vec();

        let (_, dst) = state.image_mut(info.dst_image)?;
        scatter(dst, &dst_rows, &bytes)
    }

    fn enqueue_copy_image(&self, queue: Queue, info: &CopyImageInfo) -> Result<(), ClError> {
        let mut state = self.state.lock();
        state.begin_enqueue(HostCall::CopyImage {
            queue,
            src: info.src_image,
            dst: info.dst_image,
        })?;

        let (src_desc, src) = state.image(info.src_image)?;
        let src_rows = image_rows(&src_desc, info.src_origin, info.region)?;
        let bytes = gather(src, &src_rows)?;

        let (dst_desc, dst) = state.image_mut(info.dst_image)?;

        if dst_desc.format != src_desc.format {
            return Err(ClError::ImageFormatMismatch);
        }

        let dst_rows = image_rows(&dst_desc, info.dst_origin, info.region)?;
        scatter(dst, &dst_rows, &bytes)
    }

    fn enqueue_copy_image_to_buffer(
        &self,
        queue: Queue,
        info: &CopyImageToBufferInfo,
    ) -> Result<(), ClError> {
        let mut state = self.state.lock();
        state.begin_enqueue(HostCall::CopyImageToBuffer {
            queue,
            src: info.src_image,
            dst: info.dst_buffer,
        })?;

        let (desc, src) = state.image(info.src_image)?;
        let src_rows = image_rows(&desc, info.src_origin, info.region)?;
        let bytes = gather(src, &src_rows)?;

        let dst = state.buffer_mut(info.dst_buffer)?;
        let dst_range = checked_range(info.dst_offset, bytes.len(), dst.len())?;
        dst[dst_range].copy_from_slice(&bytes);

        Ok(())
    }

    fn enqueue_fill_buffer(&self, queue: Queue, info: &FillBufferInfo) -> Result<(), ClError> {
        let mut state = self.state.lock();
        state.begin_enqueue(HostCall::FillBuffer {
            queue,
            buffer: info.buffer,
        })?;

        let dst = state.buffer_mut(info.buffer)?;
        let pattern = &info.pattern;

        if pattern.is_empty() || info.size % pattern.len() != 0 {
            return Err(ClError::InvalidValue);
        }

        let range = checked_range(info.offset, info.size, dst.len())?;

        for chunk in dst[range].chunks_exact_mut(pattern.len()) {
            chunk.copy_from_slice(pattern);
        }

        Ok(())
    }

    fn enqueue_fill_image(&self, queue: Queue, info: &FillImageInfo) -> Result<(), ClError> {
        let mut state = self.state.lock();
        state.begin_enqueue(HostCall::FillImage {
            queue,
            image: info.image,
        })?;

        let (desc, dst) = state.image_mut(info.image)?;
        let texel = encode_texel(desc.format, info.fill_color)?;
        let dst_rows = image_rows(&desc, info.origin, info.region)?;

        for row in dst_rows {
            for chunk in dst[row].chunks_exact_mut(texel.len()) {
                chunk.copy_from_slice(&texel);
            }
        }

        Ok(())
    }

    fn enqueue_nd_range_kernel(
        &self,
        queue: Queue,
        info: &NdRangeKernelInfo,
    ) -> Result<(), ClError> {
        let mut state = self.state.lock();
        state.begin_enqueue(HostCall::NdRangeKernel {
            queue,
            kernel: info.kernel,
        })?;

        let HostState { kernels, mems, .. } = &mut *state;
        let kernel = kernels.get(&info.kernel).ok_or(ClError::InvalidKernel)?;
        let work_dim = info.work_dim as usize;

        if !(1..=3).contains(&work_dim) {
            return Err(ClError::InvalidWorkDimension);
        }

        if info.global_work_size.len() != work_dim {
            return Err(ClError::InvalidGlobalWorkSize);
        }

        if !info.global_work_offset.is_empty() && info.global_work_offset.len() != work_dim {
            return Err(ClError::InvalidGlobalOffset);
        }

        if !info.local_work_size.is_empty() && info.local_work_size.len() != work_dim {
            return Err(ClError::InvalidWorkGroupSize);
        }

        if kernel.args.iter().any(Option::is_none) {
            return Err(ClError::InvalidKernelArgs);
        }

        let function = kernel.function.clone();
        let mut invocation = KernelInvocation {
            args: &kernel.args,
            mems,
            work_dim: info.work_dim,
            global_work_offset: &info.global_work_offset,
            global_work_size: &info.global_work_size,
        };

        function(&mut invocation)
    }
}
