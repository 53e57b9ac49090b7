// Copyright (c) 2024 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The extension entry points, as seen from the other side of the API boundary.
//!
//! Command buffers are handed out as opaque [`CommandBufferHandle`]s. Every entry point first
//! resolves its handle through the registry of the layer, so a handle that was never issued,
//! or whose command buffer has been destroyed, is reported as `InvalidCommandBuffer` without
//! touching anything. Errors are reduced to their status code here; validation errors are
//! logged before their detail is lost.

use crate::{
    command_buffer::{
        CommandBuffer, CommandBufferInfo, CommandRecordInfo, CopyBufferInfo, CopyBufferRectInfo,
        CopyBufferToImageInfo, CopyImageInfo, CopyImageToBufferInfo, FillBufferInfo, FillColor,
        FillImageInfo, NdRangeKernelInfo, SubmitInfo, SyncPoint,
    },
    fns::{ChannelOrder, ChannelType, ExtensionFunction, ImageFormat},
    handle::{Event, Handle, Kernel, Mem, MutableCommand, Platform, Queue},
    layer::Layer,
    param::{write_param, write_slice},
    ClError, Validated, ValidationError,
};
use foldhash::HashMap;
use parking_lot::Mutex;
use std::{
    fmt::{Debug, Display, Error as FmtError, Formatter},
    str::FromStr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};
use tracing::debug;

/// The layer info query for [`Layer::API_VERSION`].
pub const LAYER_API_VERSION: u32 = 0x4240;

/// An opaque reference to a command buffer created through a [`Layer`].
///
/// The upper 32 bits hold a tag, the lower 32 bits the registry slot. Slots are never reused
/// within a layer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CommandBufferHandle(u64);

impl CommandBufferHandle {
    const MAGIC: u32 = u32::from_be_bytes(*b"CMDB");

    #[inline]
    fn new(slot: u32) -> Self {
        Self((u64::from(Self::MAGIC) << 32) | u64::from(slot))
    }

    /// Wraps a raw handle value. The value is only checked when the handle is used.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Returns the registry slot, or `None` if the value was not issued as a handle.
    #[inline]
    fn slot(self) -> Option<u32> {
        ((self.0 >> 32) as u32 == Self::MAGIC).then_some(self.0 as u32)
    }
}

impl Debug for CommandBufferHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "CommandBufferHandle({:#x})", self.0)
    }
}

/// Owns the command buffers of a layer, keyed by slot.
#[derive(Default)]
pub(crate) struct Registry {
    entries: Mutex<HashMap<u32, Arc<CommandBuffer>>>,
    last_slot: AtomicU32,
}

impl Registry {
    fn insert(&self, command_buffer: Arc<CommandBuffer>) -> Result<CommandBufferHandle, ClError> {
        let slot = self
            .last_slot
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |slot| {
                slot.checked_add(1)
            })
            .map_err(|_| ClError::OutOfResources)?
            + 1;
        self.entries.lock().insert(slot, command_buffer);

        Ok(CommandBufferHandle::new(slot))
    }

    fn get(&self, handle: CommandBufferHandle) -> Result<Arc<CommandBuffer>, ClError> {
        handle
            .slot()
            .and_then(|slot| self.entries.lock().get(&slot).cloned())
            .ok_or(ClError::InvalidCommandBuffer)
    }

    fn remove(&self, handle: CommandBufferHandle) -> Option<Arc<CommandBuffer>> {
        self.entries.lock().remove(&handle.slot()?)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

macro_rules! entry_points {
    ($($variant:ident = $name:literal,)+) => {
        /// An entry point of the emulated extension.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        pub enum EntryPoint {
            $($variant,)+
        }

        impl EntryPoint {
            /// Every entry point, in lookup order.
            pub const ALL: &'static [EntryPoint] = &[$(EntryPoint::$variant,)+];

            /// Returns the name that the entry point is looked up by.
            #[inline]
            pub const fn name(self) -> &'static str {
                match self {
                    $(EntryPoint::$variant => $name,)+
                }
            }
        }

        impl FromStr for EntryPoint {
            type Err = ();

            fn from_str(name: &str) -> Result<Self, Self::Err> {
                match name {
                    $($name => Ok(EntryPoint::$variant),)+
                    _ => Err(()),
                }
            }
        }
    };
}

entry_points! {
    CreateCommandBuffer = "clCreateCommandBufferKHR",
    FinalizeCommandBuffer = "clFinalizeCommandBufferKHR",
    RetainCommandBuffer = "clRetainCommandBufferKHR",
    ReleaseCommandBuffer = "clReleaseCommandBufferKHR",
    EnqueueCommandBuffer = "clEnqueueCommandBufferKHR",
    CommandBarrierWithWaitList = "clCommandBarrierWithWaitListKHR",
    CommandCopyBuffer = "clCommandCopyBufferKHR",
    CommandCopyBufferRect = "clCommandCopyBufferRectKHR",
    CommandCopyBufferToImage = "clCommandCopyBufferToImageKHR",
    CommandCopyImage = "clCommandCopyImageKHR",
    CommandCopyImageToBuffer = "clCommandCopyImageToBufferKHR",
    CommandFillBuffer = "clCommandFillBufferKHR",
    CommandFillImage = "clCommandFillImageKHR",
    CommandNdRangeKernel = "clCommandNDRangeKernelKHR",
    GetCommandBufferInfo = "clGetCommandBufferInfoKHR",
}

impl Display for EntryPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.write_str(self.name())
    }
}

fn reject(entry_point: EntryPoint, err: Validated<ClError>) -> ClError {
    if let Validated::ValidationError(err) = &err {
        debug!(%entry_point, %err, "rejected call");
    }

    err.code()
}

/// The fields shared by every `command_*` entry point.
struct Record<'a, 'b> {
    entry_point: EntryPoint,
    command_buffer: CommandBufferHandle,
    command_queue: Option<Queue>,
    num_sync_points_in_wait_list: u32,
    sync_point_wait_list: Option<&'a [SyncPoint]>,
    sync_point: Option<&'b mut SyncPoint>,
    mutable_handle: Option<&'b mut MutableCommand>,
}

impl Layer {
    /// Looks up an extension function by name. A function that the next implementation provides
    /// itself is preferred over the emulated one.
    pub fn get_extension_function_address(
        &self,
        platform: Platform,
        name: &str,
    ) -> Option<ExtensionFunction> {
        self.next
            .extension_function_address(platform, name)
            .or_else(|| name.parse().ok().map(ExtensionFunction::Emulated))
    }

    /// Queries information about the layer itself.
    pub fn get_layer_info(
        param_name: u32,
        param_value: Option<&mut [u8]>,
    ) -> Result<usize, ClError> {
        match param_name {
            LAYER_API_VERSION => write_param(param_value, &Self::API_VERSION),
            _ => Err(ClError::InvalidValue),
        }
    }

    /// Returns the command buffer that `handle` refers to.
    pub fn command_buffer(
        &self,
        handle: CommandBufferHandle,
    ) -> Result<Arc<CommandBuffer>, ClError> {
        self.registry.get(handle)
    }

    /// Creates a command buffer for exactly one queue. `properties` is a zero-terminated list of
    /// key-value pairs.
    pub fn create_command_buffer(
        &self,
        queues: &[Queue],
        properties: Option<&[u64]>,
    ) -> Result<CommandBufferHandle, ClError> {
        let command_buffer = CommandBuffer::from_properties(
            self.next.clone(),
            queues,
            properties,
            self.create_info.enhanced_error_checking,
        )
        .map_err(|err| reject(EntryPoint::CreateCommandBuffer, err))?;
        let handle = self.registry.insert(command_buffer)?;

        debug!(?handle, "issued command buffer handle");

        Ok(handle)
    }

    pub fn finalize_command_buffer(
        &self,
        command_buffer: CommandBufferHandle,
    ) -> Result<(), ClError> {
        self.command_buffer(command_buffer)?
            .finalize()
            .map_err(|err| reject(EntryPoint::FinalizeCommandBuffer, err.into()))
    }

    pub fn retain_command_buffer(
        &self,
        command_buffer: CommandBufferHandle,
    ) -> Result<(), ClError> {
        self.command_buffer(command_buffer)?.retain();

        Ok(())
    }

    /// Decrements the reference count of a command buffer, and destroys it when the count
    /// reaches zero. The handle is invalid afterwards.
    pub fn release_command_buffer(
        &self,
        command_buffer: CommandBufferHandle,
    ) -> Result<(), ClError> {
        if self.command_buffer(command_buffer)?.release() {
            self.registry.remove(command_buffer);
        }

        Ok(())
    }

    /// Enqueues a finalized command buffer, on its own queue or on the single queue in
    /// `queues`.
    ///
    /// If `event` is `Some`, it receives an event that is signaled once every command has
    /// completed. The event reports the command type `CommandBufferKhr`, and the queued, submit
    /// and start times of the submission as a whole.
    pub fn enqueue_command_buffer(
        &self,
        queues: &[Queue],
        command_buffer: CommandBufferHandle,
        event_wait_list: &[Event],
        event: Option<&mut Event>,
    ) -> Result<(), ClError> {
        let submission = self
            .command_buffer(command_buffer)?
            .enqueue(&SubmitInfo {
                queues,
                event_wait_list,
                signal: event.is_some(),
                ..Default::default()
            })
            .map_err(|err| reject(EntryPoint::EnqueueCommandBuffer, err))?;

        if let (Some(event), Some(completion)) = (event, submission.event) {
            *event = completion;

            if let Some(start_event) = submission.start_event {
                let stale = self.event_map.lock().insert(completion, start_event);

                if let Some(stale) = stale {
                    let _ = self.next.release_event(stale);
                }
            }
        }

        Ok(())
    }

    fn record(
        &self,
        record: Record<'_, '_>,
        f: impl FnOnce(
            &CommandBuffer,
            &CommandRecordInfo<'_>,
        ) -> Result<SyncPoint, Validated<ClError>>,
    ) -> Result<(), ClError> {
        let Record {
            entry_point,
            command_buffer,
            command_queue,
            num_sync_points_in_wait_list,
            sync_point_wait_list,
            sync_point,
            mutable_handle,
        } = record;
        let command_buffer = self.command_buffer(command_buffer)?;
        let record_info = CommandRecordInfo {
            command_queue,
            num_sync_points_in_wait_list,
            sync_point_wait_list,
            mutable_handle: mutable_handle.is_some(),
            ..Default::default()
        };
        let id = f(&command_buffer, &record_info).map_err(|err| reject(entry_point, err))?;

        if let Some(sync_point) = sync_point {
            *sync_point = id;
        }

        Ok(())
    }

    pub fn command_barrier_with_wait_list(
        &self,
        command_buffer: CommandBufferHandle,
        command_queue: Option<Queue>,
        num_sync_points_in_wait_list: u32,
        sync_point_wait_list: Option<&[SyncPoint]>,
        sync_point: Option<&mut SyncPoint>,
        mutable_handle: Option<&mut MutableCommand>,
    ) -> Result<(), ClError> {
        self.record(
            Record {
                entry_point: EntryPoint::CommandBarrierWithWaitList,
                command_buffer,
                command_queue,
                num_sync_points_in_wait_list,
                sync_point_wait_list,
                sync_point,
                mutable_handle,
            },
            |cb, record_info| cb.barrier(record_info),
        )
    }

    pub fn command_copy_buffer(
        &self,
        command_buffer: CommandBufferHandle,
        command_queue: Option<Queue>,
        src_buffer: Mem,
        dst_buffer: Mem,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
        num_sync_points_in_wait_list: u32,
        sync_point_wait_list: Option<&[SyncPoint]>,
        sync_point: Option<&mut SyncPoint>,
        mutable_handle: Option<&mut MutableCommand>,
    ) -> Result<(), ClError> {
        let info = CopyBufferInfo {
            src_buffer,
            dst_buffer,
            src_offset,
            dst_offset,
            size,
            ..Default::default()
        };

        self.record(
            Record {
                entry_point: EntryPoint::CommandCopyBuffer,
                command_buffer,
                command_queue,
                num_sync_points_in_wait_list,
                sync_point_wait_list,
                sync_point,
                mutable_handle,
            },
            |cb, record_info| cb.copy_buffer(record_info, info),
        )
    }

    pub fn command_copy_buffer_rect(
        &self,
        command_buffer: CommandBufferHandle,
        command_queue: Option<Queue>,
        src_buffer: Mem,
        dst_buffer: Mem,
        src_origin: [usize; 3],
        dst_origin: [usize; 3],
        region: [usize; 3],
        src_row_pitch: usize,
        src_slice_pitch: usize,
        dst_row_pitch: usize,
        dst_slice_pitch: usize,
        num_sync_points_in_wait_list: u32,
        sync_point_wait_list: Option<&[SyncPoint]>,
        sync_point: Option<&mut SyncPoint>,
        mutable_handle: Option<&mut MutableCommand>,
    ) -> Result<(), ClError> {
        let info = CopyBufferRectInfo {
            src_buffer,
            dst_buffer,
            src_origin,
            dst_origin,
            region,
            src_row_pitch,
            src_slice_pitch,
            dst_row_pitch,
            dst_slice_pitch,
            ..Default::default()
        };

        self.record(
            Record {
                entry_point: EntryPoint::CommandCopyBufferRect,
                command_buffer,
                command_queue,
                num_sync_points_in_wait_list,
                sync_point_wait_list,
                sync_point,
                mutable_handle,
            },
            |cb, record_info| cb.copy_buffer_rect(record_info, info),
        )
    }

    pub fn command_copy_buffer_to_image(
        &self,
        command_buffer: CommandBufferHandle,
        command_queue: Option<Queue>,
        src_buffer: Mem,
        dst_image: Mem,
        src_offset: usize,
        dst_origin: [usize; 3],
        region: [usize; 3],
        num_sync_points_in_wait_list: u32,
        sync_point_wait_list: Option<&[SyncPoint]>,
        sync_point: Option<&mut SyncPoint>,
        mutable_handle: Option<&mut MutableCommand>,
    ) -> Result<(), ClError> {
        let info = CopyBufferToImageInfo {
            src_buffer,
            dst_image,
            src_offset,
            dst_origin,
            region,
            ..Default::default()
        };

        self.record(
            Record {
                entry_point: EntryPoint::CommandCopyBufferToImage,
                command_buffer,
                command_queue,
                num_sync_points_in_wait_list,
                sync_point_wait_list,
                sync_point,
                mutable_handle,
            },
            |cb, record_info| cb.copy_buffer_to_image(record_info, info),
        )
    }

    pub fn command_copy_image(
        &self,
        command_buffer: CommandBufferHandle,
        command_queue: Option<Queue>,
        src_image: Mem,
        dst_image: Mem,
        src_origin: [usize; 3],
        dst_origin: [usize; 3],
        region: [usize; 3],
        num_sync_points_in_wait_list: u32,
        sync_point_wait_list: Option<&[SyncPoint]>,
        sync_point: Option<&mut SyncPoint>,
        mutable_handle: Option<&mut MutableCommand>,
    ) -> Result<(), ClError> {
        let info = CopyImageInfo {
            src_image,
            dst_image,
            src_origin,
            dst_origin,
            region,
            ..Default::default()
        };

        self.record(
            Record {
                entry_point: EntryPoint::CommandCopyImage,
                command_buffer,
                command_queue,
                num_sync_points_in_wait_list,
                sync_point_wait_list,
                sync_point,
                mutable_handle,
            },
            |cb, record_info| cb.copy_image(record_info, info),
        )
    }

    pub fn command_copy_image_to_buffer(
        &self,
        command_buffer: CommandBufferHandle,
        command_queue: Option<Queue>,
        src_image: Mem,
        dst_buffer: Mem,
        src_origin: [usize; 3],
        region: [usize; 3],
        dst_offset: usize,
        num_sync_points_in_wait_list: u32,
        sync_point_wait_list: Option<&[SyncPoint]>,
        sync_point: Option<&mut SyncPoint>,
        mutable_handle: Option<&mut MutableCommand>,
    ) -> Result<(), ClError> {
        let info = CopyImageToBufferInfo {
            src_image,
            dst_buffer,
            src_origin,
            region,
            dst_offset,
            ..Default::default()
        };

        self.record(
            Record {
                entry_point: EntryPoint::CommandCopyImageToBuffer,
                command_buffer,
                command_queue,
                num_sync_points_in_wait_list,
                sync_point_wait_list,
                sync_point,
                mutable_handle,
            },
            |cb, record_info| cb.copy_image_to_buffer(record_info, info),
        )
    }

    /// Records a buffer fill. The pattern is copied.
    pub fn command_fill_buffer(
        &self,
        command_buffer: CommandBufferHandle,
        command_queue: Option<Queue>,
        buffer: Mem,
        pattern: &[u8],
        offset: usize,
        size: usize,
        num_sync_points_in_wait_list: u32,
        sync_point_wait_list: Option<&[SyncPoint]>,
        sync_point: Option<&mut SyncPoint>,
        mutable_handle: Option<&mut MutableCommand>,
    ) -> Result<(), ClError> {
        let info = FillBufferInfo {
            buffer,
            pattern: pattern.into(),
            offset,
            size,
            ..Default::default()
        };

        self.record(
            Record {
                entry_point: EntryPoint::CommandFillBuffer,
                command_buffer,
                command_queue,
                num_sync_points_in_wait_list,
                sync_point_wait_list,
                sync_point,
                mutable_handle,
            },
            |cb, record_info| cb.fill_buffer(record_info, info),
        )
    }

    /// Records an image fill. `fill_color` is the raw colour: one `f32` for depth images, four
    /// 32-bit components for every other format, interpreted according to the channel data
    /// type of the image.
    pub fn command_fill_image(
        &self,
        command_buffer: CommandBufferHandle,
        command_queue: Option<Queue>,
        image: Mem,
        fill_color: &[u8],
        origin: [usize; 3],
        region: [usize; 3],
        num_sync_points_in_wait_list: u32,
        sync_point_wait_list: Option<&[SyncPoint]>,
        sync_point: Option<&mut SyncPoint>,
        mutable_handle: Option<&mut MutableCommand>,
    ) -> Result<(), ClError> {
        self.record(
            Record {
                entry_point: EntryPoint::CommandFillImage,
                command_buffer,
                command_queue,
                num_sync_points_in_wait_list,
                sync_point_wait_list,
                sync_point,
                mutable_handle,
            },
            |cb, record_info| {
                cb.check_record(record_info)?;

                // An image whose format can't be queried is read as a four-component float
                // image; the command then fails on replay like any other command on an invalid
                // object.
                let format = self.next.image_format(image).unwrap_or(ImageFormat {
                    channel_order: ChannelOrder::RGBA,
                    channel_data_type: ChannelType::Float,
                });
                let fill_color = FillColor::from_bytes(format, fill_color).ok_or_else(|| {
                    ValidationError::new(
                        ClError::InvalidValue,
                        "fill_color",
                        "is shorter than a colour of the image format",
                    )
                })?;

                cb.fill_image(
                    record_info,
                    FillImageInfo {
                        image,
                        fill_color,
                        origin,
                        region,
                        ..Default::default()
                    },
                )
            },
        )
    }

    /// Records a kernel dispatch. The kernel is cloned, so arguments set on `kernel` later do
    /// not affect the command.
    ///
    /// No command properties are supported; `properties` must be `None` or an empty,
    /// zero-terminated list.
    pub fn command_nd_range_kernel(
        &self,
        command_buffer: CommandBufferHandle,
        command_queue: Option<Queue>,
        properties: Option<&[u64]>,
        kernel: Kernel,
        work_dim: u32,
        global_work_offset: Option<&[usize]>,
        global_work_size: &[usize],
        local_work_size: Option<&[usize]>,
        num_sync_points_in_wait_list: u32,
        sync_point_wait_list: Option<&[SyncPoint]>,
        sync_point: Option<&mut SyncPoint>,
        mutable_handle: Option<&mut MutableCommand>,
    ) -> Result<(), ClError> {
        let info = NdRangeKernelInfo {
            kernel,
            work_dim,
            global_work_offset: global_work_offset.unwrap_or_default().into(),
            global_work_size: global_work_size.into(),
            local_work_size: local_work_size.unwrap_or_default().into(),
            ..Default::default()
        };

        self.record(
            Record {
                entry_point: EntryPoint::CommandNdRangeKernel,
                command_buffer,
                command_queue,
                num_sync_points_in_wait_list,
                sync_point_wait_list,
                sync_point,
                mutable_handle,
            },
            |cb, record_info| {
                cb.check_record(record_info)?;

                if let Some(&key) = properties.and_then(|properties| properties.first()) {
                    if key != 0 {
                        return Err(ValidationError::new(
                            ClError::InvalidValue,
                            "properties[0]",
                            format!("{:#x} is not a known property", key),
                        )
                        .into());
                    }
                }

                cb.nd_range_kernel(record_info, info)
            },
        )
    }

    /// Queries a property of a command buffer.
    ///
    /// Returns the size of the value. If `param_value` is `Some`, the value is also written to
    /// it, and it must be large enough.
    pub fn get_command_buffer_info(
        &self,
        command_buffer: CommandBufferHandle,
        param_name: u32,
        param_value: Option<&mut [u8]>,
    ) -> Result<usize, ClError> {
        let command_buffer = self.command_buffer(command_buffer)?;
        let param_name = CommandBufferInfo::try_from(param_name).map_err(|()| {
            debug!(
                entry_point = %EntryPoint::GetCommandBufferInfo,
                param_name,
                "rejected call: unknown parameter"
            );

            ClError::InvalidValue
        })?;

        match param_name {
            CommandBufferInfo::Queues => {
                let queues: Vec<u64> = command_buffer
                    .queues()
                    .iter()
                    .map(|queue| queue.as_raw())
                    .collect();

                write_slice(param_value, &queues)
            }
            CommandBufferInfo::NumQueues => {
                write_param(param_value, &(command_buffer.queues().len() as u32))
            }
            CommandBufferInfo::ReferenceCount => {
                write_param(param_value, &command_buffer.reference_count())
            }
            CommandBufferInfo::State => write_param(param_value, &command_buffer.state().as_raw()),
            CommandBufferInfo::PropertiesArray => {
                write_slice(param_value, command_buffer.properties())
            }
            CommandBufferInfo::Context => {
                let context = command_buffer.context()?;

                write_param(param_value, &context.as_raw())
            }
        }
    }

    /// Returns the number of live command buffers.
    #[inline]
    pub fn command_buffer_count(&self) -> usize {
        self.registry.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandBufferHandle, EntryPoint, LAYER_API_VERSION};
    use crate::{
        command_buffer::{CommandBufferInfo, CommandBufferState, SyncPoint},
        fns::{ChannelOrder, ChannelType, Dispatch, ExtensionFunction, ImageFormat, ProfilingInfo},
        handle::{Event, Handle, Kernel, Mem, MutableCommand, Queue},
        host::{HostCreateInfo, HostDispatch},
        layer::{Layer, LayerCreateInfo},
        ClError,
    };
    use std::sync::Arc;

    #[test]
    fn entry_point_names() {
        for &entry_point in EntryPoint::ALL {
            assert_eq!(entry_point.name().parse(), Ok(entry_point));
        }

        assert_eq!(EntryPoint::ALL.len(), 15);
        assert_eq!(
            "clCommandNDRangeKernelKHR".parse(),
            Ok(EntryPoint::CommandNdRangeKernel)
        );
        assert_eq!("clCommandNDRangeKernel".parse::<EntryPoint>(), Err(()));
    }

    #[test]
    fn native_functions_are_preferred() {
        let host = Arc::new(HostDispatch::new(HostCreateInfo {
            native_functions: vec!["clFinalizeCommandBufferKHR".to_owned()],
            ..Default::default()
        }));
        let layer = Layer::new(host.clone(), Default::default());
        let platform = host.platform();

        assert!(matches!(
            layer.get_extension_function_address(platform, "clFinalizeCommandBufferKHR"),
            Some(ExtensionFunction::Native(_))
        ));
        assert_eq!(
            layer.get_extension_function_address(platform, "clCreateCommandBufferKHR"),
            Some(ExtensionFunction::Emulated(EntryPoint::CreateCommandBuffer))
        );
        assert_eq!(
            layer.get_extension_function_address(platform, "clUnknownKHR"),
            None
        );
    }

    #[test]
    fn layer_info() {
        let mut buf = [0u8; 4];
        assert_eq!(Layer::get_layer_info(LAYER_API_VERSION, None), Ok(4));
        assert_eq!(
            Layer::get_layer_info(LAYER_API_VERSION, Some(&mut buf)),
            Ok(4)
        );
        assert_eq!(u32::from_ne_bytes(buf), 100);
        assert_eq!(Layer::get_layer_info(0, None), Err(ClError::InvalidValue));
    }

    #[test]
    fn invalid_handles() {
        let (_host, layer, queue) = host_layer!();
        let handle = layer.create_command_buffer(&[queue], None).unwrap();

        let forged = CommandBufferHandle::from_raw(handle.as_raw() & 0xffff_ffff);
        assert_eq!(
            layer.finalize_command_buffer(forged),
            Err(ClError::InvalidCommandBuffer)
        );
        let unknown = CommandBufferHandle::from_raw(handle.as_raw() + 1);
        assert_eq!(
            layer.retain_command_buffer(unknown),
            Err(ClError::InvalidCommandBuffer)
        );

        layer.release_command_buffer(handle).unwrap();
        assert_eq!(
            layer.release_command_buffer(handle),
            Err(ClError::InvalidCommandBuffer)
        );

        // Slots are not reused.
        let next = layer.create_command_buffer(&[queue], None).unwrap();
        assert_ne!(next, handle);
        assert_eq!(
            layer.finalize_command_buffer(handle),
            Err(ClError::InvalidCommandBuffer)
        );
    }

    #[test]
    fn reference_counting() {
        let (host, layer, queue) = host_layer!();
        let handle = layer.create_command_buffer(&[queue], None).unwrap();
        assert_eq!(host.queue_reference_count(queue), Some(2));

        layer.retain_command_buffer(handle).unwrap();
        layer.release_command_buffer(handle).unwrap();
        assert_eq!(layer.command_buffer_count(), 1);

        layer.release_command_buffer(handle).unwrap();
        assert_eq!(layer.command_buffer_count(), 0);
        assert_eq!(host.queue_reference_count(queue), Some(1));
    }

    #[test]
    fn reference_counting_across_threads() {
        const THREADS: usize = 8;
        const ITERATIONS: usize = 1000;

        let (host, layer, queue) = host_layer!();
        let handle = layer.create_command_buffer(&[queue], None).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..ITERATIONS {
                        layer.retain_command_buffer(handle).unwrap();
                        layer.release_command_buffer(handle).unwrap();
                    }
                });
            }
        });

        assert_eq!(layer.command_buffer(handle).unwrap().reference_count(), 1);
        assert_eq!(layer.command_buffer_count(), 1);

        layer.release_command_buffer(handle).unwrap();
        assert_eq!(layer.command_buffer_count(), 0);
        assert_eq!(host.queue_reference_count(queue), Some(1));
    }

    #[test]
    fn info_queries() {
        let (host, layer, queue) = host_layer!();
        let properties = [0x1293, 1, 0];
        let handle = layer
            .create_command_buffer(&[queue], Some(&properties[..]))
            .unwrap();
        let query = |param: CommandBufferInfo| {
            let size = layer
                .get_command_buffer_info(handle, param.as_raw(), None)
                .unwrap();
            let mut buf = vec![0u8; size];
            layer
                .get_command_buffer_info(handle, param.as_raw(), Some(&mut buf))
                .unwrap();

            buf
        };
        let as_u32 = |buf: Vec<u8>| bytemuck::pod_read_unaligned::<u32>(&buf);
        let as_u64s = |buf: Vec<u8>| -> Vec<u64> {
            buf.chunks_exact(8)
                .map(bytemuck::pod_read_unaligned)
                .collect()
        };

        assert_eq!(as_u64s(query(CommandBufferInfo::Queues)), [queue.as_raw()]);
        assert_eq!(as_u32(query(CommandBufferInfo::NumQueues)), 1);
        assert_eq!(as_u32(query(CommandBufferInfo::ReferenceCount)), 1);
        assert_eq!(
            as_u32(query(CommandBufferInfo::State)),
            CommandBufferState::Recording.as_raw()
        );
        assert_eq!(as_u64s(query(CommandBufferInfo::PropertiesArray)), properties);
        assert_eq!(
            as_u64s(query(CommandBufferInfo::Context)),
            [host.context().as_raw()]
        );

        layer.finalize_command_buffer(handle).unwrap();
        assert_eq!(
            as_u32(query(CommandBufferInfo::State)),
            CommandBufferState::Executable.as_raw()
        );

        let mut small = [0u8; 2];
        assert_eq!(
            layer.get_command_buffer_info(
                handle,
                CommandBufferInfo::ReferenceCount.as_raw(),
                Some(&mut small)
            ),
            Err(ClError::InvalidValue)
        );
        assert_eq!(
            layer.get_command_buffer_info(handle, 0x1234, None),
            Err(ClError::InvalidValue)
        );

        let plain = layer.create_command_buffer(&[queue], None).unwrap();
        let param = CommandBufferInfo::PropertiesArray.as_raw();
        assert_eq!(layer.get_command_buffer_info(plain, param, None), Ok(0));
    }

    #[test]
    fn create_errors() {
        let (host, layer, queue) = host_layer!();
        let other = host.create_queue();

        assert_eq!(
            layer.create_command_buffer(&[queue, other], None),
            Err(ClError::InvalidValue)
        );
        assert_eq!(
            layer.create_command_buffer(&[Queue::null()], None),
            Err(ClError::InvalidCommandQueue)
        );
        assert_eq!(
            layer.create_command_buffer(&[queue], Some(&[0x1293, 1, 0x1293, 1, 0][..])),
            Err(ClError::InvalidValue)
        );
        assert_eq!(
            layer.create_command_buffer(&[queue], Some(&[0x9999, 1, 0][..])),
            Err(ClError::InvalidValue)
        );
        assert_eq!(layer.command_buffer_count(), 0);
        assert_eq!(host.queue_reference_count(queue), Some(1));
    }

    #[test]
    fn record_outputs() {
        let (host, layer, queue) = host_layer!();
        let buffer = host.create_buffer(16);
        let handle = layer.create_command_buffer(&[queue], None).unwrap();

        let mut sync_point = SyncPoint(99);
        layer
            .command_fill_buffer(
                handle,
                None,
                buffer,
                &[1],
                0,
                16,
                0,
                None,
                Some(&mut sync_point),
                None,
            )
            .unwrap();
        assert_eq!(sync_point, SyncPoint(0));

        let wait = [sync_point];
        layer
            .command_barrier_with_wait_list(
                handle,
                None,
                1,
                Some(&wait[..]),
                Some(&mut sync_point),
                None,
            )
            .unwrap();
        assert_eq!(sync_point, SyncPoint(1));

        // A mutable handle can't be provided.
        let mut mutable = MutableCommand::null();
        assert_eq!(
            layer.command_barrier_with_wait_list(handle, None, 0, None, None, Some(&mut mutable)),
            Err(ClError::InvalidValue)
        );
        assert_eq!(
            layer.command_barrier_with_wait_list(handle, Some(queue), 0, None, None, None),
            Err(ClError::InvalidCommandQueue)
        );
        let unknown = [SyncPoint(7)];
        assert_eq!(
            layer.command_barrier_with_wait_list(handle, None, 1, Some(&unknown[..]), None, None),
            Err(ClError::InvalidSyncPointWaitList)
        );
        assert_eq!(layer.command_buffer(handle).unwrap().len(), 2);
    }

    #[test]
    fn nd_range_properties() {
        let (host, layer, queue) = host_layer!();
        let kernel = host.create_kernel(0, |_| Ok(()));
        let handle = layer.create_command_buffer(&[queue], None).unwrap();

        let record = |properties: Option<&[u64]>| {
            layer.command_nd_range_kernel(
                handle, None, properties, kernel, 1, None, &[4], None, 0, None, None, None,
            )
        };

        assert_eq!(record(None), Ok(()));
        assert_eq!(record(Some(&[0][..])), Ok(()));
        assert_eq!(record(Some(&[0x1000, 1, 0][..])), Err(ClError::InvalidValue));

        // The state is checked first.
        layer.finalize_command_buffer(handle).unwrap();
        assert_eq!(
            record(Some(&[0x1000, 1, 0][..])),
            Err(ClError::InvalidOperation)
        );
        assert_eq!(layer.command_buffer(handle).unwrap().len(), 2);
    }

    #[test]
    fn fill_image_color_capture() {
        let (host, layer, queue) = host_layer!();
        let format = ImageFormat {
            channel_order: ChannelOrder::RGBA,
            channel_data_type: ChannelType::UnsignedInt8,
        };
        let image = host.create_image(format, [2, 2, 1]).unwrap();
        let handle = layer.create_command_buffer(&[queue], None).unwrap();

        let color: [u32; 4] = [1, 2, 300, 4];
        layer
            .command_fill_image(
                handle,
                None,
                image,
                bytemuck::bytes_of(&color),
                [0; 3],
                [2, 2, 1],
                0,
                None,
                None,
                None,
            )
            .unwrap();
        assert_eq!(
            layer.command_fill_image(
                handle,
                None,
                image,
                &[0; 8],
                [0; 3],
                [1; 3],
                0,
                None,
                None,
                None,
            ),
            Err(ClError::InvalidValue)
        );

        layer.finalize_command_buffer(handle).unwrap();
        layer.enqueue_command_buffer(&[], handle, &[], None).unwrap();
        assert_eq!(host.read_mem(image).unwrap(), [1u8, 2, 255, 4].repeat(4));
    }

    #[test]
    fn fill_image_queries_format_after_validation() {
        let (host, layer, queue) = host_layer!();
        let format = ImageFormat {
            channel_order: ChannelOrder::R,
            channel_data_type: ChannelType::Float,
        };
        let image = host.create_image(format, [2, 2, 1]).unwrap();
        let handle = layer.create_command_buffer(&[queue], None).unwrap();
        let fill = |handle, sync_point_wait_list: Option<&[SyncPoint]>| {
            layer.command_fill_image(
                handle,
                None,
                image,
                &[0; 16],
                [0; 3],
                [1; 3],
                sync_point_wait_list.map_or(0, |list| list.len() as u32),
                sync_point_wait_list,
                None,
                None,
            )
        };

        assert_eq!(
            fill(CommandBufferHandle::from_raw(0x1234), None),
            Err(ClError::InvalidCommandBuffer)
        );
        assert_eq!(
            fill(handle, Some(&[SyncPoint(0)][..])),
            Err(ClError::InvalidSyncPointWaitList)
        );
        assert_eq!(host.image_format_queries(), 0);

        fill(handle, None).unwrap();
        assert_eq!(host.image_format_queries(), 1);

        layer.finalize_command_buffer(handle).unwrap();
        assert_eq!(fill(handle, None), Err(ClError::InvalidOperation));
        assert_eq!(host.image_format_queries(), 1);
    }

    #[test]
    fn enhanced_checks_at_the_boundary() {
        let (_host, layer, queue) = host_layer!(LayerCreateInfo {
            enhanced_error_checking: true,
            ..Default::default()
        });
        let handle = layer.create_command_buffer(&[queue], None).unwrap();

        assert_eq!(
            layer.command_copy_buffer(
                handle,
                None,
                Mem::null(),
                Mem::null(),
                0,
                0,
                4,
                0,
                None,
                None,
                None,
            ),
            Err(ClError::InvalidMemObject)
        );
        assert_eq!(
            layer.command_nd_range_kernel(
                handle, None, None, Kernel::null(), 1, None, &[1], None, 0, None, None, None,
            ),
            Err(ClError::InvalidKernel)
        );
        assert_eq!(layer.command_buffer(handle).unwrap().len(), 0);
    }

    #[test]
    fn enqueue_wait_list_and_profiling() {
        let (host, layer, queue) = host_layer!();
        let handle = layer.create_command_buffer(&[queue], None).unwrap();
        layer
            .command_barrier_with_wait_list(handle, None, 0, None, None, None)
            .unwrap();

        // Not finalized yet.
        assert_eq!(
            layer.enqueue_command_buffer(&[], handle, &[], None),
            Err(ClError::InvalidOperation)
        );
        layer.finalize_command_buffer(handle).unwrap();

        let wait = host.create_user_event();
        host.clear_calls();
        layer
            .enqueue_command_buffer(&[], handle, &[wait], None)
            .unwrap();
        assert_eq!(host.calls().len(), 2);

        let mut event = Event::null();
        layer
            .enqueue_command_buffer(&[], handle, &[], Some(&mut event))
            .unwrap();
        let queued = layer
            .event_profiling_info(event, ProfilingInfo::Queued)
            .unwrap();
        let end = layer
            .event_profiling_info(event, ProfilingInfo::End)
            .unwrap();
        assert!(queued < end);
    }
}
