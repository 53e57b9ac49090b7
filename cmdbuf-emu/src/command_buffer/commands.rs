// Copyright (c) 2024 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{
    fns::{ChannelOrder, ChannelType, CommandType, Dispatch, ImageFormat},
    handle::{Handle, Kernel, Mem, Queue},
    ClError, NonExhaustive, ValidationError,
};
use smallvec::SmallVec;

/// Parameters to copy data from one buffer to another.
#[derive(Clone, Debug)]
pub struct CopyBufferInfo {
    pub src_buffer: Mem,
    pub dst_buffer: Mem,
    pub src_offset: usize,
    pub dst_offset: usize,
    pub size: usize,
    pub _ne: NonExhaustive,
}

impl Default for CopyBufferInfo {
    #[inline]
    fn default() -> Self {
        Self {
            src_buffer: Mem::null(),
            dst_buffer: Mem::null(),
            src_offset: 0,
            dst_offset: 0,
            size: 0,
            _ne: NonExhaustive(()),
        }
    }
}

impl CopyBufferInfo {
    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        validate_mem(self.src_buffer, "src_buffer")?;
        validate_mem(self.dst_buffer, "dst_buffer")?;

        if self.size == 0 {
            return Err(ValidationError::new(
                ClError::InvalidValue,
                "size",
                "is zero",
            ));
        }

        Ok(())
    }
}

/// Parameters to copy a 2D or 3D region from one buffer to another.
///
/// A row or slice pitch of zero means the region is tightly packed.
#[derive(Clone, Debug)]
pub struct CopyBufferRectInfo {
    pub src_buffer: Mem,
    pub dst_buffer: Mem,
    /// The origin in the source, in bytes, rows and slices.
    pub src_origin: [usize; 3],
    /// The origin in the destination, in bytes, rows and slices.
    pub dst_origin: [usize; 3],
    /// The extent of the region, in bytes, rows and slices.
    pub region: [usize; 3],
    pub src_row_pitch: usize,
    pub src_slice_pitch: usize,
    pub dst_row_pitch: usize,
    pub dst_slice_pitch: usize,
    pub _ne: NonExhaustive,
}

impl Default for CopyBufferRectInfo {
    #[inline]
    fn default() -> Self {
        Self {
            src_buffer: Mem::null(),
            dst_buffer: Mem::null(),
            src_origin: [0; 3],
            dst_origin: [0; 3],
            region: [1; 3],
            src_row_pitch: 0,
            src_slice_pitch: 0,
            dst_row_pitch: 0,
            dst_slice_pitch: 0,
            _ne: NonExhaustive(()),
        }
    }
}

impl CopyBufferRectInfo {
    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        validate_mem(self.src_buffer, "src_buffer")?;
        validate_mem(self.dst_buffer, "dst_buffer")?;
        validate_region(self.region)
    }
}

/// Parameters to copy data from a buffer into an image.
#[derive(Clone, Debug)]
pub struct CopyBufferToImageInfo {
    pub src_buffer: Mem,
    pub dst_image: Mem,
    pub src_offset: usize,
    pub dst_origin: [usize; 3],
    pub region: [usize; 3],
    pub _ne: NonExhaustive,
}

impl Default for CopyBufferToImageInfo {
    #[inline]
    fn default() -> Self {
        Self {
            src_buffer: Mem::null(),
            dst_image: Mem::null(),
            src_offset: 0,
            dst_origin: [0; 3],
            region: [1; 3],
            _ne: NonExhaustive(()),
        }
    }
}

impl CopyBufferToImageInfo {
    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        validate_mem(self.src_buffer, "src_buffer")?;
        validate_mem(self.dst_image, "dst_image")?;
        validate_region(self.region)
    }
}

/// Parameters to copy a region from one image to another.
#[derive(Clone, Debug)]
pub struct CopyImageInfo {
    pub src_image: Mem,
    pub dst_image: Mem,
    pub src_origin: [usize; 3],
    pub dst_origin: [usize; 3],
    pub region: [usize; 3],
    pub _ne: NonExhaustive,
}

impl Default for CopyImageInfo {
    #[inline]
    fn default() -> Self {
        Self {
            src_image: Mem::null(),
            dst_image: Mem::null(),
            src_origin: [0; 3],
            dst_origin: [0; 3],
            region: [1; 3],
            _ne: NonExhaustive(()),
        }
    }
}

impl CopyImageInfo {
    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        validate_mem(self.src_image, "src_image")?;
        validate_mem(self.dst_image, "dst_image")?;
        validate_region(self.region)
    }
}

/// Parameters to copy a region of an image into a buffer.
#[derive(Clone, Debug)]
pub struct CopyImageToBufferInfo {
    pub src_image: Mem,
    pub dst_buffer: Mem,
    pub src_origin: [usize; 3],
    pub region: [usize; 3],
    pub dst_offset: usize,
    pub _ne: NonExhaustive,
}

impl Default for CopyImageToBufferInfo {
    #[inline]
    fn default() -> Self {
        Self {
            src_image: Mem::null(),
            dst_buffer: Mem::null(),
            src_origin: [0; 3],
            region: [1; 3],
            dst_offset: 0,
            _ne: NonExhaustive(()),
        }
    }
}

impl CopyImageToBufferInfo {
    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        validate_mem(self.src_image, "src_image")?;
        validate_mem(self.dst_buffer, "dst_buffer")?;
        validate_region(self.region)
    }
}

/// Parameters to fill a range of a buffer with a repeated pattern.
///
/// The pattern is owned; the caller's copy can be reused or freed as soon as the command has
/// been recorded.
#[derive(Clone, Debug)]
pub struct FillBufferInfo {
    pub buffer: Mem,
    pub pattern: SmallVec<[u8; 16]>,
    pub offset: usize,
    pub size: usize,
    pub _ne: NonExhaustive,
}

impl Default for FillBufferInfo {
    #[inline]
    fn default() -> Self {
        Self {
            buffer: Mem::null(),
            pattern: SmallVec::new(),
            offset: 0,
            size: 0,
            _ne: NonExhaustive(()),
        }
    }
}

impl FillBufferInfo {
    /// The largest fill pattern, the size of a 16-component vector of 8-byte scalars.
    pub const MAX_PATTERN_SIZE: usize = 128;

    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        validate_mem(self.buffer, "buffer")?;

        let pattern_size = self.pattern.len();

        if pattern_size == 0
            || !pattern_size.is_power_of_two()
            || pattern_size > Self::MAX_PATTERN_SIZE
        {
            return Err(ValidationError::new(
                ClError::InvalidValue,
                "pattern",
                "is empty, larger than 128 bytes or its size is not a power of two",
            ));
        }

        if self.offset % pattern_size != 0 {
            return Err(ValidationError::new(
                ClError::InvalidValue,
                "offset",
                "is not a multiple of the pattern size",
            ));
        }

        if self.size % pattern_size != 0 {
            return Err(ValidationError::new(
                ClError::InvalidValue,
                "size",
                "is not a multiple of the pattern size",
            ));
        }

        Ok(())
    }
}

/// The colour that an image is filled with.
///
/// Which variant applies is decided by the image format: depth images take a single float,
/// signed and unsigned integer formats take four integers, every other format takes four
/// floats.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FillColor {
    Float([f32; 4]),
    Int([i32; 4]),
    Uint([u32; 4]),
    Depth(f32),
}

impl Default for FillColor {
    #[inline]
    fn default() -> Self {
        Self::Float([0.0; 4])
    }
}

impl FillColor {
    /// Returns the number of bytes of raw colour data that an image of the given format reads.
    #[inline]
    pub fn byte_size(format: ImageFormat) -> usize {
        if format.channel_order == ChannelOrder::Depth {
            4
        } else {
            16
        }
    }

    /// Decodes raw colour data for an image of the given format. Returns `None` if `bytes` is
    /// shorter than [`FillColor::byte_size`].
    pub fn from_bytes(format: ImageFormat, bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..Self::byte_size(format))?;

        Some(if format.channel_order == ChannelOrder::Depth {
            Self::Depth(bytemuck::pod_read_unaligned(bytes))
        } else {
            match format.channel_data_type {
                ChannelType::SignedInt8 | ChannelType::SignedInt16 | ChannelType::SignedInt32 => {
                    Self::Int(bytemuck::pod_read_unaligned(bytes))
                }
                ChannelType::UnsignedInt8
                | ChannelType::UnsignedInt16
                | ChannelType::UnsignedInt32 => Self::Uint(bytemuck::pod_read_unaligned(bytes)),
                _ => Self::Float(bytemuck::pod_read_unaligned(bytes)),
            }
        })
    }
}

/// Parameters to fill a region of an image with a single colour.
#[derive(Clone, Debug)]
pub struct FillImageInfo {
    pub image: Mem,
    pub fill_color: FillColor,
    pub origin: [usize; 3],
    pub region: [usize; 3],
    pub _ne: NonExhaustive,
}

impl Default for FillImageInfo {
    #[inline]
    fn default() -> Self {
        Self {
            image: Mem::null(),
            fill_color: FillColor::default(),
            origin: [0; 3],
            region: [1; 3],
            _ne: NonExhaustive(()),
        }
    }
}

impl FillImageInfo {
    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        validate_mem(self.image, "image")?;
        validate_region(self.region)
    }
}

/// Parameters to dispatch a kernel over an N-dimensional range.
///
/// An empty `global_work_offset` means no offset, an empty `local_work_size` lets the
/// implementation pick the work-group size.
#[derive(Clone, Debug)]
pub struct NdRangeKernelInfo {
    pub kernel: Kernel,
    pub work_dim: u32,
    pub global_work_offset: SmallVec<[usize; 3]>,
    pub global_work_size: SmallVec<[usize; 3]>,
    pub local_work_size: SmallVec<[usize; 3]>,
    pub _ne: NonExhaustive,
}

impl Default for NdRangeKernelInfo {
    #[inline]
    fn default() -> Self {
        Self {
            kernel: Kernel::null(),
            work_dim: 1,
            global_work_offset: SmallVec::new(),
            global_work_size: SmallVec::new(),
            local_work_size: SmallVec::new(),
            _ne: NonExhaustive(()),
        }
    }
}

impl NdRangeKernelInfo {
    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        if self.kernel.is_null() {
            return Err(ValidationError::new(
                ClError::InvalidKernel,
                "kernel",
                "is null",
            ));
        }

        if !(1..=3).contains(&self.work_dim) {
            return Err(ValidationError::new(
                ClError::InvalidWorkDimension,
                "work_dim",
                "is not 1, 2 or 3",
            ));
        }

        let work_dim = self.work_dim as usize;

        if self.global_work_size.len() != work_dim {
            return Err(ValidationError::new(
                ClError::InvalidValue,
                "global_work_size",
                "does not have `work_dim` elements",
            ));
        }

        if !self.global_work_offset.is_empty() && self.global_work_offset.len() != work_dim {
            return Err(ValidationError::new(
                ClError::InvalidValue,
                "global_work_offset",
                "is not empty and does not have `work_dim` elements",
            ));
        }

        if !self.local_work_size.is_empty() && self.local_work_size.len() != work_dim {
            return Err(ValidationError::new(
                ClError::InvalidValue,
                "local_work_size",
                "is not empty and does not have `work_dim` elements",
            ));
        }

        Ok(())
    }
}

fn validate_mem(mem: Mem, context: &'static str) -> Result<(), Box<ValidationError>> {
    if mem.is_null() {
        return Err(ValidationError::new(
            ClError::InvalidMemObject,
            context,
            "is null",
        ));
    }

    Ok(())
}

fn validate_region(region: [usize; 3]) -> Result<(), Box<ValidationError>> {
    if region.contains(&0) {
        return Err(ValidationError::new(
            ClError::InvalidValue,
            "region",
            "has a zero extent",
        ));
    }

    Ok(())
}

/// One command stored in a command buffer.
///
/// Every variant owns a full copy of its arguments. Memory objects are retained for as long as
/// the command exists. The kernel dispatch holds a clone of the kernel made at record time, so
/// it replays with the arguments that were bound then.
#[derive(Debug)]
pub(crate) enum RecordedCommand {
    Barrier,
    CopyBuffer(CopyBufferInfo),
    CopyBufferRect(CopyBufferRectInfo),
    CopyBufferToImage(CopyBufferToImageInfo),
    CopyImage(CopyImageInfo),
    CopyImageToBuffer(CopyImageToBufferInfo),
    FillBuffer(FillBufferInfo),
    FillImage(FillImageInfo),
    NdRangeKernel {
        /// `kernel` is the clone that is dispatched on replay.
        info: NdRangeKernelInfo,
        original_kernel: Kernel,
    },
}

impl RecordedCommand {
    pub(crate) fn command_type(&self) -> CommandType {
        match self {
            Self::Barrier => CommandType::Barrier,
            Self::CopyBuffer(_) => CommandType::CopyBuffer,
            Self::CopyBufferRect(_) => CommandType::CopyBufferRect,
            Self::CopyBufferToImage(_) => CommandType::CopyBufferToImage,
            Self::CopyImage(_) => CommandType::CopyImage,
            Self::CopyImageToBuffer(_) => CommandType::CopyImageToBuffer,
            Self::FillBuffer(_) => CommandType::FillBuffer,
            Self::FillImage(_) => CommandType::FillImage,
            Self::NdRangeKernel { .. } => CommandType::NdRangeKernel,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        match self {
            Self::Barrier => Ok(()),
            Self::CopyBuffer(info) => info.validate(),
            Self::CopyBufferRect(info) => info.validate(),
            Self::CopyBufferToImage(info) => info.validate(),
            Self::CopyImage(info) => info.validate(),
            Self::CopyImageToBuffer(info) => info.validate(),
            Self::FillBuffer(info) => info.validate(),
            Self::FillImage(info) => info.validate(),
            Self::NdRangeKernel { info, .. } => info.validate(),
        }
    }

    fn mem_objects(&self) -> SmallVec<[Mem; 2]> {
        let mems: SmallVec<[Mem; 2]> = match self {
            Self::Barrier | Self::NdRangeKernel { .. } => SmallVec::new(),
            Self::CopyBuffer(info) => [info.src_buffer, info.dst_buffer].into(),
            Self::CopyBufferRect(info) => [info.src_buffer, info.dst_buffer].into(),
            Self::CopyBufferToImage(info) => [info.src_buffer, info.dst_image].into(),
            Self::CopyImage(info) => [info.src_image, info.dst_image].into(),
            Self::CopyImageToBuffer(info) => [info.src_image, info.dst_buffer].into(),
            Self::FillBuffer(info) => [info.buffer].into_iter().collect(),
            Self::FillImage(info) => [info.image].into_iter().collect(),
        };

        mems.into_iter().filter(|mem| !mem.is_null()).collect()
    }

    /// Takes the references that the command holds while it is stored: every memory object is
    /// retained, and a kernel dispatch swaps the caller's kernel for a clone.
    ///
    /// Null handles are stored as they are; replaying them reports the downstream error. On
    /// failure nothing stays retained.
    pub(crate) fn acquire(&mut self, next: &dyn Dispatch) -> Result<(), ClError> {
        let mem_objects = self.mem_objects();

        for (index, &mem) in mem_objects.iter().enumerate() {
            if let Err(err) = next.retain_mem(mem) {
                release_mem_objects(next, &mem_objects[..index]);
                return Err(err);
            }
        }

        if let Self::NdRangeKernel {
            info,
            original_kernel,
        } = self
        {
            if !original_kernel.is_null() {
                let result = next.clone_kernel(*original_kernel).and_then(|clone| {
                    next.retain_kernel(*original_kernel)
                        .map(|()| clone)
                        .inspect_err(|_| {
                            let _ = next.release_kernel(clone);
                        })
                });

                match result {
                    Ok(clone) => info.kernel = clone,
                    Err(err) => {
                        release_mem_objects(next, &mem_objects);
                        return Err(err);
                    }
                }
            }
        }

        Ok(())
    }

    /// Drops the references taken by `acquire`.
    pub(crate) fn release(&self, next: &dyn Dispatch) {
        release_mem_objects(next, &self.mem_objects());

        if let Self::NdRangeKernel {
            info,
            original_kernel,
        } = self
        {
            if !original_kernel.is_null() {
                let _ = next.release_kernel(info.kernel);
                let _ = next.release_kernel(*original_kernel);
            }
        }
    }

    /// Issues the one downstream primitive that this command stands for, on `queue`.
    pub(crate) fn playback(&self, next: &dyn Dispatch, queue: Queue) -> Result<(), ClError> {
        match self {
            Self::Barrier => next
                .enqueue_barrier_with_wait_list(queue, &[], false)
                .map(drop),
            Self::CopyBuffer(info) => next.enqueue_copy_buffer(queue, info),
            Self::CopyBufferRect(info) => next.enqueue_copy_buffer_rect(queue, info),
            Self::CopyBufferToImage(info) => next.enqueue_copy_buffer_to_image(queue, info),
            Self::CopyImage(info) => next.enqueue_copy_image(queue, info),
            Self::CopyImageToBuffer(info) => next.enqueue_copy_image_to_buffer(queue, info),
            Self::FillBuffer(info) => next.enqueue_fill_buffer(queue, info),
            Self::FillImage(info) => next.enqueue_fill_image(queue, info),
            Self::NdRangeKernel { info, .. } => next.enqueue_nd_range_kernel(queue, info),
        }
    }
}

fn release_mem_objects(next: &dyn Dispatch, mem_objects: &[Mem]) {
    for &mem in mem_objects {
        let _ = next.release_mem(mem);
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CopyBufferInfo, FillBufferInfo, FillColor, NdRangeKernelInfo,
    };
    use crate::{
        fns::{ChannelOrder, ChannelType, ImageFormat},
        handle::{Handle, Kernel, Mem},
        ClError,
    };
    use smallvec::smallvec;

    #[test]
    fn fill_color_depth() {
        let format = ImageFormat {
            channel_order: ChannelOrder::Depth,
            channel_data_type: ChannelType::Float,
        };
        assert_eq!(FillColor::byte_size(format), 4);
        assert_eq!(
            FillColor::from_bytes(format, &0.5f32.to_ne_bytes()),
            Some(FillColor::Depth(0.5))
        );
    }

    #[test]
    fn fill_color_by_channel_type() {
        let bytes: Vec<u8> = [1u32, 2, 3, 4].iter().flat_map(|v| v.to_ne_bytes()).collect();

        let format = ImageFormat {
            channel_order: ChannelOrder::RGBA,
            channel_data_type: ChannelType::UnsignedInt8,
        };
        assert_eq!(
            FillColor::from_bytes(format, &bytes),
            Some(FillColor::Uint([1, 2, 3, 4]))
        );

        let format = ImageFormat {
            channel_order: ChannelOrder::R,
            channel_data_type: ChannelType::SignedInt16,
        };
        assert_eq!(
            FillColor::from_bytes(format, &bytes),
            Some(FillColor::Int([1, 2, 3, 4]))
        );

        let format = ImageFormat {
            channel_order: ChannelOrder::RGBA,
            channel_data_type: ChannelType::UnormInt8,
        };
        assert!(matches!(
            FillColor::from_bytes(format, &bytes),
            Some(FillColor::Float(_))
        ));
        assert_eq!(FillColor::from_bytes(format, &bytes[..8]), None);
    }

    #[test]
    fn copy_buffer_validate() {
        let info = CopyBufferInfo {
            src_buffer: Mem::from_raw(1),
            dst_buffer: Mem::from_raw(2),
            size: 16,
            ..Default::default()
        };
        assert!(info.validate().is_ok());

        let info = CopyBufferInfo {
            src_buffer: Mem::from_raw(1),
            size: 16,
            ..Default::default()
        };
        assert_eq!(info.validate().unwrap_err().code, ClError::InvalidMemObject);
    }

    #[test]
    fn fill_buffer_pattern() {
        let mut info = FillBufferInfo {
            buffer: Mem::from_raw(1),
            pattern: smallvec![0; 4],
            offset: 8,
            size: 64,
            ..Default::default()
        };
        assert!(info.validate().is_ok());

        info.pattern = smallvec![0; 3];
        assert_eq!(info.validate().unwrap_err().code, ClError::InvalidValue);

        info.pattern = smallvec![0; 4];
        info.offset = 2;
        assert_eq!(info.validate().unwrap_err().context, "offset");
    }

    #[test]
    fn nd_range_work_dim() {
        let mut info = NdRangeKernelInfo {
            kernel: Kernel::from_raw(1),
            work_dim: 2,
            global_work_size: smallvec![8, 8],
            ..Default::default()
        };
        assert!(info.validate().is_ok());

        info.work_dim = 4;
        assert_eq!(
            info.validate().unwrap_err().code,
            ClError::InvalidWorkDimension
        );

        info.work_dim = 1;
        assert_eq!(info.validate().unwrap_err().code, ClError::InvalidValue);

        info.kernel = Kernel::null();
        assert_eq!(info.validate().unwrap_err().code, ClError::InvalidKernel);
    }
}
