// Copyright (c) 2024 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Recording commands into a command buffer, and replaying them.
//!
//! A command buffer starts out in the [`Recording`] state. Each successfully recorded command
//! returns a [`SyncPoint`], which later commands can name in their wait list. Sync points only
//! identify commands: replay always runs the commands one after another in the order they were
//! recorded, so the wait lists are checked for well-formedness and otherwise ignored.
//!
//! [`finalize`] moves the command buffer to the [`Executable`] state. From then on no commands
//! can be added, and the command buffer can be [enqueued] any number of times. Each submission
//! picks its queue at enqueue time, which does not have to be the queue that the command buffer
//! was created with.
//!
//! [`Recording`]: CommandBufferState::Recording
//! [`Executable`]: CommandBufferState::Executable
//! [`finalize`]: CommandBuffer::finalize
//! [enqueued]: CommandBuffer::enqueue

pub use self::{
    commands::{
        CopyBufferInfo, CopyBufferRectInfo, CopyBufferToImageInfo, CopyImageInfo,
        CopyImageToBufferInfo, FillBufferInfo, FillColor, FillImageInfo, NdRangeKernelInfo,
    },
    submit::{SubmitInfo, Submission},
};
pub(crate) use self::commands::RecordedCommand;
use crate::{
    fns::Dispatch,
    handle::{Context, Handle, Queue},
    macros::{cl_bitflags, cl_enum},
    ClError, NonExhaustive, Validated, ValidationError,
};
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::{
    fmt::{Debug, Error as FmtError, Formatter},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};
use tracing::{debug, trace};

mod commands;
mod submit;

/// Identifies a command within the command buffer it was recorded into.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SyncPoint(pub u32);

cl_enum! {
    /// The state of a command buffer.
    CommandBufferState = u32;

    /// Commands can be recorded.
    Recording = 0,

    /// The command buffer has been finalized and can be enqueued.
    Executable = 1,
}

cl_bitflags! {
    /// Flags that control how a command buffer can be used.
    CommandBufferFlags = u64;

    /// The command buffer may be enqueued again while a previous submission is still pending.
    SIMULTANEOUS_USE = 1 << 0,
}

cl_enum! {
    /// A property that can be queried from a command buffer.
    CommandBufferInfo = u32;

    /// The queues the command buffer was created with.
    Queues = 0x1294,

    /// The number of queues the command buffer was created with.
    NumQueues = 0x1295,

    /// The reference count of the command buffer.
    ReferenceCount = 0x1296,

    /// The current [`CommandBufferState`].
    State = 0x1297,

    /// The property list that the command buffer was created with.
    PropertiesArray = 0x1298,

    /// The context of the queue that the command buffer was created with.
    Context = 0x1299,
}

/// The property key that introduces [`CommandBufferFlags`] in a property list.
pub const COMMAND_BUFFER_FLAGS_KHR: u64 = 0x1293;

/// A sequence of recorded commands that can be replayed on a queue.
pub struct CommandBuffer {
    next: Arc<dyn Dispatch>,
    queues: SmallVec<[Queue; 1]>,
    properties: Vec<u64>,
    flags: CommandBufferFlags,
    enhanced_error_checking: bool,

    inner: RwLock<CommandBufferInner>,
    next_sync_point: AtomicU32,
    ref_count: AtomicU32,
}

struct CommandBufferInner {
    state: CommandBufferState,
    commands: Vec<RecordedCommand>,
}

impl CommandBuffer {
    /// Creates a new `CommandBuffer` bound to `queues`, in the recording state.
    ///
    /// Exactly one queue must be given. The queue is retained until the command buffer is
    /// destroyed.
    pub fn new(
        next: Arc<dyn Dispatch>,
        queues: &[Queue],
        create_info: CommandBufferCreateInfo,
    ) -> Result<Arc<CommandBuffer>, Validated<ClError>> {
        let properties = create_info.to_properties();

        Self::new_with_properties(next, queues, create_info, properties)
    }

    /// Creates a new `CommandBuffer` from a raw, zero-terminated property list. The list is
    /// kept as it was given and reported back by [`CommandBuffer::properties`].
    pub fn from_properties(
        next: Arc<dyn Dispatch>,
        queues: &[Queue],
        properties: Option<&[u64]>,
        enhanced_error_checking: bool,
    ) -> Result<Arc<CommandBuffer>, Validated<ClError>> {
        Self::validate_new(queues)?;

        let (create_info, properties) = match properties {
            Some(properties) => {
                let (flags, len) = parse_properties(properties)
                    .map_err(|err| err.add_context("properties"))?;
                let create_info = CommandBufferCreateInfo {
                    flags,
                    enhanced_error_checking,
                    ..Default::default()
                };

                (create_info, properties[..len].to_vec())
            }
            None => (
                CommandBufferCreateInfo {
                    enhanced_error_checking,
                    ..Default::default()
                },
                Vec::new(),
            ),
        };

        Self::new_with_properties(next, queues, create_info, properties)
    }

    fn validate_new(queues: &[Queue]) -> Result<(), Box<ValidationError>> {
        if queues.len() != 1 {
            return Err(ValidationError::new(
                ClError::InvalidValue,
                "queues",
                "does not contain exactly one queue",
            ));
        }

        if queues[0].is_null() {
            return Err(ValidationError::new(
                ClError::InvalidCommandQueue,
                "queues[0]",
                "is null",
            ));
        }

        Ok(())
    }

    fn new_with_properties(
        next: Arc<dyn Dispatch>,
        queues: &[Queue],
        create_info: CommandBufferCreateInfo,
        properties: Vec<u64>,
    ) -> Result<Arc<CommandBuffer>, Validated<ClError>> {
        Self::validate_new(queues)?;

        let CommandBufferCreateInfo {
            flags,
            enhanced_error_checking,
            _ne: _,
        } = create_info;

        for (index, &queue) in queues.iter().enumerate() {
            if let Err(err) = next.retain_queue(queue) {
                for &queue in &queues[..index] {
                    let _ = next.release_queue(queue);
                }

                return Err(Validated::Error(err));
            }
        }

        debug!(queue = ?queues[0], ?flags, "created command buffer");

        Ok(Arc::new(CommandBuffer {
            next,
            queues: queues.iter().copied().collect(),
            properties,
            flags,
            enhanced_error_checking,
            inner: RwLock::new(CommandBufferInner {
                state: CommandBufferState::Recording,
                commands: Vec::new(),
            }),
            next_sync_point: AtomicU32::new(0),
            ref_count: AtomicU32::new(1),
        }))
    }

    /// Returns the queues that the command buffer was created with.
    #[inline]
    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    /// Returns the queue that the command buffer replays on when no other queue is given.
    #[inline]
    pub fn queue(&self) -> Queue {
        self.queues[0]
    }

    /// Returns the property list that the command buffer was created with, including the
    /// terminating zero. Empty if no list was given.
    #[inline]
    pub fn properties(&self) -> &[u64] {
        &self.properties
    }

    #[inline]
    pub fn flags(&self) -> CommandBufferFlags {
        self.flags
    }

    /// Returns the current state.
    #[inline]
    pub fn state(&self) -> CommandBufferState {
        self.inner.read().state
    }

    /// Returns the number of recorded commands.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.read().commands.len()
    }

    /// Returns the sync point that the next recorded command will get.
    #[inline]
    pub fn next_sync_point(&self) -> SyncPoint {
        SyncPoint(self.next_sync_point.load(Ordering::Relaxed))
    }

    /// Returns the context of the bound queue.
    pub fn context(&self) -> Result<Context, ClError> {
        self.next.queue_context(self.queue())
    }

    /// Returns the current reference count.
    #[inline]
    pub fn reference_count(&self) -> u32 {
        self.ref_count.load(Ordering::Relaxed)
    }

    /// Increments the reference count.
    #[inline]
    pub fn retain(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the reference count, and returns whether it reached zero. Whoever owns the
    /// command buffer must then drop it.
    ///
    /// Releasing more often than the command buffer was retained is not checked.
    #[inline]
    pub fn release(&self) -> bool {
        self.ref_count.fetch_sub(1, Ordering::Relaxed) == 1
    }

    /// Ends recording. Afterwards the command buffer can be enqueued, and no more commands can
    /// be recorded.
    pub fn finalize(&self) -> Result<(), Box<ValidationError>> {
        let mut inner = self.inner.write();

        if inner.state != CommandBufferState::Recording {
            return Err(ValidationError::new(
                ClError::InvalidOperation,
                "self",
                "is not in the recording state",
            ));
        }

        inner.state = CommandBufferState::Executable;

        debug!(commands = inner.commands.len(), "finalized command buffer");

        Ok(())
    }

    /// Records a barrier. On replay, every command recorded before it completes before any
    /// command recorded after it starts.
    pub fn barrier(
        &self,
        record_info: &CommandRecordInfo<'_>,
    ) -> Result<SyncPoint, Validated<ClError>> {
        self.record(record_info, RecordedCommand::Barrier)
    }

    /// Records a copy between two buffers.
    pub fn copy_buffer(
        &self,
        record_info: &CommandRecordInfo<'_>,
        copy_buffer_info: CopyBufferInfo,
    ) -> Result<SyncPoint, Validated<ClError>> {
        self.record(record_info, RecordedCommand::CopyBuffer(copy_buffer_info))
    }

    /// Records a copy of a rectangular region between two buffers.
    pub fn copy_buffer_rect(
        &self,
        record_info: &CommandRecordInfo<'_>,
        copy_buffer_rect_info: CopyBufferRectInfo,
    ) -> Result<SyncPoint, Validated<ClError>> {
        self.record(
            record_info,
            RecordedCommand::CopyBufferRect(copy_buffer_rect_info),
        )
    }

    /// Records a copy from a buffer to an image.
    pub fn copy_buffer_to_image(
        &self,
        record_info: &CommandRecordInfo<'_>,
        copy_buffer_to_image_info: CopyBufferToImageInfo,
    ) -> Result<SyncPoint, Validated<ClError>> {
        self.record(
            record_info,
            RecordedCommand::CopyBufferToImage(copy_buffer_to_image_info),
        )
    }

    /// Records a copy between two images.
    pub fn copy_image(
        &self,
        record_info: &CommandRecordInfo<'_>,
        copy_image_info: CopyImageInfo,
    ) -> Result<SyncPoint, Validated<ClError>> {
        self.record(record_info, RecordedCommand::CopyImage(copy_image_info))
    }

    /// Records a copy from an image to a buffer.
    pub fn copy_image_to_buffer(
        &self,
        record_info: &CommandRecordInfo<'_>,
        copy_image_to_buffer_info: CopyImageToBufferInfo,
    ) -> Result<SyncPoint, Validated<ClError>> {
        self.record(
            record_info,
            RecordedCommand::CopyImageToBuffer(copy_image_to_buffer_info),
        )
    }

    /// Records a fill of a buffer range with a pattern.
    pub fn fill_buffer(
        &self,
        record_info: &CommandRecordInfo<'_>,
        fill_buffer_info: FillBufferInfo,
    ) -> Result<SyncPoint, Validated<ClError>> {
        self.record(record_info, RecordedCommand::FillBuffer(fill_buffer_info))
    }

    /// Records a fill of an image region with a colour.
    pub fn fill_image(
        &self,
        record_info: &CommandRecordInfo<'_>,
        fill_image_info: FillImageInfo,
    ) -> Result<SyncPoint, Validated<ClError>> {
        self.record(record_info, RecordedCommand::FillImage(fill_image_info))
    }

    /// Records a kernel dispatch.
    ///
    /// The kernel is cloned while recording. Arguments set on `nd_range_kernel_info.kernel`
    /// afterwards do not affect this command.
    pub fn nd_range_kernel(
        &self,
        record_info: &CommandRecordInfo<'_>,
        nd_range_kernel_info: NdRangeKernelInfo,
    ) -> Result<SyncPoint, Validated<ClError>> {
        self.record(
            record_info,
            RecordedCommand::NdRangeKernel {
                original_kernel: nd_range_kernel_info.kernel,
                info: nd_range_kernel_info,
            },
        )
    }

    fn record(
        &self,
        record_info: &CommandRecordInfo<'_>,
        mut command: RecordedCommand,
    ) -> Result<SyncPoint, Validated<ClError>> {
        let mut inner = self.inner.write();

        self.validate_record(&inner, record_info)?;

        if self.enhanced_error_checking {
            command.validate()?;
        }

        command.acquire(&*self.next)?;

        let sync_point = SyncPoint(self.next_sync_point.fetch_add(1, Ordering::Relaxed));

        trace!(
            ?sync_point,
            command_type = ?command.command_type(),
            "recorded command"
        );

        inner.commands.push(command);

        Ok(sync_point)
    }

    /// Checks `record_info` against the current state without recording anything.
    pub(crate) fn check_record(
        &self,
        record_info: &CommandRecordInfo<'_>,
    ) -> Result<(), Box<ValidationError>> {
        self.validate_record(&self.inner.read(), record_info)
    }

    fn validate_record(
        &self,
        inner: &CommandBufferInner,
        record_info: &CommandRecordInfo<'_>,
    ) -> Result<(), Box<ValidationError>> {
        let &CommandRecordInfo {
            command_queue,
            num_sync_points_in_wait_list,
            sync_point_wait_list,
            mutable_handle,
            _ne: _,
        } = record_info;

        if inner.state != CommandBufferState::Recording {
            return Err(ValidationError::new(
                ClError::InvalidOperation,
                "self",
                "is not in the recording state",
            ));
        }

        if command_queue.is_some() {
            return Err(ValidationError::new(
                ClError::InvalidCommandQueue,
                "command_queue",
                "is `Some`; commands are always recorded for the queue of the command buffer",
            ));
        }

        if mutable_handle {
            return Err(ValidationError::new(
                ClError::InvalidValue,
                "mutable_handle",
                "is requested, but updatable commands are not supported",
            ));
        }

        let wait_list = match (num_sync_points_in_wait_list, sync_point_wait_list) {
            (0, None) => &[][..],
            (count, Some(list)) if count != 0 => {
                list.get(..count as usize).ok_or_else(|| {
                    ValidationError::new(
                        ClError::InvalidSyncPointWaitList,
                        "sync_point_wait_list",
                        "is shorter than `num_sync_points_in_wait_list`",
                    )
                })?
            }
            _ => {
                return Err(ValidationError::new(
                    ClError::InvalidSyncPointWaitList,
                    "sync_point_wait_list",
                    "is `None` while `num_sync_points_in_wait_list` is not zero, or the other \
                    way around",
                ));
            }
        };

        let next_sync_point = self.next_sync_point();

        for (index, &sync_point) in wait_list.iter().enumerate() {
            if sync_point >= next_sync_point {
                return Err(ValidationError::new(
                    ClError::InvalidSyncPointWaitList,
                    format!("sync_point_wait_list[{}]", index),
                    "refers to a command that has not been recorded yet",
                ));
            }
        }

        Ok(())
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();

        for command in inner.commands.drain(..) {
            command.release(&*self.next);
        }

        for &queue in &self.queues {
            let _ = self.next.release_queue(queue);
        }

        debug!(queue = ?self.queues[0], "destroyed command buffer");
    }
}

impl Debug for CommandBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        let inner = self.inner.read();

        f.debug_struct("CommandBuffer")
            .field("queues", &self.queues)
            .field("flags", &self.flags)
            .field("state", &inner.state)
            .field("commands", &inner.commands.len())
            .field("next_sync_point", &self.next_sync_point())
            .field("ref_count", &self.reference_count())
            .finish_non_exhaustive()
    }
}

/// Parameters to create a new `CommandBuffer`.
#[derive(Clone, Debug)]
pub struct CommandBufferCreateInfo {
    /// Flags that control how the command buffer can be used.
    ///
    /// The default value is empty.
    pub flags: CommandBufferFlags,

    /// Whether recorded commands get their arguments checked while recording: null memory
    /// objects and kernels, empty regions, malformed fill patterns and work dimensions. Without
    /// it, such arguments are recorded as they are and the error is reported on replay.
    ///
    /// The default value is `false`.
    pub enhanced_error_checking: bool,

    pub _ne: NonExhaustive,
}

impl Default for CommandBufferCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            flags: CommandBufferFlags::empty(),
            enhanced_error_checking: false,
            _ne: NonExhaustive(()),
        }
    }
}

impl CommandBufferCreateInfo {
    fn to_properties(&self) -> Vec<u64> {
        if self.flags.is_empty() {
            Vec::new()
        } else {
            vec![COMMAND_BUFFER_FLAGS_KHR, self.flags.as_raw(), 0]
        }
    }
}

/// Parses a zero-terminated property list. Returns the flags and the length of the list,
/// including the terminator.
fn parse_properties(
    properties: &[u64],
) -> Result<(CommandBufferFlags, usize), Box<ValidationError>> {
    let mut flags = None;
    let mut index = 0;

    loop {
        match properties.get(index).copied() {
            Some(0) => return Ok((flags.unwrap_or_default(), index + 1)),
            Some(COMMAND_BUFFER_FLAGS_KHR) => {
                if flags.is_some() {
                    return Err(ValidationError::new(
                        ClError::InvalidValue,
                        format!("[{}]", index),
                        "specifies the flags a second time",
                    ));
                }

                let value = properties.get(index + 1).copied().ok_or_else(|| {
                    ValidationError::new(
                        ClError::InvalidValue,
                        format!("[{}]", index + 1),
                        "is missing",
                    )
                })?;

                flags = Some(CommandBufferFlags::from_raw(value).ok_or_else(|| {
                    ValidationError::new(
                        ClError::InvalidValue,
                        format!("[{}]", index + 1),
                        "contains unknown flags",
                    )
                })?);

                index += 2;
            }
            Some(_) => {
                return Err(ValidationError::new(
                    ClError::InvalidValue,
                    format!("[{}]", index),
                    "is not a known property",
                ));
            }
            None => {
                return Err(ValidationError::new(
                    ClError::InvalidValue,
                    "",
                    "is not zero-terminated",
                ));
            }
        }
    }
}

/// Parameters that every recording call takes, besides the arguments of the command itself.
#[derive(Clone, Debug)]
pub struct CommandRecordInfo<'a> {
    /// The queue to record for. Must be `None`: commands are always recorded for the queue
    /// that the command buffer was created with.
    ///
    /// The default value is `None`.
    pub command_queue: Option<Queue>,

    /// The number of sync points in `sync_point_wait_list` that the command waits for.
    ///
    /// The default value is `0`.
    pub num_sync_points_in_wait_list: u32,

    /// The sync points of previously recorded commands that this command waits for. Must be
    /// `Some` exactly when `num_sync_points_in_wait_list` is not zero.
    ///
    /// The default value is `None`.
    pub sync_point_wait_list: Option<&'a [SyncPoint]>,

    /// Whether a handle to update the command later is requested. Must be `false`.
    ///
    /// The default value is `false`.
    pub mutable_handle: bool,

    pub _ne: NonExhaustive,
}

impl Default for CommandRecordInfo<'_> {
    #[inline]
    fn default() -> Self {
        Self {
            command_queue: None,
            num_sync_points_in_wait_list: 0,
            sync_point_wait_list: None,
            mutable_handle: false,
            _ne: NonExhaustive(()),
        }
    }
}

impl<'a> CommandRecordInfo<'a> {
    /// Returns a `CommandRecordInfo` that waits for `sync_points`.
    #[inline]
    pub fn wait_for(sync_points: &'a [SyncPoint]) -> Self {
        Self {
            num_sync_points_in_wait_list: sync_points.len() as u32,
            sync_point_wait_list: (!sync_points.is_empty()).then_some(sync_points),
            ..Default::default()
        }
    }
}
