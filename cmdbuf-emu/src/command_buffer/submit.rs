// Copyright (c) 2024 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{CommandBuffer, CommandBufferState, RecordedCommand};
use crate::{
    fns::Dispatch,
    handle::{Event, Handle, Queue},
    ClError, NonExhaustive, Validated, ValidationError,
};
use tracing::{debug, trace, warn};

/// Parameters to enqueue a command buffer.
#[derive(Clone, Debug)]
pub struct SubmitInfo<'a> {
    /// The queue to replay on instead of the queue that the command buffer was created with.
    /// Can contain at most one queue.
    ///
    /// The default value is empty.
    pub queues: &'a [Queue],

    /// Events that must complete before any command of the command buffer starts.
    ///
    /// The default value is empty.
    pub event_wait_list: &'a [Event],

    /// Whether to return an event that is signaled once every command has completed.
    ///
    /// The default value is `false`.
    pub signal: bool,

    pub _ne: NonExhaustive,
}

impl Default for SubmitInfo<'_> {
    #[inline]
    fn default() -> Self {
        Self {
            queues: &[],
            event_wait_list: &[],
            signal: false,
            _ne: NonExhaustive(()),
        }
    }
}

/// The events produced by enqueuing a command buffer.
///
/// The caller owns both events and must release them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Submission {
    /// Signaled once every command has completed. `Some` if a signal was requested.
    pub event: Option<Event>,

    /// The event of the barrier that starts the submission. `Some` if a signal was requested.
    pub start_event: Option<Event>,
}

impl CommandBuffer {
    /// Replays every recorded command on `queue`, in the order they were recorded.
    ///
    /// The first command that fails ends the replay, and its error is returned. The commands
    /// before it have been enqueued and stay enqueued.
    pub fn replay(&self, queue: Queue) -> Result<(), ClError> {
        let inner = self.inner.read();

        replay_commands(&*self.next, &inner.commands, queue)
    }

    /// Enqueues the command buffer.
    ///
    /// If there are events to wait for, or a signal is requested, a barrier is enqueued first
    /// that waits for the events. Then the commands are replayed, followed by a second barrier
    /// that signals the returned event. If any step fails the remaining ones are skipped;
    /// nothing that was already enqueued is undone.
    pub fn enqueue(
        &self,
        submit_info: &SubmitInfo<'_>,
    ) -> Result<Submission, Validated<ClError>> {
        let inner = self.inner.read();

        if inner.state != CommandBufferState::Executable {
            return Err(ValidationError::new(
                ClError::InvalidOperation,
                "self",
                "is not in the executable state",
            )
            .into());
        }

        Self::validate_enqueue(submit_info)?;

        let &SubmitInfo {
            queues,
            event_wait_list,
            signal,
            _ne: _,
        } = submit_info;

        let queue = queues.first().copied().unwrap_or_else(|| self.queue());
        let next = &*self.next;

        let start_event = if !event_wait_list.is_empty() || signal {
            next.enqueue_barrier_with_wait_list(queue, event_wait_list, signal)?
        } else {
            None
        };

        let result = replay_commands(next, &inner.commands, queue).and_then(|()| {
            if signal {
                next.enqueue_barrier_with_wait_list(queue, &[], true)
            } else {
                Ok(None)
            }
        });

        match result {
            Ok(event) => {
                debug!(?queue, ?event, "enqueued command buffer");

                Ok(Submission { event, start_event })
            }
            Err(err) => {
                if let Some(start_event) = start_event {
                    let _ = next.release_event(start_event);
                }

                Err(Validated::Error(err))
            }
        }
    }

    fn validate_enqueue(submit_info: &SubmitInfo<'_>) -> Result<(), Box<ValidationError>> {
        if submit_info.queues.len() > 1 {
            return Err(ValidationError::new(
                ClError::InvalidValue,
                "queues",
                "contains more than one queue",
            ));
        }

        if submit_info.queues.iter().any(|queue| queue.is_null()) {
            return Err(ValidationError::new(
                ClError::InvalidCommandQueue,
                "queues[0]",
                "is null",
            ));
        }

        Ok(())
    }
}

fn replay_commands(
    next: &dyn Dispatch,
    commands: &[RecordedCommand],
    queue: Queue,
) -> Result<(), ClError> {
    for (index, command) in commands.iter().enumerate() {
        trace!(index, command_type = ?command.command_type(), "replaying command");

        if let Err(err) = command.playback(next, queue) {
            warn!(
                index,
                command_type = ?command.command_type(),
                %err,
                "replay stopped"
            );

            return Err(err);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::SubmitInfo;
    use crate::{
        command_buffer::{CommandBuffer, CommandRecordInfo, CopyBufferInfo, FillBufferInfo},
        fns::{CommandType, Dispatch},
        host::HostCall,
        ClError,
    };
    use smallvec::smallvec;

    #[test]
    fn enqueue_requires_executable() {
        let (host, queue) = host_and_queue!();
        let cmdbuf = CommandBuffer::new(host.clone(), &[queue], Default::default()).unwrap();

        let err = cmdbuf.enqueue(&Default::default()).unwrap_err();
        assert_eq!(err.code(), ClError::InvalidOperation);
        assert!(host.calls().is_empty());
    }

    #[test]
    fn enqueue_queue_override() {
        let (host, queue) = host_and_queue!();
        let other = host.create_queue();
        let cmdbuf = CommandBuffer::new(host.clone(), &[queue], Default::default()).unwrap();
        cmdbuf.barrier(&Default::default()).unwrap();
        cmdbuf.finalize().unwrap();

        let err = cmdbuf
            .enqueue(&SubmitInfo {
                queues: &[queue, other],
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.code(), ClError::InvalidValue);

        host.clear_calls();
        cmdbuf
            .enqueue(&SubmitInfo {
                queues: &[other],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            host.calls(),
            [HostCall::Barrier {
                queue: other,
                wait_list: 0,
                signal: false
            }]
        );
    }

    #[test]
    fn enqueue_without_events_adds_no_barriers() {
        let (host, queue) = host_and_queue!();
        let buffer = host.create_buffer(64);
        let cmdbuf = CommandBuffer::new(host.clone(), &[queue], Default::default()).unwrap();
        cmdbuf
            .fill_buffer(
                &Default::default(),
                FillBufferInfo {
                    buffer,
                    pattern: smallvec![1],
                    size: 64,
                    ..Default::default()
                },
            )
            .unwrap();
        cmdbuf.finalize().unwrap();

        host.clear_calls();
        let submission = cmdbuf.enqueue(&Default::default()).unwrap();
        assert_eq!(submission.event, None);
        assert_eq!(submission.start_event, None);
        assert_eq!(host.calls(), [HostCall::FillBuffer { queue, buffer }]);
    }

    #[test]
    fn enqueue_with_signal() {
        let (host, queue) = host_and_queue!();
        let cmdbuf = CommandBuffer::new(host.clone(), &[queue], Default::default()).unwrap();
        cmdbuf.barrier(&Default::default()).unwrap();
        cmdbuf.finalize().unwrap();

        let wait = host.create_user_event();
        host.clear_calls();
        let submission = cmdbuf
            .enqueue(&SubmitInfo {
                event_wait_list: &[wait],
                signal: true,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(
            host.calls(),
            [
                HostCall::Barrier { queue, wait_list: 1, signal: true },
                HostCall::Barrier { queue, wait_list: 0, signal: false },
                HostCall::Barrier { queue, wait_list: 0, signal: true },
            ]
        );

        let event = submission.event.unwrap();
        let start_event = submission.start_event.unwrap();
        assert_ne!(event, start_event);
        assert_eq!(host.event_command_type(event), Ok(CommandType::Barrier));
    }

    #[test]
    fn first_failure_stops_replay() {
        let (host, queue) = host_and_queue!();
        let src = host.create_buffer(16);
        let dst = host.create_buffer(16);
        let cmdbuf = CommandBuffer::new(host.clone(), &[queue], Default::default()).unwrap();
        let copy = || CopyBufferInfo {
            src_buffer: src,
            dst_buffer: dst,
            size: 16,
            ..Default::default()
        };

        for _ in 0..4 {
            cmdbuf.copy_buffer(&CommandRecordInfo::default(), copy()).unwrap();
        }
        cmdbuf.finalize().unwrap();

        host.clear_calls();
        host.fail_nth_enqueue(2, ClError::OutOfResources);
        assert_eq!(cmdbuf.replay(queue), Err(ClError::OutOfResources));
        assert_eq!(
            host.calls(),
            [
                HostCall::CopyBuffer { queue, src, dst },
                HostCall::CopyBuffer { queue, src, dst },
                HostCall::CopyBuffer { queue, src, dst },
            ]
        );

        // Nothing is left behind that would make the next replay behave differently.
        host.clear_calls();
        assert_eq!(cmdbuf.replay(queue), Ok(()));
        assert_eq!(host.calls().len(), 4);
    }

    #[test]
    fn failed_submission_releases_start_event() {
        let (host, queue) = host_and_queue!();
        let cmdbuf = CommandBuffer::new(host.clone(), &[queue], Default::default()).unwrap();
        cmdbuf.barrier(&Default::default()).unwrap();
        cmdbuf.finalize().unwrap();

        host.clear_calls();
        host.fail_nth_enqueue(1, ClError::OutOfHostMemory);
        let err = cmdbuf
            .enqueue(&SubmitInfo {
                signal: true,
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.code(), ClError::OutOfHostMemory);
        assert_eq!(host.live_events(), 0);
    }

    #[test]
    fn late_bound_queue() {
        let (host, queue) = host_and_queue!();
        let other = host.create_queue();
        let cmdbuf = CommandBuffer::new(host.clone(), &[queue], Default::default()).unwrap();
        cmdbuf.barrier(&Default::default()).unwrap();
        cmdbuf.finalize().unwrap();

        host.clear_calls();
        cmdbuf.replay(other).unwrap();
        cmdbuf.replay(queue).unwrap();
        assert_eq!(
            host.calls(),
            [
                HostCall::Barrier { queue: other, wait_list: 0, signal: false },
                HostCall::Barrier { queue, wait_list: 0, signal: false },
            ]
        );
    }
}
