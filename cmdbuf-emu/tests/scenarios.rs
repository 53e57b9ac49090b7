// Copyright (c) 2024 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use cmdbuf_emu::{
    command_buffer::{
        CommandBuffer, CommandBufferState, CommandRecordInfo, CopyBufferInfo,
        CopyBufferToImageInfo, CopyImageToBufferInfo, FillBufferInfo, NdRangeKernelInfo,
        SubmitInfo,
    },
    host::{HostCall, HostDispatch},
    ChannelOrder, ChannelType, ClError, Dispatch, Handle, ImageFormat, Layer, LayerCreateInfo,
    SyncPoint,
};
use smallvec::smallvec;
use std::sync::Arc;

fn setup() -> (Arc<HostDispatch>, Layer) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let host = Arc::new(HostDispatch::new(Default::default()));
    let layer = Layer::new(host.clone(), LayerCreateInfo::default());

    (host, layer)
}

#[test]
fn barrier_then_fill_zeroes_buffer() {
    let (host, layer) = setup();
    let queue = host.create_queue();
    let buffer = host.create_buffer(128);
    host.write_mem(buffer, 0, &[0xff; 128]).unwrap();

    let handle = layer.create_command_buffer(&[queue], None).unwrap();
    layer
        .command_barrier_with_wait_list(handle, None, 0, None, None, None)
        .unwrap();
    layer
        .command_fill_buffer(handle, None, buffer, &[0; 4], 0, 64, 0, None, None, None)
        .unwrap();
    layer.finalize_command_buffer(handle).unwrap();
    layer.enqueue_command_buffer(&[], handle, &[], None).unwrap();
    host.finish(queue).unwrap();

    let data = host.read_mem(buffer).unwrap();
    assert!(data[..64].iter().all(|&b| b == 0));
    assert!(data[64..].iter().all(|&b| b == 0xff));
    assert_eq!(
        host.calls(),
        [
            HostCall::Barrier {
                queue,
                wait_list: 0,
                signal: false
            },
            HostCall::FillBuffer { queue, buffer },
        ]
    );
}

#[test]
fn two_queues_are_rejected() {
    let (host, layer) = setup();
    let first = host.create_queue();
    let second = host.create_queue();

    assert_eq!(
        layer.create_command_buffer(&[first, second], None),
        Err(ClError::InvalidValue)
    );
    assert_eq!(layer.command_buffer_count(), 0);
    assert_eq!(host.queue_reference_count(first), Some(1));
    assert_eq!(host.queue_reference_count(second), Some(1));
}

#[test]
fn sync_points_across_command_kinds() {
    let (host, _layer) = setup();
    let queue = host.create_queue();
    let src = host.create_buffer(16);
    let dst = host.create_buffer(16);
    let cmdbuf = CommandBuffer::new(host.clone(), &[queue], Default::default()).unwrap();

    let first = cmdbuf.barrier(&Default::default()).unwrap();
    let second = cmdbuf
        .copy_buffer(
            &CommandRecordInfo::wait_for(&[first]),
            CopyBufferInfo {
                src_buffer: src,
                dst_buffer: dst,
                size: 16,
                ..Default::default()
            },
        )
        .unwrap();
    let third = cmdbuf
        .fill_buffer(
            &CommandRecordInfo::wait_for(&[first, second]),
            FillBufferInfo {
                buffer: src,
                pattern: smallvec![7, 7],
                size: 16,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!([first, second, third], [SyncPoint(0), SyncPoint(1), SyncPoint(2)]);

    let err = cmdbuf
        .barrier(&CommandRecordInfo::wait_for(&[SyncPoint(3)]))
        .unwrap_err();
    assert_eq!(err.code(), ClError::InvalidSyncPointWaitList);

    cmdbuf.finalize().unwrap();
    assert_eq!(cmdbuf.state(), CommandBufferState::Executable);

    let err = cmdbuf.barrier(&Default::default()).unwrap_err();
    assert_eq!(err.code(), ClError::InvalidOperation);
    assert_eq!(cmdbuf.next_sync_point(), SyncPoint(3));
    assert_eq!(cmdbuf.finalize().unwrap_err().code, ClError::InvalidOperation);
}

#[test]
fn empty_command_buffer_finalizes() {
    let (host, layer) = setup();
    let queue = host.create_queue();
    let handle = layer.create_command_buffer(&[queue], None).unwrap();

    layer.finalize_command_buffer(handle).unwrap();
    assert_eq!(
        layer.finalize_command_buffer(handle),
        Err(ClError::InvalidOperation)
    );

    host.clear_calls();
    layer.enqueue_command_buffer(&[], handle, &[], None).unwrap();
    assert!(host.calls().is_empty());
}

#[test]
fn kernel_arguments_are_captured_at_record_time() {
    let (host, layer) = setup();
    let queue = host.create_queue();
    let buffer = host.create_buffer(16);
    let kernel = host.create_kernel(2, |invocation| {
        let value: u32 = invocation.arg_value(1).ok_or(ClError::InvalidArgValue)?;
        let ids: Vec<_> = invocation.global_ids().collect();
        let data = invocation.buffer_mut(0)?;

        for [x, _, _] in ids {
            data[x * 4..x * 4 + 4].copy_from_slice(&value.to_ne_bytes());
        }

        Ok(())
    });
    host.set_kernel_arg(kernel, 0, &buffer.as_raw().to_ne_bytes())
        .unwrap();
    host.set_kernel_arg(kernel, 1, &5u32.to_ne_bytes()).unwrap();

    let handle = layer.create_command_buffer(&[queue], None).unwrap();
    layer
        .command_nd_range_kernel(
            handle, None, None, kernel, 1, None, &[4], None, 0, None, None, None,
        )
        .unwrap();
    layer.finalize_command_buffer(handle).unwrap();
    assert_eq!(host.kernel_reference_count(kernel), Some(2));
    assert_eq!(host.live_kernels(), 2);

    host.set_kernel_arg(kernel, 1, &9u32.to_ne_bytes()).unwrap();
    layer.enqueue_command_buffer(&[], handle, &[], None).unwrap();
    assert_eq!(host.read_mem(buffer).unwrap(), 5u32.to_ne_bytes().repeat(4));

    host.enqueue_nd_range_kernel(
        queue,
        &NdRangeKernelInfo {
            kernel,
            global_work_size: smallvec![4],
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(host.read_mem(buffer).unwrap(), 9u32.to_ne_bytes().repeat(4));

    layer.release_command_buffer(handle).unwrap();
    assert_eq!(host.kernel_reference_count(kernel), Some(1));
    assert_eq!(host.live_kernels(), 1);
}

#[test]
fn replay_stops_at_the_failing_command() {
    let (host, _layer) = setup();
    let queue = host.create_queue();
    let buffers: Vec<_> = (0..6).map(|_| host.create_buffer(8)).collect();
    let cmdbuf = CommandBuffer::new(host.clone(), &[queue], Default::default()).unwrap();

    for pair in buffers.windows(2) {
        cmdbuf
            .copy_buffer(
                &Default::default(),
                CopyBufferInfo {
                    src_buffer: pair[0],
                    dst_buffer: pair[1],
                    size: 8,
                    ..Default::default()
                },
            )
            .unwrap();
    }
    cmdbuf.finalize().unwrap();

    host.clear_calls();
    host.fail_nth_enqueue(3, ClError::OutOfResources);
    assert_eq!(cmdbuf.replay(queue), Err(ClError::OutOfResources));

    let expected: Vec<_> = buffers
        .windows(2)
        .take(4)
        .map(|pair| HostCall::CopyBuffer {
            queue,
            src: pair[0],
            dst: pair[1],
        })
        .collect();
    assert_eq!(host.calls(), expected);
}

#[test]
fn reference_count_lifecycle() {
    let (host, layer) = setup();
    let queue = host.create_queue();
    let buffer = host.create_buffer(4);
    let handle = layer.create_command_buffer(&[queue], None).unwrap();
    layer
        .command_fill_buffer(handle, None, buffer, &[1], 0, 4, 0, None, None, None)
        .unwrap();
    assert_eq!(host.mem_reference_count(buffer), Some(2));
    assert_eq!(layer.command_buffer(handle).unwrap().reference_count(), 1);

    layer.retain_command_buffer(handle).unwrap();
    assert_eq!(layer.command_buffer(handle).unwrap().reference_count(), 2);
    layer.release_command_buffer(handle).unwrap();
    layer.release_command_buffer(handle).unwrap();

    assert_eq!(layer.command_buffer_count(), 0);
    assert_eq!(host.mem_reference_count(buffer), Some(1));
    assert_eq!(host.queue_reference_count(queue), Some(1));
}

#[test]
fn image_round_trip_on_another_queue() {
    let (host, _layer) = setup();
    let queue = host.create_queue();
    let other = host.create_queue();
    let format = ImageFormat {
        channel_order: ChannelOrder::R,
        channel_data_type: ChannelType::UnsignedInt16,
    };
    let image = host.create_image(format, [4, 4, 1]).unwrap();
    let src = host.create_buffer(32);
    let dst = host.create_buffer(32);
    host.write_mem(src, 0, &(0..32).collect::<Vec<u8>>()).unwrap();

    let cmdbuf = CommandBuffer::new(host.clone(), &[queue], Default::default()).unwrap();
    cmdbuf
        .copy_buffer_to_image(
            &Default::default(),
            CopyBufferToImageInfo {
                src_buffer: src,
                dst_image: image,
                region: [4, 4, 1],
                ..Default::default()
            },
        )
        .unwrap();
    cmdbuf
        .copy_image_to_buffer(
            &Default::default(),
            CopyImageToBufferInfo {
                src_image: image,
                dst_buffer: dst,
                region: [4, 4, 1],
                ..Default::default()
            },
        )
        .unwrap();
    cmdbuf.finalize().unwrap();

    host.clear_calls();
    let submission = cmdbuf
        .enqueue(&SubmitInfo {
            queues: &[other],
            signal: true,
            ..Default::default()
        })
        .unwrap();

    assert_eq!(host.read_mem(dst), host.read_mem(src));
    assert!(host.calls().iter().all(|call| call.queue() == other));
    assert_eq!(host.calls().len(), 4);

    host.release_event(submission.event.unwrap()).unwrap();
    host.release_event(submission.start_event.unwrap()).unwrap();
    assert_eq!(host.live_events(), 0);
}
