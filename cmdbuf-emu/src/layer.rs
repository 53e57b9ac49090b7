// Copyright (c) 2024 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The layer that sits between an application and the downstream implementation.
//!
//! Queries are passed through, except for the few that have to account for the emulated
//! extension: the extension lists of platforms and devices, the command buffer capabilities of
//! devices, and the type and profiling timestamps of the events that command buffer
//! submissions return.

use crate::{
    command_buffer::{
        CopyBufferInfo, CopyBufferRectInfo, CopyBufferToImageInfo, CopyImageInfo,
        CopyImageToBufferInfo, FillBufferInfo, FillImageInfo, NdRangeKernelInfo,
    },
    entry::Registry,
    fns::{
        CommandBufferCapabilities, CommandType, DeviceEnqueueCapabilities, Dispatch,
        ExtensionFunction, ImageFormat, NameVersion, ProfilingInfo, QueueProperties,
    },
    handle::{Context, Device, Event, Kernel, Mem, Platform, Queue},
    ClError, NonExhaustive, Version,
};
use foldhash::HashMap;
use parking_lot::Mutex;
use std::{env, sync::Arc};
use tracing::{debug, warn};

/// The name of the emulated extension.
pub const EXTENSION_NAME: &str = "cl_khr_command_buffer";

/// The version of the emulated extension.
pub const EXTENSION_VERSION: Version = Version {
    major: 0,
    minor: 9,
    patch: 2,
};

/// Parameters to create a `Layer`.
#[derive(Clone, Debug)]
pub struct LayerCreateInfo {
    /// Whether recorded commands get their arguments checked while recording, instead of
    /// failing on replay.
    ///
    /// The default value is `false`.
    pub enhanced_error_checking: bool,

    /// Whether the emulated extension is added to the extension lists of platforms and devices.
    ///
    /// The default value is `true`.
    pub advertise_extension: bool,

    /// Platforms and devices with a lower version are not told about the emulated extension.
    ///
    /// The default value is [`Version::V2_1`].
    pub minimum_version: Version,

    pub _ne: NonExhaustive,
}

impl Default for LayerCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            enhanced_error_checking: false,
            advertise_extension: true,
            minimum_version: Version::V2_1,
            _ne: NonExhaustive(()),
        }
    }
}

impl LayerCreateInfo {
    /// Returns the default parameters, overridden by the `CMDBUFEMU_EnhancedErrorChecking` and
    /// `CMDBUFEMU_AdvertiseExtension` environment variables where they are set.
    pub fn from_env() -> Self {
        Self::default().with_controls(|name| env::var(name).ok())
    }

    fn with_controls(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        let control = |name: &str| var(name).map(|value| parse_control(&value) != 0);

        if let Some(value) = control("CMDBUFEMU_EnhancedErrorChecking") {
            self.enhanced_error_checking = value;
        }

        if let Some(value) = control("CMDBUFEMU_AdvertiseExtension") {
            self.advertise_extension = value;
        }

        self
    }
}

/// Parses the leading decimal integer of a control value. Anything else reads as zero.
fn parse_control(value: &str) -> i64 {
    let value = value.trim_start();
    let (sign, digits) = match value.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, value.strip_prefix('+').unwrap_or(value)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());

    digits[..end].parse::<i64>().map_or(0, |v| sign * v)
}

/// Emulates command buffers on top of a downstream implementation.
pub struct Layer {
    pub(crate) next: Arc<dyn Dispatch>,
    pub(crate) create_info: LayerCreateInfo,
    pub(crate) registry: Registry,

    // Completion event of a submission to the event of the barrier that started it.
    pub(crate) event_map: Mutex<HashMap<Event, Event>>,
}

impl Layer {
    /// The layer interface version that this layer implements.
    pub const API_VERSION: u32 = 100;

    /// Creates a new `Layer` on top of `next`.
    pub fn new(next: Arc<dyn Dispatch>, create_info: LayerCreateInfo) -> Self {
        debug!(?create_info, "created layer");

        Layer {
            next,
            create_info,
            registry: Registry::default(),
            event_map: Mutex::default(),
        }
    }

    /// Returns the implementation that the layer forwards to.
    #[inline]
    pub fn next(&self) -> &Arc<dyn Dispatch> {
        &self.next
    }

    #[inline]
    pub fn create_info(&self) -> &LayerCreateInfo {
        &self.create_info
    }

    fn advertises(&self, version: Result<String, ClError>) -> bool {
        self.create_info.advertise_extension
            && version
                .ok()
                .and_then(|version| Version::from_version_string(&version))
                .is_some_and(|version| version >= self.create_info.minimum_version)
    }

    fn start_event(&self, event: Event) -> Option<Event> {
        self.event_map.lock().get(&event).copied()
    }
}

impl Drop for Layer {
    fn drop(&mut self) {
        for (_, start_event) in self.event_map.get_mut().drain() {
            if let Err(err) = self.next.release_event(start_event) {
                warn!(?start_event, %err, "failed to release the start event of a submission");
            }
        }
    }
}

/// Adds the emulated extension to a space-separated extension string that does not contain it
/// yet. A trailing space is kept.
pub(crate) fn add_extension_name(extensions: &str) -> String {
    if extensions.split(' ').any(|name| name == EXTENSION_NAME) {
        return extensions.to_owned();
    }

    let mut ret = String::with_capacity(extensions.len() + EXTENSION_NAME.len() + 1);
    ret.push_str(extensions);

    if extensions.ends_with(' ') {
        ret.push_str(EXTENSION_NAME);
        ret.push(' ');
    } else {
        if !extensions.is_empty() {
            ret.push(' ');
        }

        ret.push_str(EXTENSION_NAME);
    }

    ret
}

fn add_extension_version(mut extensions: Vec<NameVersion>) -> Vec<NameVersion> {
    if !extensions.iter().any(|e| e.name == EXTENSION_NAME) {
        extensions.push(NameVersion::new(EXTENSION_NAME, EXTENSION_VERSION));
    }

    extensions
}

impl Dispatch for Layer {
    fn platform_extensions(&self, platform: Platform) -> Result<String, ClError> {
        let extensions = self.next.platform_extensions(platform)?;

        if self.advertises(self.next.platform_version(platform)) {
            Ok(add_extension_name(&extensions))
        } else {
            Ok(extensions)
        }
    }

    fn platform_extensions_with_version(
        &self,
        platform: Platform,
    ) -> Result<Vec<NameVersion>, ClError> {
        let extensions = self.next.platform_extensions_with_version(platform)?;

        if self.advertises(self.next.platform_version(platform)) {
            Ok(add_extension_version(extensions))
        } else {
            Ok(extensions)
        }
    }

    fn platform_version(&self, platform: Platform) -> Result<String, ClError> {
        self.next.platform_version(platform)
    }

    fn device_extensions(&self, device: Device) -> Result<String, ClError> {
        let extensions = self.next.device_extensions(device)?;

        if self.advertises(self.next.device_version(device)) {
            Ok(add_extension_name(&extensions))
        } else {
            Ok(extensions)
        }
    }

    fn device_extensions_with_version(
        &self,
        device: Device,
    ) -> Result<Vec<NameVersion>, ClError> {
        let extensions = self.next.device_extensions_with_version(device)?;

        if self.advertises(self.next.device_version(device)) {
            Ok(add_extension_version(extensions))
        } else {
            Ok(extensions)
        }
    }

    fn device_version(&self, device: Device) -> Result<String, ClError> {
        self.next.device_version(device)
    }

    fn device_queue_properties(&self, device: Device) -> Result<QueueProperties, ClError> {
        self.next.device_queue_properties(device)
    }

    fn device_enqueue_capabilities(
        &self,
        device: Device,
    ) -> Result<DeviceEnqueueCapabilities, ClError> {
        self.next.device_enqueue_capabilities(device)
    }

    fn device_command_buffer_capabilities(
        &self,
        device: Device,
    ) -> Result<CommandBufferCapabilities, ClError> {
        let mut capabilities =
            CommandBufferCapabilities::KERNEL_PRINTF | CommandBufferCapabilities::SIMULTANEOUS_USE;

        if self
            .next
            .device_enqueue_capabilities(device)
            .is_ok_and(|caps| !caps.is_empty())
        {
            capabilities |= CommandBufferCapabilities::DEVICE_SIDE_ENQUEUE;
        }

        Ok(capabilities)
    }

    fn device_command_buffer_required_queue_properties(
        &self,
        _device: Device,
    ) -> Result<QueueProperties, ClError> {
        Ok(QueueProperties::empty())
    }

    fn queue_context(&self, queue: Queue) -> Result<Context, ClError> {
        self.next.queue_context(queue)
    }

    fn queue_device(&self, queue: Queue) -> Result<Device, ClError> {
        self.next.queue_device(queue)
    }

    fn finish(&self, queue: Queue) -> Result<(), ClError> {
        self.next.finish(queue)
    }

    fn retain_queue(&self, queue: Queue) -> Result<(), ClError> {
        self.next.retain_queue(queue)
    }

    fn release_queue(&self, queue: Queue) -> Result<(), ClError> {
        self.next.release_queue(queue)
    }

    fn retain_mem(&self, mem: Mem) -> Result<(), ClError> {
        self.next.retain_mem(mem)
    }

    fn release_mem(&self, mem: Mem) -> Result<(), ClError> {
        self.next.release_mem(mem)
    }

    fn retain_kernel(&self, kernel: Kernel) -> Result<(), ClError> {
        self.next.retain_kernel(kernel)
    }

    fn release_kernel(&self, kernel: Kernel) -> Result<(), ClError> {
        self.next.release_kernel(kernel)
    }

    fn retain_event(&self, event: Event) -> Result<(), ClError> {
        self.next.retain_event(event)
    }

    fn release_event(&self, event: Event) -> Result<(), ClError> {
        self.next.release_event(event)
    }

    fn image_format(&self, image: Mem) -> Result<ImageFormat, ClError> {
        self.next.image_format(image)
    }

    fn clone_kernel(&self, kernel: Kernel) -> Result<Kernel, ClError> {
        self.next.clone_kernel(kernel)
    }

    fn set_kernel_arg(&self, kernel: Kernel, index: u32, value: &[u8]) -> Result<(), ClError> {
        self.next.set_kernel_arg(kernel, index, value)
    }

    fn event_command_type(&self, event: Event) -> Result<CommandType, ClError> {
        if self.start_event(event).is_some() {
            return Ok(CommandType::CommandBufferKhr);
        }

        self.next.event_command_type(event)
    }

    fn event_profiling_info(&self, event: Event, info: ProfilingInfo) -> Result<u64, ClError> {
        match info {
            ProfilingInfo::Queued | ProfilingInfo::Submit | ProfilingInfo::Start => {
                let event = self.start_event(event).unwrap_or(event);

                self.next.event_profiling_info(event, info)
            }
            ProfilingInfo::End | ProfilingInfo::Complete => {
                self.next.event_profiling_info(event, info)
            }
        }
    }

    fn extension_function_address(
        &self,
        platform: Platform,
        name: &str,
    ) -> Option<ExtensionFunction> {
        self.get_extension_function_address(platform, name)
    }

    fn enqueue_barrier_with_wait_list(
        &self,
        queue: Queue,
        wait_list: &[Event],
        signal: bool,
    ) -> Result<Option<Event>, ClError> {
        self.next
            .enqueue_barrier_with_wait_list(queue, wait_list, signal)
    }

    fn enqueue_copy_buffer(&self, queue: Queue, info: &CopyBufferInfo) -> Result<(), ClError> {
        self.next.enqueue_copy_buffer(queue, info)
    }

    fn enqueue_copy_buffer_rect(
        &self,
        queue: Queue,
        info: &CopyBufferRectInfo,
    ) -> Result<(), ClError> {
        self.next.enqueue_copy_buffer_rect(queue, info)
    }

    fn enqueue_copy_buffer_to_image(
        &self,
        queue: Queue,
        info: &CopyBufferToImageInfo,
    ) -> Result<(), ClError> {
        self.next.enqueue_copy_buffer_to_image(queue, info)
    }

    fn enqueue_copy_image(&self, queue: Queue, info: &CopyImageInfo) -> Result<(), ClError> {
        self.next.enqueue_copy_image(queue, info)
    }

    fn enqueue_copy_image_to_buffer(
        &self,
        queue: Queue,
        info: &CopyImageToBufferInfo,
    ) -> Result<(), ClError> {
        self.next.enqueue_copy_image_to_buffer(queue, info)
    }

    fn enqueue_fill_buffer(&self, queue: Queue, info: &FillBufferInfo) -> Result<(), ClError> {
        self.next.enqueue_fill_buffer(queue, info)
    }

    fn enqueue_fill_image(&self, queue: Queue, info: &FillImageInfo) -> Result<(), ClError> {
        self.next.enqueue_fill_image(queue, info)
    }

    fn enqueue_nd_range_kernel(
        &self,
        queue: Queue,
        info: &NdRangeKernelInfo,
    ) -> Result<(), ClError> {
        self.next.enqueue_nd_range_kernel(queue, info)
    }
}

#[cfg(test)]
mod tests {
    use super::{add_extension_name, parse_control, LayerCreateInfo, EXTENSION_NAME};
    use crate::{
        fns::{CommandBufferCapabilities, CommandType, Dispatch, ProfilingInfo, QueueProperties},
        handle::{Event, Handle},
        host::{HostCreateInfo, HostDispatch},
        layer::Layer,
        Version,
    };
    use std::sync::Arc;

    #[test]
    fn extension_string() {
        assert_eq!(add_extension_name(""), "cl_khr_command_buffer");
        assert_eq!(add_extension_name("cl_a"), "cl_a cl_khr_command_buffer");
        assert_eq!(add_extension_name("cl_a "), "cl_a cl_khr_command_buffer ");
        assert_eq!(
            add_extension_name("cl_khr_command_buffer cl_a"),
            "cl_khr_command_buffer cl_a"
        );
        // A longer name that merely starts with the extension name does not count.
        assert_eq!(
            add_extension_name("cl_khr_command_buffer_mutable_dispatch"),
            "cl_khr_command_buffer_mutable_dispatch cl_khr_command_buffer"
        );
    }

    #[test]
    fn advertised_extension() {
        let (host, layer, _queue) = host_layer!();
        let platform = host.platform();
        let device = host.device();

        let extensions = layer.device_extensions(device).unwrap();
        assert!(extensions.split(' ').any(|name| name == EXTENSION_NAME));
        assert!(layer
            .platform_extensions(platform)
            .unwrap()
            .ends_with(EXTENSION_NAME));

        let with_version = layer.device_extensions_with_version(device).unwrap();
        let entry = with_version
            .iter()
            .find(|e| e.name == EXTENSION_NAME)
            .unwrap();
        assert_eq!(entry.version, Version { major: 0, minor: 9, patch: 2 });
        assert_eq!(
            with_version.len(),
            host.device_extensions_with_version(device).unwrap().len() + 1
        );
    }

    #[test]
    fn old_devices_are_not_told() {
        let host = Arc::new(HostDispatch::new(HostCreateInfo {
            device_version: "OpenCL 1.2 Host".to_owned(),
            ..Default::default()
        }));
        let layer = Layer::new(host.clone(), Default::default());

        assert_eq!(
            layer.device_extensions(host.device()),
            host.device_extensions(host.device())
        );
        // The platform reports 3.0.
        assert!(layer
            .platform_extensions(host.platform())
            .unwrap()
            .contains(EXTENSION_NAME));

        let (host, layer, _queue) = host_layer!(LayerCreateInfo {
            advertise_extension: false,
            ..Default::default()
        });
        assert_eq!(
            layer.device_extensions(host.device()),
            host.device_extensions(host.device())
        );
    }

    #[test]
    fn capabilities() {
        // The host supports out-of-order queues, which replay can't make use of.
        let (host, layer, _queue) = host_layer!();
        assert!(host
            .device_queue_properties(host.device())
            .unwrap()
            .intersects(QueueProperties::OUT_OF_ORDER_EXEC_MODE_ENABLE));
        assert_eq!(
            layer.device_command_buffer_capabilities(host.device()),
            Ok(CommandBufferCapabilities::KERNEL_PRINTF
                | CommandBufferCapabilities::SIMULTANEOUS_USE)
        );
        assert_eq!(
            layer.device_command_buffer_required_queue_properties(host.device()),
            Ok(QueueProperties::empty())
        );

        let host = Arc::new(HostDispatch::new(HostCreateInfo {
            queue_properties: QueueProperties::PROFILING_ENABLE,
            device_enqueue_capabilities: crate::fns::DeviceEnqueueCapabilities::SUPPORTED,
            ..Default::default()
        }));
        let layer = Layer::new(host.clone(), Default::default());
        assert_eq!(
            layer.device_command_buffer_capabilities(host.device()),
            Ok(CommandBufferCapabilities::KERNEL_PRINTF
                | CommandBufferCapabilities::SIMULTANEOUS_USE
                | CommandBufferCapabilities::DEVICE_SIDE_ENQUEUE)
        );
    }

    #[test]
    fn submission_events() {
        test_tracing!();

        let (host, layer, queue) = host_layer!();
        let handle = layer.create_command_buffer(&[queue], None).unwrap();
        layer.finalize_command_buffer(handle).unwrap();

        let mut event = Event::null();
        layer
            .enqueue_command_buffer(&[], handle, &[], Some(&mut event))
            .unwrap();

        assert_eq!(
            layer.event_command_type(event),
            Ok(CommandType::CommandBufferKhr)
        );
        assert_eq!(host.event_command_type(event), Ok(CommandType::Barrier));

        let start = layer.start_event(event).unwrap();
        for info in [ProfilingInfo::Queued, ProfilingInfo::Submit, ProfilingInfo::Start] {
            assert_eq!(
                layer.event_profiling_info(event, info),
                host.event_profiling_info(start, info)
            );
        }
        for info in [ProfilingInfo::End, ProfilingInfo::Complete] {
            assert_eq!(
                layer.event_profiling_info(event, info),
                host.event_profiling_info(event, info)
            );
        }

        // The start event is owned by the layer until it goes away.
        host.release_event(event).unwrap();
        assert_eq!(host.live_events(), 1);
        drop(layer);
        assert_eq!(host.live_events(), 0);
    }

    #[test]
    fn controls() {
        assert_eq!(parse_control("1"), 1);
        assert_eq!(parse_control(" 12abc"), 12);
        assert_eq!(parse_control("-3"), -3);
        assert_eq!(parse_control("yes"), 0);
        assert_eq!(parse_control(""), 0);

        let create_info = LayerCreateInfo::default().with_controls(|name| match name {
            "CMDBUFEMU_EnhancedErrorChecking" => Some("1".to_owned()),
            "CMDBUFEMU_AdvertiseExtension" => Some("0".to_owned()),
            _ => None,
        });
        assert!(create_info.enhanced_error_checking);
        assert!(!create_info.advertise_extension);

        let create_info = LayerCreateInfo::default().with_controls(|_| None);
        assert!(!create_info.enhanced_error_checking);
        assert!(create_info.advertise_extension);
    }
}
