//! Vulkan context: instance, surface, physical device, logical device and
//! queues.

use ash::khr::{surface, swapchain};
use ash::{vk, Device, Entry, Instance};
use log::{debug, error, info, warn};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;
use std::os::raw::c_char;

use super::{APP_NAME, ENGINE_NAME, REQUIRED_VK_VERSION};
use crate::error::{ContextError, VkResultExt};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Queue family indices.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }
}

/// Core Vulkan objects, created once at startup.
pub struct VulkanContext {
    pub entry: Entry,
    pub instance: Instance,
    pub surface: vk::SurfaceKHR,
    pub physical_device: vk::PhysicalDevice,
    pub device: Device,
    pub graphics_family: u32,
    pub present_family: u32,

    // Queues
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,

    // Extension loaders
    pub surface_loader: surface::Instance,
    pub swapchain_loader: swapchain::Device,

    pub device_properties: vk::PhysicalDeviceProperties,

    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanContext {
    /// Create the instance, a surface for the window and a logical device
    /// that can present to it.
    ///
    /// # Safety
    /// The window handles must be valid and outlive the context.
    pub unsafe fn new(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        enable_validation: bool,
    ) -> Result<Self, ContextError> {
        let entry = Entry::linked();

        let api_version = entry
            .try_enumerate_instance_version()
            .op("enumerate instance version")?
            .unwrap_or(vk::API_VERSION_1_0);

        if api_version < REQUIRED_VK_VERSION {
            return Err(ContextError::ApiVersion {
                major: vk::api_version_major(REQUIRED_VK_VERSION),
                minor: vk::api_version_minor(REQUIRED_VK_VERSION),
                found_major: vk::api_version_major(api_version),
                found_minor: vk::api_version_minor(api_version),
            });
        }

        let enable_validation = enable_validation && Self::validation_available(&entry);
        let instance = Self::create_instance(&entry, display_handle, enable_validation)?;

        let debug_utils = if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(pair) => Some(pair),
                Err(e) => {
                    warn!("debug messenger unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let surface_loader = surface::Instance::new(&entry, &instance);

        let surface = match ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
            .op("create surface")
        {
            Ok(surface) => surface,
            Err(e) => {
                Self::destroy_instance(&instance, debug_utils.as_ref());
                return Err(e.into());
            }
        };

        let picked = Self::pick_physical_device(&instance, &surface_loader, surface).and_then(
            |(physical_device, families)| {
                let device = Self::create_logical_device(&instance, physical_device, &families)?;
                Ok((physical_device, families, device))
            },
        );

        let (physical_device, families, device) = match picked {
            Ok(picked) => picked,
            Err(e) => {
                surface_loader.destroy_surface(surface, None);
                Self::destroy_instance(&instance, debug_utils.as_ref());
                return Err(e);
            }
        };

        // Both are present after a successful pick.
        let graphics_family = families.graphics.unwrap_or_default();
        let present_family = families.present.unwrap_or(graphics_family);

        let graphics_queue = device.get_device_queue(graphics_family, 0);
        let present_queue = device.get_device_queue(present_family, 0);
        let swapchain_loader = swapchain::Device::new(&instance, &device);
        let device_properties = instance.get_physical_device_properties(physical_device);

        Ok(Self {
            entry,
            instance,
            surface,
            physical_device,
            device,
            graphics_family,
            present_family,
            graphics_queue,
            present_queue,
            surface_loader,
            swapchain_loader,
            device_properties,
            debug_utils,
        })
    }

    unsafe fn validation_available(entry: &Entry) -> bool {
        let layers = entry.enumerate_instance_layer_properties().unwrap_or_default();
        let found = layers
            .iter()
            .any(|layer| CStr::from_ptr(layer.layer_name.as_ptr()) == VALIDATION_LAYER);
        if !found {
            warn!("validation requested but {:?} is not installed", VALIDATION_LAYER);
        }
        found
    }

    /// Create Vulkan instance with the window system's surface extensions.
    unsafe fn create_instance(
        entry: &Entry,
        display_handle: RawDisplayHandle,
        enable_validation: bool,
    ) -> Result<Instance, ContextError> {
        let app_info = vk::ApplicationInfo::default()
            .application_name(APP_NAME)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(REQUIRED_VK_VERSION);

        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .op("enumerate surface extensions")?
            .to_vec();

        let mut layers: Vec<*const c_char> = Vec::new();
        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
            layers.push(VALIDATION_LAYER.as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        Ok(entry.create_instance(&create_info, None).op("create instance")?)
    }

    /// Route validation messages through the `log` facade.
    unsafe fn setup_debug_messenger(
        entry: &Entry,
        instance: &Instance,
    ) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT), ContextError> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = debug_utils
            .create_debug_utils_messenger(&create_info, None)
            .op("create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    /// Select the best physical device that can present to `surface`.
    unsafe fn pick_physical_device(
        instance: &Instance,
        surface_loader: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, QueueFamilyIndices), ContextError> {
        let devices = instance.enumerate_physical_devices().op("enumerate physical devices")?;

        let best = devices
            .iter()
            .filter_map(|&device| {
                let score = Self::rate_device(instance, device, surface_loader, surface);
                (score > 0).then_some((device, score))
            })
            .max_by_key(|&(_, score)| score);

        let (physical_device, _) = best.ok_or(ContextError::NoSuitableDevice)?;
        let families = Self::find_queue_families(instance, physical_device, surface_loader, surface);

        let props = instance.get_physical_device_properties(physical_device);
        let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
        info!(
            "selected GPU: {} ({:?}, Vulkan {}.{})",
            name,
            props.device_type,
            vk::api_version_major(props.api_version),
            vk::api_version_minor(props.api_version)
        );

        Ok((physical_device, families))
    }

    /// Rate a physical device (higher is better, 0 is unusable).
    unsafe fn rate_device(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface_loader: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> u32 {
        if !Self::find_queue_families(instance, device, surface_loader, surface).is_complete() {
            return 0;
        }

        let has_swapchain = instance
            .enumerate_device_extension_properties(device)
            .unwrap_or_default()
            .iter()
            .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == swapchain::NAME);
        if !has_swapchain {
            return 0;
        }

        let formats = surface_loader
            .get_physical_device_surface_formats(device, surface)
            .unwrap_or_default();
        let modes = surface_loader
            .get_physical_device_surface_present_modes(device, surface)
            .unwrap_or_default();
        if formats.is_empty() || modes.is_empty() {
            return 0;
        }

        let props = instance.get_physical_device_properties(device);
        let mut score = 1u32;

        // Prefer discrete GPU
        if props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 10000;
        } else if props.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 1000;
        }

        // Add VRAM size to score
        let memory_props = instance.get_physical_device_memory_properties(device);
        for heap in &memory_props.memory_heaps[..memory_props.memory_heap_count as usize] {
            if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
                score = score.saturating_add((heap.size / (1024 * 1024)) as u32);
            }
        }

        debug!(
            "GPU candidate {} scored {}",
            CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy(),
            score
        );
        score
    }

    /// Find queue family indices for a physical device. A family that can
    /// both draw and present is preferred.
    unsafe fn find_queue_families(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface_loader: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> QueueFamilyIndices {
        let queue_families = instance.get_physical_device_queue_family_properties(device);

        let mut indices = QueueFamilyIndices::default();

        for (i, family) in queue_families.iter().enumerate() {
            let i = i as u32;
            let graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let present = surface_loader
                .get_physical_device_surface_support(device, i, surface)
                .unwrap_or(false);

            if graphics && present {
                return QueueFamilyIndices { graphics: Some(i), present: Some(i) };
            }
            if graphics && indices.graphics.is_none() {
                indices.graphics = Some(i);
            }
            if present && indices.present.is_none() {
                indices.present = Some(i);
            }
        }

        indices
    }

    /// Create the logical device with the swapchain extension.
    unsafe fn create_logical_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        families: &QueueFamilyIndices,
    ) -> Result<Device, ContextError> {
        let graphics = families.graphics.ok_or(ContextError::NoSuitableDevice)?;
        let present = families.present.ok_or(ContextError::NoSuitableDevice)?;

        let mut unique_families = vec![graphics];
        if present != graphics {
            unique_families.push(present);
        }

        let queue_priorities = [1.0f32];
        let queue_create_infos: Vec<_> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let extensions = [swapchain::NAME.as_ptr()];

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions);

        Ok(instance
            .create_device(physical_device, &create_info, None)
            .op("create logical device")?)
    }

    unsafe fn destroy_instance(
        instance: &Instance,
        debug_utils: Option<&(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    ) {
        if let Some((loader, messenger)) = debug_utils {
            loader.destroy_debug_utils_messenger(*messenger, None);
        }
        instance.destroy_instance(None);
    }

    /// Wait for all device operations to complete.
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        unsafe { self.device.device_wait_idle() }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.wait_idle() {
                warn!("device wait idle failed during teardown: {}", e);
            }
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            Self::destroy_instance(&self.instance, self.debug_utils.as_ref());
        }
    }
}

/// Debug callback for validation layers.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _ty: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", "{}", message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", "{}", message);
    } else {
        debug!(target: "vulkan", "{}", message);
    }

    vk::FALSE
}
