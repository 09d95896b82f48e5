//! Swapchain parameter selection and the per-surface object set.
//!
//! Everything in [`SurfaceState`] depends on the presentation surface and is
//! torn down and recreated together whenever the surface is invalidated.

use ash::vk;

use crate::config::RendererConfig;
use crate::error::{GpuError, VkResultExt};
use crate::gpu::{GpuDevice, SurfaceSupport, SwapchainDesc};

/// Pick the swapchain extent.
///
/// A `current_extent` width of `u32::MAX` means the surface lets the
/// swapchain decide, in which case the drawable size is clamped to the
/// supported range.
pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, drawable: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: drawable
            .width
            .clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
        height: drawable
            .height
            .clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
    }
}

/// Pick the surface format: the preferred one when offered, otherwise the
/// first. A lone `UNDEFINED` entry means any format is accepted.
pub fn choose_format(formats: &[vk::SurfaceFormatKHR], preferred: vk::SurfaceFormatKHR) -> vk::SurfaceFormatKHR {
    match formats {
        [] => preferred,
        [only] if only.format == vk::Format::UNDEFINED => preferred,
        _ => formats
            .iter()
            .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
            .copied()
            .unwrap_or(formats[0]),
    }
}

/// MAILBOX when preferred and offered, otherwise FIFO (always available).
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], prefer_mailbox: bool) -> vk::PresentModeKHR {
    if prefer_mailbox && modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// One image more than the minimum, bounded by the maximum when the surface
/// has one (0 means unbounded).
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Resolve every swapchain parameter from what the surface supports.
pub fn resolve_swapchain(support: &SurfaceSupport, drawable: vk::Extent2D, config: &RendererConfig) -> SwapchainDesc {
    SwapchainDesc {
        image_count: choose_image_count(&support.capabilities),
        format: choose_format(&support.formats, config.preferred_format),
        extent: choose_extent(&support.capabilities, drawable),
        present_mode: choose_present_mode(&support.present_modes, config.prefer_mailbox),
        pre_transform: support.capabilities.current_transform,
    }
}

/// Swapchain, per-image views, framebuffers and command buffers, and the
/// render pass they share.
#[derive(Debug, Default)]
pub struct SurfaceState {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub render_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
}

impl SurfaceState {
    /// A state holding no objects.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create every surface-dependent object for `desc`.
    ///
    /// Anything created before a failure is destroyed before returning.
    pub fn build<D: GpuDevice>(device: &mut D, desc: &SwapchainDesc) -> Result<Self, GpuError> {
        let mut state = Self {
            format: desc.format,
            extent: desc.extent,
            present_mode: desc.present_mode,
            ..Self::default()
        };

        if let Err(e) = state.populate(device, desc) {
            state.destroy(device);
            return Err(e);
        }
        Ok(state)
    }

    fn populate<D: GpuDevice>(&mut self, device: &mut D, desc: &SwapchainDesc) -> Result<(), GpuError> {
        self.swapchain = device.create_swapchain(desc).op("create swapchain")?;
        self.images = device.swapchain_images(self.swapchain).op("get swapchain images")?;

        for &image in &self.images {
            let view = device.create_image_view(image, desc.format.format).op("create image view")?;
            self.image_views.push(view);
        }

        self.render_pass = device.create_render_pass(desc.format.format).op("create render pass")?;

        for &view in &self.image_views {
            let framebuffer = device
                .create_framebuffer(self.render_pass, view, desc.extent)
                .op("create framebuffer")?;
            self.framebuffers.push(framebuffer);
        }

        self.command_buffers = device
            .allocate_command_buffers(self.images.len() as u32)
            .op("allocate frame command buffers")?;
        Ok(())
    }

    /// Free the per-image command buffers and allocate a fresh set.
    pub fn reallocate_command_buffers<D: GpuDevice>(&mut self, device: &mut D) -> Result<(), GpuError> {
        device.free_command_buffers(&self.command_buffers);
        self.command_buffers.clear();
        self.command_buffers = device
            .allocate_command_buffers(self.images.len() as u32)
            .op("allocate frame command buffers")?;
        Ok(())
    }

    /// Destroy every object and return to the empty state. Safe to call on
    /// a partially built or already empty state.
    pub fn destroy<D: GpuDevice>(&mut self, device: &mut D) {
        if !self.command_buffers.is_empty() {
            device.free_command_buffers(&self.command_buffers);
        }
        for &framebuffer in &self.framebuffers {
            device.destroy_framebuffer(framebuffer);
        }
        if self.render_pass != vk::RenderPass::null() {
            device.destroy_render_pass(self.render_pass);
        }
        for &view in &self.image_views {
            device.destroy_image_view(view);
        }
        if self.swapchain != vk::SwapchainKHR::null() {
            device.destroy_swapchain(self.swapchain);
        }
        *self = Self::empty();
    }

    pub fn is_empty(&self) -> bool {
        self.swapchain == vk::SwapchainKHR::null()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}
