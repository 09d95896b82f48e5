//! Surface queries.

use ash::vk;

use super::VulkanContext;
use crate::gpu::SurfaceSupport;

/// Query the capabilities, formats and present modes of the context's
/// surface. Called on every rebuild; the answers change with the window.
pub fn query_support(ctx: &VulkanContext) -> Result<SurfaceSupport, vk::Result> {
    unsafe {
        let capabilities = ctx
            .surface_loader
            .get_physical_device_surface_capabilities(ctx.physical_device, ctx.surface)?;
        let formats = ctx
            .surface_loader
            .get_physical_device_surface_formats(ctx.physical_device, ctx.surface)?;
        let present_modes = ctx
            .surface_loader
            .get_physical_device_surface_present_modes(ctx.physical_device, ctx.surface)?;

        Ok(SurfaceSupport { capabilities, formats, present_modes })
    }
}
