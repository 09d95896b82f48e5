//! Renderer configuration.
//!
//! Collects the knobs the frame pipeline reads at startup and on every
//! surface rebuild. Validated once before any GPU object is created.

use ash::vk;

use crate::error::ConfigError;
use crate::pool::VERTICES_PER_QUAD;

/// Number of frames that may be in flight at once.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Upper bound on registered pipelines.
pub const DEFAULT_PIPELINE_CEILING: usize = 50;

/// Default number of quads the pool can hold.
pub const DEFAULT_POOL_CAPACITY: usize = 4096;

/// Renderer configuration settings.
#[derive(Debug, Clone, Copy)]
pub struct RendererConfig {
    /// Number of quad slots in the primitive pool
    pub pool_capacity: usize,
    /// Maximum number of registered pipelines
    pub pipeline_ceiling: usize,
    /// Depth of the frame-in-flight ring
    pub frames_in_flight: usize,
    /// Use MAILBOX presentation when the surface offers it
    pub prefer_mailbox: bool,
    /// Surface format picked when offered, otherwise the first one is used
    pub preferred_format: vk::SurfaceFormatKHR,
    /// Clear color of the single color attachment
    pub clear_color: [f32; 4],
    /// Enable VK_LAYER_KHRONOS_validation and the debug messenger
    pub enable_validation: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            pool_capacity: DEFAULT_POOL_CAPACITY,
            pipeline_ceiling: DEFAULT_PIPELINE_CEILING,
            frames_in_flight: MAX_FRAMES_IN_FLIGHT,
            prefer_mailbox: true,
            preferred_format: vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            clear_color: [0.0, 0.0, 0.0, 1.0],
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl RendererConfig {
    /// Check the configuration before anything is allocated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }

        // The draw call vertex count is a u32
        let max_quads = u32::MAX as usize / VERTICES_PER_QUAD as usize;
        if self.pool_capacity > max_quads {
            return Err(ConfigError::CapacityTooLarge(self.pool_capacity));
        }

        if self.pipeline_ceiling == 0 {
            return Err(ConfigError::ZeroPipelineCeiling);
        }

        if self.frames_in_flight == 0 || self.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(ConfigError::FramesInFlight {
                got: self.frames_in_flight,
                max: MAX_FRAMES_IN_FLIGHT,
            });
        }

        Ok(())
    }

    /// Builder-style capacity override.
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// Builder-style pipeline ceiling override.
    pub fn with_pipeline_ceiling(mut self, ceiling: usize) -> Self {
        self.pipeline_ceiling = ceiling;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RendererConfig::default();
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.pipeline_ceiling, 50);
        assert_eq!(config.clear_color, [0.0, 0.0, 0.0, 1.0]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = RendererConfig::default().with_pool_capacity(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroCapacity));
    }

    #[test]
    fn test_capacity_overflowing_draw_rejected() {
        let too_big = u32::MAX as usize / 6 + 1;
        let config = RendererConfig::default().with_pool_capacity(too_big);
        assert_eq!(config.validate(), Err(ConfigError::CapacityTooLarge(too_big)));
    }

    #[test]
    fn test_zero_ceiling_rejected() {
        let config = RendererConfig::default().with_pipeline_ceiling(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroPipelineCeiling));
    }

    #[test]
    fn test_frames_in_flight_bounds() {
        let mut config = RendererConfig::default();
        config.frames_in_flight = 0;
        assert!(matches!(config.validate(), Err(ConfigError::FramesInFlight { got: 0, .. })));
        config.frames_in_flight = 3;
        assert!(matches!(config.validate(), Err(ConfigError::FramesInFlight { got: 3, .. })));
        config.frames_in_flight = 1;
        assert!(config.validate().is_ok());
    }
}
