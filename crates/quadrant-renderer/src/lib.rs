#![allow(clippy::too_many_arguments, clippy::missing_safety_doc)]
//! Double-buffered Vulkan quad renderer.
//!
//! Quads are staged into a [`QuadPool`], uploaded in batches and drawn by
//! every pipeline selected through [`FramePipeline::record_frame`]. The
//! frame pipeline keeps two frames in flight and rebuilds its swapchain and
//! pipelines whenever the presentation surface changes.
//!
//! All device access goes through [`GpuDevice`]: [`vulkan::VulkanDevice`]
//! drives a real GPU, [`headless::HeadlessDevice`] runs everything in memory.

pub mod buffer;
pub mod config;
pub mod error;
pub mod frame;
pub mod gpu;
pub mod headless;
pub mod pipeline;
pub mod pool;
pub mod renderer;
pub mod swapchain;

// Vulkan backend
pub mod vulkan;

pub use config::RendererConfig;
pub use error::{ConfigError, ContextError, FrameError, GpuError, PoolError, RebuildError, RegistryError};
pub use gpu::GpuDevice;
pub use pipeline::{PipelineIndex, ShaderKind, ShaderStage};
pub use pool::{rect, DirtyMask, PrimitiveId, QuadPool, Vertex, BYTES_PER_QUAD, VERTICES_PER_QUAD};
pub use renderer::{FramePipeline, SurfaceStatus};
