// Entry point for the quadrant demo.
//
// Opens a window, draws a colored grid of quads with the given SPIR-V
// shaders and keeps presenting until the window is closed or Escape is
// pressed. Resize and minimize events are forwarded to the frame pipeline.

use std::path::PathBuf;

use anyhow::{Context, Result};
use ash::vk;
use clap::Parser;
use log::{error, info};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowId};

use quadrant_renderer::vulkan::{VulkanContext, VulkanDevice};
use quadrant_renderer::{rect, FramePipeline, RendererConfig, ShaderKind};

#[derive(Parser, Debug)]
#[command(name = "quadrant", about = "Draw a grid of colored quads with Vulkan")]
struct Args {
    /// Vertex shader, compiled SPIR-V
    vert: PathBuf,

    /// Fragment shader, compiled SPIR-V
    frag: PathBuf,

    /// Shader entry point name
    #[arg(long, default_value = "main")]
    entry: String,

    /// Quad slots in the pool
    #[arg(long, default_value_t = 4096)]
    capacity: usize,

    /// Quads per grid row and column
    #[arg(long, default_value_t = 16)]
    grid: u32,

    /// Stay on FIFO even when MAILBOX is available
    #[arg(long)]
    no_mailbox: bool,

    /// Enable the Khronos validation layer
    #[arg(long)]
    validation: bool,

    #[arg(long, default_value_t = 1280)]
    width: u32,

    #[arg(long, default_value_t = 720)]
    height: u32,
}

impl Args {
    fn renderer_config(&self) -> RendererConfig {
        RendererConfig {
            prefer_mailbox: !self.no_mailbox,
            enable_validation: self.validation,
            ..RendererConfig::default()
        }
        .with_pool_capacity(self.capacity)
    }
}

/// Application state for the winit event loop.
///
/// Field order is drop order: the renderer goes before the window whose
/// surface it presents to.
struct QuadrantApp {
    args: Args,
    renderer: Option<FramePipeline<VulkanDevice>>,
    window: Option<Window>,
    failure: Option<anyhow::Error>,
}

impl QuadrantApp {
    fn new(args: Args) -> Self {
        Self { args, renderer: None, window: None, failure: None }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let attributes = Window::default_attributes()
            .with_title("quadrant")
            .with_inner_size(PhysicalSize::new(self.args.width, self.args.height));
        let window = event_loop.create_window(attributes).context("failed to create window")?;

        let display_handle = window.display_handle().context("no display handle")?.as_raw();
        let window_handle = window.window_handle().context("no window handle")?.as_raw();
        // SAFETY: the window is stored next to the renderer and outlives it.
        let ctx = unsafe { VulkanContext::new(display_handle, window_handle, self.args.validation) }
            .context("failed to initialize Vulkan")?;

        let size = window.inner_size();
        let device = VulkanDevice::new(ctx, vk::Extent2D { width: size.width, height: size.height })
            .context("failed to create device")?;
        let mut renderer =
            FramePipeline::new(device, self.args.renderer_config()).context("failed to create frame pipeline")?;

        if let Err(e) = self.populate(&mut renderer) {
            renderer.shutdown();
            return Err(e);
        }

        self.renderer = Some(renderer);
        self.window = Some(window);
        Ok(())
    }

    /// Load the shaders, register the pipeline and fill the grid.
    fn populate(&self, renderer: &mut FramePipeline<VulkanDevice>) -> Result<()> {
        let vert = std::fs::read(&self.args.vert)
            .with_context(|| format!("failed to read {}", self.args.vert.display()))?;
        let frag = std::fs::read(&self.args.frag)
            .with_context(|| format!("failed to read {}", self.args.frag.display()))?;

        let vertex = renderer.create_shader_stage(ShaderKind::Vertex, &vert, &self.args.entry)?;
        let fragment = renderer.create_shader_stage(ShaderKind::Fragment, &frag, &self.args.entry)?;
        let pipeline = renderer.create_pipeline(&vertex, &fragment)?;

        let n = self.args.grid.max(1);
        let cell = 2.0 / n as f32;
        let gap = cell * 0.1;
        let mut inserted = 0usize;
        for row in 0..n {
            for col in 0..n {
                let x = -1.0 + col as f32 * cell;
                let y = -1.0 + row as f32 * cell;
                let color = [col as f32 / n as f32, row as f32 / n as f32, 0.6, 1.0];
                match renderer.insert_primitive(&rect([x + gap, y + gap], [x + cell - gap, y + cell - gap], color)) {
                    Ok(_) => inserted += 1,
                    Err(e) => {
                        error!("grid truncated after {} quads: {}", inserted, e);
                        break;
                    }
                }
            }
        }
        info!("inserted {} quads", inserted);

        renderer.record_frame(pipeline)?;
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        error!("{:#}", err);
        self.failure = Some(err);
        event_loop.exit();
    }

    fn teardown(&mut self) {
        if let Some(mut renderer) = self.renderer.take() {
            if let Err(e) = renderer.wait_idle() {
                error!("wait idle at shutdown failed: {}", e);
            }
            drop(renderer.shutdown());
        }
        self.window = None;
    }
}

impl ApplicationHandler for QuadrantApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.renderer.is_some() {
            return;
        }
        if let Err(e) = self.init(event_loop) {
            self.fail(event_loop, e);
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => event_loop.exit(),

            WindowEvent::KeyboardInput { event, .. }
                if event.state == ElementState::Pressed && event.logical_key == Key::Named(NamedKey::Escape) =>
            {
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                let Some(renderer) = self.renderer.as_mut() else { return };
                if size.width == 0 || size.height == 0 {
                    renderer.notify_minimized(true);
                } else {
                    renderer
                        .device_mut()
                        .set_drawable_extent(vk::Extent2D { width: size.width, height: size.height });
                    renderer.notify_minimized(false);
                    renderer.notify_resized();
                }
            }

            WindowEvent::RedrawRequested => {
                let Some(renderer) = self.renderer.as_mut() else { return };
                if let Err(e) = renderer.draw_frame() {
                    self.fail(event_loop, anyhow::Error::new(e).context("frame failed"));
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let minimized = self.renderer.as_ref().is_some_and(|r| r.is_minimized());
        event_loop.set_control_flow(if minimized { ControlFlow::Wait } else { ControlFlow::Poll });
        if !minimized {
            if let Some(window) = &self.window {
                window.request_redraw();
            }
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.teardown();
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let event_loop = EventLoop::new().context("failed to create winit EventLoop")?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = QuadrantApp::new(args);
    event_loop.run_app(&mut app).context("event loop failed")?;
    app.teardown();

    match app.failure.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
