use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};
use winit::dpi::PhysicalSize;
use winit::event::{Event, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop};
use winit::window::{Window, WindowBuilder};

use crate::gpu::WgpuContext;
use crate::pipeline::{Pipeline, SourceUpdate};
use crate::types::ViewerConfig;

/// Desktop host: one window, one surface, one pipeline redrawn continuously.
#[derive(Debug, Clone)]
pub struct Viewer {
    config: ViewerConfig,
}

impl Viewer {
    pub fn new(config: ViewerConfig) -> Self {
        Self { config }
    }

    /// Opens the window and blocks until it is closed. Pipeline construction
    /// errors abort start-up.
    pub fn run(self) -> Result<()> {
        let config = self.config;
        let event_loop =
            EventLoop::new().map_err(|err| anyhow!("failed to create event loop: {err}"))?;

        let window = WindowBuilder::new()
            .with_title(&config.title)
            .with_inner_size(PhysicalSize::new(
                config.surface_size.0,
                config.surface_size.1,
            ))
            .build(&event_loop)
            .map_err(|err| anyhow!("failed to create window: {err}"))?;
        let mut state = ViewerState::new(Arc::new(window), &config)?;

        let mut result = Ok(());
        let run_result = event_loop.run(move |event, elwt| match event {
            Event::WindowEvent { window_id, event } if window_id == state.window.id() => {
                match event {
                    WindowEvent::CloseRequested | WindowEvent::Destroyed => {
                        state.dispose();
                        elwt.exit();
                    }
                    WindowEvent::Resized(new_size) => state.resize(new_size),
                    WindowEvent::RedrawRequested => state.redraw(),
                    _ => {}
                }
            }
            Event::AboutToWait => {
                state.window.request_redraw();
                elwt.set_control_flow(ControlFlow::Wait);
            }
            Event::LoopExiting => state.dispose(),
            _ => {}
        });

        if let Err(err) = run_result {
            result = Err(anyhow!("window event loop error: {err}"));
        }

        result
    }
}

// Field order matters: the surface must be dropped before the window.
struct ViewerState {
    pipeline: Option<Pipeline<WgpuContext>>,
    updates: Vec<SourceUpdate>,
    ctx: WgpuContext,
    window: Arc<Window>,
}

impl ViewerState {
    fn new(window: Arc<Window>, config: &ViewerConfig) -> Result<Self> {
        let size = window.inner_size();
        let mut ctx = WgpuContext::new(
            window.as_ref(),
            (size.width, size.height),
            config.vsync,
            config.gpu_power,
        )?;
        let mut pipeline =
            Pipeline::new(&mut ctx, &config.pipeline).context("failed to build render pipeline")?;

        let mut updates = Vec::new();
        if let Some(source) = &config.source {
            match pipeline.update_source(&mut ctx, source) {
                Ok(update) => updates.push(update),
                Err(error) => warn!(%error, "initial source image rejected"),
            }
        }

        Ok(Self {
            pipeline: Some(pipeline),
            updates,
            ctx,
            window,
        })
    }

    fn resize(&mut self, new_size: PhysicalSize<u32>) {
        self.ctx.resize(new_size.width, new_size.height);
    }

    fn redraw(&mut self) {
        let Some(pipeline) = self.pipeline.as_mut() else {
            return;
        };
        pipeline.render(&mut self.ctx);

        self.updates.retain_mut(|update| match update.poll() {
            None => true,
            Some(Ok(source)) => {
                info!(
                    url = %source.url,
                    width = source.width,
                    height = source.height,
                    "source image loaded"
                );
                false
            }
            Some(Err(error)) => {
                warn!(%error, "source image failed to load");
                false
            }
        });
    }

    fn dispose(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.dispose(&mut self.ctx);
            debug!("viewer released GPU resources");
        }
    }
}
