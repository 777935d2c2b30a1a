use std::fmt;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use tracing::{debug, trace, warn};

use crate::compile::build_program;
use crate::context::GraphicsContext;
use crate::error::{InitError, LoadCause, TextureLoadError};
use crate::runtime::{BoxedClock, Clock, SystemClock};
use crate::texture::{TextureFuture, TextureLoader};
use crate::types::{
    PipelineDescriptor, UniformNames, UniformValue, VertexAttribute, QUAD_VERTEX_COUNT,
    QUAD_VERTICES, SOURCE_TEXTURE_UNIT,
};

/// Previous frame timestamp plus the seconds accumulated since construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockState {
    last: Instant,
    elapsed: f64,
}

impl ClockState {
    pub fn new(start: Instant) -> Self {
        Self {
            last: start,
            elapsed: 0.0,
        }
    }

    /// Adds the time since the previous frame and returns the new total.
    /// Timestamps older than the previous frame add nothing.
    pub fn advance(&mut self, now: Instant) -> f32 {
        self.elapsed += now.saturating_duration_since(self.last).as_secs_f64();
        self.last = self.last.max(now);
        self.elapsed as f32
    }

    pub fn elapsed(&self) -> f32 {
        self.elapsed as f32
    }

    pub fn last_frame(&self) -> Instant {
        self.last
    }
}

/// Texture currently sampled by the pipeline and its pixel size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTexture<T> {
    pub texture: T,
    pub width: u32,
    pub height: u32,
}

/// Reported when a source update resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

pub type SourceOutcome = Result<SourceInfo, TextureLoadError>;

/// Caller's view of one `update_source` call.
///
/// The pipeline applies the result on its own render thread; this handle only
/// observes it. Outcomes appear after the frame (or `poll_sources` call) that
/// applied them.
#[derive(Debug)]
pub struct SourceUpdate {
    url: String,
    receiver: Receiver<SourceOutcome>,
    outcome: Option<SourceOutcome>,
}

impl SourceUpdate {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn poll(&mut self) -> Option<&SourceOutcome> {
        if self.outcome.is_none() {
            match self.receiver.try_recv() {
                Ok(outcome) => self.outcome = Some(outcome),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    self.outcome = Some(Err(TextureLoadError::new(
                        self.url.clone(),
                        LoadCause::Disposed,
                    )));
                }
            }
        }
        self.outcome.as_ref()
    }

    pub fn is_resolved(&mut self) -> bool {
        self.poll().is_some()
    }

    pub fn into_result(mut self) -> Option<SourceOutcome> {
        self.poll();
        self.outcome
    }
}

/// Optional collaborators for [`Pipeline::with_options`].
pub struct PipelineOptions {
    pub loader: TextureLoader,
    pub clock: BoxedClock,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            loader: TextureLoader::default(),
            clock: Box::new(SystemClock),
        }
    }
}

impl PipelineOptions {
    pub fn loader(mut self, loader: TextureLoader) -> Self {
        self.loader = loader;
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }
}

struct PendingSource<T> {
    future: TextureFuture<T>,
    reply: Sender<SourceOutcome>,
}

struct UniformSet<L> {
    time: Option<L>,
    sampler: Option<L>,
    resolution: Option<L>,
}

/// One full-screen quad drawn with one program, optionally sampling one
/// source texture.
///
/// The pipeline owns every object it creates but never the context: each
/// call borrows it. Handles are plain values, so the owner must call
/// [`dispose`](Self::dispose) before dropping the pipeline to release them.
pub struct Pipeline<C: GraphicsContext> {
    program: C::Program,
    geometry: C::Buffer,
    uniforms: UniformSet<C::UniformLocation>,
    clock_state: ClockState,
    clock: BoxedClock,
    loader: TextureLoader,
    source: Option<SourceTexture<C::Texture>>,
    pending: Vec<PendingSource<C::Texture>>,
}

impl<C: GraphicsContext> fmt::Debug for Pipeline<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("clock_state", &self.clock_state)
            .field("source", &self.source)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl<C: GraphicsContext> Pipeline<C> {
    /// Builds a pipeline with the system clock and the default image
    /// fetcher.
    pub fn new(ctx: &mut C, descriptor: &PipelineDescriptor) -> Result<Self, InitError> {
        Self::with_options(ctx, descriptor, PipelineOptions::default())
    }

    /// Builds the geometry, program and uniform bindings. Either everything
    /// is created or nothing stays allocated.
    pub fn with_options(
        ctx: &mut C,
        descriptor: &PipelineDescriptor,
        options: PipelineOptions,
    ) -> Result<Self, InitError> {
        if !ctx.is_live() {
            return Err(InitError::NoGraphicsContext);
        }

        let geometry = ctx.create_vertex_buffer(&QUAD_VERTICES);

        let program = match build_program(
            ctx,
            &descriptor.vertex_source,
            &descriptor.fragment_source,
        ) {
            Ok(program) => program,
            Err(err) => {
                ctx.delete_buffer(geometry);
                return Err(err);
            }
        };

        let uniforms = match resolve_uniforms(ctx, &program, &descriptor.uniforms) {
            Ok(uniforms) => uniforms,
            Err(err) => {
                ctx.delete_program(program);
                ctx.delete_buffer(geometry);
                return Err(err);
            }
        };

        let clock_state = ClockState::new(options.clock.now());
        debug!("render pipeline constructed");

        Ok(Self {
            program,
            geometry,
            uniforms,
            clock_state,
            clock: options.clock,
            loader: options.loader,
            source: None,
            pending: Vec::new(),
        })
    }

    /// Draws one frame stamped with the pipeline's clock.
    pub fn render(&mut self, ctx: &mut C) {
        let now = self.clock.now();
        self.render_at(ctx, now);
    }

    /// Draws one frame stamped `now`. Never fails; with a lost context the
    /// frame is skipped.
    pub fn render_at(&mut self, ctx: &mut C, now: Instant) {
        if !ctx.is_live() {
            trace!("graphics context lost, frame skipped");
            return;
        }

        self.poll_sources(ctx);

        let time = self.clock_state.advance(now);
        if let Some(location) = &self.uniforms.time {
            ctx.set_uniform(&self.program, location, UniformValue::Float(time));
        }

        ctx.bind_texture(
            SOURCE_TEXTURE_UNIT,
            self.source.as_ref().map(|source| &source.texture),
        );
        if let Some(location) = &self.uniforms.sampler {
            ctx.set_uniform(
                &self.program,
                location,
                UniformValue::Sampler(SOURCE_TEXTURE_UNIT),
            );
        }

        ctx.bind_vertex_buffer(&self.geometry, VertexAttribute::POSITION);
        ctx.use_program(&self.program);
        ctx.draw_triangles(0, QUAD_VERTEX_COUNT);
        trace!(time, "frame drawn");
    }

    /// Starts loading `url` as the new source texture without blocking.
    ///
    /// When no texture is current yet, the load's placeholder becomes current
    /// immediately. The texture and the resolution uniform change together
    /// once the load resolves; if several loads are in flight, the one that
    /// resolves last wins.
    pub fn update_source(&mut self, ctx: &mut C, url: &str) -> Result<SourceUpdate, TextureLoadError> {
        if url.trim().is_empty() {
            return Err(TextureLoadError::new(url, LoadCause::EmptyLocation));
        }

        let future = self.loader.load(ctx, url);
        if self.source.is_none() {
            if let Some(placeholder) = future.texture() {
                let placeholder = SourceTexture {
                    texture: placeholder.clone(),
                    width: 1,
                    height: 1,
                };
                self.install_source(ctx, placeholder);
            }
        }

        let (reply, receiver) = bounded(1);
        self.pending.push(PendingSource { future, reply });
        debug!(url, pending = self.pending.len(), "source update started");

        Ok(SourceUpdate {
            url: url.to_string(),
            receiver,
            outcome: None,
        })
    }

    /// Applies every load that has finished, in the order the loads were
    /// started. Returns how many resolved.
    pub fn poll_sources(&mut self, ctx: &mut C) -> usize {
        let mut resolved = 0;
        let mut index = 0;
        while index < self.pending.len() {
            let Some(outcome) = self.pending[index].future.poll(ctx) else {
                index += 1;
                continue;
            };
            let pending = self.pending.remove(index);
            resolved += 1;

            let reply = match outcome {
                Ok(loaded) => {
                    let info = SourceInfo {
                        url: pending.future.url().to_string(),
                        width: loaded.width,
                        height: loaded.height,
                    };
                    self.install_source(
                        ctx,
                        SourceTexture {
                            texture: loaded.texture,
                            width: loaded.width,
                            height: loaded.height,
                        },
                    );
                    Ok(info)
                }
                Err(failed) => {
                    let is_current = self
                        .source
                        .as_ref()
                        .is_some_and(|source| source.texture == failed.texture);
                    if !is_current {
                        ctx.delete_texture(failed.texture);
                    }
                    Err(failed.error)
                }
            };
            // The caller may have dropped its handle.
            let _ = pending.reply.try_send(reply);
        }
        resolved
    }

    pub fn clock(&self) -> &ClockState {
        &self.clock_state
    }

    pub fn source(&self) -> Option<&SourceTexture<C::Texture>> {
        self.source.as_ref()
    }

    pub fn program(&self) -> &C::Program {
        &self.program
    }

    pub fn pending_sources(&self) -> usize {
        self.pending.len()
    }

    /// Releases the program, the geometry, the current texture and every
    /// placeholder still waiting on a load. Outstanding [`SourceUpdate`]s
    /// resolve with [`LoadCause::Disposed`].
    pub fn dispose(self, ctx: &mut C) {
        let Self {
            program,
            geometry,
            source,
            pending,
            ..
        } = self;

        ctx.bind_texture(SOURCE_TEXTURE_UNIT, None);
        let current = source.map(|source| source.texture);
        for pending in pending {
            if let Some(texture) = pending.future.texture() {
                if current.as_ref() != Some(texture) {
                    ctx.delete_texture(texture.clone());
                }
            }
        }
        if let Some(texture) = current {
            ctx.delete_texture(texture);
        }
        ctx.delete_program(program);
        ctx.delete_buffer(geometry);
        debug!("render pipeline disposed");
    }

    /// Makes `next` current, writes its resolution and releases the texture it
    /// replaces unless a pending load still owns that handle.
    fn install_source(&mut self, ctx: &mut C, next: SourceTexture<C::Texture>) {
        if let Some(location) = &self.uniforms.resolution {
            ctx.set_uniform(
                &self.program,
                location,
                UniformValue::Vec2([next.width as f32, next.height as f32]),
            );
        }

        let Some(previous) = self.source.replace(next) else {
            return;
        };
        let still_current = self
            .source
            .as_ref()
            .is_some_and(|source| source.texture == previous.texture);
        let owned_by_load = self
            .pending
            .iter()
            .any(|pending| pending.future.texture() == Some(&previous.texture));
        if !still_current && !owned_by_load {
            trace!("releasing replaced source texture");
            ctx.delete_texture(previous.texture);
        }
    }
}

fn resolve_uniforms<C: GraphicsContext>(
    ctx: &C,
    program: &C::Program,
    names: &UniformNames,
) -> Result<UniformSet<C::UniformLocation>, InitError> {
    let resolve = |name: &Option<String>| match name {
        None => Ok(None),
        Some(name) => match ctx.uniform_location(program, name) {
            Some(location) => Ok(Some(location)),
            None => {
                warn!(uniform = %name, "uniform not declared by shader program");
                Err(InitError::MissingUniform { name: name.clone() })
            }
        },
    };

    Ok(UniformSet {
        time: resolve(&names.time)?,
        sampler: resolve(&names.sampler)?,
        resolution: resolve(&names.resolution)?,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn clock_accumulates_forward_time_only() {
        let start = Instant::now();
        let mut clock = ClockState::new(start);
        assert_eq!(clock.advance(start + Duration::from_millis(500)), 0.5);
        assert_eq!(clock.advance(start + Duration::from_millis(200)), 0.5);
        assert_eq!(clock.last_frame(), start + Duration::from_millis(500));
        assert_eq!(clock.advance(start + Duration::from_secs(1)), 1.0);
        assert_eq!(clock.elapsed(), 1.0);
    }

    #[test]
    fn same_timestamp_adds_nothing() {
        let start = Instant::now();
        let mut clock = ClockState::new(start);
        let frame = start + Duration::from_millis(16);
        let first = clock.advance(frame);
        assert_eq!(clock.advance(frame), first);
    }

    #[test]
    fn dropped_update_channel_reports_disposal() {
        let (reply, receiver) = bounded::<SourceOutcome>(1);
        drop(reply);
        let mut update = SourceUpdate {
            url: "a.png".to_string(),
            receiver,
            outcome: None,
        };
        let outcome = update.poll().cloned().unwrap();
        assert_eq!(outcome.unwrap_err().cause, LoadCause::Disposed);
    }
}
