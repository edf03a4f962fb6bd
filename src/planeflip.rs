//! Interactive driver state.

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::animation::AnimMode;
use crate::backend::{BackendError, DisplayBackend, ModeInfo, QueueAllocator, Resources};
use crate::commit::{CommitBatcher, CommitOutcome};
use crate::config::Config;
use crate::drawing::Renderer;
use crate::events;
use crate::output::{FrameOptions, Output};
use crate::pipe::{self, Pipe, PipeBinder};
use crate::registry::ResourceRegistry;
use crate::term::Command;

/// Maximum number of event batches read while waiting for in-flight flips on exit.
const SHUTDOWN_DRAIN_ATTEMPTS: usize = 16;

/// Connector and mode requested on the command line.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct OutputRequest {
    pub connector: String,
    pub mode: String,
}

/// Runtime toggles.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Settings {
    pub test_running: bool,
    pub overlay_enabled: bool,
    pub throttle: bool,
    pub blur: bool,
    pub blank: bool,
    pub render: bool,
    pub clear: bool,
    pub animation: AnimMode,
}

impl Settings {
    pub fn new(config: &Config) -> Self {
        Self {
            overlay_enabled: config.overlay_enabled,
            animation: config.animation,
            throttle: config.throttle,
            render: true,
            test_running: false,
            blur: false,
            blank: false,
            clear: false,
        }
    }

    fn frame_options(&self) -> FrameOptions {
        FrameOptions {
            throttle: self.throttle,
            render: self.render,
            blur: self.blur,
            blank: self.blank,
            clear: self.clear,
        }
    }
}

/// Bind a pipe and pick a mode for every requested output.
///
/// Outputs which can't be bound are skipped.
pub fn bind_pipes(
    resources: &Resources,
    registry: &mut ResourceRegistry,
    requests: &[OutputRequest],
) -> Vec<(Pipe, ModeInfo)> {
    let mut pipes = Vec::new();

    for request in requests {
        let mut pipe = match PipeBinder::new(resources, registry).bind(&request.connector) {
            Ok(pipe) => pipe,
            Err(err) => {
                warn!("Unable to bind {}: {err}", request.connector);
                continue;
            },
        };

        match pipe::pick_mode(resources, &pipe, &request.mode) {
            Ok(mode) => pipes.push((pipe, mode)),
            Err(err) => {
                warn!("Unable to use {}: {err}", request.connector);
                pipe.release(registry);
            },
        }
    }

    pipes
}

/// Create surfaces for all bound pipes.
pub fn create_outputs(
    backend: &dyn DisplayBackend,
    allocator: &mut dyn QueueAllocator,
    pipes: Vec<(Pipe, ModeInfo)>,
    overlay_size: (u32, u32),
) -> Result<Vec<Output>, BackendError> {
    pipes
        .into_iter()
        .map(|(pipe, mode)| Output::new(backend, allocator, pipe, mode, overlay_size))
        .collect()
}

/// Plane flipping session.
pub struct PlaneFlip<B: DisplayBackend> {
    pub backend: B,
    pub outputs: Vec<Output>,
    pub registry: ResourceRegistry,
    pub settings: Settings,
    /// Session should be shut down.
    pub terminated: bool,
    renderer: Box<dyn Renderer>,
    batcher: CommitBatcher,
    rng: StdRng,
    /// Produce the next animation frame without waiting.
    wake: bool,
}

impl<B: DisplayBackend> PlaneFlip<B> {
    pub fn new(
        backend: B,
        registry: ResourceRegistry,
        outputs: Vec<Output>,
        settings: Settings,
        renderer: Box<dyn Renderer>,
    ) -> Self {
        Self {
            backend,
            registry,
            outputs,
            settings,
            renderer,
            rng: StdRng::from_entropy(),
            batcher: Default::default(),
            terminated: Default::default(),
            wake: Default::default(),
        }
    }

    /// Render the first frame on every output and apply the initial modeset.
    pub fn start(&mut self) -> CommitOutcome {
        let enabled = self.settings.overlay_enabled;
        for output in &mut self.outputs {
            output.plane_enable(enabled);
        }

        self.update_outputs(Some(self.settings.frame_options()))
    }

    /// Apply an interactive command.
    pub fn handle_command(&mut self, command: Command) {
        debug!("Handling {command:?}");

        match command {
            Command::ToggleOverlay => {
                let enabled = !self.settings.overlay_enabled;
                self.settings.overlay_enabled = enabled;
                for output in &mut self.outputs {
                    output.plane_enable(enabled);
                }

                // Disabling only needs the plane's framebuffer detached.
                let options = enabled.then(|| self.settings.frame_options());
                self.update_outputs(options);
            },
            Command::Move(dx, dy) => {
                for output in &mut self.outputs {
                    output.move_overlay(dx, dy);
                }
                self.update_outputs(Some(self.settings.frame_options()));
            },
            Command::Resize(dw, dh) => {
                for output in &mut self.outputs {
                    output.resize_overlay(dw, dh);
                }
                self.update_outputs(Some(self.settings.frame_options()));
            },
            Command::ToggleTest => {
                self.settings.test_running = !self.settings.test_running;
                self.wake = true;

                if self.settings.test_running {
                    for output in &mut self.outputs {
                        output.crtc.reset_stats();
                    }
                }
            },
            Command::ToggleThrottle => self.settings.throttle = !self.settings.throttle,
            Command::ToggleBlur => self.settings.blur = !self.settings.blur,
            Command::ToggleBlank => self.settings.blank = !self.settings.blank,
            Command::ToggleRender => self.settings.render = !self.settings.render,
            Command::ToggleClear => self.settings.clear = !self.settings.clear,
            Command::CycleAnimation => {
                self.settings.animation = self.settings.animation.next();
                info!("Animation mode {:?}", self.settings.animation);
            },
            Command::Quit => self.terminated = true,
        }
    }

    /// Dispatch pending completion events.
    pub fn handle_backend_events(&mut self) -> Result<usize, BackendError> {
        let outputs = &mut self.outputs;
        let count = self.backend.dispatch_events(&mut |event| {
            events::dispatch_completion(outputs, event);
        })?;

        if count > 0 && self.settings.test_running {
            self.wake = true;
        }

        Ok(count)
    }

    /// Check if the next animation frame should be produced without waiting.
    pub fn wants_frame(&self) -> bool {
        self.settings.test_running && self.wake
    }

    /// Produce one animation frame on every output that has buffers available.
    ///
    /// Returns `false` if every output is waiting for free buffers.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn tick(&mut self) -> bool {
        if !self.settings.test_running {
            self.wake = false;
            return false;
        }

        let options = self.settings.frame_options();
        let mut produced = false;

        for (index, output) in self.outputs.iter_mut().enumerate() {
            let crtc = &output.crtc.surface;
            let plane = &output.plane.surface;
            if crtc.get_free_buffer(options.throttle).is_err()
                || plane.get_free_buffer(options.throttle).is_err()
            {
                continue;
            }

            output.animate(self.settings.animation, &mut self.rng);
            if let Err(err) = output.produce_frame(&mut *self.renderer, options) {
                debug!("Skipping frame on output {index}: {err}");
                continue;
            }

            if let Err(err) = self.batcher.add_output(index, output, &mut self.backend) {
                debug!("Skipping commit on output {index}: {err}");
            }

            if let Some((frames, secs)) = output.crtc.count_frame() {
                let crtc = output.pipe.crtc;
                info!(
                    "crtc [{}] id = {}: {frames} frames in {secs} secs, {} fps",
                    crtc.map_or(0, |claim| claim.index),
                    output.pipe.crtc_id(),
                    frames as f32 / secs,
                );
            }

            produced = true;
        }

        self.commit();
        self.wake = produced;

        produced
    }

    /// Restore the original display state and release all resources.
    pub fn shutdown(&mut self) {
        info!("Restoring original modes");

        for output in &mut self.outputs {
            output.prepare_restore();
        }

        let options = FrameOptions { throttle: false, ..self.settings.frame_options() };
        self.update_outputs(Some(options));

        // Wait for in-flight flips before tearing down the surfaces.
        for _ in 0..SHUTDOWN_DRAIN_ATTEMPTS {
            let pending = self.outputs.iter().any(|output| {
                let crtc = output.crtc.surface.pending_events();
                crtc > 0 || output.plane.surface.pending_events() > 0
            });
            if !pending {
                break;
            }

            match self.handle_backend_events() {
                Ok(0) => break,
                Ok(_) => (),
                Err(err) => {
                    warn!("Unable to read completion events: {err}");
                    break;
                },
            }
        }

        for output in &mut self.outputs {
            output.destroy(&mut self.backend, &mut self.registry);
        }
    }

    /// Produce new frames if requested and commit all dirty outputs.
    fn update_outputs(&mut self, frame: Option<FrameOptions>) -> CommitOutcome {
        for (index, output) in self.outputs.iter_mut().enumerate() {
            if let Some(options) = frame {
                if let Err(err) = output.produce_frame(&mut *self.renderer, options) {
                    debug!("Skipping frame on output {index}: {err}");
                    continue;
                }
            }

            if let Err(err) = self.batcher.add_output(index, output, &mut self.backend) {
                debug!("Skipping commit on output {index}: {err}");
            }
        }

        self.commit()
    }

    fn commit(&mut self) -> CommitOutcome {
        self.batcher.submit(&mut self.outputs, &mut self.backend)
    }
}
