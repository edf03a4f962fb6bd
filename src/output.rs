//! Per-pipe display state.

use std::time::Instant;

use rand::Rng;
use tracing::{debug, info};

use crate::animation::{AnimMode, AnimState, MIN_SIZE};
use crate::backend::{
    BackendError, DisplayBackend, ModeInfo, ObjectId, PropertyId, QueueAllocator,
    FORMAT_XRGB8888,
};
use crate::drawing::{RenderStyle, Renderer};
use crate::geometry::Region;
use crate::pipe::Pipe;
use crate::registry::ResourceRegistry;
use crate::surface::{BufferId, Surface, SurfaceError};

/// Number of frames between frame rate reports.
const FPS_INTERVAL: u32 = 1000;

/// Hardware cursor size written with the cursor state.
pub const CURSOR_SIZE: u64 = 64;

/// CRTC property IDs, `0` if the kernel doesn't expose the property.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct CrtcProps {
    pub fb_id: PropertyId,
    pub src_x: PropertyId,
    pub src_y: PropertyId,
    pub mode: PropertyId,
    pub connector_ids: PropertyId,
    pub cursor_id: PropertyId,
    pub cursor_x: PropertyId,
    pub cursor_y: PropertyId,
    pub cursor_w: PropertyId,
    pub cursor_h: PropertyId,
}

impl CrtcProps {
    pub fn discover(backend: &dyn DisplayBackend, crtc: ObjectId) -> Result<Self, BackendError> {
        let mut props = Self::default();

        for (name, id) in backend.properties(crtc)? {
            let field = match name.as_str() {
                "FB_ID" => &mut props.fb_id,
                "SRC_X" => &mut props.src_x,
                "SRC_Y" => &mut props.src_y,
                "MODE" => &mut props.mode,
                "CONNECTOR_IDS" => &mut props.connector_ids,
                "CURSOR_ID" => &mut props.cursor_id,
                "CURSOR_X" => &mut props.cursor_x,
                "CURSOR_Y" => &mut props.cursor_y,
                "CURSOR_W" => &mut props.cursor_w,
                "CURSOR_H" => &mut props.cursor_h,
                _ => continue,
            };
            debug!("crtc {crtc} property {name} = {id}");
            *field = id;
        }

        Ok(props)
    }
}

/// Plane property IDs, `0` if the kernel doesn't expose the property.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct PlaneProps {
    pub fb_id: PropertyId,
    pub crtc_id: PropertyId,
    pub src_x: PropertyId,
    pub src_y: PropertyId,
    pub src_w: PropertyId,
    pub src_h: PropertyId,
    pub crtc_x: PropertyId,
    pub crtc_y: PropertyId,
    pub crtc_w: PropertyId,
    pub crtc_h: PropertyId,
}

impl PlaneProps {
    pub fn discover(backend: &dyn DisplayBackend, plane: ObjectId) -> Result<Self, BackendError> {
        let mut props = Self::default();

        for (name, id) in backend.properties(plane)? {
            let field = match name.as_str() {
                "FB_ID" => &mut props.fb_id,
                "CRTC_ID" => &mut props.crtc_id,
                "SRC_X" => &mut props.src_x,
                "SRC_Y" => &mut props.src_y,
                "SRC_W" => &mut props.src_w,
                "SRC_H" => &mut props.src_h,
                "CRTC_X" => &mut props.crtc_x,
                "CRTC_Y" => &mut props.crtc_y,
                "CRTC_W" => &mut props.crtc_w,
                "CRTC_H" => &mut props.crtc_h,
                _ => continue,
            };
            debug!("plane {plane} property {name} = {id}");
            *field = id;
        }

        Ok(props)
    }
}

/// Primary scanout state of a CRTC.
pub struct CrtcState {
    pub surface: Surface,
    pub props: CrtcProps,
    pub mode: ModeInfo,
    /// Mode active before this process took over the CRTC.
    pub original_mode: ModeInfo,
    pub dirty: bool,
    pub dirty_mode: bool,
    pub dirty_cursor: bool,
    frames: u32,
    prev: Instant,
}

impl CrtcState {
    /// Restart frame rate measurements.
    pub fn reset_stats(&mut self) {
        self.prev = Instant::now();
        self.frames = 0;
    }

    /// Account for a produced frame.
    ///
    /// Once per interval, this returns the number of frames and the seconds
    /// they took.
    pub fn count_frame(&mut self) -> Option<(u32, f32)> {
        self.frames += 1;
        if self.frames < FPS_INTERVAL {
            return None;
        }

        let now = Instant::now();
        let stats = (self.frames, now.duration_since(self.prev).as_secs_f32());

        self.prev = now;
        self.frames = 0;

        Some(stats)
    }
}

/// Overlay plane state.
pub struct PlaneState {
    pub surface: Surface,
    pub props: PlaneProps,
    pub dirty: bool,
    pub enabled: bool,
    /// Buffer of the last applied framebuffer write.
    pub scanout: Option<BufferId>,
    /// Source rectangle in 16.16 fixed point.
    pub src: Region,
    /// Destination rectangle on the CRTC.
    pub dst: Region,
    anim: AnimState,
}

/// Options for producing one frame.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct FrameOptions {
    pub throttle: bool,
    pub render: bool,
    pub blur: bool,
    pub blank: bool,
    /// Clear the overlay area on the primary surface.
    pub clear: bool,
}

/// Bound pipe with its CRTC and plane surfaces.
pub struct Output {
    pub pipe: Pipe,
    pub crtc: CrtcState,
    pub plane: PlaneState,
}

impl Output {
    /// Create surfaces and initial state for a freshly bound pipe.
    ///
    /// The output starts out fully dirty, so the first commit sets the mode,
    /// the cursor and both framebuffers.
    pub fn new(
        backend: &dyn DisplayBackend,
        allocator: &mut dyn QueueAllocator,
        pipe: Pipe,
        mode: ModeInfo,
        overlay_size: (u32, u32),
    ) -> Result<Self, BackendError> {
        let crtc_props = CrtcProps::discover(backend, pipe.crtc_id())?;
        let plane_props = PlaneProps::discover(backend, pipe.plane_id())?;

        let resources = backend.resources();
        let original_mode = pipe
            .crtc
            .and_then(|claim| resources.crtcs[claim.index].mode.clone())
            .unwrap_or_else(|| mode.clone());
        info!("crtc {} original mode {original_mode}, mode {mode}", pipe.crtc_id());

        let (width, height) = mode.size();
        let crtc_queue = allocator.allocate(width, height, FORMAT_XRGB8888)?;
        let overlay_queue = allocator.allocate(overlay_size.0, overlay_size.1, FORMAT_XRGB8888)?;

        let overlay = Surface::new("plane", overlay_queue);
        let (overlay_width, overlay_height) = overlay.size();
        let src = Region::new(0, 0, overlay_width as i32, overlay_height as i32).to_fixed();
        let dst = Region::new(0, 0, width as i32 / 2, height as i32 / 2);

        Ok(Self {
            pipe,
            crtc: CrtcState {
                surface: Surface::new("crtc", crtc_queue),
                props: crtc_props,
                original_mode,
                mode,
                dirty: true,
                dirty_mode: true,
                dirty_cursor: true,
                frames: 0,
                prev: Instant::now(),
            },
            plane: PlaneState {
                surface: overlay,
                props: plane_props,
                dirty: true,
                enabled: true,
                scanout: None,
                src,
                dst,
                anim: AnimState::default(),
            },
        })
    }

    /// Change the overlay visibility.
    pub fn plane_enable(&mut self, enable: bool) {
        if self.plane.enabled != enable {
            self.plane.enabled = enable;
            self.plane.dirty = true;
        }
    }

    /// Check if any state needs to be committed.
    pub fn is_dirty(&self) -> bool {
        self.crtc.dirty || self.crtc.dirty_mode || self.plane.dirty
    }

    /// Render and present one frame on both surfaces.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn produce_frame(
        &mut self,
        renderer: &mut dyn Renderer,
        options: FrameOptions,
    ) -> Result<(), SurfaceError> {
        self.crtc.surface.get_free_buffer(options.throttle)?;
        self.plane.surface.get_free_buffer(options.throttle)?;

        let mut style =
            RenderStyle { col: false, anim: true, blur: options.blur, blank: options.blank };
        let draw = options.render || options.blank;

        if draw {
            renderer.render(&mut self.crtc.surface, style);
        }
        if options.clear {
            renderer.clear_rect(&mut self.crtc.surface, self.plane.dst);
        }
        renderer.present(&mut self.crtc.surface).map_err(SurfaceError::Present)?;

        style.col = true;
        if draw {
            renderer.render(&mut self.plane.surface, style);
        }
        renderer.present(&mut self.plane.surface).map_err(SurfaceError::Present)?;

        Ok(())
    }

    /// Advance the overlay animation by one frame.
    pub fn animate(&mut self, mode: AnimMode, rng: &mut impl Rng) {
        let display = self.crtc.mode.size();
        self.plane.dst = self.plane.anim.step(mode, display, self.plane.dst, rng);
        self.plane.dirty = true;
        self.crtc.dirty = true;
    }

    /// Move the overlay destination.
    pub fn move_overlay(&mut self, dx: i32, dy: i32) {
        self.plane.dst.translate(dx, dy);
        self.plane.dirty = true;
        self.crtc.dirty = true;
    }

    /// Resize the overlay destination around its top left corner.
    pub fn resize_overlay(&mut self, dw: i32, dh: i32) {
        self.plane.dst.resize(dw, dh, MIN_SIZE);
        self.plane.dirty = true;
        self.crtc.dirty = true;
    }

    /// Disable the overlay and switch back to the original mode.
    pub fn prepare_restore(&mut self) {
        self.crtc.mode = self.crtc.original_mode.clone();
        self.crtc.dirty = true;
        self.crtc.dirty_mode = true;
        self.plane_enable(false);
    }

    /// Free both surfaces and return the pipe's resources.
    pub fn destroy(&mut self, backend: &mut dyn DisplayBackend, registry: &mut ResourceRegistry) {
        self.crtc.surface.free(backend);
        self.plane.surface.free(backend);
        self.pipe.release(registry);
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::mock::StepRng;

    use super::*;
    use crate::pipe::PipeBinder;
    use crate::testing::{self, FakeAllocator, FakeBackend, NullRenderer};

    fn output(backend: &FakeBackend, registry: &mut ResourceRegistry) -> (Output, FakeAllocator) {
        let pipe = PipeBinder::new(&backend.resources, registry).bind("HDMI-A-1").unwrap();
        let mut allocator = FakeAllocator::new();
        let output =
            Output::new(backend, &mut allocator, pipe, testing::mode(1920, 1080), (960, 576))
                .unwrap();
        (output, allocator)
    }

    #[test]
    fn initial_state() {
        let backend = FakeBackend::dual_output();
        let mut registry = ResourceRegistry::new();
        let (output, allocator) = output(&backend, &mut registry);

        assert!(output.crtc.dirty && output.crtc.dirty_mode && output.crtc.dirty_cursor);
        assert!(output.plane.dirty && output.plane.enabled);
        assert_eq!(output.plane.src, Region::new(0, 0, 960 << 16, 576 << 16));
        assert_eq!(output.plane.dst, Region::new(0, 0, 960, 540));
        assert_eq!(output.crtc.surface.size(), (1920, 1080));
        assert_eq!(output.plane.surface.size(), (960, 576));
        assert_eq!(allocator.queues.len(), 2);

        assert_eq!(output.crtc.props.fb_id, backend.property(50, "FB_ID"));
        assert_eq!(output.crtc.props.cursor_h, backend.property(50, "CURSOR_H"));
        assert_eq!(output.plane.props.crtc_h, backend.property(61, "CRTC_H"));
    }

    #[test]
    fn missing_properties_stay_unresolved() {
        let mut backend = FakeBackend::dual_output();
        backend.properties.get_mut(&50).unwrap().retain(|(name, _)| !name.starts_with("CURSOR"));
        let mut registry = ResourceRegistry::new();
        let (output, _) = output(&backend, &mut registry);

        assert_eq!(output.crtc.props.cursor_id, 0);
        assert_ne!(output.crtc.props.fb_id, 0);
    }

    #[test]
    fn original_mode_falls_back_to_requested() {
        let mut backend = FakeBackend::dual_output();
        backend.resources.crtcs[0].mode = None;
        let mut registry = ResourceRegistry::new();
        let pipe = PipeBinder::new(&backend.resources, &mut registry).bind("HDMI-A-1").unwrap();

        let mut allocator = FakeAllocator::new();
        let mode = testing::mode(1280, 720);
        let output = Output::new(&backend, &mut allocator, pipe, mode.clone(), (960, 576)).unwrap();

        assert_eq!(output.crtc.original_mode, mode);
    }

    #[test]
    fn produce_frame_presents_both_surfaces() {
        let backend = FakeBackend::dual_output();
        let mut registry = ResourceRegistry::new();
        let (mut output, allocator) = output(&backend, &mut registry);
        let mut renderer = NullRenderer::default();

        let options = FrameOptions { render: true, clear: true, ..Default::default() };
        output.produce_frame(&mut renderer, options).unwrap();

        assert_eq!(renderer.renders, 2);
        assert_eq!(renderer.clears, vec![output.plane.dst]);
        assert!(allocator.queues.iter().all(|queue| queue.borrow().swaps == 1));
    }

    #[test]
    fn produce_frame_respects_throttle() {
        let backend = FakeBackend::dual_output();
        let mut registry = ResourceRegistry::new();
        let (mut output, allocator) = output(&backend, &mut registry);
        let mut renderer = NullRenderer::default();
        output.plane.surface.add_pending_event();

        let options = FrameOptions { throttle: true, render: true, ..Default::default() };
        let result = output.produce_frame(&mut renderer, options);

        assert!(matches!(result, Err(SurfaceError::WouldBlock)));
        assert_eq!(renderer.renders, 0);
        assert!(allocator.queues.iter().all(|queue| queue.borrow().swaps == 0));
    }

    #[test]
    fn overlay_adjustments_mark_dirty() {
        let backend = FakeBackend::dual_output();
        let mut registry = ResourceRegistry::new();
        let (mut output, _) = output(&backend, &mut registry);
        output.crtc.dirty = false;
        output.plane.dirty = false;

        output.move_overlay(-1, 1);
        output.resize_overlay(1, -1000);

        assert_eq!(output.plane.dst, Region::new(-1, 1, 961, MIN_SIZE));
        assert!(output.crtc.dirty && output.plane.dirty);

        output.plane.dirty = false;
        output.plane_enable(true);
        assert!(!output.plane.dirty);
        output.plane_enable(false);
        assert!(output.plane.dirty && !output.plane.enabled);
    }

    #[test]
    fn static_animation_keeps_rect() {
        let backend = FakeBackend::dual_output();
        let mut registry = ResourceRegistry::new();
        let (mut output, _) = output(&backend, &mut registry);
        let dst = output.plane.dst;

        output.animate(AnimMode::Static, &mut StepRng::new(0, 1));

        assert_eq!(output.plane.dst, dst);
        assert!(output.plane.dirty && output.crtc.dirty);
    }

    #[test]
    fn frame_stats_every_interval() {
        let backend = FakeBackend::dual_output();
        let mut registry = ResourceRegistry::new();
        let (mut output, _) = output(&backend, &mut registry);
        output.crtc.reset_stats();

        for _ in 1..FPS_INTERVAL {
            assert_eq!(output.crtc.count_frame(), None);
        }

        let (frames, _) = output.crtc.count_frame().unwrap();
        assert_eq!(frames, FPS_INTERVAL);
        assert_eq!(output.crtc.frames, 0);
    }

    #[test]
    fn destroy_releases_pipe() {
        let mut backend = FakeBackend::dual_output();
        let mut registry = ResourceRegistry::new();
        let (mut output, _) = output(&backend, &mut registry);

        output.destroy(&mut backend, &mut registry);

        assert_eq!(output.pipe, Pipe::default());
        for kind in [
            crate::registry::ResourceKind::Connector,
            crate::registry::ResourceKind::Encoder,
            crate::registry::ResourceKind::Crtc,
            crate::registry::ResourceKind::Plane,
        ] {
            assert_eq!(registry.mask(kind), 0);
        }
    }
}
