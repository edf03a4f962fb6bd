//! Renderable surfaces and their scanout buffers.

use tracing::{debug, error, trace, warn};

use crate::backend::{
    BackendError, BufferLayout, BufferQueue, DisplayBackend, FramebufferId, PlatformBufferId,
};
use crate::drawing::RenderState;

/// Maximum number of buffers tracked per surface.
pub const MAX_BUFFERS: usize = 8;

/// Buffer pool failure.
#[derive(thiserror::Error, Debug)]
pub enum SurfaceError {
    #[error("surface has no free buffer")]
    WouldBlock,
    #[error("surface has no front buffer")]
    NoFrontBuffer,
    #[error("all {MAX_BUFFERS} buffer slots are in use")]
    PoolExhausted,
    #[error("framebuffer registration failed: {0}")]
    Register(#[source] BackendError),
    #[error("buffer presentation failed: {0}")]
    Present(#[source] BackendError),
    #[error("buffer {0:?} is not referenced")]
    NotReferenced(BufferId),
}

/// Slot of a buffer inside its surface.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BufferId(usize);

/// Platform buffer registered for scanout.
#[derive(Default, Debug)]
pub struct Buffer {
    platform: Option<PlatformBufferId>,
    layout: BufferLayout,
    fb_id: FramebufferId,
    refs: u32,
}

impl Buffer {
    pub fn fb_id(&self) -> FramebufferId {
        self.fb_id
    }

    pub fn refs(&self) -> u32 {
        self.refs
    }

    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }
}

/// Render destination backed by a platform buffer queue.
pub struct Surface {
    pub render_state: RenderState,
    buffers: [Buffer; MAX_BUFFERS],
    queue: Box<dyn BufferQueue>,
    pending_events: u32,
    name: &'static str,
    width: u32,
    height: u32,
}

impl Surface {
    pub fn new(name: &'static str, queue: Box<dyn BufferQueue>) -> Self {
        let (width, height) = queue.size();
        Self {
            height,
            width,
            queue,
            name,
            render_state: Default::default(),
            pending_events: Default::default(),
            buffers: Default::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn queue_mut(&mut self) -> &mut dyn BufferQueue {
        &mut *self.queue
    }

    pub fn buffer(&self, id: BufferId) -> &Buffer {
        &self.buffers[id.0]
    }

    /// Number of completion events this surface is still waiting for.
    pub fn pending_events(&self) -> u32 {
        self.pending_events
    }

    /// Account for a completion event requested from the backend.
    pub fn add_pending_event(&mut self) {
        self.pending_events += 1;
        trace!("{} pending events increased to {}", self.name, self.pending_events);
    }

    /// Account for a retired or rolled back completion event.
    pub fn retire_pending_event(&mut self) {
        if self.pending_events == 0 {
            crate::invariant_violated(format_args!("{} pending events underflow", self.name));
            return;
        }

        self.pending_events -= 1;
        trace!("{} pending events decreased to {}", self.name, self.pending_events);
    }

    /// Check if a new frame can be presented without waiting.
    ///
    /// With `throttle` set, only a single completion event may be in flight.
    pub fn get_free_buffer(&self, throttle: bool) -> Result<(), SurfaceError> {
        if throttle && self.pending_events > 0 {
            return Err(SurfaceError::WouldBlock);
        }

        if self.queue.has_free_buffers() {
            Ok(())
        } else {
            Err(SurfaceError::WouldBlock)
        }
    }

    /// Take a reference to the most recently presented buffer.
    ///
    /// Buffers are registered with the backend the first time they're seen.
    pub fn acquire_front(
        &mut self,
        backend: &mut dyn DisplayBackend,
    ) -> Result<BufferId, SurfaceError> {
        let platform = self.queue.lock_front().ok_or(SurfaceError::NoFrontBuffer)?;

        // Reuse the existing registration for known buffers.
        if let Some(index) = self.slot(platform.id) {
            self.buffers[index].refs += 1;
            return Ok(BufferId(index));
        }

        let index = match self.buffers.iter().position(|buffer| buffer.platform.is_none()) {
            Some(index) => index,
            None => {
                self.queue.release(platform.id);
                return Err(SurfaceError::PoolExhausted);
            },
        };

        let fb_id = match backend.add_framebuffer(&platform.layout) {
            Ok(fb_id) => fb_id,
            Err(err) => {
                self.queue.release(platform.id);
                return Err(SurfaceError::Register(err));
            },
        };
        debug!("{} registered {:?} as framebuffer {fb_id}", self.name, platform.id);

        self.buffers[index] =
            Buffer { platform: Some(platform.id), layout: platform.layout, refs: 1, fb_id };

        Ok(BufferId(index))
    }

    /// Drop a buffer reference, handing the platform buffer back to the queue.
    ///
    /// The framebuffer registration stays alive until the platform buffer is
    /// destroyed.
    pub fn release(&mut self, id: BufferId) -> Result<(), SurfaceError> {
        let buffer = &mut self.buffers[id.0];
        if buffer.refs == 0 {
            warn!("{} ignoring release of unreferenced {id:?}", self.name);
            return Err(SurfaceError::NotReferenced(id));
        }

        buffer.refs -= 1;
        if let Some(platform) = buffer.platform {
            self.queue.release(platform);
        }

        Ok(())
    }

    /// Find a referenced buffer by its framebuffer ID.
    pub fn find_by_fb_id(&self, fb_id: FramebufferId) -> Option<BufferId> {
        self.buffers
            .iter()
            .position(|buffer| fb_id != 0 && buffer.fb_id == fb_id && buffer.refs > 0)
            .map(BufferId)
    }

    /// Handle the platform reclaiming one of its buffers.
    ///
    /// The buffer must not be referenced by the display anymore.
    pub fn destroy_platform_buffer(
        &mut self,
        platform: PlatformBufferId,
        backend: &mut dyn DisplayBackend,
    ) {
        let index = match self.slot(platform) {
            Some(index) => index,
            None => return,
        };

        let buffer = &mut self.buffers[index];
        if buffer.refs > 0 {
            crate::invariant_violated(format_args!(
                "{} destroying framebuffer {} with {} references",
                self.name, buffer.fb_id, buffer.refs
            ));
            return;
        }

        if let Err(err) = backend.remove_framebuffer(buffer.fb_id) {
            error!("{} unable to remove framebuffer {}: {err}", self.name, buffer.fb_id);
        }

        *buffer = Buffer::default();
    }

    /// Reclaim every platform buffer of this surface.
    ///
    /// Framebuffers the display still scans out are left registered, the
    /// kernel drops them once the device is closed.
    pub fn free(&mut self, backend: &mut dyn DisplayBackend) {
        for buffer in self.buffers.iter_mut().filter(|buffer| buffer.refs > 0) {
            debug!("{} leaving scanout framebuffer {} to the kernel", self.name, buffer.fb_id);
            *buffer = Buffer::default();
        }

        for platform in self.queue.destroy() {
            self.destroy_platform_buffer(platform, backend);
        }
    }

    fn slot(&self, platform: PlatformBufferId) -> Option<usize> {
        self.buffers.iter().position(|buffer| buffer.platform == Some(platform))
    }
}
