//! Scripted collaborators for unit tests.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::rc::Rc;

use crate::backend::{
    AtomicRequest, BackendError, BufferLayout, BufferQueue, Canvas, CommitFlags, CompletionEvent,
    ConnectorInfo, CrtcInfo, DisplayBackend, EncoderInfo, FramebufferId, ModeInfo, ObjectId,
    PlaneInfo, PlaneKind, PlatformBuffer, PlatformBufferId, PropertyId, QueueAllocator, Resources,
    FORMAT_XRGB8888,
};
use crate::drawing::{RenderStyle, Renderer};
use crate::geometry::Region;
use crate::surface::Surface;

pub const HDMI_CONNECTOR: ObjectId = 30;
pub const DP_CONNECTOR: ObjectId = 31;

const CRTC_PROPERTIES: [&str; 10] = [
    "FB_ID",
    "SRC_X",
    "SRC_Y",
    "MODE",
    "CONNECTOR_IDS",
    "CURSOR_ID",
    "CURSOR_X",
    "CURSOR_Y",
    "CURSOR_W",
    "CURSOR_H",
];

const PLANE_PROPERTIES: [&str; 10] = [
    "FB_ID", "CRTC_ID", "SRC_X", "SRC_Y", "SRC_W", "SRC_H", "CRTC_X", "CRTC_Y", "CRTC_W", "CRTC_H",
];

/// Build a mode with plausible timings.
pub fn mode(width: u16, height: u16) -> ModeInfo {
    ModeInfo {
        name: format!("{width}x{height}"),
        clock: 148500,
        hdisplay: width,
        hsync_start: width + 88,
        hsync_end: width + 132,
        htotal: width + 280,
        vdisplay: height,
        vsync_start: height + 4,
        vsync_end: height + 9,
        vtotal: height + 45,
        vrefresh: 60,
        flags: 0x5,
    }
}

pub fn plane(
    id: ObjectId,
    crtc: Option<ObjectId>,
    possible_crtcs: u32,
    kind: PlaneKind,
) -> PlaneInfo {
    PlaneInfo { id, crtc, possible_crtcs, kind }
}

/// Display backend recording every interaction.
#[derive(Default)]
pub struct FakeBackend {
    pub resources: Resources,
    pub properties: HashMap<ObjectId, Vec<(String, PropertyId)>>,
    pub commits: Vec<(AtomicRequest, CommitFlags)>,
    pub events: VecDeque<CompletionEvent>,
    pub framebuffers: Vec<FramebufferId>,
    pub removed_framebuffers: Vec<FramebufferId>,
    /// Number of upcoming commits to reject.
    pub reject_commits: usize,
    /// Number of upcoming framebuffer registrations to reject.
    pub reject_framebuffers: usize,
    next_fb: FramebufferId,
}

impl FakeBackend {
    /// Two connectors, both wired to their own encoder and CRTC.
    ///
    /// Plane 60 is the primary plane of CRTC 50, plane 63 the one of CRTC 51.
    /// Overlay 61 is detached, overlay 62 is attached to CRTC 51.
    pub fn dual_output() -> Self {
        let resources = Resources {
            connectors: vec![
                ConnectorInfo {
                    id: HDMI_CONNECTOR,
                    name: "HDMI-A-1".into(),
                    encoder: Some(40),
                    encoders: vec![40],
                    modes: vec![mode(1920, 1080), mode(1280, 720)],
                },
                ConnectorInfo {
                    id: DP_CONNECTOR,
                    name: "DP-1".into(),
                    encoder: Some(41),
                    encoders: vec![41],
                    modes: vec![mode(1280, 720)],
                },
            ],
            encoders: vec![
                EncoderInfo { id: 40, crtc: Some(50), possible_crtcs: 0b11 },
                EncoderInfo { id: 41, crtc: Some(51), possible_crtcs: 0b11 },
            ],
            crtcs: vec![
                CrtcInfo { id: 50, mode: Some(mode(1920, 1080)) },
                CrtcInfo { id: 51, mode: Some(mode(1280, 720)) },
            ],
            planes: vec![
                plane(60, Some(50), 0b01, PlaneKind::Primary),
                plane(61, None, 0b11, PlaneKind::Overlay),
                plane(62, Some(51), 0b11, PlaneKind::Overlay),
                plane(63, Some(51), 0b10, PlaneKind::Primary),
            ],
        };

        Self::new(resources)
    }

    /// Create a backend exposing properties for every CRTC and plane.
    ///
    /// Property IDs are `object * 100 + offset` with the offset being the
    /// position in the property name list plus one.
    pub fn new(resources: Resources) -> Self {
        let mut properties = HashMap::new();
        let numbered = |object: ObjectId, names: &[&str]| -> Vec<(String, PropertyId)> {
            let ids = (1..).map(move |offset| object * 100 + offset);
            names.iter().map(|name| name.to_string()).zip(ids).collect()
        };

        for crtc in &resources.crtcs {
            properties.insert(crtc.id, numbered(crtc.id, &CRTC_PROPERTIES));
        }
        for plane in &resources.planes {
            properties.insert(plane.id, numbered(plane.id, &PLANE_PROPERTIES));
        }

        Self { resources, properties, next_fb: 100, ..Default::default() }
    }

    /// Property ID in the numbering scheme used by [`Self::new`].
    pub fn property(&self, object: ObjectId, name: &str) -> PropertyId {
        self.properties[&object]
            .iter()
            .find(|(property, _)| property == name)
            .map(|(_, id)| *id)
            .unwrap()
    }

    /// Queue a completion event for the next dispatch.
    pub fn complete(&mut self, object: ObjectId, prior_fb: FramebufferId) {
        self.events.push_back(CompletionEvent { object, prior_fb });
    }
}

impl DisplayBackend for FakeBackend {
    fn resources(&self) -> &Resources {
        &self.resources
    }

    fn properties(&self, object: ObjectId) -> Result<Vec<(String, PropertyId)>, BackendError> {
        self.properties.get(&object).cloned().ok_or(BackendError::UnknownObject(object))
    }

    fn add_framebuffer(&mut self, _layout: &BufferLayout) -> Result<FramebufferId, BackendError> {
        if self.reject_framebuffers > 0 {
            self.reject_framebuffers -= 1;
            let source = io::Error::from_raw_os_error(libc::EINVAL);
            return Err(BackendError::Io { context: "add framebuffer", source });
        }

        self.next_fb += 1;
        self.framebuffers.push(self.next_fb);
        Ok(self.next_fb)
    }

    fn remove_framebuffer(&mut self, fb: FramebufferId) -> Result<(), BackendError> {
        self.framebuffers.retain(|&live| live != fb);
        self.removed_framebuffers.push(fb);
        Ok(())
    }

    fn atomic_commit(
        &mut self,
        request: &AtomicRequest,
        flags: CommitFlags,
    ) -> Result<(), BackendError> {
        self.commits.push((request.clone(), flags));

        if self.reject_commits > 0 {
            self.reject_commits -= 1;
            let source = io::Error::from_raw_os_error(libc::EINVAL);
            return Err(BackendError::Io { context: "atomic commit", source });
        }

        Ok(())
    }

    fn dispatch_events(
        &mut self,
        handler: &mut dyn FnMut(CompletionEvent),
    ) -> Result<usize, BackendError> {
        let count = self.events.len();
        for event in self.events.drain(..) {
            handler(event);
        }
        Ok(count)
    }
}

/// Test-controlled state of a [`FakeQueue`].
#[derive(Default, Debug)]
pub struct QueueState {
    pub width: u32,
    pub height: u32,
    pub capacity: u64,
    /// Override for the free buffer check.
    pub free_override: Option<bool>,
    /// Make front buffer locking fail.
    pub lock_fails: bool,
    pub front: Option<PlatformBufferId>,
    pub locked: Vec<PlatformBufferId>,
    pub released: Vec<PlatformBufferId>,
    pub swaps: usize,
}

/// Platform queue without any backing memory.
pub struct FakeQueue {
    state: Rc<RefCell<QueueState>>,
    canvas: Vec<u8>,
}

impl FakeQueue {
    pub fn new(width: u32, height: u32, capacity: u64) -> (Self, Rc<RefCell<QueueState>>) {
        let state = QueueState { width, height, capacity, ..Default::default() };
        let state = Rc::new(RefCell::new(state));
        (Self { state: state.clone(), canvas: Vec::new() }, state)
    }
}

impl BufferQueue for FakeQueue {
    fn size(&self) -> (u32, u32) {
        let state = self.state.borrow();
        (state.width, state.height)
    }

    fn has_free_buffers(&self) -> bool {
        let state = self.state.borrow();
        state.free_override.unwrap_or(state.locked.len() < state.capacity as usize)
    }

    fn back_buffer(&mut self) -> Canvas<'_> {
        Canvas { pixels: &mut self.canvas, width: 0, height: 0 }
    }

    fn swap(&mut self) -> Result<(), BackendError> {
        let mut state = self.state.borrow_mut();
        let free = (0..state.capacity)
            .map(PlatformBufferId)
            .find(|id| !state.locked.contains(id) && state.front != Some(*id))
            .ok_or(BackendError::QueueExhausted)?;
        state.front = Some(free);
        state.swaps += 1;
        Ok(())
    }

    fn lock_front(&mut self) -> Option<PlatformBuffer> {
        let mut state = self.state.borrow_mut();
        if state.lock_fails {
            return None;
        }

        let id = state.front.take()?;
        state.locked.push(id);

        let stride = state.width * 4;
        let layout = BufferLayout {
            width: state.width,
            height: state.height,
            format: FORMAT_XRGB8888,
            handles: [id.0 as u32 + 1, 0, 0, 0],
            strides: [stride, 0, 0, 0],
            offsets: [0; 4],
        };
        Some(PlatformBuffer { id, layout })
    }

    fn release(&mut self, id: PlatformBufferId) {
        let mut state = self.state.borrow_mut();
        state.locked.retain(|locked| *locked != id);
        state.released.push(id);
    }

    fn destroy(&mut self) -> Vec<PlatformBufferId> {
        let mut state = self.state.borrow_mut();
        state.front = None;
        state.locked.clear();
        (0..state.capacity).map(PlatformBufferId).collect()
    }
}

/// Allocator handing out [`FakeQueue`]s.
#[derive(Default)]
pub struct FakeAllocator {
    /// State of every allocated queue, in allocation order.
    pub queues: Vec<Rc<RefCell<QueueState>>>,
    pub capacity: u64,
}

impl FakeAllocator {
    pub fn new() -> Self {
        Self { capacity: 3, ..Default::default() }
    }
}

impl QueueAllocator for FakeAllocator {
    fn allocate(
        &mut self,
        width: u32,
        height: u32,
        _format: u32,
    ) -> Result<Box<dyn BufferQueue>, BackendError> {
        let (queue, state) = FakeQueue::new(width, height, self.capacity);
        self.queues.push(state);
        Ok(Box::new(queue))
    }
}

/// Renderer which only swaps buffers.
#[derive(Default)]
pub struct NullRenderer {
    pub renders: usize,
    pub clears: Vec<Region>,
}

impl Renderer for NullRenderer {
    fn render(&mut self, _surface: &mut Surface, _style: RenderStyle) {
        self.renders += 1;
    }

    fn clear_rect(&mut self, _surface: &mut Surface, rect: Region) {
        self.clears.push(rect);
    }

    fn present(&mut self, surface: &mut Surface) -> Result<(), BackendError> {
        surface.queue_mut().swap()
    }
}

/// Surface over a fresh fake queue.
pub fn surface(width: u32, height: u32) -> (Surface, Rc<RefCell<QueueState>>) {
    let (queue, state) = FakeQueue::new(width, height, 3);
    (Surface::new("test", Box::new(queue)), state)
}
