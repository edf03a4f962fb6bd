//! Display backend and platform buffer contracts.
//!
//! The display pipeline core only talks to the kernel and the buffer allocator
//! through the traits in this module, which allows running the whole resource
//! and commit machinery against scripted backends.

use std::fmt::{self, Display, Formatter};
use std::io;

use indexmap::IndexMap;

/// Kernel mode object ID.
pub type ObjectId = u32;

/// Kernel property ID.
pub type PropertyId = u32;

/// Framebuffer ID, `0` means no framebuffer.
pub type FramebufferId = u32;

/// Little endian 'XR24' fourcc.
pub const FORMAT_XRGB8888: u32 = u32::from_le_bytes(*b"XR24");

/// Display transport failure.
#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("unknown mode object {0}")]
    UnknownObject(ObjectId),
    #[error("unsupported pixel format {0:#010x}")]
    UnsupportedFormat(u32),
    #[error("no primary plane available for CRTC {0}")]
    NoPrimaryPlane(ObjectId),
    #[error("platform buffer queue is exhausted")]
    QueueExhausted,
}

impl BackendError {
    /// Wrap an IO error with a short description of the failed operation.
    pub fn io(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Io { context, source }
    }
}

/// Hardware plane type.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PlaneKind {
    Overlay,
    Primary,
    Cursor,
}

impl PlaneKind {
    /// Convert the kernel's `type` plane property value.
    pub fn from_raw(value: u64) -> Self {
        match value {
            1 => Self::Primary,
            2 => Self::Cursor,
            _ => Self::Overlay,
        }
    }
}

/// Display timings.
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct ModeInfo {
    pub name: String,
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vrefresh: u32,
    pub flags: u32,
}

impl ModeInfo {
    /// Active display area.
    pub fn size(&self) -> (u32, u32) {
        (self.hdisplay as u32, self.vdisplay as u32)
    }
}

impl Display for ModeInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} {} {} {} {} {} {:#x}",
            self.name,
            self.clock,
            self.hdisplay,
            self.hsync_start,
            self.hsync_end,
            self.htotal,
            self.vdisplay,
            self.vsync_start,
            self.vsync_end,
            self.vtotal,
            self.vrefresh,
            self.flags,
        )
    }
}

/// Connector as seen by the kernel.
#[derive(Clone, Debug)]
pub struct ConnectorInfo {
    pub id: ObjectId,
    /// Output name, like `HDMI-A-1`.
    pub name: String,
    /// Encoder currently driving this connector.
    pub encoder: Option<ObjectId>,
    pub encoders: Vec<ObjectId>,
    pub modes: Vec<ModeInfo>,
}

/// Encoder as seen by the kernel.
#[derive(Clone, Debug)]
pub struct EncoderInfo {
    pub id: ObjectId,
    /// CRTC currently feeding this encoder.
    pub crtc: Option<ObjectId>,
    /// Bitmask of CRTC indices this encoder can be fed by.
    pub possible_crtcs: u32,
}

/// CRTC as seen by the kernel.
#[derive(Clone, Debug)]
pub struct CrtcInfo {
    pub id: ObjectId,
    pub mode: Option<ModeInfo>,
}

/// Plane as seen by the kernel.
#[derive(Clone, Debug)]
pub struct PlaneInfo {
    pub id: ObjectId,
    /// CRTC this plane is currently attached to.
    pub crtc: Option<ObjectId>,
    /// Bitmask of CRTC indices this plane can be attached to.
    pub possible_crtcs: u32,
    pub kind: PlaneKind,
}

/// Snapshot of all mode objects.
///
/// Indices into these lists are the bit positions used by the resource registry
/// and the `possible_crtcs` masks.
#[derive(Clone, Default, Debug)]
pub struct Resources {
    pub connectors: Vec<ConnectorInfo>,
    pub encoders: Vec<EncoderInfo>,
    pub crtcs: Vec<CrtcInfo>,
    pub planes: Vec<PlaneInfo>,
}

impl Resources {
    pub fn connector_index(&self, id: ObjectId) -> Option<usize> {
        self.connectors.iter().position(|connector| connector.id == id)
    }

    pub fn encoder_index(&self, id: ObjectId) -> Option<usize> {
        self.encoders.iter().position(|encoder| encoder.id == id)
    }

    pub fn crtc_index(&self, id: ObjectId) -> Option<usize> {
        self.crtcs.iter().position(|crtc| crtc.id == id)
    }

    pub fn plane_index(&self, id: ObjectId) -> Option<usize> {
        self.planes.iter().position(|plane| plane.id == id)
    }
}

/// Atomic commit flags.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct CommitFlags {
    /// Request a completion event for every flipped object.
    pub event: bool,
    /// Return before the hardware applied the new state.
    pub nonblock: bool,
}

impl Default for CommitFlags {
    fn default() -> Self {
        Self { event: true, nonblock: true }
    }
}

/// Data attached to a blob property.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Blob {
    Mode(ModeInfo),
    ConnectorIds(Vec<ObjectId>),
}

/// Blob property write.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BlobProperty {
    pub object: ObjectId,
    pub property: PropertyId,
    pub blob: Blob,
}

/// Property changes submitted as a single transaction.
#[derive(Clone, Default, Debug)]
pub struct AtomicRequest {
    properties: IndexMap<(ObjectId, PropertyId), u64>,
    blobs: Vec<BlobProperty>,
}

impl AtomicRequest {
    /// Stage a property write.
    ///
    /// Writes to the same object property replace the previous value.
    pub fn add_property(&mut self, object: ObjectId, property: PropertyId, value: u64) {
        self.properties.insert((object, property), value);
    }

    /// Stage a blob property write.
    pub fn add_blob(&mut self, object: ObjectId, property: PropertyId, blob: Blob) {
        self.blobs.retain(|pending| pending.object != object || pending.property != property);
        self.blobs.push(BlobProperty { object, property, blob });
    }

    /// Property writes in insertion order.
    pub fn properties(&self) -> impl Iterator<Item = (ObjectId, PropertyId, u64)> + '_ {
        self.properties.iter().map(|(&(object, property), &value)| (object, property, value))
    }

    pub fn blobs(&self) -> &[BlobProperty] {
        &self.blobs
    }

    /// Value staged for an object property.
    pub fn value(&self, object: ObjectId, property: PropertyId) -> Option<u64> {
        self.properties.get(&(object, property)).copied()
    }

    /// Distinct objects touched by this request, in insertion order.
    pub fn objects(&self) -> Vec<ObjectId> {
        let mut objects = Vec::new();
        let blob_objects = self.blobs.iter().map(|blob| blob.object);
        for object in self.properties.keys().map(|(object, _)| *object).chain(blob_objects) {
            if !objects.contains(&object) {
                objects.push(object);
            }
        }
        objects
    }

    /// Check if the request includes a mode change.
    pub fn has_mode(&self) -> bool {
        self.blobs.iter().any(|blob| matches!(blob.blob, Blob::Mode(_)))
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty() && self.blobs.is_empty()
    }
}

/// Notification that an object stopped scanning out its previous framebuffer.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct CompletionEvent {
    /// CRTC or plane which completed its flip.
    pub object: ObjectId,
    /// Framebuffer displayed before the flip, `0` if there was none.
    pub prior_fb: FramebufferId,
}

/// Memory layout of a platform buffer.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct BufferLayout {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub handles: [u32; 4],
    pub strides: [u32; 4],
    pub offsets: [u32; 4],
}

/// Identity of a platform buffer object.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct PlatformBufferId(pub u64);

/// Platform buffer handed out by [`BufferQueue::lock_front`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PlatformBuffer {
    pub id: PlatformBufferId,
    pub layout: BufferLayout,
}

/// CPU-visible back buffer of a queue.
pub struct Canvas<'a> {
    pub pixels: &'a mut [u8],
    pub width: u32,
    pub height: u32,
}

/// Platform buffer queue tied to one renderable surface.
pub trait BufferQueue {
    /// Dimensions of every buffer in the queue.
    fn size(&self) -> (u32, u32);

    /// Check if any buffer is not currently owned by the display pipeline.
    fn has_free_buffers(&self) -> bool;

    /// Back buffer for drawing the next frame.
    fn back_buffer(&mut self) -> Canvas<'_>;

    /// Turn the back buffer into the new front buffer.
    fn swap(&mut self) -> Result<(), BackendError>;

    /// Lock the most recent front buffer for scanout.
    fn lock_front(&mut self) -> Option<PlatformBuffer>;

    /// Return a locked buffer to the queue.
    fn release(&mut self, id: PlatformBufferId);

    /// Reclaim all buffers, returning the identity of every destroyed buffer.
    fn destroy(&mut self) -> Vec<PlatformBufferId>;
}

/// Allocator for platform buffer queues.
pub trait QueueAllocator {
    fn allocate(
        &mut self,
        width: u32,
        height: u32,
        format: u32,
    ) -> Result<Box<dyn BufferQueue>, BackendError>;
}

/// Kernel display transport.
pub trait DisplayBackend {
    /// Mode objects discovered at startup.
    fn resources(&self) -> &Resources;

    /// All properties of an object, as `(name, id)` pairs.
    fn properties(&self, object: ObjectId) -> Result<Vec<(String, PropertyId)>, BackendError>;

    /// Register a buffer for scanout.
    fn add_framebuffer(&mut self, layout: &BufferLayout) -> Result<FramebufferId, BackendError>;

    /// Remove a framebuffer registration.
    fn remove_framebuffer(&mut self, fb: FramebufferId) -> Result<(), BackendError>;

    /// Submit a transaction.
    ///
    /// Success means the kernel accepted the new state. With
    /// [`CommitFlags::event`] set, one [`CompletionEvent`] is later delivered
    /// through [`Self::dispatch_events`] for every object whose framebuffer was
    /// written.
    fn atomic_commit(
        &mut self,
        request: &AtomicRequest,
        flags: CommitFlags,
    ) -> Result<(), BackendError>;

    /// Read pending completion events, returning the number of events handled.
    fn dispatch_events(
        &mut self,
        handler: &mut dyn FnMut(CompletionEvent),
    ) -> Result<usize, BackendError>;
}
