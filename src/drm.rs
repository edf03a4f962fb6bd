//! DRM atomic modesetting backend with GBM buffer queues.
//!
//! The kernel has no per-CRTC framebuffer or mode properties under atomic
//! modesetting. CRTCs instead expose a small set of virtual properties which
//! are translated to their primary plane, the `MODE_ID` blob and the
//! connector routing when a request is submitted.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::num::NonZeroU32;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;

use smithay::reexports::drm::buffer::{DrmFourcc, DrmModifier, Handle as BufferHandle, PlanarBuffer};
use smithay::reexports::drm::control::atomic::AtomicModeReq;
use smithay::reexports::drm::control::{
    self, connector, crtc, framebuffer, plane, property, AtomicCommitFlags, Device as ControlDevice,
    Event, FbCmd2Flags, Mode, ResourceHandles,
};
use smithay::reexports::drm::{ClientCapability, Device};
use smithay::reexports::gbm::{self, BufferObject, BufferObjectFlags};
use tracing::{debug, info, trace, warn};

use crate::backend::{
    AtomicRequest, BackendError, Blob, BufferLayout, BufferQueue, Canvas, CommitFlags,
    CompletionEvent, ConnectorInfo, CrtcInfo, DisplayBackend, EncoderInfo, FramebufferId, ModeInfo,
    ObjectId, PlaneInfo, PlaneKind, PlatformBuffer, PlatformBufferId, PropertyId, QueueAllocator,
    Resources,
};

/// First ID used for virtual CRTC properties.
const VIRTUAL_PROPERTY_BASE: PropertyId = 0xffff_0000;

/// Virtual CRTC properties, in ID order.
const VIRTUAL_PROPERTIES: [&str; 5] = ["FB_ID", "SRC_X", "SRC_Y", "MODE", "CONNECTOR_IDS"];

/// Open DRM device node.
#[derive(Debug)]
pub struct Card(File);

impl Card {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self(file))
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self(self.0.try_clone()?))
    }
}

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

/// Property handles of a kernel object, by name.
type PropertyMap = HashMap<String, property::Handle>;

/// Primary plane driving a CRTC's virtual properties.
#[derive(Debug)]
struct PrimaryPlane {
    id: ObjectId,
    props: PropertyMap,
}

/// Display backend for a DRM device with atomic modesetting.
pub struct DrmBackend {
    card: Card,
    resources: Resources,
    /// Kernel modes backing every [`ModeInfo`] in the resource snapshot.
    modes: Vec<Mode>,
    primaries: HashMap<ObjectId, PrimaryPlane>,
    plane_props: HashMap<ObjectId, PropertyMap>,
    crtc_props: HashMap<ObjectId, PropertyMap>,
    connector_props: HashMap<ObjectId, PropertyMap>,
    /// Active size of every CRTC, used for sizing its primary plane.
    crtc_sizes: HashMap<ObjectId, (u16, u16)>,
    /// Framebuffer each CRTC or plane is currently scanning out.
    scanout: HashMap<ObjectId, FramebufferId>,
    /// CRTC each plane is attached to.
    attached: HashMap<ObjectId, ObjectId>,
    /// Completion events waiting for a page flip on their CRTC.
    pending_flips: HashMap<ObjectId, Vec<CompletionEvent>>,
}

impl DrmBackend {
    /// Enable atomic modesetting and snapshot all mode objects.
    pub fn new(card: Card) -> Result<Self, BackendError> {
        for capability in [ClientCapability::UniversalPlanes, ClientCapability::Atomic] {
            card.set_client_capability(capability, true)
                .map_err(BackendError::io("missing atomic modesetting support"))?;
        }

        let handles =
            card.resource_handles().map_err(BackendError::io("unable to read DRM resources"))?;

        let mut backend = Self {
            card,
            resources: Default::default(),
            modes: Default::default(),
            primaries: Default::default(),
            plane_props: Default::default(),
            crtc_props: Default::default(),
            connector_props: Default::default(),
            crtc_sizes: Default::default(),
            scanout: Default::default(),
            attached: Default::default(),
            pending_flips: Default::default(),
        };
        backend.snapshot(&handles)?;

        info!(
            "Found {} connectors, {} encoders, {} crtcs, {} planes",
            backend.resources.connectors.len(),
            backend.resources.encoders.len(),
            backend.resources.crtcs.len(),
            backend.resources.planes.len(),
        );

        Ok(backend)
    }

    /// Duplicate the device handle for event readiness polling.
    pub fn event_source(&self) -> Result<Card, BackendError> {
        self.card.try_clone().map_err(BackendError::io("unable to duplicate DRM device"))
    }

    fn snapshot(&mut self, handles: &ResourceHandles) -> Result<(), BackendError> {
        let card = &self.card;

        for &handle in handles.crtcs() {
            let info = card.get_crtc(handle).map_err(BackendError::io("unable to read crtc"))?;
            let id = u32::from(handle);
            let mode = info.mode().map(|mode| register_mode(&mut self.modes, mode));
            if let Some(mode) = info.mode() {
                self.crtc_sizes.insert(id, mode.size());
            }
            if let Some(fb) = info.framebuffer() {
                self.scanout.insert(id, u32::from(fb));
            }
            self.crtc_props.insert(id, property_map(card, handle)?);
            self.resources.crtcs.push(CrtcInfo { id, mode });
        }

        for &handle in handles.encoders() {
            let info =
                card.get_encoder(handle).map_err(BackendError::io("unable to read encoder"))?;
            self.resources.encoders.push(EncoderInfo {
                id: u32::from(handle),
                crtc: info.crtc().map(u32::from),
                possible_crtcs: crtc_mask(handles, handles.filter_crtcs(info.possible_crtcs())),
            });
        }

        for &handle in handles.connectors() {
            let info = card
                .get_connector(handle, true)
                .map_err(BackendError::io("unable to read connector"))?;
            let id = u32::from(handle);
            let name = format!("{}-{}", info.interface().as_str(), info.interface_id());
            let modes =
                info.modes().iter().map(|&mode| register_mode(&mut self.modes, mode)).collect();
            debug!("connector {id} is {name} ({:?})", info.state());

            self.connector_props.insert(id, property_map(card, handle)?);
            self.resources.connectors.push(ConnectorInfo {
                id,
                name,
                modes,
                encoder: info.current_encoder().map(u32::from),
                encoders: info.encoders().iter().copied().map(u32::from).collect(),
            });
        }

        let planes = card.plane_handles().map_err(BackendError::io("unable to read planes"))?;
        for handle in planes {
            let info = card.get_plane(handle).map_err(BackendError::io("unable to read plane"))?;
            let id = u32::from(handle);
            let kind = PlaneKind::from_raw(plane_type(card, handle)?);
            let crtc = info.crtc().map(u32::from);
            let possible_crtcs = crtc_mask(handles, handles.filter_crtcs(info.possible_crtcs()));

            if let Some(crtc) = crtc {
                self.attached.insert(id, crtc);
            }
            if let Some(fb) = info.framebuffer() {
                self.scanout.insert(id, u32::from(fb));
            }

            self.plane_props.insert(id, property_map(card, handle)?);
            self.resources.planes.push(PlaneInfo { id, crtc, possible_crtcs, kind });
        }

        self.assign_primary_planes();

        Ok(())
    }

    /// Pick the primary plane backing every CRTC.
    ///
    /// Planes already attached to a CRTC are preferred.
    fn assign_primary_planes(&mut self) {
        for (index, crtc) in self.resources.crtcs.iter().enumerate() {
            let mut candidates = self.resources.planes.iter().filter(|plane| {
                plane.kind == PlaneKind::Primary && plane.possible_crtcs & (1 << index) != 0
            });
            let attached = candidates.clone().find(|plane| plane.crtc == Some(crtc.id));
            let taken = |id: ObjectId| self.primaries.values().any(|primary| primary.id == id);

            let primary = match attached.or_else(|| candidates.find(|plane| !taken(plane.id))) {
                Some(primary) => primary,
                None => {
                    warn!("No primary plane for crtc {}", crtc.id);
                    continue;
                },
            };

            let props = self.plane_props.get(&primary.id).cloned().unwrap_or_default();
            debug!("crtc {} uses primary plane {}", crtc.id, primary.id);
            self.primaries.insert(crtc.id, PrimaryPlane { id: primary.id, props });
        }
    }

    fn kernel_mode(&self, info: &ModeInfo) -> Option<Mode> {
        self.modes.iter().find(|mode| mode_info(mode) == *info).copied()
    }

    fn is_crtc(&self, id: ObjectId) -> bool {
        self.resources.crtc_index(id).is_some()
    }

    /// Translate a request into a kernel transaction.
    ///
    /// Returns the transaction, the created blobs and the flips expected once
    /// the commit is applied.
    fn translate(
        &self,
        request: &AtomicRequest,
    ) -> Result<(AtomicModeReq, Vec<u64>, Vec<Flip>), BackendError> {
        let mut kernel = KernelRequest::default();
        let mut sizes = self.crtc_sizes.clone();
        let mut blobs = Vec::new();

        for pending in request.blobs() {
            let crtc = pending.object;
            if !self.is_crtc(crtc) {
                return Err(BackendError::UnknownObject(crtc));
            }

            match &pending.blob {
                Blob::Mode(info) => {
                    let mode = self.kernel_mode(info).ok_or(BackendError::UnknownObject(crtc))?;
                    let blob = self
                        .card
                        .create_property_blob(&mode)
                        .map_err(BackendError::io("unable to create mode blob"))?;
                    if let property::Value::Blob(id) = &blob {
                        blobs.push(*id);
                    }

                    let props = self.crtc_props.get(&crtc);
                    kernel.add(crtc, props, "MODE_ID", u64::from(blob));
                    kernel.add(crtc, props, "ACTIVE", 1);
                    sizes.insert(crtc, mode.size());
                },
                Blob::ConnectorIds(connectors) => {
                    for connector in connectors {
                        let props = self.connector_props.get(connector);
                        kernel.add(*connector, props, "CRTC_ID", crtc as u64);
                    }
                },
            }
        }

        let mut flips = Vec::new();
        let mut attached = self.attached.clone();

        for (object, property, value) in request.properties() {
            if property < VIRTUAL_PROPERTY_BASE {
                kernel.add_raw(object, property, value);

                // Track plane routing for completion events.
                let props = self.plane_props.get(&object);
                if props.and_then(|props| props.get("CRTC_ID")).map(|id| u32::from(*id))
                    == Some(property)
                {
                    attached.insert(object, value as ObjectId);
                }
                continue;
            }

            let primary = self.primaries.get(&object).ok_or(BackendError::NoPrimaryPlane(object))?;
            let props = Some(&primary.props);
            match VIRTUAL_PROPERTIES.get((property - VIRTUAL_PROPERTY_BASE) as usize) {
                Some(&"FB_ID") => {
                    let (width, height) = sizes.get(&object).copied().unwrap_or_default();
                    let (width, height) = (width as u64, height as u64);
                    kernel.add(primary.id, props, "FB_ID", value);
                    kernel.add(primary.id, props, "CRTC_ID", object as u64);
                    kernel.add(primary.id, props, "SRC_W", width << 16);
                    kernel.add(primary.id, props, "SRC_H", height << 16);
                    kernel.add(primary.id, props, "CRTC_X", 0);
                    kernel.add(primary.id, props, "CRTC_Y", 0);
                    kernel.add(primary.id, props, "CRTC_W", width);
                    kernel.add(primary.id, props, "CRTC_H", height);
                },
                Some(&"SRC_X") => kernel.add(primary.id, props, "SRC_X", value << 16),
                Some(&"SRC_Y") => kernel.add(primary.id, props, "SRC_Y", value << 16),
                _ => return Err(BackendError::UnknownObject(object)),
            }
        }

        // Collect framebuffer writes, which each retire the previous framebuffer.
        for (object, property, value) in request.properties() {
            let is_fb = if property >= VIRTUAL_PROPERTY_BASE {
                property == VIRTUAL_PROPERTY_BASE
            } else {
                let props = self.plane_props.get(&object);
                props.and_then(|props| props.get("FB_ID")).map(|id| u32::from(*id))
                    == Some(property)
            };
            if !is_fb {
                continue;
            }

            let crtc =
                if self.is_crtc(object) { Some(object) } else { attached.get(&object).copied() };
            let prior_fb = self.scanout.get(&object).copied().unwrap_or(0);
            match crtc.filter(|crtc| *crtc != 0) {
                Some(crtc) => flips.push(Flip {
                    event: CompletionEvent { object, prior_fb },
                    fb: value as FramebufferId,
                    crtc,
                }),
                None => warn!("No crtc for framebuffer update of object {object}"),
            }

            // Disabled planes must not stay routed to a CRTC.
            if value == 0 && !self.is_crtc(object) {
                let props = self.plane_props.get(&object);
                kernel.add(object, props, "CRTC_ID", 0);
            }
        }

        let req = kernel.build(self)?;
        Ok((req, blobs, flips))
    }

    fn destroy_blobs(&self, blobs: Vec<u64>) {
        for blob in blobs {
            if let Err(err) = self.card.destroy_property_blob(blob) {
                warn!("Unable to destroy property blob {blob}: {err}");
            }
        }
    }
}

impl DisplayBackend for DrmBackend {
    fn resources(&self) -> &Resources {
        &self.resources
    }

    fn properties(&self, object: ObjectId) -> Result<Vec<(String, PropertyId)>, BackendError> {
        if self.is_crtc(object) {
            let properties = VIRTUAL_PROPERTIES.iter().enumerate();
            return Ok(properties
                .map(|(i, name)| (name.to_string(), VIRTUAL_PROPERTY_BASE + i as PropertyId))
                .collect());
        }

        let props = self
            .plane_props
            .get(&object)
            .or_else(|| self.connector_props.get(&object))
            .ok_or(BackendError::UnknownObject(object))?;
        Ok(props.iter().map(|(name, handle)| (name.clone(), u32::from(*handle))).collect())
    }

    fn add_framebuffer(&mut self, layout: &BufferLayout) -> Result<FramebufferId, BackendError> {
        let buffer = Planar::new(layout)?;
        let fb = self
            .card
            .add_planar_framebuffer(&buffer, FbCmd2Flags::empty())
            .map_err(BackendError::io("unable to add framebuffer"))?;
        trace!("Added framebuffer {}", u32::from(fb));
        Ok(u32::from(fb))
    }

    fn remove_framebuffer(&mut self, fb: FramebufferId) -> Result<(), BackendError> {
        let handle = control::from_u32::<framebuffer::Handle>(fb)
            .ok_or(BackendError::UnknownObject(fb))?;
        self.card
            .destroy_framebuffer(handle)
            .map_err(BackendError::io("unable to remove framebuffer"))
    }

    #[cfg_attr(feature = "profiling", profiling::function)]
    fn atomic_commit(
        &mut self,
        request: &AtomicRequest,
        flags: CommitFlags,
    ) -> Result<(), BackendError> {
        let (req, blobs, flips) = self.translate(request)?;

        let mut commit_flags = AtomicCommitFlags::empty();
        if flags.event {
            commit_flags |= AtomicCommitFlags::PAGE_FLIP_EVENT;
        }
        if flags.nonblock {
            commit_flags |= AtomicCommitFlags::NONBLOCK;
        }
        if request.has_mode() {
            commit_flags |= AtomicCommitFlags::ALLOW_MODESET;
        }

        let result = self.card.atomic_commit(commit_flags, req);
        self.destroy_blobs(blobs);
        result.map_err(BackendError::io("atomic commit failed"))?;

        for pending in request.blobs() {
            if let Blob::Mode(mode) = &pending.blob {
                self.crtc_sizes.insert(pending.object, (mode.hdisplay, mode.vdisplay));
            }
        }

        for Flip { crtc, event, fb } in flips {
            self.scanout.insert(event.object, fb);
            if !self.is_crtc(event.object) {
                self.attached.insert(event.object, if fb == 0 { 0 } else { crtc });
            }

            // Detaching a framebuffer has nothing left to complete.
            if flags.event && fb != 0 {
                self.pending_flips.entry(crtc).or_default().push(event);
            }
        }

        Ok(())
    }

    fn dispatch_events(
        &mut self,
        handler: &mut dyn FnMut(CompletionEvent),
    ) -> Result<usize, BackendError> {
        let events = match self.card.receive_events() {
            Ok(events) => events,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(0),
            Err(err) => return Err(BackendError::io("unable to read DRM events")(err)),
        };

        let mut count = 0;
        for event in events {
            let Event::PageFlip(flip) = event else { continue };
            let crtc = u32::from(flip.crtc);
            trace!("Page flip on crtc {crtc}, frame {}", flip.frame);

            for event in self.pending_flips.remove(&crtc).unwrap_or_default() {
                handler(event);
                count += 1;
            }
        }

        Ok(count)
    }
}

/// Framebuffer change of a CRTC or plane.
struct Flip {
    /// CRTC whose page flip completes the change.
    crtc: ObjectId,
    event: CompletionEvent,
    fb: FramebufferId,
}

/// Kernel transaction builder tracking typed object handles.
#[derive(Default)]
struct KernelRequest {
    properties: Vec<(ObjectId, PropertyId, u64)>,
}

impl KernelRequest {
    /// Add a named property, skipping it if the object doesn't expose it.
    fn add(&mut self, object: ObjectId, props: Option<&PropertyMap>, name: &str, value: u64) {
        match props.and_then(|props| props.get(name)) {
            Some(property) => self.add_raw(object, u32::from(*property), value),
            None => debug!("object {object} has no {name} property"),
        }
    }

    fn add_raw(&mut self, object: ObjectId, property: PropertyId, value: u64) {
        self.properties.retain(|(o, p, _)| *o != object || *p != property);
        self.properties.push((object, property, value));
    }

    fn build(self, backend: &DrmBackend) -> Result<AtomicModeReq, BackendError> {
        let resources = &backend.resources;
        let mut req = AtomicModeReq::new();

        for (object, property, value) in self.properties {
            let property = control::from_u32::<property::Handle>(property)
                .ok_or(BackendError::UnknownObject(object))?;
            let value = property::Value::UnsignedRange(value);

            if resources.plane_index(object).is_some() {
                req.add_property(handle::<plane::Handle>(object)?, property, value);
            } else if resources.crtc_index(object).is_some() {
                req.add_property(handle::<crtc::Handle>(object)?, property, value);
            } else if resources.connector_index(object).is_some() {
                req.add_property(handle::<connector::Handle>(object)?, property, value);
            } else {
                return Err(BackendError::UnknownObject(object));
            }
        }

        Ok(req)
    }
}

fn handle<T: control::ResourceHandle>(id: ObjectId) -> Result<T, BackendError> {
    control::from_u32(id).ok_or(BackendError::UnknownObject(id))
}

/// Bitmask of CRTC indices for a list of CRTC handles.
fn crtc_mask(handles: &ResourceHandles, crtcs: Vec<crtc::Handle>) -> u32 {
    let all = handles.crtcs();
    crtcs
        .iter()
        .filter_map(|crtc| all.iter().position(|handle| handle == crtc))
        .fold(0, |mask, index| mask | (1 << index))
}

fn property_map<H>(card: &Card, object: H) -> Result<PropertyMap, BackendError>
where
    H: control::ResourceHandle,
{
    let properties =
        card.get_properties(object).map_err(BackendError::io("unable to read properties"))?;
    let infos =
        properties.as_hashmap(card).map_err(BackendError::io("unable to read properties"))?;
    Ok(infos.into_iter().map(|(name, info)| (name, info.handle())).collect())
}

/// Raw value of a plane's `type` property.
fn plane_type(card: &Card, plane: plane::Handle) -> Result<u64, BackendError> {
    let properties =
        card.get_properties(plane).map_err(BackendError::io("unable to read properties"))?;
    for (&handle, &value) in properties.iter() {
        let info = card.get_property(handle).map_err(BackendError::io("unable to read property"))?;
        if info.name().to_str() == Ok("type") {
            return Ok(value);
        }
    }
    Ok(0)
}

/// Remember a kernel mode, returning its description.
fn register_mode(modes: &mut Vec<Mode>, mode: Mode) -> ModeInfo {
    let info = mode_info(&mode);
    if !modes.iter().any(|known| mode_info(known) == info) {
        modes.push(mode);
    }
    info
}

fn mode_info(mode: &Mode) -> ModeInfo {
    let (hdisplay, vdisplay) = mode.size();
    let (hsync_start, hsync_end, htotal) = mode.hsync();
    let (vsync_start, vsync_end, vtotal) = mode.vsync();
    ModeInfo {
        name: mode.name().to_string_lossy().into_owned(),
        clock: mode.clock(),
        vrefresh: mode.vrefresh(),
        flags: mode.flags().bits(),
        hdisplay,
        hsync_start,
        hsync_end,
        htotal,
        vdisplay,
        vsync_start,
        vsync_end,
        vtotal,
    }
}

/// Planar view of a buffer layout for framebuffer registration.
struct Planar<'a> {
    layout: &'a BufferLayout,
    format: DrmFourcc,
}

impl<'a> Planar<'a> {
    fn new(layout: &'a BufferLayout) -> Result<Self, BackendError> {
        let format = DrmFourcc::try_from(layout.format)
            .map_err(|_| BackendError::UnsupportedFormat(layout.format))?;
        Ok(Self { layout, format })
    }
}

impl PlanarBuffer for Planar<'_> {
    fn size(&self) -> (u32, u32) {
        (self.layout.width, self.layout.height)
    }

    fn format(&self) -> DrmFourcc {
        self.format
    }

    fn modifier(&self) -> Option<DrmModifier> {
        None
    }

    fn pitches(&self) -> [u32; 4] {
        self.layout.strides
    }

    fn handles(&self) -> [Option<BufferHandle>; 4] {
        self.layout.handles.map(|handle| NonZeroU32::new(handle).map(BufferHandle::from))
    }

    fn offsets(&self) -> [u32; 4] {
        self.layout.offsets
    }
}

/// Ownership of a GBM buffer in its queue.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum SlotState {
    Free,
    /// Most recently swapped buffer, not yet handed to the display.
    Front,
    /// Buffer owned by the display pipeline.
    Locked,
}

struct Slot {
    bo: BufferObject<()>,
    state: SlotState,
}

/// Queue of linear, CPU-writable scanout buffers.
pub struct GbmQueue {
    slots: Vec<Slot>,
    /// CPU copy of the back buffer, tightly packed.
    staging: Vec<u8>,
    width: u32,
    height: u32,
}

impl GbmQueue {
    fn layout(bo: &BufferObject<()>) -> BufferLayout {
        let (width, height) = PlanarBuffer::size(bo);
        BufferLayout {
            width,
            height,
            format: PlanarBuffer::format(bo) as u32,
            handles: PlanarBuffer::handles(bo).map(|handle| handle.map_or(0, u32::from)),
            strides: PlanarBuffer::pitches(bo),
            offsets: PlanarBuffer::offsets(bo),
        }
    }
}

impl BufferQueue for GbmQueue {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn has_free_buffers(&self) -> bool {
        self.slots.iter().any(|slot| slot.state != SlotState::Locked)
    }

    fn back_buffer(&mut self) -> Canvas<'_> {
        Canvas { pixels: &mut self.staging, width: self.width, height: self.height }
    }

    #[cfg_attr(feature = "profiling", profiling::function)]
    fn swap(&mut self) -> Result<(), BackendError> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.state == SlotState::Free)
            .or_else(|| self.slots.iter().position(|slot| slot.state == SlotState::Front))
            .ok_or(BackendError::QueueExhausted)?;

        let slot = &mut self.slots[index];
        let row = self.width as usize * 4;
        let stride = slot.bo.stride() as usize;
        let result = if stride == row {
            slot.bo.write(&self.staging)
        } else {
            let mut padded = vec![0; stride * self.height as usize];
            for (dst, src) in padded.chunks_exact_mut(stride).zip(self.staging.chunks_exact(row)) {
                dst[..row].copy_from_slice(src);
            }
            slot.bo.write(&padded)
        };
        result.map_err(BackendError::io("unable to upload buffer"))?;

        for (i, slot) in self.slots.iter_mut().enumerate() {
            if i == index {
                slot.state = SlotState::Front;
            } else if slot.state == SlotState::Front {
                slot.state = SlotState::Free;
            }
        }

        Ok(())
    }

    fn lock_front(&mut self) -> Option<PlatformBuffer> {
        let index = self.slots.iter().position(|slot| slot.state == SlotState::Front)?;
        let slot = &mut self.slots[index];
        slot.state = SlotState::Locked;
        Some(PlatformBuffer { id: PlatformBufferId(index as u64), layout: Self::layout(&slot.bo) })
    }

    fn release(&mut self, id: PlatformBufferId) {
        match self.slots.get_mut(id.0 as usize) {
            Some(slot) if slot.state == SlotState::Locked => slot.state = SlotState::Free,
            _ => warn!("Released unlocked platform buffer {}", id.0),
        }
    }

    fn destroy(&mut self) -> Vec<PlatformBufferId> {
        let ids = (0..self.slots.len() as u64).map(PlatformBufferId).collect();
        self.slots.clear();
        ids
    }
}

/// GBM queue allocator.
pub struct GbmAllocator {
    device: gbm::Device<Card>,
    queue_depth: usize,
}

impl GbmAllocator {
    pub fn new(card: Card, queue_depth: usize) -> Result<Self, BackendError> {
        let device =
            gbm::Device::new(card).map_err(BackendError::io("unable to create GBM device"))?;
        Ok(Self { device, queue_depth })
    }
}

impl QueueAllocator for GbmAllocator {
    fn allocate(
        &mut self,
        width: u32,
        height: u32,
        format: u32,
    ) -> Result<Box<dyn BufferQueue>, BackendError> {
        let fourcc =
            DrmFourcc::try_from(format).map_err(|_| BackendError::UnsupportedFormat(format))?;
        let flags =
            BufferObjectFlags::SCANOUT | BufferObjectFlags::WRITE | BufferObjectFlags::LINEAR;

        let mut slots = Vec::with_capacity(self.queue_depth);
        for _ in 0..self.queue_depth {
            let bo = self
                .device
                .create_buffer_object::<()>(width, height, fourcc, flags)
                .map_err(BackendError::io("unable to allocate scanout buffer"))?;
            slots.push(Slot { bo, state: SlotState::Free });
        }
        debug!("Allocated {} {width}x{height} buffers", slots.len());

        let staging = vec![0; width as usize * height as usize * 4];
        Ok(Box::new(GbmQueue { slots, staging, width, height }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FORMAT_XRGB8888;

    fn property(id: u32) -> property::Handle {
        control::from_u32(id).unwrap()
    }

    #[test]
    fn planar_layout() {
        let layout = BufferLayout {
            width: 64,
            height: 32,
            format: FORMAT_XRGB8888,
            handles: [7, 0, 0, 0],
            strides: [256, 0, 0, 0],
            offsets: [0; 4],
        };

        let planar = Planar::new(&layout).unwrap();
        assert_eq!(planar.format(), DrmFourcc::Xrgb8888);
        assert_eq!(planar.size(), (64, 32));
        let handles = planar.handles().map(|handle| handle.map(u32::from));
        assert_eq!(handles, [Some(7), None, None, None]);

        let invalid = BufferLayout { format: 0, ..layout };
        assert!(matches!(Planar::new(&invalid), Err(BackendError::UnsupportedFormat(0))));
    }

    #[test]
    fn kernel_request_skips_missing_properties() {
        let props = PropertyMap::from([("FB_ID".to_string(), property(5))]);
        let mut kernel = KernelRequest::default();

        kernel.add(60, Some(&props), "FB_ID", 101);
        kernel.add(60, Some(&props), "CRTC_ID", 50);
        kernel.add(61, None, "FB_ID", 102);
        kernel.add(60, Some(&props), "FB_ID", 103);

        assert_eq!(kernel.properties, vec![(60, 5, 103)]);
    }
}
