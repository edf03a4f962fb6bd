//! Atomic commit batching.
//!
//! Every commit cycle collects the dirty state of all outputs into a single
//! atomic request. Front buffers are acquired speculatively while the request
//! is built and every acquisition is undone again if the kernel rejects the
//! transaction.

use std::time::Instant;

use tracing::{debug, error, trace, warn};

use crate::backend::{AtomicRequest, Blob, CommitFlags, DisplayBackend, ObjectId, PropertyId};
use crate::geometry::FixedRegion;
use crate::output::{Output, CURSOR_SIZE};
use crate::surface::{BufferId, Surface, SurfaceError};

/// Commit preparation failure.
#[derive(thiserror::Error, Debug)]
pub enum CommitError {
    #[error("output {0} is not fully bound")]
    Unbound(usize),
    #[error("unable to acquire {surface} front buffer: {source}")]
    Acquire {
        surface: &'static str,
        #[source]
        source: SurfaceError,
    },
}

/// Lifecycle of the current commit cycle.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub enum CommitState {
    /// No transaction allocated.
    #[default]
    Empty,
    /// Transaction is collecting property changes.
    Accumulating,
    /// Transaction was handed to the backend.
    Submitted,
}

/// Result of a submitted commit cycle.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CommitOutcome {
    /// No output had state to commit.
    Empty,
    /// The kernel accepted the transaction.
    Applied,
    /// The kernel rejected the transaction and all acquisitions were undone.
    Rejected,
}

/// Speculative state of one output in the current cycle.
#[derive(Copy, Clone, Debug)]
struct Staged {
    output: usize,
    crtc_buffer: Option<BufferId>,
    plane_buffer: Option<BufferId>,
    /// Completion event requested for the CRTC.
    crtc_event: bool,
    /// Completion event requested for the plane.
    plane_event: bool,
    /// Plane is detached from its framebuffer by this cycle.
    plane_disabled: bool,
}

/// Atomic commit batcher.
#[derive(Default)]
pub struct CommitBatcher {
    request: AtomicRequest,
    flags: CommitFlags,
    staged: Vec<Staged>,
    state: CommitState,
}

impl CommitBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CommitState {
        self.state
    }

    /// Stage all dirty state of an output.
    ///
    /// If a front buffer can't be acquired, every buffer acquired for this
    /// output is released again and none of its properties are staged. Other
    /// outputs of the same cycle are unaffected.
    pub fn add_output(
        &mut self,
        index: usize,
        output: &mut Output,
        backend: &mut dyn DisplayBackend,
    ) -> Result<(), CommitError> {
        if !output.is_dirty() {
            return Ok(());
        }

        if !output.pipe.is_bound() {
            return Err(CommitError::Unbound(index));
        }

        if self.staged.iter().any(|staged| staged.output == index) {
            warn!("Output {index} was already added to this commit");
            return Ok(());
        }

        if self.state == CommitState::Empty {
            self.request = AtomicRequest::default();
            self.flags = CommitFlags::default();
            self.state = CommitState::Accumulating;
        }

        let (crtc_buffer, plane_buffer) = Self::acquire(output, backend)?;

        let crtc_id = output.pipe.crtc_id();
        let plane_id = output.pipe.plane_id();
        let request = &mut self.request;

        let crtc = &mut output.crtc;
        if let Some(buffer) = crtc_buffer {
            let fb_id = crtc.surface.buffer(buffer).fb_id();
            add_property(request, crtc_id, crtc.props.fb_id, fb_id as u64);
            add_property(request, crtc_id, crtc.props.src_x, 0);
            add_property(request, crtc_id, crtc.props.src_y, 0);
            crtc.surface.add_pending_event();
        }

        if crtc.dirty_mode {
            let connectors = vec![output.pipe.connector_id()];
            add_blob(request, crtc_id, crtc.props.mode, Blob::Mode(crtc.mode.clone()));
            add_blob(request, crtc_id, crtc.props.connector_ids, Blob::ConnectorIds(connectors));

            // Mode changes can't be applied without blocking.
            self.flags.nonblock = false;
        }

        if crtc.dirty_cursor {
            add_property(request, crtc_id, crtc.props.cursor_id, 0);
            add_property(request, crtc_id, crtc.props.cursor_x, 0);
            add_property(request, crtc_id, crtc.props.cursor_y, 0);
            add_property(request, crtc_id, crtc.props.cursor_w, CURSOR_SIZE);
            add_property(request, crtc_id, crtc.props.cursor_h, CURSOR_SIZE);
        }

        let plane = &mut output.plane;
        if plane.dirty {
            let fb_id = plane_buffer.map_or(0, |buffer| plane.surface.buffer(buffer).fb_id());
            let (src, dst) = (plane.src, plane.dst);

            add_property(request, plane_id, plane.props.fb_id, fb_id as u64);
            add_property(request, plane_id, plane.props.crtc_id, crtc_id as u64);
            add_property(request, plane_id, plane.props.src_x, src.x1 as u32 as u64);
            add_property(request, plane_id, plane.props.src_y, src.y1 as u32 as u64);
            add_property(request, plane_id, plane.props.src_w, src.width() as u32 as u64);
            add_property(request, plane_id, plane.props.src_h, src.height() as u32 as u64);
            add_property(request, plane_id, plane.props.crtc_x, dst.x1 as i64 as u64);
            add_property(request, plane_id, plane.props.crtc_y, dst.y1 as i64 as u64);
            add_property(request, plane_id, plane.props.crtc_w, dst.width() as u32 as u64);
            add_property(request, plane_id, plane.props.crtc_h, dst.height() as u32 as u64);

            // Detaching the framebuffer completes without an event.
            if plane_buffer.is_some() {
                plane.surface.add_pending_event();
            }
        }

        self.staged.push(Staged {
            output: index,
            crtc_buffer,
            plane_buffer,
            crtc_event: crtc_buffer.is_some(),
            plane_event: plane_buffer.is_some(),
            plane_disabled: plane.dirty && plane_buffer.is_none(),
        });

        Ok(())
    }

    /// Submit the accumulated transaction.
    ///
    /// On success, dirty flags of all staged outputs are cleared and acquired
    /// buffers stay referenced until their completion events arrive. On
    /// rejection, every acquisition of this cycle is undone and dirty flags are
    /// kept for the next attempt.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn submit(
        &mut self,
        outputs: &mut [Output],
        backend: &mut dyn DisplayBackend,
    ) -> CommitOutcome {
        if self.state == CommitState::Empty {
            return CommitOutcome::Empty;
        }

        let request = std::mem::take(&mut self.request);
        if request.is_empty() {
            self.rollback(outputs);
            self.state = CommitState::Empty;
            return CommitOutcome::Empty;
        }

        if request.has_mode() && self.flags.nonblock {
            crate::invariant_violated(format_args!("nonblocking commit with mode change"));
            self.flags.nonblock = false;
        }

        self.state = CommitState::Submitted;

        let start = Instant::now();
        let result = backend.atomic_commit(&request, self.flags);
        debug!("commit took {:?}", start.elapsed());

        let outcome = match result {
            Ok(()) => {
                for staged in self.staged.drain(..) {
                    let output = &mut outputs[staged.output];
                    output.crtc.dirty = false;
                    output.crtc.dirty_mode = false;
                    output.crtc.dirty_cursor = false;
                    output.plane.dirty = false;

                    // A detached plane no longer references its last framebuffer.
                    let plane = &mut output.plane;
                    if staged.plane_buffer.is_some() {
                        plane.scanout = staged.plane_buffer;
                    } else if staged.plane_disabled {
                        if let Some(buffer) = plane.scanout.take() {
                            release(&mut plane.surface, buffer);
                        }
                    }
                }
                CommitOutcome::Applied
            },
            Err(err) => {
                error!("Atomic commit rejected: {err}");
                self.log_rejection(outputs);
                self.rollback(outputs);
                CommitOutcome::Rejected
            },
        };

        self.state = CommitState::Empty;

        outcome
    }

    /// Acquire the front buffers of all dirty surfaces of an output.
    fn acquire(
        output: &mut Output,
        backend: &mut dyn DisplayBackend,
    ) -> Result<(Option<BufferId>, Option<BufferId>), CommitError> {
        let crtc_buffer = if output.crtc.dirty {
            let buffer = output
                .crtc
                .surface
                .acquire_front(backend)
                .map_err(|source| CommitError::Acquire { surface: "crtc", source })?;
            Some(buffer)
        } else {
            None
        };

        if !output.plane.dirty || !output.plane.enabled {
            return Ok((crtc_buffer, None));
        }

        match output.plane.surface.acquire_front(backend) {
            Ok(buffer) => Ok((crtc_buffer, Some(buffer))),
            Err(source) => {
                if let Some(buffer) = crtc_buffer {
                    release(&mut output.crtc.surface, buffer);
                }
                Err(CommitError::Acquire { surface: "plane", source })
            },
        }
    }

    /// Undo all speculative acquisitions of this cycle.
    fn rollback(&mut self, outputs: &mut [Output]) {
        for staged in self.staged.drain(..) {
            let output = &mut outputs[staged.output];

            if let Some(buffer) = staged.crtc_buffer {
                release(&mut output.crtc.surface, buffer);
            }
            if staged.crtc_event {
                output.crtc.surface.retire_pending_event();
            }

            if let Some(buffer) = staged.plane_buffer {
                release(&mut output.plane.surface, buffer);
            }
            if staged.plane_event {
                output.plane.surface.retire_pending_event();
            }
        }
    }

    /// Log the staged state of all outputs of a rejected transaction.
    fn log_rejection(&self, outputs: &[Output]) {
        for staged in &self.staged {
            let output = &outputs[staged.output];
            let (crtc, plane) = (&output.crtc, &output.plane);

            if plane.dirty {
                let fb_id =
                    staged.plane_buffer.map_or(0, |buffer| plane.surface.buffer(buffer).fb_id());
                error!(
                    "plane = {}, crtc = {}, fb = {fb_id}",
                    output.pipe.plane_id(),
                    output.pipe.crtc_id()
                );
                error!("src = {}", FixedRegion(plane.src));
                error!("dst = {}", plane.dst);
            }

            if let Some(buffer) = staged.crtc_buffer {
                let fb_id = crtc.surface.buffer(buffer).fb_id();
                error!("crtc = {}, fb = {fb_id}", output.pipe.crtc_id());
            }

            if crtc.dirty_mode {
                error!("mode = {}", crtc.mode);
                error!("connector_id = {}", output.pipe.connector_id());
            }
        }
    }
}

/// Stage a property write, skipping properties the kernel doesn't expose.
fn add_property(request: &mut AtomicRequest, object: ObjectId, property: PropertyId, value: u64) {
    if property == 0 {
        trace!("Skipping unresolved property of object {object}");
        return;
    }

    request.add_property(object, property, value);
}

fn add_blob(request: &mut AtomicRequest, object: ObjectId, property: PropertyId, blob: Blob) {
    if property != 0 {
        request.add_blob(object, property, blob);
    }
}

fn release(surface: &mut Surface, buffer: BufferId) {
    if let Err(err) = surface.release(buffer) {
        warn!("Unable to release {} buffer: {err}", surface.name());
    }
}
