//! Completion event handling.

use tracing::{debug, trace, warn};

use crate::backend::CompletionEvent;
use crate::output::Output;

/// Retire the buffer an object stopped scanning out.
///
/// Returns `false` if no output owns the event's object.
pub fn dispatch_completion(outputs: &mut [Output], event: CompletionEvent) -> bool {
    let CompletionEvent { object, prior_fb } = event;
    if object == 0 {
        warn!("Ignoring completion event without object");
        return false;
    }

    for output in outputs {
        let surface = if output.pipe.crtc_id() == object {
            &mut output.crtc.surface
        } else if output.pipe.plane_id() == object {
            &mut output.plane.surface
        } else {
            continue;
        };

        trace!("{} {object} completed, prior framebuffer {prior_fb}", surface.name());
        surface.retire_pending_event();

        if prior_fb == 0 {
            return true;
        }

        match surface.find_by_fb_id(prior_fb) {
            Some(buffer) => {
                if let Err(err) = surface.release(buffer) {
                    warn!("Unable to retire framebuffer {prior_fb}: {err}");
                }
            },
            None => debug!("No {} buffer for retired framebuffer {prior_fb}", surface.name()),
        }

        return true;
    }

    warn!("Completion event for unknown object {object}");
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DisplayBackend, FramebufferId};
    use crate::commit::{CommitBatcher, CommitOutcome};
    use crate::output::FrameOptions;
    use crate::pipe::PipeBinder;
    use crate::registry::ResourceRegistry;
    use crate::testing::{self, FakeAllocator, FakeBackend, NullRenderer};

    fn setup(backend: &FakeBackend) -> Vec<Output> {
        let mut registry = ResourceRegistry::new();
        let mut allocator = FakeAllocator::new();
        let pipe = PipeBinder::new(&backend.resources, &mut registry).bind("HDMI-A-1").unwrap();
        let mode = testing::mode(1920, 1080);
        let mut output = Output::new(backend, &mut allocator, pipe, mode, (960, 576)).unwrap();
        output.crtc.dirty_mode = false;
        output.crtc.dirty_cursor = false;
        vec![output]
    }

    /// Produce and commit one frame, returning the CRTC's new framebuffer.
    fn flip(outputs: &mut [Output], backend: &mut FakeBackend) -> FramebufferId {
        let mut renderer = NullRenderer::default();
        let options = FrameOptions { render: true, ..Default::default() };
        outputs[0].produce_frame(&mut renderer, options).unwrap();
        outputs[0].crtc.dirty = true;
        outputs[0].plane.dirty = true;

        let mut batcher = CommitBatcher::new();
        batcher.add_output(0, &mut outputs[0], backend).unwrap();
        assert_eq!(batcher.submit(outputs, backend), CommitOutcome::Applied);

        let (request, _) = backend.commits.last().unwrap();
        request.value(50, backend.property(50, "FB_ID")).unwrap() as FramebufferId
    }

    #[test]
    fn completion_retires_prior_buffer() {
        let mut backend = FakeBackend::dual_output();
        let mut outputs = setup(&backend);

        let first = flip(&mut outputs, &mut backend);
        let second = flip(&mut outputs, &mut backend);
        assert_ne!(first, second);
        assert_eq!(outputs[0].crtc.surface.pending_events(), 2);

        let event = CompletionEvent { object: 50, prior_fb: first };
        assert!(dispatch_completion(&mut outputs, event));

        let crtc = &outputs[0].crtc.surface;
        assert_eq!(crtc.pending_events(), 1);
        assert_eq!(crtc.find_by_fb_id(first), None);
        assert!(crtc.find_by_fb_id(second).is_some());

        // Repeated retirement of the same framebuffer only drops the event.
        assert!(dispatch_completion(&mut outputs, event));
        let crtc = &outputs[0].crtc.surface;
        assert_eq!(crtc.pending_events(), 0);
        assert!(crtc.find_by_fb_id(second).is_some());
    }

    #[test]
    fn first_flip_has_no_prior_buffer() {
        let mut backend = FakeBackend::dual_output();
        let mut outputs = setup(&backend);
        let fb_id = flip(&mut outputs, &mut backend);

        assert!(dispatch_completion(&mut outputs, CompletionEvent { object: 61, prior_fb: 0 }));

        assert_eq!(outputs[0].plane.surface.pending_events(), 0);
        assert_eq!(outputs[0].crtc.surface.pending_events(), 1);
        assert!(outputs[0].crtc.surface.find_by_fb_id(fb_id).is_some());
    }

    #[test]
    fn backend_events_reach_outputs() {
        let mut backend = FakeBackend::dual_output();
        let mut outputs = setup(&backend);
        let first = flip(&mut outputs, &mut backend);
        flip(&mut outputs, &mut backend);

        backend.complete(50, first);
        backend.complete(61, 0);
        let handled = backend
            .dispatch_events(&mut |event| {
                dispatch_completion(&mut outputs, event);
            })
            .unwrap();

        assert_eq!(handled, 2);
        assert_eq!(outputs[0].crtc.surface.pending_events(), 1);
        assert_eq!(outputs[0].plane.surface.pending_events(), 1);
    }

    #[test]
    fn foreign_objects_are_ignored() {
        let mut backend = FakeBackend::dual_output();
        let mut outputs = setup(&backend);
        flip(&mut outputs, &mut backend);

        assert!(!dispatch_completion(&mut outputs, CompletionEvent { object: 51, prior_fb: 0 }));
        assert!(!dispatch_completion(&mut outputs, CompletionEvent { object: 0, prior_fb: 0 }));
        assert_eq!(outputs[0].crtc.surface.pending_events(), 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "pending events underflow")]
    fn unexpected_completion_is_fatal() {
        let backend = FakeBackend::dual_output();
        let mut outputs = setup(&backend);

        dispatch_completion(&mut outputs, CompletionEvent { object: 50, prior_fb: 0 });
    }
}
