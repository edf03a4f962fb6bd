//! Frame rendering.

use std::f32::consts::TAU;

use crate::backend::{BackendError, Canvas};
use crate::geometry::Region;
use crate::surface::Surface;

/// Stripe width of the primary surface pattern.
const STRIPE_WIDTH: f32 = 32.;

/// Rotation applied to the pattern per animated frame.
const ROTATION_STEP: f32 = TAU / 720.;

/// Phase shift applied to the pattern per animated frame.
const PHASE_STEP: f32 = 0.05;

/// Per-frame rendering options.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct RenderStyle {
    /// Use the colored overlay pattern.
    pub col: bool,
    /// Advance the pattern animation.
    pub anim: bool,
    /// Soften the pattern edges.
    pub blur: bool,
    /// Fill the surface with black.
    pub blank: bool,
}

/// Animation state of one surface's pattern.
#[derive(Copy, Clone, PartialEq, Default, Debug)]
pub struct RenderState {
    pub rot: f32,
    pub phase: f32,
}

impl RenderState {
    fn advance(&mut self) {
        self.rot = (self.rot + ROTATION_STEP) % TAU;
        self.phase = (self.phase + PHASE_STEP) % 1.;
    }
}

/// Rendering backend.
pub trait Renderer {
    /// Draw one frame into the surface's back buffer.
    fn render(&mut self, surface: &mut Surface, style: RenderStyle);

    /// Clear a rectangle of the surface's back buffer.
    fn clear_rect(&mut self, surface: &mut Surface, rect: Region);

    /// Turn the back buffer into the surface's front buffer.
    fn present(&mut self, surface: &mut Surface) -> Result<(), BackendError>;
}

/// Software renderer drawing animated test patterns.
#[derive(Default)]
pub struct PatternRenderer;

impl Renderer for PatternRenderer {
    #[cfg_attr(feature = "profiling", profiling::function)]
    fn render(&mut self, surface: &mut Surface, style: RenderStyle) {
        let mut state = surface.render_state;
        if style.anim {
            state.advance();
        }
        surface.render_state = state;

        let mut canvas = surface.queue_mut().back_buffer();
        if style.blank {
            canvas.pixels.fill(0);
        } else if style.col {
            draw_checkers(canvas, state, style.blur);
        } else {
            draw_stripes(canvas, state, style.blur);
        }
    }

    fn clear_rect(&mut self, surface: &mut Surface, rect: Region) {
        let mut canvas = surface.queue_mut().back_buffer();
        let bounds = Region::new(0, 0, canvas.width as i32, canvas.height as i32);
        let rect = match rect.intersect(&bounds) {
            Some(rect) => rect,
            None => return,
        };

        let stride = canvas.width as usize * 4;
        for y in rect.y1 as usize..rect.y2 as usize {
            let row = &mut canvas.pixels[y * stride..(y + 1) * stride];
            row[rect.x1 as usize * 4..rect.x2 as usize * 4].fill(0);
        }
    }

    fn present(&mut self, surface: &mut Surface) -> Result<(), BackendError> {
        surface.queue_mut().swap()
    }
}

/// Rotating grayscale stripes.
fn draw_stripes(canvas: Canvas<'_>, state: RenderState, blur: bool) {
    let (sin, cos) = state.rot.sin_cos();
    let offset = state.phase * STRIPE_WIDTH * 2.;

    fill(canvas, |x, y| {
        let t = (x * cos + y * sin + offset) / STRIPE_WIDTH;
        let value = if blur {
            0.5 + 0.5 * (t * TAU / 2.).sin()
        } else if t.floor() as i64 % 2 == 0 {
            1.
        } else {
            0.
        };

        let gray = (value * 255.) as u8;
        [gray, gray, gray]
    });
}

/// Scrolling colored checkerboard.
fn draw_checkers(canvas: Canvas<'_>, state: RenderState, blur: bool) {
    let size = STRIPE_WIDTH * 2.;
    let offset = state.phase * size * 2.;

    fill(canvas, |x, y| {
        let cell_x = ((x + offset) / size).floor() as i64;
        let cell_y = ((y + offset) / size).floor() as i64;
        let hue = ((cell_x + cell_y).rem_euclid(6)) as f32 / 6.;
        let [r, g, b] = hue_to_rgb(hue);

        if blur {
            [r / 2 + 64, g / 2 + 64, b / 2 + 64]
        } else {
            [r, g, b]
        }
    });
}

/// Write every pixel as little endian XRGB8888.
fn fill(mut canvas: Canvas<'_>, color: impl Fn(f32, f32) -> [u8; 3]) {
    let width = canvas.width as usize;
    if width == 0 {
        return;
    }

    for (y, row) in canvas.pixels.chunks_exact_mut(width * 4).enumerate() {
        for (x, pixel) in row.chunks_exact_mut(4).enumerate() {
            let [r, g, b] = color(x as f32, y as f32);
            pixel.copy_from_slice(&[b, g, r, 0xff]);
        }
    }
}

fn hue_to_rgb(hue: f32) -> [u8; 3] {
    let channel = |offset: f32| {
        let k = (offset + hue * 6.) % 6.;
        let value = 1. - k.min(4. - k).clamp(0., 1.);
        (value * 255.) as u8
    };
    [channel(5.), channel(3.), channel(1.)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canvas(pixels: &mut [u8], width: u32, height: u32) -> Canvas<'_> {
        Canvas { pixels, width, height }
    }

    #[test]
    fn stripes_alternate() {
        let mut pixels = vec![0; 128 * 4];
        draw_stripes(canvas(&mut pixels, 128, 1), RenderState::default(), false);

        assert_eq!(&pixels[0..4], &[255, 255, 255, 0xff]);
        assert_eq!(&pixels[32 * 4..33 * 4], &[0, 0, 0, 0xff]);
        assert_eq!(&pixels[64 * 4..65 * 4], &[255, 255, 255, 0xff]);
    }

    #[test]
    fn hues() {
        assert_eq!(hue_to_rgb(0.), [255, 0, 0]);
        assert_eq!(hue_to_rgb(1. / 3.), [0, 255, 0]);
        assert_eq!(hue_to_rgb(2. / 3.), [0, 0, 255]);
    }

    #[test]
    fn animation_wraps() {
        let mut state = RenderState { rot: TAU - ROTATION_STEP / 2., phase: 0.99 };
        state.advance();

        assert!(state.rot < ROTATION_STEP);
        assert!(state.phase < PHASE_STEP);
    }
}
