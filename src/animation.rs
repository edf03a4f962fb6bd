//! Overlay plane animation.

use std::cmp;
use std::f32::consts::{PI, TAU};

use rand::Rng;
use serde::Deserialize;

use crate::geometry::Region;

/// Smallest width and height of an animated overlay.
pub const MIN_SIZE: i32 = 4;

/// Number of frames for one full orbit.
const ORBIT_STEPS: f32 = 1000.;

/// Overlay movement pattern.
#[derive(Deserialize, Copy, Clone, PartialEq, Eq, Default, Debug)]
#[serde(rename_all = "snake_case")]
pub enum AnimMode {
    /// Orbiting and pulsating rectangle.
    #[default]
    Curve,
    /// New random position and size every frame.
    Random,
    /// Keep the current rectangle.
    Static,
}

impl AnimMode {
    /// Next mode in the cycle.
    pub fn next(self) -> Self {
        match self {
            Self::Curve => Self::Random,
            Self::Random => Self::Static,
            Self::Static => Self::Curve,
        }
    }
}

/// Orbit state of the curve animation.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct AnimState {
    angle: f32,
    radius: f32,
    radius_dir: f32,
    width: i32,
    width_dir: i32,
    height: i32,
    height_dir: i32,
}

impl Default for AnimState {
    fn default() -> Self {
        Self {
            radius_dir: 1.,
            width_dir: 1,
            height_dir: 1,
            angle: Default::default(),
            radius: Default::default(),
            width: Default::default(),
            height: Default::default(),
        }
    }
}

impl AnimState {
    /// Compute the next overlay destination rectangle.
    pub fn step(
        &mut self,
        mode: AnimMode,
        display: (u32, u32),
        current: Region,
        rng: &mut impl Rng,
    ) -> Region {
        let (display_width, display_height) = (display.0 as i32, display.1 as i32);

        match mode {
            AnimMode::Curve => {
                let radius = self.adjust_radius(display_width, display_height);
                let angle = self.adjust_angle();
                let width = cmp::max(self.adjust_width(display_width), MIN_SIZE);
                let height = cmp::max(self.adjust_height(display_height), MIN_SIZE);

                let x = (radius * angle.sin()) as i32 + display_width / 2 - width / 2;
                let y = (radius * angle.cos()) as i32 + display_height / 2 - height / 2;
                Region::new(x, y, width, height)
            },
            AnimMode::Random => {
                let width = cmp::max(rng.gen_range(0..cmp::max(display_width / 2, 1)), MIN_SIZE);
                let height = cmp::max(rng.gen_range(0..cmp::max(display_height / 2, 1)), MIN_SIZE);

                let x = rng.gen_range(0..cmp::max(display_width - 16, 1)) + 8 - width / 2;
                let y = rng.gen_range(0..cmp::max(display_height - 16, 1)) + 8 - height / 2;
                Region::new(x, y, width, height)
            },
            AnimMode::Static => current,
        }
    }

    fn adjust_angle(&mut self) -> f32 {
        self.angle += PI / (ORBIT_STEPS / 2.);
        if self.angle > TAU {
            self.angle -= TAU;
        }
        self.angle
    }

    fn adjust_radius(&mut self, display_width: i32, display_height: i32) -> f32 {
        let diagonal = (display_width * display_width + display_height * display_height) as f32;
        let max = diagonal.sqrt() / 2.;

        self.radius += max / (ORBIT_STEPS / 2.) * self.radius_dir;
        if (self.radius > max && self.radius_dir > 0.)
            || (self.radius < -max && self.radius_dir < 0.)
        {
            self.radius_dir = -self.radius_dir;
        }
        self.radius
    }

    fn adjust_width(&mut self, max: i32) -> i32 {
        bounce(&mut self.width, &mut self.width_dir, max)
    }

    fn adjust_height(&mut self, max: i32) -> i32 {
        bounce(&mut self.height, &mut self.height_dir, max)
    }
}

/// Move `value` one step, reversing direction at `0` and `max`.
fn bounce(value: &mut i32, dir: &mut i32, max: i32) -> i32 {
    *value += *dir;
    if *value > max && *dir > 0 {
        *dir = -*dir;
    } else if *value < 0 && *dir < 0 {
        *value = 0;
        *dir = -*dir;
    }
    *value
}
