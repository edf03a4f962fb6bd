//! Rectangle and fixed-point helpers.

use std::cmp;
use std::fmt::{self, Display, Formatter};

/// Axis aligned rectangle spanning `x1..x2` and `y1..y2`.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct Region {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Region {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x1: x, y1: y, x2: x + width, y2: y + height }
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    /// Move the rectangle without changing its size.
    pub fn translate(&mut self, dx: i32, dy: i32) {
        self.x1 += dx;
        self.x2 += dx;
        self.y1 += dy;
        self.y2 += dy;
    }

    /// Resize the rectangle around its top left corner.
    ///
    /// Dimensions never shrink below `min`.
    pub fn resize(&mut self, dw: i32, dh: i32, min: i32) {
        self.x2 = self.x1 + cmp::max(self.width() + dw, min);
        self.y2 = self.y1 + cmp::max(self.height() + dh, min);
    }

    /// Convert integer coordinates to 16.16 fixed point.
    pub fn to_fixed(self) -> Self {
        Self { x1: self.x1 << 16, y1: self.y1 << 16, x2: self.x2 << 16, y2: self.y2 << 16 }
    }

    /// Intersection with another rectangle, `None` if they don't overlap.
    pub fn intersect(&self, other: &Region) -> Option<Region> {
        let region = Region {
            x1: cmp::max(self.x1, other.x1),
            y1: cmp::max(self.y1, other.y1),
            x2: cmp::min(self.x2, other.x2),
            y2: cmp::min(self.y2, other.y2),
        };

        (region.width() > 0 && region.height() > 0).then_some(region)
    }
}

impl Display for Region {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width(), self.height(), self.x1, self.y1)
    }
}

/// Display adapter for 16.16 fixed point values.
#[derive(Copy, Clone, Debug)]
pub struct Fixed(pub u32);

impl Display for Fixed {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let fraction = ((self.0 & 0xffff) as u64 * 15625) >> 10;
        write!(f, "{}.{:06}", self.0 >> 16, fraction)
    }
}

/// Display adapter for rectangles in 16.16 fixed point.
#[derive(Copy, Clone, Debug)]
pub struct FixedRegion(pub Region);

impl Display for FixedRegion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let Region { x1, y1, .. } = self.0;
        let (width, height) = (self.0.width(), self.0.height());
        write!(
            f,
            "{}x{}+{}+{}",
            Fixed(width as u32),
            Fixed(height as u32),
            Fixed(x1 as u32),
            Fixed(y1 as u32)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_point_formatting() {
        assert_eq!(Fixed(960 << 16).to_string(), "960.000000");
        assert_eq!(Fixed((1 << 16) | 0x8000).to_string(), "1.500000");
        assert_eq!(Fixed(0x4000).to_string(), "0.250000");

        let region = Region::new(0, 0, 960, 576).to_fixed();
        assert_eq!(FixedRegion(region).to_string(), "960.000000x576.000000+0.000000+0.000000");
    }

    #[test]
    fn resize_is_clamped() {
        let mut region = Region::new(10, 20, 8, 8);
        region.resize(-10, 4, 4);
        assert_eq!(region, Region::new(10, 20, 4, 12));

        region.translate(-10, 5);
        assert_eq!(region.to_string(), "4x12+0+25");
    }

    #[test]
    fn intersection() {
        let region = Region::new(0, 0, 100, 100);
        let overlap = region.intersect(&Region::new(50, 50, 100, 100));
        assert_eq!(overlap, Some(Region::new(50, 50, 50, 50)));
        assert_eq!(region.intersect(&Region::new(100, 0, 10, 10)), None);
    }
}
