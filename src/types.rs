//! Shared geometry types used across modules.

use serde::{Deserialize, Serialize};

/// A rectangle representing geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Center X coordinate
    pub fn center_x(&self) -> i32 {
        self.x + (self.width as i32) / 2
    }

    /// Center Y coordinate
    pub fn center_y(&self) -> i32 {
        self.y + (self.height as i32) / 2
    }

    /// Whether `other` stacked directly against this rect forms an exact
    /// rectangle (same span on one axis, contiguous on the other).
    pub fn merges_with(&self, other: &Rect) -> bool {
        let same_column = self.x == other.x && self.width == other.width;
        let same_row = self.y == other.y && self.height == other.height;
        let vertical_neighbors = self.y + self.height as i32 == other.y
            || other.y + other.height as i32 == self.y;
        let horizontal_neighbors = self.x + self.width as i32 == other.x
            || other.x + other.width as i32 == self.x;
        (same_column && vertical_neighbors) || (same_row && horizontal_neighbors)
    }

    /// Bounding box of two rects. Only meaningful when `merges_with` holds.
    pub fn union(&self, other: &Rect) -> Rect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = (self.x + self.width as i32).max(other.x + other.width as i32);
        let bottom = (self.y + self.height as i32).max(other.y + other.height as i32);
        Rect::new(x, y, (right - x) as u32, (bottom - y) as u32)
    }
}

/// WM_NORMAL_HINTS constraints used when fitting a window to a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeHints {
    /// Minimum (width, height)
    pub min: Option<(u32, u32)>,
    /// Maximum (width, height)
    pub max: Option<(u32, u32)>,
    /// Resize increment (width, height)
    pub inc: Option<(u32, u32)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_center() {
        let rect = Rect::new(0, 0, 100, 100);
        assert_eq!(rect.center_x(), 50);
        assert_eq!(rect.center_y(), 50);

        let rect = Rect::new(10, 20, 100, 200);
        assert_eq!(rect.center_x(), 60);
        assert_eq!(rect.center_y(), 120);
    }

    #[test]
    fn test_merges_with_vertical_neighbors() {
        let top = Rect::new(0, 0, 100, 50);
        let bottom = Rect::new(0, 50, 100, 50);
        assert!(top.merges_with(&bottom));
        assert!(bottom.merges_with(&top));
        assert_eq!(top.union(&bottom), Rect::new(0, 0, 100, 100));
    }

    #[test]
    fn test_merges_with_rejects_disjoint() {
        let a = Rect::new(0, 0, 100, 50);
        let b = Rect::new(50, 50, 100, 50); // offset column
        assert!(!a.merges_with(&b));

        let c = Rect::new(0, 120, 100, 50); // gap between rows
        assert!(!a.merges_with(&c));
    }
}
