//! The frame table: a screen's partition into rectangular frames.
//!
//! Frames are stored in a slotmap arena; a frame's binding to a window is a
//! plain non-owning handle, and the current-frame pointer is a key into the
//! arena, so nothing here participates in ownership cycles. A screen always
//! has at least one frame, and an empty frame is a valid observable state.

use slotmap::{new_key_type, SlotMap};

use crate::conn::WindowHandle;
use crate::types::Rect;

new_key_type! {
    pub struct FrameId;
}

/// Direction of a frame split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitDirection {
    /// Side by side (split along a vertical line)
    Horizontal,
    /// Stacked (split along a horizontal line)
    Vertical,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub rect: Rect,
    /// The window shown in this frame, if any
    pub window: Option<WindowHandle>,
}

pub struct FrameTable {
    frames: SlotMap<FrameId, Frame>,
    pub current: FrameId,
}

impl FrameTable {
    /// Start with a single frame covering the whole screen.
    pub fn new(rect: Rect) -> Self {
        let mut frames = SlotMap::with_key();
        let current = frames.insert(Frame { rect, window: None });
        Self { frames, current }
    }

    pub fn get(&self, id: FrameId) -> Option<&Frame> {
        self.frames.get(id)
    }

    pub fn get_mut(&mut self, id: FrameId) -> Option<&mut Frame> {
        self.frames.get_mut(id)
    }

    pub fn current_frame(&self) -> &Frame {
        &self.frames[self.current]
    }

    pub fn current_frame_mut(&mut self) -> &mut Frame {
        &mut self.frames[self.current]
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FrameId, &Frame)> {
        self.frames.iter()
    }

    /// The frame currently displaying `window`, if any. At most one exists.
    pub fn find_showing(&self, window: WindowHandle) -> Option<FrameId> {
        self.frames
            .iter()
            .find(|(_, f)| f.window == Some(window))
            .map(|(id, _)| id)
    }

    /// Split a frame in half. The original keeps the first half (and its
    /// window); the new, empty frame gets the second half and is returned.
    pub fn split(&mut self, id: FrameId, direction: SplitDirection) -> Option<FrameId> {
        let rect = self.frames.get(id)?.rect;
        let (kept, fresh) = match direction {
            SplitDirection::Horizontal => {
                let left = rect.width / 2;
                (
                    Rect::new(rect.x, rect.y, left, rect.height),
                    Rect::new(rect.x + left as i32, rect.y, rect.width - left, rect.height),
                )
            }
            SplitDirection::Vertical => {
                let top = rect.height / 2;
                (
                    Rect::new(rect.x, rect.y, rect.width, top),
                    Rect::new(rect.x, rect.y + top as i32, rect.width, rect.height - top),
                )
            }
        };
        self.frames[id].rect = kept;
        Some(self.frames.insert(Frame { rect: fresh, window: None }))
    }

    /// Remove a frame, merging its area into an adjoining frame whose union
    /// with it forms an exact rectangle. Refuses to remove the last frame or
    /// one with no such neighbor. Returns the absorbing frame.
    pub fn remove(&mut self, id: FrameId) -> Option<FrameId> {
        if self.frames.len() <= 1 {
            return None;
        }
        let rect = self.frames.get(id)?.rect;
        let neighbor = self
            .frames
            .iter()
            .find(|(other, f)| *other != id && f.rect.merges_with(&rect))
            .map(|(other, _)| other)?;

        let merged = self.frames[neighbor].rect.union(&rect);
        self.frames[neighbor].rect = merged;
        self.frames.remove(id);
        if self.current == id {
            self.current = neighbor;
        }
        Some(neighbor)
    }

    /// Collapse to a single frame covering `rect`, keeping the current
    /// frame's binding. Returns the removed frames' windows.
    pub fn only(&mut self, rect: Rect) -> Vec<WindowHandle> {
        let current = self.current;
        let displaced: Vec<WindowHandle> = self
            .frames
            .iter()
            .filter(|(id, _)| *id != current)
            .filter_map(|(_, f)| f.window)
            .collect();
        self.frames.retain(|id, _| id == current);
        self.frames[current].rect = rect;
        displaced
    }

    /// The frame after `id` in arena order, wrapping around.
    pub fn next_frame(&self, id: FrameId) -> FrameId {
        let ids: Vec<FrameId> = self.frames.keys().collect();
        let pos = ids.iter().position(|&f| f == id).unwrap_or(0);
        ids[(pos + 1) % ids.len()]
    }
}
