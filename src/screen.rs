//! Per-screen state: root, helper windows, cached geometry, frame table.

use crate::conn::{ScreenHandles, WindowHandle};
use crate::frames::FrameTable;
use crate::types::Rect;

/// One display output. The helper windows are the manager's own surfaces
/// (key-event sink, message bar, input line, frame indicator, help overlay)
/// and must never be managed.
pub struct Screen {
    pub root: WindowHandle,
    pub key_window: WindowHandle,
    pub bar_window: WindowHandle,
    pub input_window: WindowHandle,
    pub frame_indicator: WindowHandle,
    pub help_window: WindowHandle,
    /// Cached root geometry
    pub rect: Rect,
    pub frames: FrameTable,
}

impl Screen {
    pub fn from_handles(handles: ScreenHandles) -> Self {
        Self {
            root: handles.root,
            key_window: handles.key_window,
            bar_window: handles.bar_window,
            input_window: handles.input_window,
            frame_indicator: handles.frame_indicator,
            help_window: handles.help_window,
            rect: handles.rect,
            frames: FrameTable::new(handles.rect),
        }
    }

    /// True for windows that belong to the manager itself.
    pub fn is_helper(&self, window: WindowHandle) -> bool {
        window == self.key_window
            || window == self.bar_window
            || window == self.input_window
            || window == self.frame_indicator
            || window == self.help_window
    }
}
