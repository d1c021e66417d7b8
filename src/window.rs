//! The managed-window record and its lifecycle states.

use serde::{Deserialize, Serialize};

use crate::conn::WindowHandle;
use crate::types::{Rect, SizeHints};

/// Window lifecycle states, mirroring the ICCCM state vocabulary.
///
/// ```text
///              first map request
///                     │
///                     ▼
/// ┌───────────┐  manage   ┌────────┐  activate  ┌────────┐
/// │ Withdrawn │ ─────────►│ Iconic │ ◄─────────►│ Normal │
/// └───────────┘           └────────┘    hide    └────────┘
///       ▲                      │                     │
///       └──────────────────────┴─────────────────────┘
///                     unmap (withdrawal)
/// ```
///
/// Destruction removes the window regardless of state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowState {
    /// Known but unmanaged; holds no number
    Withdrawn,
    /// Managed but not shown in any frame
    Iconic,
    /// Managed and shown in a frame
    Normal,
}

impl WindowState {
    /// Mapped windows (Iconic or Normal) hold a number and appear in the
    /// window list.
    pub fn is_mapped(self) -> bool {
        !matches!(self, WindowState::Withdrawn)
    }
}

/// One client top-level surface.
#[derive(Debug, Clone)]
pub struct WindowRecord {
    pub handle: WindowHandle,
    /// Owning screen index, read-only after creation
    pub screen: usize,
    pub state: WindowState,
    /// User-visible label; held only while mapped
    pub number: Option<u32>,
    pub name: String,
    /// Name disambiguated against duplicate titles
    pub display_name: String,
    /// Last granted geometry; authoritative only between a granted
    /// configure and the next request
    pub geometry: Rect,
    pub border_width: u32,
    pub hints: SizeHints,
    pub transient_for: Option<WindowHandle>,
    /// Access stamp; zero means the window has never been focused
    pub last_access: u64,
}

impl WindowRecord {
    pub fn new(handle: WindowHandle, screen: usize) -> Self {
        let name = format!("0x{:x}", handle);
        Self {
            handle,
            screen,
            state: WindowState::Withdrawn,
            number: None,
            display_name: name.clone(),
            name,
            geometry: Rect::new(0, 0, 1, 1),
            border_width: 0,
            hints: SizeHints::default(),
            transient_for: None,
            last_access: 0,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.transient_for.is_some()
    }
}
