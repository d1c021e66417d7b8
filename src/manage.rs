//! The window-lifecycle state machine.
//!
//! Transitions between Withdrawn, Iconic and Normal, the frame-reassignment
//! algorithm that keeps one window visible per frame, rudeness-policy
//! promotion, and the per-field configure grant.

use anyhow::Result;

use crate::conn::{
    ConfigureRequest, DisplayConn, IcccmState, PropertyKind, StackDirective, WindowHandle,
};
use crate::frames::FrameId;
use crate::tracing::Transition;
use crate::types::{Rect, SizeHints};
use crate::window::WindowState;
use crate::Wm;

/// Which path asked for a window to be promoted to active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoteVia {
    /// A map request on an already-managed window
    Map,
    /// A raise request (configure stacking, iconify replacement)
    Raise,
}

/// Fit a window into a frame: fill the frame minus borders, clamped to the
/// window's maximum size and snapped to its resize increments. Uses the
/// minimum size as the increment base.
pub fn fitted_geometry(frame: Rect, hints: &SizeHints, border: u32) -> Rect {
    let mut width = frame.width.saturating_sub(border * 2).max(1);
    let mut height = frame.height.saturating_sub(border * 2).max(1);
    if let Some((max_w, max_h)) = hints.max {
        width = width.min(max_w);
        height = height.min(max_h);
    }
    if let Some((inc_w, inc_h)) = hints.inc {
        let (base_w, base_h) = hints.min.unwrap_or((0, 0));
        if inc_w > 1 && width > base_w {
            width -= (width - base_w) % inc_w;
        }
        if inc_h > 1 && height > base_h {
            height -= (height - base_h) % inc_h;
        }
    }
    if let Some((min_w, min_h)) = hints.min {
        width = width.max(min_w);
        height = height.max(min_h);
    }
    Rect::new(frame.x, frame.y, width, height)
}

impl<C: DisplayConn> Wm<C> {
    pub fn screen_of_root(&self, root: WindowHandle) -> Option<usize> {
        self.screens.iter().position(|s| s.root == root)
    }

    fn bump_access(&mut self) -> u64 {
        self.access_counter += 1;
        self.access_counter
    }

    /// First transition out of Withdrawn: read the client's properties,
    /// assign a number, start listening. The window enters Iconic; the
    /// caller decides whether it also becomes active.
    pub fn manage(&mut self, window: WindowHandle) -> Result<()> {
        let name = self.conn.window_name(window);
        let hints = self.conn.size_hints(window);
        let transient = self.conn.transient_for(window);
        let geometry = self.conn.window_geometry(window);
        let number = self.registry.allocate_number();

        let Some(record) = self.registry.find_mut(window) else {
            self.registry.release_number(number);
            return Ok(());
        };
        if let Some(name) = name {
            record.name = name;
        }
        record.hints = hints;
        record.transient_for = transient;
        if let Some((rect, border)) = geometry {
            record.geometry = rect;
            record.border_width = border;
        }
        record.number = Some(number);
        record.state = WindowState::Iconic;
        self.registry.resolve_display_names();

        self.conn.select_client_events(window)?;
        self.conn.grab_prefix_key(window, self.keys.prefix)?;
        self.tracer.trace(Transition::WindowManaged { window, number });
        log::info!("Managing window 0x{:x} as number {}", window, number);
        Ok(())
    }

    pub fn on_map_request(&mut self, window: WindowHandle) -> Result<()> {
        let Some(state) = self.registry.find(window).map(|r| r.state) else {
            // Not a window we manage: grant the map directly
            log::debug!("Granting map for unmanaged window 0x{:x}", window);
            self.conn.map_window(window)?;
            self.conn.flush()?;
            return Ok(());
        };
        match state {
            WindowState::Withdrawn => {
                self.manage(window)?;
                self.set_active_window(window)?;
            }
            WindowState::Iconic | WindowState::Normal => {
                self.promote_or_notify(window, PromoteVia::Map)?;
            }
        }
        Ok(())
    }

    /// The rudeness decision: promote the window to active, or emit a
    /// non-intrusive notification and leave state untouched. The four policy
    /// flags are consulted independently.
    pub fn promote_or_notify(&mut self, window: WindowHandle, via: PromoteVia) -> Result<()> {
        let Some(record) = self.registry.find(window) else {
            return Ok(());
        };
        let screen = record.screen;
        let transient = record.is_transient();
        let never_focused = record.last_access == 0;
        let number = record.number;

        let policy = &self.config.policy;
        let (map_ok, raise_ok) = if transient {
            (policy.honour_transient_map, policy.honour_transient_raise)
        } else {
            (policy.honour_normal_map, policy.honour_normal_raise)
        };
        let promote = match via {
            PromoteVia::Map => (never_focused && map_ok) || raise_ok,
            PromoteVia::Raise => raise_ok,
        };
        if promote {
            self.set_active_window(window)?;
        } else {
            let label = number
                .map(|n| n.to_string())
                .unwrap_or_else(|| format!("0x{:x}", window));
            let text = format!("Window {} wants to raise", label);
            self.marked_message(screen, &text)?;
        }
        Ok(())
    }

    /// Make a window the active one: bind it into a frame (its own if it is
    /// already on display, the current frame otherwise), fit, map, focus,
    /// install its colormap, and hide whatever else was sharing visibility.
    pub fn set_active_window(&mut self, window: WindowHandle) -> Result<()> {
        let Some(record) = self.registry.find(window) else {
            return Ok(());
        };
        let screen = record.screen;
        let previous = self.current_window;

        let frames = &mut self.screens[screen].frames;
        let frame = match frames.find_showing(window) {
            Some(f) => f,
            None => {
                let f = frames.current;
                frames.get_mut(f).unwrap().window = Some(window);
                f
            }
        };
        frames.current = frame;
        let frame_rect = frames.get(frame).unwrap().rect;

        self.unhide_window(window, frame_rect)?;
        self.conn.raise_window(window)?;
        self.conn.set_input_focus(window)?;
        self.conn.begin_ignore_errors();
        self.conn.install_colormap(window)?;
        self.conn.end_ignore_errors();

        if !self.shares_visibility(window) {
            self.hide_unframed_except(screen, &[window])?;
        }

        let stamp = self.bump_access();
        if let Some(record) = self.registry.find_mut(window) {
            record.last_access = stamp;
        }
        self.current_screen = screen;
        self.current_window = Some(window);
        if previous != Some(window) {
            self.tracer.trace(Transition::FocusChanged { from: previous, to: window });
        }
        self.conn.flush()?;
        Ok(())
    }

    /// Transients never push other windows off screen; under policy the
    /// same goes for windows whose maximum size stays below the screen.
    fn shares_visibility(&self, window: WindowHandle) -> bool {
        let Some(record) = self.registry.find(window) else {
            return false;
        };
        if record.is_transient() {
            return true;
        }
        if self.config.policy.undersized_windows_share {
            if let Some((max_w, max_h)) = record.hints.max {
                let screen = self.screens[record.screen].rect;
                if max_w < screen.width && max_h < screen.height {
                    return true;
                }
            }
        }
        false
    }

    /// Hide every Normal window on `screen` that no frame displays, except
    /// those listed.
    fn hide_unframed_except(&mut self, screen: usize, keep: &[WindowHandle]) -> Result<()> {
        let to_hide: Vec<WindowHandle> = self
            .registry
            .iter()
            .filter(|r| {
                r.screen == screen
                    && r.state == WindowState::Normal
                    && !keep.contains(&r.handle)
            })
            .filter(|r| self.screens[screen].frames.find_showing(r.handle).is_none())
            .map(|r| r.handle)
            .collect();
        for window in to_hide {
            self.hide_window(window)?;
        }
        Ok(())
    }

    /// Normal -> Iconic: unmap and mark iconic. The window keeps its number.
    pub fn hide_window(&mut self, window: WindowHandle) -> Result<()> {
        let Some(record) = self.registry.find_mut(window) else {
            return Ok(());
        };
        if record.state != WindowState::Normal {
            return Ok(());
        }
        record.state = WindowState::Iconic;
        self.conn.begin_ignore_errors();
        self.conn.unmap_window(window)?;
        self.conn.set_icccm_state(window, IcccmState::Iconic)?;
        self.conn.end_ignore_errors();
        Ok(())
    }

    /// Iconic -> Normal: fit to the frame, map, mark normal.
    fn unhide_window(&mut self, window: WindowHandle, frame_rect: Rect) -> Result<()> {
        let Some(record) = self.registry.find(window) else {
            return Ok(());
        };
        let fitted = fitted_geometry(frame_rect, &record.hints, record.border_width);
        let border = record.border_width;
        self.conn.configure_window(window, fitted, border)?;
        self.conn.map_window(window)?;
        self.conn.set_icccm_state(window, IcccmState::Normal)?;
        if let Some(record) = self.registry.find_mut(window) {
            record.state = WindowState::Normal;
            record.geometry = fitted;
        }
        Ok(())
    }

    /// Re-fit a frame's occupant after the frame's rectangle changed.
    pub(crate) fn refit_frame_occupant(&mut self, screen: usize, frame: FrameId) -> Result<()> {
        let Some(window) = self.screens[screen].frames.get(frame).and_then(|f| f.window) else {
            return Ok(());
        };
        let rect = self.screens[screen].frames.get(frame).unwrap().rect;
        self.unhide_window(window, rect)
    }

    /// Reassign a frame whose window is leaving management: bind some other
    /// known window into it, or leave it empty. Idempotent on an
    /// already-empty frame.
    pub fn cleanup_frame(&mut self, screen: usize, frame: FrameId) -> Result<()> {
        let departing = match self.screens[screen].frames.get_mut(frame) {
            Some(f) => match f.window.take() {
                Some(w) => w,
                None => return Ok(()),
            },
            None => return Ok(()),
        };

        // First mapped window not already on display, in registry order
        let replacement = self
            .registry
            .iter()
            .filter(|r| r.screen == screen && r.state.is_mapped() && r.handle != departing)
            .find(|r| self.screens[screen].frames.find_showing(r.handle).is_none())
            .map(|r| r.handle);

        let was_current = self.screens[screen].frames.current == frame;
        match replacement {
            None => {
                log::debug!("Frame left empty after 0x{:x} departed", departing);
                self.tracer.trace(Transition::FrameReassigned { window: None });
            }
            Some(window) => {
                self.screens[screen].frames.get_mut(frame).unwrap().window = Some(window);
                let rect = self.screens[screen].frames.get(frame).unwrap().rect;
                self.unhide_window(window, rect)?;
                if !self.shares_visibility(window) {
                    self.hide_unframed_except(screen, &[window, departing])?;
                }
                self.tracer.trace(Transition::FrameReassigned { window: Some(window) });
            }
        }
        if was_current {
            // Re-affirm focus locality on the reassigned frame
            self.screens[screen].frames.current = frame;
        }
        Ok(())
    }

    /// An honored top-level unmap: run frame cleanup while the window still
    /// counts as Normal, then withdraw it.
    pub fn on_unmap(&mut self, window: WindowHandle) -> Result<()> {
        let Some(record) = self.registry.find(window) else {
            return Ok(());
        };
        let (screen, state) = (record.screen, record.state);
        if state == WindowState::Withdrawn {
            return Ok(());
        }
        if state == WindowState::Normal {
            if let Some(frame) = self.screens[screen].frames.find_showing(window) {
                self.cleanup_frame(screen, frame)?;
            }
        }
        self.withdraw(window)?;
        if self.current_window == Some(window) {
            self.current_window = None;
            self.switch_to_last_window()?;
        }
        Ok(())
    }

    /// Mapped -> Withdrawn: the number goes back to the pool; the record
    /// stays until destruction.
    fn withdraw(&mut self, window: WindowHandle) -> Result<()> {
        let number = {
            let Some(record) = self.registry.find_mut(window) else {
                return Ok(());
            };
            record.state = WindowState::Withdrawn;
            record.number.take()
        };
        if let Some(n) = number {
            self.registry.release_number(n);
        }
        self.registry.resolve_display_names();
        self.conn.begin_ignore_errors();
        self.conn.set_icccm_state(window, IcccmState::Withdrawn)?;
        self.conn.end_ignore_errors();
        self.tracer.trace(Transition::WindowWithdrawn { window });
        log::info!("Window 0x{:x} withdrawn", window);
        Ok(())
    }

    /// Destruction: frame cleanup, then drop the record from every index.
    /// Focus restoration is the dispatcher's business (it coalesces bursts).
    pub fn unmanage(&mut self, window: WindowHandle) -> Result<()> {
        let Some(record) = self.registry.find(window) else {
            return Ok(());
        };
        let screen = record.screen;
        if let Some(frame) = self.screens[screen].frames.find_showing(window) {
            self.cleanup_frame(screen, frame)?;
        }
        if self.current_window == Some(window) {
            self.current_window = None;
        }
        self.registry.destroy(window);
        self.registry.resolve_display_names();
        self.tracer.trace(Transition::WindowDestroyed { window });
        log::info!("Unmanaged destroyed window 0x{:x}", window);
        Ok(())
    }

    /// Activate the most recently accessed mapped window other than the
    /// current one. Returns false when there is nothing to switch to.
    pub fn switch_to_last_window(&mut self) -> Result<bool> {
        let pick = self
            .registry
            .mapped()
            .filter(|r| Some(r.handle) != self.current_window)
            .max_by_key(|r| r.last_access)
            .map(|r| r.handle);
        match pick {
            Some(window) => {
                self.set_active_window(window)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Grant a configure request field by field: anything absent from the
    /// request's mask keeps the cached value. The client always hears the
    /// granted geometry via a synthetic notify before it is applied.
    pub fn on_configure_request(&mut self, req: ConfigureRequest) -> Result<()> {
        let Some(record) = self.registry.find(req.window) else {
            self.conn.apply_configure(&req)?;
            self.conn.flush()?;
            return Ok(());
        };
        let cached = record.geometry;
        let cached_border = record.border_width;
        let state = record.state;

        let granted = Rect::new(
            req.x.unwrap_or(cached.x),
            req.y.unwrap_or(cached.y),
            req.width.unwrap_or(cached.width),
            req.height.unwrap_or(cached.height),
        );
        let border = req.border_width.unwrap_or(cached_border);

        if state == WindowState::Normal {
            match req.stack {
                Some(StackDirective::Above) => {
                    self.promote_or_notify(req.window, PromoteVia::Raise)?;
                }
                Some(StackDirective::Below) if self.current_window == Some(req.window) => {
                    self.switch_to_last_window()?;
                }
                _ => {}
            }
        }

        self.conn.send_configure_notify(req.window, granted, border)?;
        self.conn.configure_window(req.window, granted, border)?;
        self.conn.flush()?;
        if let Some(record) = self.registry.find_mut(req.window) {
            record.geometry = granted;
            record.border_width = border;
        }
        Ok(())
    }

    /// The layer reported geometry actually changed: refresh the cache
    /// first, then re-run the fit (increment-aware fitting needs the real
    /// current size as input).
    pub fn on_geometry_changed(
        &mut self,
        window: WindowHandle,
        rect: Rect,
        border_width: u32,
    ) -> Result<()> {
        let Some(record) = self.registry.find_mut(window) else {
            return Ok(());
        };
        if record.state != WindowState::Normal {
            return Ok(());
        }
        if record.geometry == rect && record.border_width == border_width {
            return Ok(());
        }
        record.geometry = rect;
        record.border_width = border_width;
        let screen = record.screen;

        if let Some(frame) = self.screens[screen].frames.find_showing(window) {
            let frame_rect = self.screens[screen].frames.get(frame).unwrap().rect;
            let record = self.registry.find(window).unwrap();
            let fitted = fitted_geometry(frame_rect, &record.hints, record.border_width);
            if fitted != rect {
                let border = record.border_width;
                self.conn.configure_window(window, fitted, border)?;
                self.conn.flush()?;
                if let Some(record) = self.registry.find_mut(window) {
                    record.geometry = fitted;
                }
            }
        }
        Ok(())
    }

    pub fn on_property_changed(
        &mut self,
        window: WindowHandle,
        kind: PropertyKind,
        deleted: bool,
    ) -> Result<()> {
        if kind == PropertyKind::CommandRequest {
            // Only a new value signals requests; unsets are not requests
            if !deleted {
                if let Some(screen) = self.screen_of_root(window) {
                    self.drain_command_requests(screen)?;
                }
            }
            return Ok(());
        }
        if !self.registry.contains(window) {
            return Ok(());
        }
        match kind {
            PropertyKind::Name => {
                if let Some(name) = self.conn.window_name(window) {
                    let changed = match self.registry.find_mut(window) {
                        Some(record) if record.name != name => {
                            record.name = name;
                            true
                        }
                        _ => false,
                    };
                    if changed {
                        self.registry.resolve_display_names();
                    }
                }
            }
            PropertyKind::NormalHints => {
                let hints = self.conn.size_hints(window);
                if let Some(record) = self.registry.find_mut(window) {
                    record.hints = hints;
                }
            }
            PropertyKind::TransientFor => {
                let transient = self.conn.transient_for(window);
                if let Some(record) = self.registry.find_mut(window) {
                    record.transient_for = transient;
                }
            }
            PropertyKind::CommandRequest | PropertyKind::Other => {}
        }
        Ok(())
    }

    /// A client asked to be iconified. Its frame gets a replacement (or goes
    /// blank); the sender's own state is left for its follow-up unmap.
    pub fn on_iconify(&mut self, window: WindowHandle) -> Result<()> {
        let Some(record) = self.registry.find(window) else {
            return Ok(());
        };
        if record.state != WindowState::Normal {
            return Ok(());
        }
        let screen = record.screen;
        let Some(frame) = self.screens[screen].frames.find_showing(window) else {
            return Ok(());
        };
        self.cleanup_frame(screen, frame)?;
        let replacement = self.screens[screen].frames.get(frame).and_then(|f| f.window);
        match replacement {
            Some(next) if self.screens[screen].frames.current == frame => {
                self.set_active_window(next)?;
            }
            _ => {
                if self.current_window == Some(window) {
                    self.current_window = None;
                }
            }
        }
        Ok(())
    }

    pub fn on_colormap_changed(&mut self, window: WindowHandle, is_new: bool) -> Result<()> {
        // Best-effort re-install for the active window; the window may be
        // mid-destruction, so permission errors are expected here.
        if is_new && self.current_window == Some(window) {
            self.conn.begin_ignore_errors();
            self.conn.install_colormap(window)?;
            self.conn.end_ignore_errors();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fitted_geometry_fills_frame() {
        let frame = Rect::new(10, 20, 400, 300);
        let fitted = fitted_geometry(frame, &SizeHints::default(), 2);
        assert_eq!(fitted, Rect::new(10, 20, 396, 296));
    }

    #[test]
    fn test_fitted_geometry_clamps_to_max() {
        let frame = Rect::new(0, 0, 800, 600);
        let hints = SizeHints { max: Some((500, 400)), ..Default::default() };
        let fitted = fitted_geometry(frame, &hints, 0);
        assert_eq!(fitted, Rect::new(0, 0, 500, 400));
    }

    #[test]
    fn test_fitted_geometry_snaps_to_increments() {
        let frame = Rect::new(0, 0, 805, 605);
        let hints = SizeHints {
            min: Some((20, 10)),
            inc: Some((10, 15)),
            ..Default::default()
        };
        let fitted = fitted_geometry(frame, &hints, 0);
        // width: 805 -> (805-20) % 10 == 5 -> 800; height: 605 -> (605-10) % 15 == 10 -> 595
        assert_eq!(fitted, Rect::new(0, 0, 800, 595));
    }

    #[test]
    fn test_fitted_geometry_respects_min() {
        let frame = Rect::new(0, 0, 50, 40);
        let hints = SizeHints { min: Some((100, 80)), ..Default::default() };
        let fitted = fitted_geometry(frame, &hints, 0);
        assert_eq!(fitted, Rect::new(0, 0, 100, 80));
    }
}
