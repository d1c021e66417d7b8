//! The message bar and frame indicator.
//!
//! Only visibility and text are handled here; all actual drawing is a
//! single protocol action. Messages auto-hide when the bar timer fires,
//! unless the timeout is configured to zero or below.

use anyhow::Result;

use crate::conn::DisplayConn;
use crate::Wm;

/// Which screens currently show transient UI
#[derive(Default)]
pub struct BarState {
    /// Screen whose bar is visible, if any
    pub visible_on: Option<usize>,
    /// Screen whose frame indicator is visible, if any
    pub indicator_on: Option<usize>,
}

impl<C: DisplayConn> Wm<C> {
    /// Show a transient notification on a screen's bar and arm the
    /// auto-hide timer.
    pub fn marked_message(&mut self, screen: usize, text: &str) -> Result<()> {
        let bar = self.screens[screen].bar_window;
        let rect = self.screens[screen].rect;
        self.conn.map_window(bar)?;
        self.conn.raise_window(bar)?;
        self.conn.draw_message(bar, (rect.x, rect.y), text)?;
        self.conn.flush()?;
        self.bar.visible_on = Some(screen);
        self.timer.arm(self.config.bar.timeout);
        log::debug!("bar[{}]: {}", screen, text);
        Ok(())
    }

    pub fn hide_bar(&mut self, screen: usize) -> Result<()> {
        if self.bar.visible_on == Some(screen) {
            let bar = self.screens[screen].bar_window;
            self.conn.unmap_window(bar)?;
            self.bar.visible_on = None;
        }
        Ok(())
    }

    /// Show the frame indicator centered in the current frame.
    pub fn show_frame_indicator(&mut self, screen: usize) -> Result<()> {
        let indicator = self.screens[screen].frame_indicator;
        let rect = self.screens[screen].frames.current_frame().rect;
        self.conn.map_window(indicator)?;
        self.conn.raise_window(indicator)?;
        self.conn
            .draw_message(indicator, (rect.center_x(), rect.center_y()), "Current frame")?;
        self.conn.flush()?;
        self.bar.indicator_on = Some(screen);
        self.timer.arm(self.config.bar.timeout);
        Ok(())
    }

    pub fn hide_frame_indicator(&mut self, screen: usize) -> Result<()> {
        if self.bar.indicator_on == Some(screen) {
            let indicator = self.screens[screen].frame_indicator;
            self.conn.unmap_window(indicator)?;
            self.bar.indicator_on = None;
        }
        Ok(())
    }

    /// Hide the bar and frame indicator on one screen.
    pub fn hide_transient_ui(&mut self, screen: usize) -> Result<()> {
        self.hide_bar(screen)?;
        self.hide_frame_indicator(screen)?;
        Ok(())
    }

    /// Hide transient UI everywhere; runs when the bar timer fires.
    pub fn hide_transient_ui_everywhere(&mut self) -> Result<()> {
        for screen in 0..self.screens.len() {
            self.hide_transient_ui(screen)?;
        }
        Ok(())
    }
}
