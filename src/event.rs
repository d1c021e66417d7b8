//! Event dispatch.
//!
//! The single entry point mapping each inbound event to its handler. The
//! only stateful subtlety lives here: bursts of destroy notifications are
//! drained before the manager re-settles on a current window, so a cascade
//! of closing windows causes exactly one focus restoration.

use anyhow::Result;

use crate::conn::{DisplayConn, WindowHandle, WmEvent};
use crate::types::Rect;
use crate::Wm;

impl<C: DisplayConn> Wm<C> {
    /// Handle one event. Runs to completion; the only suspension point in
    /// the manager is the top-level wait in the main loop.
    pub fn dispatch(&mut self, event: WmEvent) -> Result<()> {
        match event {
            WmEvent::WindowCreated { window, parent, override_redirect } => {
                self.on_created(window, parent, override_redirect)
            }
            WmEvent::WindowDestroyed { window } => self.on_destroy(window),
            WmEvent::MapRequest { window } => self.on_map_request(window),
            WmEvent::MapCompleted { window } => {
                log::debug!("Map completed for 0x{:x}", window);
                Ok(())
            }
            WmEvent::Unmap { window, event, synthetic } => {
                // Honor genuine top-level unmaps and ICCCM synthetic
                // withdrawals; unmaps reported as a side effect of a
                // parent's substructure change are not withdrawals.
                if synthetic || event == window {
                    self.on_unmap(window)
                } else {
                    Ok(())
                }
            }
            WmEvent::ConfigureRequest(req) => self.on_configure_request(req),
            WmEvent::GeometryChanged { window, x, y, width, height, border_width } => {
                self.on_geometry_changed(window, Rect::new(x, y, width, height), border_width)
            }
            WmEvent::PropertyChanged { window, kind, deleted } => {
                self.on_property_changed(window, kind, deleted)
            }
            WmEvent::IconifyRequest { window } => self.on_iconify(window),
            WmEvent::ColormapChanged { window, is_new } => {
                self.on_colormap_changed(window, is_new)
            }
            WmEvent::FocusIn { window, grab } => {
                // A grab-mode focus change can leave the prefix grab behind;
                // re-establish it on the target
                if grab && self.registry.contains(window) {
                    let prefix = self.keys.prefix;
                    self.conn.grab_prefix_key(window, prefix)?;
                }
                Ok(())
            }
            WmEvent::MappingChanged { pointer } => {
                if pointer {
                    Ok(())
                } else {
                    log::info!("Keyboard mapping changed, re-grabbing prefix key");
                    self.regrab_prefix_keys()
                }
            }
            WmEvent::KeyPress { root, key } => self.on_key_press(root, key),
            WmEvent::Ignored(kind) => {
                log::debug!("Ignoring {} event", kind);
                Ok(())
            }
        }
    }

    /// A surface appeared. Track it if it is a manageable top-level:
    /// not override-redirect, parented on a root, and not one of our own
    /// helper windows.
    fn on_created(
        &mut self,
        window: WindowHandle,
        parent: WindowHandle,
        override_redirect: bool,
    ) -> Result<()> {
        if override_redirect {
            return Ok(());
        }
        let Some(screen) = self.screen_of_root(parent) else {
            return Ok(());
        };
        if self.screens[screen].is_helper(window) {
            return Ok(());
        }
        if self.registry.create(window, screen) {
            log::debug!("Tracking new window 0x{:x}", window);
        }
        Ok(())
    }

    /// A surface is gone. Unmanage immediately, but defer the switch to the
    /// last window until the burst of queued destroy notifications has been
    /// drained.
    fn on_destroy(&mut self, window: WindowHandle) -> Result<()> {
        let last_in_burst = !self.conn.destroy_pending();
        if self.registry.contains(window) {
            if self.current_window == Some(window) {
                log::debug!("Destroying the current window, deferring switch");
                self.switch_window_pending = true;
            }
            self.unmanage(window)?;
        }
        if last_in_burst && self.switch_window_pending {
            self.switch_window_pending = false;
            self.switch_to_last_window()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::conn::testing::{Action, FakeConn, FAKE_BAR_WINDOW, FAKE_ROOT};
    use crate::conn::{
        ConfigureRequest, IcccmState, KeyInput, PropertyKind, StackDirective, WmEvent,
    };
    use crate::keys::MOD_CONTROL;
    use crate::test_support::{open_window, test_wm, test_wm_with};
    use crate::types::Rect;
    use crate::window::WindowState;

    fn destroy(window: u32) -> WmEvent {
        WmEvent::WindowDestroyed { window }
    }

    fn genuine_unmap(window: u32) -> WmEvent {
        WmEvent::Unmap { window, event: window, synthetic: false }
    }

    #[test]
    fn test_create_then_map_manages_and_activates() {
        let mut wm = test_wm();
        open_window(&mut wm, 100, "xterm");

        let record = wm.registry.find(100).unwrap();
        assert_eq!(record.state, WindowState::Normal);
        assert_eq!(record.number, Some(0));
        assert_eq!(wm.current_window, Some(100));
        assert_eq!(wm.screens[0].frames.current_frame().window, Some(100));
        assert!(wm.conn.actions.contains(&Action::Map(100)));
        assert!(wm.conn.actions.contains(&Action::Focus(100)));
        assert!(wm.conn.actions.contains(&Action::GrabPrefix(100)));
    }

    #[test]
    fn test_override_redirect_and_helper_windows_are_never_tracked() {
        let mut wm = test_wm();
        wm.dispatch(WmEvent::WindowCreated {
            window: 100,
            parent: FAKE_ROOT,
            override_redirect: true,
        })
        .unwrap();
        wm.dispatch(WmEvent::WindowCreated {
            window: FAKE_BAR_WINDOW,
            parent: FAKE_ROOT,
            override_redirect: false,
        })
        .unwrap();
        assert!(wm.registry.is_empty());
    }

    #[test]
    fn test_map_request_for_unknown_window_is_granted_directly() {
        let mut wm = test_wm();
        wm.dispatch(WmEvent::MapRequest { window: 999 }).unwrap();
        assert!(wm.conn.actions.contains(&Action::Map(999)));
        assert!(wm.registry.is_empty());
    }

    #[test]
    fn test_lifecycle_reclaims_number_and_indexes() {
        let mut wm = test_wm();
        open_window(&mut wm, 100, "one");
        open_window(&mut wm, 200, "two");
        assert_eq!(wm.registry.find(200).unwrap().number, Some(1));

        // Withdrawal frees the number but keeps the record
        wm.dispatch(genuine_unmap(100)).unwrap();
        let record = wm.registry.find(100).unwrap();
        assert_eq!(record.state, WindowState::Withdrawn);
        assert_eq!(record.number, None);

        // The freed number is handed to the next window
        open_window(&mut wm, 300, "three");
        assert_eq!(wm.registry.find(300).unwrap().number, Some(0));

        // Destruction removes the handle from every index
        wm.dispatch(destroy(300)).unwrap();
        assert!(wm.registry.find(300).is_none());
        assert!(wm.screens[0].frames.find_showing(300).is_none());
        assert_ne!(wm.current_window, Some(300));
    }

    #[test]
    fn test_unmap_from_substructure_side_effect_is_ignored() {
        let mut wm = test_wm();
        open_window(&mut wm, 100, "one");

        wm.dispatch(WmEvent::Unmap { window: 100, event: FAKE_ROOT, synthetic: false })
            .unwrap();
        assert_eq!(wm.registry.find(100).unwrap().state, WindowState::Normal);

        // The ICCCM synthetic form is honored
        wm.dispatch(WmEvent::Unmap { window: 100, event: FAKE_ROOT, synthetic: true })
            .unwrap();
        assert_eq!(wm.registry.find(100).unwrap().state, WindowState::Withdrawn);
    }

    #[test]
    fn test_iconic_unmap_withdraws_without_frame_cleanup() {
        let mut wm = test_wm();
        open_window(&mut wm, 100, "one");
        open_window(&mut wm, 200, "two");
        // 100 was displaced into Iconic when 200 took the frame
        assert_eq!(wm.registry.find(100).unwrap().state, WindowState::Iconic);

        wm.conn.actions.clear();
        wm.dispatch(genuine_unmap(100)).unwrap();
        assert_eq!(wm.registry.find(100).unwrap().state, WindowState::Withdrawn);
        // The frame binding of 200 is untouched
        assert_eq!(wm.screens[0].frames.current_frame().window, Some(200));
        assert!(wm.conn.actions_of(|a| matches!(a, Action::Focus(_))).is_empty());
    }

    #[test]
    fn test_honour_map_promotes_never_focused_iconic_window() {
        // Adopted windows enter Iconic with last_access == 0
        let mut wm = test_wm_with(|conn, _| {
            conn.initial_windows = vec![100, 200];
        });
        assert_eq!(wm.current_window, Some(100));
        assert_eq!(wm.registry.find(200).unwrap().last_access, 0);
        assert_eq!(wm.registry.find(200).unwrap().state, WindowState::Iconic);

        wm.dispatch(WmEvent::MapRequest { window: 200 }).unwrap();
        assert_eq!(wm.current_window, Some(200));
        assert_eq!(wm.registry.find(200).unwrap().state, WindowState::Normal);
    }

    #[test]
    fn test_rudeness_flags_cleared_means_notification_only() {
        let mut wm = test_wm_with(|conn, config| {
            conn.initial_windows = vec![100, 200];
            config.policy.honour_transient_map = false;
            config.policy.honour_normal_map = false;
        });
        assert_eq!(wm.current_window, Some(100));
        wm.conn.actions.clear();

        wm.dispatch(WmEvent::MapRequest { window: 200 }).unwrap();
        // State unchanged, no focus change, exactly one notification
        assert_eq!(wm.current_window, Some(100));
        assert_eq!(wm.registry.find(200).unwrap().state, WindowState::Iconic);
        assert!(wm.conn.actions_of(|a| matches!(a, Action::Focus(_))).is_empty());
        let messages = wm.conn.actions_of(|a| {
            matches!(a, Action::DrawMessage { text, .. } if text.contains("wants to raise"))
        });
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn test_destroy_burst_causes_exactly_one_focus_restoration() {
        let mut wm = test_wm();
        for (handle, name) in [(100, "a"), (200, "b"), (300, "c"), (400, "d")] {
            open_window(&mut wm, handle, name);
        }
        assert_eq!(wm.current_window, Some(400));
        wm.conn.actions.clear();

        // A cascade ending with the active window among the casualties
        wm.conn.queue(destroy(200));
        wm.conn.queue(destroy(300));
        wm.conn.queue(destroy(400));
        FakeConn::drain_into(&mut wm);

        let focus_changes = wm.conn.actions_of(|a| matches!(a, Action::Focus(_)));
        assert_eq!(focus_changes.len(), 1);
        assert_eq!(focus_changes[0], &Action::Focus(100));
        assert_eq!(wm.current_window, Some(100));
        assert!(!wm.switch_window_pending);
    }

    #[test]
    fn test_single_destroy_of_current_switches_to_last_accessed() {
        let mut wm = test_wm();
        open_window(&mut wm, 100, "a");
        open_window(&mut wm, 200, "b");
        open_window(&mut wm, 300, "c");
        wm.conn.actions.clear();

        wm.dispatch(destroy(300)).unwrap();
        // 200 was accessed more recently than 100
        assert_eq!(wm.current_window, Some(200));
    }

    #[test]
    fn test_destroy_of_background_window_keeps_focus() {
        let mut wm = test_wm();
        open_window(&mut wm, 100, "a");
        open_window(&mut wm, 200, "b");
        wm.conn.actions.clear();

        wm.dispatch(destroy(100)).unwrap();
        assert_eq!(wm.current_window, Some(200));
        assert!(wm.conn.actions_of(|a| matches!(a, Action::Focus(_))).is_empty());
    }

    #[test]
    fn test_cleanup_frame_is_idempotent_on_empty_frame() {
        let mut wm = test_wm();
        let current = wm.screens[0].frames.current;
        let fresh = wm.screens[0]
            .frames
            .split(current, crate::frames::SplitDirection::Horizontal)
            .unwrap();

        wm.cleanup_frame(0, fresh).unwrap();
        assert!(wm.screens[0].frames.get(fresh).unwrap().window.is_none());
        wm.cleanup_frame(0, fresh).unwrap();
        assert!(wm.screens[0].frames.get(fresh).unwrap().window.is_none());
    }

    #[test]
    fn test_unmap_of_current_switches_to_last_accessed() {
        let mut wm = test_wm();
        open_window(&mut wm, 100, "a");
        open_window(&mut wm, 200, "b");
        open_window(&mut wm, 300, "c");
        assert_eq!(wm.current_window, Some(300));

        wm.dispatch(genuine_unmap(300)).unwrap();
        // 200 was accessed more recently than 100
        assert_eq!(wm.current_window, Some(200));
        assert_eq!(wm.screens[0].frames.current_frame().window, Some(200));
    }

    #[test]
    fn test_cleanup_frame_picks_replacement_in_registry_order() {
        let mut wm = test_wm();
        // Two frames: 100 lives in the first, the rest churn in the second
        open_window(&mut wm, 100, "a");
        wm.execute_command("split");
        wm.execute_command("focus");
        open_window(&mut wm, 200, "b");
        open_window(&mut wm, 300, "c");
        open_window(&mut wm, 400, "d");
        assert_eq!(wm.current_window, Some(400));
        // 200 and 300 are iconic candidates
        let first_frame = wm.screens[0].frames.find_showing(100).unwrap();

        wm.dispatch(genuine_unmap(100)).unwrap();
        // The departing window was not current, so no focus switch happens
        // and the earliest registry entry wins the vacant frame
        assert_eq!(wm.current_window, Some(400));
        assert_eq!(wm.screens[0].frames.get(first_frame).unwrap().window, Some(200));
        assert_eq!(wm.registry.find(200).unwrap().state, WindowState::Normal);
    }

    #[test]
    fn test_configure_request_grants_fields_independently() {
        let mut wm = test_wm();
        open_window(&mut wm, 100, "one");
        // Cache now holds the fitted frame-filling geometry
        assert_eq!(wm.registry.find(100).unwrap().geometry, Rect::new(0, 0, 800, 600));
        wm.conn.actions.clear();

        wm.dispatch(WmEvent::ConfigureRequest(ConfigureRequest {
            window: 100,
            width: Some(400),
            ..Default::default()
        }))
        .unwrap();

        let granted = Rect::new(0, 0, 400, 600);
        let synthetic_first = wm.conn.actions.iter().position(|a| {
            matches!(a, Action::SyntheticConfigure { window: 100, rect, .. } if *rect == granted)
        });
        let applied = wm.conn.actions.iter().position(|a| {
            matches!(a, Action::Configure { window: 100, rect, .. } if *rect == granted)
        });
        assert!(synthetic_first.is_some());
        assert!(applied.is_some());
        assert!(synthetic_first.unwrap() < applied.unwrap());
        assert_eq!(wm.registry.find(100).unwrap().geometry, granted);
    }

    #[test]
    fn test_configure_request_for_unmanaged_window_passes_through() {
        let mut wm = test_wm();
        wm.dispatch(WmEvent::ConfigureRequest(ConfigureRequest {
            window: 999,
            x: Some(10),
            ..Default::default()
        }))
        .unwrap();
        assert!(wm.conn.actions.contains(&Action::ApplyConfigure(999)));
    }

    #[test]
    fn test_stack_below_on_current_window_switches_away() {
        let mut wm = test_wm();
        open_window(&mut wm, 100, "a");
        open_window(&mut wm, 200, "b");
        assert_eq!(wm.current_window, Some(200));

        wm.dispatch(WmEvent::ConfigureRequest(ConfigureRequest {
            window: 200,
            stack: Some(StackDirective::Below),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(wm.current_window, Some(100));
    }

    #[test]
    fn test_stack_above_without_honour_raise_only_notifies() {
        let mut wm = test_wm();
        open_window(&mut wm, 100, "a");
        // Park focus on an empty frame so 100 stays Normal but not current
        wm.execute_command("split");
        wm.execute_command("focus");
        assert_eq!(wm.current_window, None);
        wm.conn.actions.clear();

        wm.dispatch(WmEvent::ConfigureRequest(ConfigureRequest {
            window: 100,
            stack: Some(StackDirective::Above),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(wm.current_window, None);
        let messages = wm.conn.actions_of(|a| {
            matches!(a, Action::DrawMessage { text, .. } if text.contains("wants to raise"))
        });
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn test_stack_above_with_honour_raise_promotes() {
        let mut wm = test_wm_with(|_, config| {
            config.policy.honour_normal_raise = true;
        });
        open_window(&mut wm, 100, "a");
        wm.execute_command("split");
        wm.execute_command("focus");
        assert_eq!(wm.current_window, None);

        wm.dispatch(WmEvent::ConfigureRequest(ConfigureRequest {
            window: 100,
            stack: Some(StackDirective::Above),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(wm.current_window, Some(100));
    }

    #[test]
    fn test_geometry_change_refits_with_increments() {
        let mut wm = test_wm();
        wm.conn.hints.insert(
            100,
            crate::types::SizeHints { inc: Some((10, 10)), ..Default::default() },
        );
        open_window(&mut wm, 100, "term");
        // Fit of the 800x600 frame with increments of 10
        assert_eq!(wm.registry.find(100).unwrap().geometry, Rect::new(0, 0, 800, 600));
        wm.conn.actions.clear();

        // The layer reports a drifted real size; the cache is refreshed
        // first, then the re-fit pulls the window back to the frame size
        wm.dispatch(WmEvent::GeometryChanged {
            window: 100,
            x: 0,
            y: 0,
            width: 795,
            height: 600,
            border_width: 0,
        })
        .unwrap();
        assert_eq!(wm.registry.find(100).unwrap().geometry, Rect::new(0, 0, 800, 600));
        assert!(wm.conn.actions.iter().any(|a| {
            matches!(a, Action::Configure { window: 100, rect, .. } if *rect == Rect::new(0, 0, 800, 600))
        }));
    }

    #[test]
    fn test_iconify_message_fills_frame_with_replacement() {
        let mut wm = test_wm();
        open_window(&mut wm, 100, "a");
        open_window(&mut wm, 200, "b");
        assert_eq!(wm.current_window, Some(200));

        wm.dispatch(WmEvent::IconifyRequest { window: 200 }).unwrap();
        // The frame was refilled and activated; the sender's record is
        // untouched until its own unmap arrives
        assert_eq!(wm.current_window, Some(100));
        assert_eq!(wm.screens[0].frames.current_frame().window, Some(100));
    }

    #[test]
    fn test_colormap_install_only_for_active_window() {
        let mut wm = test_wm();
        open_window(&mut wm, 100, "a");
        open_window(&mut wm, 200, "b");
        wm.conn.actions.clear();

        wm.dispatch(WmEvent::ColormapChanged { window: 100, is_new: true }).unwrap();
        assert!(wm.conn.actions_of(|a| matches!(a, Action::InstallColormap(_))).is_empty());

        wm.dispatch(WmEvent::ColormapChanged { window: 200, is_new: true }).unwrap();
        assert!(wm.conn.actions.contains(&Action::InstallColormap(200)));
    }

    #[test]
    fn test_mapping_change_ungrabs_refreshes_regrabs() {
        let mut wm = test_wm();
        open_window(&mut wm, 100, "a");
        wm.conn.actions.clear();

        wm.dispatch(WmEvent::MappingChanged { pointer: false }).unwrap();
        let ungrab = wm.conn.actions.iter().position(|a| *a == Action::UngrabKeys(100));
        let refresh = wm.conn.actions.iter().position(|a| *a == Action::RefreshMapping);
        let regrab = wm.conn.actions.iter().position(|a| *a == Action::GrabPrefix(100));
        assert!(ungrab.unwrap() < refresh.unwrap());
        assert!(refresh.unwrap() < regrab.unwrap());

        // Pointer mapping changes are not our business
        wm.conn.actions.clear();
        wm.dispatch(WmEvent::MappingChanged { pointer: true }).unwrap();
        assert!(wm.conn.actions.is_empty());
    }

    #[test]
    fn test_name_change_refreshes_disambiguation() {
        let mut wm = test_wm();
        open_window(&mut wm, 100, "emacs");
        open_window(&mut wm, 200, "xterm");

        wm.conn.names.insert(200, "emacs".to_string());
        wm.dispatch(WmEvent::PropertyChanged {
            window: 200,
            kind: PropertyKind::Name,
            deleted: false,
        })
        .unwrap();
        assert_eq!(wm.registry.find(200).unwrap().display_name, "emacs <2>");
    }

    #[test]
    fn test_prefix_key_dispatch_bound_and_unbound() {
        let mut wm = test_wm();
        open_window(&mut wm, 100, "a");
        open_window(&mut wm, 200, "b");
        // Leave a message on screen so hiding the bar is observable
        wm.marked_message(0, "hello").unwrap();
        wm.conn.actions.clear();

        // Prefix, then 'p' (bound to "prev")
        wm.conn.keys.push_back(KeyInput { keysym: 'p' as u32, modifiers: 0, keycode: 33 });
        wm.dispatch(WmEvent::KeyPress {
            root: FAKE_ROOT,
            key: KeyInput { keysym: 't' as u32, modifiers: MOD_CONTROL, keycode: 28 },
        })
        .unwrap();

        // Transient UI hidden before the keystroke wait
        let bar_hidden = wm.conn.actions.iter().position(|a| *a == Action::Unmap(FAKE_BAR_WINDOW));
        let waited = wm
            .conn
            .actions
            .iter()
            .position(|a| matches!(a, Action::WaitForKey { .. }));
        assert!(bar_hidden.unwrap() < waited.unwrap());
        // Exactly the one bound command ran
        assert_eq!(wm.current_window, Some(100));

        // Unbound combination: no command, exactly one notification
        wm.conn.actions.clear();
        wm.conn.keys.push_back(KeyInput { keysym: 'z' as u32, modifiers: MOD_CONTROL, keycode: 52 });
        wm.dispatch(WmEvent::KeyPress {
            root: FAKE_ROOT,
            key: KeyInput { keysym: 't' as u32, modifiers: MOD_CONTROL, keycode: 28 },
        })
        .unwrap();
        assert!(wm.conn.actions_of(|a| matches!(a, Action::Focus(_))).is_empty());
        let notes = wm.conn.actions_of(
            |a| matches!(a, Action::DrawMessage { text, .. } if text.contains("not bound")),
        );
        assert_eq!(notes.len(), 1);
    }

    #[test]
    fn test_non_prefix_keys_are_forwarded_to_focus_holder() {
        let mut wm = test_wm();
        open_window(&mut wm, 100, "a");
        wm.conn.actions.clear();

        wm.dispatch(WmEvent::KeyPress {
            root: FAKE_ROOT,
            key: KeyInput { keysym: 'x' as u32, modifiers: 0, keycode: 53 },
        })
        .unwrap();
        assert!(wm
            .conn
            .actions
            .contains(&Action::ForwardKey { to: 100, keysym: 'x' as u32 }));
    }

    #[test]
    fn test_prefix_twice_forwards_prefix_keystroke() {
        let mut wm = test_wm();
        open_window(&mut wm, 100, "a");
        wm.conn.actions.clear();

        wm.conn.keys.push_back(KeyInput { keysym: 't' as u32, modifiers: MOD_CONTROL, keycode: 28 });
        wm.dispatch(WmEvent::KeyPress {
            root: FAKE_ROOT,
            key: KeyInput { keysym: 't' as u32, modifiers: MOD_CONTROL, keycode: 28 },
        })
        .unwrap();
        assert!(wm
            .conn
            .actions
            .contains(&Action::ForwardKey { to: 100, keysym: 't' as u32 }));
    }

    #[test]
    fn test_withdrawal_state_is_published() {
        let mut wm = test_wm();
        open_window(&mut wm, 100, "a");
        wm.conn.actions.clear();

        wm.dispatch(genuine_unmap(100)).unwrap();
        assert!(wm.conn.actions.contains(&Action::SetState {
            window: 100,
            state: IcccmState::Withdrawn
        }));
    }
}
