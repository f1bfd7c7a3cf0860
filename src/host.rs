use std::cell::RefCell;
use std::rc::Rc;

use bevy::prelude::*;
use serde::Serialize;

use crate::overlay::DebugShape;
use crate::physics::{BodyHandle, Pose};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum CursorShape {
    #[default]
    Default,
    Grabbing,
}

/// Editor/view state captured at `start()` and restored on teardown.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ViewSnapshot {
    pub camera_eye: Vec3,
    pub camera_target: Vec3,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StatusLine {
    pub frame: u64,
    pub fps: f32,
    pub bodies: usize,
    pub paused: bool,
}

/// Everything the scheduler asks of the hosting editor or viewer.
/// Every hook has a no-op default so headless hosts only override what they have.
pub trait HostHooks {
    fn snapshot_view(&mut self) -> ViewSnapshot {
        ViewSnapshot::default()
    }

    fn restore_view(&mut self, _snapshot: &ViewSnapshot) {}

    /// Propagates a moved body's pose to its visual.
    fn sync_visual(&mut self, _body: BodyHandle, _pose: &Pose) {}

    fn spawn_visual(&mut self, _body: BodyHandle, _source: BodyHandle) {}

    fn despawn_visual(&mut self, _body: BodyHandle) {}

    fn set_cursor(&mut self, _cursor: CursorShape) {}

    fn set_selected(&mut self, _body: BodyHandle, _selected: bool) {}

    fn is_selected(&self, _body: BodyHandle) -> bool {
        false
    }

    fn pause_audio(&mut self) {}

    fn resume_audio(&mut self) {}

    fn advance_audio(&mut self, _dt: f32) {}

    fn set_camera(&mut self, _eye: Vec3, _target: Vec3) {}

    fn show_status(&mut self, _status: &StatusLine) {}

    fn request_redraw(&mut self, _overlay: &[DebugShape]) {}
}

#[derive(Default, Debug, Clone, Copy)]
pub struct NullHost;

impl HostHooks for NullHost {}

/// Lets a caller keep a handle on a host it handed to the simulator.
impl<H: HostHooks> HostHooks for Rc<RefCell<H>> {
    fn snapshot_view(&mut self) -> ViewSnapshot {
        self.borrow_mut().snapshot_view()
    }

    fn restore_view(&mut self, snapshot: &ViewSnapshot) {
        self.borrow_mut().restore_view(snapshot);
    }

    fn sync_visual(&mut self, body: BodyHandle, pose: &Pose) {
        self.borrow_mut().sync_visual(body, pose);
    }

    fn spawn_visual(&mut self, body: BodyHandle, source: BodyHandle) {
        self.borrow_mut().spawn_visual(body, source);
    }

    fn despawn_visual(&mut self, body: BodyHandle) {
        self.borrow_mut().despawn_visual(body);
    }

    fn set_cursor(&mut self, cursor: CursorShape) {
        self.borrow_mut().set_cursor(cursor);
    }

    fn set_selected(&mut self, body: BodyHandle, selected: bool) {
        self.borrow_mut().set_selected(body, selected);
    }

    fn is_selected(&self, body: BodyHandle) -> bool {
        self.borrow().is_selected(body)
    }

    fn pause_audio(&mut self) {
        self.borrow_mut().pause_audio();
    }

    fn resume_audio(&mut self) {
        self.borrow_mut().resume_audio();
    }

    fn advance_audio(&mut self, dt: f32) {
        self.borrow_mut().advance_audio(dt);
    }

    fn set_camera(&mut self, eye: Vec3, target: Vec3) {
        self.borrow_mut().set_camera(eye, target);
    }

    fn show_status(&mut self, status: &StatusLine) {
        self.borrow_mut().show_status(status);
    }

    fn request_redraw(&mut self, overlay: &[DebugShape]) {
        self.borrow_mut().request_redraw(overlay);
    }
}
