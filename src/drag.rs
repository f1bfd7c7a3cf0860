use bevy::prelude::*;

use crate::host::{CursorShape, HostHooks};
use crate::physics::{BodyHandle, PhysicsWorld};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DragState {
    pub body: BodyHandle,
    /// Grabbed point in the body's local frame.
    pub local_point: Vec3,
    pub target: Vec3,
    pub prior_continuous_collision: bool,
    pub last_event_frame: u64,
    pub was_pre_selected: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DragUpdate {
    Idle,
    Applied,
    /// The dragged body disappeared; drag state was cleared.
    Invalidated,
}

#[derive(Default, Debug)]
pub struct DragController {
    state: Option<DragState>,
}

impl DragController {
    pub fn state(&self) -> Option<&DragState> {
        self.state.as_ref()
    }

    pub fn is_dragging(&self) -> bool {
        self.state.is_some()
    }

    /// Grabs `body` at `world_point`. Static or invalid bodies are refused.
    pub fn begin(
        &mut self,
        world: &mut dyn PhysicsWorld,
        host: &mut dyn HostHooks,
        body: BodyHandle,
        world_point: Vec3,
        frame: u64,
    ) -> bool {
        if self.state.is_some() {
            self.end(world, host);
        }
        if !matches!(world.is_static(body), Ok(false)) {
            return false;
        }
        let Ok(pose) = world.pose(body) else {
            return false;
        };
        let prior_continuous_collision = world.continuous_collision(body).unwrap_or(false);
        if world.set_continuous_collision(body, true).is_err() {
            return false;
        }
        let was_pre_selected = host.is_selected(body);
        if !was_pre_selected {
            host.set_selected(body, true);
        }
        host.set_cursor(CursorShape::Grabbing);
        self.state = Some(DragState {
            body,
            local_point: pose.inverse_transform_point(world_point),
            target: world_point,
            prior_continuous_collision,
            last_event_frame: frame,
            was_pre_selected,
        });
        debug!("[Simdrive drag] Grabbed body {}", body);
        true
    }

    pub fn move_target(&mut self, target: Vec3, frame: u64) {
        if let Some(state) = self.state.as_mut() {
            state.target = target;
            state.last_event_frame = frame;
        }
    }

    /// Releases the drag and restores the body's collision mode and selection.
    pub fn end(
        &mut self,
        world: &mut dyn PhysicsWorld,
        host: &mut dyn HostHooks,
    ) -> Option<BodyHandle> {
        let state = self.state.take()?;
        if world.is_valid(state.body) {
            let _ = world.set_continuous_collision(state.body, state.prior_continuous_collision);
        }
        Self::restore_host(host, &state);
        Some(state.body)
    }

    pub fn update(
        &mut self,
        world: &mut dyn PhysicsWorld,
        host: &mut dyn HostHooks,
        strength: f32,
    ) -> DragUpdate {
        let Some(state) = self.state else {
            return DragUpdate::Idle;
        };
        if !world.is_valid(state.body) {
            self.state = None;
            Self::restore_host(host, &state);
            debug!("[Simdrive drag] Dragged body {} vanished", state.body);
            return DragUpdate::Invalidated;
        }
        match world.apply_pick_drag(state.body, state.local_point, state.target, strength) {
            Ok(()) => DragUpdate::Applied,
            Err(_) => {
                self.state = None;
                Self::restore_host(host, &state);
                DragUpdate::Invalidated
            }
        }
    }

    fn restore_host(host: &mut dyn HostHooks, state: &DragState) {
        if !state.was_pre_selected {
            host.set_selected(state.body, false);
        }
        host.set_cursor(CursorShape::Default);
    }
}
