use std::collections::BTreeMap;

use bevy::prelude::*;
use serde::Serialize;

use crate::actuators::{ActuatorRegistry, TickContext};
use crate::admission::NodeId;
use crate::buoyancy::BuoyancyRegistry;
use crate::camera::CameraBinding;
use crate::config::{ControllerFailurePolicy, SimulationConfig, SimulationMode};
use crate::drag::DragController;
use crate::emission::EmissionTracker;
use crate::error::{InvalidReference, SimError};
use crate::host::{HostHooks, ViewSnapshot};
use crate::overlay::DebugOverlay;
use crate::physics::{BodyHandle, PhysicsWorld};
use crate::script::BodyScript;
use crate::stats::TimingStats;
use crate::transition::ViewTransition;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    #[default]
    Inactive,
    Playing,
    Paused,
    /// Torn down; equivalent to `Inactive` for the next `start()`.
    Terminated,
}

impl SessionState {
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Playing | SessionState::Paused)
    }
}

/// Everything owned by one running simulation. Dropped as a unit on teardown.
pub struct Session {
    pub frame: u64,
    pub paused: bool,
    pub(crate) was_paused: bool,
    pub update_rate: u32,
    pub update_timestep: f32,
    pub mode: SimulationMode,
    pub policy: ControllerFailurePolicy,
    pub drag_stiffness: f32,
    pub(crate) warmup_remaining: u32,
    /// Set by a script `stop()`; the session tears down once the current call returns.
    pub(crate) stop_requested: bool,
    pub world: Box<dyn PhysicsWorld>,
    pub scripts: BTreeMap<BodyHandle, BodyScript>,
    pub node_bodies: BTreeMap<NodeId, BodyHandle>,
    pub actuators: ActuatorRegistry,
    pub buoyancy: BuoyancyRegistry,
    pub emissions: EmissionTracker,
    pub drag: DragController,
    pub picked: Option<BodyHandle>,
    pub camera: Option<CameraBinding>,
    pub transition: Option<ViewTransition>,
    /// Last `(eye, target)` handed to the host.
    pub view: (Vec3, Vec3),
    pub overlay: DebugOverlay,
    pub stats: TimingStats,
    pub view_snapshot: ViewSnapshot,
}

impl Session {
    pub fn new(
        config: &SimulationConfig,
        world: Box<dyn PhysicsWorld>,
        view_snapshot: ViewSnapshot,
    ) -> Self {
        Self {
            frame: 0,
            paused: false,
            was_paused: false,
            update_rate: config.update_rate,
            update_timestep: config.update_timestep,
            mode: config.mode,
            policy: config.controller_failure,
            drag_stiffness: config.drag_stiffness,
            warmup_remaining: config.warmup_ticks,
            stop_requested: false,
            world,
            scripts: BTreeMap::new(),
            node_bodies: BTreeMap::new(),
            actuators: ActuatorRegistry::default(),
            buoyancy: BuoyancyRegistry::default(),
            emissions: EmissionTracker::default(),
            drag: DragController::default(),
            picked: None,
            camera: None,
            transition: None,
            view: (view_snapshot.camera_eye, view_snapshot.camera_target),
            overlay: DebugOverlay::default(),
            stats: TimingStats::new(config.stats_history_capacity),
            view_snapshot,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.paused {
            SessionState::Paused
        } else {
            SessionState::Playing
        }
    }

    /// False once a script asked to stop; every pipeline step checks this.
    pub fn is_live(&self) -> bool {
        !self.stop_requested
    }

    pub fn tick_seconds(&self) -> f32 {
        self.update_timestep * self.update_rate as f32
    }

    pub fn tick_context(&self) -> TickContext {
        TickContext {
            frame: self.frame,
            time: self.world.elapsed_time(),
            update_timestep: self.update_timestep,
            policy: self.policy,
        }
    }

    /// Destroys a body and forgets it everywhere the session references it.
    pub fn destroy_body(
        &mut self,
        body: BodyHandle,
        host: &mut dyn HostHooks,
    ) -> Result<(), SimError> {
        if !self.world.is_valid(body) {
            return Err(InvalidReference::Body(body).into());
        }
        self.world.destroy_body(body)?;
        self.scripts.remove(&body);
        self.actuators.remove_body(body);
        self.emissions.forget(body);
        self.node_bodies.retain(|_, b| *b != body);
        if self.picked == Some(body) {
            self.picked = None;
        }
        if self.camera.map(|c| c.body) == Some(body) {
            self.camera = None;
        }
        host.despawn_visual(body);
        Ok(())
    }

    pub fn clear_registries(&mut self) {
        self.scripts.clear();
        self.node_bodies.clear();
        self.actuators.clear();
        self.buoyancy.clear();
        self.camera = None;
        self.transition = None;
        self.picked = None;
        self.overlay.clear();
    }
}
