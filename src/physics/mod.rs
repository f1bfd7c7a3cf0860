pub mod basic;

use std::any::Any;
use std::fmt;

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::InvalidReference;

pub use basic::BasicWorld;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BodyHandle(pub u64);

impl fmt::Display for BodyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JointHandle(pub u64);

impl fmt::Display for JointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "joint#{}", self.0)
    }
}

/// Rigid transform of a body: translation plus orientation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pose {
    pub translation: Vec3,
    pub rotation: Quat,
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Pose {
    pub const IDENTITY: Self = Self {
        translation: Vec3::ZERO,
        rotation: Quat::IDENTITY,
    };

    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            rotation: Quat::IDENTITY,
        }
    }

    pub fn transform_point(&self, local: Vec3) -> Vec3 {
        self.translation + self.rotation * local
    }

    pub fn inverse_transform_point(&self, world: Vec3) -> Vec3 {
        self.rotation.inverse() * (world - self.translation)
    }

    pub fn local_axis(&self, axis: Vec3) -> Vec3 {
        self.rotation * axis
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Shape {
    Sphere { radius: f32 },
    Box { half_extents: [f32; 3] },
    Capsule { radius: f32, half_height: f32 },
}

impl Shape {
    pub fn volume(&self) -> f32 {
        match self {
            Shape::Sphere { radius } => 4.0 / 3.0 * std::f32::consts::PI * radius.powi(3),
            Shape::Box { half_extents } => {
                8.0 * half_extents[0] * half_extents[1] * half_extents[2]
            }
            Shape::Capsule {
                radius,
                half_height,
            } => {
                let sphere = 4.0 / 3.0 * std::f32::consts::PI * radius.powi(3);
                let cylinder = std::f32::consts::PI * radius.powi(2) * half_height * 2.0;
                sphere + cylinder
            }
        }
    }

    pub fn bounding_radius(&self) -> f32 {
        match self {
            Shape::Sphere { radius } => *radius,
            Shape::Box { half_extents } => Vec3::from_array(*half_extents).length(),
            Shape::Capsule {
                radius,
                half_height,
            } => radius + half_height,
        }
    }

    pub fn is_degenerate(&self) -> bool {
        !(self.volume() > 0.0 && self.volume().is_finite())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BodyDesc {
    pub shape: Shape,
    pub pose: Pose,
    pub density: f32,
    pub friction: f32,
    pub elasticity: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub is_static: bool,
    pub collidable: bool,
    pub continuous_collision: bool,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
}

impl BodyDesc {
    pub fn new(shape: Shape, pose: Pose) -> Self {
        Self {
            shape,
            pose,
            density: 1.0,
            friction: 0.5,
            elasticity: 0.4,
            linear_damping: 0.01,
            angular_damping: 0.05,
            is_static: false,
            collidable: true,
            continuous_collision: false,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
        }
    }

    pub fn fixed(mut self) -> Self {
        self.is_static = true;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JointKind {
    /// Angular joint; targets are angles.
    Hinge,
    /// Linear joint; targets are positions along the axis.
    Slider,
    /// Pin joint; targets are directions.
    Direction,
    Fixed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JointDesc {
    pub kind: JointKind,
    /// `None` attaches the child to the world.
    pub parent: Option<BodyHandle>,
    pub child: BodyHandle,
    pub anchor: Vec3,
    pub axis: Vec3,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum JointTarget {
    /// Radians.
    Angle(f32),
    Position(f32),
    Direction(Vec3),
}

#[derive(Clone, Debug, PartialEq)]
pub struct WorldSettings {
    pub gravity: Vec3,
    pub solver_iterations: u32,
    pub default_friction: f32,
    pub default_elasticity: f32,
    pub worker_threads: usize,
}

impl Default for WorldSettings {
    fn default() -> Self {
        crate::config::SimulationConfig::default().world_settings()
    }
}

/// Fluid surface applied to every dynamic body.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FluidPlane {
    pub origin: Vec3,
    pub normal: Vec3,
    pub density: f32,
    pub viscosity: f32,
    pub current: Vec3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContactPhase {
    Began,
    Persisting,
    Ended,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ContactEvent {
    pub a: BodyHandle,
    pub b: BodyHandle,
    pub phase: ContactPhase,
    pub point: Vec3,
    pub normal: Vec3,
    pub impulse: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RayHit {
    pub body: BodyHandle,
    pub distance: f32,
    pub point: Vec3,
}

/// The physics engine as seen by the scheduler.
pub trait PhysicsWorld {
    fn step(&mut self, dt: f32, substeps: u32);
    fn elapsed_time(&self) -> f64;

    /// Live bodies in world iteration order.
    fn bodies(&self) -> Vec<BodyHandle>;
    fn is_valid(&self, body: BodyHandle) -> bool;
    fn create_body(&mut self, desc: &BodyDesc) -> BodyHandle;
    fn clone_body(&mut self, body: BodyHandle) -> Result<BodyHandle, InvalidReference>;
    fn destroy_body(&mut self, body: BodyHandle) -> Result<(), InvalidReference>;

    fn pose(&self, body: BodyHandle) -> Result<Pose, InvalidReference>;
    fn linear_velocity(&self, body: BodyHandle) -> Result<Vec3, InvalidReference>;
    fn angular_velocity(&self, body: BodyHandle) -> Result<Vec3, InvalidReference>;
    fn mass(&self, body: BodyHandle) -> Result<f32, InvalidReference>;
    fn aabb(&self, body: BodyHandle) -> Result<(Vec3, Vec3), InvalidReference>;

    fn is_static(&self, body: BodyHandle) -> Result<bool, InvalidReference>;
    fn set_static(&mut self, body: BodyHandle, is_static: bool) -> Result<(), InvalidReference>;
    fn set_collidable(&mut self, body: BodyHandle, collidable: bool)
        -> Result<(), InvalidReference>;
    fn continuous_collision(&self, body: BodyHandle) -> Result<bool, InvalidReference>;
    fn set_continuous_collision(
        &mut self,
        body: BodyHandle,
        enabled: bool,
    ) -> Result<(), InvalidReference>;

    /// Force applied for the next step only.
    fn add_force(&mut self, body: BodyHandle, force: Vec3) -> Result<(), InvalidReference>;
    fn add_force_at_point(
        &mut self,
        body: BodyHandle,
        force: Vec3,
        point: Vec3,
    ) -> Result<(), InvalidReference>;
    fn add_torque(&mut self, body: BodyHandle, torque: Vec3) -> Result<(), InvalidReference>;

    fn create_joint(&mut self, desc: &JointDesc) -> Result<JointHandle, InvalidReference>;
    fn is_joint_valid(&self, joint: JointHandle) -> bool;
    fn joint_kind(&self, joint: JointHandle) -> Result<JointKind, InvalidReference>;
    fn set_joint_target(
        &mut self,
        joint: JointHandle,
        target: Option<JointTarget>,
    ) -> Result<(), InvalidReference>;

    fn apply_buoyancy(&mut self, plane: &FluidPlane);
    /// Spring pull of a body-local point toward a world-space target.
    fn apply_pick_drag(
        &mut self,
        body: BodyHandle,
        local_point: Vec3,
        target: Vec3,
        strength: f32,
    ) -> Result<(), InvalidReference>;

    /// Contact transitions recorded during the last `step`.
    fn drain_contacts(&mut self) -> Vec<ContactEvent>;
    /// Bodies whose pose changed during the last `step`.
    fn drain_moved(&mut self) -> Vec<BodyHandle>;
    fn ray_cast(&self, origin: Vec3, direction: Vec3, max_distance: f32) -> Option<RayHit>;

    fn as_any(&self) -> &dyn Any;
}

pub trait WorldFactory {
    fn create(&self, settings: &WorldSettings) -> Box<dyn PhysicsWorld>;
}

impl<F> WorldFactory for F
where
    F: Fn(&WorldSettings) -> Box<dyn PhysicsWorld>,
{
    fn create(&self, settings: &WorldSettings) -> Box<dyn PhysicsWorld> {
        self(settings)
    }
}
