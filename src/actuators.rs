use std::collections::HashMap;

use bevy::prelude::*;

use crate::config::{ControllerFailurePolicy, REFERENCE_TIMESTEP};
use crate::emission::EmissionTracker;
use crate::error::{InvalidReference, ScriptError, SimError};
use crate::physics::{BodyHandle, JointHandle, JointKind, JointTarget, PhysicsWorld, Pose};
use crate::script::{Bindings, ControllerValue, Evaluator, SubjectState};

const FAILURE_LOG_INTERVAL_FRAMES: u64 = 60;

#[derive(Clone, Debug, PartialEq)]
pub struct Thruster {
    pub name: String,
    pub subject: BodyHandle,
    pub expression: String,
    /// Rotate vector results into the subject's local frame.
    pub lock_axis: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Emitter {
    pub name: String,
    pub subject: BodyHandle,
    pub expression: String,
    pub lock_axis: bool,
    /// Spawn every `rate` ticks; at least 1.
    pub rate: u32,
    /// Frames a spawned body lives; 0 keeps it until the session ends.
    pub lifetime: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JointController {
    pub name: String,
    pub joint: JointHandle,
    pub expression: String,
    /// Hinge results are radians instead of degrees.
    pub raw: bool,
}

/// Per-tick inputs shared by every controller evaluation.
#[derive(Clone, Copy, Debug)]
pub struct TickContext {
    pub frame: u64,
    pub time: f64,
    pub update_timestep: f32,
    pub policy: ControllerFailurePolicy,
}

impl TickContext {
    /// Thruster and emitter forces are expressed per reference timestep.
    pub fn force_scale(&self) -> f32 {
        REFERENCE_TIMESTEP / self.update_timestep
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum JointTargetUpdate {
    Set(JointTarget),
    Clear,
    Ignore,
}

#[derive(Default, Debug)]
struct FailureLog {
    last_logged_frame: Option<u64>,
    suppressed: u64,
}

#[derive(Default)]
pub struct ActuatorRegistry {
    pub thrusters: Vec<Thruster>,
    pub emitters: Vec<Emitter>,
    pub joints: Vec<JointController>,
    failures: HashMap<String, FailureLog>,
    pub failure_count: u64,
}

/// Force produced by a controller value for a body at `pose`.
pub fn controller_force(value: &ControllerValue, pose: &Pose, lock_axis: bool) -> Option<Vec3> {
    if let Some(magnitude) = value.as_scalar() {
        return Some(pose.local_axis(Vec3::Z) * magnitude as f32);
    }
    let vector = value.as_vector()?;
    if lock_axis {
        Some(pose.rotation * vector)
    } else {
        Some(vector)
    }
}

pub fn joint_target_update(kind: JointKind, raw: bool, value: &ControllerValue) -> JointTargetUpdate {
    if matches!(value, ControllerValue::Nil) {
        return JointTargetUpdate::Clear;
    }
    match kind {
        JointKind::Hinge => match value.as_scalar() {
            Some(angle) if raw => JointTargetUpdate::Set(JointTarget::Angle(angle as f32)),
            Some(degrees) => {
                JointTargetUpdate::Set(JointTarget::Angle((degrees as f32).to_radians()))
            }
            None => JointTargetUpdate::Ignore,
        },
        JointKind::Slider => match value.as_scalar() {
            Some(position) => JointTargetUpdate::Set(JointTarget::Position(position as f32)),
            None => JointTargetUpdate::Ignore,
        },
        JointKind::Direction => match value.as_vector().and_then(|v| v.try_normalize()) {
            Some(direction) => JointTargetUpdate::Set(JointTarget::Direction(direction)),
            None => JointTargetUpdate::Ignore,
        },
        JointKind::Fixed => JointTargetUpdate::Ignore,
    }
}

pub fn subject_state(
    world: &dyn PhysicsWorld,
    body: BodyHandle,
) -> Result<SubjectState, InvalidReference> {
    Ok(SubjectState {
        body,
        position: world.pose(body)?.translation,
        velocity: world.linear_velocity(body)?,
        spin: world.angular_velocity(body)?,
        mass: world.mass(body)?,
    })
}

fn bindings_for(
    world: &dyn PhysicsWorld,
    tick: &TickContext,
    subject: Option<BodyHandle>,
) -> Result<Bindings, InvalidReference> {
    Ok(Bindings {
        frame: tick.frame,
        time: tick.time,
        dt: tick.update_timestep,
        subject: subject.map(|body| subject_state(world, body)).transpose()?,
    })
}

impl ActuatorRegistry {
    pub fn is_empty(&self) -> bool {
        self.thrusters.is_empty() && self.emitters.is_empty() && self.joints.is_empty()
    }

    pub fn clear(&mut self) {
        self.thrusters.clear();
        self.emitters.clear();
        self.joints.clear();
        self.failures.clear();
        self.failure_count = 0;
    }

    /// Drops controllers whose subject is gone; returns how many were removed.
    pub fn prune_invalid(&mut self, world: &dyn PhysicsWorld) -> usize {
        let before = self.thrusters.len() + self.emitters.len() + self.joints.len();
        self.thrusters.retain(|t| world.is_valid(t.subject));
        self.emitters.retain(|e| world.is_valid(e.subject));
        self.joints.retain(|j| world.is_joint_valid(j.joint));
        let removed = before - (self.thrusters.len() + self.emitters.len() + self.joints.len());
        if removed > 0 {
            debug!("[Simdrive actuators] Pruned {} invalid controllers", removed);
        }
        removed
    }

    pub fn remove_body(&mut self, body: BodyHandle) {
        self.thrusters.retain(|t| t.subject != body);
        self.emitters.retain(|e| e.subject != body);
    }

    /// Logs (rate-limited) or escalates a controller failure depending on `policy`.
    fn report_failure(
        &mut self,
        controller: &str,
        frame: u64,
        error: ScriptError,
        policy: ControllerFailurePolicy,
    ) -> Result<(), SimError> {
        self.failure_count += 1;
        if policy == ControllerFailurePolicy::Abort {
            return Err(SimError::ControllerEvaluation {
                controller: controller.to_string(),
                error,
            });
        }
        let log = self.failures.entry(controller.to_string()).or_default();
        let due = log
            .last_logged_frame
            .map_or(true, |last| frame.saturating_sub(last) >= FAILURE_LOG_INTERVAL_FRAMES);
        if due {
            warn!(
                "[Simdrive actuators] Controller '{}' failed at frame {}: {} ({} similar suppressed)",
                controller, frame, error, log.suppressed
            );
            log.last_logged_frame = Some(frame);
            log.suppressed = 0;
        } else {
            log.suppressed += 1;
        }
        Ok(())
    }

    pub fn evaluate_thrusters<E: Evaluator + ?Sized>(
        &mut self,
        world: &mut dyn PhysicsWorld,
        evaluator: &mut E,
        tick: &TickContext,
    ) -> Result<(), SimError> {
        let thrusters = self.thrusters.clone();
        for thruster in &thrusters {
            if !world.is_valid(thruster.subject) {
                continue;
            }
            let bindings = bindings_for(&*world, tick, Some(thruster.subject))?;
            let value = match evaluator.evaluate(&thruster.name, &thruster.expression, &bindings) {
                Ok(value) => value,
                Err(error) => {
                    self.report_failure(&thruster.name, tick.frame, error, tick.policy)?;
                    continue;
                }
            };
            let pose = world.pose(thruster.subject)?;
            if let Some(force) = controller_force(&value, &pose, thruster.lock_axis) {
                world.add_force(thruster.subject, force * tick.force_scale())?;
            }
        }
        Ok(())
    }

    /// Evaluates emitters and spawns due copies; returns `(spawned, source)` pairs.
    pub fn evaluate_emitters<E: Evaluator + ?Sized>(
        &mut self,
        world: &mut dyn PhysicsWorld,
        evaluator: &mut E,
        tick: &TickContext,
        emissions: &mut EmissionTracker,
    ) -> Result<Vec<(BodyHandle, BodyHandle)>, SimError> {
        let emitters = self.emitters.clone();
        let mut spawned = Vec::new();
        for emitter in &emitters {
            if !world.is_valid(emitter.subject) {
                continue;
            }
            let bindings = bindings_for(&*world, tick, Some(emitter.subject))?;
            let value = match evaluator.evaluate(&emitter.name, &emitter.expression, &bindings) {
                Ok(value) => Some(value),
                Err(error) => {
                    self.report_failure(&emitter.name, tick.frame, error, tick.policy)?;
                    None
                }
            };
            let pose = world.pose(emitter.subject)?;
            let force = value
                .as_ref()
                .and_then(|v| controller_force(v, &pose, emitter.lock_axis))
                .map(|f| f * tick.force_scale());

            let rate = u64::from(emitter.rate.max(1));
            if tick.frame == 0 || (tick.frame - 1) % rate != 0 {
                continue;
            }
            let body = world.clone_body(emitter.subject)?;
            world.set_static(body, false)?;
            world.set_collidable(body, true)?;
            world.set_continuous_collision(body, true)?;
            if let Some(force) = force {
                world.add_force(body, force)?;
            }
            emissions.register(body, emitter.subject, tick.frame, emitter.lifetime);
            spawned.push((body, emitter.subject));
        }
        Ok(spawned)
    }

    pub fn evaluate_joints<E: Evaluator + ?Sized>(
        &mut self,
        world: &mut dyn PhysicsWorld,
        evaluator: &mut E,
        tick: &TickContext,
    ) -> Result<(), SimError> {
        let before = self.joints.len();
        self.joints.retain(|j| world.is_joint_valid(j.joint));
        if self.joints.len() != before {
            debug!(
                "[Simdrive actuators] Pruned {} invalid joints",
                before - self.joints.len()
            );
        }
        let joints = self.joints.clone();
        for controller in &joints {
            let bindings = bindings_for(&*world, tick, None)?;
            let value =
                match evaluator.evaluate(&controller.name, &controller.expression, &bindings) {
                    Ok(value) => value,
                    Err(error) => {
                        self.report_failure(&controller.name, tick.frame, error, tick.policy)?;
                        continue;
                    }
                };
            let kind = world.joint_kind(controller.joint)?;
            match joint_target_update(kind, controller.raw, &value) {
                JointTargetUpdate::Set(target) => {
                    world.set_joint_target(controller.joint, Some(target))?
                }
                JointTargetUpdate::Clear => world.set_joint_target(controller.joint, None)?,
                JointTargetUpdate::Ignore => {}
            }
        }
        Ok(())
    }
}
