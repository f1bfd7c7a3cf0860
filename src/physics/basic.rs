use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use bevy::prelude::*;

use super::{
    BodyDesc, BodyHandle, ContactEvent, ContactPhase, FluidPlane, JointDesc, JointHandle,
    JointKind, JointTarget, PhysicsWorld, Pose, RayHit, Shape, WorldFactory, WorldSettings,
};
use crate::error::InvalidReference;

/// Bodies closer than this (surface to surface) still count as touching.
const CONTACT_MARGIN: f32 = 0.01;
/// Fraction of penetration removed per sub-step.
const POSITION_CORRECTION: f32 = 0.8;
const MAX_LINEAR_SPEED: f32 = 500.0;

#[derive(Clone, Debug)]
struct BodyState {
    shape: Shape,
    pose: Pose,
    linear_velocity: Vec3,
    angular_velocity: Vec3,
    mass: f32,
    inertia: f32,
    density: f32,
    friction: f32,
    elasticity: f32,
    linear_damping: f32,
    angular_damping: f32,
    is_static: bool,
    collidable: bool,
    continuous_collision: bool,
    force: Vec3,
    torque: Vec3,
    last_force: Vec3,
    last_torque: Vec3,
}

impl BodyState {
    fn from_desc(desc: &BodyDesc) -> Self {
        let mass = (desc.shape.volume() * desc.density.max(0.0001)).max(0.0001);
        let radius = desc.shape.bounding_radius();
        Self {
            shape: desc.shape.clone(),
            pose: desc.pose,
            linear_velocity: desc.linear_velocity,
            angular_velocity: desc.angular_velocity,
            mass,
            inertia: (0.4 * mass * radius * radius).max(0.0001),
            density: desc.density,
            friction: desc.friction,
            elasticity: desc.elasticity.clamp(0.0, 1.0),
            linear_damping: desc.linear_damping.max(0.0),
            angular_damping: desc.angular_damping.max(0.0),
            is_static: desc.is_static,
            collidable: desc.collidable,
            continuous_collision: desc.continuous_collision,
            force: Vec3::ZERO,
            torque: Vec3::ZERO,
            last_force: Vec3::ZERO,
            last_torque: Vec3::ZERO,
        }
    }

    fn inv_mass(&self) -> f32 {
        if self.is_static {
            0.0
        } else {
            1.0 / self.mass
        }
    }

    fn radius(&self) -> f32 {
        self.shape.bounding_radius()
    }
}

#[derive(Clone, Debug)]
struct JointState {
    desc: JointDesc,
    target: Option<JointTarget>,
}

#[derive(Clone, Copy)]
struct TouchSample {
    point: Vec3,
    normal: Vec3,
    impulse: f32,
}

/// Deterministic reference world: bounding-sphere contacts, explicit Euler
/// integration, no joint constraint solving. Joint targets are stored only.
pub struct BasicWorld {
    settings: WorldSettings,
    bodies: BTreeMap<u64, BodyState>,
    joints: BTreeMap<u64, JointState>,
    next_body: u64,
    next_joint: u64,
    elapsed: f64,
    touching: BTreeMap<(u64, u64), TouchSample>,
    contacts: Vec<ContactEvent>,
    moved: Vec<BodyHandle>,
    steps: u64,
}

impl BasicWorld {
    pub fn new(settings: WorldSettings) -> Self {
        Self {
            settings,
            bodies: BTreeMap::new(),
            joints: BTreeMap::new(),
            next_body: 1,
            next_joint: 1,
            elapsed: 0.0,
            touching: BTreeMap::new(),
            contacts: Vec::new(),
            moved: Vec::new(),
            steps: 0,
        }
    }

    pub fn factory() -> Box<dyn WorldFactory> {
        Box::new(|settings: &WorldSettings| -> Box<dyn PhysicsWorld> {
            Box::new(BasicWorld::new(settings.clone()))
        })
    }

    pub fn settings(&self) -> &WorldSettings {
        &self.settings
    }

    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    pub fn joint_count(&self) -> usize {
        self.joints.len()
    }

    pub fn step_count(&self) -> u64 {
        self.steps
    }

    /// Net force applied to `body` during the most recent step.
    pub fn last_step_force(&self, body: BodyHandle) -> Option<Vec3> {
        self.bodies.get(&body.0).map(|b| b.last_force)
    }

    pub fn last_step_torque(&self, body: BodyHandle) -> Option<Vec3> {
        self.bodies.get(&body.0).map(|b| b.last_torque)
    }

    pub fn pending_force(&self, body: BodyHandle) -> Option<Vec3> {
        self.bodies.get(&body.0).map(|b| b.force)
    }

    pub fn joint_target(&self, joint: JointHandle) -> Option<JointTarget> {
        self.joints.get(&joint.0).and_then(|j| j.target)
    }

    pub fn joint_bodies(&self, joint: JointHandle) -> Option<(Option<BodyHandle>, BodyHandle)> {
        self.joints
            .get(&joint.0)
            .map(|j| (j.desc.parent, j.desc.child))
    }

    pub fn is_collidable(&self, body: BodyHandle) -> Option<bool> {
        self.bodies.get(&body.0).map(|b| b.collidable)
    }

    pub fn friction(&self, body: BodyHandle) -> Option<f32> {
        self.bodies.get(&body.0).map(|b| b.friction)
    }

    pub fn density(&self, body: BodyHandle) -> Option<f32> {
        self.bodies.get(&body.0).map(|b| b.density)
    }

    fn body(&self, body: BodyHandle) -> Result<&BodyState, InvalidReference> {
        self.bodies.get(&body.0).ok_or(InvalidReference::Body(body))
    }

    fn body_mut(&mut self, body: BodyHandle) -> Result<&mut BodyState, InvalidReference> {
        self.bodies
            .get_mut(&body.0)
            .ok_or(InvalidReference::Body(body))
    }

    fn joint_alive(&self, state: &JointState) -> bool {
        let parent_ok = state
            .desc
            .parent
            .map_or(true, |p| self.bodies.contains_key(&p.0));
        parent_ok && self.bodies.contains_key(&state.desc.child.0)
    }

    fn integrate(&mut self, dt: f32) {
        let gravity = self.settings.gravity;
        for body in self.bodies.values_mut() {
            if body.is_static {
                continue;
            }
            let accel = gravity + body.force / body.mass;
            body.linear_velocity += accel * dt;
            body.linear_velocity /= 1.0 + dt * body.linear_damping;
            body.linear_velocity = body.linear_velocity.clamp_length_max(MAX_LINEAR_SPEED);
            body.angular_velocity += body.torque / body.inertia * dt;
            body.angular_velocity /= 1.0 + dt * body.angular_damping;

            body.pose.translation += body.linear_velocity * dt;
            let spin = Quat::from_scaled_axis(body.angular_velocity * dt);
            body.pose.rotation = (spin * body.pose.rotation).normalize();
        }
    }

    fn collide(&mut self, touched: &mut BTreeMap<(u64, u64), TouchSample>) {
        let ids: Vec<u64> = self
            .bodies
            .iter()
            .filter(|(_, b)| b.collidable)
            .map(|(id, _)| *id)
            .collect();
        for (i, &a_id) in ids.iter().enumerate() {
            for &b_id in &ids[i + 1..] {
                let (Some(a), Some(b)) = (self.bodies.get(&a_id), self.bodies.get(&b_id)) else {
                    continue;
                };
                let delta = b.pose.translation - a.pose.translation;
                let dist = delta.length();
                let reach = a.radius() + b.radius();
                if dist >= reach + CONTACT_MARGIN {
                    continue;
                }
                let normal = if dist > 1e-6 { delta / dist } else { Vec3::Y };
                let point = a.pose.translation + normal * a.radius();
                let inv_a = a.inv_mass();
                let inv_b = b.inv_mass();
                let inv_sum = inv_a + inv_b;
                let mut impulse = 0.0;

                if inv_sum > 0.0 {
                    let penetration = reach - dist;
                    let restitution = a.elasticity.min(b.elasticity);
                    let relative = (b.linear_velocity - a.linear_velocity).dot(normal);
                    if relative < 0.0 {
                        impulse = -(1.0 + restitution) * relative / inv_sum;
                    }
                    let correction = if penetration > 0.0 {
                        normal * (penetration * POSITION_CORRECTION / inv_sum)
                    } else {
                        Vec3::ZERO
                    };
                    if let Some(a) = self.bodies.get_mut(&a_id) {
                        a.linear_velocity -= normal * impulse * inv_a;
                        a.pose.translation -= correction * inv_a;
                    }
                    if let Some(b) = self.bodies.get_mut(&b_id) {
                        b.linear_velocity += normal * impulse * inv_b;
                        b.pose.translation += correction * inv_b;
                    }
                }

                let entry = touched.entry((a_id, b_id)).or_insert(TouchSample {
                    point,
                    normal,
                    impulse: 0.0,
                });
                entry.point = point;
                entry.normal = normal;
                entry.impulse += impulse;
            }
        }
    }

    fn record_contacts(&mut self, touched: BTreeMap<(u64, u64), TouchSample>) {
        for (&(a, b), sample) in &touched {
            let phase = if self.touching.contains_key(&(a, b)) {
                ContactPhase::Persisting
            } else {
                ContactPhase::Began
            };
            self.contacts.push(ContactEvent {
                a: BodyHandle(a),
                b: BodyHandle(b),
                phase,
                point: sample.point,
                normal: sample.normal,
                impulse: sample.impulse,
            });
        }
        for (&(a, b), sample) in &self.touching {
            if touched.contains_key(&(a, b)) {
                continue;
            }
            if !self.bodies.contains_key(&a) || !self.bodies.contains_key(&b) {
                continue;
            }
            self.contacts.push(ContactEvent {
                a: BodyHandle(a),
                b: BodyHandle(b),
                phase: ContactPhase::Ended,
                point: sample.point,
                normal: sample.normal,
                impulse: 0.0,
            });
        }
        self.touching = touched;
    }
}

impl PhysicsWorld for BasicWorld {
    fn step(&mut self, dt: f32, substeps: u32) {
        let before: HashMap<u64, Pose> = self.bodies.iter().map(|(id, b)| (*id, b.pose)).collect();
        let mut touched = BTreeMap::new();
        for _ in 0..substeps.max(1) {
            self.integrate(dt);
            self.collide(&mut touched);
            self.elapsed += dt as f64;
        }
        for body in self.bodies.values_mut() {
            body.last_force = body.force;
            body.last_torque = body.torque;
            body.force = Vec3::ZERO;
            body.torque = Vec3::ZERO;
        }
        self.record_contacts(touched);
        for (id, body) in &self.bodies {
            if before.get(id).map_or(true, |pose| *pose != body.pose) {
                self.moved.push(BodyHandle(*id));
            }
        }
        self.steps += 1;
    }

    fn elapsed_time(&self) -> f64 {
        self.elapsed
    }

    fn bodies(&self) -> Vec<BodyHandle> {
        self.bodies.keys().map(|id| BodyHandle(*id)).collect()
    }

    fn is_valid(&self, body: BodyHandle) -> bool {
        self.bodies.contains_key(&body.0)
    }

    fn create_body(&mut self, desc: &BodyDesc) -> BodyHandle {
        let id = self.next_body;
        self.next_body += 1;
        self.bodies.insert(id, BodyState::from_desc(desc));
        BodyHandle(id)
    }

    fn clone_body(&mut self, body: BodyHandle) -> Result<BodyHandle, InvalidReference> {
        let mut copy = self.body(body)?.clone();
        copy.force = Vec3::ZERO;
        copy.torque = Vec3::ZERO;
        copy.last_force = Vec3::ZERO;
        copy.last_torque = Vec3::ZERO;
        let id = self.next_body;
        self.next_body += 1;
        self.bodies.insert(id, copy);
        Ok(BodyHandle(id))
    }

    fn destroy_body(&mut self, body: BodyHandle) -> Result<(), InvalidReference> {
        self.bodies
            .remove(&body.0)
            .map(|_| ())
            .ok_or(InvalidReference::Body(body))?;
        self.touching.retain(|(a, b), _| *a != body.0 && *b != body.0);
        self.moved.retain(|moved| *moved != body);
        Ok(())
    }

    fn pose(&self, body: BodyHandle) -> Result<Pose, InvalidReference> {
        Ok(self.body(body)?.pose)
    }

    fn linear_velocity(&self, body: BodyHandle) -> Result<Vec3, InvalidReference> {
        Ok(self.body(body)?.linear_velocity)
    }

    fn angular_velocity(&self, body: BodyHandle) -> Result<Vec3, InvalidReference> {
        Ok(self.body(body)?.angular_velocity)
    }

    fn mass(&self, body: BodyHandle) -> Result<f32, InvalidReference> {
        Ok(self.body(body)?.mass)
    }

    fn aabb(&self, body: BodyHandle) -> Result<(Vec3, Vec3), InvalidReference> {
        let state = self.body(body)?;
        let r = Vec3::splat(state.radius());
        Ok((state.pose.translation - r, state.pose.translation + r))
    }

    fn is_static(&self, body: BodyHandle) -> Result<bool, InvalidReference> {
        Ok(self.body(body)?.is_static)
    }

    fn set_static(&mut self, body: BodyHandle, is_static: bool) -> Result<(), InvalidReference> {
        let state = self.body_mut(body)?;
        state.is_static = is_static;
        if is_static {
            state.linear_velocity = Vec3::ZERO;
            state.angular_velocity = Vec3::ZERO;
        }
        Ok(())
    }

    fn set_collidable(
        &mut self,
        body: BodyHandle,
        collidable: bool,
    ) -> Result<(), InvalidReference> {
        self.body_mut(body)?.collidable = collidable;
        Ok(())
    }

    fn continuous_collision(&self, body: BodyHandle) -> Result<bool, InvalidReference> {
        Ok(self.body(body)?.continuous_collision)
    }

    fn set_continuous_collision(
        &mut self,
        body: BodyHandle,
        enabled: bool,
    ) -> Result<(), InvalidReference> {
        self.body_mut(body)?.continuous_collision = enabled;
        Ok(())
    }

    fn add_force(&mut self, body: BodyHandle, force: Vec3) -> Result<(), InvalidReference> {
        self.body_mut(body)?.force += force;
        Ok(())
    }

    fn add_force_at_point(
        &mut self,
        body: BodyHandle,
        force: Vec3,
        point: Vec3,
    ) -> Result<(), InvalidReference> {
        let state = self.body_mut(body)?;
        let arm = point - state.pose.translation;
        state.force += force;
        state.torque += arm.cross(force);
        Ok(())
    }

    fn add_torque(&mut self, body: BodyHandle, torque: Vec3) -> Result<(), InvalidReference> {
        self.body_mut(body)?.torque += torque;
        Ok(())
    }

    fn create_joint(&mut self, desc: &JointDesc) -> Result<JointHandle, InvalidReference> {
        if let Some(parent) = desc.parent {
            self.body(parent)?;
        }
        self.body(desc.child)?;
        let id = self.next_joint;
        self.next_joint += 1;
        self.joints.insert(
            id,
            JointState {
                desc: desc.clone(),
                target: None,
            },
        );
        Ok(JointHandle(id))
    }

    fn is_joint_valid(&self, joint: JointHandle) -> bool {
        self.joints
            .get(&joint.0)
            .map_or(false, |state| self.joint_alive(state))
    }

    fn joint_kind(&self, joint: JointHandle) -> Result<JointKind, InvalidReference> {
        if !self.is_joint_valid(joint) {
            return Err(InvalidReference::Joint(joint));
        }
        self.joints
            .get(&joint.0)
            .map(|j| j.desc.kind)
            .ok_or(InvalidReference::Joint(joint))
    }

    fn set_joint_target(
        &mut self,
        joint: JointHandle,
        target: Option<JointTarget>,
    ) -> Result<(), InvalidReference> {
        if !self.is_joint_valid(joint) {
            return Err(InvalidReference::Joint(joint));
        }
        let state = self
            .joints
            .get_mut(&joint.0)
            .ok_or(InvalidReference::Joint(joint))?;
        state.target = target;
        Ok(())
    }

    fn apply_buoyancy(&mut self, plane: &FluidPlane) {
        let normal = plane.normal.normalize_or_zero();
        if normal == Vec3::ZERO || plane.density <= 0.0 {
            return;
        }
        let gravity = self.settings.gravity;
        let viscosity = plane.viscosity.clamp(0.0, 1.0);
        for body in self.bodies.values_mut() {
            if body.is_static {
                continue;
            }
            let radius = body.radius().max(1e-4);
            let depth = (plane.origin - body.pose.translation).dot(normal);
            if depth <= -radius {
                continue;
            }
            let submerged = ((depth + radius) / (2.0 * radius)).clamp(0.0, 1.0);
            let displaced = body.shape.volume() * submerged;
            body.force += -gravity * plane.density * displaced;
            let relative = plane.current - body.linear_velocity;
            body.force += relative * viscosity * body.mass * submerged;
            body.torque -= body.angular_velocity * viscosity * body.inertia * submerged;
        }
    }

    fn apply_pick_drag(
        &mut self,
        body: BodyHandle,
        local_point: Vec3,
        target: Vec3,
        strength: f32,
    ) -> Result<(), InvalidReference> {
        let state = self.body_mut(body)?;
        if state.is_static {
            return Ok(());
        }
        let world_point = state.pose.transform_point(local_point);
        let arm = world_point - state.pose.translation;
        let point_velocity = state.linear_velocity + state.angular_velocity.cross(arm);
        let damping = 2.0 * strength.max(0.0).sqrt();
        let force = state.mass * ((target - world_point) * strength - point_velocity * damping);
        state.force += force;
        state.torque += arm.cross(force);
        Ok(())
    }

    fn drain_contacts(&mut self) -> Vec<ContactEvent> {
        std::mem::take(&mut self.contacts)
    }

    fn drain_moved(&mut self) -> Vec<BodyHandle> {
        let moved = std::mem::take(&mut self.moved);
        let mut seen = BTreeSet::new();
        moved
            .into_iter()
            .filter(|b| seen.insert(b.0) && self.bodies.contains_key(&b.0))
            .collect()
    }

    fn ray_cast(&self, origin: Vec3, direction: Vec3, max_distance: f32) -> Option<RayHit> {
        let dir = direction.normalize_or_zero();
        if dir == Vec3::ZERO {
            return None;
        }
        let mut best: Option<RayHit> = None;
        for (id, body) in &self.bodies {
            let to_center = body.pose.translation - origin;
            let along = to_center.dot(dir);
            let closest_sq = to_center.length_squared() - along * along;
            let r = body.radius();
            if closest_sq > r * r {
                continue;
            }
            let half_chord = (r * r - closest_sq).sqrt();
            let distance = if along - half_chord >= 0.0 {
                along - half_chord
            } else {
                along + half_chord
            };
            if distance < 0.0 || distance > max_distance {
                continue;
            }
            if best.map_or(true, |hit| distance < hit.distance) {
                best = Some(RayHit {
                    body: BodyHandle(*id),
                    distance,
                    point: origin + dir * distance,
                });
            }
        }
        best
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ball(at: Vec3) -> BodyDesc {
        BodyDesc::new(Shape::Sphere { radius: 0.5 }, Pose::from_translation(at))
    }

    fn zero_gravity() -> WorldSettings {
        WorldSettings {
            gravity: Vec3::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn gravity_accumulates_elapsed_time_per_substep() {
        let mut world = BasicWorld::new(WorldSettings::default());
        let body = world.create_body(&ball(Vec3::new(0.0, 10.0, 0.0)));
        world.step(1.0 / 240.0, 4);
        assert!((world.elapsed_time() - 1.0 / 60.0).abs() < 1e-6);
        assert!(world.linear_velocity(body).expect("valid").y < 0.0);
        assert_eq!(world.drain_moved(), vec![body]);
        assert!(world.drain_moved().is_empty());
    }

    #[test]
    fn forces_last_one_step() {
        let mut world = BasicWorld::new(zero_gravity());
        let body = world.create_body(&ball(Vec3::ZERO));
        world.add_force(body, Vec3::Z * 10.0).expect("valid");
        world.step(1.0 / 60.0, 1);
        assert_eq!(world.last_step_force(body), Some(Vec3::Z * 10.0));
        assert_eq!(world.pending_force(body), Some(Vec3::ZERO));
        world.step(1.0 / 60.0, 1);
        assert_eq!(world.last_step_force(body), Some(Vec3::ZERO));
    }

    #[test]
    fn contacts_begin_persist_and_end() {
        let mut world = BasicWorld::new(zero_gravity());
        let mut ground_desc = ball(Vec3::ZERO).fixed();
        ground_desc.elasticity = 0.0;
        let ground = world.create_body(&ground_desc);
        let mut rock_desc = ball(Vec3::new(0.0, 0.9, 0.0));
        rock_desc.elasticity = 0.0;
        let rock = world.create_body(&rock_desc);

        world.step(1.0 / 60.0, 1);
        let first = world.drain_contacts();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].phase, ContactPhase::Began);
        assert_eq!((first[0].a, first[0].b), (ground, rock));

        world.step(1.0 / 60.0, 1);
        let second = world.drain_contacts();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].phase, ContactPhase::Persisting);

        world.add_force(rock, Vec3::Y * 10_000.0).expect("valid");
        world.step(1.0 / 60.0, 1);
        let later = world.drain_contacts();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].phase, ContactPhase::Ended);
    }

    #[test]
    fn destroyed_bodies_invalidate_handles_and_joints() {
        let mut world = BasicWorld::new(zero_gravity());
        let a = world.create_body(&ball(Vec3::ZERO));
        let b = world.create_body(&ball(Vec3::X * 3.0));
        let joint = world
            .create_joint(&JointDesc {
                kind: JointKind::Hinge,
                parent: Some(a),
                child: b,
                anchor: Vec3::X,
                axis: Vec3::Z,
            })
            .expect("joint");
        assert!(world.is_joint_valid(joint));
        world.destroy_body(b).expect("destroy");
        assert!(!world.is_valid(b));
        assert!(!world.is_joint_valid(joint));
        assert_eq!(world.pose(b), Err(InvalidReference::Body(b)));
        assert_eq!(
            world.set_joint_target(joint, None),
            Err(InvalidReference::Joint(joint))
        );
        assert!(world.destroy_body(b).is_err());
    }

    #[test]
    fn buoyancy_pushes_submerged_bodies_up() {
        let mut world = BasicWorld::new(WorldSettings::default());
        let body = world.create_body(&ball(Vec3::new(0.0, -2.0, 0.0)));
        world.apply_buoyancy(&FluidPlane {
            origin: Vec3::ZERO,
            normal: Vec3::Y,
            density: 1.0,
            viscosity: 0.1,
            current: Vec3::ZERO,
        });
        assert!(world.pending_force(body).expect("valid").y > 0.0);
    }

    #[test]
    fn ray_cast_finds_nearest_sphere() {
        let mut world = BasicWorld::new(zero_gravity());
        let _far = world.create_body(&ball(Vec3::new(0.0, 0.0, 10.0)));
        let near = world.create_body(&ball(Vec3::new(0.0, 0.0, 5.0)));
        let hit = world
            .ray_cast(Vec3::ZERO, Vec3::Z, 100.0)
            .expect("should hit");
        assert_eq!(hit.body, near);
        assert!((hit.distance - 4.5).abs() < 1e-4);
    }
}
