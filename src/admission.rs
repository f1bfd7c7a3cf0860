use std::collections::{BTreeSet, HashSet};
use std::fmt;

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use crate::actuators::{Emitter, JointController, Thruster};
use crate::buoyancy::{BuoyancyPlane, PlaneSource};
use crate::camera::CameraBinding;
use crate::config::SimulationConfig;
use crate::error::SimError;
use crate::physics::{BodyDesc, BodyHandle, FluidPlane, JointDesc, JointKind, Pose, Shape};
use crate::script::ScriptBackend;
use crate::session::Session;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

fn default_true() -> bool {
    true
}

fn default_rotation() -> [f32; 4] {
    [0.0, 0.0, 0.0, 1.0]
}

fn default_density() -> f32 {
    1.0
}

fn default_linear_damping() -> f32 {
    0.01
}

fn default_angular_damping() -> f32 {
    0.05
}

fn default_rate() -> u32 {
    1
}

fn default_joint_axis() -> [f32; 3] {
    [0.0, 0.0, 1.0]
}

fn default_fluid_density() -> f32 {
    1.0
}

fn default_viscosity() -> f32 {
    0.1
}

fn default_fluid_normal() -> [f32; 3] {
    [0.0, 1.0, 0.0]
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BodyProperties {
    #[serde(default = "default_density")]
    pub density: f32,
    /// Falls back to the configured default.
    #[serde(default)]
    pub friction: Option<f32>,
    #[serde(default)]
    pub elasticity: Option<f32>,
    #[serde(default = "default_linear_damping")]
    pub linear_damping: f32,
    #[serde(default = "default_angular_damping")]
    pub angular_damping: f32,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default = "default_true")]
    pub collidable: bool,
    #[serde(default)]
    pub continuous_collision: bool,
    #[serde(default)]
    pub velocity: [f32; 3],
    #[serde(default)]
    pub spin: [f32; 3],
}

impl Default for BodyProperties {
    fn default() -> Self {
        Self {
            density: default_density(),
            friction: None,
            elasticity: None,
            linear_damping: default_linear_damping(),
            angular_damping: default_angular_damping(),
            is_static: false,
            collidable: true,
            continuous_collision: false,
            velocity: [0.0; 3],
            spin: [0.0; 3],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThrusterDef {
    pub expression: String,
    #[serde(default)]
    pub lock_axis: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmitterDef {
    pub expression: String,
    #[serde(default)]
    pub lock_axis: bool,
    #[serde(default = "default_rate")]
    pub rate: u32,
    #[serde(default)]
    pub lifetime: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JointDef {
    pub kind: JointKind,
    /// Bodies listing this tag in `joint_tags` are candidates for the joint.
    pub tag: String,
    #[serde(default = "default_joint_axis")]
    pub axis: [f32; 3],
    #[serde(default)]
    pub controller: Option<String>,
    #[serde(default)]
    pub raw: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BuoyancyDef {
    #[serde(default = "default_fluid_density")]
    pub density: f32,
    #[serde(default = "default_viscosity")]
    pub viscosity: f32,
    #[serde(default = "default_fluid_normal")]
    pub normal: [f32; 3],
    #[serde(default)]
    pub current: [f32; 3],
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SceneNode {
    pub id: NodeId,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub simulate: bool,
    #[serde(default)]
    pub shape: Option<Shape>,
    #[serde(default)]
    pub translation: [f32; 3],
    /// Quaternion `[x, y, z, w]`.
    #[serde(default = "default_rotation")]
    pub rotation: [f32; 4],
    #[serde(default)]
    pub body: BodyProperties,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub thruster: Option<ThrusterDef>,
    #[serde(default)]
    pub emitter: Option<EmitterDef>,
    #[serde(default)]
    pub joint: Option<JointDef>,
    #[serde(default)]
    pub joint_tags: Vec<String>,
    #[serde(default)]
    pub buoyancy: Option<BuoyancyDef>,
    #[serde(default)]
    pub camera_follow: bool,
}

impl SceneNode {
    pub fn new(id: u64) -> Self {
        Self {
            id: NodeId(id),
            name: String::new(),
            simulate: true,
            shape: None,
            translation: [0.0; 3],
            rotation: default_rotation(),
            body: BodyProperties::default(),
            script: None,
            thruster: None,
            emitter: None,
            joint: None,
            joint_tags: Vec::new(),
            buoyancy: None,
            camera_follow: false,
        }
    }

    pub fn label(&self) -> String {
        if self.name.is_empty() {
            self.id.to_string()
        } else {
            self.name.clone()
        }
    }

    pub fn pose(&self) -> Pose {
        let rotation = Quat::from_array(self.rotation);
        Pose {
            translation: Vec3::from_array(self.translation),
            rotation: if rotation.length_squared() > 0.0 {
                rotation.normalize()
            } else {
                Quat::IDENTITY
            },
        }
    }

    fn body_desc(&self, config: &SimulationConfig) -> Option<BodyDesc> {
        let shape = self.shape.clone()?;
        let props = &self.body;
        Some(BodyDesc {
            shape,
            pose: self.pose(),
            density: props.density,
            friction: props.friction.unwrap_or(config.default_friction),
            elasticity: props.elasticity.unwrap_or(config.default_elasticity),
            linear_damping: props.linear_damping,
            angular_damping: props.angular_damping,
            is_static: props.is_static,
            collidable: props.collidable,
            continuous_collision: props.continuous_collision,
            linear_velocity: Vec3::from_array(props.velocity),
            angular_velocity: Vec3::from_array(props.spin),
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    #[serde(default)]
    pub nodes: Vec<SceneNode>,
}

impl Scene {
    pub fn from_json_str(contents: &str) -> Result<Self, SimError> {
        serde_json::from_str(contents).map_err(|e| SimError::Scene(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), SimError> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id) {
                return Err(SimError::Scene(format!("duplicate node id {}", node.id.0)));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct JointCandidate {
    pub body: BodyHandle,
    pub centroid: Vec3,
}

/// Picks `(parent, child)` for a joint anchored at `anchor`: unmatched bodies first, then
/// the nearest. A single candidate becomes the child, attached to the world.
pub fn match_joint_bodies(
    anchor: Vec3,
    candidates: &[JointCandidate],
    used: &BTreeSet<BodyHandle>,
) -> Option<(Option<BodyHandle>, BodyHandle)> {
    let mut ranked: Vec<(bool, f32, BodyHandle)> = candidates
        .iter()
        .map(|c| {
            (
                used.contains(&c.body),
                c.centroid.distance_squared(anchor),
                c.body,
            )
        })
        .collect();
    ranked.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then(a.1.total_cmp(&b.1))
            .then(a.2.cmp(&b.2))
    });
    match ranked.as_slice() {
        [] => None,
        [only] => Some((None, only.2)),
        [first, second, ..] => Some((Some(first.2), second.2)),
    }
}

impl Session {
    /// Turns eligible scene nodes into bodies, scripts, actuators and joints.
    pub fn admit(
        &mut self,
        scene: &Scene,
        scripts: &mut dyn ScriptBackend,
        config: &SimulationConfig,
    ) -> Result<(), SimError> {
        scene.validate()?;

        for node in scene.nodes.iter().filter(|n| n.simulate && n.joint.is_none()) {
            let Some(desc) = node.body_desc(config) else {
                continue;
            };
            if desc.shape.is_degenerate() {
                warn!(
                    "[Simdrive admission] Skipping {}: degenerate collision shape",
                    node.label()
                );
                continue;
            }
            let body = self.world.create_body(&desc);
            self.node_bodies.insert(node.id, body);
            let label = node.label();

            if let Some(source) = node.script.as_deref().filter(|s| !s.trim().is_empty()) {
                let script = scripts
                    .load_body_script(&label, source, body, self.frame)
                    .map_err(SimError::AdmissionScript)?;
                self.scripts.insert(body, script);
            }
            if let Some(def) = node.thruster.as_ref().filter(|d| !d.expression.trim().is_empty()) {
                self.actuators.thrusters.push(Thruster {
                    name: format!("{label}.thruster"),
                    subject: body,
                    expression: def.expression.clone(),
                    lock_axis: def.lock_axis,
                });
            }
            if let Some(def) = node.emitter.as_ref().filter(|d| !d.expression.trim().is_empty()) {
                if def.rate == 0 {
                    warn!("[Simdrive admission] {} emitter rate 0 raised to 1", label);
                }
                self.actuators.emitters.push(Emitter {
                    name: format!("{label}.emitter"),
                    subject: body,
                    expression: def.expression.clone(),
                    lock_axis: def.lock_axis,
                    rate: def.rate.max(1),
                    lifetime: def.lifetime,
                });
            }
            if let Some(def) = node.buoyancy.as_ref() {
                if let Some(fluid) = fluid_plane(node, def, Vec3::ZERO, Vec3::from_array(def.normal)) {
                    self.buoyancy.add(BuoyancyPlane {
                        source: PlaneSource::Body(body),
                        fluid,
                    });
                }
            }
            if node.camera_follow {
                self.camera = Some(CameraBinding::new(body));
            }
        }

        for node in &scene.nodes {
            let Some(def) = node.buoyancy.as_ref() else {
                continue;
            };
            if self.node_bodies.contains_key(&node.id) {
                continue;
            }
            let pose = node.pose();
            let normal = pose.local_axis(Vec3::from_array(def.normal));
            if let Some(fluid) = fluid_plane(node, def, pose.translation, normal) {
                self.buoyancy.add(BuoyancyPlane {
                    source: PlaneSource::Node(node.id),
                    fluid,
                });
            }
        }

        self.admit_joints(scene)?;
        info!(
            "[Simdrive admission] Admitted {} bodies, {} scripts, {} thrusters, {} emitters, {} joints, {} buoyancy planes",
            self.node_bodies.len(),
            self.scripts.len(),
            self.actuators.thrusters.len(),
            self.actuators.emitters.len(),
            self.actuators.joints.len(),
            self.buoyancy.len()
        );
        Ok(())
    }

    fn admit_joints(&mut self, scene: &Scene) -> Result<(), SimError> {
        let mut used = BTreeSet::new();
        for node in scene.nodes.iter().filter(|n| n.simulate) {
            let Some(def) = node.joint.as_ref() else {
                continue;
            };
            let candidates: Vec<JointCandidate> = scene
                .nodes
                .iter()
                .filter(|n| n.joint_tags.iter().any(|t| *t == def.tag))
                .filter_map(|n| {
                    let body = *self.node_bodies.get(&n.id)?;
                    let centroid = self.world.pose(body).ok()?.translation;
                    Some(JointCandidate { body, centroid })
                })
                .collect();
            let pose = node.pose();
            let Some((parent, child)) = match_joint_bodies(pose.translation, &candidates, &used)
            else {
                warn!(
                    "[Simdrive admission] Joint {} has no body tagged '{}'",
                    node.label(),
                    def.tag
                );
                continue;
            };
            used.insert(child);
            if let Some(parent) = parent {
                used.insert(parent);
            }
            let joint = self.world.create_joint(&JointDesc {
                kind: def.kind,
                parent,
                child,
                anchor: pose.translation,
                axis: pose.local_axis(Vec3::from_array(def.axis)),
            })?;
            if let Some(expression) = def.controller.as_ref().filter(|e| !e.trim().is_empty()) {
                self.actuators.joints.push(JointController {
                    name: format!("{}.joint", node.label()),
                    joint,
                    expression: expression.clone(),
                    raw: def.raw,
                });
            }
        }
        Ok(())
    }
}

fn fluid_plane(node: &SceneNode, def: &BuoyancyDef, origin: Vec3, normal: Vec3) -> Option<FluidPlane> {
    if def.density.is_nan() || def.density <= 0.0 {
        warn!(
            "[Simdrive admission] {} buoyancy ignored: fluid density must be positive",
            node.label()
        );
        return None;
    }
    Some(FluidPlane {
        origin,
        normal: normal.try_normalize().unwrap_or(Vec3::Y),
        density: def.density,
        viscosity: def.viscosity.clamp(0.0, 1.0),
        current: Vec3::from_array(def.current),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ViewSnapshot;
    use crate::physics::{BasicWorld, WorldSettings};
    use crate::script::{RhaiRuntime, ScriptEventKind};

    fn session() -> Session {
        Session::new(
            &SimulationConfig::default(),
            Box::new(BasicWorld::new(WorldSettings::default())),
            ViewSnapshot::default(),
        )
    }

    fn ball(id: u64, at: [f32; 3]) -> SceneNode {
        SceneNode {
            shape: Some(Shape::Sphere { radius: 0.5 }),
            translation: at,
            ..SceneNode::new(id)
        }
    }

    #[test]
    fn joint_matching_prefers_unused_then_nearest() {
        let a = JointCandidate {
            body: BodyHandle(1),
            centroid: Vec3::ZERO,
        };
        let b = JointCandidate {
            body: BodyHandle(2),
            centroid: Vec3::X * 2.0,
        };
        let c = JointCandidate {
            body: BodyHandle(3),
            centroid: Vec3::X * 10.0,
        };
        let mut used = BTreeSet::new();
        assert_eq!(
            match_joint_bodies(Vec3::X, &[c, b, a], &used),
            Some((Some(BodyHandle(1)), BodyHandle(2)))
        );
        used.insert(BodyHandle(1));
        assert_eq!(
            match_joint_bodies(Vec3::X, &[a, b, c], &used),
            Some((Some(BodyHandle(2)), BodyHandle(3)))
        );
        assert_eq!(
            match_joint_bodies(Vec3::ZERO, &[c], &used),
            Some((None, BodyHandle(3)))
        );
        assert_eq!(match_joint_bodies(Vec3::ZERO, &[], &used), None);
    }

    #[test]
    fn admits_bodies_actuators_scripts_and_joints() {
        let mut thruster = ball(1, [0.0, 0.0, 0.0]);
        thruster.name = "rocket".into();
        thruster.thruster = Some(ThrusterDef {
            expression: "10".into(),
            lock_axis: false,
        });
        thruster.joint_tags = vec!["arm".into()];
        thruster.script = Some("fn onUpdate() { }".into());

        let mut arm = ball(2, [2.0, 0.0, 0.0]);
        arm.joint_tags = vec!["arm".into()];
        arm.emitter = Some(EmitterDef {
            expression: "".into(),
            lock_axis: false,
            rate: 1,
            lifetime: 0,
        });

        let mut hinge = SceneNode::new(3);
        hinge.translation = [1.0, 0.0, 0.0];
        hinge.joint = Some(JointDef {
            kind: JointKind::Hinge,
            tag: "arm".into(),
            axis: default_joint_axis(),
            controller: Some("45".into()),
            raw: false,
        });

        let mut hidden = ball(4, [9.0, 0.0, 0.0]);
        hidden.simulate = false;

        let mut pool = SceneNode::new(5);
        pool.buoyancy = Some(BuoyancyDef {
            density: 1.0,
            viscosity: 3.0,
            normal: default_fluid_normal(),
            current: [0.0; 3],
        });

        let scene = Scene {
            nodes: vec![thruster, arm, hinge, hidden, pool],
        };
        let mut session = session();
        let mut runtime = RhaiRuntime::default();
        session
            .admit(&scene, &mut runtime, &SimulationConfig::default())
            .expect("admit");

        assert_eq!(session.node_bodies.len(), 2);
        assert_eq!(session.scripts.len(), 1);
        assert!(session.scripts.values().all(|s| s.has_handler(ScriptEventKind::Update)));
        assert_eq!(session.actuators.thrusters.len(), 1);
        assert_eq!(session.actuators.thrusters[0].name, "rocket.thruster");
        assert!(session.actuators.emitters.is_empty());
        assert_eq!(session.actuators.joints.len(), 1);
        assert!(session.world.is_joint_valid(session.actuators.joints[0].joint));
        assert_eq!(session.buoyancy.len(), 1);
    }

    #[test]
    fn admission_script_failure_is_reported_with_line() {
        let mut node = ball(1, [0.0; 3]);
        node.name = "crate".into();
        node.script = Some("let a = 1;\nthrow \"setup failed\";\n".into());
        let scene = Scene { nodes: vec![node] };
        let err = session()
            .admit(&scene, &mut RhaiRuntime::default(), &SimulationConfig::default())
            .expect_err("script throws");
        match err {
            SimError::AdmissionScript(error) => {
                assert_eq!(error.script, "crate");
                assert_eq!(error.line, Some(2));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn duplicate_ids_and_bad_json_are_scene_errors() {
        let scene = Scene {
            nodes: vec![ball(1, [0.0; 3]), ball(1, [1.0; 3])],
        };
        assert!(matches!(scene.validate(), Err(SimError::Scene(_))));
        assert!(matches!(Scene::from_json_str("{"), Err(SimError::Scene(_))));

        let parsed = Scene::from_json_str(
            r#"{"nodes": [{"id": 7, "shape": {"type": "sphere", "radius": 1.0},
                "thruster": {"expression": "5"}}]}"#,
        )
        .expect("parse");
        assert_eq!(parsed.nodes[0].id, NodeId(7));
        assert!(parsed.nodes[0].simulate);
        assert_eq!(parsed.nodes[0].rotation, [0.0, 0.0, 0.0, 1.0]);
    }
}
