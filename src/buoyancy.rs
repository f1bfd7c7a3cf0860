use bevy::prelude::*;

use crate::admission::NodeId;
use crate::physics::{BodyHandle, FluidPlane, PhysicsWorld};

/// What a buoyancy plane is attached to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaneSource {
    /// Follows the body's pose; removed once the body is invalid.
    Body(BodyHandle),
    /// A scene node that is not simulated; fixed for the session.
    Node(NodeId),
}

#[derive(Clone, Debug, PartialEq)]
pub struct BuoyancyPlane {
    pub source: PlaneSource,
    /// Fluid in the source's local frame.
    pub fluid: FluidPlane,
}

#[derive(Default, Debug)]
pub struct BuoyancyRegistry {
    planes: Vec<BuoyancyPlane>,
}

impl BuoyancyRegistry {
    pub fn add(&mut self, plane: BuoyancyPlane) {
        self.planes.push(plane);
    }

    pub fn len(&self) -> usize {
        self.planes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.planes.is_empty()
    }

    pub fn clear(&mut self) {
        self.planes.clear();
    }

    pub fn remove_node(&mut self, node: NodeId) {
        self.planes.retain(|p| p.source != PlaneSource::Node(node));
    }

    /// Applies every plane to every dynamic body; planes on dead bodies are dropped.
    pub fn apply(&mut self, world: &mut dyn PhysicsWorld) -> usize {
        self.planes.retain(|plane| match plane.source {
            PlaneSource::Body(body) => world.is_valid(body),
            PlaneSource::Node(_) => true,
        });
        for plane in &self.planes {
            let fluid = match plane.source {
                PlaneSource::Body(body) => match world.pose(body) {
                    Ok(pose) => FluidPlane {
                        origin: pose.transform_point(plane.fluid.origin),
                        normal: pose.local_axis(plane.fluid.normal),
                        ..plane.fluid
                    },
                    Err(_) => continue,
                },
                PlaneSource::Node(_) => plane.fluid,
            };
            world.apply_buoyancy(&fluid);
        }
        self.planes.len()
    }
}
