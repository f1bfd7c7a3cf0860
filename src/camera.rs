use bevy::prelude::*;

use crate::physics::{BodyHandle, PhysicsWorld};

/// Keeps the view locked onto a simulated body.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraBinding {
    pub body: BodyHandle,
    pub eye_offset: Vec3,
    pub target_offset: Vec3,
}

impl CameraBinding {
    pub fn new(body: BodyHandle) -> Self {
        Self {
            body,
            eye_offset: Vec3::new(0.0, 4.0, 10.0),
            target_offset: Vec3::ZERO,
        }
    }

    /// Derives `(eye, target)` from the body's current position; `None` once it is gone.
    pub fn view(&self, world: &dyn PhysicsWorld) -> Option<(Vec3, Vec3)> {
        let position = world.pose(self.body).ok()?.translation;
        Some((position + self.eye_offset, position + self.target_offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::{BasicWorld, BodyDesc, Pose, Shape, WorldSettings};

    #[test]
    fn follows_body_until_destroyed() {
        let mut world = BasicWorld::new(WorldSettings::default());
        let body = world.create_body(&BodyDesc::new(
            Shape::Sphere { radius: 1.0 },
            Pose::from_translation(Vec3::new(2.0, 0.0, 0.0)),
        ));
        let binding = CameraBinding::new(body);
        let (eye, target) = binding.view(&world).expect("bound");
        assert_eq!(target, Vec3::new(2.0, 0.0, 0.0));
        assert_eq!(eye, Vec3::new(2.0, 4.0, 10.0));

        world.destroy_body(body).expect("destroy");
        assert!(binding.view(&world).is_none());
    }
}
