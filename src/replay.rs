use std::cell::RefCell;
use std::rc::Rc;

use serde::Serialize;

use crate::physics::{BodyHandle, PhysicsWorld};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BodyPoseRecord {
    pub body: BodyHandle,
    pub translation: [f32; 3],
    pub rotation: [f32; 4],
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FrameSnapshot {
    pub frame: u64,
    pub time: f64,
    pub bodies: Vec<BodyPoseRecord>,
}

impl FrameSnapshot {
    pub fn capture(world: &dyn PhysicsWorld, frame: u64) -> Self {
        let bodies = world
            .bodies()
            .into_iter()
            .filter_map(|body| {
                let pose = world.pose(body).ok()?;
                Some(BodyPoseRecord {
                    body,
                    translation: pose.translation.to_array(),
                    rotation: pose.rotation.to_array(),
                })
            })
            .collect();
        Self {
            frame,
            time: world.elapsed_time(),
            bodies,
        }
    }
}

/// Receives one snapshot per tick while recording is enabled.
pub trait Recorder {
    fn record_frame(&mut self, frame: u64, snapshot: &FrameSnapshot);
}

#[derive(Default, Debug, Serialize)]
pub struct MemoryRecorder {
    pub frames: Vec<FrameSnapshot>,
}

impl MemoryRecorder {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl Recorder for MemoryRecorder {
    fn record_frame(&mut self, _frame: u64, snapshot: &FrameSnapshot) {
        self.frames.push(snapshot.clone());
    }
}

impl<R: Recorder> Recorder for Rc<RefCell<R>> {
    fn record_frame(&mut self, frame: u64, snapshot: &FrameSnapshot) {
        self.borrow_mut().record_frame(frame, snapshot);
    }
}
