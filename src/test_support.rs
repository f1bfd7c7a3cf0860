use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use bevy::prelude::*;

use crate::admission::SceneNode;
use crate::error::ScriptError;
use crate::host::{CursorShape, HostHooks, StatusLine, ViewSnapshot};
use crate::overlay::DebugShape;
use crate::physics::{BodyHandle, Shape};
use crate::script::{
    Bindings, BodyScript, ControllerValue, Evaluator, RhaiRuntime, ScriptBackend, ScriptEventKind,
};

pub type EventLog = Rc<RefCell<Vec<(BodyHandle, ScriptEventKind)>>>;

/// Resolves a node's `script` field to a prebuilt native script; expressions go to rhai.
#[derive(Default)]
pub struct NativeScripts {
    pub scripts: HashMap<String, BodyScript>,
    pub evaluator: RhaiRuntime,
}

impl NativeScripts {
    pub fn with(mut self, key: &str, script: BodyScript) -> Self {
        self.scripts.insert(key.to_string(), script);
        self
    }
}

impl Evaluator for NativeScripts {
    fn evaluate(
        &mut self,
        name: &str,
        source: &str,
        bindings: &Bindings,
    ) -> Result<ControllerValue, ScriptError> {
        self.evaluator.evaluate(name, source, bindings)
    }
}

impl ScriptBackend for NativeScripts {
    fn load_body_script(
        &mut self,
        name: &str,
        source: &str,
        _body: BodyHandle,
        _frame: u64,
    ) -> Result<BodyScript, ScriptError> {
        self.scripts
            .get(source)
            .cloned()
            .ok_or_else(|| ScriptError::new(name, format!("unknown script {source}")))
    }
}

/// A script that appends every event it receives to `log`.
pub fn logging_script(log: &EventLog) -> BodyScript {
    let mut script = BodyScript::new("logger");
    for kind in ScriptEventKind::ALL {
        let log = log.clone();
        script.set_handler(
            kind,
            crate::script::EventHandler::native(move |ctx| {
                log.borrow_mut().push((ctx.body, ctx.event));
                Ok(())
            }),
        );
    }
    script
}

#[derive(Default)]
pub struct RecordingHost {
    pub snapshots: usize,
    pub restores: usize,
    pub spawned: Vec<BodyHandle>,
    pub despawned: Vec<BodyHandle>,
    pub synced: usize,
    pub cursor: CursorShape,
    pub selected: HashSet<BodyHandle>,
    pub audio_paused: bool,
    pub audio_resumes: usize,
    pub audio_time: f32,
    pub camera: Option<(Vec3, Vec3)>,
    pub status: Option<StatusLine>,
    pub redraws: usize,
}

impl HostHooks for RecordingHost {
    fn snapshot_view(&mut self) -> ViewSnapshot {
        self.snapshots += 1;
        ViewSnapshot {
            camera_eye: Vec3::new(0.0, 5.0, 20.0),
            camera_target: Vec3::ZERO,
        }
    }

    fn restore_view(&mut self, _snapshot: &ViewSnapshot) {
        self.restores += 1;
    }

    fn sync_visual(&mut self, _body: BodyHandle, _pose: &crate::physics::Pose) {
        self.synced += 1;
    }

    fn spawn_visual(&mut self, body: BodyHandle, _source: BodyHandle) {
        self.spawned.push(body);
    }

    fn despawn_visual(&mut self, body: BodyHandle) {
        self.despawned.push(body);
    }

    fn set_cursor(&mut self, cursor: CursorShape) {
        self.cursor = cursor;
    }

    fn set_selected(&mut self, body: BodyHandle, selected: bool) {
        if selected {
            self.selected.insert(body);
        } else {
            self.selected.remove(&body);
        }
    }

    fn is_selected(&self, body: BodyHandle) -> bool {
        self.selected.contains(&body)
    }

    fn pause_audio(&mut self) {
        self.audio_paused = true;
    }

    fn resume_audio(&mut self) {
        self.audio_paused = false;
        self.audio_resumes += 1;
    }

    fn advance_audio(&mut self, dt: f32) {
        self.audio_time += dt;
    }

    fn set_camera(&mut self, eye: Vec3, target: Vec3) {
        self.camera = Some((eye, target));
    }

    fn show_status(&mut self, status: &StatusLine) {
        self.status = Some(status.clone());
    }

    fn request_redraw(&mut self, _overlay: &[DebugShape]) {
        self.redraws += 1;
    }
}

pub fn ball(id: u64, translation: [f32; 3]) -> SceneNode {
    let mut node = SceneNode::new(id);
    node.name = format!("ball{id}");
    node.shape = Some(Shape::Sphere { radius: 0.5 });
    node.translation = translation;
    node
}
