use bevy::prelude::*;

use crate::admission::{NodeId, Scene};
use crate::camera::CameraBinding;
use crate::config::{clamp_update_rate, clamp_update_timestep, SimulationConfig, SimulationMode};
use crate::dispatch::DispatchGuard;
use crate::error::{InvalidReference, SimError};
use crate::host::{HostHooks, NullHost};
use crate::physics::{BasicWorld, BodyHandle, PhysicsWorld, WorldFactory};
use crate::replay::Recorder;
use crate::script::{EventArgs, RhaiRuntime, ScriptBackend, ScriptEventKind};
use crate::session::{Session, SessionState};
use crate::stats::TimingStats;
use crate::transition::ViewTransition;

/// Farthest a pick ray reaches.
const PICK_DISTANCE: f32 = 1000.0;

/// Owns at most one [`Session`] and exposes the host-facing control surface.
pub struct Simulator {
    pub(crate) config: SimulationConfig,
    pub(crate) factory: Box<dyn WorldFactory>,
    pub(crate) scripts: Box<dyn ScriptBackend>,
    pub(crate) host: Box<dyn HostHooks>,
    pub(crate) recorder: Option<Box<dyn Recorder>>,
    pub(crate) session: Option<Session>,
    pub(crate) last_error: Option<SimError>,
    terminated: bool,
}

impl Simulator {
    pub fn new(config: SimulationConfig) -> Self {
        let config = config.normalized();
        let scripts = RhaiRuntime::from_config(&config);
        Self {
            config,
            factory: BasicWorld::factory(),
            scripts: Box::new(scripts),
            host: Box::new(NullHost),
            recorder: None,
            session: None,
            last_error: None,
            terminated: false,
        }
    }

    pub fn with_world_factory(mut self, factory: Box<dyn WorldFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_scripts(mut self, scripts: Box<dyn ScriptBackend>) -> Self {
        self.scripts = scripts;
        self
    }

    pub fn with_host(mut self, host: Box<dyn HostHooks>) -> Self {
        self.host = host;
        self
    }

    pub fn with_recorder(mut self, recorder: Box<dyn Recorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    // ---- lifecycle ----

    /// Builds a world from `scene` and starts playing. Admission failures tear down before
    /// the first tick and are returned.
    pub fn start(&mut self, scene: &Scene) -> Result<(), SimError> {
        if self.session.is_some() {
            warn!("[Simdrive session] start() ignored: a session is already active");
            return Err(SimError::AlreadyActive);
        }
        self.last_error = None;
        self.terminated = false;

        let snapshot = self.host.snapshot_view();
        self.scripts.begin_session(self.config.rng_seed);
        let world = self.factory.create(&self.config.world_settings());
        let mut session = Session::new(&self.config, world, snapshot);
        let admitted = session.admit(scene, self.scripts.as_mut(), &self.config);
        let bodies = session.world.bodies().len();
        self.session = Some(session);

        if let Err(err) = admitted {
            error!("[Simdrive session] Admission failed: {}", err);
            if let Some(end_error) = self.teardown(false) {
                debug!("[Simdrive session] Ignoring teardown error: {}", end_error);
            }
            self.last_error = Some(err.clone());
            return Err(err);
        }
        info!(
            "[Simdrive session] Started with {} bodies (rate {}, timestep {:.5}s, {:?})",
            bodies, self.config.update_rate, self.config.update_timestep, self.config.mode
        );

        self.with_session(|session, host| {
            session.dispatch_all(
                ScriptEventKind::Start,
                &EventArgs::None,
                host,
                DispatchGuard::WhileLive,
            )
        })
    }

    /// Tears the session down. A no-op without an active session.
    pub fn reset(&mut self) {
        if self.session.is_none() {
            return;
        }
        info!("[Simdrive session] Reset requested");
        if let Some(err) = self.teardown(true) {
            self.last_error = Some(err);
        }
    }

    pub fn stop(&mut self) {
        self.reset();
    }

    pub fn pause(&mut self) -> Result<(), SimError> {
        self.set_paused(true)
    }

    pub fn play(&mut self) -> Result<(), SimError> {
        self.set_paused(false)
    }

    pub fn toggle_play(&mut self) -> Result<(), SimError> {
        let paused = self.session.as_ref().ok_or(SimError::NotActive)?.paused;
        self.set_paused(!paused)
    }

    fn set_paused(&mut self, paused: bool) -> Result<(), SimError> {
        self.with_session(|session, host| {
            if session.paused == paused {
                return Ok(());
            }
            session.paused = paused;
            info!(
                "[Simdrive session] {} at frame {}",
                if paused { "Paused" } else { "Playing" },
                session.frame
            );
            let kind = if paused {
                ScriptEventKind::Pause
            } else {
                ScriptEventKind::Play
            };
            session.dispatch_all(kind, &EventArgs::None, host, DispatchGuard::WhileLive)
        })
    }

    /// Runs `f` against the live session, then aborts on error or tears down if a
    /// script asked to stop.
    pub(crate) fn with_session<R>(
        &mut self,
        f: impl FnOnce(&mut Session, &mut dyn HostHooks) -> Result<R, SimError>,
    ) -> Result<R, SimError> {
        let Some(session) = self.session.as_mut() else {
            return Err(SimError::NotActive);
        };
        let result = f(session, self.host.as_mut());
        self.settle(result)
    }

    pub(crate) fn settle<R>(&mut self, result: Result<R, SimError>) -> Result<R, SimError> {
        match result {
            Err(err) => Err(self.abort(err)),
            Ok(value) => {
                if self.session.as_ref().is_some_and(|s| !s.is_live()) {
                    if let Some(err) = self.teardown(true) {
                        self.last_error = Some(err);
                    }
                }
                Ok(value)
            }
        }
    }

    /// Tears down after a script failure; the error is kept for `last_error()` and returned.
    pub(crate) fn abort(&mut self, err: SimError) -> SimError {
        let frame = self.frame();
        match err.script_error().and_then(|e| e.line) {
            Some(line) => error!(
                "[Simdrive session] Aborting at frame {} (line {}): {}",
                frame, line, err
            ),
            None => error!("[Simdrive session] Aborting at frame {}: {}", frame, err),
        }
        if let Some(end_error) = self.teardown(true) {
            debug!("[Simdrive session] Ignoring onEnd failure during abort: {}", end_error);
        }
        self.last_error = Some(err.clone());
        err
    }

    /// Dispatches `onEnd`, destroys emitted bodies and the world, restores the view.
    /// Returns the first `onEnd` failure; teardown always completes.
    fn teardown(&mut self, notify_end: bool) -> Option<SimError> {
        let mut session = self.session.take()?;
        let host = self.host.as_mut();

        let mut end_error = None;
        if notify_end {
            if let Err(err) = session.dispatch_all(
                ScriptEventKind::End,
                &EventArgs::None,
                host,
                DispatchGuard::Always,
            ) {
                warn!("[Simdrive session] onEnd failed: {}", err);
                end_error = Some(err);
            }
        }

        session.drag.end(session.world.as_mut(), host);
        let destroyed = session
            .emissions
            .drain_all(session.world.as_mut(), |body| host.despawn_visual(body));
        if session.was_paused {
            host.resume_audio();
        }
        session.clear_registries();
        host.restore_view(&session.view_snapshot);
        let frame = session.frame;
        drop(session);

        self.scripts.end_session();
        self.terminated = true;
        info!(
            "[Simdrive session] Terminated at frame {} ({} emitted bodies destroyed)",
            frame, destroyed
        );
        end_error
    }

    // ---- input ----

    pub fn key_down(&mut self, key: &str) -> Result<(), SimError> {
        self.dispatch_key(ScriptEventKind::KeyDown, key)
    }

    pub fn key_up(&mut self, key: &str) -> Result<(), SimError> {
        self.dispatch_key(ScriptEventKind::KeyUp, key)
    }

    fn dispatch_key(&mut self, kind: ScriptEventKind, key: &str) -> Result<(), SimError> {
        let args = EventArgs::Key(key.to_string());
        self.with_session(|session, host| {
            session.dispatch_all(kind, &args, host, DispatchGuard::WhileLive)
        })
    }

    /// Casts a pick ray. Interactive mode grabs the hit body for dragging; game mode
    /// sends it `onPickDown`.
    pub fn pick_down(
        &mut self,
        origin: Vec3,
        direction: Vec3,
    ) -> Result<Option<BodyHandle>, SimError> {
        self.with_session(|session, host| {
            let Some(hit) = session.world.ray_cast(origin, direction, PICK_DISTANCE) else {
                return Ok(None);
            };
            match session.mode {
                SimulationMode::Interactive => {
                    let frame = session.frame;
                    let grabbed =
                        session
                            .drag
                            .begin(session.world.as_mut(), host, hit.body, hit.point, frame);
                    Ok(grabbed.then_some(hit.body))
                }
                SimulationMode::Game => {
                    session.picked = Some(hit.body);
                    let args = EventArgs::Pick { point: hit.point };
                    session.dispatch_to(hit.body, ScriptEventKind::PickDown, &args, host)?;
                    Ok(Some(hit.body))
                }
            }
        })
    }

    pub fn drag_to(&mut self, target: Vec3) -> Result<(), SimError> {
        let session = self.session.as_mut().ok_or(SimError::NotActive)?;
        let frame = session.frame;
        session.drag.move_target(target, frame);
        Ok(())
    }

    /// Releases whatever `pick_down` grabbed.
    pub fn pick_up(&mut self) -> Result<Option<BodyHandle>, SimError> {
        self.with_session(|session, host| {
            if let Some(body) = session.drag.end(session.world.as_mut(), host) {
                return Ok(Some(body));
            }
            let Some(body) = session.picked.take() else {
                return Ok(None);
            };
            if !session.world.is_valid(body) {
                return Ok(None);
            }
            let point = session.world.pose(body)?.translation;
            session.dispatch_to(body, ScriptEventKind::PickUp, &EventArgs::Pick { point }, host)?;
            Ok(Some(body))
        })
    }

    // ---- host-side edits ----

    /// Destroys a body from outside the tick, e.g. when its scene node is deleted.
    pub fn destroy_body(&mut self, body: BodyHandle) -> Result<(), SimError> {
        let session = self.session.as_mut().ok_or(SimError::NotActive)?;
        session.destroy_body(body, self.host.as_mut())
    }

    /// Drops everything backed by a deleted scene node.
    pub fn remove_node(&mut self, node: NodeId) -> Result<(), SimError> {
        let session = self.session.as_mut().ok_or(SimError::NotActive)?;
        session.buoyancy.remove_node(node);
        if let Some(body) = session.node_bodies.get(&node).copied() {
            session.destroy_body(body, self.host.as_mut())?;
        }
        Ok(())
    }

    pub fn follow_body(&mut self, body: Option<BodyHandle>) -> Result<(), SimError> {
        let session = self.session.as_mut().ok_or(SimError::NotActive)?;
        match body {
            Some(body) if !session.world.is_valid(body) => {
                Err(InvalidReference::Body(body).into())
            }
            Some(body) => {
                session.camera = Some(CameraBinding::new(body));
                Ok(())
            }
            None => {
                session.camera = None;
                Ok(())
            }
        }
    }

    pub fn begin_view_transition(
        &mut self,
        eye: Vec3,
        target: Vec3,
        duration: f32,
    ) -> Result<(), SimError> {
        let session = self.session.as_mut().ok_or(SimError::NotActive)?;
        session.transition = Some(ViewTransition::new(session.view, (eye, target), duration));
        Ok(())
    }

    /// Clamped; applies to the live session and to later starts.
    pub fn set_update_rate(&mut self, rate: u32) -> u32 {
        let rate = clamp_update_rate(rate);
        self.config.update_rate = rate;
        if let Some(session) = self.session.as_mut() {
            session.update_rate = rate;
        }
        rate
    }

    pub fn set_update_timestep(&mut self, timestep: f32) -> f32 {
        let timestep = clamp_update_timestep(timestep);
        self.config.update_timestep = timestep;
        if let Some(session) = self.session.as_mut() {
            session.update_timestep = timestep;
        }
        timestep
    }

    // ---- queries ----

    pub fn state(&self) -> SessionState {
        match &self.session {
            Some(session) => session.state(),
            None if self.terminated => SessionState::Terminated,
            None => SessionState::Inactive,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == SessionState::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.state() == SessionState::Paused
    }

    pub fn frame(&self) -> u64 {
        self.session.as_ref().map_or(0, |s| s.frame)
    }

    pub fn fps(&self) -> f32 {
        self.session.as_ref().map_or(0.0, |s| s.stats.fps)
    }

    pub fn simulated_time(&self) -> f64 {
        self.session
            .as_ref()
            .map_or(0.0, |s| s.world.elapsed_time())
    }

    /// Error that ended the last session, kept until the next `start()`.
    pub fn last_error(&self) -> Option<&SimError> {
        self.last_error.as_ref()
    }

    pub fn world(&self) -> Option<&dyn PhysicsWorld> {
        self.session.as_ref().map(|s| s.world.as_ref())
    }

    pub fn stats(&self) -> Option<&TimingStats> {
        self.session.as_ref().map(|s| &s.stats)
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn node_body(&self, node: NodeId) -> Option<BodyHandle> {
        self.session
            .as_ref()
            .and_then(|s| s.node_bodies.get(&node).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScriptError;
    use crate::script::{BodyScript, EventHandler};
    use crate::test_support::{ball, logging_script, EventLog, NativeScripts, RecordingHost};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn scene_with_script(key: &str) -> Scene {
        let mut node = ball(1, [0.0, 0.0, 0.0]);
        node.script = Some(key.to_string());
        Scene { nodes: vec![node] }
    }

    fn simulator(scripts: NativeScripts) -> (Simulator, Rc<RefCell<RecordingHost>>) {
        let host = Rc::new(RefCell::new(RecordingHost::default()));
        let sim = Simulator::new(SimulationConfig::default())
            .with_scripts(Box::new(scripts))
            .with_host(Box::new(host.clone()));
        (sim, host)
    }

    #[test]
    fn only_one_session_at_a_time() {
        let (mut sim, _) = simulator(NativeScripts::default());
        let scene = Scene {
            nodes: vec![ball(1, [0.0; 3])],
        };
        sim.start(&scene).expect("start");
        assert!(sim.is_playing());
        assert!(matches!(sim.start(&scene), Err(SimError::AlreadyActive)));
        assert!(sim.is_active());
    }

    #[test]
    fn reset_is_idempotent_and_allows_restart() {
        let log: EventLog = Rc::default();
        let (mut sim, host) =
            simulator(NativeScripts::default().with("logger", logging_script(&log)));
        let scene = scene_with_script("logger");
        sim.start(&scene).expect("start");
        sim.reset();
        assert_eq!(sim.state(), SessionState::Terminated);
        sim.reset();
        sim.stop();
        assert_eq!(sim.state(), SessionState::Terminated);
        assert_eq!(host.borrow().restores, 1);

        let kinds: Vec<_> = log.borrow().iter().map(|(_, kind)| *kind).collect();
        assert_eq!(kinds, vec![ScriptEventKind::Start, ScriptEventKind::End]);

        sim.start(&scene).expect("restart");
        assert!(sim.is_playing());
        assert_eq!(sim.frame(), 0);
    }

    #[test]
    fn admission_failure_restores_view_and_reports() {
        let (mut sim, host) = simulator(NativeScripts::default());
        let err = sim
            .start(&scene_with_script("missing"))
            .expect_err("unknown script");
        assert!(matches!(err, SimError::AdmissionScript(_)));
        assert!(!sim.is_active());
        assert!(matches!(sim.last_error(), Some(SimError::AdmissionScript(_))));
        let host = host.borrow();
        assert_eq!(host.snapshots, 1);
        assert_eq!(host.restores, 1);
    }

    #[test]
    fn end_failures_are_recorded_but_teardown_completes() {
        let script = BodyScript::new("grumpy").with_handler(
            ScriptEventKind::End,
            EventHandler::native(|_| Err(ScriptError::new("grumpy", "no"))),
        );
        let (mut sim, host) = simulator(NativeScripts::default().with("grumpy", script));
        sim.start(&scene_with_script("grumpy")).expect("start");
        sim.stop();
        assert!(!sim.is_active());
        assert!(matches!(
            sim.last_error(),
            Some(SimError::EventCallback { event: ScriptEventKind::End, .. })
        ));
        assert_eq!(host.borrow().restores, 1);
    }

    #[test]
    fn play_controls_dispatch_lifecycle_events() {
        let log: EventLog = Rc::default();
        let (mut sim, _) = simulator(NativeScripts::default().with("logger", logging_script(&log)));
        assert!(matches!(sim.pause(), Err(SimError::NotActive)));

        sim.start(&scene_with_script("logger")).expect("start");
        sim.toggle_play().expect("pause");
        assert!(sim.is_paused());
        sim.pause().expect("already paused");
        sim.play().expect("play");
        assert!(sim.is_playing());

        let kinds: Vec<_> = log.borrow().iter().map(|(_, kind)| *kind).collect();
        assert_eq!(
            kinds,
            vec![
                ScriptEventKind::Start,
                ScriptEventKind::Pause,
                ScriptEventKind::Play
            ]
        );
    }

    #[test]
    fn failing_start_handler_aborts() {
        let script = BodyScript::new("bad").with_handler(
            ScriptEventKind::Start,
            EventHandler::native(|_| Err(ScriptError::new("bad", "boom").with_line(Some(4)))),
        );
        let (mut sim, _) = simulator(NativeScripts::default().with("bad", script));
        let err = sim.start(&scene_with_script("bad")).expect_err("abort");
        assert_eq!(err.script_error().and_then(|e| e.line), Some(4));
        assert_eq!(sim.state(), SessionState::Terminated);
    }

    #[test]
    fn script_stop_tears_down_after_the_call() {
        let script = BodyScript::new("quitter").with_handler(
            ScriptEventKind::KeyDown,
            EventHandler::native(|ctx| {
                if matches!(ctx.args, EventArgs::Key(key) if key == "q") {
                    ctx.stop();
                }
                Ok(())
            }),
        );
        let (mut sim, _) = simulator(NativeScripts::default().with("quitter", script));
        sim.start(&scene_with_script("quitter")).expect("start");
        sim.key_down("a").expect("key");
        assert!(sim.is_active());
        sim.key_down("q").expect("key");
        assert!(!sim.is_active());
        assert!(sim.last_error().is_none());
    }

    #[test]
    fn game_mode_picks_dispatch_to_the_hit_body() {
        let log: EventLog = Rc::default();
        let config = SimulationConfig {
            mode: SimulationMode::Game,
            ..Default::default()
        };
        let mut sim = Simulator::new(config).with_scripts(Box::new(
            NativeScripts::default().with("logger", logging_script(&log)),
        ));
        sim.start(&scene_with_script("logger")).expect("start");
        let picked = sim
            .pick_down(Vec3::new(0.0, 0.0, 10.0), Vec3::NEG_Z)
            .expect("pick");
        assert!(picked.is_some());
        assert_eq!(sim.pick_up().expect("release"), picked);
        let kinds: Vec<_> = log.borrow().iter().map(|(_, kind)| *kind).collect();
        assert_eq!(
            kinds,
            vec![
                ScriptEventKind::Start,
                ScriptEventKind::PickDown,
                ScriptEventKind::PickUp
            ]
        );
        assert_eq!(
            sim.pick_down(Vec3::new(0.0, 10.0, 10.0), Vec3::NEG_Z).expect("miss"),
            None
        );
    }

    #[test]
    fn host_edits_and_tuning() {
        let (mut sim, host) = simulator(NativeScripts::default());
        let scene = Scene {
            nodes: vec![ball(1, [0.0; 3]), ball(2, [3.0, 0.0, 0.0])],
        };
        sim.start(&scene).expect("start");
        let body = sim.node_body(NodeId(2)).expect("admitted");
        sim.remove_node(NodeId(2)).expect("remove");
        assert!(sim.node_body(NodeId(2)).is_none());
        assert_eq!(host.borrow().despawned, vec![body]);
        assert!(matches!(
            sim.destroy_body(body),
            Err(SimError::InvalidReference(_))
        ));
        assert!(sim.follow_body(Some(body)).is_err());

        assert_eq!(sim.set_update_rate(0), 1);
        assert_eq!(sim.set_update_rate(500), 100);
        assert!((sim.set_update_timestep(1.0) - 1.0 / 30.0).abs() < 1e-6);
        assert_eq!(sim.session().map(|s| s.update_rate), Some(100));
    }
}
