use bevy::prelude::*;
use serde::Serialize;

use crate::admission::Scene;
use crate::config::SimulationConfig;
use crate::error::SimError;
use crate::session::SessionState;
use crate::simulator::Simulator;

/// The simulator lives in the world as a non-send resource: body scripts hold `Rc` state.
pub struct SimulationDriver(pub Simulator);

#[derive(States, Default, Clone, Copy, Eq, PartialEq, Debug, Hash, Serialize)]
pub enum SimulationRunState {
    #[default]
    Inactive,
    Playing,
    Paused,
}

impl From<SessionState> for SimulationRunState {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Playing => Self::Playing,
            SessionState::Paused => Self::Paused,
            SessionState::Inactive | SessionState::Terminated => Self::Inactive,
        }
    }
}

/// Read-only view of the simulator for UI systems.
#[derive(Resource, Clone, Debug, Default, PartialEq, Serialize)]
pub struct SimulationStatus {
    pub frame: u64,
    pub fps: f32,
    pub bodies: usize,
    pub playing: bool,
    pub paused: bool,
    pub last_error: Option<String>,
    pub error_script: Option<String>,
    pub error_line: Option<usize>,
}

impl SimulationStatus {
    pub fn from_simulator(sim: &Simulator) -> Self {
        let error = sim.last_error();
        let script_error = error.and_then(SimError::script_error);
        Self {
            frame: sim.frame(),
            fps: sim.fps(),
            bodies: sim.world().map_or(0, |w| w.bodies().len()),
            playing: sim.is_playing(),
            paused: sim.is_paused(),
            last_error: error.map(|e| e.to_string()),
            error_script: script_error.map(|e| e.script.clone()),
            error_line: script_error.and_then(|e| e.line),
        }
    }
}

/// Control requests from UI or input systems, applied once per frame.
#[derive(Event, Clone, Debug)]
pub enum SimulationRequest {
    Start(Scene),
    Stop,
    Pause,
    Play,
    TogglePlay,
    KeyDown(String),
    KeyUp(String),
}

pub struct SimulationPlugin;

impl Plugin for SimulationPlugin {
    fn build(&self, app: &mut App) {
        if !app.world().contains_non_send::<SimulationDriver>() {
            app.insert_non_send_resource(SimulationDriver(Simulator::new(
                SimulationConfig::load(),
            )));
        }
        app.init_resource::<SimulationStatus>()
            .add_event::<SimulationRequest>()
            .init_state::<SimulationRunState>()
            .add_systems(
                Update,
                (apply_simulation_requests, publish_simulation_status).chain(),
            )
            .add_systems(
                FixedUpdate,
                (drive_simulation, publish_simulation_status).chain(),
            );
    }
}

fn apply_simulation_requests(
    mut requests: EventReader<SimulationRequest>,
    mut driver: NonSendMut<SimulationDriver>,
) {
    let sim = &mut driver.0;
    for request in requests.read() {
        let result = match request {
            SimulationRequest::Start(scene) => sim.start(scene),
            SimulationRequest::Stop => {
                sim.stop();
                Ok(())
            }
            SimulationRequest::Pause => sim.pause(),
            SimulationRequest::Play => sim.play(),
            SimulationRequest::TogglePlay => sim.toggle_play(),
            SimulationRequest::KeyDown(key) => sim.key_down(key),
            SimulationRequest::KeyUp(key) => sim.key_up(key),
        };
        if let Err(err) = result {
            warn!("[Simdrive plugin] Request {} failed: {}", request_label(request), err);
        }
    }
}

fn request_label(request: &SimulationRequest) -> &'static str {
    match request {
        SimulationRequest::Start(_) => "start",
        SimulationRequest::Stop => "stop",
        SimulationRequest::Pause => "pause",
        SimulationRequest::Play => "play",
        SimulationRequest::TogglePlay => "toggle_play",
        SimulationRequest::KeyDown(_) => "key_down",
        SimulationRequest::KeyUp(_) => "key_up",
    }
}

fn drive_simulation(mut driver: NonSendMut<SimulationDriver>) {
    if let Err(err) = driver.0.tick() {
        debug!("[Simdrive plugin] Tick ended the session: {}", err);
    }
}

fn publish_simulation_status(
    driver: NonSend<SimulationDriver>,
    mut status: ResMut<SimulationStatus>,
    state: Res<State<SimulationRunState>>,
    mut next_state: ResMut<NextState<SimulationRunState>>,
) {
    status.set_if_neq(SimulationStatus::from_simulator(&driver.0));
    let target = SimulationRunState::from(driver.0.state());
    if *state.get() != target {
        next_state.set(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ball;

    fn app() -> App {
        let config = SimulationConfig {
            warmup_ticks: 0,
            ..Default::default()
        };
        let mut app = App::new();
        app.insert_non_send_resource(SimulationDriver(Simulator::new(config)))
            .add_plugins(bevy::state::app::StatesPlugin)
            .add_plugins(SimulationPlugin);
        app
    }

    fn send(app: &mut App, request: SimulationRequest) {
        app.world_mut().send_event(request);
        app.update();
        app.update();
    }

    fn run_state(app: &App) -> SimulationRunState {
        *app.world().resource::<State<SimulationRunState>>().get()
    }

    #[test]
    fn requests_drive_the_session_and_state_follows() {
        let mut app = app();
        send(
            &mut app,
            SimulationRequest::Start(Scene {
                nodes: vec![ball(1, [0.0; 3])],
            }),
        );
        assert_eq!(run_state(&app), SimulationRunState::Playing);

        for _ in 0..3 {
            app.world_mut().run_schedule(FixedUpdate);
        }
        let status = app.world().resource::<SimulationStatus>();
        assert_eq!(status.frame, 3);
        assert_eq!(status.bodies, 1);
        assert!(status.playing);

        send(&mut app, SimulationRequest::TogglePlay);
        assert_eq!(run_state(&app), SimulationRunState::Paused);
        assert!(app.world().resource::<SimulationStatus>().paused);

        send(&mut app, SimulationRequest::Stop);
        assert_eq!(run_state(&app), SimulationRunState::Inactive);
    }

    #[test]
    fn aborted_sessions_publish_the_failing_line() {
        let mut app = app();
        let mut node = ball(1, [0.0; 3]);
        node.name = "bomb".to_string();
        node.script = Some("let armed = true;\nfn onUpdate() {\n    throw \"kaboom\";\n}".to_string());
        send(&mut app, SimulationRequest::Start(Scene { nodes: vec![node] }));
        assert_eq!(run_state(&app), SimulationRunState::Playing);

        app.world_mut().run_schedule(FixedUpdate);
        app.update();
        let status = app.world().resource::<SimulationStatus>();
        assert!(!status.playing);
        assert_eq!(status.error_script.as_deref(), Some("bomb"));
        assert_eq!(status.error_line, Some(3));
        assert!(status
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("kaboom")));
        assert_eq!(run_state(&app), SimulationRunState::Inactive);
    }
}
