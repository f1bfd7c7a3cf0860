use bevy::log::LogPlugin;
use bevy::prelude::*;
use simdrive::{
    Scene, SimulationConfig, SimulationDriver, SimulationPlugin, SimulationRequest, Simulator,
};

const DEFAULT_FRAMES: u64 = 600;

#[derive(Resource)]
struct RunLimit {
    frames: u64,
    started: bool,
}

fn parse_args(args: &[String]) -> Result<(String, u64), String> {
    let mut scene_path = None;
    let mut frames = DEFAULT_FRAMES;
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--frames" => {
                let value = iter.next().ok_or("--frames needs a value")?;
                frames = value
                    .parse()
                    .map_err(|_| format!("invalid frame count '{value}'"))?;
            }
            other if scene_path.is_none() => scene_path = Some(other.to_string()),
            other => return Err(format!("unexpected argument '{other}'")),
        }
    }
    let scene_path = scene_path.ok_or("usage: simdrive <scene.json> [--frames N]")?;
    Ok((scene_path, frames))
}

fn load_scene(path: &str) -> Result<Scene, String> {
    let contents = std::fs::read_to_string(path).map_err(|e| format!("{path}: {e}"))?;
    Scene::from_json_str(&contents).map_err(|e| format!("{path}: {e}"))
}

fn finish_run(
    mut limit: ResMut<RunLimit>,
    mut driver: NonSendMut<SimulationDriver>,
    mut exit: EventWriter<AppExit>,
) {
    let sim = &mut driver.0;
    if sim.is_active() {
        limit.started = true;
        if sim.frame() < limit.frames {
            return;
        }
    } else if !limit.started && sim.last_error().is_none() {
        return;
    }

    if let Some(err) = sim.last_error() {
        error!("[Simdrive] Session failed: {}", err);
        exit.send(AppExit::error());
        return;
    }
    info!(
        "[Simdrive] Ran {} frames ({:.3}s simulated, {} bodies, {:.1} fps)",
        sim.frame(),
        sim.simulated_time(),
        sim.world().map_or(0, |w| w.bodies().len()),
        sim.fps()
    );
    sim.stop();
    exit.send(AppExit::Success);
}

fn main() -> AppExit {
    let args: Vec<String> = std::env::args().collect();
    let (scene_path, frames) = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(message) => {
            eprintln!("[Simdrive] {message}");
            return AppExit::error();
        }
    };
    let scene = match load_scene(&scene_path) {
        Ok(scene) => scene,
        Err(message) => {
            eprintln!("[Simdrive] Failed to load scene {message}");
            return AppExit::error();
        }
    };

    let config = SimulationConfig::load();
    let tick_hz = 1.0 / f64::from(config.tick_seconds());
    let mut app = App::new();
    app.add_plugins(MinimalPlugins)
        .add_plugins(LogPlugin::default())
        .add_plugins(bevy::state::app::StatesPlugin)
        .insert_resource(Time::<Fixed>::from_hz(tick_hz))
        .insert_resource(RunLimit {
            frames,
            started: false,
        })
        .insert_non_send_resource(SimulationDriver(Simulator::new(config)))
        .add_plugins(SimulationPlugin)
        .add_systems(Startup, move |mut requests: EventWriter<SimulationRequest>| {
            requests.send(SimulationRequest::Start(scene.clone()));
        })
        .add_systems(Update, finish_run);
    info!("[Simdrive] Running {} for {} frames", scene_path, frames);
    app.run()
}
