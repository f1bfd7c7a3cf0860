use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::physics::WorldSettings;

pub const MIN_UPDATE_RATE: u32 = 1;
pub const MAX_UPDATE_RATE: u32 = 100;
pub const MIN_UPDATE_TIMESTEP: f32 = 1.0 / 1200.0;
pub const MAX_UPDATE_TIMESTEP: f32 = 1.0 / 30.0;

/// Timestep at which controller forces are applied unscaled.
pub const REFERENCE_TIMESTEP: f32 = 1.0 / 60.0;

pub const DEFAULT_MAX_SCRIPT_OPERATIONS: u64 = 200_000;
pub const DEFAULT_MAX_SCRIPT_CALL_LEVELS: usize = 32;

const CONFIG_PATH_ENV: &str = "SIMDRIVE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "simdrive.json";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationMode {
    #[default]
    Interactive,
    Game,
}

/// What happens when a thruster, emitter or joint expression fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerFailurePolicy {
    /// Log the failure; the controller contributes nothing this tick.
    #[default]
    Log,
    /// Treat the failure like a callback failure and abort the session.
    Abort,
}

fn default_update_rate() -> u32 {
    1
}

fn default_update_timestep() -> f32 {
    1.0 / 60.0
}

fn default_warmup_ticks() -> u32 {
    3
}

fn default_gravity() -> [f32; 3] {
    [0.0, -9.81, 0.0]
}

fn default_solver_iterations() -> u32 {
    10
}

fn default_friction() -> f32 {
    0.5
}

fn default_elasticity() -> f32 {
    0.4
}

fn default_worker_threads() -> usize {
    1
}

fn default_drag_stiffness() -> f32 {
    20.0
}

fn default_rng_seed() -> u64 {
    0x5eed
}

fn default_max_script_operations() -> u64 {
    DEFAULT_MAX_SCRIPT_OPERATIONS
}

fn default_max_script_call_levels() -> usize {
    DEFAULT_MAX_SCRIPT_CALL_LEVELS
}

fn default_stats_history_capacity() -> usize {
    300
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Physics sub-steps per tick.
    #[serde(default = "default_update_rate")]
    pub update_rate: u32,
    /// Seconds per sub-step.
    #[serde(default = "default_update_timestep")]
    pub update_timestep: f32,
    #[serde(default)]
    pub mode: SimulationMode,
    /// Timer firings skipped after activation before the first frame advances.
    #[serde(default = "default_warmup_ticks")]
    pub warmup_ticks: u32,
    #[serde(default = "default_gravity")]
    pub gravity: [f32; 3],
    #[serde(default = "default_solver_iterations")]
    pub solver_iterations: u32,
    #[serde(default = "default_friction")]
    pub default_friction: f32,
    #[serde(default = "default_elasticity")]
    pub default_elasticity: f32,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_drag_stiffness")]
    pub drag_stiffness: f32,
    #[serde(default)]
    pub record: bool,
    #[serde(default)]
    pub controller_failure: ControllerFailurePolicy,
    #[serde(default = "default_rng_seed")]
    pub rng_seed: u64,
    #[serde(default = "default_max_script_operations")]
    pub max_script_operations: u64,
    #[serde(default = "default_max_script_call_levels")]
    pub max_script_call_levels: usize,
    #[serde(default = "default_stats_history_capacity")]
    pub stats_history_capacity: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            update_rate: default_update_rate(),
            update_timestep: default_update_timestep(),
            mode: SimulationMode::default(),
            warmup_ticks: default_warmup_ticks(),
            gravity: default_gravity(),
            solver_iterations: default_solver_iterations(),
            default_friction: default_friction(),
            default_elasticity: default_elasticity(),
            worker_threads: default_worker_threads(),
            drag_stiffness: default_drag_stiffness(),
            record: false,
            controller_failure: ControllerFailurePolicy::default(),
            rng_seed: default_rng_seed(),
            max_script_operations: default_max_script_operations(),
            max_script_call_levels: default_max_script_call_levels(),
            stats_history_capacity: default_stats_history_capacity(),
        }
    }
}

pub fn clamp_update_rate(rate: u32) -> u32 {
    rate.clamp(MIN_UPDATE_RATE, MAX_UPDATE_RATE)
}

pub fn clamp_update_timestep(timestep: f32) -> f32 {
    if !timestep.is_finite() {
        return default_update_timestep();
    }
    timestep.clamp(MIN_UPDATE_TIMESTEP, MAX_UPDATE_TIMESTEP)
}

impl SimulationConfig {
    /// Loads `SIMDRIVE_CONFIG` (or `simdrive.json`), then applies env overrides.
    pub fn load() -> Self {
        let path = std::env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        let config = match std::fs::read_to_string(&path) {
            Ok(contents) => match Self::from_json_str(&contents) {
                Ok(cfg) => {
                    info!("[Simdrive config] Loaded config from {}", path);
                    cfg
                }
                Err(e) => {
                    warn!("[Simdrive config] Failed to parse {}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        };
        config.with_env_overrides().normalized()
    }

    pub fn from_json_str(contents: &str) -> Result<Self, SimError> {
        serde_json::from_str::<Self>(contents)
            .map(Self::normalized)
            .map_err(|e| SimError::Config(e.to_string()))
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(rate) = env_parse::<u32>("SIMDRIVE_UPDATE_RATE") {
            self.update_rate = rate;
        }
        if let Some(timestep) = env_parse::<f32>("SIMDRIVE_UPDATE_TIMESTEP") {
            self.update_timestep = timestep;
        }
        if let Some(warmup) = env_parse::<u32>("SIMDRIVE_WARMUP_TICKS") {
            self.warmup_ticks = warmup;
        }
        self
    }

    /// Clamps every tunable into its supported range.
    pub fn normalized(mut self) -> Self {
        self.update_rate = clamp_update_rate(self.update_rate);
        self.update_timestep = clamp_update_timestep(self.update_timestep);
        if self.worker_threads != 1 {
            debug!(
                "[Simdrive config] worker_threads={} ignored; physics runs on one worker",
                self.worker_threads
            );
            self.worker_threads = 1;
        }
        self.solver_iterations = self.solver_iterations.max(1);
        self.default_friction = self.default_friction.max(0.0);
        self.default_elasticity = self.default_elasticity.clamp(0.0, 1.0);
        if !self.drag_stiffness.is_finite() || self.drag_stiffness < 0.0 {
            self.drag_stiffness = default_drag_stiffness();
        }
        self.max_script_operations = self.max_script_operations.max(1_000);
        self.max_script_call_levels = self.max_script_call_levels.max(4);
        self.stats_history_capacity = self.stats_history_capacity.max(1);
        self
    }

    pub fn gravity(&self) -> Vec3 {
        Vec3::from_array(self.gravity)
    }

    /// Simulated seconds covered by one tick.
    pub fn tick_seconds(&self) -> f32 {
        self.update_timestep * self.update_rate as f32
    }

    pub fn world_settings(&self) -> WorldSettings {
        WorldSettings {
            gravity: self.gravity(),
            solver_iterations: self.solver_iterations,
            default_friction: self.default_friction,
            default_elasticity: self.default_elasticity,
            worker_threads: self.worker_threads,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let cfg = SimulationConfig::from_json_str(r#"{"update_rate": 4}"#).expect("parse");
        assert_eq!(cfg.update_rate, 4);
        assert!((cfg.update_timestep - 1.0 / 60.0).abs() < 1e-6);
        assert_eq!(cfg.mode, SimulationMode::Interactive);
        assert_eq!(cfg.controller_failure, ControllerFailurePolicy::Log);
    }

    #[test]
    fn normalization_clamps_rate_and_timestep() {
        let cfg = SimulationConfig::from_json_str(
            r#"{"update_rate": 500, "update_timestep": 1.0, "worker_threads": 8}"#,
        )
        .expect("parse");
        assert_eq!(cfg.update_rate, MAX_UPDATE_RATE);
        assert!((cfg.update_timestep - MAX_UPDATE_TIMESTEP).abs() < 1e-6);
        assert_eq!(cfg.worker_threads, 1);

        assert_eq!(clamp_update_rate(0), MIN_UPDATE_RATE);
        assert!((clamp_update_timestep(0.0) - MIN_UPDATE_TIMESTEP).abs() < 1e-9);
        assert!((clamp_update_timestep(f32::NAN) - 1.0 / 60.0).abs() < 1e-6);
    }

    #[test]
    fn parses_mode_and_policy_labels() {
        let cfg = SimulationConfig::from_json_str(
            r#"{"mode": "game", "controller_failure": "abort", "record": true}"#,
        )
        .expect("parse");
        assert_eq!(cfg.mode, SimulationMode::Game);
        assert_eq!(cfg.controller_failure, ControllerFailurePolicy::Abort);
        assert!(cfg.record);
    }

    #[test]
    fn unparsable_config_is_a_config_error() {
        assert!(matches!(
            SimulationConfig::from_json_str(r#"{"update_rate": "fast"}"#),
            Err(SimError::Config(_))
        ));
    }

    #[test]
    fn tick_seconds_spans_all_substeps() {
        let cfg = SimulationConfig {
            update_rate: 4,
            update_timestep: 1.0 / 240.0,
            ..Default::default()
        };
        assert!((cfg.tick_seconds() - 1.0 / 60.0).abs() < 1e-6);
    }
}
