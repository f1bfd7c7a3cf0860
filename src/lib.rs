pub mod actuators;
pub mod admission;
pub mod buoyancy;
pub mod camera;
pub mod config;
pub mod dispatch;
pub mod drag;
pub mod emission;
pub mod error;
pub mod host;
pub mod overlay;
pub mod physics;
pub mod pipeline;
pub mod plugin;
pub mod replay;
pub mod script;
pub mod session;
pub mod simulator;
pub mod stats;
pub mod transition;

#[cfg(test)]
mod test_support;

pub use admission::{NodeId, Scene, SceneNode};
pub use config::{ControllerFailurePolicy, SimulationConfig, SimulationMode};
pub use error::{InvalidReference, ScriptError, SimError};
pub use host::{HostHooks, NullHost};
pub use pipeline::TickOutcome;
pub use plugin::{
    SimulationDriver, SimulationPlugin, SimulationRequest, SimulationRunState, SimulationStatus,
};
pub use session::SessionState;
pub use simulator::Simulator;
