//! Observation assembly, bounded step history, and the control loop that
//! drives a WebPilot session: observe the page, hand the observation to a
//! [`DecisionPolicy`], execute the chosen action, record what happened,
//! repeat until the policy plays `done` or the step budget runs out.

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod errors;
pub mod history;
pub mod observer;
pub mod policy;

pub use checkpoint::SessionSnapshot;
pub use config::EngineConfig;
pub use engine::Engine;
pub use errors::EngineError;
pub use history::StepHistory;
pub use observer::Observer;
pub use policy::DecisionPolicy;
