pub mod body_model;
pub mod config;
pub mod dataset;
pub mod launch;
pub mod mesh;
pub mod orchestrate;
pub mod phase;
pub mod rotation;
pub mod sink;
pub mod skeleton;
pub mod timeline;
pub mod visibility;

pub use orchestrate::{render_run, RenderOptions, RunOutcome};
pub use visibility::RenderDecision;
