//! Node liveness probing

mod engine;

pub use engine::{ProbeEngine, ProbeEngineConfig};
