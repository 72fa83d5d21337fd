pub mod results;

pub use results::{ArtifactSchema, ResultsRepository};
