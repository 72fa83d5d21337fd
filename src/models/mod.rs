pub mod controller;
pub mod probe;
pub mod results;

pub use controller::*;
pub use probe::*;
pub use results::*;
