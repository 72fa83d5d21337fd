//! egress-rota - egress node health probing and rotation
//!
//! Works against a Clash/Mihomo-style controller REST API:
//!
//! - Probes every member of a node group with bounded concurrency
//! - Classifies outcomes into usable and unusable nodes and persists them
//! - Rotates the active node of a selector group through the usable set,
//!   verifying the observed egress IP after each switch

pub mod config;
pub mod controller;
pub mod error;
pub mod models;
pub mod probe;
pub mod repository;
pub mod rotation;
pub mod services;

pub use config::Config;
pub use error::{Result, RotaError};
