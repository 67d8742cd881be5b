//! Sandbox module containing all execution-related components.

pub mod cache;
pub mod config;
pub mod executor;
pub mod harness;
pub mod io;
pub mod light;
pub mod limits;
pub mod strategy;
pub mod validator;
