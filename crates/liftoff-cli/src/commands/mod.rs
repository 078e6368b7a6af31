//! Command implementations.
//!
//! - [`dev`] - Dev server with restart on configuration change

pub mod dev;

pub use dev::execute as dev_execute;
