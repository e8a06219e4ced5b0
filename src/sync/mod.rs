//! Small synchronization helpers shared across the server.

pub mod wait;

pub use wait::Wait;
