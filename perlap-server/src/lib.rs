//! PerLap Server Library
//!
//! Exposes server components for integration testing.

pub mod api;
pub mod error;
pub mod manager;
pub mod state;
pub mod store;
