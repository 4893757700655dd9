//! Pod predictor service
//!
//! Wires the prediction library into an HTTP service: configuration,
//! the API router and its shared state.

pub mod api;
pub mod config;
