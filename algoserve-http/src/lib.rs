//! HTTP surface for Algoserve.
//!
//! The [`dispatcher`] is the single translation point between wire
//! envelopes and the execution subsystem; [`routes`] wires it into an axum
//! router together with the catalog, probe, [`metrics`], and [`openapi`]
//! endpoints.

pub mod dispatcher;
pub mod metrics;
pub mod openapi;
pub mod routes;

pub use routes::{router, AppState};
