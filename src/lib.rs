//! Core library for the `loadplane` execution controller.
//!
//! The controller deploys load-generating engines through a scheduler,
//! triggers them with partitioned test data, fans their metric streams out to
//! subscribers and a time-series sink, and reconciles running state against
//! the durable execution store.
pub mod args;
pub mod artifacts;
pub mod broker;
pub mod config;
pub mod controller;
pub mod engine;
pub mod entry;
pub mod error;
pub mod logger;
pub mod metrics;
pub mod model;
pub mod partition;
pub mod reconcile;
pub mod scheduler;
pub mod shutdown;
pub mod shutdown_handlers;
pub mod store;
