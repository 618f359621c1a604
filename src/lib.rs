//! Distributed network probing: a controller that schedules probe tasks onto
//! per-node topics, and agents that execute them and write the results to a
//! metrics backend.

pub mod agent;
pub mod config;
pub mod controller;
pub mod metrics;
pub mod model;
pub mod probe;
pub mod sink;
pub mod transport;
