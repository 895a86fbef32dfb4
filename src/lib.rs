//! Worker for distributed algorithm test runs.
//!
//! Jobs arrive on a redis stream consumed through a consumer group. Each job
//! has its algorithm bundle, model and datasets resolved through a local
//! content-addressed cache. The algorithm's launcher then runs in a venv, a
//! container or a cluster pod, and the result bundle goes back to the
//! gateway.

pub mod algorithm;
pub mod archive;
pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod job;
pub mod pipeline;
pub mod process;
pub mod stage;
pub mod stream;
pub mod worker;
