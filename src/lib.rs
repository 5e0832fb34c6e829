//! UI Element Detection Pipeline
//!
//! Asynchronous job pipeline that accepts screenshots, runs them through a
//! multimodal model to locate buttons, inputs, radios and dropdowns, and
//! reports progress over polling, a live channel, and optional webhooks.
//!
//! Two binaries share this library: the gateway (`main.rs`) serves HTTP and
//! live connections; the worker (`bin/worker.rs`) consumes the work queue.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
