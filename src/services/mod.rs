pub mod detector;
pub mod gateway;
pub mod hub;
pub mod job_store;
pub mod maintenance;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod storage;
pub mod webhook;
pub mod worker;
