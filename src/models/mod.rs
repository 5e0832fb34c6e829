pub mod detection;
pub mod job;
pub mod notification;
pub mod upload;
