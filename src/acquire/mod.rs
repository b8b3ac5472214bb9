//! The acquisition pipeline: fetch the requested streams, merge them when
//! needed, and deliver a single file.
//!
//! A job goes `Resolving → Downloading → (Merging) → Streaming → Complete`
//! and ends in `Error` or `Cancelled` otherwise. The same state machine
//! serves both delivery modes; only the source of the body differs.

mod job;
mod orchestrator;
mod request;

pub use job::{Delivery, DeliveryMode, JobBody, JobEvent, JobHandle, Ready};
pub use orchestrator::{JobConfig, Orchestrator};
pub use request::AcquisitionRequest;
