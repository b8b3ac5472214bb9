//! Acquire web videos through an extraction tool and deliver them while they
//! are being fetched.
//!
//! A request either streams the extractor output as it comes, or goes through
//! the scratch directory when two elementary streams have to be merged. See
//! [`acquire::Orchestrator`] for the entry point.

pub mod acquire;
pub mod catalog;
pub mod classify;
pub mod io;
pub mod janitor;
pub mod outside;
pub mod result;
pub mod settings;
pub mod telemetry;
pub mod types;
pub mod web;

mod utils;
