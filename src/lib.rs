//! Identify DNS server software by how it answers a matrix of unusual queries.
//!
//! `scanner` builds and sends the queries and reduces each answer to a
//! [`scanner::Signature`]; `model` turns collected signatures into a trained
//! decision tree; `pipeline` streams addresses through both.

pub mod config;
pub mod error;
pub mod model;
pub mod network;
pub mod output;
pub mod pipeline;
pub mod scanner;

pub use error::{FingerprintError, Result};
