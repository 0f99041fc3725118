//! GCS Envelope Proxy - transparent envelope encryption for the Cloud Storage JSON API
//!
//! This library provides the request/response transformation engine and the
//! reverse-proxy front end that drives it.

pub mod classifier;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod errors;
pub mod exchange;
pub mod handlers;
pub mod keys;
pub mod multipart;
pub mod server;
pub mod session;
pub mod types;

pub use engine::TransformEngine;
pub use errors::ProxyError;
pub use exchange::{Exchange, ProxyRequest, ProxyResponse};
pub use types::OperationKind;
