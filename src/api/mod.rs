//! HTTP API Module
//!
//! Provides a REST API for backend and sharding administration.

mod http;

pub use http::{AppState, ErrorResponse, HttpServer};
