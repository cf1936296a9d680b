//! HTTP API Module
//!
//! Provides a REST API for cluster state and operator commands.

mod http;

pub use http::HttpServer;
