//! HTTP unit of work and retry support

pub mod http;
pub mod retry;

pub use http::*;
pub use retry::*;
