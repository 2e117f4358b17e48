// src/ingest/providers/mod.rs
pub mod http;
pub mod replay;

pub use http::HttpStreamSource;
pub use replay::ReplaySource;
