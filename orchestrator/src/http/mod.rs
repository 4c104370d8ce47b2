//! HTTP client for provider APIs

pub mod client;

pub use client::HttpClient;
