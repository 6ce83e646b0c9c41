//! HTTP client for the Quillrun writing backend.
//!
//! [`ApiClient`] implements every engine service trait over a REST API, with
//! generation streamed as server-sent events.

pub mod error;
pub mod http;
pub mod services;
pub mod sse;

pub use error::ClientError;
pub use http::HttpClient;
pub use services::ApiClient;
pub use sse::{SseFrame, SseParser};
