pub mod client;
pub mod request;
pub mod sse;

pub use client::UpstreamClient;
pub use request::{build_request, encode_request, system_turn};
