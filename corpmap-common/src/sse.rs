//! Server-Sent Events (SSE) utilities
//!
//! Keep-alive policy and the response headers that stop proxies from
//! buffering or caching an event stream.

use axum::http::header::{self, HeaderName, HeaderValue};
use axum::response::sse::KeepAlive;
use std::time::Duration;

/// Default heartbeat interval for SSE streams
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);

/// Header used by nginx-style proxies to disable response buffering
pub const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Response headers that disable intermediary buffering and caching
pub fn streaming_headers() -> [(HeaderName, HeaderValue); 2] {
    [
        (
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-transform"),
        ),
        (X_ACCEL_BUFFERING, HeaderValue::from_static("no")),
    ]
}

/// Keep-alive policy sending a `heartbeat` comment every `interval`
pub fn heartbeat_keep_alive(interval: Duration) -> KeepAlive {
    KeepAlive::new().interval(interval).text("heartbeat")
}
