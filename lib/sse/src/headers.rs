//! The bit-exact SSE response headers.

use axum::http::{HeaderMap, HeaderValue};

/// Builds the header set every SSE response must carry: content type,
/// no caching, a held-open connection, and a hint to disable proxy
/// buffering (nginx's `X-Accel-Buffering`).
#[must_use]
pub fn sse_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("text/event-stream"));
    headers.insert("cache-control", HeaderValue::from_static("no-cache"));
    headers.insert("connection", HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_match_the_sse_contract() {
        let headers = sse_headers();
        assert_eq!(headers.get("content-type").unwrap(), "text/event-stream");
        assert_eq!(headers.get("cache-control").unwrap(), "no-cache");
        assert_eq!(headers.get("connection").unwrap(), "keep-alive");
        assert_eq!(headers.get("x-accel-buffering").unwrap(), "no");
    }
}
