use poem::http::header::CONTENT_LENGTH;
use poem::http::header::HOST;
use poem::http::HeaderMap;
use poem::http::HeaderName;

/// Connection-scoped headers that must not cross the proxy.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "upgrade",
    "transfer-encoding",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Headers sent upstream. `content-length` is dropped as well, since the
/// client recomputes it from the buffered body.
pub fn outbound(headers: &HeaderMap) -> HeaderMap {
    filter(headers, |name| {
        !is_hop_by_hop(name) && *name != HOST && *name != CONTENT_LENGTH
    })
}

/// Headers relayed back to the caller.
pub fn inbound(headers: &HeaderMap) -> HeaderMap {
    filter(headers, |name| !is_hop_by_hop(name) && *name != HOST)
}

fn filter(headers: &HeaderMap, keep: impl Fn(&HeaderName) -> bool) -> HeaderMap {
    let mut kept = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if keep(name) {
            kept.append(name.clone(), value.clone());
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use poem::http::HeaderValue;
    use similar_asserts::assert_eq;

    use super::*;

    fn request_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("gpu-box:11435"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic Zm9v"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("content-length", HeaderValue::from_static("42"));
        headers.append("x-trace", HeaderValue::from_static("a"));
        headers.append("x-trace", HeaderValue::from_static("b"));
        headers
    }

    fn names(headers: &HeaderMap) -> Vec<&str> {
        let mut names: Vec<&str> = headers.keys().map(HeaderName::as_str).collect();
        names.sort_unstable();
        names
    }

    #[test]
    fn outbound_strips_hop_by_hop_host_and_length() {
        let headers = outbound(&request_headers());

        assert_eq!(names(&headers), vec!["content-type", "x-trace"]);
        assert_eq!(headers.get_all("x-trace").iter().count(), 2);
    }

    #[test]
    fn inbound_keeps_content_length() {
        let headers = inbound(&request_headers());

        assert_eq!(
            names(&headers),
            vec!["content-length", "content-type", "x-trace"]
        );
    }

    #[test]
    fn hop_by_hop_names_are_recognised() {
        for name in HOP_BY_HOP_HEADERS {
            assert!(is_hop_by_hop(&HeaderName::from_static(name)), "{name}");
        }
        assert!(!is_hop_by_hop(&HeaderName::from_static("authorization")));
    }
}
