//! Origin allow-list check performed before a socket is upgraded.

use axum::http::Uri;

/// Decide whether a request with the given `Origin` header may connect
///
/// Requests without an origin (non-browser clients) are accepted. The
/// origin's `host[:port]` must match an entry of `allowed`; `*` matches any
/// host and an empty list accepts everything.
pub fn origin_allowed(origin: Option<&str>, allowed: &[String]) -> bool {
    let origin = match origin {
        Some(origin) => origin,
        None => return true,
    };

    let host = match origin_host(origin) {
        Some(host) => host,
        None => {
            tracing::debug!(origin = %origin, "Unparsable origin header");
            return false;
        }
    };

    if allowed.is_empty() || allowed.iter().any(|o| o == "*" || *o == host) {
        return true;
    }

    tracing::debug!(
        allowed = %allowed.join(", "),
        host = %host,
        "None of the allowed origins matched"
    );
    false
}

fn origin_host(origin: &str) -> Option<String> {
    let uri: Uri = origin.parse().ok()?;
    // Drop any userinfo, keeping host[:port]
    let host = uri.authority()?.as_str().rsplit('@').next()?;
    Some(host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(hosts: &[&str]) -> Vec<String> {
        hosts.iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn test_missing_origin_is_allowed() {
        assert!(origin_allowed(None, &list(&["example.com"])));
    }

    #[test]
    fn test_wildcard_and_empty_list() {
        assert!(origin_allowed(Some("https://evil.test"), &list(&["*"])));
        assert!(origin_allowed(Some("https://evil.test"), &[]));
    }

    #[test]
    fn test_host_match_includes_port() {
        let allowed = list(&["localhost:8000", "example.com"]);
        assert!(origin_allowed(Some("http://localhost:8000"), &allowed));
        assert!(origin_allowed(Some("https://example.com"), &allowed));
        assert!(!origin_allowed(Some("http://localhost:9000"), &allowed));
        assert!(!origin_allowed(Some("https://sub.example.com"), &allowed));
    }

    #[test]
    fn test_unparsable_origin_is_rejected() {
        assert!(!origin_allowed(Some(""), &list(&["example.com"])));
        assert!(!origin_allowed(Some("not an origin"), &list(&["example.com"])));
    }
}
