//! External service adapters for Learnline.
//!
//! Two boundaries live here:
//! - [`AnsweringService`]: answers a query given its line's earlier queries.
//!   [`ChatAnsweringClient`] talks to a chat-completions endpoint.
//! - [`SearchService`]: turns a search query into raw candidate pages.
//!   [`CitationSearch`] asks the answering service and fetches the cited pages
//!   with [`PageFetcher`].
//!
//! Every outbound call goes through [`with_retry`] with a bounded
//! [`RetryPolicy`]; only transient failures are retried.

mod answering;
mod fetch;
mod retry;
mod search;

use std::net::IpAddr;

use learnline_shared::LearnlineError;
use reqwest::StatusCode;
use url::Url;

pub use answering::{Answer, AnsweringService, ChatAnsweringClient};
pub use fetch::{PageFetcher, RawPage};
pub use retry::{RetryPolicy, with_retry};
pub use search::{CitationSearch, SearchService};

/// User-Agent string for outbound requests.
const USER_AGENT: &str = concat!("Learnline/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a non-success HTTP status to an error, transient for 429 and 5xx.
fn map_status(service: &str, status: StatusCode, body: &str) -> LearnlineError {
    let snippet: String = body.chars().take(200).collect();
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        LearnlineError::upstream(service, format!("HTTP {status}"))
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        LearnlineError::config(format!("{service} rejected credentials: HTTP {status}"))
    } else {
        LearnlineError::validation(format!("{service} rejected request: HTTP {status} {snippet}"))
    }
}

/// Whether `host` is `blocked` or one of its subdomains.
fn host_is_blocked(host: &str, blocked: &[String]) -> bool {
    let host = host.trim_start_matches("www.");
    blocked.iter().any(|b| {
        let b = b.trim_start_matches("www.");
        host == b || host.ends_with(&format!(".{b}"))
    })
}

/// Check if a URL targets a non-HTTP scheme or a private/internal host.
fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssrf_blocks_private_and_local_targets() {
        for raw in [
            "file:///etc/passwd",
            "http://192.168.1.1/admin",
            "http://10.0.0.1/",
            "http://127.0.0.1:8080/",
            "http://[::1]/",
            "http://localhost/",
            "http://printer.local/",
        ] {
            let url = Url::parse(raw).unwrap();
            assert!(is_ssrf_target(&url), "{raw} should be blocked");
        }
    }

    #[test]
    fn ssrf_allows_public_hosts() {
        let url = Url::parse("https://www.semianalysis.com/p/ai-chips").unwrap();
        assert!(!is_ssrf_target(&url));
    }

    #[test]
    fn blocked_hosts_match_subdomains() {
        let blocked = vec!["youtube.com".to_string()];
        assert!(host_is_blocked("youtube.com", &blocked));
        assert!(host_is_blocked("www.youtube.com", &blocked));
        assert!(host_is_blocked("m.youtube.com", &blocked));
        assert!(!host_is_blocked("notyoutube.com", &blocked));
    }

    #[test]
    fn status_mapping() {
        assert!(map_status("search", StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(map_status("search", StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(!map_status("search", StatusCode::NOT_FOUND, "").is_transient());
        assert!(!map_status("search", StatusCode::UNAUTHORIZED, "").is_transient());
    }
}
