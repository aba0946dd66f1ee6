//! Browser fingerprint header sets.
//!
//! Responsibilities:
//! - Provide an ordered catalogue of realistic user-agent strings.
//! - Derive the client-hint headers (`sec-ch-ua*`) that a real browser with
//!   that user-agent would send, so header sets never contradict the UA.

use http::header::{ACCEPT_LANGUAGE, USER_AGENT};
use http::{HeaderMap, HeaderName, HeaderValue};
use once_cell::sync::Lazy;
use regex::Regex;

use super::IdentityError;

/// Ordered user-agent catalogue. Order matters: identities without an explicit
/// user-agent take the entry at their index.
pub const USER_AGENT_CATALOGUE: &[&str] = &[
    // Desktop Chrome
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.6422.113 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 13_5_2) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.6367.78 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.6422.61 Safari/537.36",
    // Desktop Firefox / Safari
    "Mozilla/5.0 (Windows NT 10.0; rv:124.0) Gecko/20100101 Firefox/124.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 13_3) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    // Mobile Safari
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1",
    // Mobile Chrome
    "Mozilla/5.0 (Linux; Android 14; Pixel 8 Pro) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.6422.113 Mobile Safari/537.36",
    "Mozilla/5.0 (Linux; Android 13; SM-G991B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.6367.78 Mobile Safari/537.36",
];

const BASE_HEADERS: &[(&str, &str)] = &[
    ("accept", "*/*"),
    ("accept-language", "en,ru;q=0.9,en-CA;q=0.8,ko;q=0.5"),
    ("accept-encoding", "gzip, br"),
    ("sec-fetch-dest", "empty"),
    ("sec-fetch-mode", "cors"),
    ("sec-fetch-site", "cross-site"),
    ("priority", "u=1, i"),
];

static CHROME_VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Chrome/(\d+)").expect("invalid chrome version regex"));

/// User-agent plus the header set a matching browser would send.
#[derive(Debug, Clone)]
pub struct BrowserFingerprint {
    pub user_agent: String,
    pub headers: HeaderMap,
}

impl BrowserFingerprint {
    pub fn for_user_agent(user_agent: &str) -> Result<Self, IdentityError> {
        let mut headers = HeaderMap::new();
        for &(name, value) in BASE_HEADERS {
            headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
        }

        headers.insert(USER_AGENT, header_value(user_agent)?);

        // Only Chromium-based browsers send client hints.
        if let Some(major) = chrome_major(user_agent) {
            let brands =
                format!(r#""Google Chrome";v="{major}", "Chromium";v="{major}", "Not.A/Brand";v="24""#);
            headers.insert(HeaderName::from_static("sec-ch-ua"), header_value(&brands)?);
            let (platform, mobile) = platform_hint(user_agent);
            headers.insert(
                HeaderName::from_static("sec-ch-ua-platform"),
                header_value(&format!("\"{platform}\""))?,
            );
            headers.insert(
                HeaderName::from_static("sec-ch-ua-mobile"),
                HeaderValue::from_static(if mobile { "?1" } else { "?0" }),
            );
        }

        Ok(Self {
            user_agent: user_agent.to_string(),
            headers,
        })
    }

    /// Catalogue entry for a pool position, wrapping around.
    pub fn from_catalogue(index: usize) -> Result<Self, IdentityError> {
        Self::for_user_agent(USER_AGENT_CATALOGUE[index % USER_AGENT_CATALOGUE.len()])
    }

    pub fn accept_language(&self) -> Option<&str> {
        self.headers.get(ACCEPT_LANGUAGE).and_then(|v| v.to_str().ok())
    }
}

fn chrome_major(user_agent: &str) -> Option<u32> {
    CHROME_VERSION_RE
        .captures(user_agent)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn platform_hint(user_agent: &str) -> (&'static str, bool) {
    if user_agent.contains("Android") {
        ("Android", true)
    } else if user_agent.contains("iPhone") {
        ("iOS", true)
    } else if user_agent.contains("Macintosh") {
        ("macOS", false)
    } else if user_agent.contains("Windows") {
        ("Windows", false)
    } else if user_agent.contains("Linux") {
        ("Linux", false)
    } else {
        ("Unknown", false)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, IdentityError> {
    HeaderValue::from_str(value).map_err(|_| IdentityError::InvalidHeader(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chrome_desktop_gets_matching_client_hints() {
        let fp = BrowserFingerprint::from_catalogue(0).unwrap();
        assert!(fp.user_agent.contains("Chrome/125"));
        assert_eq!(
            fp.headers.get("sec-ch-ua").unwrap(),
            r#""Google Chrome";v="125", "Chromium";v="125", "Not.A/Brand";v="24""#
        );
        assert_eq!(fp.headers.get("sec-ch-ua-platform").unwrap(), "\"Windows\"");
        assert_eq!(fp.headers.get("sec-ch-ua-mobile").unwrap(), "?0");
        assert_eq!(fp.headers.get(USER_AGENT).unwrap(), fp.user_agent.as_str());
    }

    #[test]
    fn android_chrome_is_mobile() {
        let fp = BrowserFingerprint::from_catalogue(6).unwrap();
        assert_eq!(fp.headers.get("sec-ch-ua-platform").unwrap(), "\"Android\"");
        assert_eq!(fp.headers.get("sec-ch-ua-mobile").unwrap(), "?1");
    }

    #[test]
    fn firefox_sends_no_client_hints() {
        let fp = BrowserFingerprint::from_catalogue(3).unwrap();
        assert!(fp.user_agent.contains("Firefox"));
        assert!(fp.headers.get("sec-ch-ua").is_none());
        assert!(fp.accept_language().is_some());
    }

    #[test]
    fn catalogue_wraps_around() {
        let first = BrowserFingerprint::from_catalogue(0).unwrap();
        let wrapped = BrowserFingerprint::from_catalogue(USER_AGENT_CATALOGUE.len()).unwrap();
        assert_eq!(first.user_agent, wrapped.user_agent);
    }
}
