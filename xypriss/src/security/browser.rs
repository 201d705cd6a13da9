//! Browser-only / terminal-only / mobile-only request classifiers.
//!
//! Decision order for the browser-only policy:
//!
//! 1. A **custom validator**, when installed, alone decides.
//! 2. A **definitive automation signature** in the User-Agent (curl, wget,
//!    Postman, httpie, python-requests, axios, playwright, puppeteer,
//!    selenium, ...) or an empty/very short UA blocks immediately with
//!    `AUTOMATION_TOOL_DETECTED`.
//! 3. The **Sec-Fetch fast path**: requests carrying RFC-valid,
//!    cross-consistent `Sec-Fetch-Dest` / `Sec-Fetch-Mode` pass without
//!    scoring; invalid combinations block with `INVALID_SEC_FETCH` so
//!    spoofed metadata cannot slip past the scored path.
//! 4. The **scored path**: eight header signals scored 0..2 against the
//!    configured threshold (default 3). The breakdown travels with the
//!    block so debug mode can expose it.
//!
//! The terminal-only and mobile-only policies are symmetric inversions.
//!
//! ## Usage
//!
//! ```rust
//! use xypriss::security::browser::{BrowserOnlyPolicy, Verdict};
//!
//! let policy = BrowserOnlyPolicy::new(3.0);
//! match policy.evaluate(&request) {
//!     Verdict::Pass => { /* request continues */ }
//!     Verdict::Block { code, details } => {
//!         // code is AUTOMATION_TOOL_DETECTED, INVALID_SEC_FETCH, or
//!         // INSUFFICIENT_BROWSER_SCORE; details carries the score
//!         // breakdown for debug mode.
//!     }
//! }
//! ```
//!
//! Block responses deliberately share one public code on the wire; the
//! inner codes and breakdowns only surface when the chain runs with its
//! debug flag set.

use crate::adapter::XyRequest;
use regex::Regex;
use serde_json::json;
use std::sync::Arc;
use std::sync::LazyLock;

/// UA signatures that identify automation tools outright.
static AUTOMATION_SIGNATURES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bcurl/",
        r"(?i)\bwget/",
        r"(?i)postman",
        r"(?i)httpie",
        r"(?i)python-requests",
        r"(?i)python-urllib",
        r"(?i)aiohttp",
        r"(?i)go-http-client",
        r"(?i)\bjava/",
        r"(?i)okhttp",
        r"(?i)axios",
        r"(?i)node-fetch",
        r"(?i)undici",
        r"(?i)playwright",
        r"(?i)puppeteer",
        r"(?i)headlesschrome",
        r"(?i)selenium",
        r"(?i)phantomjs",
        r"(?i)scrapy",
        r"(?i)libwww",
        r"(?i)winhttp",
        r"(?i)\bbot\b",
        r"(?i)spider",
        r"(?i)crawler",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("static pattern"))
    .collect()
});

static BROWSER_MARKERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)mozilla/",
        r"(?i)applewebkit",
        r"(?i)\bgecko\b",
        r"(?i)\bchrome/",
        r"(?i)\bchromium/",
        r"(?i)\bfirefox/",
        r"(?i)\bsafari/",
        r"(?i)\bedg(e|a|ios)?/",
        r"(?i)\bopr/",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("static pattern"))
    .collect()
});

static MOBILE_MARKERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)android",
        r"(?i)iphone",
        r"(?i)ipad",
        r"(?i)ipod",
        r"(?i)windows phone",
        r"(?i)\bmobile\b",
        r"(?i)opera mini",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("static pattern"))
    .collect()
});

const VALID_SEC_FETCH_DEST: &[&str] = &[
    "audio", "audioworklet", "document", "embed", "empty", "font", "frame", "iframe", "image",
    "manifest", "object", "paintworklet", "report", "script", "serviceworker", "sharedworker",
    "style", "track", "video", "worker", "xslt",
];

const VALID_SEC_FETCH_MODE: &[&str] =
    &["cors", "navigate", "no-cors", "same-origin", "websocket"];

/// Outcome of a classifier pass.
#[derive(Debug, Clone)]
pub enum Verdict {
    Pass,
    Block {
        /// Inner code, e.g. `AUTOMATION_TOOL_DETECTED`
        code: &'static str,
        details: Option<serde_json::Value>,
    },
}

impl Verdict {
    pub fn is_block(&self) -> bool {
        matches!(self, Verdict::Block { .. })
    }
}

/// Custom override: `Some(pass)` decides alone, `None` defers.
pub type CustomValidator = Arc<dyn Fn(&XyRequest) -> Option<bool> + Send + Sync>;

/// Browser-only policy.
pub struct BrowserOnlyPolicy {
    threshold: f64,
    validator: Option<CustomValidator>,
}

impl BrowserOnlyPolicy {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            validator: None,
        }
    }

    pub fn with_validator(mut self, validator: CustomValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn evaluate(&self, req: &XyRequest) -> Verdict {
        if let Some(validator) = &self.validator {
            if let Some(pass) = validator(req) {
                return if pass {
                    Verdict::Pass
                } else {
                    Verdict::Block {
                        code: "CUSTOM_VALIDATOR_REJECTED",
                        details: None,
                    }
                };
            }
        }

        let user_agent = req.header("user-agent").unwrap_or("");
        if is_automation_agent(user_agent) {
            return Verdict::Block {
                code: "AUTOMATION_TOOL_DETECTED",
                details: None,
            };
        }

        match sec_fetch_fast_path(req) {
            SecFetch::Valid => return Verdict::Pass,
            SecFetch::Invalid(reason) => {
                return Verdict::Block {
                    code: "INVALID_SEC_FETCH",
                    details: Some(json!({ "reason": reason })),
                }
            }
            SecFetch::Absent => {}
        }

        let breakdown = score_browser_signals(req);
        if breakdown.total >= self.threshold {
            Verdict::Pass
        } else {
            Verdict::Block {
                code: "INSUFFICIENT_BROWSER_SCORE",
                details: Some(json!({
                    "score": breakdown.total,
                    "threshold": self.threshold,
                    "signals": breakdown.signals,
                })),
            }
        }
    }
}

/// Terminal-only policy: browsers are the anomaly here.
pub struct TerminalOnlyPolicy {
    validator: Option<CustomValidator>,
}

impl TerminalOnlyPolicy {
    pub fn new() -> Self {
        Self { validator: None }
    }

    pub fn with_validator(mut self, validator: CustomValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn evaluate(&self, req: &XyRequest) -> Verdict {
        if let Some(validator) = &self.validator {
            if let Some(pass) = validator(req) {
                return if pass {
                    Verdict::Pass
                } else {
                    Verdict::Block {
                        code: "CUSTOM_VALIDATOR_REJECTED",
                        details: None,
                    }
                };
            }
        }
        let user_agent = req.header("user-agent").unwrap_or("");
        let browserish = BROWSER_MARKERS.iter().any(|m| m.is_match(user_agent))
            || req.header("sec-fetch-mode").is_some();
        if browserish {
            Verdict::Block {
                code: "BROWSER_DETECTED",
                details: None,
            }
        } else {
            Verdict::Pass
        }
    }
}

impl Default for TerminalOnlyPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Mobile-only policy: requires mobile UA markers or an explicit app
/// header.
pub struct MobileOnlyPolicy {
    /// Custom header that identifies the first-party mobile app
    app_header: Option<String>,
}

impl MobileOnlyPolicy {
    pub fn new() -> Self {
        Self { app_header: None }
    }

    pub fn with_app_header(mut self, header: impl Into<String>) -> Self {
        self.app_header = Some(header.into());
        self
    }

    pub fn evaluate(&self, req: &XyRequest) -> Verdict {
        if let Some(header) = &self.app_header {
            if req.header(header).is_some() {
                return Verdict::Pass;
            }
        }
        let user_agent = req.header("user-agent").unwrap_or("");
        if MOBILE_MARKERS.iter().any(|m| m.is_match(user_agent)) {
            Verdict::Pass
        } else {
            Verdict::Block {
                code: "MOBILE_CLIENT_REQUIRED",
                details: None,
            }
        }
    }
}

impl Default for MobileOnlyPolicy {
    fn default() -> Self {
        Self::new()
    }
}

pub fn is_automation_agent(user_agent: &str) -> bool {
    if user_agent.trim().len() < 12 {
        // Real browsers announce platform, engine, and version; nothing
        // legitimate fits in a dozen bytes.
        return true;
    }
    AUTOMATION_SIGNATURES.iter().any(|s| s.is_match(user_agent))
}

enum SecFetch {
    Valid,
    Invalid(&'static str),
    Absent,
}

/// Validate `Sec-Fetch-Dest` / `Sec-Fetch-Mode` presence, RFC values,
/// and cross-consistency.
fn sec_fetch_fast_path(req: &XyRequest) -> SecFetch {
    let (Some(dest), Some(mode)) = (req.header("sec-fetch-dest"), req.header("sec-fetch-mode"))
    else {
        return SecFetch::Absent;
    };

    if !VALID_SEC_FETCH_DEST.contains(&dest) {
        return SecFetch::Invalid("unknown sec-fetch-dest value");
    }
    if !VALID_SEC_FETCH_MODE.contains(&mode) {
        return SecFetch::Invalid("unknown sec-fetch-mode value");
    }
    if mode == "navigate" && !matches!(dest, "document" | "iframe") {
        return SecFetch::Invalid("navigate requires a document destination");
    }
    if req
        .header("sec-fetch-user")
        .map(|u| u == "?1")
        .unwrap_or(false)
        && mode != "navigate"
    {
        return SecFetch::Invalid("sec-fetch-user without navigation");
    }
    SecFetch::Valid
}

/// Scored-path result.
#[derive(Debug, Clone)]
pub struct ScoreBreakdown {
    pub total: f64,
    pub signals: Vec<(String, f64)>,
}

/// The eight scored signals, each contributing 0..2.
fn score_browser_signals(req: &XyRequest) -> ScoreBreakdown {
    let mut signals: Vec<(String, f64)> = Vec::with_capacity(8);
    let user_agent = req.header("user-agent").unwrap_or("");

    // 1. User-Agent: browser markers, plausible length, platform, engine.
    let mut ua_score: f64 = 0.0;
    if BROWSER_MARKERS.iter().any(|m| m.is_match(user_agent)) {
        ua_score += 1.0;
    }
    if user_agent.len() >= 60 {
        ua_score += 0.5;
    }
    if ["windows", "macintosh", "linux", "android", "iphone"]
        .iter()
        .any(|platform| user_agent.to_ascii_lowercase().contains(platform))
    {
        ua_score += 0.5;
    }
    signals.push(("userAgent".to_string(), ua_score.min(2.0)));

    // 2. Accept: browsers ask for HTML with the xhtml alternative.
    let accept = req.header("accept").unwrap_or("");
    let accept_score = if accept.contains("text/html") && accept.contains("application/xhtml") {
        1.0
    } else {
        0.0
    };
    signals.push(("accept".to_string(), accept_score));

    // 3. Accept-Language: q-values or multiple languages.
    let language = req.header("accept-language").unwrap_or("");
    let language_score = if language.contains("q=") || language.contains(',') {
        1.0
    } else {
        0.0
    };
    signals.push(("acceptLanguage".to_string(), language_score));

    // 4. Accept-Encoding: multiple codings or brotli.
    let encoding = req.header("accept-encoding").unwrap_or("");
    let encoding_score = if encoding.contains(',') || encoding.contains("br") {
        1.0
    } else {
        0.0
    };
    signals.push(("acceptEncoding".to_string(), encoding_score));

    // 5. Origin / Referer carrying a parseable URL.
    let origin = req
        .header("origin")
        .or_else(|| req.header("referer"))
        .unwrap_or("");
    let origin_score = if origin.starts_with("http://") || origin.starts_with("https://") {
        1.0
    } else {
        0.0
    };
    signals.push(("origin".to_string(), origin_score));

    // 6. Connection semantics and Upgrade-Insecure-Requests.
    let mut connection_score: f64 = 0.0;
    if req
        .header("connection")
        .map(|c| c.eq_ignore_ascii_case("keep-alive"))
        .unwrap_or(false)
    {
        connection_score += 0.5;
    }
    if req.header("upgrade-insecure-requests") == Some("1") {
        connection_score += 1.0;
    }
    signals.push(("connection".to_string(), connection_score.min(1.5)));

    // 7. Cache-Control / Pragma presence.
    let cache_score = if req.header("cache-control").is_some() || req.header("pragma").is_some() {
        1.0
    } else {
        0.0
    };
    signals.push(("cacheControl".to_string(), cache_score));

    // 8. Privacy signals (DNT / GPC).
    let privacy_score =
        if req.header("dnt").is_some() || req.header("sec-gpc").is_some() {
            1.0
        } else {
            0.0
        };
    signals.push(("privacy".to_string(), privacy_score));

    let total = signals.iter().map(|(_, score)| score).sum();
    ScoreBreakdown { total, signals }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
    use bytes::Bytes;

    const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                             (KHTML, like Gecko) Chrome/127.0.0.0 Safari/537.36";

    fn request(headers: &[(&str, &str)]) -> XyRequest {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        XyRequest::adapt(
            Method::GET,
            "/".parse().unwrap(),
            map,
            Bytes::new(),
            "127.0.0.1:1".parse().unwrap(),
            false,
            false,
            false,
        )
    }

    #[test]
    fn curl_is_blocked_as_automation() {
        let policy = BrowserOnlyPolicy::new(3.0);
        let verdict = policy.evaluate(&request(&[("user-agent", "curl/8.0")]));
        match verdict {
            Verdict::Block { code, .. } => assert_eq!(code, "AUTOMATION_TOOL_DETECTED"),
            Verdict::Pass => panic!("curl must not pass"),
        }
    }

    #[test]
    fn empty_or_tiny_ua_is_blocked() {
        let policy = BrowserOnlyPolicy::new(3.0);
        assert!(policy.evaluate(&request(&[])).is_block());
        assert!(policy.evaluate(&request(&[("user-agent", "x")])).is_block());
    }

    #[test]
    fn valid_sec_fetch_passes_without_scoring() {
        let policy = BrowserOnlyPolicy::new(3.0);
        let verdict = policy.evaluate(&request(&[
            ("user-agent", CHROME_UA),
            ("sec-fetch-dest", "document"),
            ("sec-fetch-mode", "navigate"),
        ]));
        assert!(matches!(verdict, Verdict::Pass));
    }

    #[test]
    fn inconsistent_sec_fetch_blocks_as_spoof() {
        let policy = BrowserOnlyPolicy::new(3.0);
        let verdict = policy.evaluate(&request(&[
            ("user-agent", CHROME_UA),
            ("sec-fetch-dest", "image"),
            ("sec-fetch-mode", "navigate"),
        ]));
        match verdict {
            Verdict::Block { code, .. } => assert_eq!(code, "INVALID_SEC_FETCH"),
            Verdict::Pass => panic!("spoofed sec-fetch must not pass"),
        }
    }

    #[test]
    fn sec_fetch_user_requires_navigation() {
        let policy = BrowserOnlyPolicy::new(3.0);
        let verdict = policy.evaluate(&request(&[
            ("user-agent", CHROME_UA),
            ("sec-fetch-dest", "empty"),
            ("sec-fetch-mode", "cors"),
            ("sec-fetch-user", "?1"),
        ]));
        assert!(verdict.is_block());
    }

    #[test]
    fn rich_browser_headers_pass_the_scored_path() {
        let policy = BrowserOnlyPolicy::new(3.0);
        let verdict = policy.evaluate(&request(&[
            ("user-agent", CHROME_UA),
            ("accept", "text/html,application/xhtml+xml,*/*;q=0.8"),
            ("accept-language", "en-US,en;q=0.9,de;q=0.7"),
            ("accept-encoding", "gzip, deflate, br"),
            ("upgrade-insecure-requests", "1"),
        ]));
        assert!(matches!(verdict, Verdict::Pass));
    }

    #[test]
    fn bare_headers_fail_the_scored_path_with_breakdown() {
        let policy = BrowserOnlyPolicy::new(3.0);
        let verdict = policy.evaluate(&request(&[(
            "user-agent",
            "SomeClient/1.0 (custom integration)",
        )]));
        match verdict {
            Verdict::Block { code, details } => {
                assert_eq!(code, "INSUFFICIENT_BROWSER_SCORE");
                let details = details.unwrap();
                assert!(details["score"].as_f64().unwrap() < 3.0);
                assert_eq!(details["signals"].as_array().unwrap().len(), 8);
            }
            Verdict::Pass => panic!("bare client must not pass"),
        }
    }

    #[test]
    fn custom_validator_decides_alone() {
        let policy = BrowserOnlyPolicy::new(3.0)
            .with_validator(Arc::new(|req| Some(req.header("x-app-token").is_some())));
        // curl would normally be blocked; the validator overrides.
        let verdict = policy.evaluate(&request(&[
            ("user-agent", "curl/8.0"),
            ("x-app-token", "ok"),
        ]));
        assert!(matches!(verdict, Verdict::Pass));
        assert!(policy
            .evaluate(&request(&[("user-agent", CHROME_UA)]))
            .is_block());
    }

    #[test]
    fn terminal_only_blocks_browsers() {
        let policy = TerminalOnlyPolicy::new();
        assert!(policy.evaluate(&request(&[("user-agent", CHROME_UA)])).is_block());
        assert!(matches!(
            policy.evaluate(&request(&[("user-agent", "curl/8.0 (x86_64-linux)")])),
            Verdict::Pass
        ));
    }

    #[test]
    fn mobile_only_requires_mobile_ua_or_app_header() {
        let policy = MobileOnlyPolicy::new().with_app_header("x-mobile-app");
        let mobile_ua = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) Mobile/15E148";
        assert!(matches!(
            policy.evaluate(&request(&[("user-agent", mobile_ua)])),
            Verdict::Pass
        ));
        assert!(matches!(
            policy.evaluate(&request(&[("user-agent", CHROME_UA), ("x-mobile-app", "1")])),
            Verdict::Pass
        ));
        assert!(policy.evaluate(&request(&[("user-agent", CHROME_UA)])).is_block());
    }
}
