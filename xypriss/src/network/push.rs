//! HTTP/2 server-push decision engine.
//!
//! The planner computes push candidates from the request path and Accept
//! headers, then filters each candidate against what the client already
//! told us: the file must exist on disk, the client's cache directives
//! must permit a push, its validators (`If-None-Match`,
//! `If-Modified-Since`) must indicate staleness, and clients on
//! constrained links (`Save-Data`, slow `Downlink`) only receive critical
//! assets.
//!
//! Pushing itself is delegated to a [`Pusher`] the transport may provide.
//! When the transport negotiated HTTP/1.1, or no pusher is exposed (for
//! example behind a proxy that terminates HTTP/2), the planner silently
//! does nothing.

use crate::adapter::XyRequest;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Cache profile of a pushed asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetClass {
    /// Fonts and images: content-addressed, effectively immutable
    Immutable,
    /// CSS and JS: revalidate daily
    Daily,
    /// Everything else: revalidate hourly
    Hourly,
}

impl AssetClass {
    pub fn classify(path: &str) -> Self {
        let extension = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match extension.as_str() {
            "woff" | "woff2" | "ttf" | "otf" | "png" | "jpg" | "jpeg" | "gif" | "webp"
            | "avif" | "svg" | "ico" => AssetClass::Immutable,
            "css" | "js" | "mjs" => AssetClass::Daily,
            _ => AssetClass::Hourly,
        }
    }

    pub fn cache_control(&self) -> &'static str {
        match self {
            AssetClass::Immutable => "public, max-age=31536000, immutable",
            AssetClass::Daily => "public, max-age=86400, must-revalidate",
            AssetClass::Hourly => "public, max-age=3600, must-revalidate",
        }
    }
}

/// One asset the planner wants pushed.
#[derive(Debug, Clone)]
pub struct PushCandidate {
    /// URL path of the asset
    pub path: String,
    /// Resolved filesystem location
    pub file: PathBuf,
    pub asset_class: AssetClass,
    /// Critical assets are pushed even to constrained clients
    pub critical: bool,
    pub etag: String,
    pub last_modified: SystemTime,
    pub cache_control: &'static str,
}

/// Transport-provided push capability. Absent on HTTP/1.1 and behind
/// HTTP/2-terminating proxies; the planner then no-ops.
pub trait Pusher: Send + Sync {
    fn push(&self, candidate: &PushCandidate);
}

/// The decision engine.
pub struct PushPlanner {
    root: PathBuf,
}

impl PushPlanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Compute and filter candidates, then hand survivors to the pusher.
    /// Without a pusher, or off HTTP/2, this is a silent no-op.
    pub fn plan(&self, req: &XyRequest, pusher: Option<&dyn Pusher>) {
        if !req.is_http2() {
            return;
        }
        let Some(pusher) = pusher else {
            return;
        };
        for candidate in self.candidates(req) {
            pusher.push(&candidate);
        }
    }

    /// Candidates that survive every client-side filter.
    pub fn candidates(&self, req: &XyRequest) -> Vec<PushCandidate> {
        let accept = req.header("accept").unwrap_or("");
        if !accept.contains("text/html") {
            return Vec::new();
        }
        let mobile = req
            .header("user-agent")
            .map(is_mobile_agent)
            .unwrap_or(false);
        let constrained = client_is_constrained(req);

        self.candidate_paths(&req.path, mobile)
            .into_iter()
            .filter_map(|(path, critical)| self.materialize(&path, critical))
            .filter(|candidate| {
                if constrained && !candidate.critical {
                    return false;
                }
                if client_cache_forbids(req) {
                    return false;
                }
                client_copy_is_stale(req, candidate)
            })
            .collect()
    }

    /// Static candidate set per page class. Mobile clients get the mobile
    /// stylesheet variant.
    fn candidate_paths(&self, page: &str, mobile: bool) -> Vec<(String, bool)> {
        let mut paths = vec![
            (
                if mobile {
                    "/assets/app.mobile.css".to_string()
                } else {
                    "/assets/app.css".to_string()
                },
                true,
            ),
            ("/assets/app.js".to_string(), true),
        ];
        if page != "/" {
            let page_slug = page.trim_matches('/').replace('/', "-");
            paths.push((format!("/assets/{page_slug}.css"), false));
        }
        paths
    }

    fn materialize(&self, url_path: &str, critical: bool) -> Option<PushCandidate> {
        let relative = url_path.trim_start_matches('/');
        let file = self.root.join(relative);
        let metadata = std::fs::metadata(&file).ok()?;
        if !metadata.is_file() {
            return None;
        }
        let modified = metadata.modified().ok()?;
        Some(PushCandidate {
            path: url_path.to_string(),
            etag: compute_etag(url_path, modified, metadata.len()),
            last_modified: modified,
            asset_class: AssetClass::classify(url_path),
            cache_control: AssetClass::classify(url_path).cache_control(),
            critical,
            file,
        })
    }
}

/// Weak ETag from (path, mtime, size).
pub fn compute_etag(path: &str, modified: SystemTime, size: u64) -> String {
    let mtime = modified
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(mtime.to_be_bytes());
    hasher.update(size.to_be_bytes());
    let digest = hasher.finalize();
    let hex = format!("{digest:x}");
    format!("W/\"{}\"", &hex[..16])
}

fn is_mobile_agent(user_agent: &str) -> bool {
    let ua = user_agent.to_ascii_lowercase();
    ["android", "iphone", "ipad", "mobile"]
        .iter()
        .any(|marker| ua.contains(marker))
}

/// `Save-Data: on` or a sub-megabit downlink marks the client constrained.
fn client_is_constrained(req: &XyRequest) -> bool {
    if req
        .header("save-data")
        .map(|v| v.eq_ignore_ascii_case("on"))
        .unwrap_or(false)
    {
        return true;
    }
    req.header("downlink")
        .and_then(|v| v.parse::<f64>().ok())
        .map(|mbps| mbps < 1.0)
        .unwrap_or(false)
}

fn client_cache_forbids(req: &XyRequest) -> bool {
    req.header("cache-control")
        .map(|directives| {
            directives.contains("no-store") || directives.contains("only-if-cached")
        })
        .unwrap_or(false)
}

/// Push only when the client's validators say its copy is stale.
fn client_copy_is_stale(req: &XyRequest, candidate: &PushCandidate) -> bool {
    if let Some(inm) = req.header("if-none-match") {
        if inm
            .split(',')
            .any(|etag| etag.trim() == candidate.etag)
        {
            return false;
        }
    }
    if let Some(ims) = req.header("if-modified-since") {
        if let Ok(since) = chrono::DateTime::parse_from_rfc2822(ims) {
            let modified = chrono::DateTime::<chrono::Utc>::from(candidate.last_modified);
            if modified <= since {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue, Method};
    use bytes::Bytes;
    use parking_lot::Mutex;

    struct RecordingPusher {
        pushed: Mutex<Vec<String>>,
    }

    impl Pusher for RecordingPusher {
        fn push(&self, candidate: &PushCandidate) {
            self.pushed.lock().push(candidate.path.clone());
        }
    }

    fn http2_request(headers: &[(&str, &str)]) -> XyRequest {
        let mut map = HeaderMap::new();
        map.insert("accept", HeaderValue::from_static("text/html"));
        for (name, value) in headers {
            map.insert(
                axum::http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
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
            true,
            true,
        )
    }

    fn asset_root() -> PathBuf {
        let root = std::env::temp_dir().join(format!("xypriss-push-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(root.join("assets")).unwrap();
        std::fs::write(root.join("assets/app.css"), "body {}").unwrap();
        std::fs::write(root.join("assets/app.js"), "void 0;").unwrap();
        root
    }

    #[test]
    fn plans_existing_assets_for_html_requests() {
        let root = asset_root();
        let planner = PushPlanner::new(&root);
        let req = http2_request(&[]);
        let candidates = planner.candidates(&req);
        let paths: Vec<&str> = candidates.iter().map(|c| c.path.as_str()).collect();
        assert!(paths.contains(&"/assets/app.css"));
        assert!(paths.contains(&"/assets/app.js"));
        // The per-page stylesheet does not exist on disk, so it is absent.
        assert_eq!(candidates.len(), 2);
        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn no_pusher_means_silent_no_op() {
        let root = asset_root();
        let planner = PushPlanner::new(&root);
        let req = http2_request(&[]);
        planner.plan(&req, None);
        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn http1_requests_are_never_pushed() {
        let root = asset_root();
        let planner = PushPlanner::new(&root);
        let mut map = HeaderMap::new();
        map.insert("accept", HeaderValue::from_static("text/html"));
        let req = XyRequest::adapt(
            Method::GET,
            "/".parse().unwrap(),
            map,
            Bytes::new(),
            "127.0.0.1:1".parse().unwrap(),
            false,
            false,
            false,
        );
        let pusher = RecordingPusher {
            pushed: Mutex::new(Vec::new()),
        };
        planner.plan(&req, Some(&pusher));
        assert!(pusher.pushed.lock().is_empty());
        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn save_data_drops_non_critical_assets() {
        let root = asset_root();
        std::fs::write(root.join("assets/about.css"), "p {}").unwrap();
        let planner = PushPlanner::new(&root);

        let mut map = HeaderMap::new();
        map.insert("accept", HeaderValue::from_static("text/html"));
        map.insert("save-data", HeaderValue::from_static("on"));
        let req = XyRequest::adapt(
            Method::GET,
            "/about".parse().unwrap(),
            map,
            Bytes::new(),
            "127.0.0.1:1".parse().unwrap(),
            false,
            true,
            true,
        );
        let candidates = planner.candidates(&req);
        assert!(candidates.iter().all(|c| c.critical));
        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn fresh_client_copy_is_not_pushed() {
        let root = asset_root();
        let planner = PushPlanner::new(&root);

        // First pass discovers the etag of app.css.
        let req = http2_request(&[]);
        let etag = planner
            .candidates(&req)
            .into_iter()
            .find(|c| c.path == "/assets/app.css")
            .unwrap()
            .etag;

        let req = http2_request(&[("if-none-match", etag.as_str())]);
        let candidates = planner.candidates(&req);
        assert!(candidates.iter().all(|c| c.path != "/assets/app.css"));
        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn no_store_clients_are_never_pushed() {
        let root = asset_root();
        let planner = PushPlanner::new(&root);
        let req = http2_request(&[("cache-control", "no-store")]);
        assert!(planner.candidates(&req).is_empty());
        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn asset_classes_map_to_cache_profiles() {
        assert_eq!(AssetClass::classify("/f/a.woff2"), AssetClass::Immutable);
        assert_eq!(AssetClass::classify("/f/a.css"), AssetClass::Daily);
        assert_eq!(AssetClass::classify("/f/a.html"), AssetClass::Hourly);
        assert!(AssetClass::Immutable.cache_control().contains("immutable"));
    }

    #[test]
    fn etag_tracks_path_mtime_and_size() {
        let now = SystemTime::now();
        let a = compute_etag("/a.css", now, 10);
        let b = compute_etag("/a.css", now, 11);
        let c = compute_etag("/b.css", now, 10);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("W/\""));
    }
}
