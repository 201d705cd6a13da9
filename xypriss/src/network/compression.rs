//! # Response Compression
//!
//! Content-encoding negotiation with strict algorithm enforcement, plus
//! the codec glue for brotli, gzip, and deflate.
//!
//! ## Overview
//!
//! Negotiation intersects three sets: the configured allow-list, the
//! client's `Accept-Encoding`, and the codings the build supports. The
//! allow-list is strict: an algorithm the client accepts but the
//! configuration omits is never used, which is the property the test
//! suite pins down. Preference among survivors is fixed: brotli over
//! gzip over deflate, regardless of configuration order.
//!
//! Small bodies skip compression entirely: a body of exactly
//! `threshold` bytes stays identity, `threshold + 1` compresses. An
//! optional per-request filter can veto compression regardless of
//! negotiation, and `q=0` entries in `Accept-Encoding` exclude a coding
//! the way the client intends.
//!
//! ## Usage
//!
//! ```rust
//! use xypriss::config::CompressionSection;
//! use xypriss::network::compression::CompressionPolicy;
//!
//! let policy = CompressionPolicy::new(&CompressionSection {
//!     enabled: true,
//!     algorithms: vec!["br".to_string(), "deflate".to_string()],
//!     threshold: 1024,
//! });
//!
//! // A gzip-only client gets identity: gzip is not on the allow-list.
//! assert!(policy.negotiate_parts("gzip", 4096, false).is_none());
//! ```

use crate::adapter::XyRequest;
use crate::config::CompressionSection;
use std::io::Write;
use std::sync::Arc;

/// Supported content codings, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Brotli,
    Gzip,
    Deflate,
}

impl Algorithm {
    /// Wire token for `Content-Encoding` / `Accept-Encoding`.
    pub fn token(&self) -> &'static str {
        match self {
            Algorithm::Brotli => "br",
            Algorithm::Gzip => "gzip",
            Algorithm::Deflate => "deflate",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "br" => Some(Algorithm::Brotli),
            "gzip" => Some(Algorithm::Gzip),
            "deflate" => Some(Algorithm::Deflate),
            _ => None,
        }
    }
}

/// Per-request veto callback.
pub type CompressionFilter = Arc<dyn Fn(&XyRequest) -> bool + Send + Sync>;

/// The negotiation policy plus codec entry points.
pub struct CompressionPolicy {
    enabled: bool,
    /// Allow-list in fixed preference order
    allowed: Vec<Algorithm>,
    threshold: usize,
    filter: Option<CompressionFilter>,
}

impl CompressionPolicy {
    pub fn new(section: &CompressionSection) -> Self {
        // Keep preference order fixed regardless of config order.
        let mut allowed = Vec::new();
        for candidate in [Algorithm::Brotli, Algorithm::Gzip, Algorithm::Deflate] {
            if section
                .algorithms
                .iter()
                .any(|name| name == candidate.token())
            {
                allowed.push(candidate);
            }
        }
        Self {
            enabled: section.enabled,
            allowed,
            threshold: section.threshold,
            filter: None,
        }
    }

    /// Install a veto filter; returning `false` forces identity.
    pub fn with_filter(mut self, filter: CompressionFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Pick the coding for this response, or `None` for identity.
    pub fn negotiate(&self, req: &XyRequest, body_len: usize) -> Option<Algorithm> {
        self.negotiate_parts(
            req.header("accept-encoding").unwrap_or(""),
            body_len,
            self.vetoed(req),
        )
    }

    /// Whether the installed filter vetoes compression for this request.
    pub fn vetoed(&self, req: &XyRequest) -> bool {
        self.filter.as_ref().map(|f| !f(req)).unwrap_or(false)
    }

    /// Negotiation over pre-extracted parts; the pipeline calls this
    /// after the handler ran, when the request has been consumed.
    pub fn negotiate_parts(
        &self,
        accept_encoding: &str,
        body_len: usize,
        vetoed: bool,
    ) -> Option<Algorithm> {
        if !self.enabled || self.allowed.is_empty() || vetoed {
            return None;
        }
        if body_len <= self.threshold {
            return None;
        }

        let accepted = accepted_encodings(accept_encoding);
        self.allowed
            .iter()
            .copied()
            .find(|algorithm| accepted.contains(&algorithm.token().to_string()))
    }

    /// Compress `body` with `algorithm`. Falls back to the original bytes
    /// when the codec fails (identity is always safe).
    pub fn compress(&self, algorithm: Algorithm, body: &[u8]) -> Vec<u8> {
        match encode(algorithm, body) {
            Ok(compressed) => compressed,
            Err(error) => {
                tracing::error!(algorithm = algorithm.token(), %error, "compression failed");
                body.to_vec()
            }
        }
    }
}

/// Parse `Accept-Encoding`, dropping `q=0` entries. A `*` entry accepts
/// every coding (the allow-list still gates what is actually used).
fn accepted_encodings(header: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut wildcard = false;
    for entry in header.split(',') {
        let mut parts = entry.trim().split(';');
        let token = parts.next().unwrap_or("").trim().to_ascii_lowercase();
        if token.is_empty() {
            continue;
        }
        let forbidden = parts.any(|p| {
            let p = p.trim();
            p.strip_prefix("q=")
                .map(|q| q.trim().parse::<f32>().map(|q| q == 0.0).unwrap_or(false))
                .unwrap_or(false)
        });
        if forbidden {
            continue;
        }
        if token == "*" {
            wildcard = true;
        } else {
            out.push(token);
        }
    }
    if wildcard {
        for algorithm in [Algorithm::Brotli, Algorithm::Gzip, Algorithm::Deflate] {
            let token = algorithm.token().to_string();
            if !out.contains(&token) {
                out.push(token);
            }
        }
    }
    out
}

fn encode(algorithm: Algorithm, body: &[u8]) -> std::io::Result<Vec<u8>> {
    match algorithm {
        Algorithm::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(body)?;
            encoder.finish()
        }
        Algorithm::Deflate => {
            // HTTP "deflate" is the zlib-wrapped format.
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(body)?;
            encoder.finish()
        }
        Algorithm::Brotli => {
            let mut out = Vec::new();
            {
                let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
                writer.write_all(body)?;
                writer.flush()?;
            }
            Ok(out)
        }
    }
}
