//! # Security Inspection Chain
//!
//! Layered request inspection, run before routing:
//!
//! 1. Route scoping: the `routeConfig` include/exclude lists decide
//!    whether a path is inspected at all.
//! 2. Client classifiers: browser-only / terminal-only / mobile-only
//!    policies ([`browser`]).
//! 3. Injection detectors: SQL, path traversal, command, XXE, LDAP
//!    ([`injection`]).
//!
//! Every triggered layer produces an [`AttackData`] report for the
//! `onSecurityAttack` plugin hook, whether or not it blocked. Block
//! responses stay generic in production; the debug flag attaches the
//! classifier module, inner code, and details.
//!
//! [`xems`], the encrypted session store, lives in this module too as
//! the session half of the security surface.

pub mod browser;
pub mod injection;
pub mod xems;

use crate::adapter::XyRequest;
use crate::config::SecuritySection;
use crate::error::SecurityBlock;
use crate::plugins::{AttackData, Severity};
use browser::{BrowserOnlyPolicy, MobileOnlyPolicy, TerminalOnlyPolicy, Verdict};
use injection::InjectionDetector;

/// Result of one chain pass.
#[derive(Debug, Default)]
pub struct SecurityDecision {
    /// Set when the request must be rejected
    pub block: Option<SecurityBlock>,
    /// Attack reports to fan out to `onSecurityAttack`
    pub attacks: Vec<AttackData>,
}

impl SecurityDecision {
    pub fn is_blocked(&self) -> bool {
        self.block.is_some()
    }
}

/// The assembled chain.
pub struct SecurityChain {
    debug: bool,
    include: Vec<String>,
    exclude: Vec<String>,
    browser_only: Option<BrowserOnlyPolicy>,
    terminal_only: Option<TerminalOnlyPolicy>,
    mobile_only: Option<MobileOnlyPolicy>,
    detectors: Vec<InjectionDetector>,
}

impl SecurityChain {
    pub fn new(section: &SecuritySection) -> Self {
        Self {
            debug: section.debug,
            include: section.route_config.include.clone(),
            exclude: section.route_config.exclude.clone(),
            browser_only: section
                .browser_only
                .enabled
                .then(|| BrowserOnlyPolicy::new(section.browser_only.threshold)),
            terminal_only: section.terminal_only.enabled.then(TerminalOnlyPolicy::new),
            mobile_only: section.mobile_only.enabled.then(MobileOnlyPolicy::new),
            detectors: injection::build_detectors(section),
        }
    }

    /// Replace the browser policy (to install a custom validator).
    pub fn set_browser_policy(&mut self, policy: BrowserOnlyPolicy) {
        self.browser_only = Some(policy);
    }

    /// Whether `path` falls under inspection per `routeConfig`.
    pub fn applies_to(&self, path: &str) -> bool {
        if self.exclude.iter().any(|rule| route_matches(rule, path)) {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        self.include.iter().any(|rule| route_matches(rule, path))
    }

    /// Run the chain over one request.
    pub fn inspect(&self, req: &XyRequest) -> SecurityDecision {
        let mut decision = SecurityDecision::default();
        if !self.applies_to(&req.path) {
            return decision;
        }
        let ip = req.ip();

        let classifiers: [(&'static str, Option<Verdict>); 3] = [
            (
                "browser_only",
                self.browser_only.as_ref().map(|p| p.evaluate(req)),
            ),
            (
                "terminal_only",
                self.terminal_only.as_ref().map(|p| p.evaluate(req)),
            ),
            (
                "mobile_only",
                self.mobile_only.as_ref().map(|p| p.evaluate(req)),
            ),
        ];

        for (module, verdict) in classifiers {
            if let Some(Verdict::Block { code, details }) = verdict {
                decision.attacks.push(AttackData {
                    attack_type: format!("classifier.{module}"),
                    severity: Severity::Medium,
                    path: req.path.clone(),
                    ip: ip.clone(),
                    blocked: true,
                });
                decision.block = Some(self.block(module, code, details, req));
                return decision;
            }
        }

        for detector in &self.detectors {
            if let Some(detection) = detector.inspect(req) {
                decision.attacks.push(AttackData {
                    attack_type: detection.kind.name().to_string(),
                    severity: detection.kind.severity(),
                    path: req.path.clone(),
                    ip: ip.clone(),
                    blocked: detection.block,
                });
                tracing::warn!(
                    detector = detection.kind.name(),
                    location = %detection.location,
                    ip = %ip,
                    blocked = detection.block,
                    "injection attempt detected"
                );
                if detection.block {
                    decision.block = Some(self.block(
                        detector_module(detection.kind),
                        "INJECTION_DETECTED",
                        Some(serde_json::json!({
                            "detector": detection.kind.name(),
                            "location": detection.location,
                            "confidence": detection.confidence,
                        })),
                        req,
                    ));
                    return decision;
                }
            }
        }

        decision
    }

    fn block(
        &self,
        module: &'static str,
        code: &str,
        details: Option<serde_json::Value>,
        req: &XyRequest,
    ) -> SecurityBlock {
        SecurityBlock {
            module,
            code: code.to_string(),
            details,
            ua_snippet: req
                .header("user-agent")
                .map(|ua| ua.chars().take(48).collect()),
            debug: self.debug,
        }
    }
}

fn detector_module(kind: injection::DetectorKind) -> &'static str {
    match kind {
        injection::DetectorKind::Sql => "injection.sql",
        injection::DetectorKind::PathTraversal => "injection.path_traversal",
        injection::DetectorKind::Command => "injection.command",
        injection::DetectorKind::Xxe => "injection.xxe",
        injection::DetectorKind::Ldap => "injection.ldap",
    }
}

/// Route rules support exact paths and a trailing `*` prefix wildcard.
fn route_matches(rule: &str, path: &str) -> bool {
    match rule.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => path == rule,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClassifierSection, DetectorSection, RouteConfigSection};
    use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
    use bytes::Bytes;

    fn request(path_and_query: &str, headers: &[(&str, &str)]) -> XyRequest {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        XyRequest::adapt(
            Method::GET,
            path_and_query.parse().unwrap(),
            map,
            Bytes::new(),
            "198.51.100.4:2222".parse().unwrap(),
            false,
            false,
            false,
        )
    }

    fn chain_with(mutate: impl FnOnce(&mut SecuritySection)) -> SecurityChain {
        let mut section = SecuritySection {
            debug: true,
            ..Default::default()
        };
        mutate(&mut section);
        SecurityChain::new(&section)
    }

    #[test]
    fn excluded_routes_skip_every_layer() {
        let chain = chain_with(|s| {
            s.browser_only = ClassifierSection {
                enabled: true,
                threshold: 3.0,
            };
            s.route_config = RouteConfigSection {
                include: Vec::new(),
                exclude: vec!["/health".to_string(), "/internal/*".to_string()],
            };
        });
        assert!(!chain
            .inspect(&request("/health", &[("user-agent", "curl/8.0")]))
            .is_blocked());
        assert!(!chain
            .inspect(&request("/internal/debug", &[("user-agent", "curl/8.0")]))
            .is_blocked());
        assert!(chain
            .inspect(&request("/", &[("user-agent", "curl/8.0")]))
            .is_blocked());
    }

    #[test]
    fn include_list_narrows_inspection() {
        let chain = chain_with(|s| {
            s.browser_only = ClassifierSection {
                enabled: true,
                threshold: 3.0,
            };
            s.route_config.include = vec!["/app/*".to_string()];
        });
        assert!(chain
            .inspect(&request("/app/page", &[("user-agent", "curl/8.0")]))
            .is_blocked());
        assert!(!chain
            .inspect(&request("/api/data", &[("user-agent", "curl/8.0")]))
            .is_blocked());
    }

    #[test]
    fn classifier_block_carries_module_and_attack_report() {
        let chain = chain_with(|s| {
            s.browser_only = ClassifierSection {
                enabled: true,
                threshold: 3.0,
            };
        });
        let decision = chain.inspect(&request("/", &[("user-agent", "curl/8.0")]));
        let block = decision.block.unwrap();
        assert_eq!(block.module, "browser_only");
        assert_eq!(block.code, "AUTOMATION_TOOL_DETECTED");
        assert!(block.debug);
        assert_eq!(decision.attacks.len(), 1);
        assert!(decision.attacks[0].blocked);
    }

    #[test]
    fn detector_block_reports_attack_data() {
        let chain = chain_with(|s| {
            s.sql_injection = DetectorSection {
                enabled: true,
                ..Default::default()
            };
        });
        let decision = chain.inspect(&request("/search?q=1%20OR%201%3D1", &[]));
        assert!(decision.is_blocked());
        assert_eq!(decision.attacks[0].attack_type, "sql_injection");
        assert_eq!(decision.attacks[0].ip, "198.51.100.4");
    }

    #[test]
    fn non_blocking_detector_reports_without_blocking() {
        let chain = chain_with(|s| {
            s.sql_injection = DetectorSection {
                enabled: true,
                block_on_detection: false,
                ..Default::default()
            };
        });
        let decision = chain.inspect(&request("/search?q=1%20OR%201%3D1", &[]));
        assert!(!decision.is_blocked());
        assert_eq!(decision.attacks.len(), 1);
        assert!(!decision.attacks[0].blocked);
    }

    #[test]
    fn disabled_chain_passes_everything() {
        let chain = chain_with(|_| {});
        let decision = chain.inspect(&request("/", &[("user-agent", "curl/8.0")]));
        assert!(!decision.is_blocked());
        assert!(decision.attacks.is_empty());
    }
}
