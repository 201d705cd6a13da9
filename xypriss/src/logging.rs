//! Tracing initialization from the `logging` config section.
//!
//! The base level, per-component overrides, and suppress patterns all
//! become `EnvFilter` directives. Worker processes log to stderr so
//! heartbeat lines own stdout.

use crate::config::LoggingSection;
use tracing_subscriber::EnvFilter;

/// Build the filter: base level, then `component=level` overrides, then
/// `pattern=off` for every suppressed target.
pub fn build_filter(logging: &LoggingSection) -> EnvFilter {
    let mut directives = vec![logging.level.clone()];
    for (component, level) in &logging.components {
        directives.push(format!("{component}={level}"));
    }
    for pattern in &logging.suppress_patterns {
        directives.push(format!("{pattern}=off"));
    }
    EnvFilter::try_new(directives.join(","))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize tracing for the supervisor / standalone process.
pub fn init(logging: &LoggingSection) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_filter(logging))
        .try_init();
}

/// Initialize tracing for a worker process: same filter, stderr writer.
pub fn init_worker(logging: &LoggingSection) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_filter(logging))
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn filter_combines_level_components_and_suppressions() {
        let section = LoggingSection {
            level: "info".to_string(),
            components: HashMap::from([("xypriss::cluster".to_string(), "debug".to_string())]),
            suppress_patterns: vec!["hyper".to_string()],
        };
        let filter = build_filter(&section);
        let rendered = filter.to_string();
        assert!(rendered.contains("info"));
        assert!(rendered.contains("xypriss::cluster=debug"));
        assert!(rendered.contains("hyper=off"));
    }

    #[test]
    fn invalid_directives_fall_back_to_info() {
        let section = LoggingSection {
            level: "!!not-a-level!!".to_string(),
            ..Default::default()
        };
        // Must not panic; the fallback filter is usable.
        let _ = build_filter(&section);
    }
}
