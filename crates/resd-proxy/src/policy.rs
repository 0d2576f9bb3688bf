//! Interception policy.
//!
//! Decides per host whether a connection is terminated and inspected or
//! tunneled untouched.

use parking_lot::RwLock;
use resd_core::InterceptSettings;

/// A host pattern: exact, `*.domain` (one subdomain level) or `**.domain`
/// (any depth). Wildcards also match the bare domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPattern {
    pattern: String,
}

impl HostPattern {
    /// Parses a pattern. Case and a trailing dot are ignored.
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.trim().trim_end_matches('.').to_ascii_lowercase(),
        }
    }

    /// The pattern text.
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    fn base_domain(&self) -> &str {
        if let Some(base) = self.pattern.strip_prefix("**.") {
            base
        } else if let Some(base) = self.pattern.strip_prefix("*.") {
            base
        } else {
            &self.pattern
        }
    }

    /// Checks if a host matches this pattern.
    pub fn matches(&self, host: &str) -> bool {
        let host = strip_port(host).trim_end_matches('.').to_ascii_lowercase();
        let base = self.base_domain();

        if self.pattern.starts_with("**.") {
            host == base || host.ends_with(&format!(".{}", base))
        } else if self.pattern.starts_with("*.") {
            if host == base {
                return true;
            }
            match host.strip_suffix(&format!(".{}", base)) {
                Some(prefix) => !prefix.contains('.'),
                None => false,
            }
        } else {
            host == self.pattern
        }
    }
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        // A bare IPv6 address has several colons and no port.
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

#[derive(Debug, Default)]
struct Patterns {
    allow: Vec<HostPattern>,
    deny: Vec<HostPattern>,
}

/// Runtime-replaceable allow/deny policy.
///
/// Deny wins over allow; an empty allow-list admits every host.
#[derive(Debug, Default)]
pub struct InterceptPolicy {
    patterns: RwLock<Patterns>,
}

impl InterceptPolicy {
    /// Creates a policy from configuration.
    pub fn new(settings: &InterceptSettings) -> Self {
        let policy = Self::default();
        policy.update(settings);
        policy
    }

    /// Replaces the allow and deny lists.
    pub fn update(&self, settings: &InterceptSettings) {
        let parse = |list: &[String]| -> Vec<HostPattern> {
            list.iter()
                .map(|p| HostPattern::new(p))
                .filter(|p| !p.as_str().is_empty())
                .collect()
        };
        *self.patterns.write() = Patterns {
            allow: parse(&settings.allow),
            deny: parse(&settings.deny),
        };
    }

    /// Returns true if connections to `host` should be intercepted.
    pub fn should_intercept(&self, host: &str) -> bool {
        let patterns = self.patterns.read();
        if patterns.deny.iter().any(|p| p.matches(host)) {
            return false;
        }
        patterns.allow.is_empty() || patterns.allow.iter().any(|p| p.matches(host))
    }
}
