//! Source policy engine: ordered allow/deny rules over download URLs and paths.
//!
//! Active policies are evaluated in ascending priority order and the first
//! matching rule decides. A URL no rule matches is **allowed**: the engine is
//! fail-open, and deployments that want a closed default add a lowest-priority
//! `*` deny rule. Sources whose scheme is not http/https/file or a local
//! UNC/drive/absolute path are denied before any rule is consulted.

#![allow(missing_docs)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::catalog::store::PolicyRepository;
use crate::core::errors::{DeployError, Result};
use crate::core::network::host_of;
use crate::core::paths::classify_source;

/// Whether a matching rule permits or forbids the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Allow,
    Deny,
}

impl Direction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            other => Err(DeployError::InvalidConfig {
                details: format!("policy direction must be allow|deny, got {other:?}"),
            }),
        }
    }
}

/// One allow/deny rule. `pattern` + `direction` is unique within a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePolicy {
    /// Assigned by the repository on insert.
    #[serde(default)]
    pub id: u64,
    pub pattern: String,
    pub direction: Direction,
    /// Lower values are evaluated first.
    pub priority: i32,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub description: Option<String>,
}

const fn default_active() -> bool {
    true
}

impl SourcePolicy {
    #[must_use]
    pub fn new(pattern: impl Into<String>, direction: Direction, priority: i32) -> Self {
        Self {
            id: 0,
            pattern: pattern.into(),
            direction,
            priority,
            active: true,
            description: None,
        }
    }

    /// Label used in audit records and denial messages.
    #[must_use]
    pub fn label(&self) -> String {
        format!(
            "#{} {} {:?} (priority {})",
            self.id, self.direction, self.pattern, self.priority
        )
    }
}

/// Outcome of evaluating one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PolicyDecision {
    Allowed {
        /// `None` when no rule matched and the fail-open default applied.
        matched_policy: Option<String>,
    },
    Denied {
        reason: String,
        matched_policy: Option<String>,
    },
}

impl PolicyDecision {
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// Convert a denial into the typed pipeline error.
    pub fn into_result(self, url: &str) -> Result<()> {
        match self {
            Self::Allowed { .. } => Ok(()),
            Self::Denied {
                reason,
                matched_policy,
            } => Err(DeployError::SourceDenied {
                url: url.to_string(),
                reason,
                policy: matched_policy,
            }),
        }
    }
}

/// How a single pattern is compared against a source.
#[derive(Debug)]
enum Matcher {
    /// `*` wildcard: full match on the URL, or on the host when the pattern names no path.
    Glob { regex: Regex, host_scoped: bool },
    /// Bare domain: host equals it or is a subdomain of it.
    Host(String),
    /// Anything with a `/`: substring of the URL.
    Substring(String),
}

impl Matcher {
    fn compile(pattern: &str) -> Option<Self> {
        let normalized = pattern.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return None;
        }
        if normalized.contains('*') {
            let regex = match glob_to_regex(&normalized) {
                Ok(regex) => regex,
                Err(err) => {
                    eprintln!("[FDP-POLICY] skipping pattern {pattern:?}: {err}");
                    return None;
                }
            };
            return Some(Self::Glob {
                regex,
                host_scoped: !normalized.contains('/'),
            });
        }
        if normalized.contains('/') {
            return Some(Self::Substring(normalized));
        }
        Some(Self::Host(normalized.trim_start_matches('.').to_string()))
    }

    fn matches(&self, url_lower: &str, host: Option<&str>) -> bool {
        match self {
            Self::Glob { regex, host_scoped } => {
                regex.is_match(url_lower)
                    || (*host_scoped && host.is_some_and(|h| regex.is_match(h)))
            }
            Self::Host(domain) => host.is_some_and(|h| {
                h == domain
                    || h.strip_suffix(domain.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'))
            }),
            Self::Substring(needle) => url_lower.contains(needle.as_str()),
        }
    }
}

/// Convert a `*` wildcard pattern to an anchored regex.
///
/// Every character other than `*` is literal; `*` becomes `.*`.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut regex_str = String::with_capacity(pattern.len() * 2 + 2);
    regex_str.push('^');
    let mut first = true;
    for literal in pattern.split('*') {
        if !first {
            regex_str.push_str(".*");
        }
        first = false;
        regex_str.push_str(&regex::escape(literal));
    }
    regex_str.push('$');
    Regex::new(&regex_str).map_err(|err| DeployError::InvalidConfig {
        details: format!("invalid wildcard pattern {pattern:?}: {err}"),
    })
}

/// Host used for domain rules: the URL authority, or the server of a UNC path.
fn policy_host(url: &str) -> Option<String> {
    if url.contains("://") {
        return host_of(url);
    }
    let unc = url
        .strip_prefix(r"\\")
        .or_else(|| url.strip_prefix("//"))?;
    unc.split(['\\', '/'])
        .next()
        .filter(|server| !server.is_empty())
        .map(str::to_ascii_lowercase)
}

/// A rule set compiled once and evaluated many times.
#[derive(Debug)]
pub struct CompiledPolicySet {
    rules: Vec<(SourcePolicy, Matcher)>,
}

impl CompiledPolicySet {
    /// Keep active rules, ordered by priority then id.
    #[must_use]
    pub fn compile(policies: &[SourcePolicy]) -> Self {
        let mut active: Vec<&SourcePolicy> = policies.iter().filter(|p| p.active).collect();
        active.sort_by_key(|p| (p.priority, p.id));
        let rules = active
            .into_iter()
            .filter_map(|policy| Matcher::compile(&policy.pattern).map(|m| (policy.clone(), m)))
            .collect();
        Self { rules }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First matching rule decides; no match allows.
    #[must_use]
    pub fn evaluate(&self, url: &str) -> PolicyDecision {
        if classify_source(url).is_none() {
            return PolicyDecision::Denied {
                reason: "unsupported source scheme".to_string(),
                matched_policy: None,
            };
        }
        let url_lower = url.trim().to_ascii_lowercase();
        let host = policy_host(&url_lower);
        for (policy, matcher) in &self.rules {
            if matcher.matches(&url_lower, host.as_deref()) {
                return match policy.direction {
                    Direction::Allow => PolicyDecision::Allowed {
                        matched_policy: Some(policy.label()),
                    },
                    Direction::Deny => PolicyDecision::Denied {
                        reason: policy.description.clone().unwrap_or_else(|| {
                            format!("source matches deny rule {:?}", policy.pattern)
                        }),
                        matched_policy: Some(policy.label()),
                    },
                };
            }
        }
        PolicyDecision::Allowed {
            matched_policy: None,
        }
    }
}

/// Policy engine reading the current rule set from a repository on each evaluation.
#[derive(Clone)]
pub struct SourcePolicyEngine {
    repository: Arc<dyn PolicyRepository>,
}

impl SourcePolicyEngine {
    pub fn new(repository: Arc<dyn PolicyRepository>) -> Self {
        Self { repository }
    }

    /// Evaluate `url` against the active policies.
    pub fn evaluate(&self, url: &str) -> Result<PolicyDecision> {
        let policies = self.repository.active_by_priority()?;
        Ok(CompiledPolicySet::compile(&policies).evaluate(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: u64, priority: i32, direction: Direction, pattern: &str) -> SourcePolicy {
        SourcePolicy {
            id,
            ..SourcePolicy::new(pattern, direction, priority)
        }
    }

    #[test]
    fn priority_ordering_first_match_wins() {
        let set = CompiledPolicySet::compile(&[
            rule(2, 10, Direction::Allow, "example.com"),
            rule(1, 1, Direction::Deny, "*.ru"),
        ]);
        assert!(!set.evaluate("http://example.ru/x").is_allowed());
        assert!(set.evaluate("http://example.com/x").is_allowed());
    }

    #[test]
    fn lower_priority_deny_shadows_later_allow() {
        let set = CompiledPolicySet::compile(&[
            rule(1, 5, Direction::Deny, "downloads.example.com"),
            rule(2, 10, Direction::Allow, "example.com"),
        ]);
        assert!(!set.evaluate("https://downloads.example.com/a.exe").is_allowed());
        assert!(set.evaluate("https://www.example.com/a.exe").is_allowed());
    }

    #[test]
    fn wildcard_is_case_insensitive_substring() {
        let set = CompiledPolicySet::compile(&[rule(1, 1, Direction::Deny, "*crack*")]);
        assert!(!set.evaluate("https://warez.example/KeyCrack.exe").is_allowed());
        assert!(!set.evaluate("http://CRACKS.example/x").is_allowed());
        assert!(set.evaluate("https://vendor.example/setup.exe").is_allowed());
    }

    #[test]
    fn host_rule_matches_subdomains_only() {
        let set = CompiledPolicySet::compile(&[rule(1, 1, Direction::Deny, "github.com")]);
        assert!(!set.evaluate("https://github.com/org/repo").is_allowed());
        assert!(!set.evaluate("https://sub.github.com/x").is_allowed());
        assert!(set.evaluate("https://notgithub.com/x").is_allowed());
        assert!(set.evaluate("https://raw.githubusercontent.com/x").is_allowed());
    }

    #[test]
    fn wildcard_literal_dots_are_escaped() {
        let set = CompiledPolicySet::compile(&[rule(1, 1, Direction::Deny, "*.example.com")]);
        assert!(!set.evaluate("https://cdn.example.com/x").is_allowed());
        assert!(set.evaluate("https://cdnxexample.com/x").is_allowed());
    }

    #[test]
    fn slash_pattern_is_substring_match() {
        let set = CompiledPolicySet::compile(&[
            rule(1, 1, Direction::Allow, "example.com/approved/"),
            rule(2, 2, Direction::Deny, "*"),
        ]);
        assert!(set.evaluate("https://EXAMPLE.com/approved/tool.msi").is_allowed());
        assert!(!set.evaluate("https://example.com/other/tool.msi").is_allowed());
    }

    #[test]
    fn no_match_fails_open() {
        let set = CompiledPolicySet::compile(&[rule(1, 1, Direction::Deny, "evil.example")]);
        assert_eq!(
            set.evaluate("https://good.example/x"),
            PolicyDecision::Allowed {
                matched_policy: None
            }
        );
        assert!(CompiledPolicySet::compile(&[]).evaluate("https://x.example/a").is_allowed());
    }

    #[test]
    fn unsupported_scheme_denied_before_rules() {
        let set = CompiledPolicySet::compile(&[rule(1, 1, Direction::Allow, "*")]);
        let decision = set.evaluate("ftp://files.example.com/x");
        assert!(matches!(
            decision,
            PolicyDecision::Denied {
                matched_policy: None,
                ..
            }
        ));
    }

    #[test]
    fn local_and_unc_sources_are_evaluated() {
        let set = CompiledPolicySet::compile(&[rule(1, 1, Direction::Deny, "untrusted-share")]);
        assert!(!set.evaluate(r"\\untrusted-share\apps\x.msi").is_allowed());
        assert!(set.evaluate(r"\\fileserver\apps\x.msi").is_allowed());
        assert!(set.evaluate("/srv/installers/x.msi").is_allowed());
    }

    #[test]
    fn inactive_rules_are_ignored() {
        let mut deny = rule(1, 1, Direction::Deny, "example.com");
        deny.active = false;
        let set = CompiledPolicySet::compile(&[deny]);
        assert!(set.is_empty());
        assert!(set.evaluate("https://example.com/x").is_allowed());
    }

    #[test]
    fn denial_converts_to_source_denied_error() {
        let set = CompiledPolicySet::compile(&[rule(7, 1, Direction::Deny, "*.ru")]);
        let err = set
            .evaluate("http://example.ru/x")
            .into_result("http://example.ru/x")
            .expect_err("denied");
        assert_eq!(err.code(), "FDP-2002");
        assert!(err.is_security_failure());
        match err {
            DeployError::SourceDenied { policy, .. } => {
                assert!(policy.unwrap_or_default().contains("#7"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
