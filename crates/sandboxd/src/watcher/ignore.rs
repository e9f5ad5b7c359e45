//! Ignore-pattern matching for file watchers.

use std::path::Path;

use glob::Pattern;

use super::WatcherError;

#[derive(Debug, Clone)]
struct Rule {
    raw: String,
    glob: Pattern,
    /// No glob metacharacters; also matches by substring.
    literal: bool,
}

/// Compiled set of ignore patterns.
///
/// A path is ignored when a pattern matches its file name or its full path.
/// Patterns without glob metacharacters (such as `node_modules`) also match
/// any path containing them.
#[derive(Debug, Clone, Default)]
pub struct IgnoreMatcher {
    rules: Vec<Rule>,
}

impl IgnoreMatcher {
    /// Compiles `patterns`, rejecting any that are not valid globs.
    pub fn new(patterns: &[String]) -> Result<Self, WatcherError> {
        let rules = patterns
            .iter()
            .filter(|p| !p.trim().is_empty())
            .map(|raw| {
                let glob = Pattern::new(raw).map_err(|e| WatcherError::InvalidPattern {
                    pattern: raw.clone(),
                    reason: e.msg.to_string(),
                })?;
                Ok(Rule {
                    raw: raw.clone(),
                    glob,
                    literal: !raw.contains(['*', '?', '[']),
                })
            })
            .collect::<Result<Vec<_>, WatcherError>>()?;

        Ok(Self { rules })
    }

    /// Returns true if no patterns are configured.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns whether `path` matches any pattern.
    pub fn is_ignored(&self, path: &Path) -> bool {
        if self.rules.is_empty() {
            return false;
        }

        let full = path.to_string_lossy();
        let base = path
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_default();

        self.rules.iter().any(|rule| {
            rule.glob.matches(&base)
                || rule.glob.matches(&full)
                || (rule.literal && full.contains(rule.raw.as_str()))
        })
    }
}
