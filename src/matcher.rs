use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Domain matcher over an ABP-syntax rule list (the GFWList format).
///
/// `matches` returns `Some(true)` for listed names, `Some(false)` for
/// names covered by an `@@` exclusion, and `None` when the list has no
/// opinion.
#[derive(Debug, Default)]
pub struct DomainMatcher {
    listed: HashSet<String>,
    excluded: HashSet<String>,
}

impl DomainMatcher {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load a rule list from disk. Published GFWList files are
    /// base64-encoded as a whole; that form is detected and decoded
    /// before parsing.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read rule list {}", path.display()))?;
        Ok(Self::parse(&decode_if_base64(raw)))
    }

    pub fn parse(text: &str) -> Self {
        let mut matcher = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('!') || line.starts_with('[') {
                continue;
            }
            let (rule, excluded) = match line.strip_prefix("@@") {
                Some(rest) => (rest, true),
                None => (line, false),
            };
            if let Some(domain) = extract_domain(rule) {
                if excluded {
                    matcher.excluded.insert(domain);
                } else {
                    matcher.listed.insert(domain);
                }
            }
        }
        matcher
    }

    /// Suffix match, most specific label first; exclusions win at every
    /// level.
    pub fn matches(&self, name: &str) -> Option<bool> {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        let mut search = name.as_str();
        loop {
            if self.excluded.contains(search) {
                return Some(false);
            }
            if self.listed.contains(search) {
                return Some(true);
            }
            match search.find('.') {
                Some(dot) => search = &search[dot + 1..],
                None => break,
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.listed.is_empty() && self.excluded.is_empty()
    }
}

/// The dot in domain rules keeps plain text out of the base64 alphabet,
/// so a successful whole-file decode is unambiguous.
fn decode_if_base64(raw: String) -> String {
    let compact: String = raw.split_whitespace().collect();
    match BASE64.decode(compact.as_bytes()) {
        Ok(decoded) => String::from_utf8(decoded).unwrap_or(raw),
        Err(_) => raw,
    }
}

/// Reduce one ABP rule to the domain it anchors on, or nothing for rule
/// forms that do not name a whole domain (regexes, path patterns,
/// wildcards inside the host).
fn extract_domain(rule: &str) -> Option<String> {
    if rule.starts_with('/') {
        return None;
    }
    let rule = rule.strip_prefix("||").unwrap_or(rule);
    let rule = rule.strip_prefix('|').unwrap_or(rule);
    let rule = rule
        .strip_prefix("https://")
        .or_else(|| rule.strip_prefix("http://"))
        .unwrap_or(rule);

    let host = rule.split('/').next().unwrap_or("");
    let host = host.trim_start_matches('.').trim_end_matches('.');
    if host.is_empty() || host.contains('*') || host.contains(':') {
        return None;
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
    {
        return None;
    }
    Some(host.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = "\
[AutoProxy 0.2.9]
! a comment
||blocked.test
|http://prefixed.test/path
plain.test
@@||allowed.blocked.test
/regex-rules-are-ignored/
*.wildcards.ignored
";

    #[test]
    fn listed_domains_match_with_subdomains() {
        let matcher = DomainMatcher::parse(SAMPLE);
        assert_eq!(matcher.matches("blocked.test"), Some(true));
        assert_eq!(matcher.matches("sub.blocked.test."), Some(true));
        assert_eq!(matcher.matches("prefixed.test"), Some(true));
        assert_eq!(matcher.matches("plain.test"), Some(true));
    }

    #[test]
    fn exclusions_override_listing() {
        let matcher = DomainMatcher::parse(SAMPLE);
        assert_eq!(matcher.matches("allowed.blocked.test"), Some(false));
        assert_eq!(matcher.matches("deep.allowed.blocked.test"), Some(false));
        // sibling subdomains stay listed
        assert_eq!(matcher.matches("other.blocked.test"), Some(true));
    }

    #[test]
    fn unknown_names_yield_no_verdict() {
        let matcher = DomainMatcher::parse(SAMPLE);
        assert_eq!(matcher.matches("unrelated.test"), None);
        assert_eq!(matcher.matches("test"), None);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let matcher = DomainMatcher::parse("||Blocked.Test");
        assert_eq!(matcher.matches("SUB.BLOCKED.TEST."), Some(true));
    }

    #[test]
    fn regex_and_wildcard_rules_are_skipped() {
        let matcher = DomainMatcher::parse("/^https?:/\n*.cdn.test\n");
        assert!(matcher.is_empty());
    }

    #[test]
    fn base64_encoded_file_is_decoded() {
        let encoded = BASE64.encode(SAMPLE);
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(encoded.as_bytes()).unwrap();

        let matcher = DomainMatcher::from_file(file.path()).unwrap();
        assert_eq!(matcher.matches("blocked.test"), Some(true));
        assert_eq!(matcher.matches("allowed.blocked.test"), Some(false));
    }

    #[test]
    fn plain_file_is_parsed_as_is() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let matcher = DomainMatcher::from_file(file.path()).unwrap();
        assert_eq!(matcher.matches("plain.test"), Some(true));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(DomainMatcher::from_file("/nonexistent/gfwlist.txt").is_err());
    }
}
