//! Disposable domain detection.
//!
//! Matches a domain against an exact set and a list of `*.suffix` wildcard
//! patterns loaded once at startup. The list loader lives outside the
//! engine; this module only consumes the parsed lists.

use serde::Deserialize;
use std::collections::HashSet;
use tracing::info;

use crate::Result;

/// Capability consumed by the validator pipeline.
pub trait DisposableOracle: Send + Sync {
    fn is_disposable(&self, domain: &str) -> bool;
}

/// Exact + wildcard-suffix domain list.
#[derive(Default)]
pub struct DomainList {
    exact: HashSet<String>,
    wildcards: Vec<String>,
}

impl DomainList {
    pub fn new(exact: Vec<String>, wildcards: Vec<String>) -> Self {
        let exact: HashSet<String> = exact.into_iter().map(|d| d.to_lowercase()).collect();
        info!(
            exact = exact.len(),
            wildcards = wildcards.len(),
            "disposable domain list initialized"
        );
        Self { exact, wildcards }
    }

    /// Parse the two JSON arrays (exact index + wildcard patterns) the
    /// public disposable-domain datasets publish.
    pub fn from_json(index: &str, wildcard: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct Domains(Vec<String>);

        let Domains(exact) = serde_json::from_str(index)?;
        let Domains(wildcards) = serde_json::from_str(wildcard)?;
        Ok(Self::new(exact, wildcards))
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcards.is_empty()
    }
}

impl DisposableOracle for DomainList {
    fn is_disposable(&self, domain: &str) -> bool {
        if self.is_empty() {
            return false;
        }

        let domain = domain.to_lowercase();
        if self.exact.contains(&domain) {
            return true;
        }

        self.wildcards.iter().any(|pattern| {
            pattern
                .strip_prefix("*.")
                .is_some_and(|suffix| domain.ends_with(&suffix.to_lowercase()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oracle() -> DomainList {
        DomainList::new(
            vec!["mailinator.com".into(), "TempMail.org".into()],
            vec!["*.10minutemail.com".into()],
        )
    }

    #[test]
    fn exact_match() {
        assert!(oracle().is_disposable("mailinator.com"));
        assert!(!oracle().is_disposable("gmail.com"));
    }

    #[test]
    fn match_is_case_insensitive() {
        let oracle = oracle();
        assert!(oracle.is_disposable("MAILINATOR.COM"));
        assert!(oracle.is_disposable("tempmail.org"));
    }

    #[test]
    fn wildcard_suffix_match() {
        let oracle = oracle();
        assert!(oracle.is_disposable("mail.10minutemail.com"));
        assert!(oracle.is_disposable("10minutemail.com"));
        assert!(!oracle.is_disposable("10minutemail.net"));
    }

    #[test]
    fn empty_list_never_matches() {
        let oracle = DomainList::default();
        assert!(!oracle.is_disposable("mailinator.com"));
    }

    #[test]
    fn parses_json_lists() {
        let oracle = DomainList::from_json(
            r#"["trash-mail.com", "discard.email"]"#,
            r#"["*.spam.la"]"#,
        )
        .unwrap();
        assert_eq!(oracle.len(), 3);
        assert!(oracle.is_disposable("discard.email"));
        assert!(oracle.is_disposable("mx.spam.la"));
    }
}
