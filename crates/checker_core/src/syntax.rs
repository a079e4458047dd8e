//! RFC 5322 addr-spec validation.
//!
//! Checks grammar plus the practical length limits: local part up to 64
//! octets, total address up to 254, domain labels 1..=63. Domain literals
//! in the `[IPv4]` and `[IPv6:...]` forms are recognized.

use std::net::{Ipv4Addr, Ipv6Addr};

/// Maximum total address length.
pub const MAX_EMAIL_LEN: usize = 254;

/// Maximum local-part length.
pub const MAX_LOCAL_LEN: usize = 64;

/// Validate a full address. The input is expected to be already trimmed.
pub fn is_valid_email(email: &str) -> bool {
    if email.is_empty() || email.len() > MAX_EMAIL_LEN {
        return false;
    }

    let Some((local, domain)) = split_address(email) else {
        return false;
    };

    is_valid_local(local) && is_valid_domain(domain)
}

/// Split into local part and domain at the separating `@`. A quoted local
/// part may itself contain `@`, so the quoted form is scanned first.
pub fn split_address(email: &str) -> Option<(&str, &str)> {
    if let Some(rest) = email.strip_prefix('"') {
        // Find the closing quote, honoring backslash escapes.
        let mut escaped = false;
        for (i, c) in rest.char_indices() {
            match c {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => {
                    let local_end = i + 2; // opening quote + scanned prefix
                    let tail = &email[local_end..];
                    let domain = tail.strip_prefix('@')?;
                    return Some((&email[..local_end], domain));
                }
                _ => escaped = false,
            }
        }
        return None;
    }

    let at = email.find('@')?;
    let (local, rest) = email.split_at(at);
    let domain = &rest[1..];
    // A second unquoted @ is never valid.
    if domain.contains('@') {
        return None;
    }
    Some((local, domain))
}

fn is_atext(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#'
                | '$'
                | '%'
                | '&'
                | '\''
                | '*'
                | '+'
                | '-'
                | '/'
                | '='
                | '?'
                | '^'
                | '_'
                | '`'
                | '{'
                | '|'
                | '}'
                | '~'
        )
}

fn is_valid_local(local: &str) -> bool {
    if local.is_empty() || local.len() > MAX_LOCAL_LEN {
        return false;
    }

    if local.starts_with('"') && local.ends_with('"') && local.len() >= 2 {
        return is_valid_quoted_local(&local[1..local.len() - 1]);
    }

    // dot-atom: atext runs separated by single dots
    if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return false;
    }
    local.chars().all(|c| c == '.' || is_atext(c))
}

fn is_valid_quoted_local(inner: &str) -> bool {
    let mut escaped = false;
    for c in inner.chars() {
        if escaped {
            if !c.is_ascii() || c.is_ascii_control() {
                return false;
            }
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' || !c.is_ascii() || c.is_ascii_control() {
            return false;
        }
    }
    !escaped
}

/// Validate the domain side: either a dotted hostname or a domain literal.
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() {
        return false;
    }

    if let Some(literal) = domain.strip_prefix('[').and_then(|d| d.strip_suffix(']')) {
        return is_valid_domain_literal(literal);
    }

    // Hostname: labels 1..=63, alphanumeric with interior hyphens,
    // at least one dot.
    if !domain.contains('.') || domain.len() > 253 {
        return false;
    }
    domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

fn is_valid_domain_literal(literal: &str) -> bool {
    if let Some(v6) = literal.strip_prefix("IPv6:") {
        return v6.parse::<Ipv6Addr>().is_ok();
    }
    literal.parse::<Ipv4Addr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_common_addresses() {
        assert!(is_valid_email("alice@example.com"));
        assert!(is_valid_email("first.last@sub.example.co.uk"));
        assert!(is_valid_email("user+tag@example.com"));
        assert!(is_valid_email("o'brien@example.com"));
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(!is_valid_email(""));
        assert!(!is_valid_email("no-at-sign"));
        assert!(!is_valid_email("two@@example.com"));
        assert!(!is_valid_email("a@b@example.com"));
        assert!(!is_valid_email(".leading@example.com"));
        assert!(!is_valid_email("trailing.@example.com"));
        assert!(!is_valid_email("dou..ble@example.com"));
        assert!(!is_valid_email("spa ce@example.com"));
        assert!(!is_valid_email("user@"));
        assert!(!is_valid_email("@example.com"));
    }

    #[test]
    fn total_length_boundary() {
        // 254 characters total is accepted, 255 rejected.
        let exact = format!(
            "{}@{}.{}.{}.ru",
            "a".repeat(64),
            "b".repeat(61),
            "c".repeat(62),
            "d".repeat(61)
        );
        assert_eq!(exact.len(), 254);
        assert!(is_valid_email(&exact));

        let over = format!(
            "{}@{}.{}.{}.rux",
            "a".repeat(64),
            "b".repeat(61),
            "c".repeat(62),
            "d".repeat(61)
        );
        assert_eq!(over.len(), 255);
        assert!(!is_valid_email(&over));
    }

    #[test]
    fn local_part_length_boundary() {
        let ok = format!("{}@example.com", "a".repeat(64));
        assert!(is_valid_email(&ok));
        let too_long = format!("{}@example.com", "a".repeat(65));
        assert!(!is_valid_email(&too_long));
    }

    #[test]
    fn domain_label_rules() {
        assert!(is_valid_email(&format!("a@{}.com", "x".repeat(63))));
        assert!(!is_valid_email(&format!("a@{}.com", "x".repeat(64))));
        assert!(!is_valid_email("a@-bad.com"));
        assert!(!is_valid_email("a@bad-.com"));
        assert!(!is_valid_email("a@bad..com"));
        assert!(!is_valid_email("a@nodot"));
    }

    #[test]
    fn domain_literals() {
        assert!(is_valid_email("user@[192.168.1.1]"));
        assert!(is_valid_email("user@[IPv6:2001:db8::1]"));
        assert!(!is_valid_email("user@[999.1.1.1]"));
        assert!(!is_valid_email("user@[IPv6:not-an-ip]"));
        assert!(!is_valid_email("user@[192.168.1.1"));
    }

    #[test]
    fn quoted_local_parts() {
        assert!(is_valid_email("\"john doe\"@example.com"));
        assert!(is_valid_email("\"with@at\"@example.com"));
        assert!(is_valid_email("\"esc\\\"aped\"@example.com"));
        assert!(!is_valid_email("\"unterminated@example.com"));
    }
}
