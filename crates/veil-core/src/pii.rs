//! PII kinds, detection patterns, and token formatting.
//!
//! A [`Pattern`] pairs a compiled regex with the kind of PII it detects and a
//! base confidence score. Patterns are compiled once at startup and are
//! read-only afterwards. Ordering matters: the pattern table is scanned in
//! declaration order, so earlier patterns win for overlapping spans, and the
//! IPv6 alternation is listed longest-first so greedy matching captures the
//! complete address.

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Kinds of personally identifiable information the detector recognizes.
///
/// This is a closed set: the sidecar may only report kinds listed here, and
/// unknown kind strings in sidecar responses are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PiiKind {
    Email,
    Phone,
    Ssn,
    CreditCard,
    IpAddress,
    ApiKey,
    Name,
    Address,
    Medical,
    Salary,
    Company,
    JobTitle,
}

/// All PII kinds, for iteration in tests and diagnostics.
pub const ALL_KINDS: &[PiiKind] = &[
    PiiKind::Email,
    PiiKind::Phone,
    PiiKind::Ssn,
    PiiKind::CreditCard,
    PiiKind::IpAddress,
    PiiKind::ApiKey,
    PiiKind::Name,
    PiiKind::Address,
    PiiKind::Medical,
    PiiKind::Salary,
    PiiKind::Company,
    PiiKind::JobTitle,
];

impl PiiKind {
    /// The wire name used by the sidecar protocol (camelCase).
    pub fn as_wire(self) -> &'static str {
        match self {
            PiiKind::Email => "email",
            PiiKind::Phone => "phone",
            PiiKind::Ssn => "ssn",
            PiiKind::CreditCard => "creditCard",
            PiiKind::IpAddress => "ipAddress",
            PiiKind::ApiKey => "apiKey",
            PiiKind::Name => "name",
            PiiKind::Address => "address",
            PiiKind::Medical => "medical",
            PiiKind::Salary => "salary",
            PiiKind::Company => "company",
            PiiKind::JobTitle => "jobTitle",
        }
    }

    /// Parses a sidecar wire name. Unknown names return `None`.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "email" => Some(PiiKind::Email),
            "phone" => Some(PiiKind::Phone),
            "ssn" => Some(PiiKind::Ssn),
            "creditCard" => Some(PiiKind::CreditCard),
            "ipAddress" => Some(PiiKind::IpAddress),
            "apiKey" => Some(PiiKind::ApiKey),
            "name" => Some(PiiKind::Name),
            "address" => Some(PiiKind::Address),
            "medical" => Some(PiiKind::Medical),
            "salary" => Some(PiiKind::Salary),
            "company" => Some(PiiKind::Company),
            "jobTitle" => Some(PiiKind::JobTitle),
            _ => None,
        }
    }

    /// The uppercase name embedded in tokens, e.g. `CREDITCARD`.
    pub fn token_name(self) -> &'static str {
        match self {
            PiiKind::Email => "EMAIL",
            PiiKind::Phone => "PHONE",
            PiiKind::Ssn => "SSN",
            PiiKind::CreditCard => "CREDITCARD",
            PiiKind::IpAddress => "IPADDRESS",
            PiiKind::ApiKey => "APIKEY",
            PiiKind::Name => "NAME",
            PiiKind::Address => "ADDRESS",
            PiiKind::Medical => "MEDICAL",
            PiiKind::Salary => "SALARY",
            PiiKind::Company => "COMPANY",
            PiiKind::JobTitle => "JOBTITLE",
        }
    }
}

impl std::fmt::Display for PiiKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// A compiled detection pattern with its kind and base confidence.
///
/// Confidence reflects how specifically the regex identifies the target PII
/// kind: high scores mean low false-positive risk; low scores indicate
/// ambiguous patterns where sidecar verification adds meaningful value.
pub struct Pattern {
    pub regex: Regex,
    pub kind: PiiKind,
    pub confidence: f64,
}

/// Compiles the built-in pattern table.
///
/// A pattern that fails to compile is a configuration error and aborts
/// startup; the table is static, so a failure here is a build defect, not a
/// runtime condition to degrade around.
pub fn compile_patterns() -> Result<Vec<Pattern>> {
    // Confidence scores follow Presidio / CHPDA conventions:
    //   0.90+      highly specific format, very low false-positive rate
    //   0.70-0.89  moderately specific, some ambiguity possible
    //   below 0.70 broad pattern with meaningful false-positive risk
    let specs: &[(&str, PiiKind, f64)] = &[
        // Email: unambiguous structural markers (@, domain, TLD)
        (
            r"\b[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}\b",
            PiiKind::Email,
            0.95,
        ),
        // API key: requires keyword prefix + long token
        (
            r#"(?i)(?:api[_\-]?key|token|secret|bearer)[\s"':=]+([a-zA-Z0-9_\-.]{20,})"#,
            PiiKind::ApiKey,
            0.90,
        ),
        // SSN: structured hyphenated format
        (
            r"\b(?:\d{3}-?\d{2}-?\d{4}|\d{9})\b",
            PiiKind::Ssn,
            0.85,
        ),
        // Credit card: 16-digit block pattern
        (
            r"\b(?:\d{4}[\-\s]?){3}\d{4}\b",
            PiiKind::CreditCard,
            0.85,
        ),
        // Street address: requires street-type suffix keyword
        (
            r"(?i)\d+\s+[A-Za-z\s]+(?:Street|St|Avenue|Ave|Road|Rd|Boulevard|Blvd|Lane|Ln|Drive|Dr|Court|Ct)\b",
            PiiKind::Address,
            0.75,
        ),
        // IPv6: all RFC 5952 compressed and uncompressed forms. The
        // alternation is ordered longest-first so greedy matching picks the
        // most complete address. Colon-hex syntax never appears in prose, so
        // confidence is high.
        (
            concat!(
                r"(?:[0-9a-fA-F]{1,4}:){7}[0-9a-fA-F]{1,4}",
                r"|(?:[0-9a-fA-F]{1,4}:){1,7}:",
                r"|(?:[0-9a-fA-F]{1,4}:){1,6}:[0-9a-fA-F]{1,4}",
                r"|(?:[0-9a-fA-F]{1,4}:){1,5}(?::[0-9a-fA-F]{1,4}){1,2}",
                r"|(?:[0-9a-fA-F]{1,4}:){1,4}(?::[0-9a-fA-F]{1,4}){1,3}",
                r"|(?:[0-9a-fA-F]{1,4}:){1,3}(?::[0-9a-fA-F]{1,4}){1,4}",
                r"|(?:[0-9a-fA-F]{1,4}:){1,2}(?::[0-9a-fA-F]{1,4}){1,5}",
                r"|[0-9a-fA-F]{1,4}:(?::[0-9a-fA-F]{1,4}){1,6}",
                r"|:(?::[0-9a-fA-F]{1,4}){1,7}",
                r"|::",
            ),
            PiiKind::IpAddress,
            0.85,
        ),
        // IPv4: matches version numbers and other numeric quads
        (
            r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b",
            PiiKind::IpAddress,
            0.70,
        ),
        // Phone: very broad; matches many numeric sequences that are not
        // phone numbers. The low confidence routes every match through the
        // cache/sidecar path.
        (
            r"(\+?1?[\-.\s]?)?\(?([0-9]{3})\)?[\-.\s]?([0-9]{3})[\-.\s]?([0-9]{4})",
            PiiKind::Phone,
            0.65,
        ),
        // ZIP code: 5 digits match countless non-PII numbers
        (r"\b\d{5}(?:-\d{4})?\b", PiiKind::Address, 0.40),
    ];

    let mut patterns = Vec::with_capacity(specs.len());
    for (expr, kind, confidence) in specs {
        patterns.push(Pattern {
            regex: Regex::new(expr)?,
            kind: *kind,
            confidence: *confidence,
        });
    }
    Ok(patterns)
}

/// Generates the deterministic anonymization token for a detected value.
///
/// Tokens use `[PII_<KIND>_<8hex>]` notation, e.g. `[PII_EMAIL_c160f8cc]`.
/// The suffix is the first 8 hex characters of a SHA-256 digest of the
/// original value, so the same value always yields the same token regardless
/// of which request it appears in.
///
/// Including the kind gives the LLM semantic context ("this was an email")
/// without ever exposing the original value.
///
/// Invariant: no token may match any compiled pattern, or the proxy will
/// re-tokenize its own output on later passes. The underscore separators are
/// load-bearing here: they deny the digit-run patterns the word boundaries
/// they need. `token_never_retriggers_any_pattern` enforces this for every
/// kind.
pub fn token(kind: PiiKind, original: &str) -> String {
    let digest = Sha256::digest(original.as_bytes());
    let mut hex = String::with_capacity(8);
    for byte in digest.iter().take(4) {
        use std::fmt::Write;
        let _ = write!(hex, "{:02x}", byte);
    }
    format!("[PII_{}_{}]", kind.token_name(), hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_format() {
        let t = token(PiiKind::Email, "alice@example.com");
        assert!(t.starts_with("[PII_EMAIL_"));
        assert!(t.ends_with(']'));
        // [PII_EMAIL_ + 8 hex + ]
        assert_eq!(t.len(), "[PII_EMAIL_]".len() + 8);
        let hex = &t["[PII_EMAIL_".len()..t.len() - 1];
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn token_is_deterministic() {
        assert_eq!(
            token(PiiKind::Phone, "555-867-5309"),
            token(PiiKind::Phone, "555-867-5309")
        );
        assert_ne!(
            token(PiiKind::Phone, "555-867-5309"),
            token(PiiKind::Phone, "555-867-5310")
        );
    }

    #[test]
    fn patterns_compile() {
        let patterns = compile_patterns().unwrap();
        assert_eq!(patterns.len(), 9);
    }

    #[test]
    fn patterns_are_ordered_email_first_zip_last() {
        let patterns = compile_patterns().unwrap();
        assert_eq!(patterns[0].kind, PiiKind::Email);
        assert!((patterns[0].confidence - 0.95).abs() < f64::EPSILON);
        let last = patterns.last().unwrap();
        assert_eq!(last.kind, PiiKind::Address);
        assert!((last.confidence - 0.40).abs() < f64::EPSILON);
    }

    #[test]
    fn email_pattern_matches() {
        let patterns = compile_patterns().unwrap();
        assert!(patterns[0].regex.is_match("contact alice@example.com now"));
        assert!(!patterns[0].regex.is_match("no email here"));
    }

    #[test]
    fn ipv6_greedy_matches_full_address() {
        let patterns = compile_patterns().unwrap();
        let ipv6 = patterns
            .iter()
            .find(|p| p.kind == PiiKind::IpAddress && p.confidence > 0.80)
            .unwrap();
        let m = ipv6
            .regex
            .find("peer at 2001:0db8:85a3:0000:0000:8a2e:0370:7334 responded")
            .unwrap();
        assert_eq!(m.as_str(), "2001:0db8:85a3:0000:0000:8a2e:0370:7334");

        let m = ipv6.regex.find("fe80::1 is link local").unwrap();
        assert_eq!(m.as_str(), "fe80::1");
    }

    /// No produced token may match any compiled pattern ("the proxy eats
    /// itself" failure mode).
    #[test]
    fn token_never_retriggers_any_pattern() {
        let patterns = compile_patterns().unwrap();
        let samples = [
            "alice@example.com",
            "555-867-5309",
            "123-45-6789",
            "4111 1111 1111 1111",
            "192.168.1.20",
            "sk-verylongapikeyvalue1234567890",
            "John Smith",
            "742 Evergreen Terrace",
            "type 2 diabetes",
            "$120,000",
            "Acme Corp",
            "Staff Engineer",
        ];
        for kind in ALL_KINDS {
            for sample in &samples {
                let t = token(*kind, sample);
                for p in &patterns {
                    assert!(
                        !p.regex.is_match(&t),
                        "token {} for kind {} re-matches pattern {}",
                        t,
                        kind,
                        p.regex.as_str()
                    );
                }
            }
        }
    }

    #[test]
    fn wire_names_round_trip() {
        for kind in ALL_KINDS {
            assert_eq!(PiiKind::from_wire(kind.as_wire()), Some(*kind));
        }
        assert_eq!(PiiKind::from_wire("creditCard"), Some(PiiKind::CreditCard));
        assert_eq!(PiiKind::from_wire("passport"), None);
    }
}
