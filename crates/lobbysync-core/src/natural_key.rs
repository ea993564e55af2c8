//! Natural-key resolution for snapshot records.
//!
//! Registration codes are used verbatim once they pass format validation.
//! Records without an upstream identifier get a content key: an ordered list of
//! normalized fields folded through SHA-256. The fold state starts as 32 zero
//! bytes and each field replaces it with `sha256(state || utf8(field))`. A
//! multi-valued field is folded as a single field: the parts of every item are
//! joined with U+0001, the items are sorted and de-duplicated, then joined with
//! U+0000. The key is the lowercase hex of the final state.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{MeetingDetails, NaturalKey};

/// Sentinel key for counterparties without a valid registration code.
pub const UNREGISTERED: &str = "unregistered";
pub const PART_SEPARATOR: char = '\u{1}';
pub const ITEM_SEPARATOR: char = '\u{0}';

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationCode {
    Registered(String),
    Unregistered,
}

impl RegistrationCode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Registered(code) => code,
            Self::Unregistered => UNREGISTERED,
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(self, Self::Registered(_))
    }
}

/// Map a raw registration code to its natural key, falling back to the
/// `unregistered` sentinel for absent or malformed codes.
pub fn resolve_registration_code(raw: Option<&str>) -> RegistrationCode {
    match raw.map(str::trim) {
        Some(code) if is_valid_registration_code(code) => {
            RegistrationCode::Registered(code.to_string())
        }
        _ => RegistrationCode::Unregistered,
    }
}

/// `^[0-9]{9,12}-[0-9]{2}$`
pub fn is_valid_registration_code(code: &str) -> bool {
    let Some((digits, suffix)) = code.split_once('-') else {
        return false;
    };
    (9..=12).contains(&digits.len())
        && digits.bytes().all(|b| b.is_ascii_digit())
        && suffix.len() == 2
        && suffix.bytes().all(|b| b.is_ascii_digit())
}

/// Decode HTML character references (`&amp;`, `&#233;`, `&#xE9;`, ...).
/// Unknown or unterminated references are kept as-is.
pub fn unescape_entities(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let decoded = tail
            .find(';')
            .filter(|end| *end <= 10)
            .and_then(|end| decode_entity(&tail[1..end]).map(|ch| (ch, end)));
        match decoded {
            Some((ch, end)) => {
                out.push(ch);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let num = name.strip_prefix('#')?;
            let code = match num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => num.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

/// Unescape, trim and collapse internal whitespace.
pub fn normalize_text(input: &str) -> String {
    unescape_entities(input)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized, case-folded form used for hashing and discriminators.
pub fn fold_key(input: &str) -> String {
    normalize_text(input).to_lowercase()
}

#[derive(Debug, Clone, Default)]
pub struct ContentDigest {
    state: [u8; 32],
}

impl ContentDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(self, value: &str) -> Self {
        self.absorb(fold_key(value).as_bytes())
    }

    pub fn list(self, items: &[Vec<String>]) -> Self {
        let folded = items
            .iter()
            .map(|parts| {
                parts
                    .iter()
                    .map(|part| fold_key(part))
                    .collect::<Vec<_>>()
                    .join(&PART_SEPARATOR.to_string())
            })
            .collect::<BTreeSet<_>>();
        let joined = folded
            .into_iter()
            .collect::<Vec<_>>()
            .join(&ITEM_SEPARATOR.to_string());
        self.absorb(joined.as_bytes())
    }

    pub fn finish(self) -> NaturalKey {
        NaturalKey::new(hex::encode(self.state))
    }

    fn absorb(mut self, bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(self.state);
        hasher.update(bytes);
        self.state.copy_from_slice(&hasher.finalize());
        self
    }
}

/// Content key of a meeting: host, date, location, participants, subject,
/// organisation, in that order.
pub fn meeting_key(details: &MeetingDetails, participants: &[crate::Counterparty]) -> NaturalKey {
    let items = participants
        .iter()
        .map(|p| vec![p.name.clone(), p.code.as_str().to_string()])
        .collect::<Vec<_>>();
    ContentDigest::new()
        .field(&details.host)
        .field(&details.date.format("%Y-%m-%d").to_string())
        .field(&details.location)
        .list(&items)
        .field(&details.subject)
        .field(&details.organisation)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Counterparty;
    use chrono::NaiveDate;

    fn details() -> MeetingDetails {
        MeetingDetails {
            host: "Commissioner Jonathan Hill".into(),
            organisation: "Financial Markets".into(),
            date: NaiveDate::from_ymd_opt(2015, 3, 12).unwrap(),
            location: "Brussels".into(),
            subject: "Capital Markets Union".into(),
            cancelled: false,
        }
    }

    fn party(name: &str, code: &str) -> Counterparty {
        Counterparty {
            name: name.into(),
            code: resolve_registration_code(Some(code)),
        }
    }

    #[test]
    fn registration_codes_are_validated() {
        assert!(is_valid_registration_code("123456789-01"));
        assert!(is_valid_registration_code("123456789012-99"));
        assert!(!is_valid_registration_code("12345678-01"));
        assert!(!is_valid_registration_code("1234567890123-01"));
        assert!(!is_valid_registration_code("123456789-1"));
        assert!(!is_valid_registration_code("123456789-01x"));
        assert_eq!(
            resolve_registration_code(Some(" 123456789-01 ")),
            RegistrationCode::Registered("123456789-01".into())
        );
        assert_eq!(resolve_registration_code(Some("n/a")), RegistrationCode::Unregistered);
        assert_eq!(resolve_registration_code(None).as_str(), UNREGISTERED);
    }

    #[test]
    fn entities_are_unescaped() {
        assert_eq!(unescape_entities("AT&amp;T"), "AT&T");
        assert_eq!(unescape_entities("Caf&#233; &#xE9;t&eacute;"), "Café ét&eacute;");
        assert_eq!(unescape_entities("fish & chips"), "fish & chips");
        assert_eq!(normalize_text("  Foo&nbsp;\n Corp\t"), "Foo Corp");
    }

    #[test]
    fn empty_fold_is_the_zero_seed() {
        assert_eq!(ContentDigest::new().finish().as_str(), "0".repeat(64));
    }

    #[test]
    fn incidental_formatting_does_not_change_the_key() {
        let participants = vec![party("Foo Corp", "123456789-01"), party("Bar SA", "unregistered")];
        let base = meeting_key(&details(), &participants);

        let mut noisy = details();
        noisy.host = "  commissioner   Jonathan&#32;HILL ".into();
        noisy.location = "BRUSSELS\n".into();
        let reordered = vec![party("bar  sa", "x"), party("Foo&nbsp;Corp", "123456789-01")];
        assert_eq!(meeting_key(&noisy, &reordered), base);
    }

    #[test]
    fn semantic_changes_change_the_key() {
        let participants = vec![party("Foo Corp", "123456789-01")];
        let base = meeting_key(&details(), &participants);

        let mut changed = details();
        changed.subject = "Banking Union".into();
        assert_ne!(meeting_key(&changed, &participants), base);

        let mut changed = details();
        changed.date = NaiveDate::from_ymd_opt(2015, 3, 13).unwrap();
        assert_ne!(meeting_key(&changed, &participants), base);

        let mut changed = details();
        changed.organisation = "Trade".into();
        assert_ne!(meeting_key(&changed, &participants), base);

        let more = vec![party("Foo Corp", "123456789-01"), party("Baz", "unregistered")];
        assert_ne!(meeting_key(&details(), &more), base);

        let recoded = vec![party("Foo Corp", "987654321-01")];
        assert_ne!(meeting_key(&details(), &recoded), base);
    }

    #[test]
    fn cancellation_is_not_part_of_identity() {
        let participants = vec![party("Foo Corp", "123456789-01")];
        let mut cancelled = details();
        cancelled.cancelled = true;
        assert_eq!(
            meeting_key(&cancelled, &participants),
            meeting_key(&details(), &participants)
        );
    }

    #[test]
    fn field_boundaries_are_significant() {
        let a = ContentDigest::new().field("ab").field("c").finish();
        let b = ContentDigest::new().field("a").field("bc").finish();
        assert_ne!(a, b);
    }
}
