//! Tender-id canonicalization and closing-date normalization.
//!
//! Portals publish two kinds of identifiers: local serials ("1", "138") that
//! are unstable across listings, and NIC canonical ids like
//! `2026_DCKUL_128804_1` that survive re-listing. Everything downstream
//! (dedup, reconciliation, cancellation marking) keys on the canonical form
//! produced here.

use once_cell::sync::Lazy;
use regex::Regex;

/// Scraping skill resolved per portal. NIC-family portals share one table
/// layout and id grammar; anything else goes through the generic path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalSkill {
    Nic,
    Generic,
}

/// Substrings that identify a NIC-family portal in its name or URLs.
const NIC_INDICATORS: &[&str] = &[
    "eprocure",
    "tenders.gov.in",
    "nic.in",
    "tendershimachal",
    "etenders",
];

static ID_PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(tender\s*id|tenderid|id)\s*[:#\-]?\s*").expect("id prefix regex")
});
static ID_SEPARATOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\s\-\./]+").expect("id separator regex"));
static UNDERSCORE_RUN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_+").expect("underscore run regex"));
static NIC_BRACKET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\[(\d{4}_[A-Z0-9_]+(?:_\d+)?)\]").expect("nic bracket regex")
});
static BRACKET_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]+)\]").expect("bracket token regex"));
static NIC_BARE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d{4}_[A-Z0-9_]+(?:_\d+)?)").expect("nic bare regex"));
static CANONICAL_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z0-9_]{5,}$").expect("canonical id regex"));
static WHITESPACE_RUN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("whitespace run regex"));

/// Resolve the scraping skill from portal metadata. Matching is substring
/// based over the lowercased name and URLs.
#[must_use]
pub fn resolve_portal_skill(name: &str, base_url: &str, org_list_url: &str) -> PortalSkill {
    let combined = format!(
        "{} {} {}",
        name.trim().to_lowercase(),
        base_url.trim().to_lowercase(),
        org_list_url.trim().to_lowercase()
    );
    if NIC_INDICATORS.iter().any(|token| combined.contains(token)) {
        PortalSkill::Nic
    } else {
        PortalSkill::Generic
    }
}

/// Normalize a raw tender id for reliable matching when portal formatting
/// varies. Idempotent: applying twice yields the same result.
///
/// Steps: strip a leading `Tender ID:` / `ID:` label, unwrap a single
/// `[...]` wrapper, uppercase, fold runs of whitespace / `-` / `.` / `/`
/// into `_`, collapse `_` runs, trim `_`.
#[must_use]
pub fn normalize_tender_id(value: &str) -> String {
    let mut text = value.trim().to_string();
    if text.is_empty() {
        return String::new();
    }

    text = ID_PREFIX_RE.replace(&text, "").to_string();
    if text.len() > 2 && text.starts_with('[') && text.ends_with(']') {
        text = text[1..text.len() - 1].to_string();
    }

    let upper = text.to_uppercase();
    let joined = ID_SEPARATOR_RE.replace_all(upper.trim(), "_");
    let collapsed = UNDERSCORE_RUN_RE.replace_all(&joined, "_");
    collapsed.trim_matches('_').to_string()
}

/// Normalize closing-date text for stable comparisons. Idempotent.
#[must_use]
pub fn normalize_closing_date(value: &str) -> String {
    let text = value.trim().to_uppercase();
    if text.is_empty() {
        return String::new();
    }
    let swapped = text.replace(['-', '.'], "/");
    WHITESPACE_RUN_RE
        .replace_all(&swapped, " ")
        .trim()
        .to_string()
}

/// True iff the id satisfies the canonical invariant: uppercase
/// `[A-Z0-9_]`, length at least 5.
#[must_use]
pub fn is_valid_canonical_id(value: &str) -> bool {
    CANONICAL_ID_RE.is_match(value)
}

/// Canonical tender-id extraction from a title/reference cell.
///
/// Preference order:
/// 1. The first bracketed NIC token, e.g. `[2026_DCKUL_128804_1]`. Local
///    refs and serial tokens in other brackets are ignored when one exists.
/// 2. Otherwise, scanning bracket tokens right to left, the first that
///    normalizes to a valid canonical id.
/// 3. Otherwise, the rightmost bare NIC-shaped substring anywhere in the
///    title.
///
/// Returns an empty string when nothing qualifies; the caller drops the row
/// and logs a diagnostic.
#[must_use]
pub fn extract_tender_id_from_title(title_text: &str) -> String {
    let text = title_text.trim();
    if text.is_empty() {
        return String::new();
    }

    if let Some(caps) = NIC_BRACKET_RE.captures(text) {
        let candidate = normalize_tender_id(&caps[1]);
        if is_valid_canonical_id(&candidate) {
            return candidate;
        }
    }

    let bracket_tokens: Vec<&str> = BRACKET_TOKEN_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    for token in bracket_tokens.iter().rev() {
        let candidate = normalize_tender_id(token);
        if is_valid_canonical_id(&candidate) {
            return candidate;
        }
    }

    if let Some(caps) = NIC_BARE_RE
        .captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1))
    {
        let candidate = normalize_tender_id(caps.as_str());
        if is_valid_canonical_id(&candidate) {
            return candidate;
        }
    }

    String::new()
}

/// Skill-aware extraction entry point. Generic portals may layer a supplied
/// pattern on top of this; the result must still satisfy the canonical-id
/// invariant either way.
#[must_use]
pub fn extract_tender_id_by_skill(title_text: &str, skill: PortalSkill) -> String {
    match skill {
        PortalSkill::Nic | PortalSkill::Generic => extract_tender_id_from_title(title_text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_tender_id_basic() {
        assert_eq!(normalize_tender_id("2026_DCKUL_128804_1"), "2026_DCKUL_128804_1");
        assert_eq!(normalize_tender_id("  tender id: 2026_hp_1001_1 "), "2026_HP_1001_1");
        assert_eq!(normalize_tender_id("[2026_HP_1001_1]"), "2026_HP_1001_1");
        assert_eq!(normalize_tender_id("2026-HP.1001/1"), "2026_HP_1001_1");
        assert_eq!(normalize_tender_id("ID# 2026  HP   1001"), "2026_HP_1001");
        assert_eq!(normalize_tender_id(""), "");
    }

    #[test]
    fn test_normalize_tender_id_idempotent() {
        for raw in ["tender id: [2026_dckul_128804_1]", "2026-HP.1001/1", "__A_B__"] {
            let once = normalize_tender_id(raw);
            assert_eq!(normalize_tender_id(&once), once);
        }
    }

    #[test]
    fn test_normalize_closing_date() {
        assert_eq!(normalize_closing_date("31-12-2026  15:00"), "31/12/2026 15:00");
        assert_eq!(normalize_closing_date("05.01.2027 15:00"), "05/01/2027 15:00");
        assert_eq!(normalize_closing_date("  31/12/2026 15:00 "), "31/12/2026 15:00");
        assert_eq!(normalize_closing_date(""), "");
        let once = normalize_closing_date("31-12-2026  15:00");
        assert_eq!(normalize_closing_date(&once), once);
    }

    #[test]
    fn test_extract_prefers_first_nic_bracket() {
        let title = "Road works [REF/123] [2026_HP_1001_1] [2026_HP_9999_9]";
        assert_eq!(extract_tender_id_from_title(title), "2026_HP_1001_1");
    }

    #[test]
    fn test_extract_bracket_fallback_right_to_left() {
        let title = "Supply of pipes [NIT-4] [WBPWD_2026_55]";
        assert_eq!(extract_tender_id_from_title(title), "WBPWD_2026_55");
    }

    #[test]
    fn test_extract_bare_fallback_is_rightmost() {
        let title = "Corrigendum 2025_OLD_11_1 superseded by 2026_NEW_22_1";
        assert_eq!(extract_tender_id_from_title(title), "2026_NEW_22_1");
    }

    #[test]
    fn test_extract_no_id() {
        assert_eq!(extract_tender_id_from_title("Annual maintenance contract"), "");
        assert_eq!(extract_tender_id_from_title(""), "");
    }

    #[test]
    fn test_resolve_portal_skill() {
        assert_eq!(
            resolve_portal_skill("HP Tenders", "https://hptenders.gov.in/nicgep/app", ""),
            PortalSkill::Nic
        );
        assert_eq!(
            resolve_portal_skill("Metro RFPs", "https://metro.example.org", ""),
            PortalSkill::Generic
        );
        assert_eq!(
            resolve_portal_skill("", "", "https://etenders.kerala.gov.in/app"),
            PortalSkill::Nic
        );
    }

    #[test]
    fn test_is_valid_canonical_id() {
        assert!(is_valid_canonical_id("2026_HP_1001_1"));
        assert!(is_valid_canonical_id("ABCDE"));
        assert!(!is_valid_canonical_id("abc"));
        assert!(!is_valid_canonical_id("AB-12"));
        assert!(!is_valid_canonical_id("AB12"));
    }
}
