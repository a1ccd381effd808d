//! Department-listing signature for change detection.
//!
//! The signature covers only `(serial, lowercased name, count text)` tuples,
//! sorted. Direct URLs are excluded: they embed volatile session tokens that
//! would make every check look like a change.

use sha1::{Digest, Sha1};

use crate::fetch::DepartmentInfo;

/// Header names excluded from the signature.
const HEADER_NAMES: &[&str] = &[
    "organisation name",
    "department name",
    "organization",
    "organization name",
];

/// Compute the SHA-1 signature of a department listing. Returns the hex
/// digest and the number of departments that contributed to it.
#[must_use]
pub fn compute_department_signature(departments: &[DepartmentInfo]) -> (String, usize) {
    let mut normalized: Vec<(String, String, String)> = departments
        .iter()
        .filter_map(|dept| {
            let s_no = dept.s_no.trim().to_string();
            let name = dept.name.trim().to_lowercase();
            let count_text = dept.count_text.trim().to_string();
            if s_no.is_empty() && name.is_empty() {
                return None;
            }
            if HEADER_NAMES.contains(&name.as_str()) {
                return None;
            }
            Some((s_no, name, count_text))
        })
        .collect();
    normalized.sort();

    let count = normalized.len();
    let payload = serde_json::to_string(&normalized).unwrap_or_default();
    let digest = Sha1::digest(payload.as_bytes());
    (hex::encode(digest), count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dept(s_no: &str, name: &str, count: &str, url: &str) -> DepartmentInfo {
        DepartmentInfo {
            s_no: s_no.to_string(),
            name: name.to_string(),
            count_text: count.to_string(),
            direct_url: url.to_string(),
        }
    }

    #[test]
    fn test_signature_stable_under_order_and_urls() {
        let a = vec![
            dept("1", "Roads", "10", "https://x/app?session=T&id=1"),
            dept("2", "Bridges", "4", "https://x/app?id=2"),
        ];
        let b = vec![
            dept("2", "Bridges", "4", "https://x/app?id=2&jsessionid=zzz"),
            dept("1", "roads", "10", ""),
        ];
        let (sig_a, count_a) = compute_department_signature(&a);
        let (sig_b, count_b) = compute_department_signature(&b);
        assert_eq!(sig_a, sig_b);
        assert_eq!(count_a, 2);
        assert_eq!(count_b, 2);
    }

    #[test]
    fn test_signature_changes_with_count_text() {
        let before = vec![dept("1", "Roads", "10", "")];
        let after = vec![dept("1", "Roads", "11", "")];
        assert_ne!(
            compute_department_signature(&before).0,
            compute_department_signature(&after).0
        );
    }

    #[test]
    fn test_header_and_empty_rows_excluded() {
        let departments = vec![
            dept("", "", "", ""),
            dept("S.No", "Organisation Name", "Tender Count", ""),
            dept("1", "Roads", "10", ""),
        ];
        let (_, count) = compute_department_signature(&departments);
        assert_eq!(count, 1);
    }

    #[test]
    fn test_sha1_hex_shape() {
        let (sig, _) = compute_department_signature(&[dept("1", "Roads", "10", "")]);
        assert_eq!(sig.len(), 40);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
