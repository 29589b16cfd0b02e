//! Human-readable session identifiers: `YYYY-MM-DD-<slug>`.

use chrono::NaiveDate;

const MAX_SLUG_LEN: usize = 48;

/// Lowercase ASCII alphanumerics separated by single dashes. Empty input
/// (or input with nothing usable) becomes `session`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "session".to_string()
    } else {
        slug.to_string()
    }
}

/// Base identifier for a session created on `date`.
pub fn base_id(date: NaiveDate, name: &str) -> String {
    format!("{}-{}", date.format("%Y-%m-%d"), slugify(name))
}

/// The `n`th candidate: the base itself, then `-2`, `-3`, ...
pub fn candidate(base: &str, n: u32) -> String {
    if n <= 1 {
        base.to_string()
    } else {
        format!("{base}-{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_basic() {
        assert_eq!(slugify("Weekly Planning"), "weekly-planning");
        assert_eq!(slugify("  Fix: the build!! "), "fix-the-build");
        assert_eq!(slugify("a__b--c"), "a-b-c");
    }

    #[test]
    fn slugify_empty_becomes_session() {
        assert_eq!(slugify(""), "session");
        assert_eq!(slugify("???"), "session");
        assert_eq!(slugify("日本語"), "session");
    }

    #[test]
    fn slugify_truncates() {
        let long = "word ".repeat(40);
        let slug = slugify(&long);
        assert!(slug.len() <= MAX_SLUG_LEN);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn base_and_candidates() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        let base = base_id(date, "Trip Ideas");
        assert_eq!(base, "2026-10-16-trip-ideas");
        assert_eq!(candidate(&base, 1), "2026-10-16-trip-ideas");
        assert_eq!(candidate(&base, 2), "2026-10-16-trip-ideas-2");
        assert_eq!(candidate(&base, 3), "2026-10-16-trip-ideas-3");
    }
}
