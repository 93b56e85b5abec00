//! Semver-ish tag comparison

use std::cmp::Ordering;

/// Compare release tags like `v0.1.2` or `0.1.2`. Missing fields count as
/// zero and anything after a `-` (pre-release tail) is ignored. Returns
/// `None` when either side is unparsable.
pub fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    let a = parse_version_parts(a.trim().trim_start_matches('v'))?;
    let b = parse_version_parts(b.trim().trim_start_matches('v'))?;
    Some(a.cmp(&b))
}

fn parse_version_parts(v: &str) -> Option<[u64; 3]> {
    if v.is_empty() {
        return None;
    }
    let core = v.split('-').next().unwrap_or(v);
    let fields: Vec<&str> = core.split('.').collect();
    if fields.is_empty() || fields.len() > 3 {
        return None;
    }
    let mut out = [0u64; 3];
    for (i, field) in fields.iter().enumerate() {
        out[i] = field.parse().ok()?;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering() {
        assert_eq!(compare_versions("0.1.0", "0.2.0"), Some(Ordering::Less));
        assert_eq!(compare_versions("v1.0.0", "0.9.9"), Some(Ordering::Greater));
        assert_eq!(compare_versions("1.2.3", "v1.2.3"), Some(Ordering::Equal));
    }

    #[test]
    fn missing_fields_are_zero() {
        assert_eq!(compare_versions("1.2", "1.2.0"), Some(Ordering::Equal));
        assert_eq!(compare_versions("1", "1.0.0"), Some(Ordering::Equal));
    }

    #[test]
    fn prerelease_tail_is_ignored() {
        assert_eq!(compare_versions("1.2.3-rc.1", "1.2.3"), Some(Ordering::Equal));
    }

    #[test]
    fn unparsable_is_none() {
        assert_eq!(compare_versions("dev", "1.0.0"), None);
        assert_eq!(compare_versions("1.0.0", ""), None);
        assert_eq!(compare_versions("1.x.0", "1.0.0"), None);
        assert_eq!(compare_versions("1.2.3.4", "1.0.0"), None);
    }

    #[test]
    fn reflexive_and_antisymmetric() {
        for v in ["0.0.1", "v2.10.4", "3.0", "1.2.3-beta"] {
            assert_eq!(compare_versions(v, v), Some(Ordering::Equal));
        }
        let (a, b) = ("1.4.0", "1.10.0");
        assert_eq!(
            compare_versions(a, b).map(Ordering::reverse),
            compare_versions(b, a)
        );
    }
}
