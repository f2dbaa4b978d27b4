//! Semver ordering helpers for release tags.

use std::collections::{BTreeMap, HashSet};

use semver::Version;

/// Parse a release tag (`v1.2.3` or `1.2.3`) into a semver version.
pub fn parse_version(tag: &str) -> Option<Version> {
    Version::parse(tag.trim().trim_start_matches('v')).ok()
}

/// Canonical tag form of a version, leading `v` present.
pub fn format_tag(version: &Version) -> String {
    format!("v{}", version)
}

/// Drop duplicates (compared by parsed version), preserving the insertion
/// order of first occurrences.
pub fn deduplicate(versions: Vec<Version>) -> Vec<Version> {
    let mut seen = HashSet::new();
    versions
        .into_iter()
        .filter(|v| seen.insert(v.clone()))
        .collect()
}

/// Keep only the highest patch per `(major, minor)` pair, ascending.
pub fn latest_patches<I>(versions: I) -> Vec<Version>
where
    I: IntoIterator<Item = Version>,
{
    let mut newest: BTreeMap<(u64, u64), Version> = BTreeMap::new();
    for version in versions {
        let key = (version.major, version.minor);
        match newest.get(&key) {
            Some(existing) if *existing >= version => {}
            _ => {
                newest.insert(key, version);
            }
        }
    }
    newest.into_iter().map(|(_, v)| v).collect()
}

/// Whether `version` lies in the inclusive `[min, max]` range.
pub fn within_bounds(version: &Version, min: &Version, max: &Version) -> bool {
    version >= min && version <= max
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        parse_version(s).unwrap()
    }

    #[test]
    fn tag_parsing_normalizes_prefix() {
        assert_eq!(parse_version("v1.2.3"), parse_version("1.2.3"));
        assert_eq!(format_tag(&v("1.2.3")), "v1.2.3");
        assert!(parse_version("alpha").is_none());
        assert!(parse_version("").is_none());
    }

    #[test]
    fn latest_patch_per_minor() {
        let input = vec![
            v("1.49.0"),
            v("1.49.2"),
            v("1.50.0"),
            v("1.50.3"),
            v("1.51.4"),
            v("1.52.1"),
        ];
        let out = latest_patches(input);
        assert_eq!(
            out,
            vec![v("1.49.2"), v("1.50.3"), v("1.51.4"), v("1.52.1")]
        );
    }

    #[test]
    fn latest_patch_is_order_independent() {
        let forward = latest_patches(vec![v("1.50.0"), v("1.50.3"), v("1.50.1")]);
        let backward = latest_patches(vec![v("1.50.3"), v("1.50.1"), v("1.50.0")]);
        assert_eq!(forward, backward);
        assert_eq!(forward, vec![v("1.50.3")]);
    }

    #[test]
    fn dedup_preserves_first_occurrences() {
        let out = deduplicate(vec![v("1.2.3"), v("1.0.0"), v("1.2.3"), v("1.1.0")]);
        assert_eq!(out, vec![v("1.2.3"), v("1.0.0"), v("1.1.0")]);
    }

    #[test]
    fn bounds_are_inclusive() {
        assert!(within_bounds(&v("1.50.0"), &v("1.49.2"), &v("1.52.1")));
        assert!(within_bounds(&v("1.49.2"), &v("1.49.2"), &v("1.52.1")));
        assert!(within_bounds(&v("1.52.1"), &v("1.49.2"), &v("1.52.1")));
        assert!(!within_bounds(&v("2.0.0"), &v("1.49.2"), &v("1.52.1")));
        assert!(!within_bounds(&v("1.49.0"), &v("1.49.2"), &v("1.52.1")));
    }
}
