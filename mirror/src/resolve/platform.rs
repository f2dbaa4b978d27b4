//! Resolution of platform versions from release channels.

use std::collections::BTreeMap;

use semver::Version;

use crate::versions;

/// Channels every edition publishes; missing ones are fatal.
pub const DEFAULT_CHANNELS: &[&str] = &["alpha", "beta", "early-access", "stable", "rock-solid"];
/// Channels mirrored best-effort when present.
pub const OPTIONAL_CHANNELS: &[&str] = &["lts"];

/// The channel bounding the oldest release to mirror.
pub const ROCK_SOLID: &str = "rock-solid";

/// Compute the set of versions to mirror from channel heads and the
/// release-channel tag listing.
///
/// Channel heads are always kept. When the oldest (rock-solid) head is
/// known, every listed version between `min(since, rock-solid)` and the
/// newest head joins the set, collapsed to the highest patch per
/// `(major, minor)`.
pub fn plan_versions(
    channel_heads: &BTreeMap<String, Version>,
    all_tags: &[String],
    since: Option<&Version>,
) -> Vec<Version> {
    let mut planned: Vec<Version> = channel_heads.values().cloned().collect();

    let newest = channel_heads.values().max().cloned();
    let oldest = match (channel_heads.get(ROCK_SOLID), since) {
        (Some(rock_solid), Some(since)) => Some(rock_solid.min(since).clone()),
        (Some(rock_solid), None) => Some(rock_solid.clone()),
        (None, _) => None,
    };

    if let (Some(oldest), Some(newest)) = (oldest, newest) {
        let enumerated = all_tags
            .iter()
            .filter_map(|tag| versions::parse_version(tag))
            .filter(|v| versions::within_bounds(v, &oldest, &newest));
        planned.extend(versions::latest_patches(enumerated));
    }

    planned.sort();
    versions::deduplicate(planned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        versions::parse_version(s).unwrap()
    }

    fn heads(pairs: &[(&str, &str)]) -> BTreeMap<String, Version> {
        pairs
            .iter()
            .map(|(channel, version)| (channel.to_string(), v(version)))
            .collect()
    }

    #[test]
    fn since_version_bounds_the_enumeration() {
        let channel_heads = heads(&[
            ("alpha", "1.52.1"),
            ("beta", "1.52.1"),
            ("early-access", "1.51.4"),
            ("stable", "1.51.4"),
            ("rock-solid", "1.49.2"),
        ]);
        let tags: Vec<String> = [
            "v1.49.0", "v1.49.2", "v1.50.0", "v1.50.3", "v1.51.4", "v1.52.1", "v2.0.0",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let planned = plan_versions(&channel_heads, &tags, Some(&v("1.50.0")));
        assert_eq!(
            planned,
            vec![v("1.49.2"), v("1.50.3"), v("1.51.4"), v("1.52.1")]
        );
    }

    #[test]
    fn channel_heads_survive_even_when_superseded() {
        // stable sits on 1.51.2 although 1.51.4 exists: both are kept.
        let channel_heads = heads(&[
            ("alpha", "1.52.1"),
            ("stable", "1.51.2"),
            ("rock-solid", "1.51.2"),
        ]);
        let tags: Vec<String> = ["v1.51.2", "v1.51.4", "v1.52.0", "v1.52.1"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let planned = plan_versions(&channel_heads, &tags, None);
        assert_eq!(planned, vec![v("1.51.2"), v("1.51.4"), v("1.52.1")]);
    }

    #[test]
    fn no_rock_solid_means_heads_only() {
        let channel_heads = heads(&[("alpha", "1.52.1")]);
        let tags: Vec<String> = vec!["v1.50.0".to_string(), "v1.52.1".to_string()];
        let planned = plan_versions(&channel_heads, &tags, Some(&v("1.50.0")));
        assert_eq!(planned, vec![v("1.52.1")]);
    }

    #[test]
    fn planning_is_tag_order_independent() {
        let channel_heads = heads(&[("alpha", "1.52.1"), ("rock-solid", "1.50.0")]);
        let forward: Vec<String> = ["v1.50.0", "v1.50.3", "v1.51.4", "v1.52.1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let backward: Vec<String> = forward.iter().rev().cloned().collect();
        assert_eq!(
            plan_versions(&channel_heads, &forward, None),
            plan_versions(&channel_heads, &backward, None)
        );
    }
}
