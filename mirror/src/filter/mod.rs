//! Module selection and version policy.
//!
//! A filter is a list of `name` or `name@<constraint>` entries plus a
//! mode. In whitelist mode a module is mirrored iff it is listed; in
//! blacklist mode iff it is not. Constraints either bound the semver
//! versions to mirror or pin a single exact tag, optionally with a
//! channel alias (`name@some-build:stable`).

use std::collections::BTreeMap;

use anyhow::ensure;
use semver::{Op, Version, VersionReq};

use crate::versions;

/// Per-module version constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    /// A semver range expression; `>=0.0.0` when the entry carried none.
    Semver(VersionReq),
    /// An exact, not-necessarily-semver tag with an optional channel alias.
    ExactTag {
        tag: String,
        channel_alias: Option<String>,
    },
}

impl Constraint {
    /// Whether the constraint pins exactly one version.
    pub fn is_exact(&self) -> bool {
        match self {
            Constraint::ExactTag { .. } => true,
            Constraint::Semver(req) => {
                req.comparators.len() == 1 && {
                    let cmp = &req.comparators[0];
                    cmp.op == Op::Exact && cmp.minor.is_some() && cmp.patch.is_some()
                }
            }
        }
    }

    /// The single tag an exact constraint pins, if any.
    pub fn exact_tag(&self) -> Option<String> {
        match self {
            Constraint::ExactTag { tag, .. } => Some(tag.clone()),
            Constraint::Semver(req) if self.is_exact() => {
                let cmp = &req.comparators[0];
                Some(format!(
                    "v{}.{}.{}",
                    cmp.major,
                    cmp.minor.expect("exact comparators carry a minor"),
                    cmp.patch.expect("exact comparators carry a patch")
                ))
            }
            Constraint::Semver(_) => None,
        }
    }

    /// The channel alias of an exact-tag constraint, if any.
    pub fn channel_alias(&self) -> Option<&str> {
        match self {
            Constraint::ExactTag { channel_alias, .. } => channel_alias.as_deref(),
            Constraint::Semver(_) => None,
        }
    }

    /// Whether a parsed version satisfies the constraint.
    pub fn matches_version(&self, version: &Version) -> bool {
        match self {
            Constraint::Semver(req) => req.matches(version),
            Constraint::ExactTag { tag, .. } => {
                versions::parse_version(tag).map_or(false, |t| &t == version)
            }
        }
    }
}

/// Filter polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Whitelist,
    Blacklist,
}

/// A validated module filter.
#[derive(Debug, Clone)]
pub struct ModuleFilter {
    mode: FilterMode,
    entries: BTreeMap<String, Constraint>,
}

impl Default for ModuleFilter {
    /// The default filter is an empty blacklist: every module passes.
    fn default() -> Self {
        ModuleFilter {
            mode: FilterMode::Blacklist,
            entries: BTreeMap::new(),
        }
    }
}

impl ModuleFilter {
    /// Parse filter entries. Each input may itself carry several
    /// `;`-separated entries; whitespace is trimmed, empty fragments are
    /// skipped.
    pub fn parse(mode: FilterMode, inputs: &[String]) -> anyhow::Result<Self> {
        let mut entries = BTreeMap::new();
        for fragment in inputs.iter().flat_map(|input| input.split(';')) {
            let fragment = fragment.trim();
            if fragment.is_empty() {
                continue;
            }
            let (name, constraint) = match fragment.split_once('@') {
                None => (fragment, None),
                Some((name, constraint)) => (name.trim(), Some(constraint.trim())),
            };
            ensure!(!name.is_empty(), "empty module name in filter entry '{}'", fragment);
            let constraint = match constraint {
                None | Some("") => Constraint::Semver(VersionReq::STAR),
                Some(body) => parse_constraint(body)?,
            };
            ensure!(
                entries.insert(name.to_string(), constraint).is_none(),
                "module '{}' declared more than once in the filter",
                name
            );
        }
        Ok(ModuleFilter { mode, entries })
    }

    /// Build a filter from include/exclude lists. An include list wins and
    /// turns the filter into a whitelist, ignoring excludes; otherwise the
    /// excludes form a blacklist (an empty one accepts everything).
    pub fn from_include_exclude(
        include: &[String],
        exclude: &[String],
    ) -> anyhow::Result<Self> {
        if !include.is_empty() {
            ModuleFilter::parse(FilterMode::Whitelist, include)
        } else {
            ModuleFilter::parse(FilterMode::Blacklist, exclude)
        }
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    /// Whether `module` is in mirroring scope.
    pub fn matches(&self, module: &str) -> bool {
        match self.mode {
            FilterMode::Whitelist => self.entries.contains_key(module),
            FilterMode::Blacklist => !self.entries.contains_key(module),
        }
    }

    /// The constraint declared for `module`, if it is listed.
    pub fn constraint(&self, module: &str) -> Option<&Constraint> {
        self.entries.get(module)
    }

    /// Release channels are mirrored unless the module is pinned to one
    /// exact version.
    pub fn should_mirror_release_channels(&self, module: &str) -> bool {
        !self.constraint(module).map_or(false, Constraint::is_exact)
    }

    /// Expand the module's constraint against its registry tag listing.
    ///
    /// The result is sorted by version and duplicate versions are
    /// collapsed, so it does not depend on the listing order.
    pub fn versions_to_mirror(&self, module: &str, tags: &[String]) -> Vec<String> {
        let constraint = self.constraint(module);
        if let Some(tag) = constraint.and_then(Constraint::exact_tag) {
            return vec![tag];
        }

        let mut matching: Vec<(Version, String)> = tags
            .iter()
            .filter_map(|tag| versions::parse_version(tag).map(|v| (v, tag.clone())))
            .filter(|(v, _)| constraint.map_or(true, |c| c.matches_version(v)))
            .collect();
        matching.sort_by(|a, b| a.0.cmp(&b.0));
        matching.dedup_by(|a, b| a.0 == b.0);
        matching.into_iter().map(|(_, tag)| tag).collect()
    }

    /// Filter a module's release-channel tag listing: channel-named (non
    /// semver) tags are kept verbatim, semver tags only when they satisfy
    /// the constraint.
    pub fn filter_release_tags(&self, module: &str, tags: &[String]) -> Vec<String> {
        let constraint = self.constraint(module);
        tags.iter()
            .filter(|tag| match versions::parse_version(tag) {
                Some(version) => constraint.map_or(true, |c| c.matches_version(&version)),
                None => true,
            })
            .cloned()
            .collect()
    }
}

fn parse_constraint(body: &str) -> anyhow::Result<Constraint> {
    // A bare version pins exactly that version.
    if let Some(version) = versions::parse_version(body) {
        let req = VersionReq::parse(&format!("={}", version))
            .expect("an exact requirement from a parsed version is valid");
        return Ok(Constraint::Semver(req));
    }

    // Anything that looks like a range expression must parse as one.
    if body.starts_with(&['>', '<', '=', '~', '^'][..]) || body.contains(',') {
        let normalized = normalize_range(body);
        let req = VersionReq::parse(&normalized)
            .map_err(|e| anyhow::anyhow!("invalid semver constraint '{}': {}", body, e))?;
        return Ok(Constraint::Semver(req));
    }

    // Otherwise an exact tag, optionally with a channel alias.
    let (tag, channel_alias) = match body.split_once(':') {
        Some((tag, alias)) => (tag.trim(), Some(alias.trim().to_string())),
        None => (body, None),
    };
    ensure!(!tag.is_empty(), "empty tag in filter constraint '{}'", body);
    if let Some(alias) = &channel_alias {
        ensure!(
            !alias.is_empty(),
            "empty channel alias in filter constraint '{}'",
            body
        );
    }
    Ok(Constraint::ExactTag {
        tag: tag.to_string(),
        channel_alias,
    })
}

/// Normalize a space-separated range expression (`>=1.3.0 <2`) into the
/// comma-separated form the semver parser expects.
fn normalize_range(body: &str) -> String {
    if body.contains(',') {
        return body.to_string();
    }
    let mut comparators: Vec<String> = Vec::new();
    for token in body.split_whitespace() {
        if token.starts_with(&['>', '<', '=', '~', '^'][..]) || comparators.is_empty() {
            comparators.push(token.to_string());
        } else {
            let last = comparators.last_mut().expect("just checked non-empty");
            last.push(' ');
            last.push_str(token);
        }
    }
    comparators.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(entry: &str) -> ModuleFilter {
        ModuleFilter::parse(FilterMode::Whitelist, &[entry.to_string()]).unwrap()
    }

    #[test]
    fn whitespace_and_empty_fragments_are_tolerated() {
        let filter = parse_one(" ; m1 @1.1.1;m2 @ v2.3.2; ");
        assert!(filter.matches("m1"));
        assert!(filter.matches("m2"));
        assert_eq!(
            filter.constraint("m1").unwrap().exact_tag(),
            Some("v1.1.1".to_string())
        );
        assert_eq!(
            filter.constraint("m2").unwrap().exact_tag(),
            Some("v2.3.2".to_string())
        );
    }

    #[test]
    fn range_and_exact_semver_constraints() {
        let filter = parse_one("m1@>=1.3.0 <2;m2@=2.1.47");

        let m1_tags: Vec<String> = ["alpha", "beta", "v1.0.0", "v1.2.0", "v1.3.0", "v1.4.1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            filter.versions_to_mirror("m1", &m1_tags),
            vec!["v1.3.0", "v1.4.1"]
        );
        assert_eq!(
            filter.filter_release_tags("m1", &m1_tags),
            vec!["alpha", "beta", "v1.3.0", "v1.4.1"]
        );
        assert!(filter.should_mirror_release_channels("m1"));

        assert_eq!(filter.versions_to_mirror("m2", &[]), vec!["v2.1.47"]);
        assert!(!filter.should_mirror_release_channels("m2"));
    }

    #[test]
    fn exact_tag_with_channel_alias() {
        let filter = parse_one("mymod@weekly-build-2024-11:stable");
        let constraint = filter.constraint("mymod").unwrap();
        assert!(constraint.is_exact());
        assert_eq!(constraint.exact_tag(), Some("weekly-build-2024-11".to_string()));
        assert_eq!(constraint.channel_alias(), Some("stable"));
        assert!(!filter.should_mirror_release_channels("mymod"));
    }

    #[test]
    fn name_only_entry_mirrors_everything() {
        let filter = parse_one("m1");
        assert!(filter.should_mirror_release_channels("m1"));
        let tags: Vec<String> = ["v0.1.0", "v1.0.0", "nightly"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            filter.versions_to_mirror("m1", &tags),
            vec!["v0.1.0", "v1.0.0"]
        );
    }

    #[test]
    fn blacklist_complements_and_empty_accepts_all() {
        let filter = ModuleFilter::parse(FilterMode::Blacklist, &["m1".to_string()]).unwrap();
        assert!(!filter.matches("m1"));
        assert!(filter.matches("m2"));

        let empty = ModuleFilter::default();
        assert!(empty.matches("anything"));
    }

    #[test]
    fn include_wins_over_exclude() {
        let filter = ModuleFilter::from_include_exclude(
            &["m1".to_string()],
            &["m1".to_string(), "m2".to_string()],
        )
        .unwrap();
        assert_eq!(filter.mode(), FilterMode::Whitelist);
        assert!(filter.matches("m1"));
        assert!(!filter.matches("m2"));

        let filter =
            ModuleFilter::from_include_exclude(&[], &["m2".to_string()]).unwrap();
        assert_eq!(filter.mode(), FilterMode::Blacklist);
        assert!(filter.matches("m1"));
        assert!(!filter.matches("m2"));
    }

    #[test]
    fn validation_errors() {
        assert!(ModuleFilter::parse(FilterMode::Whitelist, &["@>=1.0.0".to_string()]).is_err());
        assert!(
            ModuleFilter::parse(FilterMode::Whitelist, &["m1;m1@>=1.0.0".to_string()]).is_err()
        );
        assert!(ModuleFilter::parse(FilterMode::Whitelist, &["m1@>=x.y".to_string()]).is_err());
    }

    #[test]
    fn expansion_is_order_independent() {
        let filter = parse_one("m1@>=1.0.0");
        let forward: Vec<String> = ["v1.0.0", "v1.1.0", "v1.2.0"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let backward: Vec<String> = forward.iter().rev().cloned().collect();
        assert_eq!(
            filter.versions_to_mirror("m1", &forward),
            filter.versions_to_mirror("m1", &backward)
        );
    }
}
