//! Image reference string helpers.
//!
//! References handled here are scheme-less: `host[:port]/path...` plus an
//! optional `:tag` or `@sha256:<hex>` suffix.

/// The tag or digest part of a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind<'a> {
    Tag(&'a str),
    Digest(&'a str),
    Bare,
}

/// Split a full reference into its repository part and tag/digest part.
///
/// A colon inside the host segment (a port) is not mistaken for a tag.
pub fn split_reference(full: &str) -> (&str, RefKind<'_>) {
    if let Some(at) = full.find('@') {
        return (&full[..at], RefKind::Digest(&full[at + 1..]));
    }
    let last_segment_start = full.rfind('/').map(|i| i + 1).unwrap_or(0);
    match full[last_segment_start..].rfind(':') {
        Some(colon) => {
            let cut = last_segment_start + colon;
            (&full[..cut], RefKind::Tag(&full[cut + 1..]))
        }
        None => (full, RefKind::Bare),
    }
}

/// The repository part of a reference.
pub fn repo_of(full: &str) -> &str {
    split_reference(full).0
}

/// Path segments of `target_repo` below `base`, if `base` is a prefix scope.
pub fn segments_below<'a>(base: &str, target_repo: &'a str) -> anyhow::Result<Vec<&'a str>> {
    if target_repo == base {
        return Ok(Vec::new());
    }
    let rest = target_repo
        .strip_prefix(base)
        .and_then(|r| r.strip_prefix('/'))
        .ok_or_else(|| {
            anyhow::anyhow!(
                "reference repository '{}' is outside of scope '{}'",
                target_repo,
                base
            )
        })?;
    Ok(rest.split('/').collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_tagged_reference() {
        let (repo, kind) = split_reference("r.example/d/ce/install:v1.50.0");
        assert_eq!(repo, "r.example/d/ce/install");
        assert_eq!(kind, RefKind::Tag("v1.50.0"));
    }

    #[test]
    fn splits_digest_reference() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let full = format!("r.example/d/ce@{}", digest);
        let (repo, kind) = split_reference(&full);
        assert_eq!(repo, "r.example/d/ce");
        assert_eq!(kind, RefKind::Digest(&digest));
    }

    #[test]
    fn port_is_not_a_tag() {
        let (repo, kind) = split_reference("registry.local:5000/d/ce");
        assert_eq!(repo, "registry.local:5000/d/ce");
        assert_eq!(kind, RefKind::Bare);

        let (repo, kind) = split_reference("registry.local:5000/d/ce:stable");
        assert_eq!(repo, "registry.local:5000/d/ce");
        assert_eq!(kind, RefKind::Tag("stable"));
    }

    #[test]
    fn segments_below_scope() {
        let segs = segments_below("r.example/d/ce", "r.example/d/ce/modules/m1/extra/redis").unwrap();
        assert_eq!(segs, vec!["modules", "m1", "extra", "redis"]);

        assert!(segments_below("r.example/d/ce", "r.example/d/ce").unwrap().is_empty());
        assert!(segments_below("r.example/d/ce", "other.host/repo").is_err());
    }
}
