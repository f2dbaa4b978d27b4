//! VEX attestation discovery.
//!
//! For a base image `repo@sha256:<hex>` the companion attestation, when
//! published, lives at `repo:sha256-<hex>.att`. Discovery happens at most
//! once per digest per run.

use std::collections::HashSet;

/// The candidate attestation reference for a digest reference; `None` for
/// tagged references.
pub fn attestation_reference(reference: &str) -> Option<String> {
    let (repo, digest) = reference.split_once("@sha256:")?;
    Some(format!("{}:sha256-{}.att", repo, digest))
}

/// Per-run digest deduplication for attestation lookups.
#[derive(Debug, Default)]
pub struct VexTracker {
    seen: HashSet<String>,
}

impl VexTracker {
    pub fn new() -> Self {
        VexTracker::default()
    }

    /// Whether this digest has not been probed before in this run.
    pub fn first_seen(&mut self, digest: &str) -> bool {
        self.seen.insert(digest.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attestation_reference_transform() {
        let hex = "c".repeat(64);
        let reference = format!("r.example/d/ce@sha256:{}", hex);
        assert_eq!(
            attestation_reference(&reference).unwrap(),
            format!("r.example/d/ce:sha256-{}.att", hex)
        );
        assert_eq!(attestation_reference("r.example/d/ce:v1.50.0"), None);
    }

    #[test]
    fn tracker_deduplicates() {
        let mut tracker = VexTracker::new();
        assert!(tracker.first_seen("sha256:aa"));
        assert!(!tracker.first_seen("sha256:aa"));
        assert!(tracker.first_seen("sha256:bb"));
    }
}
