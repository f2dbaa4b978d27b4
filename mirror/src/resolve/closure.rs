//! Digest-closure reference computation.

use crate::release;

/// References for every digest found in an `images_digests.json` document,
/// rooted at `repo`.
pub fn digest_references(repo: &str, digests_doc: &[u8]) -> Vec<String> {
    release::scan_digests(digests_doc)
        .into_iter()
        .map(|digest| format!("{}@{}", repo, digest))
        .collect()
}

/// References for every tag found in a legacy `images_tags.json` document,
/// rooted at `repo`.
pub fn tag_references(repo: &str, tags_doc: &[u8]) -> anyhow::Result<Vec<String>> {
    Ok(release::scan_tags(tags_doc)?
        .into_iter()
        .map(|tag| format!("{}:{}", repo, tag))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_references_are_rooted() {
        let digest = format!("sha256:{}", "7".repeat(64));
        let doc = format!(r#"{{"web": {{"main": "{}"}}}}"#, digest);
        assert_eq!(
            digest_references("r.example/d/ce", doc.as_bytes()),
            vec![format!("r.example/d/ce@{}", digest)]
        );
    }

    #[test]
    fn tag_references_are_rooted() {
        let doc = br#"{"common": {"web": "v1.2.3"}}"#;
        assert_eq!(
            tag_references("r.example/d/ce", doc).unwrap(),
            vec!["r.example/d/ce:v1.2.3"]
        );
    }
}
