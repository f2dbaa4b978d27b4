//! Introspection of release metadata embedded in image file systems.
//!
//! Release-channel and module images carry small JSON/YAML documents in
//! their layers (`version.json`, `images_digests.json`, ...). This module
//! extracts those files from the layered file system (later layers
//! override earlier ones for identical paths) and interprets them.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use serde::Deserialize;
use tar::Archive;

use commons::MirrorError;

use crate::image::{Image, ImageBlob};

/// Version record of a release-channel image.
pub const VERSION_FILE: &str = "version.json";
/// Changelog shipped next to the version record.
pub const CHANGELOG_FILE: &str = "changelog.yaml";
/// Digest map of a module-image version.
pub const MODULE_DIGESTS_FILE: &str = "images_digests.json";
/// Auxiliary image map of a module-image version.
pub const EXTRA_IMAGES_FILE: &str = "extra_images.json";
/// Digest map embedded in platform installer images.
pub const INSTALLER_DIGESTS_FILE: &str = "deckhouse/candi/images_digests.json";
/// Legacy tag map of old platform installer images.
pub const INSTALLER_TAGS_FILE: &str = "deckhouse/candi/images_tags.json";

/// The only in-image paths the introspector will read.
const READABLE_FILES: &[&str] = &[
    VERSION_FILE,
    CHANGELOG_FILE,
    MODULE_DIGESTS_FILE,
    EXTRA_IMAGES_FILE,
    INSTALLER_DIGESTS_FILE,
    INSTALLER_TAGS_FILE,
];

lazy_static! {
    static ref DIGEST_RE: Regex =
        Regex::new(r"sha256:[0-9a-f]{64}").expect("could not create regex");
}

/// The `version.json` payload of a release-channel image.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VersionRecord {
    pub version: String,
    #[serde(default, rename = "suspend")]
    pub suspended: bool,
    #[serde(default)]
    pub requirements: Option<serde_json::Value>,
    #[serde(default)]
    pub disruptions: Option<serde_json::Value>,
}

impl VersionRecord {
    /// Tag form of the version, leading `v` normalized to present.
    pub fn tag(&self) -> String {
        if self.version.starts_with('v') {
            self.version.clone()
        } else {
            format!("v{}", self.version)
        }
    }

    pub fn semver(&self) -> anyhow::Result<semver::Version> {
        crate::versions::parse_version(&self.version)
            .ok_or_else(|| anyhow::anyhow!("'{}' is not a semver version", self.version))
    }
}

/// Extract a single file from the image's layered file system.
///
/// The topmost layer carrying the path wins. Returns a not-found error
/// when no layer has it; callers decide whether that is fatal.
pub fn extract_file(image: &Image, wanted: &str) -> Result<Vec<u8>, MirrorError> {
    if !READABLE_FILES.contains(&wanted) {
        return Err(MirrorError::Fatal(format!(
            "refusing to read '{}': not a known release metadata file",
            wanted
        )));
    }

    let layers = image
        .layer_blobs()
        .map_err(|e| MirrorError::Fatal(format!("unreadable image {}: {}", image.digest, e)))?;

    for blob in layers.iter().rev() {
        match scan_layer(blob, wanted) {
            Ok(Some(data)) => return Ok(data),
            Ok(None) => continue,
            Err(e) => {
                debug!("[{}] skipping unreadable layer: {}", blob.digest, e);
                continue;
            }
        }
    }

    Err(MirrorError::ImageNotFound(format!(
        "'{}' not found in image {}",
        wanted, image.digest
    )))
}

fn scan_layer(blob: &ImageBlob, wanted: &str) -> anyhow::Result<Option<Vec<u8>>> {
    let reader: Box<dyn Read + '_> = if blob.media_type.ends_with("gzip") {
        Box::new(GzDecoder::new(blob.data.as_slice()))
    } else {
        Box::new(blob.data.as_slice())
    };

    let mut archive = Archive::new(reader);
    for entry in archive.entries()? {
        let mut file = entry?;
        let path = file.header().path()?;
        let normalized = path.strip_prefix("./").unwrap_or(&path);
        if normalized == Path::new(wanted) {
            let mut contents = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut contents)?;
            return Ok(Some(contents));
        }
    }
    Ok(None)
}

/// Read and parse the image's `version.json`.
pub fn version_record(image: &Image) -> Result<VersionRecord, MirrorError> {
    let data = extract_file(image, VERSION_FILE)?;
    serde_json::from_slice(&data)
        .map_err(|e| MirrorError::Fatal(format!("could not parse '{}': {}", VERSION_FILE, e)))
}

/// Scan a digests document for `sha256:<hex>` occurrences.
///
/// The scan is regex-based on purpose: the document is a nested object
/// whose exact schema varies between versions, but digests are digests.
pub fn scan_digests(doc: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(doc);
    let mut seen = std::collections::HashSet::new();
    DIGEST_RE
        .find_iter(&text)
        .map(|m| m.as_str().to_string())
        .filter(|d| seen.insert(d.clone()))
        .collect()
}

/// Collect the leaf string values of a legacy nested tag map.
pub fn scan_tags(doc: &[u8]) -> anyhow::Result<Vec<String>> {
    let value: serde_json::Value =
        serde_json::from_slice(doc).map_err(|e| anyhow::anyhow!("malformed tag map: {}", e))?;
    let mut tags = Vec::new();
    collect_string_leaves(&value, &mut tags);
    let mut seen = std::collections::HashSet::new();
    Ok(tags.into_iter().filter(|t| seen.insert(t.clone())).collect())
}

fn collect_string_leaves(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => out.push(s.clone()),
        serde_json::Value::Object(map) => {
            for child in map.values() {
                collect_string_leaves(child, out);
            }
        }
        _ => {}
    }
}

/// Parse an `extra_images.json` flat map, coercing numeric tag values.
///
/// Floats are rendered as integers; anything but strings and numbers is
/// rejected.
pub fn extra_images(doc: &[u8]) -> anyhow::Result<BTreeMap<String, String>> {
    let value: serde_json::Value = serde_json::from_slice(doc)
        .map_err(|e| anyhow::anyhow!("malformed extra images map: {}", e))?;
    let object = value
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("extra images document is not an object"))?;

    let mut out = BTreeMap::new();
    for (name, tag) in object {
        let tag = match tag {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    i.to_string()
                } else if let Some(f) = n.as_f64() {
                    (f as i64).to_string()
                } else {
                    anyhow::bail!("unrepresentable tag value for extra image '{}'", name);
                }
            }
            other => anyhow::bail!(
                "unsupported tag value {} for extra image '{}'",
                other,
                name
            ),
        };
        out.insert(name.clone(), tag);
    }
    Ok(out)
}

/// A `DeckhouseRelease` manifest for one mirrored version, generated from
/// the in-image `version.json` and optional `changelog.yaml`.
pub fn release_manifest(
    record: &VersionRecord,
    changelog: Option<&[u8]>,
) -> anyhow::Result<serde_yaml::Value> {
    use serde_yaml::{Mapping, Value};

    let mut spec = Mapping::new();
    spec.insert(Value::from("version"), Value::from(record.tag()));
    if let Some(requirements) = &record.requirements {
        spec.insert(Value::from("requirements"), serde_yaml::to_value(requirements)?);
    }
    if let Some(disruptions) = &record.disruptions {
        spec.insert(Value::from("disruptions"), serde_yaml::to_value(disruptions)?);
    }
    if let Some(changelog) = changelog {
        let parsed: Value = serde_yaml::from_slice(changelog)
            .map_err(|e| anyhow::anyhow!("could not parse '{}': {}", CHANGELOG_FILE, e))?;
        spec.insert(Value::from("changelog"), parsed);
    }

    let mut metadata = Mapping::new();
    metadata.insert(Value::from("name"), Value::from(record.tag()));

    let mut root = Mapping::new();
    root.insert(Value::from("apiVersion"), Value::from("deckhouse.io/v1alpha1"));
    root.insert(Value::from("kind"), Value::from("DeckhouseRelease"));
    root.insert(Value::from("approved"), Value::from(false));
    root.insert(Value::from("metadata"), Value::Mapping(metadata));
    root.insert(Value::from("spec"), Value::Mapping(spec));
    Ok(Value::Mapping(root))
}

/// Render release manifests as one multi-document YAML stream.
pub fn render_manifests(manifests: &[serde_yaml::Value]) -> anyhow::Result<String> {
    let mut out = String::new();
    for manifest in manifests {
        if !out.is_empty() {
            out.push_str("---\n");
        }
        out.push_str(&serde_yaml::to_string(manifest)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::image_with_files;

    #[test]
    fn version_record_parsing() {
        let image = image_with_files(&[(
            "version.json",
            br#"{"version": "1.50.3", "suspend": false}"# as &[u8],
        )]);
        let record = version_record(&image).unwrap();
        assert_eq!(record.version, "1.50.3");
        assert_eq!(record.tag(), "v1.50.3");
        assert!(!record.suspended);
        assert_eq!(record.semver().unwrap(), semver::Version::new(1, 50, 3));
    }

    #[test]
    fn suspended_channel_is_reported() {
        let image = image_with_files(&[(
            "version.json",
            br#"{"version": "v1.51.0", "suspend": true}"# as &[u8],
        )]);
        let record = version_record(&image).unwrap();
        assert!(record.suspended);
        assert_eq!(record.tag(), "v1.51.0");
    }

    #[test]
    fn missing_file_is_not_found() {
        let image = image_with_files(&[("version.json", b"{}" as &[u8])]);
        let err = extract_file(&image, CHANGELOG_FILE).unwrap_err();
        assert_eq!(err.as_kind(), "not-found");
    }

    #[test]
    fn files_outside_the_allow_list_are_refused() {
        let image = image_with_files(&[("etc/passwd", b"root" as &[u8])]);
        let err = extract_file(&image, "etc/passwd").unwrap_err();
        assert_eq!(err.as_kind(), "fatal");
    }

    #[test]
    fn later_layers_override_earlier_ones() {
        use crate::image::Image;
        use crate::testing::files_layer;

        let lower = files_layer(&[("version.json", br#"{"version": "1.0.0"}"# as &[u8])]);
        let upper = files_layer(&[("version.json", br#"{"version": "2.0.0"}"# as &[u8])]);
        let image = Image::assemble(b"{}".to_vec(), vec![lower, upper]);

        let record = version_record(&image).unwrap();
        assert_eq!(record.version, "2.0.0");
    }

    #[test]
    fn digest_scan_is_schema_agnostic() {
        let digest_a = format!("sha256:{}", "a".repeat(64));
        let digest_b = format!("sha256:{}", "b".repeat(64));
        let doc = format!(
            r#"{{"controller": {{"web": "{a}", "sync": "{b}"}}, "again": "{a}"}}"#,
            a = digest_a,
            b = digest_b
        );
        assert_eq!(scan_digests(doc.as_bytes()), vec![digest_a, digest_b]);
    }

    #[test]
    fn tag_scan_collects_nested_leaves() {
        let doc = br#"{"common": {"init": "v1", "web": "v2"}, "top": "v3"}"#;
        let mut tags = scan_tags(doc).unwrap();
        tags.sort();
        assert_eq!(tags, vec!["v1", "v2", "v3"]);
    }

    #[test]
    fn extra_image_tag_coercion() {
        let doc = br#"{"redis": "7.2", "postgres": 16, "clickhouse": 24.0}"#;
        let extras = extra_images(doc).unwrap();
        assert_eq!(extras.get("redis").unwrap(), "7.2");
        assert_eq!(extras.get("postgres").unwrap(), "16");
        assert_eq!(extras.get("clickhouse").unwrap(), "24");

        let bad = br#"{"redis": ["a"]}"#;
        assert!(extra_images(bad).is_err());
    }

    #[test]
    fn release_manifest_rendering() {
        let record = VersionRecord {
            version: "1.50.3".to_string(),
            suspended: false,
            requirements: Some(serde_json::json!({"kubernetesMinimalVersion": "1.23"})),
            disruptions: None,
        };
        let manifest = release_manifest(&record, Some(b"fixes:\n  - nothing\n")).unwrap();
        let rendered = render_manifests(&[manifest]).unwrap();
        assert!(rendered.contains("kind: DeckhouseRelease"), "{}", rendered);
        assert!(rendered.contains("name: v1.50.3"), "{}", rendered);
        assert!(rendered.contains("kubernetesMinimalVersion"), "{}", rendered);
        assert!(rendered.contains("fixes"), "{}", rendered);
    }
}
