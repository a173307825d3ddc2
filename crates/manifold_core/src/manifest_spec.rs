use std::collections::BTreeMap;

use oci_spec::image::{Descriptor, ImageIndex, ImageManifest, MediaType};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{Error, Result};
use crate::oci_digest::OciDigest;

const EMPTY_JSON_MEDIA_TYPE: &str = "application/vnd.oci.empty.v1+json";

/// Abstraction over [`oci_spec::image::ImageManifest`] and [`oci_spec::image::ImageIndex`].
///
/// Provides the metadata needed to record a pushed manifest: its media types, the config blob,
/// layer blobs or child manifests, annotations and an optional subject.
#[derive(Clone, Debug)]
pub enum ManifestSpec {
    Image(ImageManifest),
    Index(ImageIndex),
}

/// The parts of an OCI descriptor the metadata layer records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorInfo {
    pub digest: OciDigest,
    pub media_type: String,
    pub size: i64,
}

impl TryFrom<&Descriptor> for DescriptorInfo {
    type Error = Error;

    fn try_from(d: &Descriptor) -> Result<Self> {
        let digest = d.digest().to_string();
        Ok(Self {
            digest: OciDigest::try_from(digest.as_str())?,
            media_type: d.media_type().to_string(),
            size: i64::try_from(d.size())
                .map_err(|_| Error::InvalidManifest(format!("descriptor {digest} too large")))?,
        })
    }
}

impl TryFrom<&[u8]> for ManifestSpec {
    type Error = Error;

    fn try_from(bs: &[u8]) -> Result<Self> {
        let img_rej_err = match serde_json::from_slice::<ImageManifest>(bs) {
            Ok(m) => return Ok(ManifestSpec::Image(m)),
            Err(e) => e,
        };
        match serde_json::from_slice::<ImageIndex>(bs) {
            Ok(m) => Ok(ManifestSpec::Index(m)),
            Err(ind_rej_err) => {
                tracing::warn!("unable to deserialize manifest as image: {img_rej_err:?}");
                tracing::warn!("unable to deserialize manifest as index: {ind_rej_err:?}");
                Err(Error::InvalidManifest(String::from(
                    "payload is neither an image manifest nor an image index",
                )))
            }
        }
    }
}

impl ManifestSpec {
    #[inline(always)]
    pub fn is_index(&self) -> bool {
        matches!(self, ManifestSpec::Index(_))
    }

    #[inline(always)]
    pub fn schema_version(&self) -> i32 {
        let v: u32 = match self {
            ManifestSpec::Image(im) => im.schema_version().to_owned(),
            ManifestSpec::Index(ii) => ii.schema_version().to_owned(),
        };
        i32::try_from(v).unwrap_or(i32::MAX)
    }

    #[inline(always)]
    pub fn media_type(&self) -> Option<String> {
        match self {
            ManifestSpec::Image(im) => im.media_type().as_ref().map(ToString::to_string),
            ManifestSpec::Index(ii) => ii.media_type().as_ref().map(ToString::to_string),
        }
    }

    #[inline(always)]
    pub fn artifact_type(&self) -> Option<String> {
        match self {
            ManifestSpec::Image(im) => im.artifact_type().as_ref().map(ToString::to_string),
            ManifestSpec::Index(ii) => ii.artifact_type().as_ref().map(ToString::to_string),
        }
    }

    #[inline(always)]
    pub fn annotations(&self) -> BTreeMap<String, String> {
        let annotations = match self {
            ManifestSpec::Image(im) => im.annotations(),
            ManifestSpec::Index(ii) => ii.annotations(),
        };
        annotations
            .iter()
            .flatten()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn subject(&self) -> Result<Option<DescriptorInfo>> {
        let subject = match self {
            ManifestSpec::Image(im) => im.subject(),
            ManifestSpec::Index(ii) => ii.subject(),
        };
        subject.as_ref().map(DescriptorInfo::try_from).transpose()
    }

    /// The config descriptor of an image manifest. Indexes have none.
    pub fn config(&self) -> Result<Option<DescriptorInfo>> {
        match self {
            ManifestSpec::Image(im) => Ok(Some(DescriptorInfo::try_from(im.config())?)),
            ManifestSpec::Index(_) => Ok(None),
        }
    }

    pub fn layers(&self) -> Result<Vec<DescriptorInfo>> {
        match self {
            ManifestSpec::Image(im) => im.layers().iter().map(DescriptorInfo::try_from).collect(),
            ManifestSpec::Index(_) => Ok(Vec::new()),
        }
    }

    /// Child manifests declared by an index. Image manifests have none.
    pub fn children(&self) -> Result<Vec<DescriptorInfo>> {
        match self {
            ManifestSpec::Image(_) => Ok(Vec::new()),
            ManifestSpec::Index(ii) => ii.manifests().iter().map(DescriptorInfo::try_from).collect(),
        }
    }

    /// Size of the manifest itself plus every descriptor it declares.
    ///
    /// Descriptor sizes come from the client, so a sum that does not fit an `i64` is rejected
    /// as an invalid manifest.
    pub fn total_size(&self, payload_len: usize) -> Result<i64> {
        let too_large = || Error::InvalidManifest(String::from("declared sizes overflow"));
        let payload_len = i64::try_from(payload_len).map_err(|_| too_large())?;
        self.config()?
            .into_iter()
            .chain(self.layers()?)
            .chain(self.children()?)
            .try_fold(payload_len, |total, d| total.checked_add(d.size).ok_or_else(too_large))
    }

    /// Layers that registries must not redistribute, identified by their media type.
    pub fn has_non_distributable_layers(&self) -> Result<bool> {
        Ok(self
            .layers()?
            .iter()
            .any(|l| l.media_type.contains("nondistributable") || l.media_type.contains("foreign")))
    }

    /// Return the declared media type or infer it. Based on the rules outlined in the [OCI Image
    /// Manifest specification](https://github.com/opencontainers/image-spec/blob/main/manifest.md).
    pub fn resolved_media_type(&self) -> Result<String> {
        if let Some(mt) = self.media_type() {
            return Ok(mt);
        }
        tracing::debug!("attempting to infer media type for manifest");
        match self {
            ManifestSpec::Image(im) => {
                // If the config.mediaType is set to the empty value, the artifactType MUST be
                // defined.
                let config_media_type = im.config().media_type().to_string();
                if im.artifact_type().is_some() || config_media_type == MediaType::ImageConfig.to_string()
                {
                    return Ok(MediaType::ImageManifest.to_string());
                }
                if config_media_type == EMPTY_JSON_MEDIA_TYPE {
                    return Err(Error::InvalidManifest(String::from(
                        "empty config requires an artifactType",
                    )));
                }
                Err(Error::InvalidManifest(format!(
                    "cannot infer media type from config media type {config_media_type}"
                )))
            }
            ManifestSpec::Index(_) => Ok(MediaType::ImageIndex.to_string()),
        }
    }
}

/// Reference to an [OCI
/// Manifest](https://github.com/opencontainers/image-spec/blob/main/manifest.md) as specified by
/// the [OCI Distrbution Spec](https://github.com/opencontainers/distribution-spec).
///
/// > `<reference>` MUST be either (a) the digest of the manifest or (b) a tag.
///
/// Tags MUST be at most 128 characters in length and MUST match the regular expression
/// `[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManifestRef {
    Digest(OciDigest),
    Tag(String),
}

static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").unwrap());

/// Reject tag names the distribution protocol would never produce.
pub fn validate_tag_name(name: &str) -> Result<()> {
    if TAG_RE.is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid tag name: {name:?}")))
    }
}

impl std::str::FromStr for ManifestRef {
    type Err = Error;

    /// Convert [`&str`] to a [`ManifestRef`] first by attempting to convert into
    /// [`OciDigest`] then if that doesn't work, checking that the string is a valid tag.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Ok(dgst) = OciDigest::try_from(s) {
            return Ok(Self::Digest(dgst));
        }
        validate_tag_name(s)?;
        Ok(Self::Tag(String::from(s)))
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    const IMAGE: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a",
            "size": 2
        },
        "layers": [
            {
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
                "size": 5
            }
        ],
        "annotations": { "org.opencontainers.image.title": "app" }
    }"#;

    const INDEX: &str = r#"{
        "schemaVersion": 2,
        "manifests": [
            {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": "sha256:486ea46224d1bb4fb680f34f7c9ad96a8f24ec88be73ea8e5a6c65260e9cb8a7",
                "size": 512
            }
        ]
    }"#;

    #[test]
    fn parses_image_manifest() {
        let spec = ManifestSpec::try_from(IMAGE.as_bytes()).unwrap();
        assert!(!spec.is_index());
        assert_eq!(spec.schema_version(), 2);
        assert_eq!(
            spec.resolved_media_type().unwrap(),
            "application/vnd.oci.image.manifest.v1+json"
        );
        let config = spec.config().unwrap().unwrap();
        assert_eq!(config.size, 2);
        assert_eq!(spec.layers().unwrap().len(), 1);
        assert!(spec.children().unwrap().is_empty());
        assert!(!spec.has_non_distributable_layers().unwrap());
        assert_eq!(
            spec.annotations().get("org.opencontainers.image.title"),
            Some(&String::from("app"))
        );
        assert!(spec.subject().unwrap().is_none());
    }

    #[test]
    fn parses_index_and_infers_media_type() {
        let spec = ManifestSpec::try_from(INDEX.as_bytes()).unwrap();
        assert!(spec.is_index());
        assert_eq!(spec.media_type(), None);
        assert_eq!(
            spec.resolved_media_type().unwrap(),
            "application/vnd.oci.image.index.v1+json"
        );
        assert!(spec.config().unwrap().is_none());
        let children = spec.children().unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].size, 512);
    }

    #[test]
    fn total_size_counts_payload_and_descriptors() {
        let spec = ManifestSpec::try_from(IMAGE.as_bytes()).unwrap();
        assert_eq!(spec.total_size(100).unwrap(), 107);

        let index = ManifestSpec::try_from(INDEX.as_bytes()).unwrap();
        assert_eq!(index.total_size(10).unwrap(), 522);
    }

    #[test]
    fn total_size_rejects_overflowing_descriptors() {
        let huge = IMAGE.replace("\"size\": 5", &format!("\"size\": {}", i64::MAX));
        let spec = ManifestSpec::try_from(huge.as_bytes()).unwrap();
        let err = spec.total_size(huge.len()).unwrap_err();
        assert!(matches!(err, Error::InvalidManifest(_)));
    }

    #[test]
    fn rejects_garbage() {
        let err = ManifestSpec::try_from(&b"{\"hello\": 1}"[..]).unwrap_err();
        assert!(matches!(err, Error::InvalidManifest(_)));
    }

    #[rstest]
    #[case::tag("latest", Some(ManifestRef::Tag(String::from("latest"))))]
    #[case::underscore_start("_v1.0-rc", Some(ManifestRef::Tag(String::from("_v1.0-rc"))))]
    #[case::digest(
        "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
        Some(ManifestRef::Digest(OciDigest::from_content(b"hello")))
    )]
    #[case::leading_dash("-latest", None)]
    #[case::slash("a/b", None)]
    #[case::empty("", None)]
    fn parse_manifest_ref(#[case] input: &str, #[case] expected: Option<ManifestRef>) {
        let actual: Result<ManifestRef> = input.parse();
        match expected {
            Some(exp) => assert_eq!(exp, actual.unwrap()),
            None => assert!(actual.is_err(), "expected {input:?} to be rejected"),
        }
    }

    #[test]
    fn tag_length_is_bounded() {
        assert!(validate_tag_name(&"a".repeat(128)).is_ok());
        assert!(validate_tag_name(&"a".repeat(129)).is_err());
    }
}
