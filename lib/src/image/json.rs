//! Manifest and container-configuration JSON schemas.
//!
//! Serialization is byte-stable: field order is fixed by declaration
//! order, output is compact, absent fields are omitted, and unknown fields
//! are ignored on parse.  Stability matters because the manifest digest is
//! the digest of these exact bytes.

use serde::{Deserialize, Serialize};

use crate::blob::{BlobDescriptor, DescriptorDigest, DigestError};
use crate::config::TargetFormat;
use crate::image::{Image, ImageBuilder, Layer, LayerPropertyError};

/// Docker schema 1 manifest media type.
pub const DOCKER_TYPE_MANIFEST_V21: &str = "application/vnd.docker.distribution.manifest.v1+json";
/// Docker schema 2 manifest media type.
pub const DOCKER_TYPE_MANIFEST_V22: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker container configuration media type.
pub const DOCKER_TYPE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
/// Docker gzipped layer media type.
pub const DOCKER_TYPE_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
/// Docker manifest list media type (not supported as a pull target).
pub const DOCKER_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// OCI image manifest media type.
pub const OCI_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image configuration media type.
pub const OCI_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
/// OCI gzipped layer media type.
pub const OCI_TYPE_LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
/// OCI image index media type (not supported as a pull target).
pub const OCI_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// A failed Image↔JSON translation.
#[derive(Debug, thiserror::Error)]
pub enum TranslationError {
    /// v2.2 manifest layers and config diff_ids must zip 1:1.
    #[error(
        "manifest has {manifest_layers} layers but config lists {config_diff_ids} diff_ids"
    )]
    LayerCountMismatch {
        /// Number of layer entries in the manifest.
        manifest_layers: usize,
        /// Number of diff_ids in the container configuration.
        config_diff_ids: usize,
    },
    /// The document is not a manifest schema we can build from.
    #[error("unsupported manifest: {0}")]
    UnsupportedManifest(String),
    /// Malformed JSON.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// A layer lacked a property the target schema needs.
    #[error(transparent)]
    LayerProperty(#[from] LayerPropertyError),
    /// An embedded digest failed validation.
    #[error(transparent)]
    Digest(#[from] DigestError),
}

/// Reference to a blob: media type, size, digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobReference {
    /// The blob media type.
    pub media_type: String,
    /// The blob size in bytes.
    pub size: i64,
    /// The blob digest.
    pub digest: DescriptorDigest,
}

/// Docker schema 2 (and OCI) image manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestV22 {
    /// Always 2.
    pub schema_version: u32,
    /// [`DOCKER_TYPE_MANIFEST_V22`] or [`OCI_TYPE_MANIFEST`].
    pub media_type: String,
    /// The container configuration blob.
    pub config: BlobReference,
    /// The layer blobs, oldest first.
    pub layers: Vec<BlobReference>,
}

/// One `fsLayers` element of a schema 1 manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V21FsLayer {
    /// Digest of the compressed layer.
    pub blob_sum: DescriptorDigest,
}

/// One `history` element of a schema 1 manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V21History {
    /// The embedded v1 image JSON, as an opaque string.
    pub v1_compatibility: String,
}

/// Docker schema 1 image manifest.  `fsLayers` is newest-first on the
/// wire; translation reverses it into canonical oldest-first order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestV21 {
    /// Always 1.
    pub schema_version: u32,
    /// Repository name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Tag the manifest was pulled as.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Target architecture.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    /// Layer digests, newest first.
    pub fs_layers: Vec<V21FsLayer>,
    /// Per-layer v1 image JSON, parallel to `fsLayers`.
    #[serde(default)]
    pub history: Vec<V21History>,
}

/// A parsed manifest of either schema.
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestJson {
    /// Schema 1.
    V21(ManifestV21),
    /// Schema 2 / OCI.
    V22(ManifestV22),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SchemaProbe {
    #[serde(default)]
    schema_version: u32,
    #[serde(default)]
    media_type: Option<String>,
}

/// Parse manifest bytes, detecting the schema from `schemaVersion` and
/// `mediaType` before committing to a concrete shape.
pub fn parse_manifest(bytes: &[u8]) -> Result<ManifestJson, TranslationError> {
    let probe: SchemaProbe = serde_json::from_slice(bytes)?;
    if let Some(media_type) = probe.media_type.as_deref() {
        if media_type == DOCKER_TYPE_MANIFEST_LIST || media_type == OCI_TYPE_INDEX {
            return Err(TranslationError::UnsupportedManifest(format!(
                "{media_type} is a manifest list; pull a platform-specific reference"
            )));
        }
    }
    match probe.schema_version {
        1 => Ok(ManifestJson::V21(serde_json::from_slice(bytes)?)),
        2 => Ok(ManifestJson::V22(serde_json::from_slice(bytes)?)),
        v => Err(TranslationError::UnsupportedManifest(format!(
            "unknown schemaVersion {v}"
        ))),
    }
}

/// The `config` object of a container configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecutionConfiguration {
    /// Environment as `K=V` strings, insertion-ordered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    /// The entrypoint command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    /// Exposed ports in the `{"8080/tcp":{}}` object form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<indexmap::IndexMap<String, EmptyObject>>,
}

/// The canonical empty JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmptyObject {}

/// The `rootfs` object of a container configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RootFilesystem {
    /// Always `layers`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Diff-ids of the uncompressed layers, oldest first.
    pub diff_ids: Vec<DescriptorDigest>,
}

/// The container configuration blob referenced by a v2.2 manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfiguration {
    /// Image creation time, RFC 3339.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    /// Target architecture.
    pub architecture: String,
    /// Target operating system.
    pub os: String,
    /// Execution configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ExecutionConfiguration>,
    /// The layer identity list.
    #[serde(default)]
    pub rootfs: RootFilesystem,
    /// Build history; carried opaquely.
    #[serde(default)]
    pub history: Vec<serde_json::Value>,
}

/// Translate a v2.2 manifest plus its container configuration into an
/// [`Image`] of reference layers.
pub fn image_from_v22(
    manifest: &ManifestV22,
    config: &ContainerConfiguration,
) -> Result<Image, TranslationError> {
    if manifest.layers.len() != config.rootfs.diff_ids.len() {
        return Err(TranslationError::LayerCountMismatch {
            manifest_layers: manifest.layers.len(),
            config_diff_ids: config.rootfs.diff_ids.len(),
        });
    }
    let mut builder = Image::builder();
    for (layer, diff_id) in manifest.layers.iter().zip(&config.rootfs.diff_ids) {
        builder.add_layer_dedup(Layer::Reference {
            descriptor: BlobDescriptor::new(layer.size, layer.digest.clone()),
            diff_id: diff_id.clone(),
        });
    }
    apply_execution_config(&mut builder, config);
    Ok(builder.build())
}

/// Translate a v2.1 manifest into an [`Image`] of digest-only layers,
/// reversing `fsLayers` into oldest-first order.
pub fn image_from_v21(manifest: &ManifestV21) -> Result<Image, TranslationError> {
    let mut builder = Image::builder();
    for fs_layer in manifest.fs_layers.iter().rev() {
        builder.add_layer_dedup(Layer::DigestOnly {
            digest: fs_layer.blob_sum.clone(),
        });
    }
    Ok(builder.build())
}

/// Fabricate a container configuration for a v2.1 manifest from the
/// newest `history` entry's embedded v1 JSON.  Fields the entry does not
/// carry default to empty; the rootfs is left empty since schema 1 does
/// not know diff-ids.
pub fn synthetic_configuration_from_v21(manifest: &ManifestV21) -> ContainerConfiguration {
    #[derive(Default, Deserialize)]
    struct V1Compat {
        #[serde(default)]
        architecture: Option<String>,
        #[serde(default)]
        config: Option<ExecutionConfiguration>,
    }
    let v1: V1Compat = manifest
        .history
        .first()
        .and_then(|h| serde_json::from_str(&h.v1_compatibility).ok())
        .unwrap_or_default();
    ContainerConfiguration {
        created: None,
        architecture: v1
            .architecture
            .or_else(|| manifest.architecture.clone())
            .unwrap_or_else(|| "amd64".to_string()),
        os: "linux".to_string(),
        config: v1.config,
        rootfs: RootFilesystem::default(),
        history: Vec::new(),
    }
}

fn apply_execution_config(builder: &mut ImageBuilder, config: &ContainerConfiguration) {
    let Some(exec) = config.config.as_ref() else {
        return;
    };
    for entry in exec.env.iter().flatten() {
        let (name, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
        builder.add_environment_variable(name, value);
    }
    if let Some(entrypoint) = &exec.entrypoint {
        builder.set_entrypoint(entrypoint.clone());
    }
    if let Some(ports) = &exec.exposed_ports {
        builder.set_exposed_ports(ports.keys().cloned().collect());
    }
    if let Some(created) = config
        .created
        .as_deref()
        .and_then(|c| chrono::DateTime::parse_from_rfc3339(c).ok())
    {
        builder.set_created(created.with_timezone(&chrono::Utc));
    }
}

/// Emit the container configuration for a finished image.
pub fn configuration_from_image(image: &Image) -> Result<ContainerConfiguration, TranslationError> {
    let mut diff_ids = Vec::with_capacity(image.layers().len());
    for layer in image.layers() {
        diff_ids.push(layer.diff_id()?.clone());
    }
    let env: Vec<String> = image
        .environment()
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    let exposed_ports: indexmap::IndexMap<String, EmptyObject> = image
        .exposed_ports()
        .iter()
        .map(|p| (p.clone(), EmptyObject {}))
        .collect();
    Ok(ContainerConfiguration {
        created: image.created().map(|t| t.to_rfc3339()),
        architecture: "amd64".to_string(),
        os: "linux".to_string(),
        config: Some(ExecutionConfiguration {
            env: (!env.is_empty()).then_some(env),
            entrypoint: (!image.entrypoint().is_empty())
                .then(|| image.entrypoint().to_vec()),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        }),
        rootfs: RootFilesystem {
            kind: "layers".to_string(),
            diff_ids,
        },
        history: Vec::new(),
    })
}

/// Emit a v2.2 (or OCI) manifest for a finished image, referencing the
/// already-pushed container-configuration blob.
pub fn manifest_from_image(
    image: &Image,
    config_descriptor: &BlobDescriptor,
    format: TargetFormat,
) -> Result<ManifestV22, TranslationError> {
    let (manifest_type, config_type, layer_type) = match format {
        TargetFormat::Oci => (OCI_TYPE_MANIFEST, OCI_TYPE_CONFIG, OCI_TYPE_LAYER),
        _ => (DOCKER_TYPE_MANIFEST_V22, DOCKER_TYPE_CONFIG, DOCKER_TYPE_LAYER),
    };
    let mut layers = Vec::with_capacity(image.layers().len());
    for layer in image.layers() {
        let descriptor = layer.blob_descriptor()?;
        layers.push(BlobReference {
            media_type: layer_type.to_string(),
            size: descriptor.size(),
            digest: descriptor.digest().clone(),
        });
    }
    Ok(ManifestV22 {
        schema_version: 2,
        media_type: manifest_type.to_string(),
        config: BlobReference {
            media_type: config_type.to_string(),
            size: config_descriptor.size(),
            digest: config_descriptor.digest().clone(),
        },
        layers,
    })
}

/// Emit a v2.1 manifest for a finished image.  `history` parallels
/// `fsLayers`; the newest entry embeds a summary of the configuration.
pub fn manifest_v21_from_image(
    image: &Image,
    name: &str,
    tag: &str,
) -> Result<ManifestV21, TranslationError> {
    let configuration = configuration_from_image(image)?;
    let mut fs_layers = Vec::with_capacity(image.layers().len());
    for layer in image.layers().iter().rev() {
        fs_layers.push(V21FsLayer {
            blob_sum: layer.digest().clone(),
        });
    }
    let mut history = vec![V21History {
        v1_compatibility: serde_json::to_string(&serde_json::json!({
            "architecture": &configuration.architecture,
            "config": &configuration.config,
        }))?,
    }];
    history.resize(
        fs_layers.len().max(1),
        V21History {
            v1_compatibility: "{}".to_string(),
        },
    );
    Ok(ManifestV21 {
        schema_version: 1,
        name: Some(name.to_string()),
        tag: Some(tag.to_string()),
        architecture: Some(configuration.architecture),
        fs_layers,
        history,
    })
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    fn hash(byte: u8) -> String {
        format!("{byte:02x}").repeat(32)
    }

    fn digest(byte: u8) -> DescriptorDigest {
        DescriptorDigest::from_hash(&hash(byte)).unwrap()
    }

    fn sample_v22_bytes(layer_count: usize) -> Vec<u8> {
        let layers: Vec<_> = (0..layer_count)
            .map(|i| {
                serde_json::json!({
                    "mediaType": DOCKER_TYPE_LAYER,
                    "size": 100 + i,
                    "digest": format!("sha256:{}", hash(i as u8 + 1)),
                })
            })
            .collect();
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": DOCKER_TYPE_MANIFEST_V22,
            "config": {
                "mediaType": DOCKER_TYPE_CONFIG,
                "size": 7,
                "digest": format!("sha256:{}", hash(0xaa)),
            },
            "layers": layers,
        }))
        .unwrap()
    }

    fn sample_config(diff_id_count: usize) -> ContainerConfiguration {
        ContainerConfiguration {
            created: None,
            architecture: "amd64".into(),
            os: "linux".into(),
            config: Some(ExecutionConfiguration {
                env: Some(vec!["PATH=/usr/bin".into(), "HOME=/root".into()]),
                entrypoint: Some(vec!["java".into(), "-jar".into(), "app.jar".into()]),
                exposed_ports: None,
            }),
            rootfs: RootFilesystem {
                kind: "layers".into(),
                diff_ids: (0..diff_id_count).map(|i| digest(0x10 + i as u8)).collect(),
            },
            history: Vec::new(),
        }
    }

    #[test]
    fn test_probe_dispatch() {
        let v22 = parse_manifest(&sample_v22_bytes(1)).unwrap();
        assert!(matches!(v22, ManifestJson::V22(_)));

        let v21 = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 1,
            "fsLayers": [{"blobSum": format!("sha256:{}", hash(1))}],
            "history": [{"v1Compatibility": "{}"}],
        }))
        .unwrap();
        assert!(matches!(parse_manifest(&v21).unwrap(), ManifestJson::V21(_)));

        let list = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": DOCKER_TYPE_MANIFEST_LIST,
            "manifests": [],
        }))
        .unwrap();
        assert!(matches!(
            parse_manifest(&list),
            Err(TranslationError::UnsupportedManifest(_))
        ));
    }

    #[test]
    fn test_v22_layer_count_mismatch() {
        let ManifestJson::V22(manifest) = parse_manifest(&sample_v22_bytes(2)).unwrap() else {
            unreachable!()
        };
        let err = image_from_v22(&manifest, &sample_config(3)).unwrap_err();
        assert!(matches!(
            err,
            TranslationError::LayerCountMismatch {
                manifest_layers: 2,
                config_diff_ids: 3
            }
        ));
    }

    #[test]
    fn test_v22_translation() {
        let ManifestJson::V22(manifest) = parse_manifest(&sample_v22_bytes(2)).unwrap() else {
            unreachable!()
        };
        let image = image_from_v22(&manifest, &sample_config(2)).unwrap();
        assert_eq!(image.layers().len(), 2);
        assert_eq!(image.layers()[0].digest(), &digest(1));
        assert_eq!(image.layers()[0].diff_id().unwrap(), &digest(0x10));
        assert_eq!(
            image.environment().get("PATH").map(String::as_str),
            Some("/usr/bin")
        );
        assert_eq!(image.entrypoint(), ["java", "-jar", "app.jar"]);
    }

    #[test]
    fn test_v21_reverses_fs_layers() {
        let manifest = ManifestV21 {
            schema_version: 1,
            name: None,
            tag: None,
            architecture: None,
            fs_layers: vec![
                V21FsLayer { blob_sum: digest(3) },
                V21FsLayer { blob_sum: digest(2) },
                V21FsLayer { blob_sum: digest(1) },
            ],
            history: Vec::new(),
        };
        let image = image_from_v21(&manifest).unwrap();
        let digests: Vec<_> = image.layers().iter().map(Layer::digest).collect();
        assert_eq!(digests, [&digest(1), &digest(2), &digest(3)]);
    }

    #[test]
    fn test_v21_synthetic_configuration() {
        let manifest = ManifestV21 {
            schema_version: 1,
            name: None,
            tag: None,
            architecture: Some("amd64".into()),
            fs_layers: vec![V21FsLayer { blob_sum: digest(1) }],
            history: vec![V21History {
                v1_compatibility: r#"{"architecture":"arm64","config":{"Env":["A=1"],"Entrypoint":["/bin/sh"]}}"#
                    .into(),
            }],
        };
        let config = synthetic_configuration_from_v21(&manifest);
        assert_eq!(config.architecture, "arm64");
        let exec = config.config.unwrap();
        assert_eq!(exec.env.unwrap(), ["A=1"]);
        assert_eq!(exec.entrypoint.unwrap(), ["/bin/sh"]);
    }

    #[test]
    fn test_image_roundtrip_through_v22() {
        let mut builder = Image::builder();
        builder
            .add_layer(Layer::Reference {
                descriptor: BlobDescriptor::new(101, digest(1)),
                diff_id: digest(0x11),
            })
            .unwrap()
            .add_layer(Layer::Reference {
                descriptor: BlobDescriptor::new(102, digest(2)),
                diff_id: digest(0x12),
            })
            .unwrap();
        builder
            .add_environment_variable("PATH", "/usr/bin")
            .add_environment_variable("HOME", "/root")
            .set_entrypoint(vec!["java".into(), "Main".into()]);
        let image = builder.build();

        let config = configuration_from_image(&image).unwrap();
        let config_descriptor = BlobDescriptor::new(77, digest(0xaa));
        let manifest = manifest_from_image(&image, &config_descriptor, TargetFormat::V22).unwrap();

        let back = image_from_v22(&manifest, &config).unwrap();
        assert_eq!(back, image);
    }

    #[test]
    fn test_configuration_bytes_are_stable() {
        let config = sample_config(1);
        let expected = indoc! {r#"
            {"architecture":"amd64","os":"linux","config":{"Env":["PATH=/usr/bin","HOME=/root"],"Entrypoint":["java","-jar","app.jar"]},"rootfs":{"type":"layers","diff_ids":["sha256:1010101010101010101010101010101010101010101010101010101010101010"]},"history":[]}"#}
        .trim();
        let first = serde_json::to_string(&config).unwrap();
        let second = serde_json::to_string(&config).unwrap();
        assert_eq!(first, second);
        similar_asserts::assert_eq!(first, expected);
    }

    #[test]
    fn test_manifest_bytes_shape() {
        let mut builder = Image::builder();
        builder
            .add_layer(Layer::Reference {
                descriptor: BlobDescriptor::new(101, digest(1)),
                diff_id: digest(0x11),
            })
            .unwrap();
        let image = builder.build();
        let manifest =
            manifest_from_image(&image, &BlobDescriptor::new(7, digest(0xaa)), TargetFormat::V22)
                .unwrap();
        let json = serde_json::to_string(&manifest).unwrap();
        let expected = format!(
            r#"{{"schemaVersion":2,"mediaType":"{DOCKER_TYPE_MANIFEST_V22}","config":{{"mediaType":"{DOCKER_TYPE_CONFIG}","size":7,"digest":"sha256:{}"}},"layers":[{{"mediaType":"{DOCKER_TYPE_LAYER}","size":101,"digest":"sha256:{}"}}]}}"#,
            hash(0xaa),
            hash(1),
        );
        similar_asserts::assert_eq!(json, expected);
    }

    #[test]
    fn test_v21_emission_parallel_history() {
        let mut builder = Image::builder();
        builder
            .add_layer(Layer::Reference {
                descriptor: BlobDescriptor::new(101, digest(1)),
                diff_id: digest(0x11),
            })
            .unwrap()
            .add_layer(Layer::Reference {
                descriptor: BlobDescriptor::new(102, digest(2)),
                diff_id: digest(0x12),
            })
            .unwrap();
        let image = builder.build();
        let manifest = manifest_v21_from_image(&image, "library/app", "latest").unwrap();
        assert_eq!(manifest.fs_layers.len(), 2);
        assert_eq!(manifest.history.len(), 2);
        // Newest layer first on the wire
        assert_eq!(manifest.fs_layers[0].blob_sum, digest(2));
        assert_eq!(manifest.fs_layers[1].blob_sum, digest(1));
    }
}
