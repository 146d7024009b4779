//! The in-memory image model.
//!
//! An [`Image`] is an ordered sequence of layers plus the execution
//! configuration (environment, entrypoint, exposed ports).  Layer order is
//! build order; it is preserved into the serialized manifest and container
//! configuration.  Images are assembled through [`ImageBuilder`] and frozen
//! from then on.

use std::collections::HashSet;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use thiserror::Error;

use crate::blob::{Blob, BlobDescriptor, DescriptorDigest};

pub mod json;

/// Access to a field a layer variant does not carry.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("layer {digest} does not carry {property}")]
pub struct LayerPropertyError {
    /// Compressed digest of the offending layer.
    pub digest: DescriptorDigest,
    /// Name of the missing property.
    pub property: &'static str,
}

/// A layer fully present in the local cache: its compressed tar.gz on
/// disk, the descriptor of that file, and the diff-id of the uncompressed
/// content.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedLayer {
    content_file: Utf8PathBuf,
    descriptor: BlobDescriptor,
    diff_id: DescriptorDigest,
}

impl CachedLayer {
    /// Describe a cached layer file.
    pub fn new(
        content_file: impl Into<Utf8PathBuf>,
        descriptor: BlobDescriptor,
        diff_id: DescriptorDigest,
    ) -> Self {
        Self {
            content_file: content_file.into(),
            descriptor,
            diff_id,
        }
    }

    /// Path of the compressed layer file.
    pub fn content_file(&self) -> &Utf8Path {
        &self.content_file
    }

    /// Descriptor of the compressed layer file.
    pub fn descriptor(&self) -> &BlobDescriptor {
        &self.descriptor
    }

    /// Digest of the uncompressed content.
    pub fn diff_id(&self) -> &DescriptorDigest {
        &self.diff_id
    }
}

/// One filesystem delta of an image.
///
/// Variants differ in which properties they carry; accessing an absent
/// property fails with [`LayerPropertyError`].
#[derive(Debug, Clone, PartialEq)]
pub enum Layer {
    /// Descriptor and diff-id known, no local bytes (v2.2 base manifests).
    Reference {
        /// Descriptor of the compressed blob.
        descriptor: BlobDescriptor,
        /// Digest of the uncompressed content.
        diff_id: DescriptorDigest,
    },
    /// Only the compressed digest is known (v2.1 base manifests).
    DigestOnly {
        /// Digest of the compressed blob.
        digest: DescriptorDigest,
    },
    /// Backed by a file in the local cache.
    Cached(CachedLayer),
}

impl Layer {
    /// The compressed-blob digest.  Every variant carries this.
    pub fn digest(&self) -> &DescriptorDigest {
        match self {
            Layer::Reference { descriptor, .. } => descriptor.digest(),
            Layer::DigestOnly { digest } => digest,
            Layer::Cached(cached) => cached.descriptor().digest(),
        }
    }

    /// The descriptor (size + digest) of the compressed blob.
    pub fn blob_descriptor(&self) -> Result<&BlobDescriptor, LayerPropertyError> {
        match self {
            Layer::Reference { descriptor, .. } => Ok(descriptor),
            Layer::Cached(cached) => Ok(cached.descriptor()),
            Layer::DigestOnly { .. } => Err(self.missing("blob descriptor")),
        }
    }

    /// The digest of the uncompressed content.
    pub fn diff_id(&self) -> Result<&DescriptorDigest, LayerPropertyError> {
        match self {
            Layer::Reference { diff_id, .. } => Ok(diff_id),
            Layer::Cached(cached) => Ok(cached.diff_id()),
            Layer::DigestOnly { .. } => Err(self.missing("diff id")),
        }
    }

    /// A blob over the compressed content, for variants that have bytes.
    pub fn content_blob(&self) -> Result<Blob, LayerPropertyError> {
        match self {
            Layer::Cached(cached) => Ok(Blob::File(cached.content_file().to_owned())),
            _ => Err(self.missing("content blob")),
        }
    }

    fn missing(&self, property: &'static str) -> LayerPropertyError {
        LayerPropertyError {
            digest: self.digest().clone(),
            property,
        }
    }
}

/// An invalid image construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageError {
    /// The same compressed digest was added twice.
    #[error("duplicate layer {0}")]
    DuplicateLayer(DescriptorDigest),
}

/// A frozen image: layers in build order plus execution configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    layers: Vec<Layer>,
    environment: IndexMap<String, String>,
    entrypoint: Vec<String>,
    exposed_ports: Vec<String>,
    created: Option<DateTime<Utc>>,
}

impl Image {
    /// Start building an image.
    pub fn builder() -> ImageBuilder {
        ImageBuilder::default()
    }

    /// Layers in build order.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Environment in insertion order.
    pub fn environment(&self) -> &IndexMap<String, String> {
        &self.environment
    }

    /// The container entrypoint.
    pub fn entrypoint(&self) -> &[String] {
        &self.entrypoint
    }

    /// Exposed ports in `<port>/<protocol>` form.
    pub fn exposed_ports(&self) -> &[String] {
        &self.exposed_ports
    }

    /// The image creation time, if set.
    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.created
    }
}

/// Mutable accumulator for [`Image`].
#[derive(Debug, Default)]
pub struct ImageBuilder {
    layers: Vec<Layer>,
    seen_digests: HashSet<DescriptorDigest>,
    environment: IndexMap<String, String>,
    entrypoint: Vec<String>,
    exposed_ports: Vec<String>,
    created: Option<DateTime<Utc>>,
}

impl ImageBuilder {
    /// Append a layer.  Rejects a compressed digest that is already present.
    pub fn add_layer(&mut self, layer: Layer) -> Result<&mut Self, ImageError> {
        if !self.seen_digests.insert(layer.digest().clone()) {
            return Err(ImageError::DuplicateLayer(layer.digest().clone()));
        }
        self.layers.push(layer);
        Ok(self)
    }

    /// Append a layer, silently skipping an already-present digest.
    ///
    /// Base images in the wild repeat the digest of the empty layer; when
    /// translating a pulled manifest those repeats collapse to one layer.
    pub fn add_layer_dedup(&mut self, layer: Layer) -> &mut Self {
        if self.seen_digests.insert(layer.digest().clone()) {
            self.layers.push(layer);
        }
        self
    }

    /// Set one environment variable, preserving insertion order.
    pub fn add_environment_variable(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.environment.insert(name.into(), value.into());
        self
    }

    /// Merge a whole environment map.
    pub fn add_environment(&mut self, env: impl IntoIterator<Item = (String, String)>) -> &mut Self {
        self.environment.extend(env);
        self
    }

    /// Set the entrypoint.
    pub fn set_entrypoint(&mut self, entrypoint: Vec<String>) -> &mut Self {
        self.entrypoint = entrypoint;
        self
    }

    /// Set the exposed ports.
    pub fn set_exposed_ports(&mut self, ports: Vec<String>) -> &mut Self {
        self.exposed_ports = ports;
        self
    }

    /// Set the creation time.
    pub fn set_created(&mut self, created: DateTime<Utc>) -> &mut Self {
        self.created = Some(created);
        self
    }

    /// Freeze into an [`Image`].
    pub fn build(self) -> Image {
        Image {
            layers: self.layers,
            environment: self.environment,
            entrypoint: self.entrypoint,
            exposed_ports: self.exposed_ports,
            created: self.created,
        }
    }
}
