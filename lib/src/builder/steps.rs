//! The individual pipeline steps.
//!
//! Each step is an async fn producing one value; the orchestrator in the
//! parent module wires them together.  Steps time themselves and log at
//! debug level; errors carry the step name as context.

use std::io;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use tracing::debug;

use crate::blob::{Blob, BlobDescriptor, DescriptorDigest};
use crate::cache::{Cache, LayerKind};
use crate::config::{BuildConfiguration, TargetFormat};
use crate::credentials;
use crate::image::json::{self, ContainerConfiguration, ManifestJson};
use crate::image::{CachedLayer, Image, Layer};
use crate::registry::auth::Authorization;
use crate::registry::{RegistryClient, UploadSource};
use crate::tar::TarStreamBuilder;
use crate::timing::Timer;

/// The pulled base image: layers as references (or digest-only for v2.1)
/// plus its container configuration (synthetic for v2.1).
#[derive(Debug)]
pub(crate) struct BaseImage {
    pub(crate) image: Image,
    pub(crate) configuration: ContainerConfiguration,
}

/// Resolve a credential for `registry`, yielding the `Authorization` to
/// present.  `None` means anonymous access.
#[context("Authenticating against {registry}")]
pub(crate) async fn authenticate(
    registry: &str,
    helper: Option<&str>,
) -> Result<Option<Authorization>> {
    let _timer = Timer::start(format!("authenticate.{registry}"));
    let credential = credentials::retrieve_credential(registry, helper).await?;
    Ok(credential.map(|c| c.to_authorization()))
}

/// Pull and translate the base image manifest.  For v2.2 the container
/// configuration is fetched as an extra blob; for v2.1 it is fabricated
/// from the manifest's history.
#[context("Pulling base manifest")]
pub(crate) async fn pull_base_manifest(
    client: &RegistryClient,
    reference: &str,
) -> Result<BaseImage> {
    let _timer = Timer::start("pull-base-manifest");
    let (manifest, _raw) = client.pull_manifest(reference).await?;
    match manifest {
        ManifestJson::V22(manifest) => {
            let config_bytes = client.pull_blob_bytes(&manifest.config.digest).await?;
            let configuration: ContainerConfiguration = serde_json::from_slice(&config_bytes)
                .context("Parsing base container configuration")?;
            let image = json::image_from_v22(&manifest, &configuration)?;
            Ok(BaseImage {
                image,
                configuration,
            })
        }
        ManifestJson::V21(manifest) => {
            let image = json::image_from_v21(&manifest)?;
            let configuration = json::synthetic_configuration_from_v21(&manifest);
            Ok(BaseImage {
                image,
                configuration,
            })
        }
    }
}

/// Fetch one base layer into the shared cache, unless it is already
/// there.
#[context("Pulling base layer {digest}")]
pub(crate) async fn pull_and_cache_base_layer(
    client: &RegistryClient,
    cache: &Cache,
    digest: &DescriptorDigest,
) -> Result<CachedLayer> {
    let _timer = Timer::start(format!("pull-base-layer.{}", &digest.hash()[..12]));
    let lookup = {
        let cache = cache.clone();
        let digest = digest.clone();
        tokio::task::spawn_blocking(move || cache.get_layer(&digest))
            .await
            .context("Cache lookup task")??
    };
    if let Some(layer) = lookup {
        debug!(%digest, "base layer cache hit");
        return Ok(layer);
    }

    // Download next to the cache so the final rename stays on one filesystem
    let temp = tempfile::NamedTempFile::new_in(cache.root())?;
    let temp_path = Utf8PathBuf::from_path_buf(temp.path().to_path_buf())
        .map_err(|p| anyhow::anyhow!("Non UTF-8 temp path {}", p.display()))?;
    client.pull_blob(digest, &temp_path).await?;

    let layer = {
        let cache = cache.clone();
        tokio::task::spawn_blocking(move || {
            let layer = cache.write_compressed(LayerKind::Base, Blob::File(temp_path))?;
            // Hold `temp` until the cache has copied it in
            drop(temp);
            Ok::<_, anyhow::Error>(layer)
        })
        .await
        .context("Cache write task")??
    };
    Ok(layer)
}

/// Build one application layer from its source directory, reusing the
/// cached one when the source fingerprint is unchanged.
#[context("Building {} layer", kind.as_str())]
pub(crate) async fn build_and_cache_application_layer(
    cache: Cache,
    kind: LayerKind,
    source_dir: Utf8PathBuf,
    target_prefix: &'static str,
) -> Result<CachedLayer> {
    let _timer = Timer::start(format!("build-layer.{}", kind.as_str()));
    tokio::task::spawn_blocking(move || {
        let sources = vec![source_dir.clone()];
        if !cache.are_source_files_modified(kind, &sources)? {
            if let Some(layer) = cache.get_layer_for_sources(kind, &sources)? {
                debug!(kind = kind.as_str(), "application layer cache hit");
                return Ok(layer);
            }
        }
        let mut builder = TarStreamBuilder::new();
        builder.add_directory_contents(&source_dir, Utf8Path::new(target_prefix))?;
        let layer = cache.write_uncompressed(kind, &sources, builder.to_blob())?;
        Ok(layer)
    })
    .await
    .context("Layer build task")?
}

/// Push one cached layer blob, skipping bytes the registry already has
/// and attempting a cross-repo mount when `mount_from` names a repository
/// on the same registry.
#[context("Pushing layer {}", layer.descriptor().digest())]
pub(crate) async fn check_and_push_blob(
    client: &RegistryClient,
    layer: &CachedLayer,
    mount_from: Option<&str>,
) -> Result<()> {
    let digest = layer.descriptor().digest();
    let _timer = Timer::start(format!("push-blob.{}", &digest.hash()[..12]));
    let source = UploadSource::File(layer.content_file().to_owned());
    client.push_blob(digest, source, mount_from).await?;
    Ok(())
}

/// Assemble the final image: base layers in pulled order, application
/// layers in dependencies→resources→classes order, configuration merged
/// over the base image's environment.
#[context("Assembling image")]
pub(crate) fn build_image(
    config: &BuildConfiguration,
    base: &BaseImage,
    base_layers: &[CachedLayer],
    app_layers: &[CachedLayer],
) -> Result<Image> {
    let _timer = Timer::start("build-image");
    let mut builder = Image::builder();
    for layer in base_layers.iter().chain(app_layers) {
        builder.add_layer_dedup(Layer::Cached(layer.clone()));
    }
    // Base environment first; the build configuration overrides
    if let Some(exec) = &base.configuration.config {
        for entry in exec.env.iter().flatten() {
            let (name, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
            builder.add_environment_variable(name, value);
        }
    }
    for (name, value) in &config.environment {
        builder.add_environment_variable(name, value);
    }
    builder.set_entrypoint(config.effective_entrypoint());
    builder.set_exposed_ports(config.normalized_ports()?);
    Ok(builder.build())
}

/// Serialize and push the container configuration, returning its
/// descriptor for the manifest.
#[context("Pushing container configuration")]
pub(crate) async fn push_container_configuration(
    client: &RegistryClient,
    image: &Image,
) -> Result<BlobDescriptor> {
    let _timer = Timer::start("push-container-configuration");
    let configuration = json::configuration_from_image(image)?;
    let bytes = serde_json::to_vec(&configuration)?;
    let descriptor = Blob::Bytes(bytes.clone()).write_to(io::sink())?;
    client
        .push_blob(descriptor.digest(), UploadSource::Bytes(bytes.into()), None)
        .await?;
    Ok(descriptor)
}

/// Serialize and push the manifest in the configured schema.  Returns the
/// manifest digest (the digest of the exact pushed bytes).
#[context("Pushing manifest")]
pub(crate) async fn push_manifest(
    client: &RegistryClient,
    image: &Image,
    config_descriptor: &BlobDescriptor,
    config: &BuildConfiguration,
) -> Result<DescriptorDigest> {
    let _timer = Timer::start("push-manifest");
    let (bytes, media_type) = match config.target_format {
        TargetFormat::V21 => {
            let manifest = json::manifest_v21_from_image(
                image,
                &config.target_image.repository,
                &config.target_image.reference,
            )?;
            (
                serde_json::to_vec(&manifest)?,
                json::DOCKER_TYPE_MANIFEST_V21.to_string(),
            )
        }
        format => {
            let manifest = json::manifest_from_image(image, config_descriptor, format)?;
            let media_type = manifest.media_type.clone();
            (serde_json::to_vec(&manifest)?, media_type)
        }
    };
    let descriptor = Blob::Bytes(bytes.clone()).write_to(io::sink())?;
    client
        .push_manifest(bytes, &media_type, &config.target_image.reference)
        .await?;
    Ok(descriptor.digest().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::json::{ExecutionConfiguration, RootFilesystem};

    fn digest(byte: u8) -> DescriptorDigest {
        DescriptorDigest::from_hash(&format!("{byte:02x}").repeat(32)).unwrap()
    }

    fn cached(byte: u8) -> CachedLayer {
        CachedLayer::new(
            format!("/cache/{:02x}.tar.gz", byte),
            BlobDescriptor::new(100 + byte as i64, digest(byte)),
            digest(byte ^ 0xff),
        )
    }

    fn configuration() -> BuildConfiguration {
        BuildConfiguration {
            base_image: "gcr.io/distroless/java".try_into().unwrap(),
            target_image: "localhost:5000/app:dev".try_into().unwrap(),
            credential_helper: None,
            main_class: Some("com.example.Main".into()),
            jvm_flags: Vec::new(),
            environment: vec![("HOME".into(), "/app".into())],
            entrypoint: None,
            exposed_ports: vec!["8080".into()],
            dependencies_dir: None,
            resources_dir: None,
            classes_dir: None,
            application_cache_dir: "/tmp/cache".into(),
            base_cache_dir: None,
            allow_insecure_registries: false,
            target_format: TargetFormat::V22,
        }
    }

    fn base_image() -> BaseImage {
        BaseImage {
            image: Image::builder().build(),
            configuration: ContainerConfiguration {
                created: None,
                architecture: "amd64".into(),
                os: "linux".into(),
                config: Some(ExecutionConfiguration {
                    env: Some(vec!["PATH=/usr/bin".into(), "HOME=/root".into()]),
                    entrypoint: None,
                    exposed_ports: None,
                }),
                rootfs: RootFilesystem::default(),
                history: Vec::new(),
            },
        }
    }

    #[test]
    fn test_build_image_ordering_and_env() {
        let config = configuration();
        let base_layers = [cached(1), cached(2)];
        let app_layers = [cached(0x10), cached(0x11), cached(0x12)];
        let image = build_image(&config, &base_image(), &base_layers, &app_layers).unwrap();

        let digests: Vec<_> = image.layers().iter().map(Layer::digest).collect();
        assert_eq!(
            digests,
            [
                &digest(1),
                &digest(2),
                &digest(0x10),
                &digest(0x11),
                &digest(0x12)
            ]
        );

        // Base env is inherited, build config wins on conflict
        assert_eq!(
            image.environment().get("PATH").map(String::as_str),
            Some("/usr/bin")
        );
        assert_eq!(
            image.environment().get("HOME").map(String::as_str),
            Some("/app")
        );
        assert_eq!(image.exposed_ports(), ["8080/tcp"]);
        assert_eq!(image.entrypoint()[0], "java");
    }

    #[test]
    fn test_build_image_collapses_duplicate_layers() {
        let config = configuration();
        // The same digest arriving as both a base and an app layer
        let image =
            build_image(&config, &base_image(), &[cached(1)], &[cached(1), cached(2)]).unwrap();
        assert_eq!(image.layers().len(), 2);
    }

    #[tokio::test]
    async fn test_application_layer_caching() {
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = Cache::init(
            Utf8Path::from_path(cache_dir.path()).unwrap(),
        )
        .unwrap();

        let source = tempfile::tempdir().unwrap();
        let source_dir = Utf8Path::from_path(source.path()).unwrap().to_owned();
        std::fs::write(source_dir.join("Main.class"), b"bytecode").unwrap();

        let first = build_and_cache_application_layer(
            cache.clone(),
            LayerKind::Classes,
            source_dir.clone(),
            crate::config::APP_CLASSES_PATH,
        )
        .await
        .unwrap();

        // Unchanged sources come back from the cache with the same file
        let second = build_and_cache_application_layer(
            cache.clone(),
            LayerKind::Classes,
            source_dir.clone(),
            crate::config::APP_CLASSES_PATH,
        )
        .await
        .unwrap();
        assert_eq!(first, second);

        // Changing a source rebuilds under a different digest
        std::fs::write(source_dir.join("Main.class"), b"new bytecode").unwrap();
        let third = build_and_cache_application_layer(
            cache,
            LayerKind::Classes,
            source_dir,
            crate::config::APP_CLASSES_PATH,
        )
        .await
        .unwrap();
        assert_ne!(first.descriptor().digest(), third.descriptor().digest());
    }
}
