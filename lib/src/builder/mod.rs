//! The build pipeline.
//!
//! A build is a small dataflow graph; every step starts as soon as its
//! inputs exist:
//!
//! ```text
//! authenticate(base) ──► pull base manifest ──► pull+cache base layer × N ─┐
//! authenticate(target) ───────────────────────► push blob (per layer)  ◄───┤
//! build+cache app layer × {deps,resources,classes} ──► push blob ◄─────────┘
//!                     │
//!                     └─► build image ──► push container config ──► push manifest
//! ```
//!
//! Application layers never wait on the registry: their tasks are spawned
//! before any network I/O.  The first failing step drains the graph — the
//! joined sibling futures are dropped (cancelling in-flight requests) and
//! detached tasks finish on their own with their results ignored.  The
//! manifest push runs strictly after every blob push has succeeded.

use anyhow::{Context, Result};
use fn_error_context::context;
use tracing::{debug, info, instrument};

use crate::blob::DescriptorDigest;
use crate::cache::{Cache, LayerKind};
use crate::config::{
    BuildConfiguration, APP_CLASSES_PATH, APP_LIBS_PATH, APP_RESOURCES_PATH,
};
use crate::image::CachedLayer;
use crate::registry::RegistryClient;
use crate::timing::Timer;

mod steps;

/// What a successful build produced.
#[derive(Debug)]
pub struct BuildResult {
    /// The pushed reference, e.g. `localhost:5000/app:latest`.
    pub target: String,
    /// Digest of the pushed manifest bytes.
    pub manifest_digest: DescriptorDigest,
    /// Number of layers in the pushed image.
    pub layer_count: usize,
}

/// Run a full build: pull the base image (through the shared cache),
/// build the application layers (through the project cache), push every
/// blob the registry is missing, and push the manifest.
#[context("Building {}", config.target_image)]
#[instrument(skip_all, fields(target = %config.target_image))]
pub async fn build(config: &BuildConfiguration) -> Result<BuildResult> {
    config.validate()?;
    let timer = Timer::start("build");

    let base_cache = Cache::init(&config.base_cache_dir()?)?;
    let app_cache = Cache::init(&config.application_cache_dir)?;

    // Application layers depend only on local sources; start them before
    // any registry work.
    let app_inputs = [
        (LayerKind::Dependencies, &config.dependencies_dir, APP_LIBS_PATH),
        (LayerKind::Resources, &config.resources_dir, APP_RESOURCES_PATH),
        (LayerKind::Classes, &config.classes_dir, APP_CLASSES_PATH),
    ];
    let app_tasks: Vec<_> = app_inputs
        .into_iter()
        .filter_map(|(kind, dir, prefix)| {
            let dir = dir.as_ref()?;
            Some(tokio::spawn(steps::build_and_cache_application_layer(
                app_cache.clone(),
                kind,
                dir.clone(),
                prefix,
            )))
        })
        .collect();

    // Both credential lookups run concurrently.
    let helper = config.credential_helper.as_deref();
    let (pull_authorization, push_authorization) = tokio::try_join!(
        steps::authenticate(&config.base_image.registry, helper),
        steps::authenticate(&config.target_image.registry, helper),
    )?;

    let base_client = RegistryClient::for_pull(
        config.base_image.registry.clone(),
        config.base_image.repository.clone(),
    )
    .with_credential(pull_authorization)
    .with_allow_insecure(config.allow_insecure_registries);
    let target_client = RegistryClient::for_push(
        config.target_image.registry.clone(),
        config.target_image.repository.clone(),
    )
    .with_credential(push_authorization)
    .with_allow_insecure(config.allow_insecure_registries);

    let base = steps::pull_base_manifest(&base_client, &config.base_image.reference).await?;
    debug!(layers = base.image.layers().len(), "base image resolved");

    // Blobs already present in the base repository on the same registry
    // can be cross-repo mounted instead of uploaded.
    let mount_from = (config.base_image.registry == config.target_image.registry)
        .then_some(config.base_image.repository.as_str());

    // Per layer: pull (or hit the cache), then push; base and application
    // layers proceed independently, joined only at image assembly.
    let base_layer_work = futures_util::future::try_join_all(
        base.image.layers().iter().map(|layer| {
            let digest = layer.digest().clone();
            let base_client = &base_client;
            let target_client = &target_client;
            let base_cache = &base_cache;
            async move {
                let cached =
                    steps::pull_and_cache_base_layer(base_client, base_cache, &digest).await?;
                steps::check_and_push_blob(target_client, &cached, mount_from).await?;
                Ok::<_, anyhow::Error>(cached)
            }
        }),
    );
    let app_layer_work = futures_util::future::try_join_all(
        app_tasks.into_iter().map(|task| {
            let target_client = &target_client;
            async move {
                let cached = task.await.context("Application layer task")??;
                steps::check_and_push_blob(target_client, &cached, None).await?;
                Ok::<_, anyhow::Error>(cached)
            }
        }),
    );
    let (base_layers, app_layers): (Vec<CachedLayer>, Vec<CachedLayer>) =
        tokio::try_join!(base_layer_work, app_layer_work)?;

    let image = steps::build_image(config, &base, &base_layers, &app_layers)?;
    let config_descriptor = steps::push_container_configuration(&target_client, &image).await?;
    let manifest_digest =
        steps::push_manifest(&target_client, &image, &config_descriptor, config).await?;

    drop(timer);
    info!(
        target = %config.target_image,
        manifest = %manifest_digest,
        "build complete"
    );
    Ok(BuildResult {
        target: config.target_image.to_string(),
        manifest_digest,
        layer_count: image.layers().len(),
    })
}

/// [`build`] under a global deadline.  On expiry, in-flight steps are
/// dropped (cancelling their I/O) and partially written cache temp files
/// are cleaned up by their guards.
pub async fn build_with_deadline(
    config: &BuildConfiguration,
    deadline: Option<std::time::Duration>,
) -> Result<BuildResult> {
    match deadline {
        Some(deadline) => tokio::time::timeout(deadline, build(config))
            .await
            .map_err(|_| anyhow::anyhow!("Build deadline of {}s exceeded", deadline.as_secs()))?,
        None => build(config).await,
    }
}
