//! Command line interface.

use std::time::Duration;

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;

use crate::builder;
use crate::config::{BuildConfiguration, ImageReference, TargetFormat};

/// Top level options.
#[derive(Debug, Parser)]
#[clap(
    name = "mizzen",
    version,
    about = "Build and push container images without a daemon"
)]
pub(crate) enum Opt {
    /// Build an image from application artifacts and push it.
    Build(BuildOpts),
}

#[derive(Debug, clap::Args)]
pub(crate) struct BuildOpts {
    /// Base image reference, e.g. `gcr.io/distroless/java`
    #[clap(long, value_parser = parse_reference)]
    from: ImageReference,

    /// Target image reference, e.g. `localhost:5000/my-app:latest`
    #[clap(long, value_parser = parse_reference)]
    to: ImageReference,

    /// Use `docker-credential-<NAME>` for registry credentials
    #[clap(long, value_name = "NAME")]
    credential_helper: Option<String>,

    /// Main class for the default entrypoint
    #[clap(long)]
    main_class: Option<String>,

    /// JVM flag for the default entrypoint (repeatable)
    #[clap(long = "jvm-flag", value_name = "FLAG")]
    jvm_flags: Vec<String>,

    /// Environment variable as KEY=VALUE (repeatable, order preserved)
    #[clap(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    environment: Vec<(String, String)>,

    /// Explicit entrypoint element (repeatable); overrides --main-class
    #[clap(long = "entrypoint", value_name = "ARG")]
    entrypoint: Vec<String>,

    /// Port to expose, e.g. `8080` or `53/udp` (repeatable)
    #[clap(long = "port", value_name = "PORT")]
    exposed_ports: Vec<String>,

    /// Directory of dependency archives
    #[clap(long, value_name = "DIR")]
    dependencies: Option<Utf8PathBuf>,

    /// Directory of resources
    #[clap(long, value_name = "DIR")]
    resources: Option<Utf8PathBuf>,

    /// Directory of compiled classes
    #[clap(long, value_name = "DIR")]
    classes: Option<Utf8PathBuf>,

    /// Per-project cache for application layers
    #[clap(long, value_name = "DIR", default_value = ".mizzen-cache")]
    application_cache: Utf8PathBuf,

    /// Shared cache for base layers (defaults to the user cache dir)
    #[clap(long, value_name = "DIR")]
    base_cache: Option<Utf8PathBuf>,

    /// Fall back to plain HTTP if an HTTPS connection fails
    #[clap(long)]
    allow_insecure_registries: bool,

    /// Manifest schema to push
    #[clap(long, value_enum, default_value_t)]
    format: TargetFormat,

    /// Overall build deadline in seconds
    #[clap(long, value_name = "SECONDS")]
    deadline: Option<u64>,
}

fn parse_reference(value: &str) -> Result<ImageReference> {
    ImageReference::try_from(value)
}

fn parse_env(value: &str) -> Result<(String, String)> {
    let (key, val) = value
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Expected KEY=VALUE, got {value}"))?;
    Ok((key.to_string(), val.to_string()))
}

impl BuildOpts {
    fn into_configuration(self) -> (BuildConfiguration, Option<Duration>) {
        let deadline = self.deadline.map(Duration::from_secs);
        let config = BuildConfiguration {
            base_image: self.from,
            target_image: self.to,
            credential_helper: self.credential_helper,
            main_class: self.main_class,
            jvm_flags: self.jvm_flags,
            environment: self.environment,
            entrypoint: (!self.entrypoint.is_empty()).then_some(self.entrypoint),
            exposed_ports: self.exposed_ports,
            dependencies_dir: self.dependencies,
            resources_dir: self.resources,
            classes_dir: self.classes,
            application_cache_dir: self.application_cache,
            base_cache_dir: self.base_cache,
            allow_insecure_registries: self.allow_insecure_registries,
            target_format: self.format,
        };
        (config, deadline)
    }
}

/// Parse the command line and run the selected command.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<std::ffi::OsString> + Clone,
{
    match Opt::parse_from(args) {
        Opt::Build(opts) => {
            let (config, deadline) = opts.into_configuration();
            let result = builder::build_with_deadline(&config, deadline).await?;
            println!(
                "Pushed {} ({} layers)",
                result.target, result.layer_count
            );
            println!("Manifest digest: {}", result.manifest_digest);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_options_parse() {
        let opt = Opt::try_parse_from([
            "mizzen",
            "build",
            "--from",
            "gcr.io/distroless/java",
            "--to",
            "localhost:5000/app:dev",
            "--main-class",
            "com.example.Main",
            "--classes",
            "build/classes",
            "--env",
            "A=1",
            "--env",
            "B=2",
            "--port",
            "8080",
            "--format",
            "oci",
        ])
        .unwrap();
        let Opt::Build(opts) = opt;
        let (config, deadline) = opts.into_configuration();
        assert_eq!(config.base_image.registry, "gcr.io");
        assert_eq!(config.target_image.reference, "dev");
        assert_eq!(config.environment, [("A".into(), "1".into()), ("B".into(), "2".into())]);
        assert_eq!(config.target_format, TargetFormat::Oci);
        assert!(config.entrypoint.is_none());
        assert_eq!(deadline, None);
    }

    #[test]
    fn test_rejects_malformed_env() {
        assert!(Opt::try_parse_from([
            "mizzen",
            "build",
            "--from",
            "a",
            "--to",
            "b",
            "--env",
            "NOEQUALS",
        ])
        .is_err());
    }
}
