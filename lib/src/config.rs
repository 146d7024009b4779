//! Build configuration: image references and the options a build runs with.

use anyhow::{anyhow, bail, Result};
use camino::Utf8PathBuf;

/// Docker Hub's actual registry host, substituted for its aliases.
pub const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";

/// In-archive root for the dependency layer.
pub const APP_LIBS_PATH: &str = "/app/libs";
/// In-archive root for the resources layer.
pub const APP_RESOURCES_PATH: &str = "/app/resources";
/// In-archive root for the classes layer.
pub const APP_CLASSES_PATH: &str = "/app/classes";

/// A `registry/repository:tag` (or `@digest`) reference.
///
/// ```rust
/// use std::convert::TryInto;
/// let r: mizzen_lib::config::ImageReference = "gcr.io/distroless/java:11".try_into().unwrap();
/// assert_eq!(r.registry, "gcr.io");
/// assert_eq!(r.repository, "distroless/java");
/// assert_eq!(r.reference, "11");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// The registry host (and optional port).
    pub registry: String,
    /// The repository within the registry.
    pub repository: String,
    /// A tag, or a `sha256:…` digest.
    pub reference: String,
}

impl TryFrom<&str> for ImageReference {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self> {
        if value.is_empty() {
            bail!("Empty image reference");
        }
        let (name, reference) = if let Some((name, digest)) = value.split_once('@') {
            (name, digest.to_string())
        } else {
            // A ':' introduces a tag only when it comes after the last '/'
            match value.rfind(':') {
                Some(i) if i > value.rfind('/').unwrap_or(0) => {
                    (&value[..i], value[i + 1..].to_string())
                }
                _ => (value, "latest".to_string()),
            }
        };
        if reference.is_empty() {
            bail!("Empty tag in {}", value);
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DOCKER_HUB_REGISTRY.to_string(), name.to_string()),
        };
        let registry = match registry.as_str() {
            "docker.io" | "index.docker.io" => DOCKER_HUB_REGISTRY.to_string(),
            _ => registry,
        };
        if repository.is_empty() {
            bail!("Empty repository in {}", value);
        }
        // Docker Hub implies the `library/` namespace for bare names
        let repository = if registry == DOCKER_HUB_REGISTRY && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };
        Ok(Self {
            registry,
            repository,
            reference,
        })
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let separator = if self.reference.starts_with("sha256:") {
            '@'
        } else {
            ':'
        };
        write!(
            f,
            "{}/{}{}{}",
            self.registry, self.repository, separator, self.reference
        )
    }
}

/// Which manifest schema to push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TargetFormat {
    /// Docker manifest schema 2.
    #[default]
    V22,
    /// OCI image manifest.
    Oci,
    /// Docker manifest schema 1.
    V21,
}

/// Everything one build needs to know.
#[derive(Debug, Clone)]
pub struct BuildConfiguration {
    /// The base image to build on.
    pub base_image: ImageReference,
    /// Where to push the result.
    pub target_image: ImageReference,
    /// `docker-credential-<name>` to consult for both registries.
    pub credential_helper: Option<String>,
    /// Main class for the default entrypoint.
    pub main_class: Option<String>,
    /// JVM flags for the default entrypoint.
    pub jvm_flags: Vec<String>,
    /// Environment variables, in order.
    pub environment: Vec<(String, String)>,
    /// Explicit entrypoint; overrides the computed one.
    pub entrypoint: Option<Vec<String>>,
    /// Ports to expose, e.g. `8080` or `53/udp`.
    pub exposed_ports: Vec<String>,
    /// Directory of dependency archives.
    pub dependencies_dir: Option<Utf8PathBuf>,
    /// Directory of resources.
    pub resources_dir: Option<Utf8PathBuf>,
    /// Directory of compiled classes.
    pub classes_dir: Option<Utf8PathBuf>,
    /// Per-project cache for application layers.
    pub application_cache_dir: Utf8PathBuf,
    /// Shared cache for base layers; defaults to the user cache dir.
    pub base_cache_dir: Option<Utf8PathBuf>,
    /// Fall back to HTTP after an HTTPS connection failure.
    pub allow_insecure_registries: bool,
    /// Which manifest schema to push.
    pub target_format: TargetFormat,
}

impl BuildConfiguration {
    /// Fail-fast validation, run before the pipeline starts.
    pub fn validate(&self) -> Result<()> {
        if self.main_class.is_none() && self.entrypoint.is_none() {
            bail!("Either a main class or an explicit entrypoint is required");
        }
        let sources = [
            ("dependencies", &self.dependencies_dir),
            ("resources", &self.resources_dir),
            ("classes", &self.classes_dir),
        ];
        if sources.iter().all(|(_, dir)| dir.is_none()) {
            bail!("No layer sources configured");
        }
        for (kind, dir) in sources {
            if let Some(dir) = dir {
                if !dir.is_dir() {
                    bail!("The {kind} directory {dir} does not exist");
                }
            }
        }
        for port in &self.exposed_ports {
            normalize_port(port)?;
        }
        Ok(())
    }

    /// The entrypoint to bake into the image: the explicit one, or
    /// `java [flags…] -cp <classpath> <main class>`.
    pub fn effective_entrypoint(&self) -> Vec<String> {
        if let Some(entrypoint) = &self.entrypoint {
            return entrypoint.clone();
        }
        let classpath = format!("{APP_LIBS_PATH}/*:{APP_RESOURCES_PATH}:{APP_CLASSES_PATH}");
        let mut command = vec!["java".to_string()];
        command.extend(self.jvm_flags.iter().cloned());
        command.push("-cp".to_string());
        command.push(classpath);
        // validate() guarantees a main class when there is no entrypoint
        command.extend(self.main_class.iter().cloned());
        command
    }

    /// Exposed ports in normalized `<port>/<protocol>` form.
    pub fn normalized_ports(&self) -> Result<Vec<String>> {
        self.exposed_ports.iter().map(|p| normalize_port(p)).collect()
    }

    /// The shared base-layer cache location.
    pub fn base_cache_dir(&self) -> Result<Utf8PathBuf> {
        if let Some(dir) = &self.base_cache_dir {
            return Ok(dir.clone());
        }
        let dir = dirs::cache_dir()
            .ok_or_else(|| anyhow!("No user cache directory; set an explicit base cache dir"))?;
        let dir = Utf8PathBuf::from_path_buf(dir)
            .map_err(|p| anyhow!("Non UTF-8 cache directory {}", p.display()))?;
        Ok(dir.join("mizzen").join("base"))
    }
}

fn normalize_port(port: &str) -> Result<String> {
    let (number, protocol) = match port.split_once('/') {
        Some((number, protocol)) => (number, protocol),
        None => (port, "tcp"),
    };
    if !matches!(protocol, "tcp" | "udp") {
        bail!("Invalid port protocol in {}", port);
    }
    let number: u16 = number
        .parse()
        .map_err(|_| anyhow!("Invalid port number in {}", port))?;
    Ok(format!("{number}/{protocol}"))
}
