//! Registry credentials.
//!
//! Resolution order per registry: an explicitly configured
//! `docker-credential-<name>` helper, then the Docker config file (a
//! static `auths` entry or a per-registry `credHelpers` mapping), then
//! anonymous.  A helper reporting "credentials not found" is the
//! anonymous case, not an error.

use std::collections::HashMap;
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use camino::Utf8PathBuf;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::registry::auth::Authorization;

/// The username a credential helper reports when the secret is an
/// identity token rather than a password.
pub const TOKEN_USERNAME: &str = "<token>";

/// Marker a helper prints when it has nothing for the server.
const CREDENTIALS_NOT_FOUND: &str = "credentials not found";

/// A username/secret pair for one registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// The username, or [`TOKEN_USERNAME`].
    pub username: String,
    /// The password or identity token.
    pub secret: String,
}

impl Credential {
    /// Whether the secret is an identity token.
    pub fn is_identity_token(&self) -> bool {
        self.username == TOKEN_USERNAME
    }

    /// The `Authorization` to present to the registry.
    pub fn to_authorization(&self) -> Authorization {
        Authorization::basic(&self.username, &self.secret)
    }
}

/// Resolve a credential for `registry`.
pub async fn retrieve_credential(
    registry: &str,
    helper: Option<&str>,
) -> Result<Option<Credential>> {
    if let Some(helper) = helper {
        if let Some(credential) = from_helper(helper, registry).await? {
            return Ok(Some(credential));
        }
    }
    match lookup_docker_config(registry)? {
        Some(DockerConfigEntry::Credential(credential)) => Ok(Some(credential)),
        Some(DockerConfigEntry::Helper(helper)) => from_helper(&helper, registry).await,
        None => {
            debug!(registry, "no credential found, proceeding anonymously");
            Ok(None)
        }
    }
}

/// Run `docker-credential-<name> get` with the registry URL on stdin.
pub async fn from_helper(name: &str, server_url: &str) -> Result<Option<Credential>> {
    let executable = format!("docker-credential-{name}");
    let mut child = Command::new(&executable)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Spawning {executable}"))?;
    let mut stdin = child.stdin.take().context("helper stdin was not piped")?;
    stdin.write_all(server_url.as_bytes()).await?;
    drop(stdin);

    let output = child.wait_with_output().await?;
    if output.status.success() {
        let credential = parse_helper_output(&output.stdout)
            .with_context(|| format!("Parsing {executable} output"))?;
        debug!(helper = name, registry = server_url, "helper returned a credential");
        return Ok(Some(credential));
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    if stderr.contains(CREDENTIALS_NOT_FOUND) || stdout.contains(CREDENTIALS_NOT_FOUND) {
        debug!(helper = name, registry = server_url, "helper has no credential");
        Ok(None)
    } else {
        Err(anyhow!("{executable} failed: {}\n{stderr}", output.status))
    }
}

fn parse_helper_output(stdout: &[u8]) -> Result<Credential> {
    #[derive(Deserialize)]
    struct HelperOutput {
        #[serde(rename = "Username")]
        username: String,
        #[serde(rename = "Secret")]
        secret: String,
    }
    let output: HelperOutput = serde_json::from_slice(stdout)?;
    Ok(Credential {
        username: output.username,
        secret: output.secret,
    })
}

/// What the Docker config file knows about a registry.
#[derive(Debug, PartialEq, Eq)]
pub enum DockerConfigEntry {
    /// A static credential from `auths`.
    Credential(Credential),
    /// The name of a helper from `credHelpers`.
    Helper(String),
}

/// Look `registry` up in `$DOCKER_CONFIG/config.json` or
/// `~/.docker/config.json`.
pub fn lookup_docker_config(registry: &str) -> Result<Option<DockerConfigEntry>> {
    let Some(path) = docker_config_path() else {
        return Ok(None);
    };
    let contents = match std::fs::read(path.as_std_path()) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
    };
    parse_docker_config(&contents, registry).with_context(|| format!("Parsing {path}"))
}

fn docker_config_path() -> Option<Utf8PathBuf> {
    if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
        return Some(Utf8PathBuf::from(dir).join("config.json"));
    }
    let home = dirs::home_dir()?;
    let home = Utf8PathBuf::from_path_buf(home).ok()?;
    Some(home.join(".docker").join("config.json"))
}

fn parse_docker_config(contents: &[u8], registry: &str) -> Result<Option<DockerConfigEntry>> {
    #[derive(Default, Deserialize)]
    struct AuthEntry {
        #[serde(default)]
        auth: Option<String>,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    }
    #[derive(Default, Deserialize)]
    struct DockerConfig {
        #[serde(default)]
        auths: HashMap<String, AuthEntry>,
        #[serde(default, rename = "credHelpers")]
        cred_helpers: HashMap<String, String>,
    }

    let config: DockerConfig = serde_json::from_slice(contents)?;
    for key in registry_aliases(registry) {
        if let Some(helper) = config.cred_helpers.get(&key) {
            return Ok(Some(DockerConfigEntry::Helper(helper.clone())));
        }
        let Some(entry) = config.auths.get(&key) else {
            continue;
        };
        if let Some(auth) = entry.auth.as_deref() {
            let decoded = BASE64.decode(auth).context("Decoding auths entry")?;
            let decoded = String::from_utf8(decoded).context("Decoding auths entry")?;
            if let Some((username, secret)) = decoded.split_once(':') {
                return Ok(Some(DockerConfigEntry::Credential(Credential {
                    username: username.to_string(),
                    secret: secret.to_string(),
                })));
            }
        }
        if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
            return Ok(Some(DockerConfigEntry::Credential(Credential {
                username: username.clone(),
                secret: password.clone(),
            })));
        }
    }
    Ok(None)
}

/// The key spellings under which a registry may appear in the config file.
fn registry_aliases(registry: &str) -> Vec<String> {
    let mut aliases = vec![registry.to_string(), format!("https://{registry}")];
    if registry == "registry-1.docker.io" || registry == "index.docker.io" {
        aliases.push("https://index.docker.io/v1/".to_string());
        aliases.push("index.docker.io".to_string());
        aliases.push("docker.io".to_string());
    }
    aliases
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_helper_output() {
        let credential =
            parse_helper_output(br#"{"Username":"user","Secret":"hunter2"}"#).unwrap();
        assert_eq!(credential.username, "user");
        assert_eq!(credential.secret, "hunter2");
        assert!(!credential.is_identity_token());

        let token =
            parse_helper_output(br#"{"Username":"<token>","Secret":"identity"}"#).unwrap();
        assert!(token.is_identity_token());

        assert!(parse_helper_output(b"not json").is_err());
    }

    #[test]
    fn test_parse_docker_config_auth() {
        // base64("user:pass")
        let config = br#"{"auths":{"registry.example.com":{"auth":"dXNlcjpwYXNz"}}}"#;
        let entry = parse_docker_config(config, "registry.example.com")
            .unwrap()
            .unwrap();
        assert_eq!(
            entry,
            DockerConfigEntry::Credential(Credential {
                username: "user".into(),
                secret: "pass".into(),
            })
        );
        assert!(parse_docker_config(config, "other.example.com")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_parse_docker_config_helper() {
        let config = br#"{"credHelpers":{"gcr.io":"gcloud"}}"#;
        let entry = parse_docker_config(config, "gcr.io").unwrap().unwrap();
        assert_eq!(entry, DockerConfigEntry::Helper("gcloud".into()));
    }

    #[test]
    fn test_docker_hub_aliases() {
        let config = br#"{"auths":{"https://index.docker.io/v1/":{"auth":"dXNlcjpwYXNz"}}}"#;
        let entry = parse_docker_config(config, "registry-1.docker.io")
            .unwrap()
            .unwrap();
        assert!(matches!(entry, DockerConfigEntry::Credential(_)));
    }
}
