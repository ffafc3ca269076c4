use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::{event, Level};

use crate::domain::DomainStrategy;
use crate::image::{ImageRefError, ImageReference};
use crate::plan::{ComputeSettings, WorkerInputs};
use crate::secrets::{BcryptHash, SecretBundle, SecretError, SecretValue};

pub const ENV_PREFIX: &str = "BUILDWORKER_";
pub const LOCAL_CONFIG_FILE: &str = "buildworker.toml";

/// Secret keys, read from the environment as plain strings instead of being
/// parsed as values.
const VERBATIM_ENV_KEYS: &[&str] = &[
    "registry.username",
    "registry.password",
    "auth.password_hash",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Figment(#[from] figment::Error),

    #[error("no container image configured (`container_image`)")]
    MissingContainerImage,

    #[error("invalid container image: {0}")]
    InvalidContainerImage(#[from] ImageRefError),

    #[error("no authentication password hash configured (`auth.password_hash`)")]
    MissingAuthHash,

    #[error("invalid authentication password hash: {0}")]
    InvalidAuthHash(#[from] SecretError),

    #[error("managed DNS zone requires a non-empty `domain.{0}`")]
    IncompleteManagedZone(&'static str),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BuildWorkerConfig {
    pub container_image: Option<String>,
    pub registry: RegistryConfig,
    pub auth: AuthConfig,
    pub domain: DomainStrategy,
    pub compute: ComputeSettings,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub username: Option<SecretValue>,
    pub password: Option<SecretValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub password_hash: Option<String>,
}

/// Layered configuration sources.
///
/// An explicit `path` replaces the file lookup. Otherwise the first
/// `buildworker/config.toml` in the XDG configuration directories is used,
/// overlaid by `buildworker.toml` in the working directory. Environment
/// variables (`BUILDWORKER_DOMAIN__STRATEGY=managed_zone`) go on top.
pub fn sources(path: Option<&Path>) -> Figment {
    let mut figment = Figment::new();

    match path {
        Some(path) => {
            if !path.exists() {
                event!(
                    Level::WARN,
                    "Specified configuration file '{}' does not exist",
                    path.display()
                );
            }
            figment = figment.merge(Toml::file(path));
        }
        None => {
            let xdg_file = xdg::BaseDirectories::with_prefix("buildworker")
                .ok()
                .and_then(|dirs| dirs.find_config_file("config.toml"));
            if let Some(ref xdg_file) = xdg_file {
                event!(Level::DEBUG, path = %xdg_file.display(), "Using XDG configuration file");
                figment = figment.merge(Toml::file(xdg_file));
            }
            figment = figment.merge(Toml::file(LOCAL_CONFIG_FILE));
        }
    }

    merge_env(figment, |name| std::env::var(name).ok())
}

/// Environment variable holding the configuration key `key`.
fn env_var_name(key: &str) -> String {
    format!("{ENV_PREFIX}{}", key.replace('.', "__").to_uppercase())
}

fn merge_env(mut figment: Figment, var: impl Fn(&str) -> Option<String>) -> Figment {
    figment = figment.merge(
        Env::prefixed(ENV_PREFIX)
            .split("__")
            .ignore(VERBATIM_ENV_KEYS),
    );
    for key in VERBATIM_ENV_KEYS {
        if let Some(value) = var(&env_var_name(key)) {
            figment = figment.merge(Serialized::default(key, value));
        }
    }
    figment
}

pub fn load_config(path: Option<&Path>) -> Result<BuildWorkerConfig, ConfigError> {
    Ok(sources(path).extract()?)
}

impl BuildWorkerConfig {
    /// Validate the configuration and turn it into planner inputs.
    ///
    /// Fails before anything is provisioned if the container image or the
    /// authentication hash is missing or malformed.
    pub fn into_inputs(self) -> Result<WorkerInputs, ConfigError> {
        let container_image = self
            .container_image
            .filter(|image| !image.trim().is_empty())
            .ok_or(ConfigError::MissingContainerImage)
            .and_then(|image| Ok(ImageReference::parse(image)?))?;

        let auth_password_hash = match self.auth.password_hash {
            Some(hash) if !hash.trim().is_empty() => BcryptHash::parse(hash)?,
            _ => return Err(ConfigError::MissingAuthHash),
        };

        if let DomainStrategy::ManagedZone {
            hostname,
            zone_name,
            zone_resource_group,
        } = &self.domain
        {
            if zone_name.trim().is_empty() {
                return Err(ConfigError::IncompleteManagedZone("zone_name"));
            }
            if zone_resource_group.trim().is_empty() {
                return Err(ConfigError::IncompleteManagedZone("zone_resource_group"));
            }
            if hostname.as_deref().is_some_and(|h| h.trim().is_empty()) {
                return Err(ConfigError::IncompleteManagedZone("hostname"));
            }
        }

        let secrets = SecretBundle::new(auth_password_hash)
            .with_registry_credentials(self.registry.username, self.registry.password);

        Ok(WorkerInputs {
            container_image,
            secrets,
            domain: self.domain,
            compute: self.compute,
            location: self.location,
        })
    }
}
