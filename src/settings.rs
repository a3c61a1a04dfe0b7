use std::{
    env,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use clap::Parser;
use config::{builder::DefaultState, ConfigBuilder, ConfigError, File};
use serde::{Deserialize, Serialize};

const DEFAULT_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_CREDENTIALS: &str = "service-account.json";
pub(crate) const DEFAULT_ENDPOINT: &str = "https://analyticsdata.googleapis.com/v1beta";

const PROPERTY_ID_VAR: &str = "GA4_PROPERTY_ID";
const CREDENTIALS_VAR: &str = "GA4_CREDENTIALS";

#[derive(Parser, Debug)]
#[command(version)]
pub struct Args {
    /// Path to the local configuration TOML file.
    #[arg(short, value_name = "CONFIG_PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Web {
    #[serde(deserialize_with = "deserialize_socket_addr")]
    pub address: SocketAddr,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Analytics {
    /// Numeric GA4 property id, or a full `properties/{id}` resource name.
    pub property_id: String,
    /// Service-account key file, relative to the working directory.
    pub credentials: PathBuf,
    pub endpoint: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Settings {
    pub web: Web,
    pub analytics: Analytics,
}

/// Values read from the process environment that take precedence over the
/// configuration file.
#[derive(Debug, Default)]
pub struct EnvOverrides {
    pub property_id: Option<String>,
    pub credentials: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            property_id: env::var(PROPERTY_ID_VAR).ok(),
            credentials: env::var(CREDENTIALS_VAR).ok(),
        }
    }
}

impl Settings {
    /// Load settings from the optional TOML file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::from_sources(path, EnvOverrides::from_env())
    }

    /// Layers defaults, the TOML file (if any) and environment overrides.
    pub fn from_sources(path: Option<&Path>, env: EnvOverrides) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::<DefaultState>::default()
            .set_default("web.address", DEFAULT_ADDR)?
            .set_default("analytics.credentials", DEFAULT_CREDENTIALS)?
            .set_default("analytics.endpoint", DEFAULT_ENDPOINT)?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let cfg = builder
            .set_override_option("analytics.property_id", env.property_id)?
            .set_override_option("analytics.credentials", env.credentials)?
            .build()?;

        cfg.try_deserialize()
    }
}

fn deserialize_socket_addr<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}
