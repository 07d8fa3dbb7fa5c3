use std::path::PathBuf;

use anyhow::Result;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "devex.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Default destination directory for export jobs.
    pub export_directory: PathBuf,
    /// Use the simulated device bus instead of native discovery.
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            export_directory: dirs_fallback(),
            simulation: false,
            verbose: false,
            json_logs: false,
        }
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .map(|home| home.join("devex-exports"))
        .unwrap_or_else(|| PathBuf::from("devex-exports"))
}

impl AppConfig {
    /// Layered config: defaults, then `devex.toml`, then `DEVEX_*` env vars,
    /// then CLI overrides.
    pub fn load<T: Serialize>(cli: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed("DEVEX_"));

        if let Some(cli) = cli {
            figment = figment.merge(Serialized::defaults(cli));
        }

        Ok(figment.extract()?)
    }
}
