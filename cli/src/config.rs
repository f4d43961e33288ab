use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const REMOTE_URL_ENV: &str = "BUZZ_REMOTE_URL";
pub const API_KEY_ENV: &str = "BUZZ_API_KEY";

/// Contents of `config.toml`. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Log filter, e.g. `info` or `buzz_core=debug`.
    pub log: Option<String>,
    pub remote: RemoteConfig,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub user: Option<String>,
}

pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    pub log: Option<String>,
    pub remote: RemoteConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "buzz").context("Could not determine home directory")?;

        let data_dir = proj_dirs.data_dir().to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let config_path = proj_dirs.config_dir().join("config.toml");
        let mut file = read_file_config(&config_path)?;
        apply_env_overrides(&mut file.remote, |name| std::env::var(name).ok());

        Ok(Config {
            db_path: data_dir.join("buzz.db"),
            data_dir,
            log: file.log,
            remote: file.remote,
        })
    }

    /// Load the API key from disk, or generate a new one.
    ///
    /// Returns `(key, newly_created)`.
    pub fn load_or_create_api_key(&self) -> Result<(String, bool)> {
        use rand::Rng;
        use std::fmt::Write;

        let path = self.data_dir.join("api_key");

        if path.exists() {
            let key = std::fs::read_to_string(&path).context("Failed to read API key file")?;
            let key = key.trim().to_string();
            if !key.is_empty() {
                return Ok((key, false));
            }
        }

        let bytes: [u8; 32] = rand::rng().random();
        let key = bytes
            .iter()
            .fold(String::with_capacity(64), |mut acc: String, b| {
                let _ = write!(acc, "{b:02x}");
                acc
            });
        std::fs::write(&path, &key).context("Failed to write API key file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to set API key file permissions")?;
        }
        eprintln!("Generated new API key: {key}");
        eprintln!("Sync clients need it as remote.api_key or {API_KEY_ENV}");
        Ok((key, true))
    }
}

/// A missing file is an empty config; a malformed one is an error.
pub fn read_file_config(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Invalid config: {}", path.display()))
}

pub fn apply_env_overrides(remote: &mut RemoteConfig, var: impl Fn(&str) -> Option<String>) {
    let set = |name: &str| var(name).filter(|v| !v.trim().is_empty());
    if let Some(url) = set(REMOTE_URL_ENV) {
        remote.url = Some(url);
    }
    if let Some(key) = set(API_KEY_ENV) {
        remote.api_key = Some(key);
    }
}
