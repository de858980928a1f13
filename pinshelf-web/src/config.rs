//! Configuration loading
//!
//! Settings resolve in priority order: command-line argument, environment
//! variable, TOML config file, OS-dependent compiled default. Object-store
//! credentials are never read from the config file; the AWS SDK's default
//! provider chain picks them up from the environment.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use pinshelf_common::{Error, Result};

/// Command-line surface
#[derive(Debug, Parser, Default)]
#[command(name = "pinshelf-web", about = "Self-hosted image gallery service")]
pub struct Cli {
    /// Folder holding the database (and other local state)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Address to listen on, e.g. 127.0.0.1:5730
    #[arg(long)]
    pub bind: Option<String>,

    /// Path to a TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Resolved service settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub database_path: PathBuf,
    pub object_store: ObjectStoreSettings,
}

#[derive(Debug, Clone)]
pub struct ObjectStoreSettings {
    pub bucket: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
    /// Base URL the stored objects are publicly served from
    pub public_base_url: String,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    data_dir: Option<String>,
    bind: Option<String>,
    #[serde(default)]
    object_store: ObjectStoreFile,
}

#[derive(Debug, Default, Deserialize)]
struct ObjectStoreFile {
    bucket: Option<String>,
    region: Option<String>,
    endpoint_url: Option<String>,
    force_path_style: Option<bool>,
    public_base_url: Option<String>,
}

const DEFAULT_BIND: &str = "127.0.0.1:5730";

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn load_config_file(cli: &Cli) -> Result<ConfigFile> {
    let path = match &cli.config {
        Some(path) => Some(path.clone()),
        None => dirs::config_dir()
            .map(|dir| dir.join("pinshelf").join("config.toml"))
            .filter(|path| path.exists()),
    };

    let Some(path) = path else {
        return Ok(ConfigFile::default());
    };

    let content = std::fs::read_to_string(&path)
        .map_err(|e| Error::Config(format!("Cannot read config file {}: {e}", path.display())))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Cannot parse config file {}: {e}", path.display())))
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("pinshelf"))
        .unwrap_or_else(|| PathBuf::from("./pinshelf_data"))
}

/// Resolve the full service configuration.
pub fn load_settings(cli: &Cli) -> Result<Settings> {
    let file = load_config_file(cli)?;

    let data_dir = cli
        .data_dir
        .clone()
        .or_else(|| env_string("PINSHELF_DATA_DIR").map(PathBuf::from))
        .or_else(|| file.data_dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(default_data_dir);

    let bind_addr = cli
        .bind
        .clone()
        .or_else(|| env_string("PINSHELF_BIND"))
        .or(file.bind)
        .unwrap_or_else(|| DEFAULT_BIND.to_string());

    let bucket = env_string("PINSHELF_S3_BUCKET")
        .or(file.object_store.bucket)
        .ok_or_else(|| Error::Config("Object store bucket is not configured".to_string()))?;

    let public_base_url = env_string("PINSHELF_PUBLIC_BASE_URL")
        .or(file.object_store.public_base_url)
        .ok_or_else(|| Error::Config("Public base URL is not configured".to_string()))?;

    let region = env_string("PINSHELF_S3_REGION")
        .or(file.object_store.region)
        .unwrap_or_else(|| "auto".to_string());

    let endpoint_url = env_string("PINSHELF_S3_ENDPOINT").or(file.object_store.endpoint_url);

    let force_path_style = match env_string("PINSHELF_S3_FORCE_PATH_STYLE") {
        Some(value) => matches!(value.as_str(), "1" | "true" | "yes"),
        None => file.object_store.force_path_style.unwrap_or(true),
    };

    Ok(Settings {
        bind_addr,
        database_path: data_dir.join("pinshelf.db"),
        object_store: ObjectStoreSettings {
            bucket,
            region,
            endpoint_url,
            force_path_style,
            public_base_url,
        },
    })
}
