//! Runtime configuration, read once from the environment at startup.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::storage::{S3Config, StorageConfig};

pub const DEFAULT_MAX_FIRMWARE_BYTES: u64 = 16 * 1024 * 1024;
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid {var}: {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub reason: String,
}

impl ConfigError {
    fn new(var: &'static str, reason: impl Into<String>) -> Self {
        Self {
            var,
            reason: reason.into(),
        }
    }
}

/// What the upload pipeline accepts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadPolicy {
    pub max_size_bytes: u64,
    /// Lowercase extensions without the dot
    pub allowed_extensions: Vec<String>,
    /// When non-empty, content must start with one of these
    pub magic_prefixes: Vec<Vec<u8>>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MAX_FIRMWARE_BYTES,
            allowed_extensions: vec!["bin".to_string()],
            magic_prefixes: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub storage_path: PathBuf,
    pub bind_addr: SocketAddr,
    pub upload: UploadPolicy,
    pub quota_bytes: Option<u64>,
    pub storage: StorageConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let storage_path = var("FW_DEPOT_STORAGE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("fw-depot-storage"));

        let bind_addr = var("FW_DEPOT_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::new("FW_DEPOT_BIND_ADDR", e.to_string()))?;

        let mut upload = UploadPolicy::default();
        if let Some(raw) = var("FW_DEPOT_MAX_FIRMWARE_BYTES") {
            upload.max_size_bytes = parse_bytes("FW_DEPOT_MAX_FIRMWARE_BYTES", &raw)?;
        }
        if let Some(raw) = var("FW_DEPOT_ALLOWED_EXTENSIONS") {
            upload.allowed_extensions = parse_extensions(&raw);
            if upload.allowed_extensions.is_empty() {
                return Err(ConfigError::new(
                    "FW_DEPOT_ALLOWED_EXTENSIONS",
                    "at least one extension is required",
                ));
            }
        }
        if let Some(raw) = var("FW_DEPOT_MAGIC_PREFIXES") {
            upload.magic_prefixes = parse_magic_prefixes(&raw)?;
        }

        let quota_bytes = var("FW_DEPOT_QUOTA_BYTES")
            .map(|raw| parse_bytes("FW_DEPOT_QUOTA_BYTES", &raw))
            .transpose()?;

        let storage = match var("FW_DEPOT_S3_BUCKET") {
            Some(bucket) => {
                let mut s3 = match var("FW_DEPOT_S3_ENDPOINT") {
                    Some(endpoint) => S3Config::minio(bucket, endpoint),
                    None => S3Config::aws(
                        bucket,
                        var("FW_DEPOT_S3_REGION").unwrap_or_else(|| "us-east-1".to_string()),
                    ),
                };
                if let Some(region) = var("FW_DEPOT_S3_REGION") {
                    s3.region = region;
                }
                if let Some(prefix) = var("FW_DEPOT_S3_PREFIX") {
                    s3 = s3.with_prefix(prefix);
                }
                match (var("FW_DEPOT_S3_ACCESS_KEY"), var("FW_DEPOT_S3_SECRET_KEY")) {
                    (Some(access), Some(secret)) => s3 = s3.with_credentials(access, secret),
                    (None, None) => {}
                    _ => {
                        return Err(ConfigError::new(
                            "FW_DEPOT_S3_SECRET_KEY",
                            "access key and secret key must be set together",
                        ))
                    }
                }
                StorageConfig::s3(s3)
            }
            None => StorageConfig::local(storage_path.join("blobs")),
        };

        Ok(Self {
            storage_path,
            bind_addr,
            upload,
            quota_bytes,
            storage,
        })
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.storage_path.join("catalog.db")
    }
}

fn parse_bytes(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    match raw.parse::<u64>() {
        Ok(0) => Err(ConfigError::new(var, "must be greater than zero")),
        Ok(n) => Ok(n),
        Err(e) => Err(ConfigError::new(var, format!("{:?}: {}", raw, e))),
    }
}

fn parse_extensions(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect()
}

fn parse_magic_prefixes(raw: &str) -> Result<Vec<Vec<u8>>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            let p = p.trim_start_matches("0x");
            if p.is_empty() || p.len() % 2 != 0 || !p.is_ascii() {
                return Err(ConfigError::new(
                    "FW_DEPOT_MAGIC_PREFIXES",
                    format!("{:?} is not an even-length hex string", p),
                ));
            }
            (0..p.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(&p[i..i + 2], 16))
                .collect::<Result<Vec<u8>, _>>()
                .map_err(|_| {
                    ConfigError::new("FW_DEPOT_MAGIC_PREFIXES", format!("{:?} is not hex", p))
                })
        })
        .collect()
}
