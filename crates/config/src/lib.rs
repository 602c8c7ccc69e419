pub mod credentials;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const APP_NAME: &str = "ar-einvoice";
const KEYCHAIN_SERVICE: &str = "ar.einvoice.credentials";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub issuer: IssuerConfig,
    #[serde(default)]
    pub certificate: CertificateConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Production endpoints when true, homologation otherwise.
    #[serde(default)]
    pub production: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssuerConfig {
    #[serde(default)]
    pub cuit: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertificateConfig {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ticket_dir")]
    pub ticket_dir: PathBuf,
    #[serde(default = "default_safety_margin_secs")]
    pub safety_margin_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ticket_dir: default_ticket_dir(),
            safety_margin_secs: default_safety_margin_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_path")]
    pub path: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: default_audit_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_signer_binary")]
    pub signer_binary: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            signer_binary: default_signer_binary(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: String, // "mock" | "afip"
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
        }
    }
}

fn default_ticket_dir() -> PathBuf {
    PathBuf::from(".einv_tickets")
}

fn default_safety_margin_secs() -> u64 {
    3600
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".einv_store")
}

fn default_audit_path() -> PathBuf {
    PathBuf::from("audit.jsonl")
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_signer_binary() -> String {
    "openssl".to_string()
}

fn default_provider_kind() -> String {
    "mock".to_string()
}

pub fn load() -> Result<AppConfig> {
    let cfg: AppConfig = confy::load(APP_NAME, None).context("Failed to load app config")?;
    Ok(cfg)
}

pub fn store(cfg: &AppConfig) -> Result<()> {
    confy::store(APP_NAME, None, cfg).context("Failed to store app config")?;
    Ok(())
}

pub fn config_path() -> Result<PathBuf> {
    confy::get_configuration_file_path(APP_NAME, None)
        .context("Failed to resolve app config path")
}

/// Store a secret in the OS keychain
pub fn store_secret(key: &str, value: &str) -> Result<()> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)?;
    entry.set_password(value)?;
    Ok(())
}

/// Retrieve a secret from the OS keychain
pub fn get_secret(key: &str) -> Result<String> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)?;
    let password = entry.get_password()?;
    Ok(password)
}

/// Delete a secret from the OS keychain
pub fn delete_secret(key: &str) -> Result<()> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)?;
    entry.delete_password()?;
    Ok(())
}

/// Reads a secret from the environment first, then from the OS keychain.
pub fn lookup_secret(env_var: &str, keychain_key: &str) -> Option<String> {
    std::env::var(env_var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| get_secret(keychain_key).ok())
}
