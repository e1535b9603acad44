//! Gateway configuration from the process environment, with `.env` support.
//!
//! [`load_and_apply`] feeds a project `.env` into the environment for keys
//! that are not already set, so the real environment always wins (an operator
//! exporting `ENCRYPTION_MASTER_KEY` is never overridden by a checked-in
//! file). [`Settings::from_env`] then reads the typed gateway settings. In
//! production mode a missing `ENCRYPTION_MASTER_KEY` is a fatal configuration
//! error; in development the caller falls back to an ephemeral key with a
//! logged warning.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors loading configuration. `MissingMasterKey` is fatal in production.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("read .env: {0}")]
    EnvFileRead(std::io::Error),
    #[error("ENCRYPTION_MASTER_KEY is required in production mode")]
    MissingMasterKey,
    #[error("invalid {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Runtime mode, from `WEFT_ENV`. Defaults to development.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    Production,
    #[default]
    Development,
}

impl Mode {
    fn from_env() -> Self {
        match std::env::var("WEFT_ENV").as_deref() {
            Ok("production") | Ok("prod") => Mode::Production,
            _ => Mode::Development,
        }
    }
}

/// Typed gateway settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: Mode,
    /// Bind address for the HTTP server (`WEFT_ADDR`).
    pub addr: String,
    /// SQLite database path (`WEFT_DB`).
    pub db_path: PathBuf,
    /// Bound on concurrent store operations (`WEFT_DB_POOL`).
    pub db_pool_size: usize,
    /// Tenant-context cache capacity (`WEFT_CACHE_CAPACITY`).
    pub cache_capacity: usize,
    /// Master encryption key (`ENCRYPTION_MASTER_KEY`); `None` only outside
    /// production.
    pub master_key: Option<String>,
    /// Version stamped on new ciphertexts (`ENCRYPTION_KEY_VERSION`).
    pub key_version: u32,
    /// Provider fallback credentials.
    pub openai_api_key: Option<String>,
    pub azure_api_key: Option<String>,
    pub ollama_base_url: Option<String>,
    /// JWT secrets for the delegated portal/admin surfaces; the core only
    /// carries them through.
    pub portal_jwt_secret: Option<String>,
    pub admin_jwt_secret: Option<String>,
}

impl Settings {
    /// Reads settings from the current process environment.
    ///
    /// # Errors
    ///
    /// [`SettingsError::MissingMasterKey`] in production without a key;
    /// [`SettingsError::Invalid`] for unparseable numeric variables.
    pub fn from_env() -> Result<Self, SettingsError> {
        let mode = Mode::from_env();
        let master_key = non_empty_var("ENCRYPTION_MASTER_KEY");
        if mode == Mode::Production && master_key.is_none() {
            return Err(SettingsError::MissingMasterKey);
        }
        Ok(Settings {
            mode,
            addr: non_empty_var("WEFT_ADDR").unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            db_path: non_empty_var("WEFT_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("weft.db")),
            db_pool_size: parse_var("WEFT_DB_POOL", 10)?,
            cache_capacity: parse_var("WEFT_CACHE_CAPACITY", 1000)?,
            master_key,
            key_version: parse_var("ENCRYPTION_KEY_VERSION", 1)?,
            openai_api_key: non_empty_var("OPENAI_API_KEY"),
            azure_api_key: non_empty_var("AZURE_OPENAI_API_KEY"),
            ollama_base_url: non_empty_var("OLLAMA_BASE_URL"),
            portal_jwt_secret: non_empty_var("PORTAL_JWT_SECRET"),
            admin_jwt_secret: non_empty_var("ADMIN_JWT_SECRET"),
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(
    name: &'static str,
    default: T,
) -> Result<T, SettingsError> {
    match non_empty_var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| SettingsError::Invalid { name, value: raw }),
        None => Ok(default),
    }
}

/// Applies a project `.env` to the process environment and returns how many
/// variables were set. Keys already present in the environment are left
/// alone, so the environment always wins over the file.
///
/// * `override_dir`: if `Some`, look for `.env` there instead of the current
///   directory.
///
/// A missing `.env` applies nothing; only a file that exists but cannot be
/// read is an error.
pub fn load_and_apply(override_dir: Option<&Path>) -> Result<usize, SettingsError> {
    let Some(dir) = override_dir
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())
    else {
        return Ok(0);
    };
    let path = dir.join(".env");
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(SettingsError::EnvFileRead(e)),
    };

    let mut applied = 0;
    for line in content.lines() {
        let Some((key, value)) = parse_assignment(line) else {
            continue;
        };
        if std::env::var_os(key).is_none() {
            std::env::set_var(key, value);
            applied += 1;
        }
    }
    Ok(applied)
}

/// Reads one `.env` line as `KEY=VALUE` (an optional `export ` prefix is
/// accepted, since operators often reuse a shell-sourced file).
///
/// Keys must look like environment variable names (`WEFT_DB`,
/// `ENCRYPTION_MASTER_KEY`): ASCII letters, digits, and underscores, not
/// starting with a digit. Anything else — blank lines, `#` comments, stray
/// prose — is skipped rather than treated as an error, so a half-commented
/// file still applies its valid assignments.
fn parse_assignment(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    let line = line
        .strip_prefix("export ")
        .map(str::trim_start)
        .unwrap_or(line);
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (key, value) = line.split_once('=')?;
    let key = key.trim_end();
    let valid = !key.is_empty()
        && !key.starts_with(|c: char| c.is_ascii_digit())
        && key
            .bytes()
            .all(|b| b == b'_' || b.is_ascii_alphanumeric());
    if !valid {
        return None;
    }
    Some((key, unquote(value.trim())))
}

/// Strips one matching pair of surrounding quotes (double or single). No
/// escape processing: secrets like base64 master keys are taken literally,
/// which is exactly what `ENCRYPTION_MASTER_KEY="x9+…="` needs.
fn unquote(raw: &str) -> &str {
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &raw[1..raw.len() - 1];
        }
    }
    raw
}
