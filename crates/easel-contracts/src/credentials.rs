use std::env;
use std::path::PathBuf;

use serde_json::Value;

pub const DEFAULT_API_BASE: &str = "https://api.easel.dev";

/// Read-only provider credentials, resolved once per process and never
/// mutated during a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub api_base: String,
}

impl Credentials {
    /// Environment first (`EASEL_API_KEY` / `EASEL_API_BASE`), then the
    /// local credentials file. `None` when no key is configured.
    pub fn resolve() -> Option<Self> {
        let file = read_credentials_file();
        let api_key = non_empty_env("EASEL_API_KEY")
            .or_else(|| file_field(file.as_ref(), "api_key"))?;
        let api_base = non_empty_env("EASEL_API_BASE")
            .or_else(|| file_field(file.as_ref(), "api_base"))
            .map(|base| base.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Some(Self { api_key, api_base })
    }
}

pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn credentials_path() -> Option<PathBuf> {
    env::var_os("HOME")
        .map(PathBuf::from)
        .map(|home| home.join(".easel").join("credentials.json"))
}

fn read_credentials_file() -> Option<Value> {
    let path = credentials_path()?;
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn file_field(file: Option<&Value>, field: &str) -> Option<String> {
    file?
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
