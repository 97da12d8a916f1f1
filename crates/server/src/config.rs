use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Deserialize;
use shared::domain::MAX_MESSAGE_CHARS;

const SEVEN_DAYS_SECONDS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub session_secret: String,
    pub session_ttl_seconds: i64,
    pub max_message_chars: usize,
    pub assistant_api_key: Option<String>,
    pub assistant_api_url: String,
    pub assistant_model: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:3000".into(),
            database_url: "sqlite://./data/chat.db".into(),
            session_secret: "dev-session-secret".into(),
            session_ttl_seconds: SEVEN_DAYS_SECONDS,
            max_message_chars: MAX_MESSAGE_CHARS,
            assistant_api_key: None,
            assistant_api_url: "https://openrouter.ai/api/v1".into(),
            assistant_model: "liquid/lfm-2.5-1.2b-instruct:free".into(),
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            apply_file_settings(&mut settings, &file_cfg);
        }
    }

    apply_env_settings(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file_settings(settings: &mut Settings, file_cfg: &HashMap<String, String>) {
    if let Some(v) = file_cfg.get("bind_addr") {
        settings.server_bind = v.clone();
    }
    if let Some(v) = file_cfg.get("database_url") {
        settings.database_url = v.clone();
    }
    if let Some(v) = file_cfg.get("session_secret") {
        settings.session_secret = v.clone();
    }
    if let Some(parsed) = file_cfg
        .get("session_ttl_seconds")
        .and_then(|v| v.parse::<i64>().ok())
    {
        settings.session_ttl_seconds = parsed;
    }
    if let Some(parsed) = file_cfg
        .get("max_message_chars")
        .and_then(|v| v.parse::<usize>().ok())
    {
        settings.max_message_chars = parsed;
    }
    if let Some(v) = file_cfg.get("assistant_api_url") {
        settings.assistant_api_url = v.clone();
    }
    if let Some(v) = file_cfg.get("assistant_model") {
        settings.assistant_model = v.clone();
    }
}

/// Environment overrides, later keys winning over earlier aliases.
fn apply_env_settings(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    for key in ["SERVER_BIND", "APP__BIND_ADDR"] {
        if let Some(v) = var(key) {
            settings.server_bind = v;
        }
    }
    for key in ["DATABASE_URL", "APP__DATABASE_URL"] {
        if let Some(v) = var(key) {
            settings.database_url = v;
        }
    }
    if let Some(v) = var("APP__SESSION_SECRET") {
        settings.session_secret = v;
    }
    if let Some(parsed) = var("APP__SESSION_TTL_SECONDS").and_then(|v| v.parse::<i64>().ok()) {
        settings.session_ttl_seconds = parsed;
    }
    if let Some(parsed) = var("APP__MAX_MESSAGE_CHARS").and_then(|v| v.parse::<usize>().ok()) {
        settings.max_message_chars = parsed;
    }
    for key in ["OPENROUTER_API_KEY", "APP__ASSISTANT_API_KEY"] {
        if let Some(v) = var(key).filter(|v| !v.trim().is_empty()) {
            settings.assistant_api_key = Some(v);
        }
    }
    if let Some(v) = var("APP__ASSISTANT_API_URL") {
        settings.assistant_api_url = v;
    }
    if let Some(v) = var("APP__ASSISTANT_MODEL") {
        settings.assistant_model = v;
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
