use std::{fs, path::Path};

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    /// Most recent messages replayed to a connection joining a room.
    pub history_limit: u32,
    /// Seconds an accepted connection may stay silent before it must have
    /// authenticated.
    pub auth_grace_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/relay.db".into(),
            history_limit: 50,
            auth_grace_seconds: 30,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    bind_addr: Option<String>,
    database_url: Option<String>,
    history_limit: Option<u32>,
    auth_grace_seconds: Option<u64>,
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        if let Ok(file_cfg) = toml::from_str::<FileSettings>(&raw) {
            if let Some(v) = file_cfg.bind_addr {
                settings.server_bind = v;
            }
            if let Some(v) = file_cfg.database_url {
                settings.database_url = v;
            }
            if let Some(v) = file_cfg.history_limit {
                settings.history_limit = v;
            }
            if let Some(v) = file_cfg.auth_grace_seconds {
                settings.auth_grace_seconds = v;
            }
        }
    }

    if let Ok(v) = std::env::var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Ok(v) = std::env::var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("HISTORY_LIMIT") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.history_limit = parsed;
        }
    }
    if let Ok(v) = std::env::var("AUTH_GRACE_SECONDS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.auth_grace_seconds = parsed;
        }
    }

    settings.history_limit = settings.history_limit.clamp(1, 500);
    settings
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
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return Ok(());
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if path.is_empty() {
        return Ok(());
    }

    let Some(parent) = Path::new(path).parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_plain_file_path_to_sqlite_url() {
        assert_eq!(
            normalize_database_url("./data/test.db"),
            "sqlite://./data/test.db"
        );
    }

    #[test]
    fn leaves_memory_url_untouched() {
        assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    }

    #[test]
    fn parses_file_settings_overrides() {
        let parsed: FileSettings = toml::from_str(
            "bind_addr = \"0.0.0.0:9000\"\nhistory_limit = 20\nauth_grace_seconds = 5\n",
        )
        .expect("toml");
        assert_eq!(parsed.bind_addr.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(parsed.history_limit, Some(20));
        assert_eq!(parsed.auth_grace_seconds, Some(5));
        assert!(parsed.database_url.is_none());
    }

    #[test]
    fn creates_parent_dir_for_relative_sqlite_url() {
        let suffix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();

        let temp_root = std::env::temp_dir().join(format!("relay_server_test_{suffix}"));
        let db_path = temp_root.join("data").join("test.db");
        let url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

        prepare_database_url(&url).expect("prepare db url");
        assert!(temp_root.join("data").exists());

        std::fs::remove_dir_all(temp_root).expect("cleanup");
    }
}
