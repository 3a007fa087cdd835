use std::{collections::HashMap, fs, time::Duration};

use client_core::ChatClientConfig;

/// Layered client settings: built-in defaults, then `chat.toml`, then
/// `CHAT_*` environment variables. Values in the file are strings and parsed
/// here, so a half-written file degrades to defaults instead of failing.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub server_url: String,
    pub username: Option<String>,
    pub history_page_limit: u32,
    pub max_group_members: usize,
    pub typing_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            username: None,
            history_page_limit: 100,
            max_group_members: 10,
            typing_timeout_secs: 6,
        }
    }
}

impl Settings {
    pub fn client_config(&self) -> ChatClientConfig {
        ChatClientConfig {
            history_page_limit: self.history_page_limit,
            max_group_members: self.max_group_members,
            typing_timeout: Duration::from_secs(self.typing_timeout_secs),
        }
    }
}

pub fn load_settings() -> Settings {
    load_settings_from("chat.toml")
}

pub fn load_settings_from(path: &str) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            apply_entries(&mut settings, &file_cfg);
        }
    }

    let mut env_cfg = HashMap::new();
    for key in [
        "server_url",
        "username",
        "history_page_limit",
        "max_group_members",
        "typing_timeout_secs",
    ] {
        if let Ok(v) = std::env::var(format!("CHAT_{}", key.to_uppercase())) {
            env_cfg.insert(key.to_string(), v);
        }
    }
    apply_entries(&mut settings, &env_cfg);

    settings
}

fn apply_entries(settings: &mut Settings, entries: &HashMap<String, String>) {
    if let Some(v) = entries.get("server_url") {
        settings.server_url = v.clone();
    }
    if let Some(v) = entries.get("username") {
        settings.username = Some(v.clone());
    }
    if let Some(v) = entries.get("history_page_limit") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.history_page_limit = parsed;
        }
    }
    if let Some(v) = entries.get("max_group_members") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.max_group_members = parsed;
        }
    }
    if let Some(v) = entries.get("typing_timeout_secs") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.typing_timeout_secs = parsed;
        }
    }
}
