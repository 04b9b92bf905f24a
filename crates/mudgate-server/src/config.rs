//! Server configuration: TOML file + CLI overrides.

use mudgate_core::splitter::DirtyTailPolicy;
use mudgate_core::{BridgeError, BridgeResult, DEFAULT_REALM, DEFAULT_REPLAY_CAPACITY};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub game: GameSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub replaceable: ReplaceableSection,
}

/// `[gateway]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// `[game]` section: where the game lives and how its login looks.
#[derive(Debug, Clone, Deserialize)]
pub struct GameSection {
    #[serde(default = "default_game_host")]
    pub host: String,
    #[serde(default = "default_game_port")]
    pub port: u16,
    #[serde(default = "default_realm")]
    pub realm: String,
    #[serde(default = "default_name_prompt")]
    pub name_prompt: String,
    #[serde(default = "default_password_prompt")]
    pub password_prompt: String,
    #[serde(default = "default_login_success")]
    pub login_success: String,
    #[serde(default = "default_login_failure")]
    pub login_failure: String,
}

impl Default for GameSection {
    fn default() -> Self {
        Self {
            host: default_game_host(),
            port: default_game_port(),
            realm: default_realm(),
            name_prompt: default_name_prompt(),
            password_prompt: default_password_prompt(),
            login_success: default_login_success(),
            login_failure: default_login_failure(),
        }
    }
}

/// `[session]` section: per-session pipeline knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_replay_capacity")]
    pub replay_capacity: usize,
    /// Legacy framing behavior: flush every dirty tail immediately instead
    /// of withholding non-protocol tails for the timeout.
    #[serde(default)]
    pub dirty_flush_all: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            replay_capacity: default_replay_capacity(),
            dirty_flush_all: false,
        }
    }
}

/// `[replaceable]` section: extra dictionary rules for the line tagger.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ReplaceableSection {
    #[serde(default)]
    pub rules: Vec<ReplaceableRule>,
}

/// One (pattern, tag) pair for the replaceable-line dictionary.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplaceableRule {
    pub pattern: String,
    pub tag: String,
}

fn default_bind() -> String {
    "0.0.0.0:3353".to_string()
}
fn default_game_host() -> String {
    "127.0.0.1".to_string()
}
fn default_game_port() -> u16 {
    23
}
fn default_realm() -> String {
    DEFAULT_REALM.to_string()
}
fn default_name_prompt() -> String {
    "What is your name".to_string()
}
fn default_password_prompt() -> String {
    "password".to_string()
}
fn default_login_success() -> String {
    "###ack login".to_string()
}
fn default_login_failure() -> String {
    "Login incorrect".to_string()
}
fn default_replay_capacity() -> usize {
    DEFAULT_REPLAY_CAPACITY
}

/// Resolved server configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub game: GameSection,
    pub replay_capacity: usize,
    pub dirty_tail_policy: DirtyTailPolicy,
    pub replaceable_rules: Vec<ReplaceableRule>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_bind: Option<&str>,
        cli_game_host: Option<&str>,
        cli_game_port: Option<u16>,
    ) -> BridgeResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| BridgeError::Config(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let mut game = file_config.game;
        if let Some(host) = cli_game_host {
            game.host = host.to_string();
        }
        if let Some(port) = cli_game_port {
            game.port = port;
        }

        let dirty_tail_policy = if file_config.session.dirty_flush_all {
            DirtyTailPolicy::FlushAll
        } else {
            DirtyTailPolicy::ProtocolOnly
        };

        Ok(Self {
            bind: cli_bind
                .map(|s| s.to_string())
                .unwrap_or(file_config.gateway.bind),
            game,
            replay_capacity: file_config.session.replay_capacity,
            dirty_tail_policy,
            replaceable_rules: file_config.replaceable.rules,
        })
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_a_file() {
        let cfg = ServerConfig::load(None, None, None, None).unwrap();
        assert_eq!(cfg.bind, "0.0.0.0:3353");
        assert_eq!(cfg.game.port, 23);
        assert_eq!(cfg.replay_capacity, DEFAULT_REPLAY_CAPACITY);
        assert_eq!(cfg.dirty_tail_policy, DirtyTailPolicy::ProtocolOnly);
    }

    #[test]
    fn cli_overrides_win() {
        let cfg =
            ServerConfig::load(None, Some("127.0.0.1:9000"), Some("game.example"), Some(2323))
                .unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:9000");
        assert_eq!(cfg.game.host, "game.example");
        assert_eq!(cfg.game.port, 2323);
    }

    #[test]
    fn file_sections_parse() {
        let parsed: ConfigFile = toml::from_str(
            r#"
            [gateway]
            bind = "0.0.0.0:4000"

            [session]
            replay_capacity = 50
            dirty_flush_all = true

            [[replaceable.rules]]
            pattern = "^The rain"
            tag = "weather"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.gateway.bind, "0.0.0.0:4000");
        assert_eq!(parsed.session.replay_capacity, 50);
        assert!(parsed.session.dirty_flush_all);
        assert_eq!(parsed.replaceable.rules.len(), 1);
        assert_eq!(parsed.replaceable.rules[0].tag, "weather");
    }
}
