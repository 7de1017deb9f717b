use std::{env, path::PathBuf};

use thiserror::Error;

use crate::paymo::DEFAULT_PAYMO_API_URL;
use crate::slack::DEFAULT_SLACK_API_URL;

pub const PAYMO_API_KEY: &str = "PAYMO_API_KEY";
pub const PAYMO_API_URL: &str = "PAYMO_API_URL";
pub const SLACK_APP_TOKEN: &str = "SLACK_APP_TOKEN";
pub const SLACK_BOT_TOKEN: &str = "SLACK_BOT_TOKEN";
pub const SLACK_SIGNING_SECRET: &str = "SLACK_SIGNING_SECRET";
pub const SLACK_API_URL: &str = "SLACK_API_URL";
pub const PAYMO_TRACK_USERS: &str = "PAYMO_TRACK_USERS";

/// 起動時の設定エラー。
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("no user map given; pass --users or set {0}")]
    NoUserMap(&'static str),
}

/// Paymo APIの接続設定。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymoSettings {
    pub api_url: String,
    pub api_key: String,
}

impl PaymoSettings {
    /// 環境変数から読み込む。`PAYMO_API_KEY`は必須。
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            api_url: lookup(PAYMO_API_URL).unwrap_or_else(|| DEFAULT_PAYMO_API_URL.to_string()),
            api_key: required(&lookup, PAYMO_API_KEY)?,
        })
    }
}

/// Webhookで受け付ける場合の設定。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookSettings {
    pub signing_secret: String,
}

impl WebhookSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            signing_secret: required(&lookup, SLACK_SIGNING_SECRET)?,
        })
    }
}

/// Socket Modeで受け付ける場合の設定。
///
/// 起動前にすべての秘密情報が揃っていることを確認する。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocketModeSettings {
    pub api_url: String,
    pub app_token: String,
    pub bot_token: String,
}

impl SocketModeSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let settings = Self {
            api_url: lookup(SLACK_API_URL).unwrap_or_else(|| DEFAULT_SLACK_API_URL.to_string()),
            app_token: required(&lookup, SLACK_APP_TOKEN)?,
            bot_token: required(&lookup, SLACK_BOT_TOKEN)?,
        };
        // Socket Modeでは署名を検証しないが、Webhookと同じ秘密情報が揃っていることを求める。
        required(&lookup, SLACK_SIGNING_SECRET)?;

        Ok(settings)
    }
}

/// ユーザー対応表のパスを決める。
///
/// `--users`、環境変数`PAYMO_TRACK_USERS`、設定ディレクトリの`paymo-track/users.json`の順に探す。
pub fn resolve_user_map_path(cli_path: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    resolve_user_map_path_with(cli_path, env_lookup, dirs::config_dir())
}

fn resolve_user_map_path_with(
    cli_path: Option<PathBuf>,
    lookup: impl Fn(&str) -> Option<String>,
    config_dir: Option<PathBuf>,
) -> Result<PathBuf, ConfigError> {
    cli_path
        .or_else(|| lookup(PAYMO_TRACK_USERS).map(PathBuf::from))
        .or_else(|| config_dir.map(|dir| dir.join("paymo-track").join("users.json")))
        .ok_or(ConfigError::NoUserMap(PAYMO_TRACK_USERS))
}

fn env_lookup(key: &str) -> Option<String> {
    env::var(key).ok()
}

/// 必須の値を取得する。空文字は未設定とみなす。
fn required(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<String, ConfigError> {
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::Missing(key))
}
