use std::{collections::HashMap, fs, path::Path};

use log::info;
use thiserror::Error;

/// SlackユーザーIDに対応するPaymoユーザーIDが見つからない。
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("No hay mapeo para Slack ID {0}")]
pub struct MappingNotFound(pub String);

/// ユーザー対応表の読み込みエラー。
#[derive(Debug, Error)]
pub enum UserMapError {
    #[error("failed to read user map {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse user map {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid Slack user id in user map: {0:?}")]
    InvalidSlackId(String),
    #[error("empty Paymo user id for Slack ID {0}")]
    EmptyPaymoId(String),
}

/// SlackユーザーIDからPaymoユーザーIDへの対応表。
///
/// 起動時に一度だけ読み込み、以降は変更しない。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserMap {
    entries: HashMap<String, String>,
}

impl UserMap {
    /// 対応表を検証して返す。
    ///
    /// キーはSlackのユーザーID形式(`U`または`W`で始まる英大文字・数字)でなければならない。
    pub fn new(entries: HashMap<String, String>) -> Result<Self, UserMapError> {
        for (slack_id, paymo_id) in &entries {
            if !is_slack_user_id(slack_id) {
                return Err(UserMapError::InvalidSlackId(slack_id.clone()));
            }
            if paymo_id.trim().is_empty() {
                return Err(UserMapError::EmptyPaymoId(slack_id.clone()));
            }
        }

        Ok(Self { entries })
    }

    /// JSONファイル(`{"U1234ABCD": "987654"}`)から対応表を読み込む。
    pub fn load(path: &Path) -> Result<Self, UserMapError> {
        let display = path.display().to_string();
        let raw = fs::read_to_string(path).map_err(|source| UserMapError::Read {
            path: display.clone(),
            source,
        })?;
        let entries: HashMap<String, String> =
            serde_json::from_str(&raw).map_err(|source| UserMapError::Parse {
                path: display.clone(),
                source,
            })?;
        let user_map = Self::new(entries)?;
        info!("Loaded {} user mappings from {}", user_map.len(), display);

        Ok(user_map)
    }

    /// SlackユーザーIDに対応するPaymoユーザーIDを返す。完全一致のみ。
    pub fn map_user(&self, slack_user_id: &str) -> Result<&str, MappingNotFound> {
        self.entries
            .get(slack_user_id)
            .map(String::as_str)
            .ok_or_else(|| MappingNotFound(slack_user_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_slack_user_id(value: &str) -> bool {
    let mut chars = value.chars();
    matches!(chars.next(), Some('U') | Some('W'))
        && value.len() > 1
        && chars.all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit())
}
