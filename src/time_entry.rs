use serde::{Deserialize, Deserializer, Serialize};

/// Paymoのタイムエントリー。
///
/// ローカルには保存せず、APIのレスポンスから必要な項目だけを読む。
/// それ以外の項目は形式が変わっても読み込みに失敗しないよう無視する。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct TimeEntry {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub duration: Option<i64>,
}

impl TimeEntry {
    /// 計測中かどうかを返す。
    ///
    /// durationが0(または未設定)で、終了時刻がない場合に計測中とみなす。
    pub fn is_running(&self) -> bool {
        self.duration.unwrap_or(0) == 0 && self.end_time.as_deref().map_or(true, str::is_empty)
    }
}

/// `start`で作成するタイムエントリー。
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct NewTimeEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub user_id: String,
    pub start_time: String,
    pub duration: i64,
}

impl NewTimeEntry {
    /// 計測中(duration 0)のタイムエントリーを返す。
    pub fn open(task_id: Option<String>, user_id: &str, start_time: String) -> Self {
        Self {
            task_id,
            user_id: user_id.to_string(),
            start_time,
            duration: 0,
        }
    }
}

/// `stop`で送る更新内容。
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct CloseTimeEntry {
    pub end_time: String,
}

/// IDは文字列と数値のどちらでも受け付け、文字列に揃える。
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Text(text) => text,
            RawId::Number(number) => number.to_string(),
        }
    }
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawId::deserialize(deserializer).map(String::from)
}
