use std::fmt;

use log::{info, warn};

use crate::datetime;
use crate::paymo::PaymoRepository;
use crate::time_entry::{NewTimeEntry, TimeEntry};
use crate::user_map::{MappingNotFound, UserMap};

/// `/track`に続くテキストから読み取った操作。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackAction {
    Start { task_id: Option<String> },
    Stop,
}

/// 計測中のエントリーが複数ある場合に`stop`をどう扱うか。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ArgEnum)]
pub enum StopPolicy {
    /// Paymo APIが返した最初のエントリーだけを止める。
    #[default]
    First,
    /// 何も止めずにエラーを返す。
    Reject,
    /// 返ってきたエントリーをすべて止める。
    All,
}

/// 1回のコマンド実行に対する返信。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackReply {
    Started { entry_id: String },
    Stopped,
    Usage,
    MappingNotFound(MappingNotFound),
    NoRunningEntry,
    MultipleRunning(usize),
    StartFailed(String),
    StopFailed(String),
    Failed(String),
}

impl fmt::Display for TrackReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started { entry_id } => {
                write!(f, "▶️ Cronómetro iniciado (entry id: {}).", entry_id)
            }
            Self::Stopped => write!(f, "⏹️ Cronómetro parado y registrado."),
            Self::Usage => write!(f, "Uso: `/track start <taskId>` o `/track stop`."),
            Self::MappingNotFound(error) => write!(f, "❌ {}", error),
            Self::NoRunningEntry => write!(f, "No hay ningún time entry en curso."),
            Self::MultipleRunning(count) => {
                write!(f, "❌ Error al parar: hay {} time entries en curso.", count)
            }
            Self::StartFailed(message) => write!(f, "❌ Error al iniciar: {}", message),
            Self::StopFailed(message) => write!(f, "❌ Error al parar: {}", message),
            Self::Failed(message) => write!(f, "❌ Error: {}", message),
        }
    }
}

/// テキストを空白で区切り、操作とタスクIDを取り出す。
///
/// 操作は`start`か`stop`に完全一致する必要があり、それ以外(空文字や先頭の空白を含む)は`None`。
/// タスクIDは検証せずにそのまま渡す。
pub fn parse_action(text: &str) -> Option<TrackAction> {
    if text.starts_with(char::is_whitespace) {
        return None;
    }

    let mut parts = text.split_whitespace();
    let action = parts.next()?;
    match action {
        "start" => Some(TrackAction::Start {
            task_id: parts.next().map(str::to_string),
        }),
        "stop" => Some(TrackAction::Stop),
        _ => None,
    }
}

/// `/track`コマンドの処理を行う。
///
/// 呼び出しごとの状態は持たず、計測中かどうかは毎回Paymo APIに問い合わせる。
pub struct TrackCommand<T: PaymoRepository> {
    paymo: T,
    user_map: UserMap,
    stop_policy: StopPolicy,
}

impl<T: PaymoRepository> TrackCommand<T> {
    /// 新しい`TrackCommand`を返す。
    ///
    /// # Arguments
    /// * `paymo` - Paymo APIと通信するためのリポジトリ
    /// * `user_map` - SlackユーザーIDとPaymoユーザーIDの対応表
    /// * `stop_policy` - 計測中のエントリーが複数ある場合の扱い
    pub fn new(paymo: T, user_map: UserMap, stop_policy: StopPolicy) -> Self {
        Self {
            paymo,
            user_map,
            stop_policy,
        }
    }

    /// コマンドを1回実行し、返信を返す。
    ///
    /// すべてのエラーは返信に変換され、呼び出し元には伝播しない。
    ///
    /// # Arguments
    ///
    /// * `slack_user_id` - コマンドを実行したSlackユーザーのID
    /// * `text` - `/track`に続くテキスト
    pub async fn run(&self, slack_user_id: &str, text: &str) -> TrackReply {
        let paymo_user_id = match self.user_map.map_user(slack_user_id) {
            Ok(paymo_user_id) => paymo_user_id,
            Err(error) => {
                warn!("{}", error);
                return TrackReply::MappingNotFound(error);
            }
        };

        let reply = match parse_action(text) {
            Some(TrackAction::Start { task_id }) => self.start(paymo_user_id, task_id).await,
            Some(TrackAction::Stop) => self.stop(paymo_user_id).await,
            None => TrackReply::Usage,
        };
        info!("/track by {}: {:?}", slack_user_id, reply);

        reply
    }

    async fn start(&self, paymo_user_id: &str, task_id: Option<String>) -> TrackReply {
        let entry = NewTimeEntry::open(task_id, paymo_user_id, datetime::now_iso8601());
        match self.paymo.create_time_entry(&entry).await {
            Ok(created) => TrackReply::Started {
                entry_id: created.id,
            },
            Err(error) => TrackReply::StartFailed(format!("{:#}", error)),
        }
    }

    async fn stop(&self, paymo_user_id: &str) -> TrackReply {
        let running: Vec<TimeEntry> = match self.paymo.read_open_time_entries(paymo_user_id).await {
            Ok(entries) => entries.into_iter().filter(TimeEntry::is_running).collect(),
            Err(error) => return TrackReply::StopFailed(format!("{:#}", error)),
        };

        let targets: Vec<&TimeEntry> = match (running.as_slice(), self.stop_policy) {
            ([], _) => return TrackReply::NoRunningEntry,
            ([only], _) => vec![only],
            ([first, ..], StopPolicy::First) => {
                warn!(
                    "{} running time entries for Paymo user {}; stopping {}",
                    running.len(),
                    paymo_user_id,
                    first.id
                );
                vec![first]
            }
            (many, StopPolicy::Reject) => return TrackReply::MultipleRunning(many.len()),
            (many, StopPolicy::All) => many.iter().collect(),
        };

        let end_time = datetime::now_iso8601();
        let total = targets.len();
        for (closed, entry) in targets.into_iter().enumerate() {
            if let Err(error) = self.paymo.close_time_entry(&entry.id, &end_time).await {
                if closed == 0 {
                    return TrackReply::StopFailed(format!("{:#}", error));
                }
                // 途中まで止めたエントリーは元に戻さないので、その数を伝える。
                return TrackReply::StopFailed(format!(
                    "{:#} ({} de {} time entries ya parados)",
                    error, closed, total
                ));
            }
        }

        TrackReply::Stopped
    }
}
