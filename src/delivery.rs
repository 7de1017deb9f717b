use std::{any::Any, future::Future, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::task::JoinSet;

use crate::paymo::PaymoRepository;
use crate::track_command::{TrackCommand, TrackReply};

/// 処理対象のスラッシュコマンド。
pub const TRACK_COMMAND: &str = "/track";

/// Slackから届いた1回分のコマンド実行。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    /// 確認応答に使うID(Socket ModeのenvelopeIDなど)
    pub id: String,
    pub command: String,
    pub user_id: String,
    pub text: String,
    pub channel_id: Option<String>,
    pub response_url: Option<String>,
}

/// コマンドへの返信を送るためのtrait。
#[async_trait]
pub trait Responder: Send + Sync {
    /// 返信を1件送る。
    async fn reply(&self, invocation: &Invocation, text: &str) -> Result<()>;
}

/// コマンドの受信経路を表すtrait。
///
/// Webhook(HTTP)とSocket Modeのどちらも同じ手順で扱えるようにする。
#[async_trait]
pub trait DeliveryAdapter: Send {
    /// 次のコマンドを受信する。受信経路が閉じた場合は`None`を返す。
    async fn receive(&mut self) -> Result<Option<Invocation>>;

    /// コマンドを受け取ったことをSlackに通知する。
    async fn acknowledge(&mut self, invocation: &Invocation) -> Result<()>;

    /// 返信に使う`Responder`を返す。
    fn responder(&self) -> Arc<dyn Responder>;
}

/// 受信経路からコマンドを受け取り続け、1件ごとに処理と返信を行う。
///
/// 受信したコマンドはまず確認応答し、その後は別タスクで処理するため、互いに待ち合わせない。
/// 受信経路が閉じるか`shutdown`が完了すると受信をやめ、処理中のコマンドの返信を待ってから戻る。
pub async fn run_delivery<A, T, S>(
    mut adapter: A,
    command: Arc<TrackCommand<T>>,
    shutdown: S,
) -> Result<()>
where
    A: DeliveryAdapter,
    T: PaymoRepository + 'static,
    S: Future<Output = ()>,
{
    let responder = adapter.responder();
    let mut tasks = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        let invocation = tokio::select! {
            _ = &mut shutdown => break,
            received = adapter.receive() => match received? {
                Some(invocation) => invocation,
                None => break,
            },
        };

        if let Err(error) = adapter.acknowledge(&invocation).await {
            warn!("Failed to acknowledge {}: {:#}", invocation.id, error);
        }

        debug!(
            "Received {} from {} in {}",
            invocation.command,
            invocation.user_id,
            invocation.channel_id.as_deref().unwrap_or("unknown channel")
        );
        if invocation.command != TRACK_COMMAND {
            debug!("Ignoring {}", invocation.id);
            continue;
        }

        tasks.spawn(handle_invocation(
            command.clone(),
            responder.clone(),
            invocation,
        ));
        reap_finished(&mut tasks);
    }

    if !tasks.is_empty() {
        info!("Waiting for {} in-flight commands", tasks.len());
    }
    while tasks.join_next().await.is_some() {}

    Ok(())
}

/// 終了済みのタスクを取り除き、取り除いた数を返す。
fn reap_finished(tasks: &mut JoinSet<()>) -> usize {
    let mut reaped = 0;
    while tasks.try_join_next().is_some() {
        reaped += 1;
    }
    reaped
}

/// コマンドを処理して返信する。
///
/// 処理中にpanicした場合も汎用のエラーメッセージで必ず1回返信する。
async fn handle_invocation<T>(
    command: Arc<TrackCommand<T>>,
    responder: Arc<dyn Responder>,
    invocation: Invocation,
) where
    T: PaymoRepository + 'static,
{
    let user_id = invocation.user_id.clone();
    let text = invocation.text.clone();
    let reply = match tokio::spawn(async move { command.run(&user_id, &text).await }).await {
        Ok(reply) => reply,
        Err(error) if error.is_panic() => TrackReply::Failed(panic_message(error.into_panic())),
        Err(error) => TrackReply::Failed(error.to_string()),
    };

    if let Err(error) = responder.reply(&invocation, &reply.to_string()).await {
        warn!("Failed to reply to {}: {:#}", invocation.id, error);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unexpected failure".to_string()
    }
}
