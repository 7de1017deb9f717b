use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hmac::{Hmac, Mac};
use log::{error, info, warn};
use serde_json::json;
use sha2::Sha256;
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
};

use crate::datetime;
use crate::delivery::{DeliveryAdapter, Invocation, Responder};
use crate::slack::SlashCommandPayload;

/// スラッシュコマンドを受け付けるパス。
pub const SLACK_EVENTS_PATH: &str = "/slack/events";

/// 署名のタイムスタンプとして許容するずれ(秒)。
const MAX_SIGNATURE_SKEW_SECS: i64 = 60 * 5;

/// 確認応答を待つ上限。Slackは3秒以内の応答を求める。
const ACK_TIMEOUT: Duration = Duration::from_millis(2_500);

const PENDING_CAPACITY: usize = 64;

/// HTTPハンドラから受信ループに渡すコマンド。
struct PendingInvocation {
    invocation: Invocation,
    ack: oneshot::Sender<()>,
}

struct WebhookState {
    signing_secret: String,
    sender: mpsc::Sender<PendingInvocation>,
    next_id: AtomicU64,
}

/// HTTPでスラッシュコマンドを受け取る受信経路。
///
/// HTTPレスポンス(200)が確認応答になる。レスポンスは`acknowledge`が呼ばれた時点で返す。
pub struct WebhookAdapter {
    receiver: mpsc::Receiver<PendingInvocation>,
    pending_acks: HashMap<String, oneshot::Sender<()>>,
    responder: Arc<dyn Responder>,
}

impl WebhookAdapter {
    /// 指定アドレスでHTTPサーバーを起動する。
    ///
    /// # Arguments
    ///
    /// * `bind` - 待ち受けるアドレス
    /// * `signing_secret` - リクエスト署名の検証に使うSlackのsigning secret
    /// * `responder` - 返信に使う`Responder`
    pub async fn bind(
        bind: SocketAddr,
        signing_secret: &str,
        responder: Arc<dyn Responder>,
    ) -> Result<Self> {
        let (adapter, router) = Self::new(signing_secret, responder);
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("Failed to bind webhook listener on {}", bind))?;
        info!(
            "Listening for slash commands on http://{}{}",
            listener.local_addr().unwrap_or(bind),
            SLACK_EVENTS_PATH
        );
        tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, router).await {
                error!("Webhook server exited: {}", error);
            }
        });

        Ok(adapter)
    }

    /// 受信経路と、それにコマンドを渡すルーターを組み立てる。
    fn new(signing_secret: &str, responder: Arc<dyn Responder>) -> (Self, Router) {
        let (sender, receiver) = mpsc::channel(PENDING_CAPACITY);
        let adapter = Self {
            receiver,
            pending_acks: HashMap::new(),
            responder,
        };

        (adapter, build_webhook_router(signing_secret, sender))
    }
}

#[async_trait]
impl DeliveryAdapter for WebhookAdapter {
    async fn receive(&mut self) -> Result<Option<Invocation>> {
        let Some(pending) = self.receiver.recv().await else {
            return Ok(None);
        };
        self.pending_acks
            .insert(pending.invocation.id.clone(), pending.ack);

        Ok(Some(pending.invocation))
    }

    async fn acknowledge(&mut self, invocation: &Invocation) -> Result<()> {
        let ack = self
            .pending_acks
            .remove(&invocation.id)
            .ok_or_else(|| anyhow!("no pending request for {}", invocation.id))?;
        ack.send(())
            .map_err(|_| anyhow!("request {} already answered", invocation.id))
    }

    fn responder(&self) -> Arc<dyn Responder> {
        self.responder.clone()
    }
}

fn build_webhook_router(signing_secret: &str, sender: mpsc::Sender<PendingInvocation>) -> Router {
    let state = Arc::new(WebhookState {
        signing_secret: signing_secret.to_string(),
        sender,
        next_id: AtomicU64::new(1),
    });

    Router::new()
        .route(SLACK_EVENTS_PATH, post(handle_slash_command))
        .route("/healthz", get(handle_health))
        .with_state(state)
}

async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

async fn handle_slash_command(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Err(error) = verify_slack_signature(
        &headers,
        &body,
        &state.signing_secret,
        datetime::now().timestamp(),
    ) {
        warn!("Rejected slash command request: {:#}", error);
        return (StatusCode::UNAUTHORIZED, "invalid request signature").into_response();
    }

    let payload: SlashCommandPayload = match serde_urlencoded::from_str(&body) {
        Ok(payload) => payload,
        Err(error) => {
            warn!("Malformed slash command payload: {}", error);
            return (StatusCode::BAD_REQUEST, "malformed slash command payload").into_response();
        }
    };
    let id = payload
        .trigger_id
        .clone()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| format!("webhook-{}", state.next_id.fetch_add(1, Ordering::Relaxed)));

    let (ack, acked) = oneshot::channel();
    let pending = PendingInvocation {
        invocation: payload.into_invocation(id.clone()),
        ack,
    };
    if state.sender.send(pending).await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }

    if tokio::time::timeout(ACK_TIMEOUT, acked).await.is_err() {
        warn!("Acknowledgement for {} timed out; answering anyway", id);
    }

    StatusCode::OK.into_response()
}

/// Slackのリクエスト署名(v0)を検証する。
///
/// `v0:<timestamp>:<body>`のHMAC-SHA256が`X-Slack-Signature`と一致し、
/// タイムスタンプが現在時刻から5分以内であることを確認する。
fn verify_slack_signature(
    headers: &HeaderMap,
    body: &str,
    signing_secret: &str,
    now_unix: i64,
) -> Result<()> {
    let timestamp = header_value(headers, "x-slack-request-timestamp")?;
    let signature = header_value(headers, "x-slack-signature")?;

    let issued_at = timestamp
        .parse::<i64>()
        .context("request timestamp must be an integer")?;
    if (now_unix - issued_at).abs() > MAX_SIGNATURE_SKEW_SECS {
        bail!("request timestamp is outside the allowed window");
    }

    let Some(digest_hex) = signature.strip_prefix("v0=") else {
        bail!("slack signature must use v0=<hex> format");
    };
    let signature_bytes = hex::decode(digest_hex).context("slack signature must be hex")?;
    let mut mac = Hmac::<Sha256>::new_from_slice(signing_secret.as_bytes())
        .context("Failed to initialize signature verifier")?;
    mac.update(format!("v0:{}:{}", timestamp, body).as_bytes());
    mac.verify_slice(&signature_bytes)
        .map_err(|_| anyhow!("slack signature verification failed"))
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str> {
    headers
        .get(name)
        .with_context(|| format!("missing header '{}'", name))?
        .to_str()
        .with_context(|| format!("header '{}' must be valid utf-8", name))
}
