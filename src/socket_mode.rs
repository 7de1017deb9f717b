use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};

use crate::delivery::{DeliveryAdapter, Invocation, Responder};
use crate::slack::{SlackApiClient, SlashCommandPayload};

type SocketStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Socket Modeで届くメッセージ。
#[derive(Debug, Clone, Deserialize)]
struct SocketEnvelope {
    #[serde(default)]
    envelope_id: Option<String>,
    #[serde(rename = "type")]
    envelope_type: String,
    #[serde(default)]
    payload: Value,
}

/// 受信したメッセージの分類。
#[derive(Debug, PartialEq)]
enum SocketEvent {
    /// スラッシュコマンド
    Command(Invocation),
    /// コマンド以外のenvelope。確認応答だけ行う。
    Other { envelope_id: String },
    /// 接続の切り替え要求
    Disconnect,
    Ignore,
}

/// Socket Modeでスラッシュコマンドを受け取る受信経路。
///
/// 接続が切れた場合は一定時間待ってから再接続する。
pub struct SocketModeAdapter {
    slack: SlackApiClient,
    connection: Option<SocketStream>,
    reconnect_delay: Duration,
    responder: Arc<dyn Responder>,
}

impl SocketModeAdapter {
    /// ボットトークンを検証し、最初の接続を開く。
    ///
    /// 起動時の失敗はそのままエラーとして返す。
    pub async fn connect(
        slack: SlackApiClient,
        reconnect_delay: Duration,
        responder: Arc<dyn Responder>,
    ) -> Result<Self> {
        slack
            .auth_test()
            .await
            .context("Failed to verify slack bot token")?;
        let connection = open_connection(&slack).await?;

        Ok(Self {
            slack,
            connection: Some(connection),
            reconnect_delay,
            responder,
        })
    }

    /// 接続がなければ再接続する。失敗した場合は待ってから再試行する。
    async fn ensure_connected(&mut self) {
        while self.connection.is_none() {
            match open_connection(&self.slack).await {
                Ok(connection) => self.connection = Some(connection),
                Err(error) => {
                    warn!("Socket mode reconnect failed: {:#}", error);
                    tokio::time::sleep(self.reconnect_delay).await;
                }
            }
        }
    }

    async fn send_ack(&mut self, envelope_id: &str) -> Result<()> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| anyhow!("socket mode connection is closed"))?;
        let ack = json!({ "envelope_id": envelope_id }).to_string();
        connection
            .send(WsMessage::Text(ack.into()))
            .await
            .context("Failed to send socket mode ack")
    }

    async fn drop_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            let _ = connection.close(None).await;
        }
    }
}

#[async_trait]
impl DeliveryAdapter for SocketModeAdapter {
    async fn receive(&mut self) -> Result<Option<Invocation>> {
        loop {
            self.ensure_connected().await;
            let Some(connection) = self.connection.as_mut() else {
                continue;
            };
            let next = connection.next().await;
            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(error)) => {
                    warn!("Socket mode read failed: {}", error);
                    self.drop_connection().await;
                    tokio::time::sleep(self.reconnect_delay).await;
                    continue;
                }
                None => {
                    info!("Socket mode stream closed; reconnecting");
                    self.drop_connection().await;
                    tokio::time::sleep(self.reconnect_delay).await;
                    continue;
                }
            };

            match parse_socket_message(message) {
                Ok(SocketEvent::Command(invocation)) => return Ok(Some(invocation)),
                Ok(SocketEvent::Other { envelope_id }) => {
                    if let Err(error) = self.send_ack(&envelope_id).await {
                        warn!("{:#}", error);
                    }
                }
                Ok(SocketEvent::Disconnect) => {
                    info!("Slack requested a socket mode reconnect");
                    self.drop_connection().await;
                }
                Ok(SocketEvent::Ignore) => {}
                Err(error) => warn!("Skipping socket mode message: {:#}", error),
            }
        }
    }

    async fn acknowledge(&mut self, invocation: &Invocation) -> Result<()> {
        self.send_ack(&invocation.id).await
    }

    fn responder(&self) -> Arc<dyn Responder> {
        self.responder.clone()
    }
}

async fn open_connection(slack: &SlackApiClient) -> Result<SocketStream> {
    let url = slack.open_socket_connection().await?;
    let (stream, _response) = connect_async(url.as_str())
        .await
        .context("Failed to connect slack socket mode websocket")?;
    info!("Socket mode connected");

    Ok(stream)
}

fn parse_socket_message(message: WsMessage) -> Result<SocketEvent> {
    let envelope = match message {
        WsMessage::Text(text) => serde_json::from_str::<SocketEnvelope>(&text)
            .context("Failed to parse socket mode envelope")?,
        WsMessage::Binary(bytes) => {
            let text =
                String::from_utf8(bytes.to_vec()).context("invalid utf-8 socket mode payload")?;
            serde_json::from_str::<SocketEnvelope>(&text)
                .context("Failed to parse socket mode envelope")?
        }
        WsMessage::Close(_) => return Ok(SocketEvent::Disconnect),
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {
            return Ok(SocketEvent::Ignore)
        }
    };

    match (envelope.envelope_type.as_str(), envelope.envelope_id) {
        ("hello", _) => {
            debug!("Socket mode hello received");
            Ok(SocketEvent::Ignore)
        }
        ("disconnect", _) => Ok(SocketEvent::Disconnect),
        ("slash_commands", Some(envelope_id)) => {
            match serde_json::from_value::<SlashCommandPayload>(envelope.payload) {
                Ok(payload) => Ok(SocketEvent::Command(payload.into_invocation(envelope_id))),
                Err(error) => {
                    // 返信先が分からないため、確認応答だけ行う。
                    warn!("Malformed slash command payload in {}: {}", envelope_id, error);
                    Ok(SocketEvent::Other { envelope_id })
                }
            }
        }
        (_, Some(envelope_id)) => Ok(SocketEvent::Other { envelope_id }),
        (_, None) => Ok(SocketEvent::Ignore),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use mockito::Server;
    use rstest::rstest;
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};

    use super::{parse_socket_message, SocketEvent, SocketModeAdapter};
    use crate::delivery::tests::RecordingResponder;
    use crate::delivery::DeliveryAdapter;
    use crate::slack::SlackApiClient;

    fn slash_envelope(envelope_id: &str, text: &str) -> String {
        json!({
            "envelope_id": envelope_id,
            "type": "slash_commands",
            "accepts_response_payload": true,
            "payload": {
                "command": "/track",
                "text": text,
                "user_id": "U1234ABCD",
                "channel_id": "C1",
                "response_url": "https://hooks.slack.com/commands/1",
            },
        })
        .to_string()
    }

    #[test]
    fn test_parse_slash_command() {
        let event = parse_socket_message(WsMessage::Text(slash_envelope("env-1", "stop").into()))
            .unwrap();

        let SocketEvent::Command(invocation) = event else {
            panic!("expected command, got {:?}", event);
        };
        assert_eq!(invocation.id, "env-1");
        assert_eq!(invocation.command, "/track");
        assert_eq!(invocation.text, "stop");
        assert_eq!(invocation.user_id, "U1234ABCD");
    }

    #[rstest]
    #[case::hello(json!({"type": "hello", "num_connections": 1}), SocketEvent::Ignore)]
    #[case::disconnect(json!({"type": "disconnect", "reason": "refresh_requested"}), SocketEvent::Disconnect)]
    #[case::events_api(
        json!({"envelope_id": "env-9", "type": "events_api", "payload": {}}),
        SocketEvent::Other { envelope_id: "env-9".to_string() },
    )]
    fn test_parse_other_messages(#[case] message: Value, #[case] expected: SocketEvent) {
        let event = parse_socket_message(WsMessage::Text(message.to_string().into())).unwrap();

        assert_eq!(event, expected);
    }

    /// 中身が壊れたスラッシュコマンドも確認応答の対象になることを確認する。
    #[test]
    fn test_parse_malformed_slash_command_is_acked() {
        let message = json!({
            "envelope_id": "env-x",
            "type": "slash_commands",
            "payload": {"command": "/track", "text": "stop"},
        });

        let event = parse_socket_message(WsMessage::Text(message.to_string().into())).unwrap();

        assert_eq!(
            event,
            SocketEvent::Other {
                envelope_id: "env-x".to_string()
            }
        );
    }

    #[test]
    fn test_parse_malformed_message() {
        assert!(parse_socket_message(WsMessage::Text("not json".into())).is_err());
    }

    /// ローカルのWebSocketサーバーに接続し、コマンドの受信と確認応答を確認する。
    #[tokio::test]
    async fn test_receive_and_acknowledge() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_url = format!("ws://{}", listener.local_addr().unwrap());
        let slack_server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = accept_async(stream).await.unwrap();
            socket
                .send(WsMessage::Text(json!({"type": "hello"}).to_string().into()))
                .await
                .unwrap();
            socket
                .send(WsMessage::Text(
                    json!({"envelope_id": "env-0", "type": "interactive", "payload": {}})
                        .to_string()
                        .into(),
                ))
                .await
                .unwrap();
            socket
                .send(WsMessage::Text(slash_envelope("env-1", "start T1").into()))
                .await
                .unwrap();

            let mut acks = Vec::new();
            while acks.len() < 2 {
                match socket.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        let ack: Value = serde_json::from_str(&text).unwrap();
                        acks.push(ack["envelope_id"].as_str().unwrap().to_string());
                    }
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
            acks
        });

        let mut api = Server::new_async().await;
        api.mock("POST", "/auth.test")
            .with_body(r#"{"ok": true, "user_id": "UBOT"}"#)
            .create_async()
            .await;
        api.mock("POST", "/apps.connections.open")
            .with_body(json!({"ok": true, "url": ws_url}).to_string())
            .create_async()
            .await;
        let slack =
            SlackApiClient::new(&api.url(), "xapp-app", "xoxb-bot", Duration::from_secs(5))
                .unwrap();

        let mut adapter = SocketModeAdapter::connect(
            slack,
            Duration::from_millis(10),
            Arc::new(RecordingResponder::default()),
        )
        .await
        .unwrap();
        let invocation = adapter.receive().await.unwrap().unwrap();
        adapter.acknowledge(&invocation).await.unwrap();

        assert_eq!(invocation.id, "env-1");
        assert_eq!(invocation.text, "start T1");
        assert_eq!(slack_server.await.unwrap(), vec!["env-0", "env-1"]);
    }

    /// Slackからの切断要求や接続断の後に再接続し、次のコマンドを受け取ることを確認する。
    #[rstest]
    #[case::disconnect_envelope(true)]
    #[case::stream_closed(false)]
    #[tokio::test]
    async fn test_reconnects_after_disconnect(#[case] send_disconnect: bool) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_url = format!("ws://{}", listener.local_addr().unwrap());
        let slack_server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut first = accept_async(stream).await.unwrap();
            if send_disconnect {
                first
                    .send(WsMessage::Text(
                        json!({"type": "disconnect", "reason": "refresh_requested"})
                            .to_string()
                            .into(),
                    ))
                    .await
                    .unwrap();
            } else {
                first.close(None).await.unwrap();
            }

            let (stream, _) = listener.accept().await.unwrap();
            let mut second = accept_async(stream).await.unwrap();
            second
                .send(WsMessage::Text(slash_envelope("env-2", "stop").into()))
                .await
                .unwrap();
            loop {
                match second.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        let ack: Value = serde_json::from_str(&text).unwrap();
                        return ack["envelope_id"].as_str().unwrap().to_string();
                    }
                    Some(Ok(_)) => {}
                    other => panic!("connection ended before ack: {:?}", other),
                }
            }
        });

        let mut api = Server::new_async().await;
        api.mock("POST", "/auth.test")
            .with_body(r#"{"ok": true, "user_id": "UBOT"}"#)
            .create_async()
            .await;
        let connections_open = api
            .mock("POST", "/apps.connections.open")
            .with_body(json!({"ok": true, "url": ws_url}).to_string())
            .expect(2)
            .create_async()
            .await;
        let slack =
            SlackApiClient::new(&api.url(), "xapp-app", "xoxb-bot", Duration::from_secs(5))
                .unwrap();

        let mut adapter = SocketModeAdapter::connect(
            slack,
            Duration::from_millis(10),
            Arc::new(RecordingResponder::default()),
        )
        .await
        .unwrap();
        let invocation = adapter.receive().await.unwrap().unwrap();
        adapter.acknowledge(&invocation).await.unwrap();

        assert_eq!(invocation.id, "env-2");
        assert_eq!(slack_server.await.unwrap(), "env-2");
        connections_open.assert_async().await;
    }

    /// ボットトークンが無効な場合は起動時にエラーになることを確認する。
    #[tokio::test]
    async fn test_connect_fails_fast_on_invalid_token() {
        let mut api = Server::new_async().await;
        api.mock("POST", "/auth.test")
            .with_body(r#"{"ok": false, "error": "invalid_auth"}"#)
            .create_async()
            .await;
        let slack =
            SlackApiClient::new(&api.url(), "xapp-app", "xoxb-bad", Duration::from_secs(5))
                .unwrap();

        let result = SocketModeAdapter::connect(
            slack,
            Duration::from_millis(10),
            Arc::new(RecordingResponder::default()),
        )
        .await;

        assert!(result.is_err());
    }
}
