use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::delivery::{Invocation, Responder};

/// Slack Web APIのデフォルトURL。
pub const DEFAULT_SLACK_API_URL: &str = "https://slack.com/api";

/// スラッシュコマンドのペイロード。
///
/// WebhookではフォームURLエンコード、Socket ModeではJSONで届くが、項目は同じ。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct SlashCommandPayload {
    pub command: String,
    #[serde(default)]
    pub text: String,
    pub user_id: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub response_url: Option<String>,
    #[serde(default)]
    pub trigger_id: Option<String>,
}

impl SlashCommandPayload {
    /// 指定したIDで`Invocation`に変換する。
    pub fn into_invocation(self, id: String) -> Invocation {
        Invocation {
            id,
            command: self.command,
            user_id: self.user_id,
            text: self.text,
            channel_id: self.channel_id.filter(|value| !value.is_empty()),
            response_url: self.response_url.filter(|value| !value.is_empty()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ResponseUrlMessage<'a> {
    response_type: &'a str,
    text: &'a str,
}

/// コマンドの`response_url`に返信する`Responder`。
///
/// 返信はコマンドを実行したユーザーにだけ見える(ephemeral)。
pub struct ResponseUrlResponder {
    client: Client,
}

impl ResponseUrlResponder {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build http client for Slack responses")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Responder for ResponseUrlResponder {
    async fn reply(&self, invocation: &Invocation, text: &str) -> Result<()> {
        let Some(response_url) = invocation.response_url.as_deref() else {
            warn!("No response_url for {}; reply dropped", invocation.id);
            return Ok(());
        };

        self.client
            .post(response_url)
            .json(&ResponseUrlMessage {
                response_type: "ephemeral",
                text,
            })
            .send()
            .await
            .context("Failed to send reply to Slack")?
            .error_for_status()
            .context("Slack rejected the reply")?;

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct AuthTestResponse {
    ok: bool,
    user_id: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenConnectionResponse {
    ok: bool,
    url: Option<String>,
    error: Option<String>,
}

/// Socket Modeの接続に必要なSlack Web APIのクライアント。
#[derive(Clone)]
pub struct SlackApiClient {
    client: Client,
    api_url: String,
    app_token: String,
    bot_token: String,
}

impl SlackApiClient {
    /// 新しい`SlackApiClient`を返す。
    ///
    /// # Arguments
    ///
    /// * `api_url` - Slack Web APIのベースURL
    /// * `app_token` - `apps.connections.open`に使うアプリレベルトークン(`xapp-`)
    /// * `bot_token` - `auth.test`に使うボットトークン(`xoxb-`)
    /// * `timeout` - 1リクエストあたりのタイムアウト
    pub fn new(api_url: &str, app_token: &str, bot_token: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build http client for Slack")?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            app_token: app_token.trim().to_string(),
            bot_token: bot_token.trim().to_string(),
        })
    }

    /// ボットトークンを検証し、ボットのユーザーIDを返す。
    pub async fn auth_test(&self) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/auth.test", self.api_url))
            .bearer_auth(&self.bot_token)
            .send()
            .await
            .context("Failed to send request to slack auth.test")?
            .error_for_status()
            .context("slack auth.test returned an error status")?
            .json::<AuthTestResponse>()
            .await
            .context("Failed to deserialize slack auth.test response")?;

        if !response.ok {
            bail!(
                "slack auth.test failed: {}",
                response.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }
        let user_id = response
            .user_id
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow!("slack auth.test did not return user_id"))?;
        info!("Slack bot authenticated as {}", user_id);

        Ok(user_id)
    }

    /// Socket Mode用のWebSocket URLを取得する。
    pub async fn open_socket_connection(&self) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/apps.connections.open", self.api_url))
            .bearer_auth(&self.app_token)
            .send()
            .await
            .context("Failed to send request to slack apps.connections.open")?
            .error_for_status()
            .context("slack apps.connections.open returned an error status")?
            .json::<OpenConnectionResponse>()
            .await
            .context("Failed to deserialize slack apps.connections.open response")?;

        if !response.ok {
            bail!(
                "slack apps.connections.open failed: {}",
                response.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }
        response
            .url
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow!("slack apps.connections.open did not return url"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mockito::{Matcher, Server};
    use serde_json::json;

    use super::{ResponseUrlResponder, SlackApiClient, SlashCommandPayload};
    use crate::delivery::Responder;

    fn payload() -> SlashCommandPayload {
        SlashCommandPayload {
            command: "/track".to_string(),
            text: "start T1".to_string(),
            user_id: "U1234ABCD".to_string(),
            channel_id: Some("".to_string()),
            response_url: Some("https://hooks.slack.com/commands/1".to_string()),
            trigger_id: None,
        }
    }

    #[test]
    fn test_into_invocation_drops_empty_values() {
        let invocation = payload().into_invocation("env-1".to_string());

        assert_eq!(invocation.id, "env-1");
        assert_eq!(invocation.text, "start T1");
        assert_eq!(invocation.channel_id, None);
        assert_eq!(
            invocation.response_url.as_deref(),
            Some("https://hooks.slack.com/commands/1")
        );
    }

    /// JSONのペイロードでtextが省略されていても読み込めることを確認する。
    #[test]
    fn test_deserialize_payload_without_text() {
        let payload: SlashCommandPayload = serde_json::from_value(json!({
            "command": "/track",
            "user_id": "U1234ABCD",
        }))
        .unwrap();

        assert_eq!(payload.text, "");
    }

    #[tokio::test]
    async fn test_reply_to_response_url() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/commands/1")
            .match_body(Matcher::Json(json!({
                "response_type": "ephemeral",
                "text": "⏹️ Cronómetro parado y registrado.",
            })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        let mut invocation = payload().into_invocation("env-1".to_string());
        invocation.response_url = Some(format!("{}/commands/1", server.url()));

        ResponseUrlResponder::new(Duration::from_secs(5))
            .unwrap()
            .reply(&invocation, "⏹️ Cronómetro parado y registrado.")
            .await
            .unwrap();

        mock.assert_async().await;
    }

    /// response_urlがない場合は何も送らずに成功することを確認する。
    #[tokio::test]
    async fn test_reply_without_response_url() {
        let mut invocation = payload().into_invocation("env-1".to_string());
        invocation.response_url = None;

        let result = ResponseUrlResponder::new(Duration::from_secs(5))
            .unwrap()
            .reply(&invocation, "hello")
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_auth_test() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/auth.test")
            .match_header("authorization", "Bearer xoxb-bot")
            .with_status(200)
            .with_body(r#"{"ok": true, "user_id": "UBOT"}"#)
            .create_async()
            .await;
        let client =
            SlackApiClient::new(&server.url(), "xapp-app", "xoxb-bot", Duration::from_secs(5))
                .unwrap();

        assert_eq!(client.auth_test().await.unwrap(), "UBOT");
    }

    #[tokio::test]
    async fn test_auth_test_rejected() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/auth.test")
            .with_status(200)
            .with_body(r#"{"ok": false, "error": "invalid_auth"}"#)
            .create_async()
            .await;
        let client =
            SlackApiClient::new(&server.url(), "xapp-app", "xoxb-bad", Duration::from_secs(5))
                .unwrap();

        let error = client.auth_test().await.unwrap_err();

        assert!(error.to_string().contains("invalid_auth"));
    }

    #[tokio::test]
    async fn test_open_socket_connection() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/apps.connections.open")
            .match_header("authorization", "Bearer xapp-app")
            .with_status(200)
            .with_body(r#"{"ok": true, "url": "wss://wss-primary.slack.com/link"}"#)
            .create_async()
            .await;
        let client =
            SlackApiClient::new(&server.url(), "xapp-app", "xoxb-bot", Duration::from_secs(5))
                .unwrap();

        assert_eq!(
            client.open_socket_connection().await.unwrap(),
            "wss://wss-primary.slack.com/link"
        );
    }
}
