use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
#[cfg(test)]
use mockall::automock;
use reqwest::{header::CONTENT_TYPE, Client};
use serde::Deserialize;

use crate::time_entry::{CloseTimeEntry, NewTimeEntry, TimeEntry};

/// Paymo APIのデフォルトURL。
pub const DEFAULT_PAYMO_API_URL: &str = "https://app.paymoapp.com/api";

/// Basic認証のパスワード。PaymoはAPIキーをユーザー名に使い、パスワードは任意の値でよい。
const API_KEY_PASSWORD: &str = "x";

/// Paymoのタイムエントリーを操作するためのリポジトリ。
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PaymoRepository: Send + Sync {
    /// タイムエントリーを作成し、作成されたエントリーを返す。
    async fn create_time_entry(&self, entry: &NewTimeEntry) -> Result<TimeEntry>;

    /// 指定ユーザーの計測中(duration 0)のタイムエントリーを取得する。
    ///
    /// 並び順はPaymo APIが返した順のまま。
    async fn read_open_time_entries(&self, user_id: &str) -> Result<Vec<TimeEntry>>;

    /// タイムエントリーに終了時刻を設定する。
    async fn close_time_entry(&self, entry_id: &str, end_time: &str) -> Result<()>;
}

/// タイムエントリーのレスポンス。
///
/// Paymoは`{"timeentries": [...]}`で包んで返すが、素の配列やオブジェクトも受け付ける。
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TimeEntriesResponse {
    Wrapped { timeentries: Vec<TimeEntry> },
    List(Vec<TimeEntry>),
    Single(TimeEntry),
}

impl TimeEntriesResponse {
    fn into_entries(self) -> Vec<TimeEntry> {
        match self {
            Self::Wrapped { timeentries } => timeentries,
            Self::List(entries) => entries,
            Self::Single(entry) => vec![entry],
        }
    }
}

/// Paymo APIと通信するためのクライアント。
///
/// # Examples
///
/// ```
/// let client = PaymoClient::new(DEFAULT_PAYMO_API_URL, &api_key, Duration::from_secs(30)).unwrap();
/// let entries = client.read_open_time_entries("987654").await.unwrap();
/// ```
pub struct PaymoClient {
    client: Client,
    api_url: String,
    api_key: String,
}

impl PaymoClient {
    /// 新しい`PaymoClient`を返す。
    ///
    /// # Arguments
    ///
    /// * `api_url` - Paymo APIのベースURL
    /// * `api_key` - Basic認証のユーザー名として使うAPIキー
    /// * `timeout` - 1リクエストあたりのタイムアウト
    pub fn new(api_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build http client for Paymo")?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn time_entries_url(&self) -> String {
        format!("{}/timeentries", self.api_url)
    }
}

#[async_trait]
impl PaymoRepository for PaymoClient {
    async fn create_time_entry(&self, entry: &NewTimeEntry) -> Result<TimeEntry> {
        let url = self.time_entries_url();
        let created = self
            .client
            .post(&url)
            .basic_auth(&self.api_key, Some(API_KEY_PASSWORD))
            .header(CONTENT_TYPE, "application/json")
            .json(entry)
            .send()
            .await
            .with_context(|| format!("Failed to send request to Paymo API at {}", url))?
            .error_for_status()
            .context("Request returned an error status")?
            .json::<TimeEntriesResponse>()
            .await
            .context("Failed to deserialize response")?
            .into_entries()
            .into_iter()
            .next()
            .context("Paymo API returned no time entry")?;
        info!("Time entry created: {}", created.id);

        Ok(created)
    }

    async fn read_open_time_entries(&self, user_id: &str) -> Result<Vec<TimeEntry>> {
        let url = self.time_entries_url();
        let entries = self
            .client
            .get(&url)
            .basic_auth(&self.api_key, Some(API_KEY_PASSWORD))
            .header(CONTENT_TYPE, "application/json")
            .query(&[("where", format!("user_id={};duration=0", user_id))])
            .send()
            .await
            .with_context(|| format!("Failed to send request to Paymo API at {}", url))?
            .error_for_status()
            .context("Request returned an error status")?
            .json::<TimeEntriesResponse>()
            .await
            .context("Failed to deserialize response")?
            .into_entries();
        debug!("length of open time entries: {}", entries.len());

        Ok(entries)
    }

    async fn close_time_entry(&self, entry_id: &str, end_time: &str) -> Result<()> {
        let url = format!("{}/{}", self.time_entries_url(), entry_id);
        self.client
            .put(&url)
            .basic_auth(&self.api_key, Some(API_KEY_PASSWORD))
            .header(CONTENT_TYPE, "application/json")
            .json(&CloseTimeEntry {
                end_time: end_time.to_string(),
            })
            .send()
            .await
            .with_context(|| format!("Failed to send request to Paymo API at {}", url))?
            .error_for_status()
            .context("Request returned an error status")?;
        info!("Time entry closed: {}", entry_id);

        Ok(())
    }
}
