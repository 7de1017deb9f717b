use std::{io, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

mod config;
mod console;
mod datetime;
mod delivery;
mod logging;
mod paymo;
mod slack;
mod socket_mode;
mod time_entry;
mod track_command;
mod user_map;
mod webhook;

use config::{PaymoSettings, SocketModeSettings, WebhookSettings};
use console::{ConsolePlainText, ConsolePresenter};
use delivery::{run_delivery, DeliveryAdapter};
use paymo::{PaymoClient, PaymoRepository};
use slack::{ResponseUrlResponder, SlackApiClient};
use socket_mode::SocketModeAdapter;
use track_command::{StopPolicy, TrackCommand};
use user_map::UserMap;
use webhook::WebhookAdapter;

/// Socket Modeの再接続までの待ち時間。
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Slackの`/track`コマンドでPaymoのタイムエントリーを開始・停止する。
///
/// # Examples
/// ```
/// $ cargo run -- serve --bind 0.0.0.0:3000
/// $ cargo run -- socket
/// $ cargo run -- track --user U1234ABCD start 12345
/// ```
#[derive(Debug, Parser)]
#[clap(version, about)]
struct Args {
    #[clap(
        long = "users",
        global = true,
        help = "Path to the JSON map of Slack user ids to Paymo user ids"
    )]
    users: Option<PathBuf>,

    #[clap(
        long = "stop-policy",
        arg_enum,
        global = true,
        default_value = "first",
        help = "What `/track stop` does when several entries are running"
    )]
    stop_policy: StopPolicy,

    #[clap(
        long = "timeout-secs",
        global = true,
        default_value_t = 30,
        help = "Timeout for each outbound HTTP request"
    )]
    timeout_secs: u64,

    #[clap(short = 'v', long = "verbose", global = true, help = "Enable debug logs")]
    verbose: bool,

    #[clap(subcommand)]
    subcommand: SubCommands,
}

/// サブコマンドを表す列挙型。
#[derive(Debug, Subcommand)]
enum SubCommands {
    /// Receive slash commands over HTTP
    Serve(ServeArgs),
    /// Receive slash commands over Slack Socket Mode
    Socket,
    /// Run a single /track invocation locally and print the reply
    Track(TrackArgs),
}

#[derive(Debug, clap::Args)]
struct ServeArgs {
    #[clap(long = "bind", default_value = "0.0.0.0:3000", help = "Address to listen on")]
    bind: SocketAddr,
}

#[derive(Debug, clap::Args)]
struct TrackArgs {
    #[clap(long = "user", help = "Slack user id to act as")]
    user: String,

    #[clap(help = "Command text, e.g. `start 12345` or `stop`")]
    text: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::setup_logger(args.verbose)?;

    let timeout = Duration::from_secs(args.timeout_secs.max(1));
    let paymo_settings = PaymoSettings::from_env()?;

    match args.subcommand {
        SubCommands::Serve(serve) => {
            let webhook_settings = WebhookSettings::from_env()?;
            let command = build_command(args.users, args.stop_policy, &paymo_settings, timeout)?;
            let responder = Arc::new(ResponseUrlResponder::new(timeout)?);
            let adapter =
                WebhookAdapter::bind(serve.bind, &webhook_settings.signing_secret, responder)
                    .await?;
            run_until_shutdown(adapter, command).await?;
        }
        SubCommands::Socket => {
            let socket_settings = SocketModeSettings::from_env()?;
            let command = build_command(args.users, args.stop_policy, &paymo_settings, timeout)?;
            let slack = SlackApiClient::new(
                &socket_settings.api_url,
                &socket_settings.app_token,
                &socket_settings.bot_token,
                timeout,
            )?;
            let responder = Arc::new(ResponseUrlResponder::new(timeout)?);
            let adapter = SocketModeAdapter::connect(slack, RECONNECT_DELAY, responder).await?;
            run_until_shutdown(adapter, command).await?;
        }
        SubCommands::Track(track) => {
            let command = build_command(args.users, args.stop_policy, &paymo_settings, timeout)?;
            let reply = command.run(&track.user, &track.text.join(" ")).await;
            let mut stdout = io::stdout();
            ConsolePlainText::new(&mut stdout).show_reply(&reply)?;
        }
    }

    Ok(())
}

/// ユーザー対応表を読み込み、`TrackCommand`を組み立てる。
fn build_command(
    users: Option<PathBuf>,
    stop_policy: StopPolicy,
    paymo_settings: &PaymoSettings,
    timeout: Duration,
) -> Result<Arc<TrackCommand<PaymoClient>>> {
    let user_map_path = config::resolve_user_map_path(users)?;
    let user_map = UserMap::load(&user_map_path).context("Failed to load user map")?;
    if user_map.is_empty() {
        warn!("User map {} has no entries", user_map_path.display());
    }
    let paymo = PaymoClient::new(&paymo_settings.api_url, &paymo_settings.api_key, timeout)
        .context("Failed to new paymo client")?;

    Ok(Arc::new(TrackCommand::new(paymo, user_map, stop_policy)))
}

/// Ctrl-Cを受け取るまで受信ループを回す。処理中のコマンドは返信してから終了する。
async fn run_until_shutdown<A, T>(adapter: A, command: Arc<TrackCommand<T>>) -> Result<()>
where
    A: DeliveryAdapter,
    T: PaymoRepository + 'static,
{
    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(error) => {
                warn!("Failed to listen for Ctrl-C: {}", error);
                std::future::pending::<()>().await;
            }
        }
    };

    run_delivery(adapter, command, shutdown).await
}
