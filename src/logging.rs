use anyhow::{Context, Result};
use chrono::{Local, SecondsFormat};
use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;

/// ログの出力先を設定する。
///
/// 標準エラーに色付きのレベルとRFC3339のタイムスタンプで出力する。
/// HTTPクライアントなど依存クレートのログは警告以上に絞る。
///
/// # Arguments
///
/// * `verbose` - `true`の場合はdebugレベルまで出力する
pub fn setup_logger(verbose: bool) -> Result<()> {
    let colors = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::Green)
        .debug(Color::Blue);

    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} {} [{}] {}",
                Local::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                colors.color(record.level()),
                record.target(),
                message
            ))
        })
        .level(level_filter(verbose))
        .level_for("hyper", LevelFilter::Warn)
        .level_for("hyper_util", LevelFilter::Warn)
        .level_for("reqwest", LevelFilter::Warn)
        .level_for("tungstenite", LevelFilter::Warn)
        .level_for("tokio_tungstenite", LevelFilter::Warn)
        .chain(std::io::stderr())
        .apply()
        .context("Failed to set up logger")?;

    Ok(())
}

fn level_filter(verbose: bool) -> LevelFilter {
    if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

#[cfg(test)]
mod tests {
    use log::LevelFilter;
    use rstest::rstest;

    use super::level_filter;

    #[rstest]
    #[case(false, LevelFilter::Info)]
    #[case(true, LevelFilter::Debug)]
    fn test_level_filter(#[case] verbose: bool, #[case] expected: LevelFilter) {
        assert_eq!(level_filter(verbose), expected);
    }
}
