use std::io::Write;

use anyhow::{Context, Result};

use crate::track_command::TrackReply;

/// Consoleに`/track`の返信を表示するためのtrait。
pub trait ConsolePresenter {
    /// 返信を表示する。
    ///
    /// # Arguments
    ///
    /// * `reply` - 表示する返信
    fn show_reply(&mut self, reply: &TrackReply) -> Result<()>;
}

/// 返信をSlackに送る文面のまま1行で表示する。
pub struct ConsolePlainText<'a, W: Write> {
    writer: &'a mut W,
}

impl<'a, W: Write> ConsolePlainText<'a, W> {
    /// 新しい`ConsolePlainText`を返す。
    pub fn new(writer: &'a mut W) -> Self {
        Self { writer }
    }
}

impl<'a, W: Write> ConsolePresenter for ConsolePlainText<'a, W> {
    fn show_reply(&mut self, reply: &TrackReply) -> Result<()> {
        writeln!(self.writer, "{}", reply)
            .with_context(|| format!("Failed to write reply: {:?}", reply))?;

        Ok(())
    }
}
