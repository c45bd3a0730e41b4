use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt as _;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use super::{LoggingPlugin, PluginsState};

/// Logging plugin emitting one TSV line per terminal exchange. Lines are
/// handed to a single writer task over an unbounded channel so the hot
/// path never waits on the filesystem.
pub struct QueryLogPlugin {
    tx: UnboundedSender<String>,
}

pub struct QueryLogWriter {
    path: PathBuf,
    rx: UnboundedReceiver<String>,
}

pub fn query_log(path: PathBuf) -> (QueryLogPlugin, QueryLogWriter) {
    let (tx, rx) = unbounded_channel();
    (QueryLogPlugin { tx }, QueryLogWriter { path, rx })
}

impl LoggingPlugin for QueryLogPlugin {
    fn log(&self, state: &PluginsState) {
        // A closed receiver only means we are shutting down
        let _ = self.tx.send(format_line(state));
    }
}

fn format_line(state: &PluginsState) -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    format!(
        "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}ms\n",
        now,
        state.client_addr.ip(),
        state.client_proto,
        state.qname.as_deref().unwrap_or("-"),
        state.qtype.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string()),
        state.return_code,
        state.server_name,
        state.start.elapsed().as_millis(),
    )
}

impl QueryLogWriter {
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open query log {}", self.path.display()))?;
        while let Some(line) = self.rx.recv().await {
            file.write_all(line.as_bytes())
                .await
                .context("failed to append to the query log")?;
        }
        Ok(())
    }
}
