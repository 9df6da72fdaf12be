//! JSONL signal source: stdin or a tailed file
//!
//! Each line is one `InboundSignal`:
//!
//! ```text
//! {"type":"content","group_key":"g1","sequence_id":101,"author_channel":"news","body_text":"Hi","media":[{"kind":"photo","source_url":"https://..."}]}
//! {"type":"view","subject_id":42,"actor_id":7}
//! ```
//!
//! Content goes to the ingestion listener. Views are written on tracked tasks,
//! at most `max_inflight_views` at a time; `pump` and `tail` wait for all of
//! them before returning.

use super::engagement::EngagementDeduplicator;
use super::ingestion::{IngestError, IngestionListener};
use super::types::InboundSignal;
use chrono::Utc;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::sleep;

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

const DEFAULT_MAX_INFLIGHT_VIEWS: usize = 64;

pub fn parse_signal(line: &str) -> Result<InboundSignal, IngestError> {
    serde_json::from_str(line).map_err(|e| IngestError::Parse(e.to_string()))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub content: u64,
    pub views: u64,
    pub malformed: u64,
}

pub struct JsonlSource {
    listener: IngestionListener,
    dedup: Arc<EngagementDeduplicator>,
    views: JoinSet<()>,
    max_inflight_views: usize,
    stop: Option<oneshot::Receiver<()>>,
    stats: SourceStats,
}

impl JsonlSource {
    pub fn new(listener: IngestionListener, dedup: Arc<EngagementDeduplicator>) -> Self {
        Self {
            listener,
            dedup,
            views: JoinSet::new(),
            max_inflight_views: DEFAULT_MAX_INFLIGHT_VIEWS,
            stop: None,
            stats: SourceStats::default(),
        }
    }

    pub fn with_max_inflight_views(mut self, max: usize) -> Self {
        self.max_inflight_views = max.max(1);
        self
    }

    /// Stop reading once `stop` fires (or its sender is dropped)
    pub fn with_stop(mut self, stop: oneshot::Receiver<()>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn stats(&self) -> SourceStats {
        self.stats
    }

    /// View writes started but not yet reaped
    pub fn pending_views(&self) -> usize {
        self.views.len()
    }

    /// Decode and dispatch one line; malformed lines are logged and skipped
    ///
    /// Only a closed ingestion channel is reported as an error. Waits only
    /// when `max_inflight_views` view writes are already running.
    pub async fn handle_line(&mut self, line: &str) -> Result<(), IngestError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }

        match parse_signal(line) {
            Ok(InboundSignal::Content(event)) => {
                self.stats.content += 1;
                self.listener.on_event(event)
            }
            Ok(InboundSignal::View {
                subject_id,
                actor_id,
            }) => {
                self.stats.views += 1;
                self.spawn_view(subject_id, actor_id).await;
                Ok(())
            }
            Err(e) => {
                self.stats.malformed += 1;
                log::warn!("⚠️  Skipping malformed line: {} ({})", e, truncate(line, 120));
                Ok(())
            }
        }
    }

    async fn spawn_view(&mut self, subject_id: i64, actor_id: i64) {
        while self.views.len() >= self.max_inflight_views {
            self.reap_view().await;
        }

        let dedup = self.dedup.clone();
        let now = Utc::now();
        self.views.spawn(async move {
            if let Err(e) = dedup.record_view(subject_id, actor_id, now).await {
                log::error!(
                    "❌ Failed to record view {}/{}: {}",
                    subject_id,
                    actor_id,
                    e
                );
            }
        });
    }

    /// Wait for one view write; false when none are running
    async fn reap_view(&mut self) -> bool {
        match self.views.join_next().await {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                log::error!("❌ View task failed: {}", e);
                true
            }
            None => false,
        }
    }

    /// Wait until every started view write has finished
    pub async fn drain_views(&mut self) {
        let pending = self.views.len();
        if pending > 0 {
            log::debug!("⏳ Waiting for {} view writes", pending);
        }
        while self.reap_view().await {}
    }

    /// Consume `reader` until EOF (stdin, pipes, fixtures) or a stop request
    pub async fn pump<R>(&mut self, reader: R) -> Result<SourceStats, IngestError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let result = loop {
            let next = tokio::select! {
                next = lines.next_line() => next,
                _ = stop_requested(&mut self.stop) => {
                    self.stop = None;
                    log::info!("🛑 Stop requested, closing source");
                    break Ok(());
                }
            };

            match next {
                Ok(Some(line)) => {
                    if let Err(e) = self.handle_line(&line).await {
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => {
                    log::error!("❌ Source read failed: {}", e);
                    break Ok(());
                }
            }
        };

        self.drain_views().await;
        result?;

        log::info!(
            "📭 Source exhausted: {} content, {} views, {} malformed",
            self.stats.content,
            self.stats.views,
            self.stats.malformed
        );
        Ok(self.stats)
    }

    /// Follow `path` like `tail -F` until a stop request or the ingestion
    /// channel closes
    pub async fn tail(&mut self, path: PathBuf) -> Result<SourceStats, IngestError> {
        let mut reader = TailReader::new(path);

        let result = loop {
            if self.listener.is_closed() {
                break Err(IngestError::ChannelClosed);
            }

            if !reader.is_open() {
                if let Err(e) = reader.start().await {
                    log::warn!("⚠️  Cannot open {}: {}, retrying", reader.path.display(), e);
                    sleep(Duration::from_secs(1)).await;
                    continue;
                }
            }

            let next = tokio::select! {
                next = reader.read_line() => next,
                _ = stop_requested(&mut self.stop) => {
                    self.stop = None;
                    log::info!("🛑 Stop requested, closing source");
                    break Ok(());
                }
            };

            match next {
                Ok(line) => {
                    if let Err(e) = self.handle_line(&line).await {
                        break Err(e);
                    }
                }
                Err(e) => {
                    log::warn!("⚠️  Tail read failed: {}, reopening", e);
                    reader.close();
                    sleep(Duration::from_secs(1)).await;
                }
            }
        };

        self.drain_views().await;
        result.map(|()| self.stats)
    }
}

/// Resolves when a stop was requested; never resolves without a stop channel
async fn stop_requested(stop: &mut Option<oneshot::Receiver<()>>) {
    match stop.as_mut() {
        Some(rx) => {
            let _ = rx.await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Follows a JSONL file from its current end, reopening it after rotation
pub struct TailReader {
    path: PathBuf,
    file: Option<BufReader<File>>,
    inode: Option<u64>,
    poll_interval: Duration,
}

impl TailReader {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            inode: None,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn close(&mut self) {
        self.file = None;
        self.inode = None;
    }

    /// Open the file positioned at its end
    pub async fn start(&mut self) -> std::io::Result<()> {
        self.open(SeekFrom::End(0)).await?;
        log::info!("📖 Tailing {}", self.path.display());
        Ok(())
    }

    async fn open(&mut self, position: SeekFrom) -> std::io::Result<()> {
        let file = File::open(&self.path).await?;

        #[cfg(unix)]
        {
            self.inode = Some(file.metadata().await?.ino());
        }

        let mut reader = BufReader::new(file);
        reader.seek(position).await?;
        self.file = Some(reader);
        Ok(())
    }

    /// Next non-empty line, waiting for the writer as needed
    pub async fn read_line(&mut self) -> std::io::Result<String> {
        loop {
            if self.rotated().await? {
                log::info!("🔄 Rotation detected, reopening {}", self.path.display());
                // A rotated-in file is new, so read it from the start
                self.open(SeekFrom::Start(0)).await?;
            }

            let Some(reader) = self.file.as_mut() else {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "file not opened",
                ));
            };

            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                sleep(self.poll_interval).await;
                continue;
            }

            let line = line.trim();
            if !line.is_empty() {
                return Ok(line.to_string());
            }
        }
    }

    async fn rotated(&mut self) -> std::io::Result<bool> {
        #[cfg(unix)]
        {
            let current = match tokio::fs::metadata(&self.path).await {
                Ok(metadata) => metadata.ino(),
                // Mid-rotation: keep draining the old handle
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(e),
            };
            Ok(self.inode.is_some_and(|old| old != current))
        }

        #[cfg(not(unix))]
        {
            let Some(reader) = self.file.as_mut() else {
                return Ok(false);
            };
            let position = reader.stream_position().await?;
            let len = tokio::fs::metadata(&self.path).await?.len();
            Ok(len < position)
        }
    }
}
