//! Stage tracker: the append-only NDJSON run ledger.
//!
//! Producers (the pipeline and render workers) only enqueue events; one
//! tokio task owns `logs/build_summary.jsonl` and performs every write.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use site2docs_renderer::{RenderNotice, RenderReporter};
use site2docs_shared::{
    RenderEventKind, Result, RunId, Site2DocsError, Stage, StageCounters, StageEvent,
    relative_slash_path,
};

/// Ledger file name under `<output>/logs/`.
pub const LEDGER_FILE: &str = "build_summary.jsonl";

enum LedgerMessage {
    Event(StageEvent),
    Close,
}

// ---------------------------------------------------------------------------
// LedgerSink
// ---------------------------------------------------------------------------

/// Cloneable handle that stamps and enqueues ledger events.
#[derive(Clone)]
struct LedgerSink {
    run_id: RunId,
    input_dir: Arc<str>,
    output_dir: Arc<str>,
    tx: mpsc::UnboundedSender<LedgerMessage>,
}

impl LedgerSink {
    fn emit(&self, stage: Stage, counters: StageCounters) {
        let event = StageEvent {
            run_id: self.run_id,
            at: Utc::now(),
            input_dir: self.input_dir.to_string(),
            output_dir: self.output_dir.to_string(),
            stage,
            counters,
        };
        if self.tx.send(LedgerMessage::Event(event)).is_err() {
            warn!(%stage, "ledger writer closed; event dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// StageTracker
// ---------------------------------------------------------------------------

/// Enforces forward stage order and feeds the ledger writer.
pub struct StageTracker {
    sink: LedgerSink,
    current: Option<Stage>,
    previous: Option<Stage>,
    input_root: PathBuf,
    last_file: Arc<Mutex<Option<String>>>,
    writer: JoinHandle<Result<Vec<StageEvent>>>,
}

impl StageTracker {
    /// Truncate `<output_dir>/logs/build_summary.jsonl` and start the writer task.
    pub fn start(run_id: RunId, input_dir: &Path, output_dir: &Path) -> Result<Self> {
        let logs_dir = output_dir.join("logs");
        std::fs::create_dir_all(&logs_dir).map_err(|e| Site2DocsError::io(&logs_dir, e))?;
        let path = logs_dir.join(LEDGER_FILE);
        let file = std::fs::File::create(&path).map_err(|e| Site2DocsError::io(&path, e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_ledger(path, tokio::fs::File::from_std(file), rx));

        Ok(Self {
            sink: LedgerSink {
                run_id,
                input_dir: input_dir.display().to_string().into(),
                output_dir: output_dir.display().to_string().into(),
                tx,
            },
            current: None,
            previous: None,
            input_root: input_dir.to_path_buf(),
            last_file: Arc::new(Mutex::new(None)),
            writer,
        })
    }

    pub fn current(&self) -> Option<Stage> {
        self.current
    }

    /// Move to `next` and append its line.
    ///
    /// Stages advance one step at a time; the only permitted skip is
    /// `writing → completed` when the audit is disabled.
    pub fn advance(&mut self, next: Stage, counters: StageCounters) -> Result<()> {
        let Some(next_rank) = next.rank() else {
            return Err(Site2DocsError::Ledger(
                "the failed stage is only reachable through fail()".into(),
            ));
        };
        let allowed = match self.current.and_then(Stage::rank) {
            None => self.current.is_none() && next_rank == 0,
            Some(rank) => {
                next_rank == rank + 1
                    || (self.current == Some(Stage::Writing) && next == Stage::Completed)
            }
        };
        if !allowed {
            let from = self.current.map_or("start", Stage::as_str);
            return Err(Site2DocsError::Ledger(format!(
                "illegal stage transition {from} -> {next}"
            )));
        }

        self.note_file(counters.last_file.as_deref());
        self.previous = self.current;
        self.current = Some(next);
        self.sink.emit(next, counters);
        Ok(())
    }

    /// Append a progress line for the current stage.
    pub fn record(&self, counters: StageCounters) -> Result<()> {
        let Some(stage) = self.current else {
            return Err(Site2DocsError::Ledger("no stage entered yet".into()));
        };
        self.note_file(counters.last_file.as_deref());
        self.sink.emit(stage, counters);
        Ok(())
    }

    /// A reporter for render workers; each notice becomes a `rendering` line.
    pub fn render_sink(&self) -> RenderLedger {
        RenderLedger {
            sink: self.sink.clone(),
            completed: Arc::new(AtomicUsize::new(0)),
            last_file: Arc::clone(&self.last_file),
        }
    }

    /// Append the terminal failure line and wrap `error` with the same context.
    ///
    /// `last_completed_stage` is the stage entered before the one that failed.
    pub fn fail(&mut self, error: Site2DocsError) -> Site2DocsError {
        let last_file = error
            .offending_file()
            .map(|p| {
                if p.starts_with(&self.input_root) {
                    relative_slash_path(&self.input_root, p)
                } else {
                    p.display().to_string()
                }
            })
            .or_else(|| self.last_file.lock().ok().and_then(|g| g.clone()));
        let failed_stage = self.current.unwrap_or(Stage::Discovered);
        let counters = StageCounters {
            failed_stage: Some(failed_stage),
            last_completed_stage: self.previous,
            last_file: last_file.clone(),
            error: Some(error.to_string()),
            ..StageCounters::default()
        };
        self.sink.emit(Stage::Failed, counters);
        let fatal = Site2DocsError::Fatal {
            failed_stage,
            last_completed_stage: self.previous,
            last_file,
            cause: Box::new(error),
        };
        self.previous = self.current;
        self.current = Some(Stage::Failed);
        fatal
    }

    /// Flush and close the ledger, returning every line written.
    pub async fn finish(self) -> Result<Vec<StageEvent>> {
        let _ = self.sink.tx.send(LedgerMessage::Close);
        self.writer
            .await
            .map_err(|e| Site2DocsError::Ledger(format!("ledger writer task failed: {e}")))?
    }

    fn note_file(&self, file: Option<&str>) {
        if let (Some(file), Ok(mut guard)) = (file, self.last_file.lock()) {
            *guard = Some(file.to_string());
        }
    }
}

async fn write_ledger(
    path: PathBuf,
    mut file: tokio::fs::File,
    mut rx: mpsc::UnboundedReceiver<LedgerMessage>,
) -> Result<Vec<StageEvent>> {
    let mut written = Vec::new();
    while let Some(LedgerMessage::Event(event)) = rx.recv().await {
        let mut line = serde_json::to_string(&event)
            .map_err(|e| Site2DocsError::Ledger(format!("event serialization failed: {e}")))?;
        debug!(target: "site2docs::ledger", "{line}");
        line.push('\n');
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Site2DocsError::io(&path, e))?;
        file.flush().await.map_err(|e| Site2DocsError::io(&path, e))?;
        written.push(event);
    }
    Ok(written)
}

// ---------------------------------------------------------------------------
// RenderLedger
// ---------------------------------------------------------------------------

/// Render reporter that turns attempt notices into `rendering` ledger lines.
#[derive(Clone)]
pub struct RenderLedger {
    sink: LedgerSink,
    completed: Arc<AtomicUsize>,
    last_file: Arc<Mutex<Option<String>>>,
}

impl RenderReporter for RenderLedger {
    fn notice(&self, notice: RenderNotice) {
        let rendered = match notice.kind {
            RenderEventKind::Success | RenderEventKind::Fallback => {
                Some(self.completed.fetch_add(1, Ordering::SeqCst) + 1)
            }
            _ => None,
        };
        if let Ok(mut guard) = self.last_file.lock() {
            *guard = Some(notice.file.clone());
        }
        self.sink.emit(
            Stage::Rendering,
            StageCounters {
                event: Some(notice.kind),
                attempt: Some(notice.attempt),
                reason: notice.reason,
                rendered,
                last_file: Some(notice.file),
                ..StageCounters::default()
            },
        );
    }
}
