//! JSONL event writer with daily file rotation.

use std::{
    fs::{self, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::NaiveDate;
use tracing::{debug, warn};

use super::{EventSink, SessionEvent};
use crate::{AppError, Result};

struct WriterState {
    current_date: NaiveDate,
    writer: BufWriter<fs::File>,
}

/// A daily-rotating JSONL event writer.
///
/// Appends one JSON object per line to `<log_dir>/events-YYYY-MM-DD.jsonl`.
/// Files are keyed by the event's UTC timestamp date; a new file is opened
/// when that date changes between writes.
pub struct JsonlEventWriter {
    log_dir: PathBuf,
    state: Mutex<Option<WriterState>>,
}

impl JsonlEventWriter {
    /// Construct a writer that stores logs in `log_dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the directory cannot be created.
    pub fn new(log_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&log_dir).map_err(|e| {
            AppError::Io(format!(
                "failed to create event log directory {}: {e}",
                log_dir.display()
            ))
        })?;
        Ok(Self {
            log_dir,
            state: Mutex::new(None),
        })
    }

    /// Path of the file written for `date`.
    #[must_use]
    pub fn file_for_date(&self, date: NaiveDate) -> PathBuf {
        self.log_dir.join(format!("events-{date}.jsonl"))
    }

    fn open_for_date(log_dir: &Path, date: NaiveDate) -> Result<BufWriter<fs::File>> {
        let path = log_dir.join(format!("events-{date}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AppError::Io(format!("failed to open event log {}: {e}", path.display())))?;
        Ok(BufWriter::new(file))
    }
}

impl EventSink for JsonlEventWriter {
    fn emit(&self, event: &SessionEvent) -> Result<()> {
        debug!(
            event = event.event.as_str(),
            session_id = %event.session_id,
            owner = %event.owner,
            "session event"
        );
        let today = event.timestamp.date_naive();

        let mut guard = self
            .state
            .lock()
            .map_err(|_| AppError::Io("event writer mutex poisoned".to_string()))?;

        if guard.as_ref().is_none_or(|s| s.current_date != today) {
            let writer = Self::open_for_date(&self.log_dir, today)?;
            *guard = Some(WriterState {
                current_date: today,
                writer,
            });
        }

        if let Some(state) = guard.as_mut() {
            let line = serde_json::to_string(event)
                .map_err(|e| AppError::Io(format!("failed to serialize event: {e}")))?;
            if let Err(e) = writeln!(state.writer, "{line}") {
                warn!("failed to write event log entry: {e}");
                return Err(AppError::Io(format!("event write failed: {e}")));
            }
            if let Err(e) = state.writer.flush() {
                warn!("failed to flush event log: {e}");
                return Err(AppError::Io(format!("event flush failed: {e}")));
            }
        }

        Ok(())
    }
}
