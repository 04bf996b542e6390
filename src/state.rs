// src/state.rs
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Local};
use log::warn;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("status file i/o: {0}")]
    Io(#[from] io::Error),
    #[error("status file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunStatus {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Progress of the current sweep as seen by observers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub status: RunStatus,
    pub current_step: usize,
    pub total_steps: usize,
    pub updated_at: DateTime<Local>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            status: RunStatus::Idle,
            current_step: 0,
            total_steps: 0,
            updated_at: Local::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlRecord {
    pub running: bool,
    pub stop_requested: bool,
    pub updated_at: DateTime<Local>,
}

impl Default for ControlRecord {
    fn default() -> Self {
        Self {
            running: false,
            stop_requested: false,
            updated_at: Local::now(),
        }
    }
}

/// On-disk copies of the run state, the control record and the live feed,
/// so a second process can watch a sweep and ask it to stop.
#[derive(Clone, Debug)]
pub struct StatusFiles {
    progress: PathBuf,
    control: PathBuf,
    log: PathBuf,
}

fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StateError> {
    if !path.exists() {
        return Ok(T::default());
    }
    Ok(serde_json::from_reader(BufReader::new(File::open(path)?))?)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut w = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut w, value)?;
    w.flush()?;
    Ok(())
}

impl StatusFiles {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            progress: dir.join("progress_status.json"),
            control: dir.join("process_control.json"),
            log: dir.join("feed.log"),
        }
    }

    /// Appends one `[HH:MM:SS] message` line to the feed log.
    pub fn append_log(&self, message: &str) -> Result<(), StateError> {
        if let Some(dir) = self.log.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut f = OpenOptions::new().create(true).append(true).open(&self.log)?;
        writeln!(f, "[{}] {message}", Local::now().format("%H:%M:%S"))?;
        Ok(())
    }

    /// Last `max_lines` lines of the feed log, oldest first.
    pub fn read_log(&self, max_lines: usize) -> Result<Vec<String>, StateError> {
        if !self.log.exists() {
            return Ok(Vec::new());
        }
        let lines = BufReader::new(File::open(&self.log)?)
            .lines()
            .collect::<Result<Vec<_>, _>>()?;
        let skip = lines.len().saturating_sub(max_lines);
        Ok(lines.into_iter().skip(skip).collect())
    }

    pub fn clear_log(&self) -> Result<(), StateError> {
        if let Some(dir) = self.log.parent() {
            fs::create_dir_all(dir)?;
        }
        File::create(&self.log)?;
        Ok(())
    }

    pub fn read_progress(&self) -> Result<RunState, StateError> {
        read_json(&self.progress)
    }

    pub fn read_control(&self) -> Result<ControlRecord, StateError> {
        read_json(&self.control)
    }

    pub fn write_progress(&self, state: &RunState) -> Result<(), StateError> {
        write_json(&self.progress, state)
    }

    pub fn write_control(&self, record: &ControlRecord) -> Result<(), StateError> {
        write_json(&self.control, record)
    }

    /// Flags the control record so whichever process runs the sweep stops.
    pub fn request_stop(&self) -> Result<ControlRecord, StateError> {
        let mut record = self.read_control()?;
        record.stop_requested = true;
        record.updated_at = Local::now();
        self.write_control(&record)?;
        Ok(record)
    }
}

/// Shared between the sweep worker and the foreground. The foreground may
/// only request a stop and read state; the worker polls the stop flag at its
/// checkpoints, there is no forced interruption.
#[derive(Default)]
pub struct SweepControl {
    stop: AtomicBool,
    running: AtomicBool,
    state: Mutex<RunState>,
    files: Option<StatusFiles>,
}

impl SweepControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same as [`SweepControl::new`], mirrored to `files` on every change.
    pub fn mirrored(files: StatusFiles) -> Self {
        Self {
            files: Some(files),
            ..Self::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if self.is_running() {
            self.set_status(RunStatus::Stopping);
        }
        self.mirror_control();
    }

    /// Checks the in-memory flag, then the control file when mirrored. A stop
    /// seen in the file latches.
    pub fn is_stop_requested(&self) -> bool {
        if self.stop.load(Ordering::SeqCst) {
            return true;
        }
        let from_file = self
            .files
            .as_ref()
            .and_then(|f| f.read_control().ok())
            .map_or(false, |c| c.stop_requested);
        if from_file {
            self.stop.store(true, Ordering::SeqCst);
            if self.is_running() {
                self.set_status(RunStatus::Stopping);
            }
        }
        from_file
    }

    pub fn files(&self) -> Option<&StatusFiles> {
        self.files.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn run_state(&self) -> RunState {
        self.state().clone()
    }

    pub fn control(&self) -> ControlRecord {
        ControlRecord {
            running: self.is_running(),
            stop_requested: self.stop.load(Ordering::SeqCst),
            updated_at: self.state().updated_at,
        }
    }

    /// Clears any pending stop request and returns to Idle. Called by the
    /// foreground before launching a new sweep.
    pub fn reset(&self) {
        self.stop.store(false, Ordering::SeqCst);
        *self.state() = RunState::default();
        self.mirror_progress();
        self.mirror_control();
    }

    /// Marks a sweep of `total` steps as started. Idle is restored when the
    /// returned guard drops, however the run ends.
    pub(crate) fn begin(&self, total: usize) -> RunGuard<'_> {
        {
            let mut state = self.state();
            *state = RunState::default();
            state.status = RunStatus::Starting;
            state.total_steps = total;
        }
        self.running.store(true, Ordering::SeqCst);
        self.mirror_progress();
        self.mirror_control();
        RunGuard { control: self }
    }

    pub(crate) fn set_step(&self, step: usize, total: usize) {
        {
            let mut state = self.state();
            if state.status != RunStatus::Stopping {
                state.status = RunStatus::Running;
            }
            state.current_step = step;
            state.total_steps = total;
            state.updated_at = Local::now();
        }
        self.mirror_progress();
    }

    pub(crate) fn set_status(&self, status: RunStatus) {
        {
            let mut state = self.state();
            state.status = status;
            state.updated_at = Local::now();
        }
        self.mirror_progress();
    }

    fn finish(&self) {
        {
            let mut state = self.state();
            state.status = RunStatus::Idle;
            state.updated_at = Local::now();
        }
        self.running.store(false, Ordering::SeqCst);
        self.stop.store(false, Ordering::SeqCst);
        self.mirror_progress();
        self.mirror_control();
    }

    fn mirror_progress(&self) {
        if let Some(files) = &self.files {
            if let Err(e) = files.write_progress(&self.run_state()) {
                warn!("could not write progress status: {e}");
            }
        }
    }

    fn mirror_control(&self) {
        if let Some(files) = &self.files {
            if let Err(e) = files.write_control(&self.control()) {
                warn!("could not write process control: {e}");
            }
        }
    }
}

pub(crate) struct RunGuard<'a> {
    control: &'a SweepControl,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.control.finish();
    }
}
