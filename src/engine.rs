// src/engine.rs
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::error;
use thiserror::Error;

use crate::plan::FrequencyPlan;
use crate::procedure::{measure_point, Bench, PointOutcome};
use crate::recorder::ResultStore;
use crate::state::{RunStatus, SweepControl};
use crate::types::{Feed, InvalidSignal, SignalConfig, SweepEvent, Timing};

/// Everything a sweep needs besides the store and the control handle.
#[derive(Clone)]
pub struct SweepJob {
    pub bench: Bench,
    pub signal: SignalConfig,
    pub timing: Timing,
    pub plan: FrequencyPlan,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub measured: usize,
    pub failed: usize,
    pub total: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweepOutcome {
    Completed(SweepSummary),
    Stopped(SweepSummary),
}

impl SweepOutcome {
    pub fn summary(&self) -> SweepSummary {
        match self {
            SweepOutcome::Completed(s) | SweepOutcome::Stopped(s) => *s,
        }
    }

    /// A sweep counts as successful when it ran to the end, even with
    /// failed points.
    pub fn is_success(&self) -> bool {
        matches!(self, SweepOutcome::Completed(_))
    }
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("the frequency plan is empty")]
    NoFrequencies,
    #[error("a sweep is already running")]
    AlreadyRunning,
    #[error(transparent)]
    InvalidSignal(#[from] InvalidSignal),
    #[error("could not start the sweep thread: {0}")]
    Spawn(#[source] io::Error),
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}

/// Measures every frequency of the plan in order.
///
/// A failing or panicking point is logged and skipped. The stop flag is
/// checked before each point and by the point itself; once seen, no further
/// point starts. The run state reads Idle again when this returns.
pub fn run_sweep(
    job: &SweepJob,
    store: &ResultStore,
    control: &SweepControl,
    tx: Option<&Sender<SweepEvent>>,
) -> Result<SweepOutcome, SweepError> {
    if job.plan.is_empty() {
        return Err(SweepError::NoFrequencies);
    }
    job.signal.validate()?;
    let feed = Feed::new(tx).with_log_file(control.files());
    let total = job.plan.len();
    let _run = control.begin(total);
    let stop = || control.is_stop_requested();
    let mut summary = SweepSummary {
        total,
        ..SweepSummary::default()
    };
    let mut stopped = false;

    for (i, &frequency) in job.plan.frequencies().iter().enumerate() {
        let step = i + 1;
        if stop() {
            stopped = true;
            break;
        }
        control.set_step(step, total);
        feed.log(format!("Starting measurement {step}/{total} at {frequency} Hz"));
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            measure_point(&job.bench, frequency, &job.signal, &job.timing, store, feed, &stop)
        }));
        match result {
            Ok(Ok(PointOutcome::Measured(_))) => summary.measured += 1,
            Ok(Ok(PointOutcome::Stopped)) => {
                stopped = true;
                break;
            }
            Ok(Err(e)) => {
                summary.failed += 1;
                feed.log(format!("Measurement at {frequency} Hz failed: {e}"));
            }
            Err(payload) => {
                summary.failed += 1;
                let msg = panic_message(payload.as_ref());
                error!("measurement at {frequency} Hz panicked: {msg}");
                feed.emit(SweepEvent::Log(format!("Measurement at {frequency} Hz crashed: {msg}")));
            }
        }
        feed.emit(SweepEvent::Progress { step, total });
        if stop() {
            stopped = true;
            break;
        }
        if !job.timing.inter_point.is_zero() {
            thread::sleep(job.timing.inter_point);
        }
    }

    if stopped {
        control.set_status(RunStatus::Stopped);
        feed.log(format!(
            "Sweep stopped: {}/{total} points measured.",
            summary.measured
        ));
    } else {
        feed.log(format!(
            "Sweep finished: {}/{total} points measured.",
            summary.measured
        ));
    }
    feed.emit(SweepEvent::Finished {
        measured: summary.measured,
        total,
        stopped,
    });
    Ok(if stopped {
        SweepOutcome::Stopped(summary)
    } else {
        SweepOutcome::Completed(summary)
    })
}

/// Runs [`run_sweep`] on a named background thread. The caller keeps its
/// handle on `control` to watch progress and request a stop.
pub fn spawn_sweep(
    job: SweepJob,
    store: Arc<ResultStore>,
    control: Arc<SweepControl>,
    tx: Sender<SweepEvent>,
) -> Result<JoinHandle<Result<SweepOutcome, SweepError>>, SweepError> {
    if control.is_running() {
        return Err(SweepError::AlreadyRunning);
    }
    if job.plan.is_empty() {
        return Err(SweepError::NoFrequencies);
    }
    thread::Builder::new()
        .name("sweep".into())
        .spawn(move || run_sweep(&job, &store, &control, Some(&tx)))
        .map_err(SweepError::Spawn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{Endpoint, MeasurementKind};
    use crate::sim::SimBench;
    use crate::state::StatusFiles;
    use crate::types::Channel;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bode-sweep-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sim(respond: impl Fn(f64, Channel, MeasurementKind) -> String + Send + Sync + 'static) -> SimBench {
        SimBench::new(
            Endpoint::new("afg.local", 1026),
            Endpoint::new("scope.local", 3000),
            move |gen, ch, kind| respond(gen.frequency, ch, kind),
        )
    }

    fn job(sim: &SimBench, frequencies: Vec<f64>) -> SweepJob {
        SweepJob {
            bench: sim.bench(),
            signal: SignalConfig::default(),
            timing: Timing::without_delays(),
            plan: FrequencyPlan::from_frequencies(frequencies).unwrap(),
        }
    }

    #[test]
    fn unity_gain_sweep_stores_every_point() {
        let sim = sim(|_, _, _| "0.1".into());
        let store = ResultStore::new(scratch("unity").join("gain_data.json"));
        let control = SweepControl::new();
        let outcome = run_sweep(&job(&sim, vec![10.0, 100.0, 1000.0]), &store, &control, None).unwrap();
        assert_eq!(
            outcome,
            SweepOutcome::Completed(SweepSummary { measured: 3, failed: 0, total: 3 })
        );
        let data = store.load().unwrap();
        assert_eq!(data.measurements.len(), 3);
        assert!(data.measurements.iter().all(|p| p.gain_pk2pk == 1.0 && p.gain_pk2pk_db == 0.0));
        assert_eq!(control.run_state().status, RunStatus::Idle);
        assert_eq!(sim.open_connections(), 0);
    }

    #[test]
    fn failed_point_is_skipped() {
        let sim = sim(|f, ch, _| if f == 1000.0 && ch == Channel::Ch1 { "0".into() } else { "0.1".into() });
        let store = ResultStore::new(scratch("skip").join("gain_data.json"));
        let (tx, rx) = channel();
        let outcome = run_sweep(&job(&sim, vec![10.0, 1000.0, 5000.0]), &store, &SweepControl::new(), Some(&tx)).unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.summary(), SweepSummary { measured: 2, failed: 1, total: 3 });
        assert!(store.load().unwrap().get(1000.0).is_none());
        drop(tx);
        let events: Vec<SweepEvent> = rx.iter().collect();
        let progress = events.iter().filter(|e| matches!(e, SweepEvent::Progress { .. })).count();
        assert_eq!(progress, 3);
        assert!(matches!(
            events.last(),
            Some(SweepEvent::Finished { measured: 2, total: 3, stopped: false })
        ));
    }

    #[test]
    fn stop_requested_before_start_measures_nothing() {
        let sim = sim(|_, _, _| "0.1".into());
        let store = ResultStore::new(scratch("prestop").join("gain_data.json"));
        let control = SweepControl::new();
        control.request_stop();
        let outcome = run_sweep(&job(&sim, vec![10.0, 100.0]), &store, &control, None).unwrap();
        assert_eq!(outcome, SweepOutcome::Stopped(SweepSummary { measured: 0, failed: 0, total: 2 }));
        assert!(sim.commands().is_empty());
        assert!(store.load().unwrap().measurements.is_empty());
        assert_eq!(control.run_state().status, RunStatus::Idle);
    }

    #[test]
    fn empty_plan_is_rejected_before_any_io() {
        let sim = sim(|_, _, _| "0.1".into());
        let store = ResultStore::new(scratch("empty").join("gain_data.json"));
        let err = run_sweep(&job(&sim, vec![]), &store, &SweepControl::new(), None).unwrap_err();
        assert!(matches!(err, SweepError::NoFrequencies));
        assert!(sim.commands().is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn repeated_sweep_overwrites_instead_of_growing() {
        let sim = sim(|_, _, _| "0.1".into());
        let store = ResultStore::new(scratch("repeat").join("gain_data.json"));
        let control = SweepControl::new();
        let job = job(&sim, vec![10.0, 100.0]);
        run_sweep(&job, &store, &control, None).unwrap();
        run_sweep(&job, &store, &control, None).unwrap();
        assert_eq!(store.load().unwrap().measurements.len(), 2);
    }

    #[test]
    fn panicking_point_does_not_end_the_sweep() {
        let sim = sim(|f, _, _| {
            if f == 100.0 {
                panic!("scope firmware crash");
            }
            "0.1".into()
        });
        let store = ResultStore::new(scratch("panic").join("gain_data.json"));
        let outcome = run_sweep(&job(&sim, vec![10.0, 100.0, 1000.0]), &store, &SweepControl::new(), None).unwrap();
        assert_eq!(outcome.summary(), SweepSummary { measured: 2, failed: 1, total: 3 });
        assert!(!sim.output_enabled());
        assert_eq!(sim.open_connections(), 0);
    }

    #[test]
    fn background_sweep_stops_on_request() {
        let sim = sim(|_, _, _| "0.1".into());
        let store = Arc::new(ResultStore::new(scratch("spawn").join("gain_data.json")));
        let control = Arc::new(SweepControl::new());
        let mut job = job(&sim, (1..=10).map(|i| i as f64 * 100.0).collect());
        job.timing.inter_point = Duration::from_millis(50);
        let (tx, rx) = channel();
        let handle = spawn_sweep(job.clone(), store.clone(), control.clone(), tx).unwrap();
        for event in rx.iter() {
            if matches!(event, SweepEvent::Measured(_)) {
                control.request_stop();
                break;
            }
        }
        let outcome = handle.join().unwrap().unwrap();
        assert!(!outcome.is_success());
        let measured = outcome.summary().measured;
        assert!((1..10).contains(&measured), "measured {measured}");
        assert_eq!(store.load().unwrap().measurements.len(), measured);
        assert_eq!(control.run_state().status, RunStatus::Idle);
        assert!(!control.is_running());
        assert!(!sim.output_enabled());
    }

    #[test]
    fn mirrored_sweep_writes_the_feed_log() {
        let dir = scratch("feedlog");
        let sim = sim(|_, _, _| "0.1".into());
        let store = ResultStore::new(dir.join("gain_data.json"));
        let files = StatusFiles::in_dir(&dir);
        let control = SweepControl::mirrored(files.clone());
        run_sweep(&job(&sim, vec![10.0, 100.0]), &store, &control, None).unwrap();
        let lines = files.read_log(100).unwrap();
        assert!(lines.iter().any(|l| l.ends_with("Starting measurement 2/2 at 100 Hz")));
        assert!(lines.last().unwrap().ends_with("Sweep finished: 2/2 points measured."));
        assert_eq!(files.read_progress().unwrap().status, RunStatus::Idle);
    }

    #[test]
    fn inter_point_delay_follows_every_point() {
        let sim = sim(|_, _, _| "0.1".into());
        let store = ResultStore::new(scratch("delay").join("gain_data.json"));
        let mut job = job(&sim, vec![10.0, 100.0]);
        job.timing.inter_point = Duration::from_millis(80);
        let started = std::time::Instant::now();
        run_sweep(&job, &store, &SweepControl::new(), None).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(160));
    }

    #[test]
    fn second_sweep_is_refused_while_running() {
        let sim = sim(|_, _, _| "0.1".into());
        let store = Arc::new(ResultStore::new(scratch("busy").join("gain_data.json")));
        let control = Arc::new(SweepControl::new());
        let _run = control.begin(1);
        let (tx, _rx) = channel();
        let err = spawn_sweep(job(&sim, vec![10.0]), store, control.clone(), tx).unwrap_err();
        assert!(matches!(err, SweepError::AlreadyRunning));
    }
}
