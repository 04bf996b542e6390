// src/procedure.rs
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::debug;
use thiserror::Error;

use crate::drivers::{
    ChannelSetup, Connector, Endpoint, FunctionGenerator, InstrumentClient, InstrumentError,
    MeasurementKind, Oscilloscope, Reading, TcpConnector,
};
use crate::gain::ChannelReadings;
use crate::recorder::{GainPoint, ResultStore};
use crate::types::{Channel, Feed, InvalidSignal, SignalConfig, SweepEvent, Timing};

/// The two instruments and how to reach them.
#[derive(Clone)]
pub struct Bench {
    pub generator: Endpoint,
    pub scope: Endpoint,
    pub connector: Arc<dyn Connector>,
}

impl Bench {
    pub fn tcp(generator: Endpoint, scope: Endpoint) -> Self {
        Self {
            generator,
            scope,
            connector: Arc::new(TcpConnector),
        }
    }

    pub fn function_generator(&self, timing: &Timing) -> FunctionGenerator {
        FunctionGenerator::new(
            InstrumentClient::new(self.generator.clone(), self.connector.clone())
                .with_timeout(timing.timeout),
        )
    }

    pub fn oscilloscope(&self, timing: &Timing) -> Oscilloscope {
        Oscilloscope::new(
            InstrumentClient::new(self.scope.clone(), self.connector.clone())
                .with_timeout(timing.timeout),
            timing.settle,
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PointOutcome {
    Measured(GainPoint),
    /// The stop flag was seen at a checkpoint.
    Stopped,
}

#[derive(Debug, Error)]
pub enum PointError {
    #[error("could not connect to the function generator: {0}")]
    GeneratorConnect(#[source] InstrumentError),
    #[error("could not identify the function generator: {0}")]
    GeneratorIdentify(#[source] InstrumentError),
    #[error("could not configure the function generator: {0}")]
    GeneratorConfigure(#[source] InstrumentError),
    #[error("could not connect to the oscilloscope: {0}")]
    ScopeConnect(#[source] InstrumentError),
    #[error("could not identify the oscilloscope: {0}")]
    ScopeIdentify(#[source] InstrumentError),
    #[error("no valid readings to compute the gain from")]
    NoValidMeasurement,
    #[error(transparent)]
    InvalidSignal(#[from] InvalidSignal),
}

/// Both instruments for the duration of one point. Dropping it switches the
/// generator output off and closes both connections, errors ignored.
struct BenchSession<'a> {
    generator: FunctionGenerator,
    scope: Oscilloscope,
    channel: Channel,
    feed: Feed<'a>,
}

impl Drop for BenchSession<'_> {
    fn drop(&mut self) {
        if self.generator.is_connected() {
            self.feed.log("Disabling generator output...");
            if let Err(e) = self.generator.disable_output(self.channel) {
                self.feed.log(format!("Could not disable generator output: {e}"));
            }
            let _ = self.generator.disconnect();
        }
        let _ = self.scope.disconnect();
    }
}

fn pause(d: Duration) {
    if !d.is_zero() {
        thread::sleep(d);
    }
}

/// Reads one value; failures and non-numeric answers count as 0.
fn read_or_zero(scope: &mut Oscilloscope, ch: Channel, kind: MeasurementKind, feed: Feed<'_>) -> f64 {
    match scope.measure(ch, kind) {
        Ok(Reading::Value(v)) if v.is_finite() => v,
        Ok(Reading::Value(v)) => {
            feed.log(format!("{kind} on {ch} read {v}, using 0"));
            0.0
        }
        Ok(Reading::Raw(raw)) => {
            feed.log(format!("{kind} on {ch} is not a number (`{raw}`), using 0"));
            0.0
        }
        Err(e) => {
            feed.log(format!("Error measuring {kind} on {ch}: {e}"));
            0.0
        }
    }
}

/// Measures the DUT gain at one frequency and stores the result.
///
/// Channel 1 of the scope watches the DUT input, channel 2 its output.
/// `stop` is polled between steps. However this returns, the generator
/// output ends up off and both instruments disconnected.
pub fn measure_point(
    bench: &Bench,
    frequency: f64,
    signal: &SignalConfig,
    timing: &Timing,
    store: &ResultStore,
    feed: Feed<'_>,
    stop: &dyn Fn() -> bool,
) -> Result<PointOutcome, PointError> {
    signal.validate()?;
    let halted = || {
        let halted = stop();
        if halted {
            feed.log("Stopped by user.");
        }
        halted
    };
    if halted() {
        return Ok(PointOutcome::Stopped);
    }
    let mut session = BenchSession {
        generator: bench.function_generator(timing),
        scope: bench.oscilloscope(timing),
        channel: signal.channel,
        feed,
    };

    // 1. 信号发生器
    feed.log(format!("Connecting to function generator ({})...", bench.generator));
    session.generator.connect().map_err(PointError::GeneratorConnect)?;
    let id = session.generator.identify().map_err(PointError::GeneratorIdentify)?;
    feed.log(format!("Generator identified: {id}"));
    if halted() {
        return Ok(PointOutcome::Stopped);
    }
    feed.log(format!(
        "Setting generator to {frequency} Hz ({}, {} Vpp, offset {} V)...",
        signal.waveform, signal.amplitude, signal.offset
    ));
    let applied = session
        .generator
        .apply(signal.channel, signal, frequency)
        .map_err(PointError::GeneratorConfigure)?;
    debug!("generator confirmed {applied:?}");
    if halted() {
        return Ok(PointOutcome::Stopped);
    }
    feed.log("Enabling generator output...");
    if let Err(e) = session.generator.enable_output(signal.channel) {
        feed.log(format!("Could not enable generator output: {e}"));
    }
    pause(timing.stabilization);
    if halted() {
        return Ok(PointOutcome::Stopped);
    }

    // 2. 示波器
    feed.log(format!("Connecting to oscilloscope ({})...", bench.scope));
    session.scope.connect().map_err(PointError::ScopeConnect)?;
    let id = session.scope.identify().map_err(PointError::ScopeIdentify)?;
    feed.log(format!("Oscilloscope identified: {id}"));
    if halted() {
        return Ok(PointOutcome::Stopped);
    }
    feed.log("Configuring oscilloscope...");
    if let Err(e) = session.scope.auto_setup() {
        feed.log(format!("Auto-setup failed: {e}"));
    }
    pause(timing.stabilization);
    if halted() {
        return Ok(PointOutcome::Stopped);
    }
    for ch in [Channel::Ch1, Channel::Ch2] {
        if let Err(e) = session.scope.configure_channel(ch, &ChannelSetup::default()) {
            feed.log(format!("Could not configure {ch}: {e}"));
        }
    }
    // freeze the acquisition so all four readings see the same capture
    if let Err(e) = session.scope.stop() {
        feed.log(format!("Could not stop acquisition: {e}"));
    }
    pause(timing.settle);
    if halted() {
        return Ok(PointOutcome::Stopped);
    }

    // 3. 测量
    feed.log("Measuring channel 1...");
    let mut readings = ChannelReadings::default();
    let plan = [
        (Channel::Ch1, MeasurementKind::PeakToPeak),
        (Channel::Ch1, MeasurementKind::Amplitude),
        (Channel::Ch2, MeasurementKind::PeakToPeak),
        (Channel::Ch2, MeasurementKind::Amplitude),
    ];
    for (i, (ch, kind)) in plan.into_iter().enumerate() {
        if i == 2 {
            feed.log("Measuring channel 2...");
        }
        let value = read_or_zero(&mut session.scope, ch, kind, feed);
        match i {
            0 => readings.input_pk2pk = value,
            1 => readings.input_amplitude = value,
            2 => readings.output_pk2pk = value,
            _ => readings.output_amplitude = value,
        }
        if i + 1 < plan.len() && halted() {
            return Ok(PointOutcome::Stopped);
        }
    }
    if !readings.has_signal() {
        return Err(PointError::NoValidMeasurement);
    }

    let point = GainPoint::new(frequency, &readings);
    feed.log(format!(
        "{frequency} Hz: gain {:.4} ({:.2} dB)",
        point.gain_pk2pk, point.gain_pk2pk_db
    ));
    if let Err(e) = store.upsert(point.clone()) {
        feed.log(format!("Could not save the result: {e}"));
    }
    feed.emit(SweepEvent::Measured(point.clone()));
    Ok(PointOutcome::Measured(point))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{LowPass, SimBench};
    use std::cell::Cell;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::mpsc::channel;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bode-point-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sim_with(respond: impl Fn(f64, Channel, MeasurementKind) -> String + Send + Sync + 'static) -> SimBench {
        SimBench::new(
            Endpoint::new("afg.local", 1026),
            Endpoint::new("scope.local", 3000),
            move |gen, ch, kind| respond(gen.frequency, ch, kind),
        )
    }

    fn run(sim: &SimBench, store: &ResultStore, stop: &dyn Fn() -> bool) -> Result<PointOutcome, PointError> {
        measure_point(
            &sim.bench(),
            1000.0,
            &SignalConfig::default(),
            &Timing::without_delays(),
            store,
            Feed::default(),
            stop,
        )
    }

    #[test]
    fn unity_gain_point_is_measured_and_stored() {
        let sim = sim_with(|_, _, _| "0.1".into());
        let store = ResultStore::new(scratch("unity").join("gain_data.json"));
        let (tx, rx) = channel();
        let outcome = measure_point(
            &sim.bench(),
            1000.0,
            &SignalConfig::default(),
            &Timing::without_delays(),
            &store,
            Feed::new(Some(&tx)),
            &|| false,
        )
        .unwrap();
        let PointOutcome::Measured(point) = outcome else {
            panic!("expected a measurement, got {outcome:?}");
        };
        assert_eq!(point.gain_pk2pk, 1.0);
        assert_eq!(point.gain_pk2pk_db, 0.0);
        assert_eq!(store.load().unwrap().get(1000.0).unwrap().gain_real, 1.0);
        assert!(!sim.output_enabled());
        assert_eq!(sim.open_connections(), 0);
        drop(tx);
        let events: Vec<SweepEvent> = rx.iter().collect();
        assert!(events.iter().any(|e| matches!(e, SweepEvent::Measured(p) if p.frequency == 1000.0)));
    }

    #[test]
    fn generator_is_configured_before_output_is_enabled() {
        let sim = sim_with(|_, _, _| "0.1".into());
        let store = ResultStore::new(scratch("order").join("gain_data.json"));
        run(&sim, &store, &|| false).unwrap();
        let log = sim.commands();
        let pos = |cmd: &str| log.iter().position(|c| c == cmd).unwrap();
        assert!(pos("SOURce1:FREQuency 1000") < pos("OUTPut1 ON"));
        assert!(pos("OUTPut1 ON") < pos(":AUTOSet"));
        assert!(pos(":STOP") < pos(":MEASure:PK2PK?"));
        assert_eq!(log.last().unwrap(), "OUTPut1 OFF");
    }

    #[test]
    fn zero_input_is_not_a_valid_measurement() {
        let sim = sim_with(|_, ch, _| if ch == Channel::Ch1 { "0".into() } else { "0.1".into() });
        let store = ResultStore::new(scratch("zero").join("gain_data.json"));
        let err = run(&sim, &store, &|| false).unwrap_err();
        assert!(matches!(err, PointError::NoValidMeasurement));
        assert!(store.load().unwrap().measurements.is_empty());
        assert!(!sim.output_enabled());
        assert_eq!(sim.open_connections(), 0);
    }

    #[test]
    fn non_numeric_reading_is_substituted_with_zero() {
        let sim = sim_with(|_, ch, kind| match (ch, kind) {
            (Channel::Ch2, MeasurementKind::PeakToPeak) => "Over range".into(),
            _ => "0.1".into(),
        });
        let store = ResultStore::new(scratch("raw").join("gain_data.json"));
        assert!(matches!(run(&sim, &store, &|| false), Err(PointError::NoValidMeasurement)));
    }

    #[test]
    fn failed_amplitude_reading_still_yields_gain() {
        let sim = sim_with(|_, _, kind| match kind {
            MeasurementKind::Amplitude => "?".into(),
            _ => "0.2".into(),
        });
        let store = ResultStore::new(scratch("amp").join("gain_data.json"));
        let Ok(PointOutcome::Measured(p)) = run(&sim, &store, &|| false) else {
            panic!("point should still be measured");
        };
        assert_eq!(p.gain_pk2pk, 1.0);
        assert_eq!(p.gain_amplitude, 0.0);
        assert_eq!(p.gain_amplitude_db, f64::NEG_INFINITY);
        assert_eq!(p.gain_real, 0.5);
    }

    #[test]
    fn stop_before_start_touches_nothing() {
        let sim = sim_with(|_, _, _| "0.1".into());
        let store = ResultStore::new(scratch("stop-early").join("gain_data.json"));
        assert_eq!(run(&sim, &store, &|| true).unwrap(), PointOutcome::Stopped);
        assert!(sim.commands().is_empty());
    }

    #[test]
    fn stop_mid_point_still_cleans_up() {
        let sim = sim_with(|_, _, _| "0.1".into());
        let store = ResultStore::new(scratch("stop-mid").join("gain_data.json"));
        let polls = Cell::new(0);
        // let the first three checkpoints pass: generator is live by then
        let stop = || {
            polls.set(polls.get() + 1);
            polls.get() > 3
        };
        assert_eq!(run(&sim, &store, &stop).unwrap(), PointOutcome::Stopped);
        assert!(sim.commands().contains(&"OUTPut1 ON".to_string()));
        assert!(!sim.output_enabled());
        assert_eq!(sim.open_connections(), 0);
        assert!(store.load().unwrap().measurements.is_empty());
    }

    #[test]
    fn stop_between_readings_ends_the_point() {
        let sim = sim_with(|_, _, _| "0.1".into());
        let store = ResultStore::new(scratch("stop-reading").join("gain_data.json"));
        let watcher = sim.clone();
        // trips once the first channel 1 reading has been taken
        let stop = || watcher.commands().iter().any(|c| c == ":MEASure:PK2PK?");
        assert_eq!(run(&sim, &store, &stop).unwrap(), PointOutcome::Stopped);
        let queries = sim.commands().iter().filter(|c| c.as_str() == ":MEASure:PK2PK?").count();
        assert_eq!(queries, 1);
        assert!(!sim.commands().contains(&":MEASure:AMPlitude?".to_string()));
        assert!(!sim.output_enabled());
        assert_eq!(sim.open_connections(), 0);
        assert!(store.load().unwrap().measurements.is_empty());
    }

    #[test]
    fn unreachable_generator_fails_the_point() {
        let sim = sim_with(|_, _, _| "0.1".into());
        let bench = Bench {
            generator: Endpoint::new("10.0.0.99", 1026),
            ..sim.bench()
        };
        let store = ResultStore::new(scratch("unreachable").join("gain_data.json"));
        let err = measure_point(
            &bench,
            10.0,
            &SignalConfig::default(),
            &Timing::without_delays(),
            &store,
            Feed::default(),
            &|| false,
        )
        .unwrap_err();
        assert!(matches!(err, PointError::GeneratorConnect(_)));
        assert_eq!(sim.open_connections(), 0);
    }

    #[test]
    fn low_pass_reads_minus_three_db_at_cutoff() {
        let sim = SimBench::low_pass(
            Endpoint::new("afg.local", 1026),
            Endpoint::new("scope.local", 3000),
            LowPass { cutoff_hz: 1000.0, seed: 7, ..LowPass::default() },
        );
        let store = ResultStore::new(scratch("lowpass").join("gain_data.json"));
        let Ok(PointOutcome::Measured(p)) = run(&sim, &store, &|| false) else {
            panic!("low-pass point should measure");
        };
        assert!((p.gain_pk2pk - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-9);
        assert!((p.gain_pk2pk_db + 3.0103).abs() < 1e-3);
    }
}
