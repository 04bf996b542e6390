// src/sim.rs
//! In-process stand-in for the generator, the scope and the DUT between
//! them. Speaks the same SCPI subset the controllers send.
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::drivers::{Connector, Endpoint, InstrumentError, MeasurementKind, Transport};
use crate::procedure::Bench;
use crate::types::{Channel, Waveform};

/// What the simulated generator is currently putting out.
#[derive(Clone, Debug, PartialEq)]
pub struct GeneratorState {
    pub waveform: Waveform,
    pub frequency: f64,
    pub amplitude: f64,
    pub offset: f64,
    pub output: bool,
}

impl Default for GeneratorState {
    fn default() -> Self {
        Self {
            waveform: Waveform::Sine,
            frequency: 1000.0,
            amplitude: 0.05,
            offset: 0.0,
            output: false,
        }
    }
}

/// Scope answer for a measurement on a channel, given the generator state.
pub type Response = Arc<dyn Fn(&GeneratorState, Channel, MeasurementKind) -> String + Send + Sync>;

/// First-order low-pass DUT.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LowPass {
    pub cutoff_hz: f64,
    pub passband_gain: f64,
    /// Relative noise on every reading, 0 for none.
    pub noise: f64,
    pub seed: u64,
}

impl Default for LowPass {
    fn default() -> Self {
        Self {
            cutoff_hz: 10_000.0,
            passband_gain: 1.0,
            noise: 0.0,
            seed: 0,
        }
    }
}

impl LowPass {
    pub fn gain_at(&self, frequency: f64) -> f64 {
        let x = frequency / self.cutoff_hz;
        self.passband_gain / (1.0 + x * x).sqrt()
    }
}

#[derive(Default)]
struct BenchModel {
    generator: GeneratorState,
    source: Channel,
    open: usize,
    log: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Generator,
    Scope,
}

#[derive(Clone)]
pub struct SimBench {
    generator: Endpoint,
    scope: Endpoint,
    model: Arc<Mutex<BenchModel>>,
    response: Response,
}

impl SimBench {
    pub fn new(
        generator: Endpoint,
        scope: Endpoint,
        response: impl Fn(&GeneratorState, Channel, MeasurementKind) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            generator,
            scope,
            model: Arc::default(),
            response: Arc::new(response),
        }
    }

    /// Channel 1 sees the generator, channel 2 the filtered signal. Nothing
    /// reaches either channel while the output is off.
    pub fn low_pass(generator: Endpoint, scope: Endpoint, dut: LowPass) -> Self {
        let rng = Mutex::new(StdRng::seed_from_u64(dut.seed));
        Self::new(generator, scope, move |gen, ch, kind| {
            if kind == MeasurementKind::Frequency {
                return format!("{}", gen.frequency);
            }
            let vpp = match (gen.output, ch) {
                (false, _) => 0.0,
                (true, Channel::Ch1) => gen.amplitude,
                (true, Channel::Ch2) => gen.amplitude * dut.gain_at(gen.frequency),
            };
            let jitter = if dut.noise > 0.0 {
                let mut rng = rng.lock().unwrap_or_else(|e| e.into_inner());
                1.0 + dut.noise * rng.gen_range(-1.0..1.0)
            } else {
                1.0
            };
            let value = match kind {
                MeasurementKind::Rms => vpp / (2.0 * std::f64::consts::SQRT_2),
                _ => vpp,
            };
            format!("{}", value * jitter)
        })
    }

    /// Bench description routed through this simulator.
    pub fn bench(&self) -> Bench {
        Bench {
            generator: self.generator.clone(),
            scope: self.scope.clone(),
            connector: Arc::new(self.clone()),
        }
    }

    fn model(&self) -> MutexGuard<'_, BenchModel> {
        self.model.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn output_enabled(&self) -> bool {
        self.model().generator.output
    }

    pub fn open_connections(&self) -> usize {
        self.model().open
    }

    /// Every command received, both instruments, in arrival order.
    pub fn commands(&self) -> Vec<String> {
        self.model().log.clone()
    }

    pub fn generator_state(&self) -> GeneratorState {
        self.model().generator.clone()
    }
}

impl Connector for SimBench {
    fn open(&self, endpoint: &Endpoint, _timeout: Duration) -> Result<Box<dyn Transport>, InstrumentError> {
        let role = if *endpoint == self.generator {
            Role::Generator
        } else if *endpoint == self.scope {
            Role::Scope
        } else {
            return Err(InstrumentError::Connect {
                endpoint: endpoint.to_string(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "no simulated instrument"),
            });
        };
        self.model().open += 1;
        debug!("sim: {role:?} link opened");
        Ok(Box::new(SimLink {
            role,
            bench: self.clone(),
            pending: VecDeque::new(),
            closed: false,
        }))
    }
}

struct SimLink {
    role: Role,
    bench: SimBench,
    pending: VecDeque<String>,
    closed: bool,
}

fn parse_f64(arg: &str) -> Option<f64> {
    arg.trim().parse().ok()
}

impl SimLink {
    fn handle_generator(model: &mut BenchModel, header: &str, arg: &str) -> Option<String> {
        let g = &mut model.generator;
        if header == "*IDN?" {
            return Some("SIM,AFG-SIM,0,1.00".into());
        }
        if header == "*RST" {
            *g = GeneratorState::default();
            return None;
        }
        let leaf = header.rsplit(':').next().unwrap_or(header);
        match leaf {
            "FUNCTION" => g.waveform = arg.parse().unwrap_or(g.waveform),
            "FREQUENCY" => g.frequency = parse_f64(arg).unwrap_or(g.frequency),
            "AMPLITUDE" => g.amplitude = parse_f64(arg).unwrap_or(g.amplitude),
            "DCOFFSET" => g.offset = parse_f64(arg).unwrap_or(g.offset),
            "FUNCTION?" => return Some(g.waveform.scpi().to_ascii_uppercase()),
            "FREQUENCY?" => return Some(format!("{:E}", g.frequency)),
            "AMPLITUDE?" => return Some(format!("{:E}", g.amplitude)),
            "DCOFFSET?" => return Some(format!("{:E}", g.offset)),
            _ if header.starts_with("OUTPUT") && header.ends_with('?') => {
                return Some(if g.output { "ON" } else { "OFF" }.into())
            }
            _ if header.starts_with("OUTPUT") => g.output = arg.eq_ignore_ascii_case("ON"),
            _ => {}
        }
        None
    }
}

impl Transport for SimLink {
    fn write_line(&mut self, line: &str) -> Result<(), InstrumentError> {
        if self.closed {
            return Err(InstrumentError::Closed);
        }
        let (header, arg) = line.split_once(' ').unwrap_or((line, ""));
        let header = header.to_ascii_uppercase();
        let mut measure = None;
        {
            let mut model = self.bench.model();
            model.log.push(line.to_string());
            let reply = match self.role {
                Role::Generator => Self::handle_generator(&mut model, &header, arg),
                Role::Scope => match header.as_str() {
                    "*IDN?" => Some("SIM,MDO-SIM,0,1.00".into()),
                    ":MEASURE:SOURCE1" => {
                        model.source = arg.parse().unwrap_or(model.source);
                        None
                    }
                    h if h.starts_with(":MEASURE:") && h.ends_with('?') => {
                        let keyword = &h[":MEASURE:".len()..h.len() - 1];
                        match keyword.parse::<MeasurementKind>() {
                            Ok(kind) => measure = Some((model.generator.clone(), model.source, kind)),
                            Err(_) => debug!("sim: no answer to {line}"),
                        }
                        None
                    }
                    _ => None,
                },
            };
            if let Some(reply) = reply {
                self.pending.push_back(reply);
            }
        }
        // the response may be arbitrary user code; keep the model unlocked
        if let Some((gen, ch, kind)) = measure {
            self.pending.push_back((self.bench.response)(&gen, ch, kind));
        }
        Ok(())
    }

    fn read_line(&mut self) -> Result<String, InstrumentError> {
        if self.closed {
            return Err(InstrumentError::Closed);
        }
        self.pending.pop_front().ok_or(InstrumentError::Timeout)
    }

    fn clear(&mut self) -> Result<(), InstrumentError> {
        self.pending.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<(), InstrumentError> {
        if !self.closed {
            self.closed = true;
            self.bench.model().open -= 1;
        }
        Ok(())
    }
}

impl Drop for SimLink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
