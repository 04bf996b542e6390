// src/manual.rs
// 手动控制: 单条命令, 不经过扫频
use std::thread;
use std::time::Duration;

use log::info;

use crate::drivers::{ChannelSetup, FunctionGenerator, InstrumentError, MeasurementKind, Oscilloscope, Reading};
use crate::types::{Channel, SignalConfig};

/// Wait after AUTOSet and *RST before the link closes.
pub const AUTOSET_PAUSE: Duration = Duration::from_secs(1);
pub const RESET_PAUSE: Duration = Duration::from_millis(500);

#[derive(Clone, Debug, PartialEq)]
pub enum ScopeCommand {
    Identify,
    AutoSetup,
    Run,
    Stop,
    Channel { channel: Channel, setup: ChannelSetup },
    Measure { channel: Channel, kind: MeasurementKind },
    Send(String),
    Query(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum GeneratorCommand {
    Identify,
    Reset,
    OutputOn(Channel),
    OutputOff(Channel),
    OutputState(Channel),
    Apply { signal: SignalConfig, frequency: f64 },
    Send(String),
    Query(String),
}

fn scope_step(scope: &mut Oscilloscope, cmd: &ScopeCommand, pauses: bool) -> Result<String, InstrumentError> {
    let endpoint = scope.client().endpoint().to_string();
    let done = |what: &str| format!("{what} done on {endpoint}");
    match cmd {
        ScopeCommand::Identify => scope.identify(),
        ScopeCommand::AutoSetup => {
            scope.auto_setup()?;
            if pauses {
                thread::sleep(AUTOSET_PAUSE);
            }
            Ok(done("AUTOSet"))
        }
        ScopeCommand::Run => scope.run().map(|_| done("RUN")),
        ScopeCommand::Stop => scope.stop().map(|_| done("STOP")),
        ScopeCommand::Channel { channel, setup } => scope
            .configure_channel(*channel, setup)
            .map(|_| done(&format!("{channel} setup"))),
        ScopeCommand::Measure { channel, kind } => Ok(match scope.measure(*channel, *kind)? {
            Reading::Value(v) => format!("{kind} {channel}: {v}"),
            Reading::Raw(raw) => format!("{kind} {channel}: {raw} (not a number)"),
        }),
        ScopeCommand::Send(line) => scope.client_mut().send(line).map(|_| done(&format!("`{line}`"))),
        ScopeCommand::Query(line) => scope.client_mut().query(line),
    }
}

/// Connects, runs one command, disconnects. Returns the text to show.
pub fn run_scope(scope: &mut Oscilloscope, cmd: &ScopeCommand) -> Result<String, InstrumentError> {
    run_scope_with(scope, cmd, true)
}

fn run_scope_with(scope: &mut Oscilloscope, cmd: &ScopeCommand, pauses: bool) -> Result<String, InstrumentError> {
    scope.connect()?;
    info!("scope command {cmd:?}");
    let result = scope_step(scope, cmd, pauses);
    let closed = scope.disconnect();
    let text = result?;
    closed?;
    Ok(text)
}

fn generator_step(
    generator: &mut FunctionGenerator,
    cmd: &GeneratorCommand,
    pauses: bool,
) -> Result<String, InstrumentError> {
    let endpoint = generator.client().endpoint().to_string();
    match cmd {
        GeneratorCommand::Identify => generator.identify(),
        GeneratorCommand::Reset => {
            generator.reset()?;
            if pauses {
                thread::sleep(RESET_PAUSE);
            }
            Ok(format!("*RST done on {endpoint}"))
        }
        GeneratorCommand::OutputOn(ch) => generator
            .enable_output(*ch)
            .map(|_| format!("{ch} output ON")),
        GeneratorCommand::OutputOff(ch) => generator
            .disable_output(*ch)
            .map(|_| format!("{ch} output OFF")),
        GeneratorCommand::OutputState(ch) => generator
            .output_state(*ch)
            .map(|state| format!("{ch} output {state}")),
        GeneratorCommand::Apply { signal, frequency } => {
            let applied = generator.apply(signal.channel, signal, *frequency)?;
            Ok(format!(
                "{}: {} at {} Hz, {} Vpp, offset {} V",
                signal.channel, applied.waveform, applied.frequency, applied.amplitude, applied.offset
            ))
        }
        GeneratorCommand::Send(line) => generator
            .client_mut()
            .send(line)
            .map(|_| format!("`{line}` sent to {endpoint}")),
        GeneratorCommand::Query(line) => generator.client_mut().query(line),
    }
}

/// Connects, runs one command, disconnects. Returns the text to show.
pub fn run_generator(generator: &mut FunctionGenerator, cmd: &GeneratorCommand) -> Result<String, InstrumentError> {
    run_generator_with(generator, cmd, true)
}

fn run_generator_with(
    generator: &mut FunctionGenerator,
    cmd: &GeneratorCommand,
    pauses: bool,
) -> Result<String, InstrumentError> {
    generator.connect()?;
    info!("generator command {cmd:?}");
    let result = generator_step(generator, cmd, pauses);
    let closed = generator.disconnect();
    let text = result?;
    closed?;
    Ok(text)
}
