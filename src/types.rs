// src/types.rs
use std::fmt;
use std::str::FromStr;
use std::sync::mpsc::Sender;
use std::time::Duration;
use log::{info, warn};
use thiserror::Error;
use crate::recorder::GainPoint;
use crate::state::StatusFiles;

// 信号发生器的波形
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Waveform {
    #[default]
    Sine,
    Square,
    Ramp,
    Pulse,
    Noise,
}

impl Waveform {
    /// SCPI mnemonic for `SOURce{n}:FUNCtion`.
    pub fn scpi(&self) -> &'static str {
        match self {
            Waveform::Sine => "SINusoid",
            Waveform::Square => "SQUare",
            Waveform::Ramp => "RAMP",
            Waveform::Pulse => "PULSe",
            Waveform::Noise => "NOISe",
        }
    }
}

impl FromStr for Waveform {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sine" | "sin" | "sinusoid" => Ok(Waveform::Sine),
            "square" | "squ" => Ok(Waveform::Square),
            "ramp" => Ok(Waveform::Ramp),
            "pulse" | "puls" => Ok(Waveform::Pulse),
            "noise" | "nois" => Ok(Waveform::Noise),
            other => Err(format!("unknown waveform `{other}`")),
        }
    }
}

impl fmt::Display for Waveform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scpi())
    }
}

// 仪器通道 (两台仪器都只用 1 和 2)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Channel {
    #[default]
    Ch1,
    Ch2,
}

impl Channel {
    pub fn number(&self) -> u8 {
        match self {
            Channel::Ch1 => 1,
            Channel::Ch2 => 2,
        }
    }
}

impl TryFrom<u8> for Channel {
    type Error = String;
    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            1 => Ok(Channel::Ch1),
            2 => Ok(Channel::Ch2),
            other => Err(format!("channel {other} out of range, expected 1 or 2")),
        }
    }
}

impl FromStr for Channel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let n: u8 = s
            .trim()
            .trim_start_matches(['C', 'H', 'c', 'h'])
            .parse()
            .map_err(|_| format!("invalid channel `{s}`"))?;
        Channel::try_from(n)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CH{}", self.number())
    }
}

#[derive(Debug, Error)]
#[error("invalid signal configuration: {0}")]
pub struct InvalidSignal(pub String);

/// Generator settings shared by every point of a sweep; only frequency varies.
#[derive(Clone, Debug, PartialEq)]
pub struct SignalConfig {
    pub waveform: Waveform,
    /// Peak-to-peak volts.
    pub amplitude: f64,
    /// DC offset in volts.
    pub offset: f64,
    pub channel: Channel,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            waveform: Waveform::Sine,
            amplitude: 0.05,
            offset: 0.0,
            channel: Channel::Ch1,
        }
    }
}

impl SignalConfig {
    pub fn validate(&self) -> Result<(), InvalidSignal> {
        if !(self.amplitude.is_finite() && self.amplitude > 0.0) {
            return Err(InvalidSignal(format!(
                "amplitude must be a positive number of volts, got {}",
                self.amplitude
            )));
        }
        if !self.offset.is_finite() {
            return Err(InvalidSignal(format!("offset {} is not finite", self.offset)));
        }
        Ok(())
    }
}

/// Delays and timeouts used while talking to the bench.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Timing {
    /// Wait after enabling the output and after auto-setup.
    pub stabilization: Duration,
    /// Pause between sweep points.
    pub inter_point: Duration,
    /// Scope settle delay between measurement commands.
    pub settle: Duration,
    /// Per-command transport timeout.
    pub timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            stabilization: Duration::from_millis(500),
            inter_point: Duration::from_millis(500),
            settle: Duration::from_millis(200),
            timeout: crate::drivers::client::DEFAULT_TIMEOUT,
        }
    }
}

impl Timing {
    pub fn without_delays() -> Self {
        Self {
            stabilization: Duration::ZERO,
            inter_point: Duration::ZERO,
            settle: Duration::ZERO,
            ..Self::default()
        }
    }
}

// 后台发给前台的消息
#[derive(Clone, Debug)]
pub enum SweepEvent {
    Log(String),
    Progress { step: usize, total: usize },
    Measured(GainPoint),
    Finished { measured: usize, total: usize, stopped: bool },
}

/// Live feed towards whoever watches the sweep. Every line also goes to the
/// process log, and to the feed log file when one is attached.
#[derive(Clone, Copy, Default)]
pub struct Feed<'a> {
    tx: Option<&'a Sender<SweepEvent>>,
    file: Option<&'a StatusFiles>,
}

impl<'a> Feed<'a> {
    pub fn new(tx: Option<&'a Sender<SweepEvent>>) -> Self {
        Self { tx, file: None }
    }

    pub fn with_log_file(self, file: Option<&'a StatusFiles>) -> Self {
        Self { file, ..self }
    }

    pub fn log(&self, msg: impl Into<String>) {
        let msg = msg.into();
        info!("{msg}");
        if let Some(files) = self.file {
            if let Err(e) = files.append_log(&msg) {
                warn!("could not append to the feed log: {e}");
            }
        }
        self.emit(SweepEvent::Log(msg));
    }

    pub fn emit(&self, event: SweepEvent) {
        if let Some(tx) = self.tx {
            // the observer may have gone away; the sweep carries on regardless
            tx.send(event).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waveform_names_round_trip_through_scpi() {
        assert_eq!("sine".parse::<Waveform>().unwrap().scpi(), "SINusoid");
        assert_eq!("SQUare".parse::<Waveform>().unwrap(), Waveform::Square);
        assert!("triangle".parse::<Waveform>().is_err());
    }

    #[test]
    fn channels_are_limited_to_one_and_two() {
        assert_eq!("CH2".parse::<Channel>().unwrap(), Channel::Ch2);
        assert_eq!("1".parse::<Channel>().unwrap(), Channel::Ch1);
        assert!(Channel::try_from(3).is_err());
        assert_eq!(Channel::Ch2.to_string(), "CH2");
    }

    #[test]
    fn signal_amplitude_must_be_positive() {
        assert!(SignalConfig::default().validate().is_ok());
        let bad = SignalConfig { amplitude: 0.0, ..SignalConfig::default() };
        assert!(bad.validate().is_err());
        let bad = SignalConfig { offset: f64::NAN, ..SignalConfig::default() };
        assert!(bad.validate().is_err());
    }
}
