use std::fmt;
use std::str::FromStr;
use std::thread;
use std::time::Duration;
use crate::drivers::{InstrumentClient, InstrumentError};
use crate::types::Channel;
/// Automatic measurements the scope can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeasurementKind {
    PeakToPeak,
    Amplitude,
    Frequency,
    Rms,
}
impl MeasurementKind {
    /// Node under `:MEASure:` for this measurement.
    pub fn keyword(&self) -> &'static str {
        match self {
            MeasurementKind::PeakToPeak => "PK2PK",
            MeasurementKind::Amplitude => "AMPlitude",
            MeasurementKind::Frequency => "FREQuency",
            MeasurementKind::Rms => "RMS",
        }
    }
}
impl FromStr for MeasurementKind {
    type Err = InstrumentError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PK2PK" | "PEAK-TO-PEAK" => Ok(MeasurementKind::PeakToPeak),
            "AMPLITUDE" | "AMP" => Ok(MeasurementKind::Amplitude),
            "FREQUENCY" | "FREQ" => Ok(MeasurementKind::Frequency),
            "RMS" => Ok(MeasurementKind::Rms),
            _ => Err(InstrumentError::UnknownMeasurement(s.to_string())),
        }
    }
}
impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}
/// A measurement response. Scopes answer with tokens such as `Over range`
/// instead of a number, which are passed through untouched.
#[derive(Clone, Debug, PartialEq)]
pub enum Reading {
    Value(f64),
    Raw(String),
}
impl Reading {
    pub fn parse(response: &str) -> Self {
        match response.trim().parse::<f64>() {
            Ok(v) => Reading::Value(v),
            Err(_) => Reading::Raw(response.to_string()),
        }
    }
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Reading::Value(v) => Some(*v),
            Reading::Raw(_) => None,
        }
    }
}
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Coupling {
    #[default]
    AC,
    DC,
    Ground,
}
impl Coupling {
    fn scpi(&self) -> &'static str {
        match self {
            Coupling::AC => "AC",
            Coupling::DC => "DC",
            Coupling::Ground => "GND",
        }
    }
}
impl FromStr for Coupling {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AC" => Ok(Coupling::AC),
            "DC" => Ok(Coupling::DC),
            "GND" | "GROUND" => Ok(Coupling::Ground),
            other => Err(format!("unknown coupling `{other}`, expected AC, DC or GND")),
        }
    }
}
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelSetup {
    pub coupling: Coupling,
    pub display: bool,
    /// Vertical position in divisions.
    pub position: f64,
}
impl Default for ChannelSetup {
    fn default() -> Self {
        Self {
            coupling: Coupling::AC,
            display: true,
            position: 0.0,
        }
    }
}
pub struct Oscilloscope {
    client: InstrumentClient,
    settle: Duration,
}
impl Oscilloscope {
    pub fn new(client: InstrumentClient, settle: Duration) -> Self {
        Self { client, settle }
    }
    pub fn client(&self) -> &InstrumentClient {
        &self.client
    }
    /// Raw access for commands this controller has no method for.
    pub fn client_mut(&mut self) -> &mut InstrumentClient {
        &mut self.client
    }
    pub fn connect(&mut self) -> Result<(), InstrumentError> {
        self.client.connect()
    }
    pub fn disconnect(&mut self) -> Result<(), InstrumentError> {
        self.client.disconnect()
    }
    pub fn identify(&mut self) -> Result<String, InstrumentError> {
        self.client.identify()
    }
    pub fn auto_setup(&mut self) -> Result<(), InstrumentError> {
        self.client.send(":AUTOSet")
    }
    pub fn run(&mut self) -> Result<(), InstrumentError> {
        self.client.send(":RUN")
    }
    pub fn stop(&mut self) -> Result<(), InstrumentError> {
        self.client.send(":STOP")
    }
    pub fn configure_channel(
        &mut self,
        ch: Channel,
        setup: &ChannelSetup,
    ) -> Result<(), InstrumentError> {
        let n = ch.number();
        self.client
            .send(&format!(":CHANnel{n}:COUPling {}", setup.coupling.scpi()))?;
        let display = if setup.display { "ON" } else { "OFF" };
        self.client.send(&format!(":CHANnel{n}:DISPlay {display}"))?;
        self.client
            .send(&format!(":CHANnel{n}:POSition {}", setup.position))
    }
    /// Clear slots, point both sources at `ch`, enable `kind`, read it.
    ///
    /// The scope takes commands faster than its measurement engine catches up,
    /// hence the settle delay after each step.
    pub fn measure(
        &mut self,
        ch: Channel,
        kind: MeasurementKind,
    ) -> Result<Reading, InstrumentError> {
        self.client.send(":MEASure:CLEar ALL")?;
        self.settle();
        self.client.send(&format!(":MEASure:SOURce1 {ch}"))?;
        self.client.send(&format!(":MEASure:SOURce2 {ch}"))?;
        self.settle();
        self.client.send(&format!(":MEASure:{} ON", kind.keyword()))?;
        self.settle();
        let response = self.client.query(&format!(":MEASure:{}?", kind.keyword()))?;
        Ok(Reading::parse(&response))
    }
    fn settle(&self) {
        if !self.settle.is_zero() {
            thread::sleep(self.settle);
        }
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::transport::scripted::{Reply, ScriptedConnector};
    use crate::drivers::Endpoint;
    use std::sync::Arc;
    fn scope(script: &ScriptedConnector) -> Oscilloscope {
        let client = InstrumentClient::new(Endpoint::new("mdo", 3000), Arc::new(script.clone()));
        let mut scope = Oscilloscope::new(client, Duration::ZERO);
        scope.connect().unwrap();
        scope
    }
    #[test]
    fn measure_runs_the_four_step_protocol() {
        let script = ScriptedConnector::new([Reply::Line("1.040E-01")]);
        let mut scope = scope(&script);
        let reading = scope.measure(Channel::Ch2, MeasurementKind::PeakToPeak).unwrap();
        assert_eq!(reading, Reading::Value(0.104));
        assert_eq!(
            script.log(),
            vec![
                ":MEASure:CLEar ALL",
                ":MEASure:SOURce1 CH2",
                ":MEASure:SOURce2 CH2",
                ":MEASure:PK2PK ON",
                ":MEASure:PK2PK?",
            ]
        );
    }
    #[test]
    fn non_numeric_response_is_passed_through() {
        let script = ScriptedConnector::new([Reply::Line("Over range")]);
        let mut scope = scope(&script);
        let reading = scope.measure(Channel::Ch1, MeasurementKind::Rms).unwrap();
        assert_eq!(reading, Reading::Raw("Over range".into()));
        assert_eq!(reading.as_f64(), None);
    }
    #[test]
    fn acquisition_control_commands() {
        let script = ScriptedConnector::default();
        let mut scope = scope(&script);
        scope.auto_setup().unwrap();
        scope.stop().unwrap();
        scope.run().unwrap();
        assert_eq!(script.log(), vec![":AUTOSet", ":STOP", ":RUN"]);
    }
    #[test]
    fn coupling_parses_scpi_names() {
        assert_eq!("gnd".parse::<Coupling>().unwrap(), Coupling::Ground);
        assert_eq!("DC".parse::<Coupling>().unwrap(), Coupling::DC);
        assert!("XY".parse::<Coupling>().is_err());
    }
    #[test]
    fn measurement_kinds_reject_free_text() {
        assert_eq!("pk2pk".parse::<MeasurementKind>().unwrap(), MeasurementKind::PeakToPeak);
        assert_eq!("AMPLITUDE".parse::<MeasurementKind>().unwrap(), MeasurementKind::Amplitude);
        assert!(matches!(
            "DUTY".parse::<MeasurementKind>(),
            Err(InstrumentError::UnknownMeasurement(_))
        ));
    }
    #[test]
    fn channel_setup_emits_coupling_display_position() {
        let script = ScriptedConnector::default();
        let mut scope = scope(&script);
        scope
            .configure_channel(Channel::Ch1, &ChannelSetup::default())
            .unwrap();
        let dc_hidden = ChannelSetup {
            coupling: Coupling::Ground,
            display: false,
            position: 1.5,
        };
        scope.configure_channel(Channel::Ch2, &dc_hidden).unwrap();
        scope.stop().unwrap();
        assert_eq!(
            script.log(),
            vec![
                ":CHANnel1:COUPling AC",
                ":CHANnel1:DISPlay ON",
                ":CHANnel1:POSition 0",
                ":CHANnel2:COUPling GND",
                ":CHANnel2:DISPlay OFF",
                ":CHANnel2:POSition 1.5",
                ":STOP",
            ]
        );
    }
}
