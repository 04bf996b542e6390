use crate::drivers::{InstrumentClient, InstrumentError};
use crate::types::{Channel, SignalConfig, Waveform};
/// Settings as reported back by the generator after [`FunctionGenerator::apply`].
#[derive(Clone, Debug, PartialEq)]
pub struct AppliedSignal {
    pub waveform: String,
    pub frequency: String,
    pub amplitude: String,
    pub offset: String,
}
/// Function generator on top of the SCPI client. Nothing is cached; every
/// read-back goes to the instrument.
pub struct FunctionGenerator {
    client: InstrumentClient,
}
impl FunctionGenerator {
    pub fn new(client: InstrumentClient) -> Self {
        Self { client }
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
    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }
    pub fn identify(&mut self) -> Result<String, InstrumentError> {
        self.client.identify()
    }
    pub fn reset(&mut self) -> Result<(), InstrumentError> {
        self.client.send("*RST")
    }
    pub fn set_waveform(&mut self, ch: Channel, waveform: Waveform) -> Result<(), InstrumentError> {
        self.client
            .send(&format!("SOURce{}:FUNCtion {}", ch.number(), waveform.scpi()))
    }
    pub fn set_frequency(&mut self, ch: Channel, hz: f64) -> Result<(), InstrumentError> {
        self.client
            .send(&format!("SOURce{}:FREQuency {hz}", ch.number()))
    }
    pub fn set_amplitude(&mut self, ch: Channel, vpp: f64) -> Result<(), InstrumentError> {
        self.client
            .send(&format!("SOURce{}:AMPlitude {vpp}", ch.number()))
    }
    pub fn set_offset(&mut self, ch: Channel, volts: f64) -> Result<(), InstrumentError> {
        self.client
            .send(&format!("SOURce{}:DCOffset {volts}", ch.number()))
    }
    pub fn enable_output(&mut self, ch: Channel) -> Result<(), InstrumentError> {
        self.client.send(&format!("OUTPut{} ON", ch.number()))
    }
    pub fn disable_output(&mut self, ch: Channel) -> Result<(), InstrumentError> {
        self.client.send(&format!("OUTPut{} OFF", ch.number()))
    }
    pub fn output_state(&mut self, ch: Channel) -> Result<String, InstrumentError> {
        self.client.query(&format!("OUTPut{}?", ch.number()))
    }
    /// Sets waveform, frequency, amplitude and offset, then reads each back.
    pub fn apply(
        &mut self,
        ch: Channel,
        signal: &SignalConfig,
        frequency: f64,
    ) -> Result<AppliedSignal, InstrumentError> {
        self.set_waveform(ch, signal.waveform)?;
        self.set_frequency(ch, frequency)?;
        self.set_amplitude(ch, signal.amplitude)?;
        self.set_offset(ch, signal.offset)?;
        let n = ch.number();
        Ok(AppliedSignal {
            waveform: self.client.query(&format!("SOURce{n}:FUNCtion?"))?,
            frequency: self.client.query(&format!("SOURce{n}:FREQuency?"))?,
            amplitude: self.client.query(&format!("SOURce{n}:AMPlitude?"))?,
            offset: self.client.query(&format!("SOURce{n}:DCOffset?"))?,
        })
    }
}
