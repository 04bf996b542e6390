use std::sync::Arc;
use std::time::Duration;
use log::{debug, warn};
use crate::drivers::{Connector, Endpoint, InstrumentError, Transport};
/// Default per-command response timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// How many times a timed-out query is resent before giving up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}
impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 1 }
    }
}
/// Blocking SCPI client shared by both instrument kinds.
///
/// One command is in flight at a time. Every method works on a disconnected
/// client and answers with [`InstrumentError::NotConnected`].
pub struct InstrumentClient {
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    link: Option<Box<dyn Transport>>,
    timeout: Duration,
    retry: RetryPolicy,
}
impl InstrumentClient {
    pub fn new(endpoint: Endpoint, connector: Arc<dyn Connector>) -> Self {
        Self {
            endpoint,
            connector,
            link: None,
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }
    pub fn connect(&mut self) -> Result<(), InstrumentError> {
        if self.link.is_some() {
            return Ok(());
        }
        let link = self.connector.open(&self.endpoint, self.timeout)?;
        debug!("connected to {}", self.endpoint);
        self.link = Some(link);
        Ok(())
    }
    pub fn disconnect(&mut self) -> Result<(), InstrumentError> {
        match self.link.take() {
            Some(mut link) => {
                debug!("closing {}", self.endpoint);
                link.close()
            }
            None => Ok(()),
        }
    }
    fn link(&mut self) -> Result<&mut Box<dyn Transport>, InstrumentError> {
        self.link.as_mut().ok_or(InstrumentError::NotConnected)
    }
    /// Fire-and-forget command.
    pub fn send(&mut self, command: &str) -> Result<(), InstrumentError> {
        debug!("{} <- {command}", self.endpoint);
        self.link()?.write_line(command)
    }
    /// Sends `command` and reads one response line. A timeout clears the link
    /// and resends, up to the retry policy; anything else fails right away.
    pub fn query(&mut self, command: &str) -> Result<String, InstrumentError> {
        let endpoint = self.endpoint.clone();
        let max_retries = self.retry.max_retries;
        let link = self.link()?;
        let mut attempt = 0;
        loop {
            let result = link
                .write_line(command)
                .and_then(|_| link.read_line())
                .map(|line| line.trim().to_string());
            match result {
                Ok(line) => {
                    debug!("{endpoint} -> {line}");
                    return Ok(line);
                }
                Err(e) if e.is_timeout() && attempt < max_retries => {
                    attempt += 1;
                    warn!("{endpoint}: `{command}` timed out, retrying ({attempt}/{max_retries})");
                    link.clear()?;
                }
                Err(e) if attempt > 0 => {
                    return Err(InstrumentError::RetryFailed {
                        command: command.to_string(),
                        source: Box::new(e),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }
    pub fn identify(&mut self) -> Result<String, InstrumentError> {
        self.query("*IDN?")
    }
}
impl Drop for InstrumentClient {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}
