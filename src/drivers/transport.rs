use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;
use log::debug;
use serde::{Deserialize, Serialize};
use crate::drivers::InstrumentError;
/// Network address of one instrument.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}
impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}
impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
impl FromStr for Endpoint {
    type Err = InstrumentError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| InstrumentError::InvalidEndpoint(s.to_string()))?;
        if host.is_empty() {
            return Err(InstrumentError::InvalidEndpoint(s.to_string()));
        }
        let port = port
            .parse()
            .map_err(|_| InstrumentError::InvalidEndpoint(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}
/// Line-oriented link to an instrument. Commands go out newline-terminated,
/// responses come back one line at a time with the terminator stripped.
pub trait Transport: Send {
    fn write_line(&mut self, line: &str) -> Result<(), InstrumentError>;
    fn read_line(&mut self) -> Result<String, InstrumentError>;
    /// Discards anything buffered or still pending on the link.
    fn clear(&mut self) -> Result<(), InstrumentError>;
    fn close(&mut self) -> Result<(), InstrumentError>;
}
/// Opens transports for endpoints. Swapped out for the simulated bench.
pub trait Connector: Send + Sync {
    fn open(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, InstrumentError>;
}
/// Raw TCP socket connector (`TCPIP0::host::port::SOCKET` style resources).
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector;
impl Connector for TcpConnector {
    fn open(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, InstrumentError> {
        Ok(Box::new(TcpTransport::connect(endpoint, timeout)?))
    }
}
pub struct TcpTransport {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}
impl TcpTransport {
    pub fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self, InstrumentError> {
        let connect_err = |source: io::Error| InstrumentError::Connect {
            endpoint: endpoint.to_string(),
            source,
        };
        let addrs = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(connect_err)?;
        let mut last_err = None;
        for addr in addrs {
            debug!("connecting to {endpoint} via {addr}");
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Self::from_stream(stream, timeout).map_err(connect_err),
                Err(e) => last_err = Some(e),
            }
        }
        Err(connect_err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
        })))
    }
    fn from_stream(stream: TcpStream, timeout: Duration) -> io::Result<Self> {
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self { stream, reader })
    }
}
fn map_io(e: io::Error) -> InstrumentError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => InstrumentError::Timeout,
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => InstrumentError::Closed,
        _ => InstrumentError::Io(e),
    }
}
impl Transport for TcpTransport {
    fn write_line(&mut self, line: &str) -> Result<(), InstrumentError> {
        let mut frame = Vec::with_capacity(line.len() + 1);
        frame.extend_from_slice(line.as_bytes());
        frame.push(b'\n');
        self.stream.write_all(&frame).map_err(map_io)?;
        self.stream.flush().map_err(map_io)
    }
    fn read_line(&mut self) -> Result<String, InstrumentError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).map_err(map_io)?;
        if n == 0 {
            return Err(InstrumentError::Closed);
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
    fn clear(&mut self) -> Result<(), InstrumentError> {
        // a fresh reader drops whatever the old one had buffered
        self.reader = BufReader::new(self.stream.try_clone()?);
        self.stream.set_nonblocking(true)?;
        let mut scratch = [0u8; 512];
        let drained = loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => break Err(InstrumentError::Closed),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(map_io(e)),
            }
        };
        self.stream.set_nonblocking(false)?;
        drained
    }
    fn close(&mut self) -> Result<(), InstrumentError> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }
}
/// In-memory transport driven by a script of replies, for client tests.
#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    pub enum Reply {
        Line(&'static str),
        Timeout,
        Broken,
    }
    #[derive(Clone, Default)]
    pub struct ScriptedConnector {
        pub replies: Arc<Mutex<VecDeque<Reply>>>,
        /// Everything written, plus `CLEAR` / `CLOSE` markers.
        pub log: Arc<Mutex<Vec<String>>>,
    }
    impl ScriptedConnector {
        pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
            Self {
                replies: Arc::new(Mutex::new(replies.into_iter().collect())),
                log: Arc::default(),
            }
        }
        pub fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }
    impl Connector for ScriptedConnector {
        fn open(
            &self,
            _endpoint: &Endpoint,
            _timeout: Duration,
        ) -> Result<Box<dyn Transport>, InstrumentError> {
            Ok(Box::new(self.clone()))
        }
    }
    impl Transport for ScriptedConnector {
        fn write_line(&mut self, line: &str) -> Result<(), InstrumentError> {
            self.log.lock().unwrap().push(line.to_string());
            Ok(())
        }
        fn read_line(&mut self) -> Result<String, InstrumentError> {
            match self.replies.lock().unwrap().pop_front() {
                Some(Reply::Line(l)) => Ok(l.to_string()),
                Some(Reply::Timeout) | None => Err(InstrumentError::Timeout),
                Some(Reply::Broken) => Err(InstrumentError::Closed),
            }
        }
        fn clear(&mut self) -> Result<(), InstrumentError> {
            self.log.lock().unwrap().push("CLEAR".into());
            Ok(())
        }
        fn close(&mut self) -> Result<(), InstrumentError> {
            self.log.lock().unwrap().push("CLOSE".into());
            Ok(())
        }
    }
}
