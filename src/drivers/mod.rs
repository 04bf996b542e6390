// src/drivers/mod.rs
// 仪器驱动: 传输层 -> SCPI 客户端 -> 信号发生器 / 示波器
pub mod client;
pub mod error;
pub mod generator;
pub mod scope;
pub mod transport;
// 公开导出这些模块里的结构体，方便外部调用
pub use client::{InstrumentClient, RetryPolicy};
pub use error::InstrumentError;
pub use generator::{AppliedSignal, FunctionGenerator};
pub use scope::{ChannelSetup, Coupling, MeasurementKind, Oscilloscope, Reading};
pub use transport::{Connector, Endpoint, TcpConnector, TcpTransport, Transport};
