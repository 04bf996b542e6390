// src/lib.rs
// 频率响应 (Bode) 扫频: 信号发生器 -> 被测器件 -> 示波器
pub mod config;
pub mod drivers;
pub mod engine;
pub mod gain;
pub mod manual;
pub mod plan;
pub mod procedure;
pub mod recorder;
pub mod sim;
pub mod state;
pub mod types;
