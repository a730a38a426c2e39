// 命令模块

pub mod config;
pub mod history;
pub mod separate;
pub mod system;
