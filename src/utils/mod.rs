// 工具模块 - 日志与后台任务
pub mod background;
pub mod logger;

pub use background::BackgroundTasks;
pub use logger::{init_logger, LogConfig};
