/// 日志初始化
/// 基于 log4rs 配置控制台与文件输出，业务代码只使用 log 门面
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::error::ExchangeError;

const LOG_FILE_NAME: &str = "level_defense.log";

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub root_dir: String,
    pub default_level: String,
    pub console_output: bool,
    pub pattern: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            root_dir: "logs".to_string(),
            default_level: "INFO".to_string(),
            console_output: true,
            pattern: "[{d(%Y-%m-%d %H:%M:%S%.3f)}] [{l}] [{M}] {m}{n}".to_string(),
        }
    }
}

impl LogConfig {
    /// 解析日志级别，无法识别时退回 INFO
    pub fn level_filter(&self) -> LevelFilter {
        self.default_level
            .parse::<LevelFilter>()
            .unwrap_or(LevelFilter::Info)
    }

    pub fn log_file_path(&self) -> String {
        Path::new(&self.root_dir)
            .join(LOG_FILE_NAME)
            .to_string_lossy()
            .into_owned()
    }
}

/// 构建 log4rs 配置（不安装）
pub fn build_log_config(config: &LogConfig) -> Result<Config, ExchangeError> {
    let file = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(&config.pattern)))
        .build(config.log_file_path())?;

    let mut builder =
        Config::builder().appender(Appender::builder().build("file", Box::new(file)));
    let mut root = Root::builder().appender("file");

    if config.console_output {
        let stdout = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(&config.pattern)))
            .build();
        builder = builder.appender(Appender::builder().build("stdout", Box::new(stdout)));
        root = root.appender("stdout");
    }

    builder
        .build(root.build(config.level_filter()))
        .map_err(|e| ExchangeError::ConfigError(format!("日志配置错误: {}", e)))
}

/// 安装全局日志器，进程内只能调用一次
pub fn init_logger(config: &LogConfig) -> Result<(), ExchangeError> {
    let log_config = build_log_config(config)?;
    log4rs::init_config(log_config)
        .map_err(|e| ExchangeError::ConfigError(format!("日志初始化失败: {}", e)))?;
    log::info!(
        "📝 日志已初始化: 级别 {}, 文件 {}",
        config.level_filter(),
        config.log_file_path()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter_fallback() {
        let mut config = LogConfig::default();
        assert_eq!(config.level_filter(), LevelFilter::Info);
        config.default_level = "debug".to_string();
        assert_eq!(config.level_filter(), LevelFilter::Debug);
        config.default_level = "verbose".to_string();
        assert_eq!(config.level_filter(), LevelFilter::Info);
    }

    #[test]
    fn test_build_config_writes_under_root_dir() {
        let dir = std::env::temp_dir().join(format!("levelcta-log-{}", std::process::id()));
        let config = LogConfig {
            root_dir: dir.to_string_lossy().into_owned(),
            console_output: false,
            ..Default::default()
        };
        assert!(config.log_file_path().ends_with(LOG_FILE_NAME));
        assert!(build_log_config(&config).is_ok());
        let _ = std::fs::remove_dir_all(dir);
    }
}
