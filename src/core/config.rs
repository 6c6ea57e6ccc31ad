use crate::core::error::ExchangeError;
use crate::utils::logger::LogConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// 顶层配置，对应一个 YAML 文件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub defense: DefenseConfig,
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub logging: LogConfig,
}

/// 点位防守策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefenseConfig {
    /// 价格位于点位与最远档位之间时使用的情绪阈值
    pub strict_sentiment_threshold: f64,
    /// 其余情况的情绪阈值
    pub relaxed_sentiment_threshold: f64,
    /// 点位缓存刷新间隔(秒)
    pub reload_interval_secs: u64,
    /// 安全检查间隔(秒)
    pub safety_interval_secs: u64,
    /// 后台写入任务超时(秒)
    pub background_timeout_secs: u64,
    /// 只记录不下单
    pub dry_run: bool,
    /// 价格/成交推送队列容量
    pub feed_capacity: usize,
}

impl Default for DefenseConfig {
    fn default() -> Self {
        Self {
            strict_sentiment_threshold: 0.3,
            relaxed_sentiment_threshold: 0.6,
            reload_interval_secs: 10,
            safety_interval_secs: 5,
            background_timeout_secs: 5,
            dry_run: false,
            feed_capacity: 1024,
        }
    }
}

impl DefenseConfig {
    pub fn background_timeout(&self) -> Duration {
        Duration::from_secs(self.background_timeout_secs)
    }
}

/// 盘口微观结构配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// 成交滑动窗口(秒)
    pub trade_window_secs: i64,
    /// 深度刷新最小间隔(秒)
    pub depth_refresh_secs: i64,
    /// 订单簿请求超时(毫秒)
    pub orderbook_timeout_ms: u64,
    /// 深度统计范围(相对中间价)
    pub depth_band_pct: f64,
    /// 聚类密度窗口(相对价格)
    pub cluster_band_pct: f64,
    /// 聚类结果缓存(秒)
    pub cluster_cache_secs: i64,
    pub max_clusters: usize,
    /// CVD 归一化名义金额
    pub cvd_scale: f64,
    /// 无买量时 GLI 的上限
    pub gli_cap: f64,
    /// 墙体稳定所需的快照占比
    pub wall_stability_ratio: f64,
    /// 订单簿快照保留时长(秒)
    pub wall_history_secs: i64,
    /// 补拉历史成交的条数
    pub recent_trades_limit: u32,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            trade_window_secs: 60,
            depth_refresh_secs: 5,
            orderbook_timeout_ms: 2000,
            depth_band_pct: 0.005,
            cluster_band_pct: 0.0005,
            cluster_cache_secs: 10,
            max_clusters: 200,
            cvd_scale: 10_000.0,
            gli_cap: 10.0,
            wall_stability_ratio: 0.7,
            wall_history_secs: 600,
            recent_trades_limit: 500,
        }
    }
}

impl MarketConfig {
    pub fn orderbook_timeout(&self) -> Duration {
        Duration::from_millis(self.orderbook_timeout_ms)
    }
}

impl AppConfig {
    /// 从YAML文件加载配置
    pub fn from_file(path: &str) -> Result<Self, ExchangeError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ExchangeError::ConfigError(format!("读取配置文件失败: {}", e)))?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ExchangeError> {
        let config: AppConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ExchangeError> {
        let d = &self.defense;
        for (field, value) in [
            ("strict_sentiment_threshold", d.strict_sentiment_threshold),
            ("relaxed_sentiment_threshold", d.relaxed_sentiment_threshold),
            ("wall_stability_ratio", self.market.wall_stability_ratio),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(invalid(field, "必须位于 (0, 1]"));
            }
        }

        if d.reload_interval_secs == 0 || d.safety_interval_secs == 0 {
            return Err(invalid("interval_secs", "必须大于0"));
        }
        if d.feed_capacity == 0 {
            return Err(invalid("feed_capacity", "必须大于0"));
        }

        let m = &self.market;
        if m.trade_window_secs <= 0 || m.depth_refresh_secs <= 0 || m.cluster_cache_secs <= 0 {
            return Err(invalid("market window", "必须大于0"));
        }
        if m.cluster_band_pct <= 0.0 || m.depth_band_pct <= 0.0 {
            return Err(invalid("band_pct", "必须大于0"));
        }
        if m.cvd_scale <= 0.0 {
            return Err(invalid("cvd_scale", "必须大于0"));
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ExchangeError {
    ExchangeError::ValidationError {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
