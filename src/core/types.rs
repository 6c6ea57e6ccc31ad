use chrono::{DateTime, Utc};
/// 统一的类型定义模块
/// 行情、订单簿、成交与持仓等交易所侧数据结构
use serde::{Deserialize, Serialize};

// ============= 基础类型定义 =============

/// 结果类型别名
pub type Result<T> = std::result::Result<T, crate::core::error::ExchangeError>;

/// 订单簿类别（合约 / 现货）
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookCategory {
    Linear,
    Spot,
}

impl BookCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookCategory::Linear => "linear",
            BookCategory::Spot => "spot",
        }
    }
}

/// 持仓/下单方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn opposite(&self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    /// 多头为 1，空头为 -1
    pub fn sign(&self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

/// 保证金模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginType {
    Isolated,
    Cross,
}

impl Default for MarginType {
    fn default() -> Self {
        MarginType::Isolated
    }
}

/// 行情数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

/// 订单簿
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<[f64; 2]>,
    pub asks: Vec<[f64; 2]>,
    pub timestamp: DateTime<Utc>,
}

impl OrderBook {
    /// 中间价，任一侧为空时返回 None
    pub fn mid_price(&self) -> Option<f64> {
        let best_bid = self.bids.iter().map(|l| l[0]).fold(f64::NAN, f64::max);
        let best_ask = self.asks.iter().map(|l| l[0]).fold(f64::NAN, f64::min);
        if best_bid.is_finite() && best_ask.is_finite() {
            Some((best_bid + best_ask) / 2.0)
        } else {
            None
        }
    }
}

/// 逐笔成交推送（side 为交易所原始字符串 "Buy"/"Sell"）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub symbol: String,
    pub side: String,
    pub price: f64,
    pub size: f64,
    pub timestamp: DateTime<Utc>,
}

impl TradeEvent {
    pub fn is_buy(&self) -> bool {
        self.side.eq_ignore_ascii_case("buy")
    }

    pub fn notional(&self) -> f64 {
        self.price * self.size
    }
}

/// K线数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    pub symbol: String,
    pub interval: String,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

// ============= 期货相关 =============

/// 持仓信息（由交易所提供，本模块只读）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub leverage: u32,
    #[serde(default)]
    pub margin_type: MarginType,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.size > f64::EPSILON
    }

    /// 按给定平仓价计算已实现盈亏
    pub fn realized_pnl_at(&self, exit_price: f64) -> f64 {
        match self.side {
            PositionSide::Long => (exit_price - self.entry_price) * self.size,
            PositionSide::Short => (self.entry_price - exit_price) * self.size,
        }
    }
}

/// WebSocket 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsStatus {
    Connected,
    Reconnecting,
    Disconnected,
}

impl std::fmt::Display for WsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            WsStatus::Connected => write!(f, "connected"),
            WsStatus::Reconnecting => write!(f, "reconnecting"),
            WsStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}
