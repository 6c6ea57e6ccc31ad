use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::types::{MarginType, PositionSide};

/// 点位止损执行位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopLossMode {
    /// 下单时附带交易所侧止损
    Exchange,
    /// 由程序在回到点位时平仓
    App,
}

/// 止盈模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TakeProfitMode {
    Fixed,
    /// 按市场结论分放大/缩小止盈距离
    Sentiment,
}

/// 防守点位。创建后不再修改，拆分时整体替换
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub id: String,
    pub exchange: String,
    pub symbol: String,
    pub price: f64,
    pub base_size: f64,
    pub leverage: u32,
    pub margin_type: MarginType,
    pub cooldown_ms: i64,
    pub stop_loss_at_base: bool,
    pub stop_loss_mode: StopLossMode,
    pub disable_speed_close: bool,
    /// 0 表示不启用熔断
    pub max_consecutive_base_closes: u32,
    pub base_close_cooldown_ms: i64,
    /// 百分比，0.5 即 0.5%，0 表示不设止盈
    pub take_profit_pct: f64,
    pub take_profit_mode: TakeProfitMode,
    pub auto_created: bool,
    pub auto_mode_enabled: bool,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl Level {
    pub fn new(
        exchange: impl Into<String>,
        symbol: impl Into<String>,
        price: f64,
        base_size: f64,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            id: generate_level_id(created_at),
            exchange: exchange.into(),
            symbol: symbol.into(),
            price,
            base_size,
            leverage: 10,
            margin_type: MarginType::Isolated,
            cooldown_ms: 0,
            stop_loss_at_base: true,
            stop_loss_mode: StopLossMode::App,
            disable_speed_close: false,
            max_consecutive_base_closes: 0,
            base_close_cooldown_ms: 0,
            take_profit_pct: 0.0,
            take_profit_mode: TakeProfitMode::Fixed,
            auto_created: false,
            auto_mode_enabled: false,
            source: "manual".to_string(),
            created_at,
        }
    }

    /// 交易所侧止损价：仅在 exchange 模式下附带
    pub fn exchange_stop_loss(&self) -> Option<f64> {
        if self.stop_loss_at_base && self.stop_loss_mode == StopLossMode::Exchange {
            Some(self.price)
        } else {
            None
        }
    }

    /// 价格相对点位所处的一侧；等于点位时无方向
    pub fn side_for_price(&self, price: f64) -> Option<PositionSide> {
        if price > self.price {
            Some(PositionSide::Long)
        } else if price < self.price {
            Some(PositionSide::Short)
        } else {
            None
        }
    }

    /// 自动拆分出的替代点位，继承父点位的交易参数
    pub fn split_child(&self, price: f64, now: DateTime<Utc>) -> Self {
        Self {
            id: generate_level_id(now),
            price,
            auto_created: true,
            source: format!("auto_split:{}", self.id),
            created_at: now,
            ..self.clone()
        }
    }

    /// 熔断后按观测区间高低点拆分出两个点位，保证 ID 互不相同
    pub fn split_children(&self, high: f64, low: f64, now: DateTime<Utc>) -> [Level; 2] {
        let upper = self.split_child(high, now);
        let mut lower = self.split_child(low, now);
        while lower.id == upper.id {
            lower.id = generate_level_id(now);
        }
        [upper, lower]
    }
}

pub fn generate_level_id(now: DateTime<Utc>) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..100_000);
    format!("LV{}{:05}", now.timestamp_millis(), suffix)
}

/// 交易对的三档距离（百分比），Tier-1 最远，Tier-3 最近
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolTiers {
    pub exchange: String,
    pub symbol: String,
    pub tier1_pct: f64,
    pub tier2_pct: f64,
    pub tier3_pct: f64,
}

impl SymbolTiers {
    pub fn new(
        exchange: impl Into<String>,
        symbol: impl Into<String>,
        tier1_pct: f64,
        tier2_pct: f64,
        tier3_pct: f64,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
            tier1_pct,
            tier2_pct,
            tier3_pct,
        }
    }

    pub fn percents(&self) -> [f64; 3] {
        [self.tier1_pct, self.tier2_pct, self.tier3_pct]
    }

    /// 计算三档边界价格，顺序为由远到近。
    /// 多头（支撑）档位在点位上方，空头（阻力）档位在点位下方。
    pub fn boundaries(&self, level_price: f64, side: PositionSide) -> [f64; 3] {
        self.percents()
            .map(|pct| level_price * (1.0 + side.sign() * pct / 100.0))
    }

    /// 价格是否位于点位与最远档位之间
    pub fn in_outer_zone(&self, level_price: f64, side: PositionSide, price: f64) -> bool {
        let outer = self.boundaries(level_price, side)[0];
        match side {
            PositionSide::Long => price > level_price && price <= outer,
            PositionSide::Short => price < level_price && price >= outer,
        }
    }
}

/// 审计成交记录（size 为 0 表示平仓）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub exchange: String,
    pub symbol: String,
    pub level_id: String,
    pub side: PositionSide,
    pub size: f64,
    pub price: f64,
    pub realized_pnl: f64,
    pub timestamp: DateTime<Utc>,
}

/// 平仓汇总
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionHistory {
    pub exchange: String,
    pub symbol: String,
    pub level_id: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub leverage: u32,
    pub margin_type: MarginType,
    pub closed_at: DateTime<Utc>,
}

/// 会话事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    EntryVetoed,
    SentimentClose,
    TakeProfitClose,
    BaseSafetyClose,
    CircuitBreaker,
    AutoSplit,
    ManualClose,
}

/// 交易会话日志
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSessionLog {
    pub level_id: String,
    pub exchange: String,
    pub symbol: String,
    pub event: SessionEvent,
    pub message: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}
