//! 风控过滤：情绪阈值、止盈、基准位检查

use crate::core::config::DefenseConfig;
use crate::core::types::{Position, PositionSide};
use crate::strategies::level_defense::domain::model::{Level, SymbolTiers, TakeProfitMode};

/// 价格处于点位与最远档位之间时用严格阈值，否则用宽松阈值
pub fn sentiment_threshold(
    config: &DefenseConfig,
    tiers: &SymbolTiers,
    level: &Level,
    side: PositionSide,
    price: f64,
) -> f64 {
    if tiers.in_outer_zone(level.price, side, price) {
        config.strict_sentiment_threshold
    } else {
        config.relaxed_sentiment_threshold
    }
}

/// 情绪是否强烈反对该方向
pub fn sentiment_opposes(side: PositionSide, sentiment: f64, threshold: f64) -> bool {
    match side {
        PositionSide::Long => sentiment <= -threshold,
        PositionSide::Short => sentiment >= threshold,
    }
}

/// 止盈价；sentiment 模式下止盈距离乘以 1 + 结论分 * 0.5
pub fn take_profit_price(
    position: &Position,
    take_profit_pct: f64,
    mode: TakeProfitMode,
    conclusion_score: f64,
) -> Option<f64> {
    if take_profit_pct <= 0.0 || position.entry_price <= 0.0 {
        return None;
    }
    let pct = match mode {
        TakeProfitMode::Fixed => take_profit_pct,
        TakeProfitMode::Sentiment => take_profit_pct * (1.0 + conclusion_score * 0.5),
    };
    Some(position.entry_price * (1.0 + position.side.sign() * pct / 100.0))
}

pub fn take_profit_hit(position: &Position, price: f64, target: f64) -> bool {
    match position.side {
        PositionSide::Long => price >= target,
        PositionSide::Short => price <= target,
    }
}

/// 持仓方向与价格相对点位的位置相矛盾（多单跌破点位 / 空单升破点位）
pub fn base_violated(side: PositionSide, level_price: f64, price: f64) -> bool {
    match side {
        PositionSide::Long => price < level_price,
        PositionSide::Short => price > level_price,
    }
}

pub fn closest_level(levels: &[Level], price: f64) -> Option<&Level> {
    levels.iter().min_by(|a, b| {
        (a.price - price)
            .abs()
            .total_cmp(&(b.price - price).abs())
    })
}
