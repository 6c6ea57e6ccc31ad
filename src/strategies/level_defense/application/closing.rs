//! 平仓流程：先算盈亏再平仓，记录历史，更新连胜/连续止损，熔断与自动拆分

use chrono::Duration;

use super::orchestrator::TickOrchestrator;
use crate::core::types::Position;
use crate::strategies::level_defense::domain::model::{
    Level, PositionHistory, SessionEvent, TradeRecord, TradeSessionLog,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    /// 状态机判定价格回到点位
    BaseReturn,
    /// 仓位位于点位错误一侧
    BaseSafety,
    Sentiment,
    TakeProfit,
    Manual,
}

impl CloseReason {
    fn is_base_close(self) -> bool {
        matches!(self, CloseReason::BaseReturn | CloseReason::BaseSafety)
    }

    fn session_event(self) -> Option<SessionEvent> {
        match self {
            CloseReason::BaseReturn => None,
            CloseReason::BaseSafety => Some(SessionEvent::BaseSafetyClose),
            CloseReason::Sentiment => Some(SessionEvent::SentimentClose),
            CloseReason::TakeProfit => Some(SessionEvent::TakeProfitClose),
            CloseReason::Manual => Some(SessionEvent::ManualClose),
        }
    }
}

/// 熔断触发时记录的观测区间
struct BreakerTrip {
    range_high: Option<f64>,
    range_low: Option<f64>,
}

impl TickOrchestrator {
    /// 平掉点位对应仓位并复位状态。
    ///
    /// 平仓失败只记录日志，下一次靠近点位时可以重新入场。
    /// 平仓前查不到仓位时只复位状态，连胜与连续止损计数不变。
    /// `reset_ids` 中的其余点位同样复位。
    pub(crate) async fn close_cycle(
        &self,
        exchange: &str,
        level: &Level,
        reset_ids: &[String],
        price: f64,
        reason: CloseReason,
    ) {
        let symbol = level.symbol.as_str();
        let position = match self.exchange.get_position(symbol).await {
            Ok(position) => position.filter(Position::is_open),
            Err(e) => {
                log::warn!("[level_defense] {} 平仓前查询持仓失败: {}", symbol, e);
                None
            }
        };

        // 没有真实仓位的回到点位不算止损，不计入连胜与熔断
        let had_position = position.is_some();

        // 平仓失败时不记历史，但状态照样复位
        let position = match self.exchange.close_position(symbol).await {
            Ok(()) => position,
            Err(e) => {
                log::warn!(
                    "[level_defense] {} 平仓失败 ({:?})，仍复位点位 {} 状态: {}",
                    symbol,
                    reason,
                    level.id,
                    e
                );
                None
            }
        };

        let now = self.clock.now();
        let realized_pnl = position
            .as_ref()
            .map_or(0.0, |p| p.realized_pnl_at(price));

        if let Some(position) = &position {
            log::info!(
                "[level_defense] 💰 {} 平仓 {} {:.6} 开仓 {:.4} 平仓 {:.4} 盈亏 {:.4} ({:?})",
                level.id,
                position.side,
                position.size,
                position.entry_price,
                price,
                realized_pnl,
                reason
            );
            let history = PositionHistory {
                exchange: exchange.to_string(),
                symbol: symbol.to_string(),
                level_id: level.id.clone(),
                side: position.side,
                size: position.size,
                entry_price: position.entry_price,
                exit_price: price,
                realized_pnl,
                leverage: level.leverage,
                margin_type: level.margin_type,
                closed_at: now,
            };
            if let Err(e) = self.trade_repo.save_position_history(&history).await {
                log::error!("[level_defense] {} 保存平仓历史失败: {}", level.id, e);
            }
            self.spawn_audit_trade(TradeRecord {
                exchange: exchange.to_string(),
                symbol: symbol.to_string(),
                level_id: level.id.clone(),
                side: position.side,
                size: 0.0,
                price,
                realized_pnl,
                timestamp: now,
            });
        }

        let trip = self.tier_engine.update_state(&level.id, |state| {
            if !had_position {
                state.reset_cycle();
                return None;
            }
            if realized_pnl > 0.0 {
                state.consecutive_wins = state.consecutive_wins.saturating_add(1);
            } else {
                state.consecutive_wins = 0;
            }

            let mut trip = None;
            if reason.is_base_close() {
                state.consecutive_base_closes += 1;
                if level.max_consecutive_base_closes > 0
                    && state.consecutive_base_closes >= level.max_consecutive_base_closes
                {
                    state.disabled_until =
                        Some(now + Duration::milliseconds(level.base_close_cooldown_ms));
                    state.consecutive_base_closes = 0;
                    trip = Some(BreakerTrip {
                        range_high: state.range_high,
                        range_low: state.range_low,
                    });
                }
            } else {
                state.consecutive_base_closes = 0;
            }
            state.reset_cycle();
            trip
        });
        for id in reset_ids.iter().filter(|id| **id != level.id) {
            self.tier_engine.reset_state(id);
        }

        if let Some(event) = reason.session_event() {
            self.spawn_session_log(
                level,
                event,
                format!("{:?} 平仓 盈亏 {:.4}", reason, realized_pnl),
                price,
            );
        }

        if let Some(trip) = trip {
            self.on_breaker_tripped(level, trip, price);
        }
    }

    fn on_breaker_tripped(&self, level: &Level, trip: BreakerTrip, price: f64) {
        log::warn!(
            "[level_defense] ⛔ 点位 {} 连续 {} 次回到基准，停用 {} ms",
            level.id,
            level.max_consecutive_base_closes,
            level.base_close_cooldown_ms
        );
        self.spawn_session_log(
            level,
            SessionEvent::CircuitBreaker,
            format!(
                "连续 {} 次基准平仓，停用 {} ms",
                level.max_consecutive_base_closes, level.base_close_cooldown_ms
            ),
            price,
        );

        if !level.auto_mode_enabled {
            return;
        }
        let (Some(high), Some(low)) = (trip.range_high, trip.range_low) else {
            log::warn!("[level_defense] 点位 {} 没有观测区间，跳过自动拆分", level.id);
            return;
        };
        if high <= low {
            log::warn!("[level_defense] 点位 {} 观测区间为单一价格，跳过自动拆分", level.id);
            return;
        }

        let now = self.clock.now();
        let children = level.split_children(high, low, now).to_vec();
        let parent = level.clone();
        let repo = self.level_repo.clone();
        let trades = self.trade_repo.clone();
        self.background.spawn(
            format!("auto_split {}", level.id),
            self.config.background_timeout(),
            async move {
                let ids: Vec<String> = children.iter().map(|c| c.id.clone()).collect();
                repo.replace_level(&parent.id, children).await?;
                log::info!(
                    "[level_defense] ✂️ 点位 {} 已拆分为 {:?} (区间 {:.4} - {:.4})",
                    parent.id,
                    ids,
                    low,
                    high
                );
                trades
                    .save_session_log(&TradeSessionLog {
                        level_id: parent.id.clone(),
                        exchange: parent.exchange.clone(),
                        symbol: parent.symbol.clone(),
                        event: SessionEvent::AutoSplit,
                        message: format!("拆分为 {:.4} / {:.4}: {:?}", high, low, ids),
                        price,
                        timestamp: now,
                    })
                    .await
            },
        );
    }

    pub(crate) fn spawn_session_log(
        &self,
        level: &Level,
        event: SessionEvent,
        message: String,
        price: f64,
    ) {
        let entry = TradeSessionLog {
            level_id: level.id.clone(),
            exchange: level.exchange.clone(),
            symbol: level.symbol.clone(),
            event,
            message,
            price,
            timestamp: self.clock.now(),
        };
        let repo = self.trade_repo.clone();
        self.background.spawn(
            format!("session_log {:?} {}", event, level.id),
            self.config.background_timeout(),
            async move { repo.save_session_log(&entry).await },
        );
    }
}
