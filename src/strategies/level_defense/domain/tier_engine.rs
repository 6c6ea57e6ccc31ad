//! 档位状态机
//!
//! 纯内存逻辑：根据点位、三档边界、前后两次价格与方向判断是否触发档位，
//! 不调用交易所也不访问存储。状态锁只包住读改写本身。

use chrono::Duration;
use std::sync::Arc;

use super::model::Level;
use super::state::{LevelRuntimeState, LevelStateStore};
use crate::core::clock::{Clock, SystemClock};
use crate::core::types::PositionSide;

/// 状态机输出的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierAction {
    None,
    Open,
    AddToPosition,
    Close,
}

/// 各档位相对基础仓位的倍数
const TIER_SIZE_FACTORS: [f64; 3] = [1.0, 1.0, 2.0];

/// 上一轮盈利平仓后首档加倍，最多 2 倍
const PROFIT_MULTIPLIER: f64 = 2.0;

pub struct TierEngine {
    store: LevelStateStore,
    clock: Arc<dyn Clock>,
}

impl Default for TierEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TierEngine {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            store: LevelStateStore::new(),
            clock,
        }
    }

    /// 评估一次价格变动。
    ///
    /// `boundaries` 按由远到近排列；`side` 为当前价格相对点位的方向，
    /// 价格正好等于点位时为 None，此时只做回到点位的平仓判断。
    pub fn evaluate(
        &self,
        level: &Level,
        boundaries: &[f64; 3],
        prev_price: f64,
        curr_price: f64,
        side: Option<PositionSide>,
    ) -> (TierAction, f64) {
        let now = self.clock.now();

        self.store.update(&level.id, |state| {
            let first_evaluation = !state.initialized;
            state.initialized = true;

            if let Some(active) = state.active_side {
                state.observe_price(curr_price);

                let reached_base = match active {
                    PositionSide::Long => curr_price <= level.price,
                    PositionSide::Short => curr_price >= level.price,
                };
                if reached_base {
                    if level.stop_loss_at_base {
                        log::info!(
                            "🛑 点位 {} 价格回到基准 {:.4} (当前 {:.4})，触发平仓",
                            level.id,
                            level.price,
                            curr_price
                        );
                        state.reset_cycle();
                        return (TierAction::Close, 0.0);
                    }
                    return (TierAction::None, 0.0);
                }
            }

            let Some(side) = side else {
                return (TierAction::None, 0.0);
            };
            if state.active_side.map_or(false, |active| active != side) {
                return (TierAction::None, 0.0);
            }

            if first_evaluation {
                mark_already_inside(state, level.price, boundaries, prev_price, curr_price, side);
            }

            if state.is_disabled(now) {
                log::debug!("点位 {} 熔断中，忽略触发", level.id);
                return (TierAction::None, 0.0);
            }

            if let Some(last) = state.last_trigger_at {
                if now < last + Duration::milliseconds(level.cooldown_ms) {
                    log::debug!("点位 {} 冷却中，忽略触发", level.id);
                    return (TierAction::None, 0.0);
                }
            }

            let triggered = state.triggered();
            let fired: Vec<usize> = (0..3)
                .filter(|&i| !triggered[i] && crossed(side, boundaries[i], prev_price, curr_price))
                .collect();
            if fired.is_empty() {
                return (TierAction::None, 0.0);
            }

            let multiplier = if state.consecutive_wins > 0 {
                PROFIT_MULTIPLIER
            } else {
                1.0
            };
            let size: f64 = fired
                .iter()
                .map(|&i| {
                    let factor = TIER_SIZE_FACTORS[i];
                    if i == 0 {
                        level.base_size * factor * multiplier
                    } else {
                        level.base_size * factor
                    }
                })
                .sum();

            let action = if state.active_side.is_none() {
                state.active_side = Some(side);
                state.start_range(curr_price);
                TierAction::Open
            } else {
                TierAction::AddToPosition
            };

            state.last_fired = [false; 3];
            for &i in &fired {
                state.set_triggered(i);
                state.last_fired[i] = true;
            }
            state.prior_trigger_at = state.last_trigger_at.replace(now);

            log::info!(
                "🎯 点位 {} 触发档位 {:?} -> {:?} 数量 {:.6} (价格 {:.4} -> {:.4})",
                level.id,
                fired.iter().map(|i| i + 1).collect::<Vec<_>>(),
                action,
                size,
                prev_price,
                curr_price
            );
            (action, size)
        })
    }

    /// 清空触发标记和方向，保留连胜、连续止损次数与熔断时间
    pub fn reset_state(&self, level_id: &str) {
        self.store.update(level_id, |state| state.reset_cycle());
    }

    /// 加仓下单失败时撤销刚触发的档位，使其在本轮内可以再次触发
    pub fn revert_last_trigger(&self, level_id: &str) -> bool {
        self.store.update(level_id, |state| state.revert_last_trigger())
    }

    pub fn get_state(&self, level_id: &str) -> Option<LevelRuntimeState> {
        self.store.get(level_id)
    }

    pub fn update_state<R>(
        &self,
        level_id: &str,
        mutator: impl FnOnce(&mut LevelRuntimeState) -> R,
    ) -> R {
        self.store.update(level_id, mutator)
    }

    /// 点位被删除后丢弃其状态
    pub fn forget(&self, level_id: &str) {
        self.store.remove(level_id);
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

/// 防守方向上穿越边界：多头价格自上而下，空头价格自下而上
fn crossed(side: PositionSide, boundary: f64, prev: f64, curr: f64) -> bool {
    match side {
        PositionSide::Long => prev > boundary && curr <= boundary,
        PositionSide::Short => prev < boundary && curr >= boundary,
    }
}

fn inside(side: PositionSide, level_price: f64, boundary: f64, price: f64) -> bool {
    match side {
        PositionSide::Long => price > level_price && price <= boundary,
        PositionSide::Short => price < level_price && price >= boundary,
    }
}

/// 首次评估时，已经处于档位内侧的档位视为已触发（不下单），避免重启后重复入场
fn mark_already_inside(
    state: &mut LevelRuntimeState,
    level_price: f64,
    boundaries: &[f64; 3],
    prev: f64,
    curr: f64,
    side: PositionSide,
) {
    let triggered = state.triggered();
    let mut marked = false;
    for (i, boundary) in boundaries.iter().enumerate() {
        if !triggered[i]
            && inside(side, level_price, *boundary, prev)
            && inside(side, level_price, *boundary, curr)
        {
            state.set_triggered(i);
            marked = true;
        }
    }
    if marked {
        state.active_side = Some(side);
        state.start_range(curr);
        log::info!(
            "♻️ 首次评估价格已在档位内 {:?}，按已触发处理",
            state.triggered()
        );
    }
}
