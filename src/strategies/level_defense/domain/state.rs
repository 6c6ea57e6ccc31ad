use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::core::types::PositionSide;

/// 点位运行时状态，仅存于内存
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LevelRuntimeState {
    pub tier1_triggered: bool,
    pub tier2_triggered: bool,
    pub tier3_triggered: bool,
    pub last_trigger_at: Option<DateTime<Utc>>,
    pub active_side: Option<PositionSide>,
    pub consecutive_wins: u32,
    pub consecutive_base_closes: u32,
    pub disabled_until: Option<DateTime<Utc>>,
    pub range_high: Option<f64>,
    pub range_low: Option<f64>,
    /// 是否已做过首次评估
    pub initialized: bool,
    /// 最近一次触发的档位，下单失败时据此回退
    pub last_fired: [bool; 3],
    /// 最近一次触发之前的触发时间
    pub prior_trigger_at: Option<DateTime<Utc>>,
}

impl LevelRuntimeState {
    pub fn triggered(&self) -> [bool; 3] {
        [self.tier1_triggered, self.tier2_triggered, self.tier3_triggered]
    }

    pub fn set_triggered(&mut self, tier: usize) {
        match tier {
            0 => self.tier1_triggered = true,
            1 => self.tier2_triggered = true,
            _ => self.tier3_triggered = true,
        }
    }

    /// 撤销最近一次触发：清除对应档位标记并恢复冷却起点
    pub fn revert_last_trigger(&mut self) -> bool {
        if !self.last_fired.iter().any(|f| *f) {
            return false;
        }
        let fired = std::mem::take(&mut self.last_fired);
        if fired[0] {
            self.tier1_triggered = false;
        }
        if fired[1] {
            self.tier2_triggered = false;
        }
        if fired[2] {
            self.tier3_triggered = false;
        }
        self.last_trigger_at = self.prior_trigger_at.take();
        true
    }

    pub fn any_triggered(&self) -> bool {
        self.triggered().iter().any(|t| *t)
    }

    /// 平仓后的复位：触发标记与方向一起清空。
    /// 连胜、连续止损、熔断时间保留；区间在下一次开仓时重新开始
    pub fn reset_cycle(&mut self) {
        self.tier1_triggered = false;
        self.tier2_triggered = false;
        self.tier3_triggered = false;
        self.active_side = None;
        self.last_fired = [false; 3];
    }

    pub fn start_range(&mut self, price: f64) {
        self.range_high = Some(price);
        self.range_low = Some(price);
    }

    pub fn is_disabled(&self, now: DateTime<Utc>) -> bool {
        self.disabled_until.map(|until| now < until).unwrap_or(false)
    }

    pub fn observe_price(&mut self, price: f64) {
        self.range_high = Some(self.range_high.map_or(price, |h| h.max(price)));
        self.range_low = Some(self.range_low.map_or(price, |l| l.min(price)));
    }
}

/// 以点位ID为键的状态仓库，所有读写都经过同一把锁
#[derive(Debug, Default)]
pub struct LevelStateStore {
    states: Mutex<HashMap<String, LevelRuntimeState>>,
}

impl LevelStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LevelRuntimeState>> {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 返回状态副本
    pub fn get(&self, level_id: &str) -> Option<LevelRuntimeState> {
        self.lock().get(level_id).cloned()
    }

    /// 在锁内修改状态（不存在则先创建），返回闭包结果
    pub fn update<R>(&self, level_id: &str, f: impl FnOnce(&mut LevelRuntimeState) -> R) -> R {
        let mut states = self.lock();
        let state = states.entry(level_id.to_string()).or_default();
        f(state)
    }

    pub fn remove(&self, level_id: &str) -> Option<LevelRuntimeState> {
        self.lock().remove(level_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
