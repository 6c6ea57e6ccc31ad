// 策略模块 - 点位防守
pub mod level_defense;

pub use level_defense::{LevelDefenseRuntime, TickOrchestrator, TierAction, TierEngine};
