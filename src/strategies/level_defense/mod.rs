pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::orchestrator::TickOrchestrator;
pub use application::tasks::{LevelDefenseRuntime, PriceTick, PriceTickSender};
pub use domain::model::{
    Level, PositionHistory, SessionEvent, StopLossMode, SymbolTiers, TakeProfitMode, TradeRecord,
    TradeSessionLog,
};
pub use domain::repository::{LevelRepository, TradeRepository};
pub use domain::tier_engine::{TierAction, TierEngine};
pub use infrastructure::executor::{DryRunExecutor, ExchangeExecutor, LevelOrder, OrderExecutor};
pub use infrastructure::memory::{MemoryLevelRepository, MemoryTradeRepository};
