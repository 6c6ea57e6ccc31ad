use async_trait::async_trait;

use crate::core::types::Result;
use super::model::{
    Level, PositionHistory, SymbolTiers, TradeRecord, TradeSessionLog,
};

/// 点位与档位配置存储
#[async_trait]
pub trait LevelRepository: Send + Sync {
    async fn create_level(&self, level: &Level) -> Result<()>;

    async fn get_level(&self, level_id: &str) -> Result<Option<Level>>;

    async fn delete_level(&self, level_id: &str) -> Result<()>;

    async fn list_levels(&self) -> Result<Vec<Level>>;

    async fn list_levels_by_symbol(&self, exchange: &str, symbol: &str) -> Result<Vec<Level>>;

    async fn count_levels_by_symbol(&self, exchange: &str, symbol: &str) -> Result<usize> {
        Ok(self.list_levels_by_symbol(exchange, symbol).await?.len())
    }

    /// 删除旧点位并写入替代点位，要求原子完成
    async fn replace_level(&self, old_level_id: &str, replacements: Vec<Level>) -> Result<()>;

    async fn get_symbol_tiers(&self, exchange: &str, symbol: &str) -> Result<Option<SymbolTiers>>;

    /// 同一交易对只保留一行，覆盖写入
    async fn save_symbol_tiers(&self, tiers: &SymbolTiers) -> Result<()>;

    async fn list_symbol_tiers(&self) -> Result<Vec<SymbolTiers>>;
}

/// 成交、平仓历史与会话日志存储（只追加）
#[async_trait]
pub trait TradeRepository: Send + Sync {
    async fn save_trade(&self, trade: &TradeRecord) -> Result<()>;

    async fn list_trades(&self, symbol: Option<&str>, limit: usize) -> Result<Vec<TradeRecord>>;

    async fn save_position_history(&self, history: &PositionHistory) -> Result<()>;

    async fn list_position_history(
        &self,
        symbol: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PositionHistory>>;

    async fn save_session_log(&self, log: &TradeSessionLog) -> Result<()>;

    async fn list_session_logs(&self, limit: usize) -> Result<Vec<TradeSessionLog>>;
}
