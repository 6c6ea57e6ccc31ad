//! 内存存储，用于模拟运行和测试

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

use crate::analysis::{LiquiditySnapshot, SnapshotStore};
use crate::core::error::ExchangeError;
use crate::core::types::Result;
use crate::strategies::level_defense::domain::model::{
    Level, PositionHistory, SymbolTiers, TradeRecord, TradeSessionLog,
};
use crate::strategies::level_defense::domain::repository::{LevelRepository, TradeRepository};

/// 每个交易对保留的流动性快照条数
const MAX_SNAPSHOTS_PER_SYMBOL: usize = 1000;

#[derive(Default)]
struct LevelTables {
    levels: BTreeMap<String, Level>,
    tiers: HashMap<(String, String), SymbolTiers>,
    snapshots: HashMap<String, Vec<LiquiditySnapshot>>,
}

#[derive(Default)]
pub struct MemoryLevelRepository {
    tables: RwLock<LevelTables>,
}

impl MemoryLevelRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_levels<'a>(levels: impl Iterator<Item = &'a Level>) -> Vec<Level> {
    let mut out: Vec<Level> = levels.cloned().collect();
    out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    out
}

#[async_trait]
impl LevelRepository for MemoryLevelRepository {
    async fn create_level(&self, level: &Level) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.levels.contains_key(&level.id) {
            return Err(ExchangeError::ValidationError {
                field: "id".to_string(),
                reason: format!("点位 {} 已存在", level.id),
            });
        }
        tables.levels.insert(level.id.clone(), level.clone());
        Ok(())
    }

    async fn get_level(&self, level_id: &str) -> Result<Option<Level>> {
        Ok(self.tables.read().await.levels.get(level_id).cloned())
    }

    async fn delete_level(&self, level_id: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables
            .levels
            .remove(level_id)
            .map(|_| ())
            .ok_or_else(|| ExchangeError::RepositoryError(format!("点位 {} 不存在", level_id)))
    }

    async fn list_levels(&self) -> Result<Vec<Level>> {
        Ok(sorted_levels(self.tables.read().await.levels.values()))
    }

    async fn list_levels_by_symbol(&self, exchange: &str, symbol: &str) -> Result<Vec<Level>> {
        let tables = self.tables.read().await;
        Ok(sorted_levels(
            tables
                .levels
                .values()
                .filter(|l| l.exchange == exchange && l.symbol == symbol),
        ))
    }

    async fn replace_level(&self, old_level_id: &str, replacements: Vec<Level>) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.levels.contains_key(old_level_id) {
            return Err(ExchangeError::RepositoryError(format!(
                "点位 {} 不存在",
                old_level_id
            )));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = replacements.iter().find(|l| {
            !seen.insert(l.id.as_str())
                || (l.id != old_level_id && tables.levels.contains_key(&l.id))
        }) {
            return Err(ExchangeError::ValidationError {
                field: "id".to_string(),
                reason: format!("点位 {} 已存在", dup.id),
            });
        }

        tables.levels.remove(old_level_id);
        for level in replacements {
            tables.levels.insert(level.id.clone(), level);
        }
        Ok(())
    }

    async fn get_symbol_tiers(&self, exchange: &str, symbol: &str) -> Result<Option<SymbolTiers>> {
        let tables = self.tables.read().await;
        Ok(tables
            .tiers
            .get(&(exchange.to_string(), symbol.to_string()))
            .cloned())
    }

    async fn save_symbol_tiers(&self, tiers: &SymbolTiers) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.tiers.insert(
            (tiers.exchange.clone(), tiers.symbol.clone()),
            tiers.clone(),
        );
        Ok(())
    }

    async fn list_symbol_tiers(&self) -> Result<Vec<SymbolTiers>> {
        let tables = self.tables.read().await;
        let mut out: Vec<SymbolTiers> = tables.tiers.values().cloned().collect();
        out.sort_by(|a, b| (&a.exchange, &a.symbol).cmp(&(&b.exchange, &b.symbol)));
        Ok(out)
    }
}

#[async_trait]
impl SnapshotStore for MemoryLevelRepository {
    async fn save_liquidity_snapshot(&self, snapshot: &LiquiditySnapshot) -> Result<()> {
        let mut tables = self.tables.write().await;
        let history = tables.snapshots.entry(snapshot.symbol.clone()).or_default();
        history.push(snapshot.clone());
        if history.len() > MAX_SNAPSHOTS_PER_SYMBOL {
            let excess = history.len() - MAX_SNAPSHOTS_PER_SYMBOL;
            history.drain(..excess);
        }
        Ok(())
    }

    async fn list_liquidity_snapshots(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<LiquiditySnapshot>> {
        let tables = self.tables.read().await;
        Ok(tables
            .snapshots
            .get(symbol)
            .map(|h| h.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[derive(Default)]
struct TradeTables {
    trades: Vec<TradeRecord>,
    history: Vec<PositionHistory>,
    sessions: Vec<TradeSessionLog>,
}

/// 只追加的成交/平仓/会话记录
#[derive(Default)]
pub struct MemoryTradeRepository {
    tables: RwLock<TradeTables>,
}

impl MemoryTradeRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TradeRepository for MemoryTradeRepository {
    async fn save_trade(&self, trade: &TradeRecord) -> Result<()> {
        self.tables.write().await.trades.push(trade.clone());
        Ok(())
    }

    async fn list_trades(&self, symbol: Option<&str>, limit: usize) -> Result<Vec<TradeRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .trades
            .iter()
            .rev()
            .filter(|t| symbol.map_or(true, |s| t.symbol == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn save_position_history(&self, history: &PositionHistory) -> Result<()> {
        self.tables.write().await.history.push(history.clone());
        Ok(())
    }

    async fn list_position_history(
        &self,
        symbol: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PositionHistory>> {
        let tables = self.tables.read().await;
        Ok(tables
            .history
            .iter()
            .rev()
            .filter(|h| symbol.map_or(true, |s| h.symbol == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn save_session_log(&self, log: &TradeSessionLog) -> Result<()> {
        self.tables.write().await.sessions.push(log.clone());
        Ok(())
    }

    async fn list_session_logs(&self, limit: usize) -> Result<Vec<TradeSessionLog>> {
        let tables = self.tables.read().await;
        Ok(tables.sessions.iter().rev().take(limit).cloned().collect())
    }
}
