//! 行情驱动的点位防守调度
//!
//! 每个价格 tick：更新最新价 → 取缓存的点位/档位 → 读成交情绪 →
//! 持仓风控（情绪强平、止盈、基准位安全检查）→ 逐个点位调用档位状态机 → 执行下单。
//! 同一交易对的 tick 串行处理；不同交易对互不阻塞。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, RwLock};

use super::closing::CloseReason;
use super::filters;
use crate::analysis::MarketEngine;
use crate::core::clock::Clock;
use crate::core::config::DefenseConfig;
use crate::core::exchange::Exchange;
use crate::strategies::level_defense::domain::repository::{LevelRepository, TradeRepository};
use crate::core::types::{Position, PositionSide, Result};
use crate::strategies::level_defense::domain::model::{
    Level, SessionEvent, SymbolTiers, TakeProfitMode, TradeRecord,
};
use crate::strategies::level_defense::domain::tier_engine::{TierAction, TierEngine};
use crate::strategies::level_defense::infrastructure::executor::{LevelOrder, OrderExecutor};
use crate::utils::background::BackgroundTasks;

/// (exchange, symbol)
pub(crate) type SymbolKey = (String, String);

#[derive(Default)]
pub(crate) struct LevelCache {
    pub last_prices: HashMap<String, f64>,
    pub levels: HashMap<SymbolKey, Vec<Level>>,
    pub tiers: HashMap<SymbolKey, SymbolTiers>,
}

pub struct TickOrchestrator {
    pub(crate) exchange: Arc<dyn Exchange>,
    pub(crate) executor: Arc<dyn OrderExecutor>,
    pub(crate) level_repo: Arc<dyn LevelRepository>,
    pub(crate) trade_repo: Arc<dyn TradeRepository>,
    pub(crate) market: Arc<MarketEngine>,
    pub(crate) tier_engine: Arc<TierEngine>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: DefenseConfig,
    pub(crate) background: Arc<BackgroundTasks>,
    pub(crate) cache: RwLock<LevelCache>,
    symbol_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TickOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn Exchange>,
        executor: Arc<dyn OrderExecutor>,
        level_repo: Arc<dyn LevelRepository>,
        trade_repo: Arc<dyn TradeRepository>,
        market: Arc<MarketEngine>,
        tier_engine: Arc<TierEngine>,
        config: DefenseConfig,
        background: Arc<BackgroundTasks>,
    ) -> Self {
        let clock = tier_engine.clock().clone();
        Self {
            exchange,
            executor,
            level_repo,
            trade_repo,
            market,
            tier_engine,
            clock,
            config,
            background,
            cache: RwLock::new(LevelCache::default()),
            symbol_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn tier_engine(&self) -> &Arc<TierEngine> {
        &self.tier_engine
    }

    pub fn background(&self) -> &Arc<BackgroundTasks> {
        &self.background
    }

    fn symbol_lock(&self, symbol: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .symbol_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 从存储重新加载点位与档位；被删除点位的运行时状态一并丢弃
    pub async fn update_cache(&self) -> Result<()> {
        let levels = self.level_repo.list_levels().await?;
        let tiers = self.level_repo.list_symbol_tiers().await?;

        let mut by_symbol: HashMap<SymbolKey, Vec<Level>> = HashMap::new();
        for level in levels {
            by_symbol
                .entry((level.exchange.clone(), level.symbol.clone()))
                .or_default()
                .push(level);
        }
        let tiers: HashMap<SymbolKey, SymbolTiers> = tiers
            .into_iter()
            .map(|t| ((t.exchange.clone(), t.symbol.clone()), t))
            .collect();

        let current: HashSet<&str> = by_symbol
            .values()
            .flatten()
            .map(|l| l.id.as_str())
            .collect();
        let removed: Vec<String> = {
            let cache = self.cache.read().await;
            cache
                .levels
                .values()
                .flatten()
                .filter(|l| !current.contains(l.id.as_str()))
                .map(|l| l.id.clone())
                .collect()
        };
        for id in &removed {
            self.tier_engine.forget(id);
        }

        let level_count: usize = by_symbol.values().map(Vec::len).sum();
        {
            let mut cache = self.cache.write().await;
            cache.levels = by_symbol;
            cache.tiers = tiers;
        }
        log::debug!(
            "[level_defense] 缓存已刷新: {} 个点位, 移除 {} 个",
            level_count,
            removed.len()
        );
        Ok(())
    }

    pub async fn get_latest_price(&self, symbol: &str) -> Option<f64> {
        self.cache.read().await.last_prices.get(symbol).copied()
    }

    async fn cached(&self, exchange: &str, symbol: &str) -> Option<(Vec<Level>, SymbolTiers)> {
        let cache = self.cache.read().await;
        let key = (exchange.to_string(), symbol.to_string());
        let levels = cache.levels.get(&key).filter(|l| !l.is_empty())?.clone();
        let tiers = cache.tiers.get(&key)?.clone();
        Some((levels, tiers))
    }

    pub async fn process_tick(&self, exchange: &str, symbol: &str, price: f64) -> Result<()> {
        let lock = self.symbol_lock(symbol);
        let _guard = lock.lock().await;

        let previous = {
            let mut cache = self.cache.write().await;
            cache.last_prices.insert(symbol.to_string(), price)
        };
        let Some(prev_price) = previous else {
            log::debug!("[level_defense] {} 首个价格 {:.4}，仅记录", symbol, price);
            return Ok(());
        };

        let Some((levels, tiers)) = self.cached(exchange, symbol).await else {
            return Ok(());
        };

        let sentiment = self.market.get_trade_sentiment(symbol).await;

        let position = match self.exchange.get_position(symbol).await {
            Ok(position) => position.filter(Position::is_open),
            Err(e) => {
                log::warn!("[level_defense] {} 查询持仓失败，放弃本次 tick: {}", symbol, e);
                return Err(e);
            }
        };

        if let Some(position) = position {
            if self
                .guard_open_position(exchange, symbol, &levels, &tiers, &position, price, sentiment)
                .await
            {
                return Ok(());
            }
        }

        for level in &levels {
            self.evaluate_level(exchange, level, &tiers, prev_price, price, sentiment)
                .await;
        }
        Ok(())
    }

    /// 持有该方向仓位的点位：状态机中方向一致者优先，否则取最近的点位
    pub(crate) fn owning_level<'a>(
        &self,
        levels: &'a [Level],
        side: PositionSide,
        price: f64,
    ) -> Option<&'a Level> {
        levels
            .iter()
            .find(|l| {
                self.tier_engine
                    .get_state(&l.id)
                    .map_or(false, |s| s.active_side == Some(side))
            })
            .or_else(|| filters::closest_level(levels, price))
    }

    /// 持仓风控，发生平仓时返回 true
    #[allow(clippy::too_many_arguments)]
    async fn guard_open_position(
        &self,
        exchange: &str,
        symbol: &str,
        levels: &[Level],
        tiers: &SymbolTiers,
        position: &Position,
        price: f64,
        sentiment: f64,
    ) -> bool {
        let Some(owner) = self.owning_level(levels, position.side, price) else {
            return false;
        };

        let threshold = filters::sentiment_threshold(&self.config, tiers, owner, position.side, price);
        if !owner.disable_speed_close
            && filters::sentiment_opposes(position.side, sentiment, threshold)
        {
            log::warn!(
                "[level_defense] {} 情绪 {:.3} 反向超过阈值 {:.2}，强制平仓 {}",
                symbol,
                sentiment,
                threshold,
                position.side
            );
            let reset: Vec<String> = levels.iter().map(|l| l.id.clone()).collect();
            self.close_cycle(exchange, owner, &reset, price, CloseReason::Sentiment)
                .await;
            return true;
        }

        if owner.take_profit_pct > 0.0 {
            let conclusion = match owner.take_profit_mode {
                TakeProfitMode::Sentiment => {
                    self.market.get_market_stats(symbol).await.conclusion_score()
                }
                TakeProfitMode::Fixed => 0.0,
            };
            if let Some(target) = filters::take_profit_price(
                position,
                owner.take_profit_pct,
                owner.take_profit_mode,
                conclusion,
            ) {
                if filters::take_profit_hit(position, price, target) {
                    log::info!(
                        "[level_defense] {} 触发止盈 目标 {:.4} 当前 {:.4}",
                        symbol,
                        target,
                        price
                    );
                    self.close_cycle(
                        exchange,
                        owner,
                        std::slice::from_ref(&owner.id),
                        price,
                        CloseReason::TakeProfit,
                    )
                    .await;
                    return true;
                }
            }
        }

        // 状态机持有方向时由它在回到点位时平仓；状态缺失（如重启）时在此兜底
        let tracked = self
            .tier_engine
            .get_state(&owner.id)
            .map_or(false, |s| s.active_side == Some(position.side));
        if owner.stop_loss_at_base
            && !tracked
            && filters::base_violated(position.side, owner.price, price)
        {
            log::warn!(
                "[level_defense] {} {} 仓位位于点位 {:.4} 错误一侧 (当前 {:.4})，安全平仓",
                symbol,
                position.side,
                owner.price,
                price
            );
            self.close_cycle(
                exchange,
                owner,
                std::slice::from_ref(&owner.id),
                price,
                CloseReason::BaseSafety,
            )
            .await;
            return true;
        }
        false
    }

    async fn evaluate_level(
        &self,
        exchange: &str,
        level: &Level,
        tiers: &SymbolTiers,
        prev_price: f64,
        price: f64,
        sentiment: f64,
    ) {
        let side = level.side_for_price(price);
        let boundaries = side.map_or([level.price; 3], |s| tiers.boundaries(level.price, s));
        let (action, size) = self
            .tier_engine
            .evaluate(level, &boundaries, prev_price, price, side);

        match action {
            TierAction::None => {}
            TierAction::Close => {
                self.close_cycle(
                    exchange,
                    level,
                    std::slice::from_ref(&level.id),
                    price,
                    CloseReason::BaseReturn,
                )
                .await;
            }
            TierAction::Open | TierAction::AddToPosition => {
                let Some(side) = side else { return };
                self.execute_entry(exchange, level, tiers, side, action, size, price, sentiment)
                    .await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_entry(
        &self,
        exchange: &str,
        level: &Level,
        tiers: &SymbolTiers,
        side: PositionSide,
        action: TierAction,
        size: f64,
        price: f64,
        sentiment: f64,
    ) {
        let threshold = filters::sentiment_threshold(&self.config, tiers, level, side, price);
        if filters::sentiment_opposes(side, sentiment, threshold) {
            log::info!(
                "[level_defense] {} {:?} 被情绪否决: {:.3} (阈值 {:.2})",
                level.id,
                action,
                sentiment,
                threshold
            );
            if action == TierAction::Open {
                self.tier_engine.reset_state(&level.id);
            }
            self.spawn_session_log(
                level,
                SessionEvent::EntryVetoed,
                format!("{:?} {} 情绪 {:.3} 阈值 {:.2}", action, side, sentiment, threshold),
                price,
            );
            return;
        }

        let order = LevelOrder {
            level_id: level.id.clone(),
            symbol: level.symbol.clone(),
            side,
            size,
            leverage: level.leverage,
            margin_type: level.margin_type,
            stop_loss: level.exchange_stop_loss(),
        };
        match self.executor.execute(&order).await {
            Ok(()) => {
                log::info!(
                    "[level_defense] ✅ {} {:?} {} {} 数量 {:.6} @ {:.4} ({})",
                    level.id,
                    action,
                    level.symbol,
                    side,
                    size,
                    price,
                    self.executor.name()
                );
                self.spawn_audit_trade(TradeRecord {
                    exchange: exchange.to_string(),
                    symbol: level.symbol.clone(),
                    level_id: level.id.clone(),
                    side,
                    size,
                    price,
                    realized_pnl: 0.0,
                    timestamp: self.clock.now(),
                });
            }
            Err(e) => {
                log::error!("[level_defense] ❌ {} 下单失败 {:?}: {}", level.id, action, e);
                // 失败的档位撤回，价格再次穿越时可以重试
                self.tier_engine.revert_last_trigger(&level.id);
                if action == TierAction::Open {
                    self.tier_engine.reset_state(&level.id);
                }
            }
        }
    }

    /// 周期性安全检查：仓位方向与价格相对点位矛盾时强制平仓
    pub async fn check_safety(&self) -> Result<()> {
        let targets: Vec<(SymbolKey, Vec<Level>, f64)> = {
            let cache = self.cache.read().await;
            cache
                .levels
                .iter()
                .filter(|(_, levels)| !levels.is_empty())
                .filter_map(|(key, levels)| {
                    let price = cache.last_prices.get(&key.1)?;
                    Some((key.clone(), levels.clone(), *price))
                })
                .collect()
        };

        for ((exchange, symbol), levels, price) in targets {
            let lock = self.symbol_lock(&symbol);
            let _guard = lock.lock().await;

            let position = match self.exchange.get_position(&symbol).await {
                Ok(Some(position)) if position.is_open() => position,
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("[level_defense] 安全检查 {} 查询持仓失败: {}", symbol, e);
                    continue;
                }
            };
            let Some(owner) = self.owning_level(&levels, position.side, price) else {
                continue;
            };
            if owner.stop_loss_at_base && filters::base_violated(position.side, owner.price, price) {
                log::warn!(
                    "[level_defense] 安全检查: {} {} 仓位越过点位 {:.4} (当前 {:.4})",
                    symbol,
                    position.side,
                    owner.price,
                    price
                );
                self.close_cycle(
                    &exchange,
                    owner,
                    std::slice::from_ref(&owner.id),
                    price,
                    CloseReason::BaseSafety,
                )
                .await;
            }
        }
        Ok(())
    }

    /// 手动平仓，并复位该交易对所有点位
    pub async fn close_position(&self, symbol: &str) -> Result<()> {
        let lock = self.symbol_lock(symbol);
        let _guard = lock.lock().await;

        let (entry, price) = {
            let cache = self.cache.read().await;
            let entry = cache
                .levels
                .iter()
                .find(|((_, s), levels)| s == symbol && !levels.is_empty())
                .map(|((exchange, _), levels)| (exchange.clone(), levels.clone()));
            (entry, cache.last_prices.get(symbol).copied())
        };

        let Some((exchange, levels)) = entry else {
            log::info!("[level_defense] {} 无缓存点位，直接平仓", symbol);
            return self.exchange.close_position(symbol).await;
        };
        let price = match price {
            Some(price) => price,
            None => self.exchange.get_current_price(symbol).await?,
        };
        let side = match self.exchange.get_position(symbol).await? {
            Some(position) if position.is_open() => position.side,
            _ => PositionSide::Long,
        };
        let Some(owner) = self.owning_level(&levels, side, price) else {
            return Ok(());
        };
        let reset: Vec<String> = levels.iter().map(|l| l.id.clone()).collect();
        self.close_cycle(&exchange, owner, &reset, price, CloseReason::Manual)
            .await;
        Ok(())
    }

    pub(crate) fn spawn_audit_trade(&self, record: TradeRecord) {
        let repo = self.trade_repo.clone();
        self.background.spawn(
            format!("audit_trade {}", record.level_id),
            self.config.background_timeout(),
            async move { repo.save_trade(&record).await },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::config::MarketConfig;
    use crate::strategies::level_defense::domain::model::StopLossMode;
    use crate::strategies::level_defense::infrastructure::executor::ExchangeExecutor;
    use crate::strategies::level_defense::infrastructure::memory::{
        MemoryLevelRepository, MemoryTradeRepository,
    };
    use crate::testing::{trade, MockExchange};
    use chrono::{Duration, Utc};

    const EX: &str = "bybit";
    const SYMBOL: &str = "BTCUSDT";
    const BASE: f64 = 0.01;

    struct Harness {
        mock: Arc<MockExchange>,
        clock: ManualClock,
        levels: Arc<MemoryLevelRepository>,
        trades: Arc<MemoryTradeRepository>,
        market: Arc<MarketEngine>,
        orch: TickOrchestrator,
    }

    impl Harness {
        async fn tick(&self, price: f64) {
            self.mock.set_price(SYMBOL, price);
            self.orch.process_tick(EX, SYMBOL, price).await.unwrap();
        }

        async fn ticks(&self, prices: &[f64]) {
            for price in prices {
                self.tick(*price).await;
            }
        }

        fn order_sizes(&self) -> Vec<f64> {
            self.mock.orders().iter().map(|o| o.size).collect()
        }

        async fn session_events(&self) -> Vec<SessionEvent> {
            self.orch.background().wait_idle().await;
            let mut logs = self.trades.list_session_logs(100).await.unwrap();
            logs.reverse();
            logs.into_iter().map(|l| l.event).collect()
        }

        async fn sentiment_trade(&self, side: &str, size: f64) {
            self.market
                .ingest_trade(trade(SYMBOL, side, 10_050.0, size, self.clock.now()))
                .await;
        }
    }

    fn defended_level() -> Level {
        let mut level = Level::new(EX, SYMBOL, 10_000.0, BASE);
        level.id = "LV-test".to_string();
        level
    }

    async fn harness(level: Level) -> Harness {
        let mock = Arc::new(MockExchange::new());
        let clock = ManualClock::new(Utc::now());
        let levels = Arc::new(MemoryLevelRepository::new());
        let trades = Arc::new(MemoryTradeRepository::new());
        levels.create_level(&level).await.unwrap();
        levels
            .save_symbol_tiers(&SymbolTiers::new(EX, SYMBOL, 0.5, 0.3, 0.15))
            .await
            .unwrap();

        let market = Arc::new(
            MarketEngine::new(mock.clone(), MarketConfig::default())
                .with_clock(Arc::new(clock.clone())),
        );
        let orch = TickOrchestrator::new(
            mock.clone(),
            Arc::new(ExchangeExecutor::new(mock.clone())),
            levels.clone(),
            trades.clone(),
            market.clone(),
            Arc::new(TierEngine::with_clock(Arc::new(clock.clone()))),
            DefenseConfig::default(),
            Arc::new(BackgroundTasks::new()),
        );
        orch.update_cache().await.unwrap();

        Harness {
            mock,
            clock,
            levels,
            trades,
            market,
            orch,
        }
    }

    #[tokio::test]
    async fn test_first_tick_only_seeds() {
        let h = harness(defended_level()).await;
        h.tick(10_100.0).await;
        assert_eq!(h.orch.get_latest_price(SYMBOL).await, Some(10_100.0));
        assert_eq!(h.mock.state().position_requests, 0);
        assert!(h.orch.get_latest_price("ETHUSDT").await.is_none());
    }

    #[tokio::test]
    async fn test_long_defense_full_cycle() {
        let h = harness(defended_level()).await;
        h.ticks(&[10_100.0, 10_040.0, 10_020.0, 10_010.0]).await;
        assert_eq!(h.order_sizes(), vec![BASE, BASE, 2.0 * BASE]);
        assert!(h.mock.orders().iter().all(|o| o.side == PositionSide::Long));
        assert!(h.mock.orders().iter().all(|o| o.stop_loss.is_none()));

        h.tick(10_000.0).await;
        assert_eq!(h.mock.closes(), vec![SYMBOL.to_string()]);
        let state = h.orch.tier_engine().get_state("LV-test").unwrap();
        assert!(!state.any_triggered());
        assert_eq!(state.active_side, None);

        let history = h.trades.list_position_history(Some(SYMBOL), 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!((history[0].entry_price - 10_020.0).abs() < 1e-6);
        assert!((history[0].realized_pnl - (-0.8)).abs() < 1e-6);

        h.orch.background().wait_idle().await;
        let audit = h.trades.list_trades(Some(SYMBOL), 10).await.unwrap();
        assert_eq!(audit.len(), 4);
        let closes: Vec<&TradeRecord> = audit.iter().filter(|t| t.size == 0.0).collect();
        assert_eq!(closes.len(), 1);
        assert!((closes[0].realized_pnl - (-0.8)).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_short_side_with_exchange_stop() {
        let mut level = defended_level();
        level.stop_loss_mode = StopLossMode::Exchange;
        let h = harness(level).await;

        h.ticks(&[9_900.0, 9_960.0, 9_980.0, 9_990.0]).await;
        let orders = h.mock.orders();
        assert_eq!(h.order_sizes(), vec![BASE, BASE, 2.0 * BASE]);
        assert!(orders.iter().all(|o| o.side == PositionSide::Short));
        assert!(orders.iter().all(|o| o.stop_loss == Some(10_000.0)));

        h.tick(10_000.0).await;
        assert_eq!(h.mock.closes().len(), 1);
    }

    #[tokio::test]
    async fn test_hold_without_stop_at_base() {
        let mut level = defended_level();
        level.stop_loss_at_base = false;
        let h = harness(level).await;

        h.ticks(&[10_100.0, 10_040.0, 10_000.0, 9_990.0]).await;
        assert_eq!(h.order_sizes(), vec![BASE]);
        assert!(h.mock.closes().is_empty());
        h.orch.check_safety().await.unwrap();
        assert!(h.mock.closes().is_empty());
    }

    #[tokio::test]
    async fn test_circuit_breaker_blocks_until_cooldown() {
        let mut level = defended_level();
        level.max_consecutive_base_closes = 2;
        level.base_close_cooldown_ms = 60_000;
        let h = harness(level).await;

        h.ticks(&[10_100.0, 10_040.0, 10_000.0]).await;
        h.ticks(&[10_100.0, 10_040.0, 10_000.0]).await;
        assert_eq!(h.mock.closes().len(), 2);
        assert_eq!(h.order_sizes().len(), 2);

        h.ticks(&[10_100.0, 10_040.0]).await;
        assert_eq!(h.order_sizes().len(), 2);
        let state = h.orch.tier_engine().get_state("LV-test").unwrap();
        assert_eq!(state.consecutive_base_closes, 0);
        assert!(state.disabled_until.is_some());

        h.clock.advance(Duration::milliseconds(60_001));
        h.ticks(&[10_100.0, 10_040.0]).await;
        assert_eq!(h.order_sizes().len(), 3);

        let events = h.session_events().await;
        assert!(events.contains(&SessionEvent::CircuitBreaker));
        assert!(!events.contains(&SessionEvent::AutoSplit));
    }

    #[tokio::test]
    async fn test_auto_split_replaces_level() {
        let mut level = defended_level();
        level.max_consecutive_base_closes = 1;
        level.base_close_cooldown_ms = 60_000;
        level.auto_mode_enabled = true;
        let h = harness(level).await;

        h.ticks(&[10_100.0, 10_040.0, 10_000.0]).await;
        h.orch.background().wait_idle().await;

        let levels = h.levels.list_levels().await.unwrap();
        assert_eq!(levels.len(), 2);
        assert!(levels.iter().all(|l| l.auto_created && l.auto_mode_enabled));
        assert!(levels.iter().all(|l| l.source == "auto_split:LV-test"));
        let mut prices: Vec<f64> = levels.iter().map(|l| l.price).collect();
        prices.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(prices, vec![10_000.0, 10_040.0]);
        assert!(h.session_events().await.contains(&SessionEvent::AutoSplit));

        h.orch.update_cache().await.unwrap();
        assert!(h.orch.tier_engine().get_state("LV-test").is_none());
    }

    #[tokio::test]
    async fn test_profit_doubles_next_entry() {
        let mut level = defended_level();
        level.take_profit_pct = 0.5;
        let h = harness(level).await;

        h.ticks(&[10_100.0, 10_040.0]).await;
        h.tick(10_100.0).await;
        assert_eq!(h.mock.closes().len(), 1);
        let history = h.trades.list_position_history(None, 10).await.unwrap();
        assert!(history[0].realized_pnl > 0.0);

        h.tick(10_040.0).await;
        assert_eq!(h.order_sizes(), vec![BASE, 2.0 * BASE]);
        assert!(h.session_events().await.contains(&SessionEvent::TakeProfitClose));
    }

    #[tokio::test]
    async fn test_loss_keeps_base_size() {
        let h = harness(defended_level()).await;
        h.ticks(&[10_100.0, 10_040.0, 10_000.0, 10_100.0, 10_040.0]).await;
        assert_eq!(h.order_sizes(), vec![BASE, BASE]);
    }

    #[tokio::test]
    async fn test_sentiment_veto_resets_entry() {
        let h = harness(defended_level()).await;
        h.sentiment_trade("Sell", 1.0).await;

        h.ticks(&[10_100.0, 10_040.0]).await;
        assert!(h.mock.orders().is_empty());
        let state = h.orch.tier_engine().get_state("LV-test").unwrap();
        assert_eq!(state.active_side, None);
        assert!(!state.any_triggered());
        assert!(h.session_events().await.contains(&SessionEvent::EntryVetoed));

        h.sentiment_trade("Buy", 10.0).await;
        h.ticks(&[10_100.0, 10_040.0]).await;
        assert_eq!(h.order_sizes(), vec![BASE]);
    }

    #[tokio::test]
    async fn test_sentiment_forces_close() {
        let h = harness(defended_level()).await;
        h.ticks(&[10_100.0, 10_040.0]).await;
        h.sentiment_trade("Sell", 1.0).await;

        h.tick(10_045.0).await;
        assert_eq!(h.mock.closes(), vec![SYMBOL.to_string()]);
        assert_eq!(
            h.orch.tier_engine().get_state("LV-test").unwrap().active_side,
            None
        );
        assert!(h.session_events().await.contains(&SessionEvent::SentimentClose));
    }

    #[tokio::test]
    async fn test_speed_close_disabled_keeps_position() {
        let mut level = defended_level();
        level.disable_speed_close = true;
        let h = harness(level).await;
        h.ticks(&[10_100.0, 10_040.0]).await;
        h.sentiment_trade("Sell", 1.0).await;

        h.tick(10_045.0).await;
        assert!(h.mock.closes().is_empty());
    }

    #[tokio::test]
    async fn test_restart_recovery_closes_stale_position() {
        let h = harness(defended_level()).await;
        h.mock.set_position(Position {
            symbol: SYMBOL.to_string(),
            side: PositionSide::Long,
            size: BASE,
            entry_price: 10_040.0,
            current_price: 10_040.0,
            unrealized_pnl: 0.0,
            leverage: 10,
            margin_type: crate::core::types::MarginType::Isolated,
        });

        h.ticks(&[10_020.0, 9_990.0]).await;
        assert_eq!(h.mock.closes(), vec![SYMBOL.to_string()]);
        let history = h.trades.list_position_history(None, 10).await.unwrap();
        assert!((history[0].realized_pnl - (-0.5)).abs() < 1e-6);
        assert!(h.session_events().await.contains(&SessionEvent::BaseSafetyClose));
    }

    #[tokio::test]
    async fn test_failed_open_resets_state() {
        let h = harness(defended_level()).await;
        h.mock.state().fail_orders = true;
        h.ticks(&[10_100.0, 10_040.0]).await;
        assert_eq!(
            h.orch.tier_engine().get_state("LV-test").unwrap().active_side,
            None
        );

        h.mock.state().fail_orders = false;
        h.ticks(&[10_100.0, 10_040.0]).await;
        assert_eq!(h.order_sizes(), vec![BASE]);
    }

    #[tokio::test]
    async fn test_failed_add_can_retry_same_tier() {
        let h = harness(defended_level()).await;
        h.ticks(&[10_100.0, 10_040.0]).await;

        h.mock.state().fail_orders = true;
        h.tick(10_020.0).await;
        assert_eq!(
            h.orch.tier_engine().get_state("LV-test").unwrap().triggered(),
            [true, false, false]
        );

        h.mock.state().fail_orders = false;
        h.ticks(&[10_035.0, 10_025.0]).await;
        assert_eq!(h.order_sizes(), vec![BASE, BASE]);
        assert_eq!(
            h.orch.tier_engine().get_state("LV-test").unwrap().triggered(),
            [true, true, false]
        );
    }

    #[tokio::test]
    async fn test_restart_inside_zone_without_position_is_not_stop_out() {
        let mut level = defended_level();
        level.max_consecutive_base_closes = 1;
        level.base_close_cooldown_ms = 60_000;
        level.auto_mode_enabled = true;
        let h = harness(level).await;

        // 重启时价格已在第一档内，没有持仓，随后回到点位
        h.ticks(&[10_045.0, 10_040.0]).await;
        assert_eq!(
            h.orch.tier_engine().get_state("LV-test").unwrap().active_side,
            Some(PositionSide::Long)
        );
        h.tick(10_000.0).await;

        assert!(h.mock.orders().is_empty());
        let state = h.orch.tier_engine().get_state("LV-test").unwrap();
        assert_eq!(state.active_side, None);
        assert_eq!(state.consecutive_base_closes, 0);
        assert_eq!(state.disabled_until, None);

        let events = h.session_events().await;
        assert!(!events.contains(&SessionEvent::CircuitBreaker));
        let levels = h.levels.list_levels().await.unwrap();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].id, "LV-test");

        h.ticks(&[10_100.0, 10_040.0]).await;
        assert_eq!(h.order_sizes(), vec![BASE]);
    }

    #[tokio::test]
    async fn test_failed_close_still_resets() {
        let h = harness(defended_level()).await;
        h.ticks(&[10_100.0, 10_040.0]).await;
        h.mock.state().fail_close = true;

        h.tick(10_000.0).await;
        assert_eq!(h.mock.closes().len(), 1);
        let state = h.orch.tier_engine().get_state("LV-test").unwrap();
        assert_eq!(state.active_side, None);
        assert!(!state.any_triggered());

        h.ticks(&[10_100.0, 10_040.0]).await;
        assert_eq!(h.order_sizes(), vec![BASE, BASE]);
    }

    #[tokio::test]
    async fn test_position_query_failure_abandons_tick() {
        let h = harness(defended_level()).await;
        h.tick(10_100.0).await;
        h.mock.state().fail_position = true;
        assert!(h.orch.process_tick(EX, SYMBOL, 10_040.0).await.is_err());
        assert!(h.mock.orders().is_empty());
        assert_eq!(h.orch.get_latest_price(SYMBOL).await, Some(10_040.0));
    }

    #[tokio::test]
    async fn test_missing_tiers_is_not_tradable() {
        let h = harness(defended_level()).await;
        h.orch.process_tick(EX, "ETHUSDT", 2_000.0).await.unwrap();

        let mut eth = Level::new(EX, "ETHUSDT", 2_000.0, 1.0);
        eth.id = "LV-eth".to_string();
        h.levels.create_level(&eth).await.unwrap();
        h.orch.update_cache().await.unwrap();
        h.orch.process_tick(EX, "ETHUSDT", 2_010.0).await.unwrap();
        h.orch.process_tick(EX, "ETHUSDT", 2_005.0).await.unwrap();
        assert!(h.mock.orders().is_empty());
        assert_eq!(h.mock.state().position_requests, 0);
    }

    #[tokio::test]
    async fn test_safety_check_closes_wrong_side() {
        let h = harness(defended_level()).await;
        h.ticks(&[10_100.0, 10_040.0]).await;
        h.orch
            .cache
            .write()
            .await
            .last_prices
            .insert(SYMBOL.to_string(), 9_990.0);

        h.orch.check_safety().await.unwrap();
        assert_eq!(h.mock.closes(), vec![SYMBOL.to_string()]);
        let state = h.orch.tier_engine().get_state("LV-test").unwrap();
        assert_eq!(state.consecutive_base_closes, 1);
    }

    #[tokio::test]
    async fn test_manual_close() {
        let h = harness(defended_level()).await;
        h.ticks(&[10_100.0, 10_040.0]).await;
        h.orch.close_position(SYMBOL).await.unwrap();
        assert_eq!(h.mock.closes(), vec![SYMBOL.to_string()]);
        assert!(h.session_events().await.contains(&SessionEvent::ManualClose));
    }
}
