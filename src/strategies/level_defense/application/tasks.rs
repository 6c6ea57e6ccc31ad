//! 运行时：缓存刷新、安全检查、成交推送消费、价格 tick 消费
//!
//! 所有循环监听同一个 shutdown watch 通道；`stop()` 先通知退出，超时未退出的任务直接 abort。

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::orchestrator::TickOrchestrator;
use crate::analysis::feed::{bounded_feed, trade_feed, FeedReceiver, FeedSender};
use crate::analysis::{MarketEngine, SnapshotStore};
use crate::core::clock::Clock;
use crate::core::config::AppConfig;
use crate::core::error::ExchangeError;
use crate::core::exchange::{Exchange, FeedSubscription};
use crate::strategies::level_defense::domain::repository::{LevelRepository, TradeRepository};
use crate::core::types::Result;
use crate::strategies::level_defense::domain::tier_engine::TierEngine;
use crate::strategies::level_defense::infrastructure::executor::{
    DryRunExecutor, ExchangeExecutor, OrderExecutor,
};
use crate::utils::background::BackgroundTasks;

const STOP_GRACE: Duration = Duration::from_secs(1);

/// 交易所推送的一次价格更新
#[derive(Debug, Clone, PartialEq)]
pub struct PriceTick {
    pub exchange: String,
    pub symbol: String,
    pub price: f64,
}

pub type PriceTickSender = FeedSender<PriceTick>;

pub struct LevelDefenseRuntime {
    orchestrator: Arc<TickOrchestrator>,
    market: Arc<MarketEngine>,
    feed: Arc<dyn FeedSubscription>,
    config: AppConfig,
    tick_tx: PriceTickSender,
    tick_rx: Mutex<Option<FeedReceiver<PriceTick>>>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl LevelDefenseRuntime {
    /// `level_repo` 同时承担流动性快照的存储
    pub fn new<E, L>(
        exchange: Arc<E>,
        level_repo: Arc<L>,
        trade_repo: Arc<dyn TradeRepository>,
        config: AppConfig,
        clock: Arc<dyn Clock>,
    ) -> Self
    where
        E: Exchange + 'static,
        L: LevelRepository + SnapshotStore + 'static,
    {
        let background = Arc::new(BackgroundTasks::new());
        let market = Arc::new(
            MarketEngine::new(exchange.clone(), config.market.clone())
                .with_clock(clock.clone())
                .with_snapshot_store(level_repo.clone())
                .with_background(background.clone(), config.defense.background_timeout()),
        );

        let executor: Arc<dyn OrderExecutor> = if config.defense.dry_run {
            log::info!("[level_defense] 模拟模式：只记录不下单");
            Arc::new(DryRunExecutor::new())
        } else {
            Arc::new(ExchangeExecutor::new(exchange.clone()))
        };

        let orchestrator = Arc::new(TickOrchestrator::new(
            exchange.clone(),
            executor,
            level_repo,
            trade_repo,
            market.clone(),
            Arc::new(TierEngine::with_clock(clock)),
            config.defense.clone(),
            background,
        ));

        let (tick_tx, tick_rx) = bounded_feed(config.defense.feed_capacity);
        let (shutdown, _) = watch::channel(false);

        Self {
            orchestrator,
            market,
            feed: exchange,
            config,
            tick_tx,
            tick_rx: Mutex::new(Some(tick_rx)),
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn orchestrator(&self) -> &Arc<TickOrchestrator> {
        &self.orchestrator
    }

    pub fn market(&self) -> &Arc<MarketEngine> {
        &self.market
    }

    /// 交易所价格回调通过它投递 tick
    pub fn tick_sender(&self) -> PriceTickSender {
        self.tick_tx.clone()
    }

    pub fn is_running(&self) -> bool {
        let handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        handles.iter().any(|h| !h.is_finished())
    }

    pub async fn start(&self, symbols: &[String]) -> Result<()> {
        let tick_rx = self
            .tick_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| ExchangeError::Other("运行时已启动".to_string()))?;

        self.orchestrator.update_cache().await?;

        let (trade_tx, trade_rx) = trade_feed(self.config.defense.feed_capacity);
        self.market
            .attach_feed(self.feed.clone(), trade_tx, symbols)
            .await?;

        let defense = &self.config.defense;
        let mut handles = Vec::with_capacity(4);

        let orchestrator = self.orchestrator.clone();
        handles.push(spawn_periodic(
            "cache_reload",
            Duration::from_secs(defense.reload_interval_secs),
            self.shutdown.subscribe(),
            move || {
                let orchestrator = orchestrator.clone();
                async move { orchestrator.update_cache().await }
            },
        ));

        let orchestrator = self.orchestrator.clone();
        handles.push(spawn_periodic(
            "safety_check",
            Duration::from_secs(defense.safety_interval_secs),
            self.shutdown.subscribe(),
            move || {
                let orchestrator = orchestrator.clone();
                async move { orchestrator.check_safety().await }
            },
        ));

        let market = self.market.clone();
        let mut shutdown = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = market.run_ingestion(trade_rx) => {}
                _ = wait_shutdown(&mut shutdown) => {}
            }
            log::info!("[level_defense] 成交推送任务退出");
        }));

        handles.push(spawn_tick_router(
            self.orchestrator.clone(),
            tick_rx,
            self.shutdown.subscribe(),
            defense.feed_capacity,
        ));

        self.handles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(handles);
        log::info!("[level_defense] 🚀 运行时已启动, 交易对 {:?}", symbols);
        Ok(())
    }

    /// 通知所有循环退出并等待后台写入完成
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *guard)
        };
        for mut handle in handles {
            if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        self.orchestrator.background().wait_idle().await;
        log::info!("[level_defense] 🛑 运行时已停止");
    }
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn spawn_periodic<F, Fut>(
    label: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    task: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = task().await {
                        log::warn!("[level_defense] {} 执行失败: {}", label, e);
                    }
                }
                _ = wait_shutdown(&mut shutdown) => break,
            }
        }
        log::info!("[level_defense] {} 任务退出", label);
    })
}

/// 按交易对分发价格 tick：同一交易对按投递顺序串行处理，不同交易对互不等待
fn spawn_tick_router(
    orchestrator: Arc<TickOrchestrator>,
    mut ticks: FeedReceiver<PriceTick>,
    shutdown: watch::Receiver<bool>,
    capacity: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut workers: HashMap<String, PriceTickSender> = HashMap::new();
        let mut handles = Vec::new();
        let mut stop = shutdown.clone();
        loop {
            tokio::select! {
                tick = ticks.recv() => {
                    let Some(tick) = tick else { break };
                    let sender = workers.entry(tick.symbol.clone()).or_insert_with(|| {
                        let (tx, rx) = bounded_feed(capacity);
                        handles.push(spawn_symbol_worker(
                            orchestrator.clone(),
                            tick.symbol.clone(),
                            rx,
                            shutdown.clone(),
                        ));
                        tx
                    });
                    sender.try_send(tick);
                }
                _ = wait_shutdown(&mut stop) => break,
            }
        }
        drop(workers);
        join_all(handles).await;
        log::info!("[level_defense] tick 分发任务退出");
    })
}

fn spawn_symbol_worker(
    orchestrator: Arc<TickOrchestrator>,
    symbol: String,
    mut ticks: FeedReceiver<PriceTick>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        log::debug!("[level_defense] {} tick 处理任务启动", symbol);
        loop {
            tokio::select! {
                tick = ticks.recv() => {
                    let Some(tick) = tick else { break };
                    if let Err(e) = orchestrator
                        .process_tick(&tick.exchange, &tick.symbol, tick.price)
                        .await
                    {
                        log::debug!("[level_defense] {} tick 处理中止: {}", tick.symbol, e);
                    }
                }
                _ = wait_shutdown(&mut shutdown) => break,
            }
        }
        log::debug!("[level_defense] {} tick 处理任务退出", symbol);
    })
}
