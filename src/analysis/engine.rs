//! 盘口微观结构引擎
//!
//! 按交易对维护 60 秒成交/价格/深度窗口，按需计算市场统计、成交情绪和流动性聚类。
//! 所有缓冲共用一把读写锁；网络请求在锁外进行，回写前再次检查，避免覆盖并发写入的新数据。
//! 数据不足或请求失败时返回中性值，不向调用方抛错。

use chrono::Duration as ChronoDuration;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::feed::{TradeFeedReceiver, TradeFeedSender};
use super::indicators::{
    compute_window, depth_within_band, order_book_imbalance, trade_sentiment, IndicatorParams,
    MarketStats, STAT_WINDOWS_SECS,
};
use super::liquidity::{self, ClusterSide, LiquidityCluster, LiquiditySnapshot};
use super::series::{BookSnapshot, CachedClusters, DepthSnapshot, SymbolSeries};
use super::store::SnapshotStore;
use crate::core::clock::{Clock, SystemClock};
use crate::core::config::MarketConfig;
use crate::core::error::ExchangeError;
use crate::core::exchange::{FeedSubscription, MarketDataSource};
use crate::core::types::{BookCategory, OrderBook, Result, TradeEvent};
use crate::utils::background::BackgroundTasks;

#[derive(Default)]
struct MarketState {
    series: HashMap<String, SymbolSeries>,
    subscribed: HashSet<String>,
    feed: Option<Arc<dyn FeedSubscription>>,
}

pub struct MarketEngine {
    source: Arc<dyn MarketDataSource>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
    clock: Arc<dyn Clock>,
    config: MarketConfig,
    background: Arc<BackgroundTasks>,
    background_timeout: std::time::Duration,
    state: RwLock<MarketState>,
}

impl MarketEngine {
    pub fn new(source: Arc<dyn MarketDataSource>, config: MarketConfig) -> Self {
        Self {
            source,
            snapshot_store: None,
            clock: Arc::new(SystemClock),
            config,
            background: Arc::new(BackgroundTasks::new()),
            background_timeout: std::time::Duration::from_secs(5),
            state: RwLock::new(MarketState::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 聚类结果写入该存储作为历史快照
    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    pub fn with_background(
        mut self,
        background: Arc<BackgroundTasks>,
        timeout: std::time::Duration,
    ) -> Self {
        self.background = background;
        self.background_timeout = timeout;
        self
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    pub fn background(&self) -> &Arc<BackgroundTasks> {
        &self.background
    }

    fn window(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.config.trade_window_secs)
    }

    fn params(&self) -> IndicatorParams {
        IndicatorParams {
            cvd_scale: self.config.cvd_scale,
            gli_cap: self.config.gli_cap,
        }
    }

    // ============= 成交推送 =============

    /// 写入一笔成交并裁剪窗口
    pub async fn ingest_trade(&self, trade: TradeEvent) {
        let now = self.clock.now();
        let window = self.window();
        let mut state = self.state.write().await;
        state
            .series
            .entry(trade.symbol.clone())
            .or_default()
            .push_trade(trade, now, window);
    }

    /// 按投递顺序消费成交队列，直到所有发送端关闭。返回处理条数
    pub async fn run_ingestion(&self, mut receiver: TradeFeedReceiver) -> usize {
        let mut processed = 0usize;
        while let Some(trade) = receiver.recv().await {
            self.ingest_trade(trade).await;
            processed += 1;
        }
        log::info!("📴 成交推送队列已关闭，共处理 {} 条", processed);
        processed
    }

    /// 把交易所成交回调接到推送队列，并订阅交易对
    pub async fn attach_feed(
        &self,
        feed: Arc<dyn FeedSubscription>,
        sender: TradeFeedSender,
        symbols: &[String],
    ) -> Result<()> {
        feed.on_trade_update(Arc::new(move |trade| {
            sender.try_send(trade);
        }));
        feed.subscribe(symbols).await?;

        let mut state = self.state.write().await;
        state.subscribed.extend(symbols.iter().cloned());
        state.feed = Some(feed);
        log::info!("📡 已订阅成交推送: {:?}", symbols);
        Ok(())
    }

    pub async fn subscribed_symbols(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut symbols: Vec<String> = state.subscribed.iter().cloned().collect();
        symbols.sort();
        symbols
    }

    // ============= 外部请求 =============

    async fn fetch_book(&self, symbol: &str, category: BookCategory) -> Result<OrderBook> {
        let timeout = self.config.orderbook_timeout();
        tokio::time::timeout(timeout, self.source.get_order_book(symbol, category))
            .await
            .map_err(|_| ExchangeError::timeout(format!("get_order_book {}", category.as_str()), timeout))?
    }

    /// 缓冲为空或过期时补拉历史成交
    async fn refresh_trades_if_stale(&self, symbol: &str) {
        let window = self.window();
        let now = self.clock.now();
        let stale = {
            let state = self.state.read().await;
            state
                .series
                .get(symbol)
                .map_or(true, |s| s.trades_stale(now, window))
        };
        if !stale {
            return;
        }

        let timeout = self.config.orderbook_timeout();
        let fetched = tokio::time::timeout(
            timeout,
            self.source
                .get_recent_trades(symbol, self.config.recent_trades_limit),
        )
        .await
        .map_err(|_| ExchangeError::timeout("get_recent_trades", timeout))
        .and_then(|r| r);

        let mut trades = match fetched {
            Ok(trades) => trades,
            Err(e) => {
                log::warn!("⚠️ {} 补拉历史成交失败: {}", symbol, e);
                return;
            }
        };
        trades.sort_by_key(|t| t.timestamp);

        let now = self.clock.now();
        let mut state = self.state.write().await;
        let series = state.series.entry(symbol.to_string()).or_default();
        if !series.trades_stale(now, window) {
            return;
        }
        let cutoff = now - window;
        let latest = series.latest_trade_at();
        let mut added = 0usize;
        for trade in trades {
            if trade.timestamp < cutoff || latest.map_or(false, |l| trade.timestamp <= l) {
                continue;
            }
            series.push_trade(trade, now, window);
            added += 1;
        }
        log::debug!("{} 补拉成交 {} 条", symbol, added);
    }

    /// 深度最多每 depth_refresh_secs 刷新一次，与行情频率无关
    async fn refresh_depth_if_due(&self, symbol: &str) {
        let interval = ChronoDuration::seconds(self.config.depth_refresh_secs);
        let now = self.clock.now();
        let due = {
            let state = self.state.read().await;
            state
                .series
                .get(symbol)
                .map_or(true, |s| s.depth_due(now, interval))
        };
        if !due {
            return;
        }

        let book = match self.fetch_book(symbol, BookCategory::Linear).await {
            Ok(book) => book,
            Err(e) => {
                log::warn!("⚠️ {} 深度刷新失败: {}", symbol, e);
                return;
            }
        };
        let Some((bid, ask)) = depth_within_band(&book, self.config.depth_band_pct) else {
            log::debug!("{} 订单簿单边为空，跳过深度刷新", symbol);
            return;
        };

        let now = self.clock.now();
        let mut state = self.state.write().await;
        let series = state.series.entry(symbol.to_string()).or_default();
        if !series.depth_due(now, interval) {
            return;
        }
        series.push_depth(
            DepthSnapshot {
                bid_notional: bid,
                ask_notional: ask,
                timestamp: now,
            },
            now,
            self.window(),
        );
        series.push_book(
            BookSnapshot {
                timestamp: now,
                ..BookSnapshot::from(&book)
            },
            now,
            ChronoDuration::seconds(self.config.wall_history_secs),
        );
    }

    // ============= 对外接口 =============

    pub async fn get_market_stats(&self, symbol: &str) -> MarketStats {
        self.refresh_trades_if_stale(symbol).await;
        self.refresh_depth_if_due(symbol).await;

        let now = self.clock.now();
        let params = self.params();
        let mut state = self.state.write().await;
        let connection_status = state.feed.as_ref().map(|f| f.ws_status());
        let series = state.series.entry(symbol.to_string()).or_default();
        series.prune(now, self.window());

        let (bid_depth, ask_depth) = series.depth_average();
        let obi = order_book_imbalance(bid_depth, ask_depth);
        let windows = STAT_WINDOWS_SECS
            .iter()
            .map(|&secs| compute_window(&series.trades, &series.prices, obi, now, secs, params))
            .collect();

        MarketStats {
            symbol: symbol.to_string(),
            last_price: series.last_price().unwrap_or(0.0),
            connection_status,
            bid_depth,
            ask_depth,
            windows,
            updated_at: now,
        }
    }

    /// 窗口内成交情绪，范围 [-1, 1]；只读缓冲，无成交时为 0
    pub async fn get_trade_sentiment(&self, symbol: &str) -> f64 {
        let since = self.clock.now() - self.window();
        let state = self.state.read().await;
        state
            .series
            .get(symbol)
            .map_or(0.0, |s| trade_sentiment(s.trades.iter(), since))
    }

    pub async fn get_liquidity_clusters(&self, symbol: &str) -> Vec<LiquidityCluster> {
        let ttl = ChronoDuration::seconds(self.config.cluster_cache_secs);
        let started = self.clock.now();
        if let Some(cached) = self.cached_clusters(symbol, started, ttl).await {
            return cached;
        }

        let (linear, spot) = tokio::join!(
            self.fetch_book(symbol, BookCategory::Linear),
            self.fetch_book(symbol, BookCategory::Spot)
        );
        let linear = linear
            .map_err(|e| log::warn!("⚠️ {} 合约订单簿获取失败: {}", symbol, e))
            .ok();
        let spot = spot
            .map_err(|e| log::warn!("⚠️ {} 现货订单簿获取失败: {}", symbol, e))
            .ok();
        if linear.is_none() && spot.is_none() {
            return Vec::new();
        }

        let clusters = liquidity::compute_clusters(
            linear.as_ref(),
            spot.as_ref(),
            self.config.cluster_band_pct,
            self.config.max_clusters,
        );

        let now = self.clock.now();
        {
            let mut state = self.state.write().await;
            let series = state.series.entry(symbol.to_string()).or_default();
            if let Some(existing) = &series.clusters {
                if existing.computed_at > started && now - existing.computed_at < ttl {
                    return existing.clusters.clone();
                }
            }
            series.clusters = Some(CachedClusters {
                clusters: clusters.clone(),
                computed_at: now,
            });
            if let Some(book) = &linear {
                series.push_book(
                    BookSnapshot {
                        timestamp: now,
                        ..BookSnapshot::from(book)
                    },
                    now,
                    ChronoDuration::seconds(self.config.wall_history_secs),
                );
            }
        }

        log::debug!("{} 计算流动性聚类 {} 个", symbol, clusters.len());
        self.persist_snapshot(symbol, &clusters, now);
        clusters
    }

    async fn cached_clusters(
        &self,
        symbol: &str,
        now: chrono::DateTime<chrono::Utc>,
        ttl: ChronoDuration,
    ) -> Option<Vec<LiquidityCluster>> {
        let state = self.state.read().await;
        let cached = state.series.get(symbol)?.clusters.as_ref()?;
        (now - cached.computed_at < ttl).then(|| cached.clusters.clone())
    }

    fn persist_snapshot(
        &self,
        symbol: &str,
        clusters: &[LiquidityCluster],
        now: chrono::DateTime<chrono::Utc>,
    ) {
        let Some(store) = self.snapshot_store.clone() else {
            return;
        };
        let snapshot = LiquiditySnapshot {
            symbol: symbol.to_string(),
            clusters: clusters.to_vec(),
            captured_at: now,
        };
        self.background.spawn(
            format!("liquidity_snapshot {}", symbol),
            self.background_timeout,
            async move { store.save_liquidity_snapshot(&snapshot).await },
        );
    }

    /// 回看 lookback 内的订单簿快照，判断挂单墙是否持续存在
    pub async fn is_wall_stable(
        &self,
        symbol: &str,
        price: f64,
        side: ClusterSide,
        threshold: f64,
        lookback: ChronoDuration,
    ) -> bool {
        let cutoff = self.clock.now() - lookback;
        let state = self.state.read().await;
        let Some(series) = state.series.get(symbol) else {
            return false;
        };
        liquidity::is_wall_stable(
            series.books.iter().filter(|b| b.timestamp >= cutoff),
            price,
            side,
            threshold,
            self.config.cluster_band_pct,
            self.config.wall_stability_ratio,
        )
    }

    pub async fn last_price(&self, symbol: &str) -> Option<f64> {
        let state = self.state.read().await;
        state.series.get(symbol).and_then(|s| s.last_price())
    }
}
