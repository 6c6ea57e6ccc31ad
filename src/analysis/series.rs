//! 单个交易对的滑动窗口缓冲

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

use super::liquidity::LiquidityCluster;
use crate::core::types::{OrderBook, TradeEvent};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricePoint {
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// 中间价附近的买卖深度（名义金额）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthSnapshot {
    pub bid_notional: f64,
    pub ask_notional: f64,
    pub timestamp: DateTime<Utc>,
}

/// 订单簿快照，用于判断挂单墙是否持续存在
#[derive(Debug, Clone)]
pub struct BookSnapshot {
    pub bids: Vec<[f64; 2]>,
    pub asks: Vec<[f64; 2]>,
    pub timestamp: DateTime<Utc>,
}

impl From<&OrderBook> for BookSnapshot {
    fn from(book: &OrderBook) -> Self {
        Self {
            bids: book.bids.clone(),
            asks: book.asks.clone(),
            timestamp: book.timestamp,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CachedClusters {
    pub clusters: Vec<LiquidityCluster>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SymbolSeries {
    pub trades: VecDeque<TradeEvent>,
    pub prices: VecDeque<PricePoint>,
    pub depth: VecDeque<DepthSnapshot>,
    pub books: VecDeque<BookSnapshot>,
    pub last_depth_refresh: Option<DateTime<Utc>>,
    pub clusters: Option<CachedClusters>,
}

impl SymbolSeries {
    /// 写入一笔成交，同时记录价格点，并裁掉窗口外的数据
    pub fn push_trade(&mut self, trade: TradeEvent, now: DateTime<Utc>, window: Duration) {
        self.prices.push_back(PricePoint {
            price: trade.price,
            timestamp: trade.timestamp,
        });
        self.trades.push_back(trade);
        self.prune(now, window);
    }

    pub fn push_depth(&mut self, snapshot: DepthSnapshot, now: DateTime<Utc>, window: Duration) {
        self.depth.push_back(snapshot);
        self.last_depth_refresh = Some(now);
        self.prune(now, window);
    }

    pub fn push_book(&mut self, snapshot: BookSnapshot, now: DateTime<Utc>, retention: Duration) {
        self.books.push_back(snapshot);
        let cutoff = now - retention;
        while self.books.front().map_or(false, |b| b.timestamp < cutoff) {
            self.books.pop_front();
        }
    }

    pub fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        let cutoff = now - window;
        while self.trades.front().map_or(false, |t| t.timestamp < cutoff) {
            self.trades.pop_front();
        }
        while self.prices.front().map_or(false, |p| p.timestamp < cutoff) {
            self.prices.pop_front();
        }
        while self.depth.front().map_or(false, |d| d.timestamp < cutoff) {
            self.depth.pop_front();
        }
    }

    pub fn latest_trade_at(&self) -> Option<DateTime<Utc>> {
        self.trades.back().map(|t| t.timestamp)
    }

    /// 缓冲为空或窗口内没有新成交
    pub fn trades_stale(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.latest_trade_at()
            .map_or(true, |latest| latest < now - window)
    }

    pub fn depth_due(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        self.last_depth_refresh
            .map_or(true, |last| now - last >= interval)
    }

    /// 窗口内深度的移动平均
    pub fn depth_average(&self) -> (f64, f64) {
        if self.depth.is_empty() {
            return (0.0, 0.0);
        }
        let n = self.depth.len() as f64;
        let (bid, ask) = self
            .depth
            .iter()
            .fold((0.0, 0.0), |(b, a), d| (b + d.bid_notional, a + d.ask_notional));
        (bid / n, ask / n)
    }

    pub fn last_price(&self) -> Option<f64> {
        self.prices.back().map(|p| p.price)
    }
}
