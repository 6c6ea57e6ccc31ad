//! 盘口与成交流指标计算（纯函数）
//!
//! OBI = (bid - ask) / (bid + ask)
//! CVD = 买入速度 - 卖出速度
//! TSI = 成交笔数 / 60，各子窗口同一分母
//! GLI = 卖出成交额 / 买入成交额，无买量时取上限

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::series::PricePoint;
use crate::core::types::{OrderBook, TradeEvent, WsStatus};

/// 统计子窗口(秒)
pub const STAT_WINDOWS_SECS: [i64; 3] = [60, 30, 10];

/// TSI 分母(秒)
const TSI_BASE_SECS: f64 = 60.0;

/// 单个时间窗口的指标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub window_secs: i64,
    pub trade_count: usize,
    pub buy_speed: f64,
    pub sell_speed: f64,
    pub price_change_pct: f64,
    pub obi: f64,
    pub cvd: f64,
    pub tsi: f64,
    pub gli: f64,
    pub velocity: f64,
    pub conclusion_score: f64,
}

/// 对外输出的市场统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketStats {
    pub symbol: String,
    pub last_price: f64,
    pub connection_status: Option<WsStatus>,
    pub bid_depth: f64,
    pub ask_depth: f64,
    pub windows: Vec<WindowStats>,
    pub updated_at: DateTime<Utc>,
}

impl MarketStats {
    pub fn window(&self, secs: i64) -> Option<&WindowStats> {
        self.windows.iter().find(|w| w.window_secs == secs)
    }

    /// 60 秒窗口的结论分，缺失时为 0
    pub fn conclusion_score(&self) -> f64 {
        self.window(60).map_or(0.0, |w| w.conclusion_score)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// 计算指标所需的参数
#[derive(Debug, Clone, Copy)]
pub struct IndicatorParams {
    pub cvd_scale: f64,
    pub gli_cap: f64,
}

/// 中间价 ±band 范围内的买卖名义深度
pub fn depth_within_band(book: &OrderBook, band_pct: f64) -> Option<(f64, f64)> {
    let mid = book.mid_price()?;
    let lower = mid * (1.0 - band_pct);
    let upper = mid * (1.0 + band_pct);

    let bid = book
        .bids
        .iter()
        .filter(|l| l[0] >= lower)
        .map(|l| l[0] * l[1])
        .sum();
    let ask = book
        .asks
        .iter()
        .filter(|l| l[0] <= upper)
        .map(|l| l[0] * l[1])
        .sum();
    Some((bid, ask))
}

pub fn order_book_imbalance(bid: f64, ask: f64) -> f64 {
    let total = bid + ask;
    if total <= 0.0 {
        0.0
    } else {
        (bid - ask) / total
    }
}

pub fn gli(buy_volume: f64, sell_volume: f64, cap: f64) -> f64 {
    if buy_volume <= 0.0 {
        if sell_volume > 0.0 {
            cap
        } else {
            1.0
        }
    } else {
        sell_volume / buy_volume
    }
}

/// GLI 大于 1 表示卖压，映射到 [-1, 1]
pub fn gli_score(gli: f64) -> f64 {
    if gli > 1.0 {
        (-(gli - 1.0)).max(-1.0)
    } else {
        1.0 - gli
    }
}

pub fn cvd_score(cvd: f64, scale: f64) -> f64 {
    (cvd / scale).clamp(-1.0, 1.0)
}

pub fn conclusion_score(obi: f64, gli: f64, cvd: f64, scale: f64) -> f64 {
    (obi + gli_score(gli) + cvd_score(cvd, scale)) / 3.0
}

/// 窗口内买卖成交额差值占比，范围 [-1, 1]，无成交为 0
pub fn trade_sentiment<'a>(
    trades: impl IntoIterator<Item = &'a TradeEvent>,
    since: DateTime<Utc>,
) -> f64 {
    let (buy, sell) = buy_sell_notional(trades, since).0;
    let total = buy + sell;
    if total <= 0.0 {
        return 0.0;
    }
    ((buy - sell) / total).clamp(-1.0, 1.0)
}

fn buy_sell_notional<'a>(
    trades: impl IntoIterator<Item = &'a TradeEvent>,
    since: DateTime<Utc>,
) -> ((f64, f64), usize) {
    let mut buy = 0.0;
    let mut sell = 0.0;
    let mut count = 0usize;
    for trade in trades.into_iter().filter(|t| t.timestamp >= since) {
        if trade.is_buy() {
            buy += trade.notional();
        } else {
            sell += trade.notional();
        }
        count += 1;
    }
    ((buy, sell), count)
}

fn price_change_pct(prices: &VecDeque<PricePoint>, since: DateTime<Utc>) -> f64 {
    let mut in_window = prices.iter().filter(|p| p.timestamp >= since);
    let Some(first) = in_window.next() else {
        return 0.0;
    };
    let last = in_window.last().unwrap_or(first);
    if first.price <= 0.0 {
        return 0.0;
    }
    (last.price - first.price) / first.price * 100.0
}

pub fn compute_window(
    trades: &VecDeque<TradeEvent>,
    prices: &VecDeque<PricePoint>,
    obi: f64,
    now: DateTime<Utc>,
    window_secs: i64,
    params: IndicatorParams,
) -> WindowStats {
    let since = now - Duration::seconds(window_secs);
    let secs = window_secs.max(1) as f64;
    let ((buy, sell), trade_count) = buy_sell_notional(trades.iter(), since);

    let buy_speed = buy / secs;
    let sell_speed = sell / secs;
    let cvd = buy_speed - sell_speed;
    let gli = gli(buy, sell, params.gli_cap);

    WindowStats {
        window_secs,
        trade_count,
        buy_speed,
        sell_speed,
        price_change_pct: price_change_pct(prices, since),
        obi,
        cvd,
        tsi: trade_count as f64 / TSI_BASE_SECS,
        gli,
        velocity: (buy + sell) / secs,
        conclusion_score: conclusion_score(obi, gli, cvd, params.cvd_scale),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARAMS: IndicatorParams = IndicatorParams {
        cvd_scale: 10_000.0,
        gli_cap: 10.0,
    };

    fn trade(side: &str, price: f64, size: f64, ts: DateTime<Utc>) -> TradeEvent {
        TradeEvent {
            symbol: "BTCUSDT".to_string(),
            side: side.to_string(),
            price,
            size,
            timestamp: ts,
        }
    }

    #[test]
    fn test_gli_edges() {
        assert_eq!(gli(0.0, 5.0, 10.0), 10.0);
        assert_eq!(gli(0.0, 0.0, 10.0), 1.0);
        assert_eq!(gli(2.0, 1.0, 10.0), 0.5);
        assert_eq!(gli_score(10.0), -1.0);
        assert_eq!(gli_score(1.5), -0.5);
        assert_eq!(gli_score(0.25), 0.75);
    }

    #[test]
    fn test_obi_and_cvd_score() {
        assert_eq!(order_book_imbalance(0.0, 0.0), 0.0);
        assert_eq!(order_book_imbalance(30.0, 10.0), 0.5);
        assert_eq!(cvd_score(50_000.0, 10_000.0), 1.0);
        assert_eq!(cvd_score(-2_500.0, 10_000.0), -0.25);
    }

    #[test]
    fn test_sentiment_bounds() {
        let now = Utc::now();
        let since = now - Duration::seconds(60);
        assert_eq!(trade_sentiment(std::iter::empty(), since), 0.0);

        let trades = vec![
            trade("Buy", 100.0, 3.0, now),
            trade("Sell", 100.0, 1.0, now),
            trade("Sell", 100.0, 50.0, now - Duration::seconds(120)),
        ];
        let s = trade_sentiment(trades.iter(), since);
        assert!((s - 0.5).abs() < 1e-12);

        let sells = vec![trade("Sell", 100.0, 1.0, now)];
        assert_eq!(trade_sentiment(sells.iter(), since), -1.0);
    }

    #[test]
    fn test_depth_within_band() {
        let book = OrderBook {
            symbol: "BTCUSDT".to_string(),
            bids: vec![[99.9, 1.0], [99.0, 5.0]],
            asks: vec![[100.1, 2.0], [101.0, 5.0]],
            timestamp: Utc::now(),
        };
        let (bid, ask) = depth_within_band(&book, 0.005).unwrap();
        assert!((bid - 99.9).abs() < 1e-9);
        assert!((ask - 200.2).abs() < 1e-9);
    }

    #[test]
    fn test_compute_window() {
        let now = Utc::now();
        let mut trades = VecDeque::new();
        let mut prices = VecDeque::new();
        for (i, (side, price)) in [("Buy", 100.0), ("Buy", 101.0), ("Sell", 102.0)]
            .iter()
            .enumerate()
        {
            let ts = now - Duration::seconds(20 - i as i64 * 5);
            trades.push_back(trade(side, *price, 10.0, ts));
            prices.push_back(PricePoint {
                price: *price,
                timestamp: ts,
            });
        }

        let w60 = compute_window(&trades, &prices, 0.2, now, 60, PARAMS);
        assert_eq!(w60.trade_count, 3);
        assert!((w60.buy_speed - 2010.0 / 60.0).abs() < 1e-9);
        assert!((w60.sell_speed - 1020.0 / 60.0).abs() < 1e-9);
        assert!((w60.price_change_pct - 2.0).abs() < 1e-9);
        assert!((w60.tsi - 0.05).abs() < 1e-12);
        assert!(w60.conclusion_score > 0.0 && w60.conclusion_score <= 1.0);

        // 10 秒窗口只包含最后一笔卖单
        let w10 = compute_window(&trades, &prices, 0.0, now, 10, PARAMS);
        assert_eq!(w10.trade_count, 1);
        assert_eq!(w10.gli, 10.0);
        assert_eq!(w10.price_change_pct, 0.0);
        assert!(w10.conclusion_score < 0.0);
        assert!((w10.tsi - 1.0 / 60.0).abs() < 1e-12);
    }

    #[test]
    fn test_stats_json_contract() {
        let stats = MarketStats {
            symbol: "BTCUSDT".to_string(),
            last_price: 100.0,
            connection_status: Some(WsStatus::Connected),
            bid_depth: 1.0,
            ask_depth: 2.0,
            windows: vec![],
            updated_at: Utc::now(),
        };
        let json = stats.to_json().unwrap();
        assert!(json.contains("\"connection_status\":\"connected\""));
        assert_eq!(stats.conclusion_score(), 0.0);
    }
}
