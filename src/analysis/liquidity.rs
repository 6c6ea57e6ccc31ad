//! 流动性聚类与挂单墙稳定性
//!
//! 合约与现货订单簿按价格合并并升序排列，用双指针滑动窗口计算每个价格
//! ±band 内的累计挂单量（整体 O(n)），再取密度曲线的局部极大值作为聚类。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::series::BookSnapshot;
use crate::core::types::OrderBook;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterSide {
    Bid,
    Ask,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityCluster {
    pub price: f64,
    pub volume: f64,
    #[serde(rename = "type")]
    pub side: ClusterSide,
    pub source: String,
}

/// 聚类结果的历史快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquiditySnapshot {
    pub symbol: String,
    pub clusters: Vec<LiquidityCluster>,
    pub captured_at: DateTime<Utc>,
}

/// 合并后的单个价格点
#[derive(Debug, Clone, PartialEq)]
pub struct BookPoint {
    pub price: f64,
    pub bid_qty: f64,
    pub ask_qty: f64,
    pub in_linear: bool,
    pub in_spot: bool,
}

impl BookPoint {
    pub fn volume(&self) -> f64 {
        self.bid_qty + self.ask_qty
    }

    fn side(&self) -> ClusterSide {
        if self.bid_qty >= self.ask_qty {
            ClusterSide::Bid
        } else {
            ClusterSide::Ask
        }
    }

    fn source(&self) -> &'static str {
        match (self.in_linear, self.in_spot) {
            (true, true) => "merged",
            (false, true) => "spot",
            _ => "linear",
        }
    }
}

/// 合并两个订单簿，相同价格的挂单量相加，结果按价格升序
pub fn merge_books(linear: Option<&OrderBook>, spot: Option<&OrderBook>) -> Vec<BookPoint> {
    let mut raw: Vec<BookPoint> = Vec::new();
    for (book, is_linear) in [(linear, true), (spot, false)] {
        let Some(book) = book else { continue };
        let point = |price: f64, bid_qty: f64, ask_qty: f64| BookPoint {
            price,
            bid_qty,
            ask_qty,
            in_linear: is_linear,
            in_spot: !is_linear,
        };
        raw.extend(
            book.bids
                .iter()
                .filter(|l| l[0] > 0.0 && l[1] > 0.0)
                .map(|l| point(l[0], l[1], 0.0)),
        );
        raw.extend(
            book.asks
                .iter()
                .filter(|l| l[0] > 0.0 && l[1] > 0.0)
                .map(|l| point(l[0], 0.0, l[1])),
        );
    }

    raw.sort_by(|a, b| a.price.total_cmp(&b.price));

    let mut merged: Vec<BookPoint> = Vec::with_capacity(raw.len());
    for point in raw {
        match merged.last_mut() {
            Some(last) if last.price == point.price => {
                last.bid_qty += point.bid_qty;
                last.ask_qty += point.ask_qty;
                last.in_linear |= point.in_linear;
                last.in_spot |= point.in_spot;
            }
            _ => merged.push(point),
        }
    }
    merged
}

/// 每个价格点 ±band_pct 内的累计挂单量。输入必须已按价格升序
pub fn density_profile(points: &[BookPoint], band_pct: f64) -> Vec<f64> {
    let n = points.len();
    let mut density = Vec::with_capacity(n);
    let (mut lo, mut hi) = (0usize, 0usize);
    let mut sum = 0.0;

    for point in points {
        let lower = point.price * (1.0 - band_pct);
        let upper = point.price * (1.0 + band_pct);

        while hi < n && points[hi].price <= upper {
            sum += points[hi].volume();
            hi += 1;
        }
        while lo < hi && points[lo].price < lower {
            sum -= points[lo].volume();
            lo += 1;
        }
        density.push(sum.max(0.0));
    }
    density
}

/// 取密度局部极大值（不小于相邻两点），按量降序，最多 max 个
pub fn extract_clusters(points: &[BookPoint], density: &[f64], max: usize) -> Vec<LiquidityCluster> {
    let n = points.len().min(density.len());
    let mut clusters: Vec<LiquidityCluster> = (0..n)
        .filter(|&i| {
            let left_ok = i == 0 || density[i] >= density[i - 1];
            let right_ok = i + 1 >= n || density[i] >= density[i + 1];
            left_ok && right_ok && density[i] > 0.0
        })
        .map(|i| LiquidityCluster {
            price: points[i].price,
            volume: density[i],
            side: points[i].side(),
            source: points[i].source().to_string(),
        })
        .collect();

    clusters.sort_by(|a, b| b.volume.partial_cmp(&a.volume).unwrap_or(Ordering::Equal));
    clusters.truncate(max);
    clusters
}

pub fn compute_clusters(
    linear: Option<&OrderBook>,
    spot: Option<&OrderBook>,
    band_pct: f64,
    max: usize,
) -> Vec<LiquidityCluster> {
    let points = merge_books(linear, spot);
    let density = density_profile(&points, band_pct);
    extract_clusters(&points, &density, max)
}

/// 某一侧在目标价格 ±band 内的挂单量
pub fn wall_volume(snapshot: &BookSnapshot, price: f64, side: ClusterSide, band_pct: f64) -> f64 {
    let lower = price * (1.0 - band_pct);
    let upper = price * (1.0 + band_pct);
    let levels = match side {
        ClusterSide::Bid => &snapshot.bids,
        ClusterSide::Ask => &snapshot.asks,
    };
    levels
        .iter()
        .filter(|l| l[0] >= lower && l[0] <= upper)
        .map(|l| l[1])
        .sum()
}

/// 在给定快照中，挂单量达到阈值的快照占比是否不低于 ratio
pub fn is_wall_stable<'a>(
    snapshots: impl IntoIterator<Item = &'a BookSnapshot>,
    price: f64,
    side: ClusterSide,
    threshold: f64,
    band_pct: f64,
    ratio: f64,
) -> bool {
    let (mut total, mut hits) = (0usize, 0usize);
    for snapshot in snapshots {
        total += 1;
        if wall_volume(snapshot, price, side, band_pct) >= threshold {
            hits += 1;
        }
    }
    total > 0 && hits as f64 / total as f64 >= ratio
}
