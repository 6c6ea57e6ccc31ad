// 盘口微观结构分析 - 成交窗口、情绪指标、流动性聚类
pub mod engine;
pub mod feed;
pub mod indicators;
pub mod liquidity;
pub mod series;
pub mod store;

pub use engine::MarketEngine;
pub use feed::{trade_feed, TradeFeedReceiver, TradeFeedSender};
pub use indicators::{MarketStats, WindowStats};
pub use liquidity::{ClusterSide, LiquidityCluster, LiquiditySnapshot};
pub use store::SnapshotStore;
