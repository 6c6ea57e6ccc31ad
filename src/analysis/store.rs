use async_trait::async_trait;

use super::liquidity::LiquiditySnapshot;
use crate::core::types::Result;

/// 流动性快照存储，聚类结果在后台写入
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save_liquidity_snapshot(&self, snapshot: &LiquiditySnapshot) -> Result<()>;

    /// 最新的在前
    async fn list_liquidity_snapshots(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<LiquiditySnapshot>>;
}
