use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::core::exchange::OrderPlacement;
use crate::core::types::{MarginType, PositionSide, Result};

/// 档位触发后要执行的市价单
#[derive(Debug, Clone, PartialEq)]
pub struct LevelOrder {
    pub level_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub leverage: u32,
    pub margin_type: MarginType,
    /// 交易所侧止损价
    pub stop_loss: Option<f64>,
}

#[async_trait]
pub trait OrderExecutor: Send + Sync {
    async fn execute(&self, order: &LevelOrder) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// 实盘执行：直接下市价单
pub struct ExchangeExecutor {
    orders: Arc<dyn OrderPlacement>,
}

impl ExchangeExecutor {
    pub fn new(orders: Arc<dyn OrderPlacement>) -> Self {
        Self { orders }
    }
}

#[async_trait]
impl OrderExecutor for ExchangeExecutor {
    async fn execute(&self, order: &LevelOrder) -> Result<()> {
        log::info!(
            "[level_defense] {} 下单 {} {} 数量 {:.6} 杠杆 {}x 止损 {:?}",
            order.level_id,
            order.symbol,
            order.side,
            order.size,
            order.leverage,
            order.stop_loss
        );
        match order.side {
            PositionSide::Long => {
                self.orders
                    .market_buy(
                        &order.symbol,
                        order.size,
                        order.leverage,
                        order.margin_type,
                        order.stop_loss,
                    )
                    .await
            }
            PositionSide::Short => {
                self.orders
                    .market_sell(
                        &order.symbol,
                        order.size,
                        order.leverage,
                        order.margin_type,
                        order.stop_loss,
                    )
                    .await
            }
        }
    }

    fn name(&self) -> &'static str {
        "exchange"
    }
}

/// 模拟执行：只记录，不触达交易所
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    executed: Mutex<Vec<LevelOrder>>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executed(&self) -> Vec<LevelOrder> {
        self.executed
            .lock()
            .map(|orders| orders.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl OrderExecutor for DryRunExecutor {
    async fn execute(&self, order: &LevelOrder) -> Result<()> {
        log::info!(
            "[level_defense][dry-run] {} {} {} 数量 {:.6}",
            order.level_id,
            order.symbol,
            order.side,
            order.size
        );
        let mut executed = self
            .executed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        executed.push(order.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "dry_run"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockExchange;

    fn order(side: PositionSide) -> LevelOrder {
        LevelOrder {
            level_id: "LV1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side,
            size: 0.5,
            leverage: 10,
            margin_type: MarginType::Isolated,
            stop_loss: Some(100.0),
        }
    }

    #[tokio::test]
    async fn test_exchange_executor_routes_by_side() {
        let mock = Arc::new(MockExchange::new());
        mock.set_price("BTCUSDT", 101.0);
        let executor = ExchangeExecutor::new(mock.clone());

        executor.execute(&order(PositionSide::Long)).await.unwrap();
        let orders = mock.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, PositionSide::Long);
        assert_eq!(orders[0].stop_loss, Some(100.0));
        assert_eq!(executor.name(), "exchange");
    }

    #[tokio::test]
    async fn test_dry_run_records_only() {
        let executor = DryRunExecutor::new();
        executor.execute(&order(PositionSide::Short)).await.unwrap();
        assert_eq!(executor.executed(), vec![order(PositionSide::Short)]);
    }
}
