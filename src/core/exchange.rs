use crate::core::types::{
    BookCategory, Kline, MarginType, OrderBook, Position, Result, Ticker, TradeEvent, WsStatus,
};
use async_trait::async_trait;
use std::sync::Arc;

/// 逐笔成交回调
pub type TradeCallback = Arc<dyn Fn(TradeEvent) + Send + Sync>;

/// 行情查询能力
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// 获取最新成交价
    async fn get_current_price(&self, symbol: &str) -> Result<f64>;

    /// 获取所有行情信息
    async fn get_tickers(&self) -> Result<Vec<Ticker>>;

    /// 获取K线数据
    async fn get_candles(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>>;
}

/// 下单能力
#[async_trait]
pub trait OrderPlacement: Send + Sync {
    /// 市价买入，stop_loss 为交易所侧止损价
    async fn market_buy(
        &self,
        symbol: &str,
        size: f64,
        leverage: u32,
        margin_type: MarginType,
        stop_loss: Option<f64>,
    ) -> Result<()>;

    /// 市价卖出
    async fn market_sell(
        &self,
        symbol: &str,
        size: f64,
        leverage: u32,
        margin_type: MarginType,
        stop_loss: Option<f64>,
    ) -> Result<()>;

    /// 市价平掉该交易对的全部仓位
    async fn close_position(&self, symbol: &str) -> Result<()>;
}

/// 持仓查询能力
#[async_trait]
pub trait PositionQuery: Send + Sync {
    /// 获取单个交易对持仓，无仓位时返回 None
    async fn get_position(&self, symbol: &str) -> Result<Option<Position>>;

    /// 获取全部持仓
    async fn get_positions(&self) -> Result<Vec<Position>>;
}

/// 市场深度/成交数据能力
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// 获取订单簿
    async fn get_order_book(&self, symbol: &str, category: BookCategory) -> Result<OrderBook>;

    /// 获取最近成交
    async fn get_recent_trades(&self, symbol: &str, limit: u32) -> Result<Vec<TradeEvent>>;
}

/// 实时推送订阅能力
#[async_trait]
pub trait FeedSubscription: Send + Sync {
    /// 订阅交易对的成交推送
    async fn subscribe(&self, symbols: &[String]) -> Result<()>;

    /// 注册成交回调
    fn on_trade_update(&self, callback: TradeCallback);

    /// WebSocket 连接状态
    fn ws_status(&self) -> WsStatus;
}

/// 交易所通用接口：各能力的并集
pub trait Exchange:
    PriceSource + OrderPlacement + PositionQuery + MarketDataSource + FeedSubscription
{
}

impl<T> Exchange for T where
    T: PriceSource + OrderPlacement + PositionQuery + MarketDataSource + FeedSubscription
{
}
