//! 测试用交易所：实现全部能力接口，记录调用并按脚本返回

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::core::error::ExchangeError;
use crate::core::exchange::{
    FeedSubscription, MarketDataSource, OrderPlacement, PositionQuery, PriceSource, TradeCallback,
};
use crate::core::types::{
    BookCategory, Kline, MarginType, OrderBook, Position, PositionSide, Result, Ticker, TradeEvent,
    WsStatus,
};

#[derive(Debug, Clone, PartialEq)]
pub struct MockOrder {
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub price: f64,
    pub stop_loss: Option<f64>,
}

#[derive(Default)]
pub struct MockState {
    pub prices: HashMap<String, f64>,
    pub positions: HashMap<String, Position>,
    pub books: HashMap<(String, BookCategory), OrderBook>,
    pub recent_trades: Vec<TradeEvent>,
    pub orders: Vec<MockOrder>,
    pub closes: Vec<String>,
    pub subscribed: Vec<String>,
    pub book_requests: usize,
    pub trade_requests: usize,
    pub position_requests: usize,
    pub fail_close: bool,
    pub fail_position: bool,
    pub fail_orders: bool,
    pub book_delay: Option<Duration>,
    pub position_delays: HashMap<String, Duration>,
}

pub struct MockExchange {
    state: Mutex<MockState>,
    callbacks: Mutex<Vec<TradeCallback>>,
    status: Mutex<WsStatus>,
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            callbacks: Mutex::new(Vec::new()),
            status: Mutex::new(WsStatus::Connected),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.state().prices.insert(symbol.to_string(), price);
    }

    pub fn set_position(&self, position: Position) {
        self.state()
            .positions
            .insert(position.symbol.clone(), position);
    }

    pub fn set_book(&self, category: BookCategory, book: OrderBook) {
        self.state()
            .books
            .insert((book.symbol.clone(), category), book);
    }

    pub fn set_status(&self, status: WsStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn orders(&self) -> Vec<MockOrder> {
        self.state().orders.clone()
    }

    pub fn closes(&self) -> Vec<String> {
        self.state().closes.clone()
    }

    /// 模拟交易所推送一笔成交
    pub fn emit_trade(&self, trade: TradeEvent) {
        let callbacks = self.callbacks.lock().unwrap().clone();
        for callback in callbacks {
            callback(trade.clone());
        }
    }

    fn fill(&self, symbol: &str, side: PositionSide, size: f64, stop_loss: Option<f64>) -> Result<()> {
        let mut state = self.state();
        if state.fail_orders {
            return Err(ExchangeError::OrderError("rejected".to_string()));
        }
        let price = state.prices.get(symbol).copied().unwrap_or(0.0);
        state.orders.push(MockOrder {
            symbol: symbol.to_string(),
            side,
            size,
            price,
            stop_loss,
        });

        let position = state
            .positions
            .entry(symbol.to_string())
            .or_insert_with(|| Position {
                symbol: symbol.to_string(),
                side,
                size: 0.0,
                entry_price: price,
                current_price: price,
                unrealized_pnl: 0.0,
                leverage: 10,
                margin_type: MarginType::Isolated,
            });
        let total = position.size + size;
        position.entry_price = (position.entry_price * position.size + price * size) / total;
        position.size = total;
        position.current_price = price;
        Ok(())
    }
}

#[async_trait]
impl PriceSource for MockExchange {
    async fn get_current_price(&self, symbol: &str) -> Result<f64> {
        self.state()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Other(format!("no price for {}", symbol)))
    }

    async fn get_tickers(&self) -> Result<Vec<Ticker>> {
        Ok(Vec::new())
    }

    async fn get_candles(&self, _symbol: &str, _interval: &str, _limit: u32) -> Result<Vec<Kline>> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl OrderPlacement for MockExchange {
    async fn market_buy(
        &self,
        symbol: &str,
        size: f64,
        _leverage: u32,
        _margin_type: MarginType,
        stop_loss: Option<f64>,
    ) -> Result<()> {
        self.fill(symbol, PositionSide::Long, size, stop_loss)
    }

    async fn market_sell(
        &self,
        symbol: &str,
        size: f64,
        _leverage: u32,
        _margin_type: MarginType,
        stop_loss: Option<f64>,
    ) -> Result<()> {
        self.fill(symbol, PositionSide::Short, size, stop_loss)
    }

    async fn close_position(&self, symbol: &str) -> Result<()> {
        let mut state = self.state();
        state.closes.push(symbol.to_string());
        if state.fail_close || state.positions.remove(symbol).is_none() {
            return Err(ExchangeError::PositionNotFound {
                symbol: symbol.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PositionQuery for MockExchange {
    async fn get_position(&self, symbol: &str) -> Result<Option<Position>> {
        let delay = {
            let mut state = self.state();
            state.position_requests += 1;
            state.position_delays.get(symbol).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state();
        if state.fail_position {
            return Err(ExchangeError::NetworkError("position query failed".to_string()));
        }
        Ok(state.positions.get(symbol).cloned())
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        Ok(self.state().positions.values().cloned().collect())
    }
}

#[async_trait]
impl MarketDataSource for MockExchange {
    async fn get_order_book(&self, symbol: &str, category: BookCategory) -> Result<OrderBook> {
        let (book, delay) = {
            let mut state = self.state();
            state.book_requests += 1;
            (
                state.books.get(&(symbol.to_string(), category)).cloned(),
                state.book_delay,
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(book.unwrap_or_else(|| OrderBook {
            symbol: symbol.to_string(),
            bids: Vec::new(),
            asks: Vec::new(),
            timestamp: Utc::now(),
        }))
    }

    async fn get_recent_trades(&self, symbol: &str, _limit: u32) -> Result<Vec<TradeEvent>> {
        let mut state = self.state();
        state.trade_requests += 1;
        Ok(state
            .recent_trades
            .iter()
            .filter(|t| t.symbol == symbol)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl FeedSubscription for MockExchange {
    async fn subscribe(&self, symbols: &[String]) -> Result<()> {
        self.state().subscribed.extend(symbols.iter().cloned());
        Ok(())
    }

    fn on_trade_update(&self, callback: TradeCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    fn ws_status(&self) -> WsStatus {
        *self.status.lock().unwrap()
    }
}

pub fn trade(symbol: &str, side: &str, price: f64, size: f64, ts: chrono::DateTime<Utc>) -> TradeEvent {
    TradeEvent {
        symbol: symbol.to_string(),
        side: side.to_string(),
        price,
        size,
        timestamp: ts,
    }
}
