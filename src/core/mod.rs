// 核心模块 - 交易所能力、通用类型、配置与时钟
pub mod clock;
pub mod config;
pub mod error;
pub mod exchange;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AppConfig, DefenseConfig, MarketConfig};
pub use error::*;
pub use exchange::*;
pub use types::{
    BookCategory, Kline, MarginType, OrderBook, Position, PositionSide, Ticker, TradeEvent,
    WsStatus,
};
