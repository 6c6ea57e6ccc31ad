pub mod analysis;
pub mod core;
pub mod strategies;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// 选择性导出，避免命名冲突
pub use crate::analysis::{MarketEngine, MarketStats};
pub use crate::core::clock::{Clock, ManualClock, SystemClock};
pub use crate::core::{config::*, error::*, exchange::*, types::*};
pub use crate::strategies::*;
pub use crate::utils::*;
