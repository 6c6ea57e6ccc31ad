//! 有界推送队列
//!
//! 交易所回调线程只负责 `try_send`，消费者按投递顺序依次处理。
//! 队列满时丢弃并计数，不阻塞回调。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::core::error::ExchangeError;
use crate::core::types::{Result, TradeEvent};

pub struct FeedSender<T> {
    tx: mpsc::Sender<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for FeedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            dropped: self.dropped.clone(),
        }
    }
}

impl<T> FeedSender<T> {
    /// 非阻塞投递，队列满或已关闭时返回 false
    pub fn try_send(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    log::warn!("⚠️ 推送队列已满，累计丢弃 {} 条", dropped);
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// 等待队列有空位后投递
    pub async fn send(&self, item: T) -> Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| ExchangeError::Other("推送队列已关闭".to_string()))
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct FeedReceiver<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> FeedReceiver<T> {
    /// 所有发送端释放后返回 None
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

pub fn bounded_feed<T>(capacity: usize) -> (FeedSender<T>, FeedReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        FeedSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        FeedReceiver { rx },
    )
}

pub type TradeFeedSender = FeedSender<TradeEvent>;
pub type TradeFeedReceiver = FeedReceiver<TradeEvent>;

pub fn trade_feed(capacity: usize) -> (TradeFeedSender, TradeFeedReceiver) {
    bounded_feed(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let (tx, mut rx) = bounded_feed::<u32>(2);
        assert!(tx.try_send(1));
        assert!(tx.try_send(2));
        assert!(!tx.try_send(3));
        assert_eq!(tx.dropped(), 1);

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_receiver_ends_when_senders_dropped() {
        let (tx, mut rx) = bounded_feed::<u32>(4);
        let other = tx.clone();
        tx.send(7).await.unwrap();
        drop(tx);
        drop(other);
        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(rx.recv().await, None);
    }
}
