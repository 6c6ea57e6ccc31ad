//! 后台任务
//!
//! 审计写入、会话日志、流动性快照、自动拆分等尽力而为的工作在这里派发，
//! 每个任务带独立超时，不占用行情处理路径。`wait_idle` 供测试确定性等待。

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinHandle;

use crate::core::types::Result;

#[derive(Debug, Default)]
pub struct BackgroundTasks {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 派发一个后台任务；失败或超时只记录日志
    pub fn spawn<F>(&self, label: impl Into<String>, timeout: Duration, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let label = label.into();
        let handle = tokio::spawn(async move {
            match tokio::time::timeout(timeout, task).await {
                Ok(Ok(())) => log::debug!("后台任务完成: {}", label),
                Ok(Err(e)) => log::warn!("⚠️ 后台任务失败 {}: {}", label, e),
                Err(_) => log::warn!("⏱️ 后台任务超时 {} ({:?})", label, timeout),
            }
        });

        let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// 等待目前派发的所有任务（包括等待期间新派发的）结束
    pub async fn wait_idle(&self) {
        loop {
            let pending: Vec<JoinHandle<()>> = {
                let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
                std::mem::take(&mut *handles)
            };
            if pending.is_empty() {
                break;
            }
            join_all(pending).await;
        }
    }

    pub fn pending(&self) -> usize {
        let handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        handles.iter().filter(|h| !h.is_finished()).count()
    }
}
