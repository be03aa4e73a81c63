//! 进度报告与协作式取消

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 默认的进度上报间隔
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// 进度接收端，同时是取消信号的来源
pub trait ProgressReporter: Send + Sync {
    /// 设置状态文本
    fn set_status(&self, status: &str);

    /// 设置进度，取值 0.0 ~ 1.0
    fn set_progress(&self, progress: f64);

    /// 调用方是否请求取消
    fn is_cancelled(&self) -> bool;
}

/// 不输出任何进度且永不取消
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn set_status(&self, _status: &str) {}

    fn set_progress(&self, _progress: f64) {}

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// 可在线程间共享的取消标志
#[derive(Debug, Default, Clone)]
pub struct CancellationFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

/// 把进度写入 tracing 日志，取消状态来自 [`CancellationFlag`]
#[derive(Debug, Default, Clone)]
pub struct LoggingProgress {
    cancel: CancellationFlag,
}

impl LoggingProgress {
    pub fn new(cancel: CancellationFlag) -> Self {
        Self { cancel }
    }
}

impl ProgressReporter for LoggingProgress {
    fn set_status(&self, status: &str) {
        tracing::info!("{}", status);
    }

    fn set_progress(&self, progress: f64) {
        tracing::info!("progress {:.0}%", progress * 100.0);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// 进度节流：间隔内最多上报一次，最后一项总是上报
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    /// 处理完第 `index` 项 (从0开始) 后调用，需要上报时转发到 `reporter`
    pub fn tick(&mut self, reporter: &dyn ProgressReporter, index: usize, total: usize) -> bool {
        let is_last = index + 1 >= total;
        let now = Instant::now();
        let due = match self.last {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        };
        if !(due || is_last) {
            return false;
        }
        self.last = Some(now);
        let fraction = if total == 0 {
            1.0
        } else {
            (index + 1) as f64 / total as f64
        };
        reporter.set_progress(fraction);
        true
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_INTERVAL)
    }
}
