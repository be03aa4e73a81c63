//! 目录变更通知

use serde::Serialize;
use tokio::sync::broadcast;

/// 默认通道容量
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// 目录变更事件
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CatalogEvent {
    /// 一次导入完成
    ImportCompleted {
        /// 新建检查的UID
        new_studies: Vec<String>,
        /// 本次导入涉及的检查UID
        touched_studies: Vec<String>,
        /// 新建或匹配的影像数
        images: usize,
    },
    StudyDeleted {
        study_instance_uid: String,
        patient_uid: Option<String>,
    },
    SeriesDeleted {
        study_instance_uid: String,
        series_instance_uid: String,
    },
}

/// 广播事件总线，没有订阅者时事件直接丢弃
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CatalogEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.sender.subscribe()
    }

    /// 发布事件，返回收到事件的订阅者数量
    pub fn publish(&self, event: CatalogEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                tracing::debug!("No subscribers for catalog event");
                0
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
