//! # 存储模块
//!
//! 负责输入路径的文件枚举，以及受管存储目录的布局和文件处置。

pub mod enumerator;
pub mod storage;

pub use enumerator::enumerate;
pub use storage::{StorageLayout, StorageManager};
