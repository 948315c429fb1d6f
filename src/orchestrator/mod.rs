//! 编排层（Orchestration Layer）
//!
//! ## 模块划分
//!
//! ### `task_manager` - 任务管理器
//! - 每个任务的阶段状态机
//! - 为每个区块创建处理器并发识别
//! - 超时看门狗、取消、手动重试
//! - 进度事件、统计、配额管理入口
//!
//! ### `batch_processor` - 批量任务处理器
//! - 管理应用生命周期（初始化、运行）
//! - 批量加载分割结果清单
//! - 导出标准化结果、记录失败区块
//! - 输出全局统计信息
//!
//! ## 层次关系
//!
//! ```text
//! batch_processor (处理 Vec<TaskManifest>)
//!     ↓
//! task_manager (处理单个任务的 Vec<Block>)
//!     ↓
//! workflow::BlockProcessor → RetryLadder (处理单个区块)
//!     ↓
//! services (能力层：置信度 / 语法 / 统计 / 导出)
//!     ↓
//! engines + infrastructure (引擎路由、配额、事件通道)
//! ```

pub mod batch_processor;
pub mod task_manager;

pub use batch_processor::App;
pub use task_manager::TaskManager;
