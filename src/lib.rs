//! # Exam OCR Orchestrator
//!
//! 试卷区块识别调度：把分割好的题干、选项、公式、图片区块交给多个识别引擎，
//! 按固定阶梯逐级升级，直到得到足够可信、语法合法的结果。
//!
//! ## 架构设计
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 兜底引擎配额（`QuotaManager`）、进度事件通道（`EventBus`）
//! - `engines/` - 识别引擎能力与路由（`RecognitionEngine`、`EngineRouter`）
//!
//! ### ② 业务能力层（Services）
//! - `ConfidenceEvaluator` - 置信度判定
//! - `SyntaxValidator` - 公式语法与可渲染性检查
//! - `StatsAggregator` - 识别统计
//! - `JsonExporter` / `FailureLog` - 结果导出与失败记录
//!
//! ### ③ 流程层（Workflow）
//! - `RetryLadder` - 四步升级阶梯
//! - `BlockProcessor` - 单个区块的识别生命周期
//!
//! ### ④ 编排层（Orchestration）
//! - `TaskManager` - 任务阶段状态机、并发与超时
//! - `App` - 批量处理入口

pub mod config;
pub mod engines;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult, TaskError};
pub use orchestrator::{App, TaskManager};
