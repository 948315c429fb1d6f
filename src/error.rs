use thiserror::Error;

use crate::models::{BlockId, TaskId, TaskStage};

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 任务生命周期错误
    #[error("任务错误: {0}")]
    Task(#[from] TaskError),
    /// 识别引擎错误
    #[error("引擎错误: {0}")]
    Engine(#[from] EngineError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 文件操作错误
    #[error("文件错误 ({path}): {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// JSON 序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),
}

/// 任务与区块操作错误
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("任务不存在: {task_id}")]
    NotFound { task_id: TaskId },

    #[error("任务 {task_id} 中不存在区块 {block_id}")]
    BlockNotFound { task_id: TaskId, block_id: BlockId },

    #[error("非法阶段转换: {from} -> {to}")]
    InvalidTransition { from: TaskStage, to: TaskStage },

    #[error("区块 {block_id} 正在识别中")]
    BlockBusy { block_id: BlockId },

    #[error("任务 {task_id} 当前阶段 {stage} 不允许重试")]
    NotRetryable { task_id: TaskId, stage: TaskStage },

    #[error("任务 {task_id} 仍在进行中，无法移除")]
    StillActive { task_id: TaskId },

    #[error("没有可用的识别引擎")]
    NoEngines,
}

/// 识别引擎调用错误
///
/// 阶梯内部全部按"空结果"处理并继续升级，只在日志和尝试记录中保留原因
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("引擎 {engine} 不可用: {message}")]
    Unavailable { engine: String, message: String },

    #[error("引擎 {engine} 返回错误响应: status={status}")]
    BadResponse { engine: String, status: u16 },

    #[error("引擎 {engine} 返回内容无法解析: {message}")]
    Malformed { engine: String, message: String },

    #[error("引擎 {engine} 读取图片失败 ({path}): {source}")]
    Io {
        engine: String,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub fn unavailable(engine: impl Into<String>, message: impl ToString) -> Self {
        EngineError::Unavailable {
            engine: engine.into(),
            message: message.to_string(),
        }
    }

    pub fn malformed(engine: impl Into<String>, message: impl ToString) -> Self {
        EngineError::Malformed {
            engine: engine.into(),
            message: message.to_string(),
        }
    }
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("配置项 {field} 无效: {reason}")]
    Invalid { field: String, reason: String },

    #[error("无法读取配置文件 {path}: {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("配置文件 {path} 解析失败: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
