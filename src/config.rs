use std::time::Duration;

use crate::error::ConfigError;

/// 单个区块尝试次数的硬上限
pub const MAX_ATTEMPTS_LIMIT: usize = 5;

/// 程序配置
#[derive(Clone, Debug)]
pub struct Config {
    /// 同时处理的任务数量（超出部分排队）
    pub max_concurrent_tasks: usize,
    /// 任务整体超时（秒），从 uploaded 开始计时
    pub task_timeout_secs: u64,
    /// 单次引擎调用超时（秒）
    pub engine_timeout_secs: u64,
    /// 单个区块最多尝试次数（1 到 5）
    pub max_attempts: usize,
    /// 文字区块置信度阈值
    pub text_confidence_threshold: f64,
    /// 公式区块置信度阈值
    pub formula_confidence_threshold: f64,
    /// 兜底引擎每日调用上限
    pub emergency_daily_limit: u32,
    /// 配额持久化文件
    pub quota_state_file: String,
    /// 进度事件通道容量
    pub event_channel_capacity: usize,
    /// 分割结果（TOML 任务清单）存放目录
    pub input_folder: String,
    /// 识别结果输出目录
    pub output_folder: String,
    /// 失败区块记录文件
    pub failure_log_file: String,
    /// 引擎路由配置文件
    pub engine_config_file: String,
    /// 是否显示详细日志
    pub verbose_logging: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            task_timeout_secs: 300,
            engine_timeout_secs: 30,
            max_attempts: 5,
            text_confidence_threshold: 0.8,
            formula_confidence_threshold: 0.7,
            emergency_daily_limit: 100,
            quota_state_file: "quota_state.json".to_string(),
            event_channel_capacity: 1024,
            input_folder: "segmented".to_string(),
            output_folder: "outputs".to_string(),
            failure_log_file: "failed_blocks.txt".to_string(),
            engine_config_file: "engines.toml".to_string(),
            verbose_logging: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_concurrent_tasks: env_parse("MAX_CONCURRENT_TASKS").unwrap_or(default.max_concurrent_tasks),
            task_timeout_secs: env_parse("TASK_TIMEOUT_SECS").unwrap_or(default.task_timeout_secs),
            engine_timeout_secs: env_parse("ENGINE_TIMEOUT_SECS").unwrap_or(default.engine_timeout_secs),
            max_attempts: env_parse("MAX_ATTEMPTS").unwrap_or(default.max_attempts),
            text_confidence_threshold: env_parse("TEXT_CONFIDENCE_THRESHOLD").unwrap_or(default.text_confidence_threshold),
            formula_confidence_threshold: env_parse("FORMULA_CONFIDENCE_THRESHOLD").unwrap_or(default.formula_confidence_threshold),
            emergency_daily_limit: env_parse("EMERGENCY_DAILY_LIMIT").unwrap_or(default.emergency_daily_limit),
            quota_state_file: std::env::var("QUOTA_STATE_FILE").unwrap_or(default.quota_state_file),
            event_channel_capacity: env_parse("EVENT_CHANNEL_CAPACITY").unwrap_or(default.event_channel_capacity),
            input_folder: std::env::var("INPUT_FOLDER").unwrap_or(default.input_folder),
            output_folder: std::env::var("OUTPUT_FOLDER").unwrap_or(default.output_folder),
            failure_log_file: std::env::var("FAILURE_LOG_FILE").unwrap_or(default.failure_log_file),
            engine_config_file: std::env::var("ENGINE_CONFIG_FILE").unwrap_or(default.engine_config_file),
            verbose_logging: env_parse("VERBOSE_LOGGING").unwrap_or(default.verbose_logging),
        }
    }

    /// 检查配置取值是否合理
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("text_confidence_threshold", self.text_confidence_threshold),
            ("formula_confidence_threshold", self.formula_confidence_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid {
                    field: name.to_string(),
                    reason: format!("{} 不在 [0, 1] 范围内", value),
                });
            }
        }

        let non_zero = [
            ("max_concurrent_tasks", self.max_concurrent_tasks as u64),
            ("task_timeout_secs", self.task_timeout_secs),
            ("engine_timeout_secs", self.engine_timeout_secs),
            ("max_attempts", self.max_attempts as u64),
            ("event_channel_capacity", self.event_channel_capacity as u64),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid {
                field: name.to_string(),
                reason: "不能为 0".to_string(),
            });
        }

        if self.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(ConfigError::Invalid {
                field: "max_attempts".to_string(),
                reason: format!("不能超过 {}", MAX_ATTEMPTS_LIMIT),
            });
        }

        Ok(())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
