//! 从 TOML 引擎配置构建路由器

use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::{
    CommandEngine, EngineRole, EngineRouter, MathpixEngine, RecognitionEngine, VisionLlmEngine,
};
use crate::config::Config;
use crate::error::ConfigError;

/// 单个引擎的配置，按 `kind` 区分
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineSpec {
    Command {
        name: String,
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Mathpix {
        #[serde(default)]
        app_id: Option<String>,
        #[serde(default)]
        app_key: Option<String>,
        #[serde(default)]
        api_url: Option<String>,
    },
    VisionLlm {
        name: String,
        model: String,
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default)]
        api_base_url: Option<String>,
    },
}

/// 引擎配置文件（每个角色一张表，均可省略）
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnginesConfig {
    pub primary_text: Option<EngineSpec>,
    pub fallback_text: Option<EngineSpec>,
    pub primary_formula: Option<EngineSpec>,
    pub fallback_formula: Option<EngineSpec>,
    pub emergency_formula: Option<EngineSpec>,
}

impl EnginesConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: display.clone(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    fn get(&self, role: EngineRole) -> Option<&EngineSpec> {
        match role {
            EngineRole::PrimaryText => self.primary_text.as_ref(),
            EngineRole::FallbackText => self.fallback_text.as_ref(),
            EngineRole::PrimaryFormula => self.primary_formula.as_ref(),
            EngineRole::FallbackFormula => self.fallback_formula.as_ref(),
            EngineRole::EmergencyFormula => self.emergency_formula.as_ref(),
        }
    }
}

impl EngineSpec {
    /// 密钥优先取配置文件，其次取环境变量
    fn build(&self, role: EngineRole) -> Result<Arc<dyn RecognitionEngine>, ConfigError> {
        let engine: Arc<dyn RecognitionEngine> = match self {
            EngineSpec::Command { name, program, args } => {
                Arc::new(CommandEngine::new(name, program, args.clone()))
            }
            EngineSpec::Mathpix {
                app_id,
                app_key,
                api_url,
            } => {
                let app_id = secret(app_id, "MATHPIX_APP_ID", role)?;
                let app_key = secret(app_key, "MATHPIX_APP_KEY", role)?;
                let engine = MathpixEngine::new(app_id, app_key);
                match api_url {
                    Some(url) => Arc::new(engine.with_api_url(url)),
                    None => Arc::new(engine),
                }
            }
            EngineSpec::VisionLlm {
                name,
                model,
                api_key,
                api_base_url,
            } => {
                let api_key = secret(api_key, "LLM_API_KEY", role)?;
                let api_base_url = api_base_url
                    .clone()
                    .or_else(|| std::env::var("LLM_API_BASE_URL").ok())
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
                Arc::new(VisionLlmEngine::new(name, &api_key, &api_base_url, model))
            }
        };
        Ok(engine)
    }
}

fn secret(value: &Option<String>, env: &str, role: EngineRole) -> Result<String, ConfigError> {
    value
        .clone()
        .filter(|v| !v.is_empty())
        .or_else(|| std::env::var(env).ok().filter(|v| !v.is_empty()))
        .ok_or_else(|| ConfigError::Invalid {
            field: role.to_string(),
            reason: format!("缺少密钥，请在配置文件或环境变量 {} 中设置", env),
        })
}

/// 按配置构建路由器
pub fn build_router_from(engines: &EnginesConfig, config: &Config) -> Result<EngineRouter, ConfigError> {
    let mut router = EngineRouter::new(config.engine_timeout());
    for role in EngineRole::ALL {
        match engines.get(role) {
            Some(spec) => {
                let engine = spec.build(role)?;
                info!("🔌 {} -> {}", role, engine.name());
                router = router.with_engine(role, engine);
            }
            None => warn!("⚠️ 未配置 {} 引擎，对应步骤将被跳过", role),
        }
    }
    Ok(router)
}

/// 读取 `config.engine_config_file` 并构建路由器
pub fn build_router(config: &Config) -> Result<EngineRouter, ConfigError> {
    let engines = EnginesConfig::load(Path::new(&config.engine_config_file))?;
    build_router_from(&engines, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BlockType, LadderStep};

    const SAMPLE: &str = r#"
[primary_text]
kind = "command"
name = "paddleocr"
program = "paddleocr-json"
args = ["--lang=ch", "{image}"]

[primary_formula]
kind = "command"
name = "pix2tex"
program = "pix2tex"

[emergency_formula]
kind = "mathpix"
app_id = "id"
app_key = "key"
"#;

    #[test]
    fn parses_tagged_specs() {
        let engines: EnginesConfig = toml::from_str(SAMPLE).unwrap();
        assert!(matches!(engines.primary_text, Some(EngineSpec::Command { .. })));
        assert!(matches!(engines.emergency_formula, Some(EngineSpec::Mathpix { .. })));
        assert!(engines.fallback_text.is_none());
    }

    #[test]
    fn builds_router_with_configured_roles() {
        let engines: EnginesConfig = toml::from_str(SAMPLE).unwrap();
        let router = build_router_from(&engines, &Config::default()).unwrap();

        assert_eq!(router.health().len(), 3);
        assert_eq!(router.engine_name(EngineRole::EmergencyFormula), Some("mathpix"));
        assert!(router.route(BlockType::Formula, LadderStep::CompressedFallback).is_none());
        assert!(router.route(BlockType::Formula, LadderStep::OriginalEmergency).is_some());
    }

    #[test]
    fn unknown_kind_fails_to_parse() {
        let result: Result<EnginesConfig, _> = toml::from_str("[primary_text]\nkind = \"tesseract\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn missing_file_is_reported() {
        let err = EnginesConfig::load(Path::new("/nonexistent/engines.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
    }
}
