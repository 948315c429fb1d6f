#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use exam_ocr_orchestrator::engines::{
    EngineOutput, EngineRole, EngineRouter, RecognitionEngine, RecognitionRequest,
};
use exam_ocr_orchestrator::error::EngineError;
use exam_ocr_orchestrator::infrastructure::QuotaManager;
use exam_ocr_orchestrator::{Config, TaskManager};

/// 合法公式，供测试引擎返回
pub const FORMULA: &str = r"\frac{a}{b}";
pub const INTEGRAL: &str = r"\int_{a}^{b} f(x) dx";

/// 按顺序返回预设结果的引擎，队列耗尽后返回默认结果
pub struct ScriptedEngine {
    name: &'static str,
    replies: Mutex<VecDeque<(String, f64)>>,
    default: (String, f64),
    delay: Duration,
    calls: AtomicUsize,
    images: Mutex<Vec<String>>,
}

impl ScriptedEngine {
    pub fn sequence(name: &'static str, replies: &[(&str, f64)]) -> Arc<Self> {
        Self::build(name, replies, ("", 0.0), Duration::ZERO)
    }

    pub fn constant(name: &'static str, content: &str, confidence: f64) -> Arc<Self> {
        Self::build(name, &[], (content, confidence), Duration::ZERO)
    }

    pub fn slow(name: &'static str, content: &str, confidence: f64, delay: Duration) -> Arc<Self> {
        Self::build(name, &[], (content, confidence), delay)
    }

    fn build(
        name: &'static str,
        replies: &[(&str, f64)],
        default: (&str, f64),
        delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            replies: Mutex::new(
                replies
                    .iter()
                    .map(|(c, conf)| (c.to_string(), *conf))
                    .collect(),
            ),
            default: (default.0.to_string(), default.1),
            delay,
            calls: AtomicUsize::new(0),
            images: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn images(&self) -> Vec<String> {
        self.images.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecognitionEngine for ScriptedEngine {
    fn name(&self) -> &str {
        self.name
    }

    async fn recognize(&self, request: &RecognitionRequest<'_>) -> Result<EngineOutput, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.images.lock().unwrap().push(request.image.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let (content, confidence) = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());
        Ok(EngineOutput::new(content, confidence))
    }
}

pub fn router(engines: Vec<(EngineRole, Arc<ScriptedEngine>)>, timeout: Duration) -> EngineRouter {
    engines
        .into_iter()
        .fold(EngineRouter::new(timeout), |router, (role, engine)| {
            router.with_engine(role, engine)
        })
}

pub fn manager(
    config: &Config,
    engines: Vec<(EngineRole, Arc<ScriptedEngine>)>,
    quota: Arc<QuotaManager>,
) -> TaskManager {
    let router = router(engines, config.engine_timeout());
    TaskManager::new(config, Arc::new(router), quota)
}

/// 已用掉 `used` 个名额的配额管理器
pub fn quota_with_usage(limit: u32, used: u32) -> Arc<QuotaManager> {
    let quota = QuotaManager::new(limit);
    for _ in 0..used {
        assert!(quota.try_consume());
    }
    Arc::new(quota)
}
