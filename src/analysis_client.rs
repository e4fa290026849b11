use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::AnalysisError;
use crate::metadata::{AnalysisPayload, AnalysisResult, ResponseSchema};

/// 远程分析能力：给一个可访问的 URL，返回结构化分析结果
#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn analyze(&self, url: &str) -> Result<AnalysisPayload, AnalysisError>;
}

/// 远程服务配置
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl ServiceConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// JSON-over-HTTP 分析客户端
///
/// 视觉分析发送 `{"url": ...}`，转写发送 `{"audioUrl": ...}`。
pub struct HttpAnalysisClient {
    client: reqwest::Client,
    config: ServiceConfig,
    url_field: &'static str,
    schema: ResponseSchema,
}

impl HttpAnalysisClient {
    pub fn vision(config: ServiceConfig) -> Result<Self> {
        Self::build(config, "url", ResponseSchema::Image)
    }

    pub fn transcription(config: ServiceConfig) -> Result<Self> {
        Self::build(config, "audioUrl", ResponseSchema::Transcript)
    }

    fn build(config: ServiceConfig, url_field: &'static str, schema: ResponseSchema) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            anyhow::bail!("分析服务地址不能为空");
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("创建 HTTP 客户端失败")?;
        Ok(Self {
            client,
            config,
            url_field,
            schema,
        })
    }
}

#[async_trait]
impl AnalysisService for HttpAnalysisClient {
    async fn analyze(&self, url: &str) -> Result<AnalysisPayload, AnalysisError> {
        let mut body = serde_json::Map::new();
        body.insert(self.url_field.to_string(), json!(url));

        let mut request = self.client.post(&self.config.endpoint).json(&body);
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalysisError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| AnalysisError::InvalidResponse(e.to_string()))?;
        self.schema
            .validate(value)
            .map_err(AnalysisError::InvalidResponse)
    }
}

/// 固定间隔重试策略（无指数退避，无抖动）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

/// 带重试的分析客户端
///
/// 永远返回 `AnalysisResult`，重试耗尽是数据而不是错误。
#[derive(Clone)]
pub struct RetryingAnalysisClient {
    inner: Arc<dyn AnalysisService>,
    policy: RetryPolicy,
}

impl RetryingAnalysisClient {
    pub fn new(inner: Arc<dyn AnalysisService>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub async fn analyze(&self, url: &str) -> AnalysisResult {
        let attempts = self.policy.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.inner.analyze(url).await {
                Ok(payload) => {
                    if attempt > 1 {
                        debug!("🔁 [分析] 第 {} 次尝试成功: {}", attempt, url);
                    }
                    return AnalysisResult::Success(payload);
                }
                Err(e) => {
                    warn!("⚠️  [分析] 第 {}/{} 次尝试失败: {} - {}", attempt, attempts, url, e);
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.policy.delay).await;
            }
        }

        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        AnalysisResult::failure(format!("Failed after {} retries: {}", attempts, reason))
    }
}
