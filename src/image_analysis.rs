use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::analysis_client::AnalysisService;
use crate::error::PipelineError;
use crate::metadata::AnalysisResult;
use crate::staging::{KeySpace, StagingStore};
use crate::temp_file::TempFile;

/// 待分析的图片：外部 URL 或上传的文件
#[derive(Debug)]
pub enum ImageSource {
    Url(String),
    Upload { file: TempFile, file_name: String },
}

/// 单张图片分析：只调用一次分析服务，不重试
///
/// 只有上传的文件会被暂存，分析结束后删除；外部 URL 直接交给分析服务。
pub struct ImageAnalyzer {
    staging: StagingStore,
    analysis: Arc<dyn AnalysisService>,
    key_prefix: String,
}

impl ImageAnalyzer {
    pub fn new(
        staging: StagingStore,
        analysis: Arc<dyn AnalysisService>,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            staging,
            analysis,
            key_prefix: key_prefix.into(),
        }
    }

    pub async fn analyze(
        &self,
        source: ImageSource,
        owner_id: &str,
    ) -> Result<AnalysisResult, PipelineError> {
        match source {
            ImageSource::Url(raw) => {
                let url = validate_image_url(&raw)?;
                info!("🖼️  [图片分析] 分析外部图片: {}", url);
                Ok(self.analyze_once(url.as_str()).await)
            }
            ImageSource::Upload { file, file_name } => {
                let size = tokio::fs::metadata(file.path())
                    .await
                    .map(|m| m.len())
                    .map_err(|e| {
                        error!("❌ [图片分析] 读取上传文件失败: {} - {}", file.path().display(), e);
                        PipelineError::infrastructure(format!("failed to read uploaded image: {}", e))
                    })?;
                if size == 0 {
                    return Err(PipelineError::missing_input("Uploaded image is empty"));
                }

                let key = KeySpace::new(&self.key_prefix, owner_id, "")
                    .image(&Uuid::new_v4().simple().to_string(), &file_name);
                let artifact = self.staging.put(file, key).await?;
                info!("🖼️  [图片分析] 分析上传图片: {} ({} 字节)", artifact.remote_key(), size);

                let result = self.analyze_once(artifact.remote_url()).await;
                // 删除失败不影响结果，StagingStore 已记录日志
                if let Err(e) = self.staging.delete(artifact).await {
                    debug!("🗑️  [图片分析] 对象残留: {}", e);
                }
                Ok(result)
            }
        }
    }

    async fn analyze_once(&self, url: &str) -> AnalysisResult {
        match self.analysis.analyze(url).await {
            Ok(payload) => AnalysisResult::Success(payload),
            Err(e) => {
                warn!("⚠️  [图片分析] 分析失败: {} - {}", url, e);
                AnalysisResult::failure(e.to_string())
            }
        }
    }
}

/// 只接受带主机名的 http/https 绝对地址
pub fn validate_image_url(raw: &str) -> Result<Url, PipelineError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| PipelineError::InvalidInput(format!("Invalid URL: {}", e)))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(PipelineError::InvalidInput(format!(
            "Invalid URL: unsupported scheme or missing host in {}",
            raw.trim()
        )));
    }
    Ok(url)
}
