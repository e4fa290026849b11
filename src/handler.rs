use axum::{
    extract::{multipart::Field, DefaultBodyLimit, Multipart, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::error::PipelineError;
use crate::image_analysis::{ImageAnalyzer, ImageSource};
use crate::processor::PipelineOrchestrator;
use crate::staging::sanitize_segment;
use crate::temp_file::TempFile;

/// 请求头中的用户标识
pub const OWNER_HEADER: &str = "x-user-id";

/// 各 handler 共享的状态
#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<PipelineOrchestrator>,
    images: Arc<ImageAnalyzer>,
    default_owner: String,
    upload_dir: PathBuf,
    max_upload_bytes: usize,
}

impl AppState {
    pub fn new(
        pipeline: Arc<PipelineOrchestrator>,
        images: Arc<ImageAnalyzer>,
        server: &ServerConfig,
        upload_dir: impl Into<PathBuf>,
    ) -> anyhow::Result<Self> {
        let upload_dir = upload_dir.into();
        std::fs::create_dir_all(&upload_dir)
            .map_err(|e| anyhow::anyhow!("创建上传目录失败: {}: {}", upload_dir.display(), e))?;
        Ok(Self {
            pipeline,
            images,
            default_owner: sanitize_segment(&server.default_owner),
            upload_dir,
            max_upload_bytes: server.max_upload_bytes,
        })
    }
}

/// 构建路由
pub fn router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes;
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/analyzeVideo", post(analyze_video))
        .route("/analyzeImage", post(analyze_image))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 健康检查
pub async fn health_check() -> &'static str {
    "OK"
}

/// 视频分析：multipart 字段 `video`
pub async fn analyze_video(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<Value>, PipelineError> {
    let owner = owner_id(&headers, &state.default_owner);

    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        if field.name() == Some("video") {
            upload = Some(save_upload(field, &state.upload_dir, ".mp4").await?);
            break;
        }
    }
    let upload = upload.ok_or_else(|| PipelineError::missing_input("No video file uploaded"))?;
    info!("📥 [HTTP] 收到视频: owner={}, 文件={}", owner, upload.path().display());

    let job = state.pipeline.prepare(upload.path(), &owner).await?;

    // 客户端断开时 handler future 被丢弃，drop guard 会取消管线；
    // 上传的文件随任务一起释放，保证进行中的 offset 仍能读取
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let pipeline = state.pipeline.clone();
    let task = tokio::spawn(async move {
        let result = pipeline.run(job, cancel).await;
        drop(upload);
        result
    });
    let report = task
        .await
        .map_err(|e| PipelineError::infrastructure(format!("pipeline task failed: {}", e)))??;
    guard.disarm();

    Ok(Json(json!({ "data": report })))
}

/// 图片分析：文本字段 `url` 或文件字段 `image`
pub async fn analyze_image(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<Value>, PipelineError> {
    let owner = owner_id(&headers, &state.default_owner);

    let mut url = None;
    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("url") => {
                let text = field.text().await.map_err(bad_multipart)?;
                if !text.trim().is_empty() {
                    url = Some(text);
                }
            }
            Some("image") if upload.is_none() => {
                let file_name = field.file_name().unwrap_or("image").to_string();
                let file = save_upload(field, &state.upload_dir, ".img").await?;
                upload = Some((file, file_name));
            }
            _ => {}
        }
    }

    // 同时提供时以 URL 为准
    let source = match (url, upload) {
        (Some(url), _) => ImageSource::Url(url),
        (None, Some((file, file_name))) => ImageSource::Upload { file, file_name },
        (None, None) => return Err(PipelineError::missing_input("No image or URL provided")),
    };

    let result = state.images.analyze(source, &owner).await?;
    Ok(Json(json!({ "data": result })))
}

/// 从请求头取 owner，缺失时使用默认值
pub fn owner_id(headers: &HeaderMap, default_owner: &str) -> String {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(sanitize_segment)
        .unwrap_or_else(|| default_owner.to_string())
}

/// 把上传内容按块写入临时文件
async fn save_upload(
    mut field: Field<'_>,
    dir: &Path,
    fallback_suffix: &str,
) -> Result<TempFile, PipelineError> {
    let suffix = field
        .file_name()
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", sanitize_segment(ext)))
        .unwrap_or_else(|| fallback_suffix.to_string());

    let file = TempFile::create_in(dir, "upload_", &suffix).map_err(|e| {
        PipelineError::infrastructure(format!("failed to create upload file: {}", e))
    })?;
    let mut out = tokio::fs::File::create(file.path()).await.map_err(|e| {
        PipelineError::infrastructure(format!("failed to open upload file: {}", e))
    })?;

    let mut written = 0usize;
    while let Some(chunk) = field.chunk().await.map_err(bad_multipart)? {
        written += chunk.len();
        out.write_all(&chunk).await.map_err(|e| {
            PipelineError::infrastructure(format!("failed to write upload file: {}", e))
        })?;
    }
    out.flush().await.map_err(|e| {
        PipelineError::infrastructure(format!("failed to write upload file: {}", e))
    })?;

    if written == 0 {
        return Err(PipelineError::missing_input("Uploaded file is empty"));
    }
    Ok(file)
}

fn bad_multipart(err: axum::extract::multipart::MultipartError) -> PipelineError {
    PipelineError::InvalidInput(format!("Invalid multipart body: {}", err))
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = if self.is_client_error() {
            warn!("⚠️  [HTTP] 请求被拒绝: {}", self);
            StatusCode::BAD_REQUEST
        } else {
            error!("❌ [HTTP] 请求处理失败: {}", self);
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
