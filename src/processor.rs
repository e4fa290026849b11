use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::analysis_client::{AnalysisService, RetryPolicy, RetryingAnalysisClient};
use crate::audio_extractor::{AudioExtractor, AudioFormat};
use crate::error::PipelineError;
use crate::frame_extractor::FrameExtractor;
use crate::metadata::{AnalysisResult, FrameResult, PipelineReport};
use crate::staging::{KeySpace, StagingStore};
use crate::temp_file::{scratch_dir, TempFile};
use crate::video_processor::{VideoDecoder, VideoHandle};

/// 管线配置
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// 允许的最大视频时长（秒）
    pub max_duration_secs: f64,
    /// 帧分析的重试策略
    pub retry: RetryPolicy,
    /// 同时处理的帧数，1 即顺序处理
    pub max_concurrent_frames: usize,
    pub audio_enabled: bool,
    pub audio_format: AudioFormat,
    /// 转写服务的尝试次数
    pub transcription_attempts: u32,
    /// 对象存储键前缀
    pub key_prefix: String,
    /// 临时目录根路径，`None` 使用系统临时目录
    pub temp_root: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: 120.0,
            retry: RetryPolicy::default(),
            max_concurrent_frames: 4,
            audio_enabled: false,
            audio_format: AudioFormat::default(),
            transcription_attempts: 1,
            key_prefix: "assets/video-analyze".to_string(),
            temp_root: None,
        }
    }
}

/// 一次分析请求
#[derive(Debug, Clone)]
pub struct VideoJob {
    pub source: VideoHandle,
    pub duration_seconds: f64,
    pub owner_id: String,
}

impl VideoJob {
    pub fn new(source: VideoHandle, duration_seconds: f64, owner_id: impl Into<String>) -> Self {
        Self {
            source,
            duration_seconds,
            owner_id: owner_id.into(),
        }
    }

    /// 需要采样的秒数：1..=floor(duration)
    pub fn frame_count(&self) -> u32 {
        self.duration_seconds.floor() as u32
    }
}

/// 视频分析管线
///
/// 每个 offset 依次执行 抽帧 → 上传 → 分析（带重试）→ 删除，
/// 任何一步失败都只记录在该 offset 的结果里，不影响其他 offset。
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    decoder: Arc<dyn VideoDecoder>,
    frames: FrameExtractor,
    audio: AudioExtractor,
    staging: StagingStore,
    analysis: RetryingAnalysisClient,
    transcription: Option<RetryingAnalysisClient>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: PipelineConfig,
        decoder: Arc<dyn VideoDecoder>,
        staging: StagingStore,
        analysis: Arc<dyn AnalysisService>,
    ) -> Self {
        let frames = FrameExtractor::new(decoder.clone());
        let audio = AudioExtractor::new(decoder.clone(), config.audio_format);
        let analysis = RetryingAnalysisClient::new(analysis, config.retry);
        Self {
            config,
            decoder,
            frames,
            audio,
            staging,
            analysis,
            transcription: None,
        }
    }

    /// 配置转写服务；只有同时开启 `audio_enabled` 才会处理音轨
    pub fn with_transcription(mut self, service: Arc<dyn AnalysisService>) -> Self {
        let policy = RetryPolicy {
            max_attempts: self.config.transcription_attempts.max(1),
            delay: self.config.retry.delay,
        };
        self.transcription = Some(RetryingAnalysisClient::new(service, policy));
        self
    }

    /// 打开视频并读取时长
    pub async fn prepare(&self, path: &Path, owner_id: &str) -> Result<VideoJob, PipelineError> {
        let source = self.decoder.open(path).await.map_err(|e| {
            error!("❌ [视频分析] 打开视频失败: {} - {:#}", path.display(), e);
            PipelineError::infrastructure(format!("failed to open video: {:#}", e))
        })?;
        let duration = self.decoder.probe(&source).await.map_err(|e| {
            error!("❌ [视频分析] 读取视频时长失败: {} - {:#}", path.display(), e);
            PipelineError::infrastructure(format!("failed to read video duration: {:#}", e))
        })?;
        Ok(VideoJob::new(source, duration, owner_id))
    }

    pub async fn run(
        &self,
        job: VideoJob,
        cancel: CancellationToken,
    ) -> Result<PipelineReport, PipelineError> {
        self.admit(&job)?;

        let total_start = Instant::now();
        let scratch = scratch_dir(self.config.temp_root.as_deref()).map_err(|e| {
            error!("❌ [视频分析] 创建临时目录失败: {:#}", e);
            PipelineError::infrastructure(format!("{:#}", e))
        })?;

        let run_id = Uuid::new_v4().simple().to_string();
        let keys = KeySpace::new(&self.config.key_prefix, &job.owner_id, &run_id);
        let frame_count = job.frame_count();
        let with_audio = self.config.audio_enabled && self.transcription.is_some();

        info!(
            "🎬 [视频分析] 开始分析: owner={}, run={}, 时长 {:.2}秒, 共 {} 帧, 并发 {}{}",
            job.owner_id,
            run_id,
            job.duration_seconds,
            frame_count,
            self.config.max_concurrent_frames.max(1),
            if with_audio { ", 含音频" } else { "" }
        );

        let frames = self.run_frames(&job.source, frame_count, &keys, scratch.path(), &cancel);
        let audio = async {
            if with_audio {
                Some(self.run_audio(&job.source, &keys, scratch.path(), &cancel).await)
            } else {
                None
            }
        };
        let (frames, audio) = tokio::join!(frames, audio);

        if cancel.is_cancelled() {
            warn!(
                "⚠️  [视频分析] 请求已取消，丢弃 {} 个已完成的结果: run={}",
                frames.len(),
                run_id
            );
            return Err(PipelineError::Cancelled);
        }

        let report = PipelineReport::new(frames, audio);
        info!(
            "✅ [视频分析] 分析完成: 成功 {}/{}，耗时 {:.2}秒",
            report.success_count(),
            report.frames().len(),
            total_start.elapsed().as_secs_f64()
        );
        if !report.failed_offsets().is_empty() {
            warn!("⚠️  [视频分析] 失败的 offset: {:?}", report.failed_offsets());
        }
        Ok(report)
    }

    /// 时长检查，必须在任何抽帧、上传之前完成
    fn admit(&self, job: &VideoJob) -> Result<(), PipelineError> {
        let duration = job.duration_seconds;
        if !duration.is_finite() || duration <= 0.0 {
            warn!("⚠️  [视频分析] 视频时长无效: {}", duration);
            return Err(PipelineError::missing_input("Video has no playable duration"));
        }
        if duration > self.config.max_duration_secs {
            warn!(
                "⚠️  [视频分析] 视频时长 {:.2}秒 超过上限 {:.0}秒",
                duration, self.config.max_duration_secs
            );
            return Err(PipelineError::DurationExceeded {
                duration,
                limit: self.config.max_duration_secs,
            });
        }
        Ok(())
    }

    async fn run_frames(
        &self,
        video: &VideoHandle,
        frame_count: u32,
        keys: &KeySpace,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Vec<FrameResult> {
        // 取消后不再启动新的 offset，已开始的会跑完（包括清理）
        stream::iter(1..=frame_count)
            .take_while(|_| futures::future::ready(!cancel.is_cancelled()))
            .map(|offset| self.process_offset(video, offset, keys, dir))
            .buffer_unordered(self.config.max_concurrent_frames.max(1))
            .collect()
            .await
    }

    async fn process_offset(
        &self,
        video: &VideoHandle,
        offset: u32,
        keys: &KeySpace,
        dir: &Path,
    ) -> FrameResult {
        let start = Instant::now();
        let result = match self.frames.extract(video, offset, dir).await {
            Ok(local) => {
                self.stage_and_analyze(local, keys.frame(offset), &self.analysis)
                    .await
            }
            Err(e) => {
                warn!("⚠️  [视频分析] 第 {} 秒抽帧失败: {}", offset, e);
                AnalysisResult::failure(e.to_string())
            }
        };
        debug!(
            "⏱️  [视频分析] 第 {} 秒处理完成 ({}), 耗时 {:.2}秒",
            offset,
            if result.is_success() { "成功" } else { "失败" },
            start.elapsed().as_secs_f64()
        );
        FrameResult {
            offset_seconds: offset,
            result,
        }
    }

    async fn run_audio(
        &self,
        video: &VideoHandle,
        keys: &KeySpace,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> AnalysisResult {
        let Some(transcription) = &self.transcription else {
            return AnalysisResult::failure("transcription service is not configured");
        };
        if cancel.is_cancelled() {
            return AnalysisResult::failure("cancelled before audio extraction");
        }

        info!("🎵 [视频分析] 正在提取音频 ({})...", self.audio.format().extension());
        match self.audio.extract(video, dir).await {
            Ok(local) => {
                let key = keys.audio(self.audio.format().extension());
                let result = self.stage_and_analyze(local, key, transcription).await;
                if result.is_success() {
                    info!("✅ [视频分析] 音频转写完成");
                }
                result
            }
            Err(e) => {
                warn!("⚠️  [视频分析] 音频提取失败: {}", e);
                AnalysisResult::failure(e.to_string())
            }
        }
    }

    /// 上传 → 分析 → 删除
    ///
    /// 上传失败时没有可删除的对象；上传成功后，无论分析结果如何都会删除一次。
    async fn stage_and_analyze(
        &self,
        local: TempFile,
        key: String,
        client: &RetryingAnalysisClient,
    ) -> AnalysisResult {
        let artifact = match self.staging.put(local, key).await {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!("⚠️  [视频分析] 上传失败，跳过分析: {}", e);
                return AnalysisResult::failure(e.to_string());
            }
        };

        let result = client.analyze(artifact.remote_url()).await;

        // 删除失败不影响结果，StagingStore 已记录日志
        if let Err(e) = self.staging.delete(artifact).await {
            debug!("🗑️  [视频分析] 对象残留: {}", e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn frame_count_floors_duration() {
        let job = VideoJob::new(VideoHandle::new("a.mp4"), 5.7, "u1");
        assert_eq!(job.frame_count(), 5);
        let job = VideoJob::new(VideoHandle::new("a.mp4"), 0.4, "u1");
        assert_eq!(job.frame_count(), 0);
    }

    #[test]
    fn default_config_matches_service_limits() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_duration_secs, 120.0);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.delay, Duration::from_secs(5));
        assert_eq!(config.max_concurrent_frames, 4);
        assert!(!config.audio_enabled);
    }
}
