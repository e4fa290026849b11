//! 集成测试共用的内存实现
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use video_analyze::{
    AnalysisError, AnalysisPayload, AnalysisService, AudioFormat, ObjectStore, PipelineConfig,
    PipelineOrchestrator, RetryPolicy, StagingStore, VideoDecoder, VideoHandle,
};
use video_analyze::metadata::ResponseSchema;

/// 可编排的解码器
#[derive(Default)]
pub struct FakeDecoder {
    duration: f64,
    fail_frames: HashSet<u32>,
    audio: Option<Vec<u8>>,
    open_fails: bool,
    /// offset 越小延迟越长，让完成顺序与 offset 顺序相反
    reverse_delays: bool,
    pub open_calls: AtomicUsize,
    pub frame_calls: AtomicUsize,
    pub audio_calls: AtomicUsize,
}

impl FakeDecoder {
    pub fn new(duration: f64) -> Self {
        Self {
            duration,
            ..Default::default()
        }
    }

    pub fn failing_at(mut self, offset: u32) -> Self {
        self.fail_frames.insert(offset);
        self
    }

    pub fn with_audio(mut self, bytes: &[u8]) -> Self {
        self.audio = Some(bytes.to_vec());
        self
    }

    pub fn unopenable(mut self) -> Self {
        self.open_fails = true;
        self
    }

    pub fn with_reverse_delays(mut self) -> Self {
        self.reverse_delays = true;
        self
    }

    pub fn interactions(&self) -> usize {
        self.frame_calls.load(Ordering::SeqCst) + self.audio_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VideoDecoder for FakeDecoder {
    async fn open(&self, path: &Path) -> anyhow::Result<VideoHandle> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if self.open_fails {
            anyhow::bail!("invalid data found when processing input");
        }
        Ok(VideoHandle::new(path))
    }

    async fn probe(&self, _video: &VideoHandle) -> anyhow::Result<f64> {
        Ok(self.duration)
    }

    async fn frame(&self, _video: &VideoHandle, offset: u32) -> anyhow::Result<Vec<u8>> {
        self.frame_calls.fetch_add(1, Ordering::SeqCst);
        if self.reverse_delays {
            let total = self.duration.floor() as u64;
            let delay = total.saturating_sub(offset as u64) * 5;
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_frames.contains(&offset) {
            anyhow::bail!("no decodable frame at {}s", offset);
        }
        Ok(vec![0xFF, 0xD8, offset as u8, 0xFF, 0xD9])
    }

    async fn transcode_audio(
        &self,
        _video: &VideoHandle,
        _format: AudioFormat,
    ) -> anyhow::Result<Vec<u8>> {
        self.audio_calls.fetch_add(1, Ordering::SeqCst);
        match &self.audio {
            Some(bytes) => Ok(bytes.clone()),
            None => anyhow::bail!("no audio stream"),
        }
    }
}

/// 内存对象存储，记录所有 put / delete
#[derive(Default)]
pub struct MemoryStore {
    pub puts: Mutex<Vec<String>>,
    pub deletes: Mutex<Vec<String>>,
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
    fail_put_suffixes: Vec<String>,
    fail_delete: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_put_for(mut self, key_suffix: &str) -> Self {
        self.fail_put_suffixes.push(key_suffix.to_string());
        self
    }

    pub fn failing_delete(mut self) -> Self {
        self.fail_delete = true;
        self
    }

    pub fn puts(&self) -> Vec<String> {
        self.puts.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    pub fn live_objects(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn interactions(&self) -> usize {
        self.puts.lock().unwrap().len() + self.deletes.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        _content_type: &str,
    ) -> anyhow::Result<String> {
        if self.fail_put_suffixes.iter().any(|s| key.ends_with(s.as_str())) {
            anyhow::bail!("connection reset by peer");
        }
        self.puts.lock().unwrap().push(key.to_string());
        self.objects.lock().unwrap().insert(key.to_string(), body);
        Ok(format!("https://store.test/{}", key))
    }

    async fn delete_object(&self, key: &str) -> anyhow::Result<()> {
        self.deletes.lock().unwrap().push(key.to_string());
        if self.fail_delete {
            anyhow::bail!("access denied");
        }
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// 总是返回 `{"labels": ["cat"]}`
    Cat,
    /// 总是返回 `{"transcript": "meow"}`
    Transcript,
    /// 总是失败
    Fail,
}

/// 按脚本返回结果的分析服务
pub struct ScriptedAnalysis {
    script: Script,
    pub calls: Mutex<Vec<String>>,
    cancel_on_call: Option<CancellationToken>,
    delay: Option<Duration>,
}

impl ScriptedAnalysis {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            calls: Mutex::new(Vec::new()),
            cancel_on_call: None,
            delay: None,
        }
    }

    /// 每次调用前等待 `delay`，模拟较慢的分析服务
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 第一次被调用时取消 token，模拟客户端断开
    pub fn cancelling(mut self, token: CancellationToken) -> Self {
        self.cancel_on_call = Some(token);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl AnalysisService for ScriptedAnalysis {
    async fn analyze(&self, url: &str) -> Result<AnalysisPayload, AnalysisError> {
        self.calls.lock().unwrap().push(url.to_string());
        if let Some(token) = &self.cancel_on_call {
            token.cancel();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.script {
            Script::Cat => ResponseSchema::Image
                .validate(json!({"labels": ["cat"]}))
                .map_err(AnalysisError::InvalidResponse),
            Script::Transcript => ResponseSchema::Transcript
                .validate(json!({"transcript": "meow"}))
                .map_err(AnalysisError::InvalidResponse),
            Script::Fail => Err(AnalysisError::Status {
                status: 503,
                body: "vision backend unavailable".to_string(),
            }),
        }
    }
}

/// 测试用配置：重试间隔 1ms，临时目录放在 `temp_root` 下
pub fn test_config(temp_root: &Path) -> PipelineConfig {
    PipelineConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(1),
        },
        key_prefix: "test".to_string(),
        temp_root: Some(temp_root.to_path_buf()),
        ..PipelineConfig::default()
    }
}

pub fn orchestrator(
    config: PipelineConfig,
    decoder: &Arc<FakeDecoder>,
    store: &Arc<MemoryStore>,
    analysis: &Arc<ScriptedAnalysis>,
) -> PipelineOrchestrator {
    PipelineOrchestrator::new(
        config,
        decoder.clone(),
        StagingStore::new(store.clone()),
        analysis.clone(),
    )
}

/// 目录下剩余的条目数
pub fn entries_in(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}
