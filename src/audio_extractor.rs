use anyhow::{Context, Result};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::process::Command;

use crate::error::ExtractionError;
use crate::temp_file::TempFile;
use crate::video_processor::{VideoDecoder, VideoHandle};

/// 音频输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioFormat {
    #[default]
    Aac,
    Mp3,
    Wav,
}

impl AudioFormat {
    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Aac => "aac",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
        }
    }

    /// ffmpeg 输出容器名
    fn muxer(self) -> &'static str {
        match self {
            AudioFormat::Aac => "adts",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
        }
    }

    /// 重新编码时使用的编码器参数
    fn encoder_args(self) -> &'static [&'static str] {
        match self {
            AudioFormat::Aac => &["-acodec", "aac", "-b:a", "192k"],
            AudioFormat::Mp3 => &["-acodec", "libmp3lame", "-b:a", "192k"],
            AudioFormat::Wav => &["-acodec", "pcm_s16le"],
        }
    }
}

impl FromStr for AudioFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "aac" => Ok(AudioFormat::Aac),
            "mp3" => Ok(AudioFormat::Mp3),
            "wav" => Ok(AudioFormat::Wav),
            other => anyhow::bail!("不支持的音频格式: {}", other),
        }
    }
}

/// 用 ffmpeg 命令行把整条音轨输出到 stdout
///
/// AAC 先尝试直接复制音频流，失败再重新编码。
pub async fn transcode(input: &Path, format: AudioFormat) -> Result<Vec<u8>> {
    if format == AudioFormat::Aac {
        match run_ffmpeg(input, format, &["-acodec", "copy"]).await {
            Ok(bytes) if !bytes.is_empty() => return Ok(bytes),
            Ok(_) => tracing::debug!("🎵 [音频] 流复制没有输出，改为重新编码"),
            Err(e) => tracing::debug!("🎵 [音频] 流复制失败，改为重新编码: {:#}", e),
        }
    }
    run_ffmpeg(input, format, format.encoder_args()).await
}

async fn run_ffmpeg(input: &Path, format: AudioFormat, codec_args: &[&str]) -> Result<Vec<u8>> {
    let output = Command::new("ffmpeg")
        .arg("-loglevel")
        .arg("error")
        .arg("-i")
        .arg(input)
        .arg("-vn")
        .args(codec_args)
        .arg("-f")
        .arg(format.muxer())
        .arg("pipe:1")
        .kill_on_drop(true)
        .output()
        .await
        .context("执行 ffmpeg 命令失败")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("音频提取失败: {}", stderr.trim());
    }
    Ok(output.stdout)
}

/// 从视频中提取整条音轨到临时文件
#[derive(Clone)]
pub struct AudioExtractor {
    decoder: Arc<dyn VideoDecoder>,
    format: AudioFormat,
}

impl AudioExtractor {
    pub fn new(decoder: Arc<dyn VideoDecoder>, format: AudioFormat) -> Self {
        Self { decoder, format }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub async fn extract(&self, video: &VideoHandle, dir: &Path) -> Result<TempFile, ExtractionError> {
        let bytes = self
            .decoder
            .transcode_audio(video, self.format)
            .await
            .map_err(|e| ExtractionError::Audio(format!("{:#}", e)))?;
        if bytes.is_empty() {
            return Err(ExtractionError::Empty);
        }

        let suffix = format!(".{}", self.format.extension());
        TempFile::write_in(dir, "audio_", &suffix, &bytes)
            .await
            .map_err(|source| ExtractionError::Write {
                path: dir.to_path_buf(),
                source,
            })
    }
}
