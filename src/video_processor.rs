use anyhow::{Context, Result};
use async_trait::async_trait;
use ffmpeg_next as ffmpeg;
use image::DynamicImage;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Once;

use crate::audio_extractor::{self, AudioFormat};

/// 已打开的视频
#[derive(Debug, Clone, PartialEq)]
pub struct VideoHandle {
    path: PathBuf,
}

impl VideoHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// 视频解码能力
#[async_trait]
pub trait VideoDecoder: Send + Sync {
    /// 打开视频；失败意味着整个请求无法处理
    async fn open(&self, path: &Path) -> Result<VideoHandle>;

    /// 视频时长（秒）
    async fn probe(&self, video: &VideoHandle) -> Result<f64>;

    /// 取第 `offset_seconds` 秒的一帧，返回 JPEG 数据
    async fn frame(&self, video: &VideoHandle, offset_seconds: u32) -> Result<Vec<u8>>;

    /// 整条音轨转码为指定格式
    async fn transcode_audio(&self, video: &VideoHandle, format: AudioFormat) -> Result<Vec<u8>>;
}

static FFMPEG_INIT: Once = Once::new();

fn init_ffmpeg() -> Result<()> {
    ffmpeg::init().context("初始化 FFmpeg 失败")?;
    FFMPEG_INIT.call_once(|| {
        // 只输出错误，抑制警告和信息消息
        ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);
    });
    Ok(())
}

/// 抽帧输出的 JPEG 质量
const JPEG_QUALITY: u8 = 85;

/// 基于 FFmpeg 的解码器
///
/// 帧解码使用 ffmpeg-next（阻塞调用放在 `spawn_blocking` 中），音频转码使用 ffmpeg 命令行。
#[derive(Debug, Clone)]
pub struct FfmpegDecoder {
    _initialized: (),
}

impl FfmpegDecoder {
    pub fn new() -> Result<Self> {
        init_ffmpeg()?;
        Ok(Self { _initialized: () })
    }
}

#[async_trait]
impl VideoDecoder for FfmpegDecoder {
    async fn open(&self, path: &Path) -> Result<VideoHandle> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let (fps, width, height) = read_stream_info(&path)?;
            tracing::info!(
                "🎬 [解码] 已打开视频: {} ({}x{}, {:.2} fps)",
                path.display(),
                width,
                height,
                fps
            );
            Ok(VideoHandle::new(path))
        })
        .await
        .context("解码任务异常退出")?
    }

    async fn probe(&self, video: &VideoHandle) -> Result<f64> {
        let path = video.path().to_path_buf();
        tokio::task::spawn_blocking(move || {
            let ictx = ffmpeg::format::input(&path).context("无法打开视频文件")?;
            // 时长未知（AV_NOPTS_VALUE 为负数）按 0 处理，由上层判定为无效输入
            let duration = ictx.duration().max(0);
            Ok(duration as f64 / ffmpeg::ffi::AV_TIME_BASE as f64)
        })
        .await
        .context("解码任务异常退出")?
    }

    async fn frame(&self, video: &VideoHandle, offset_seconds: u32) -> Result<Vec<u8>> {
        let path = video.path().to_path_buf();
        tokio::task::spawn_blocking(move || {
            let image = decode_frame_at(&path, offset_seconds as f64)?;
            encode_jpeg(&image, JPEG_QUALITY)
        })
        .await
        .context("解码任务异常退出")?
    }

    async fn transcode_audio(&self, video: &VideoHandle, format: AudioFormat) -> Result<Vec<u8>> {
        audio_extractor::transcode(video.path(), format).await
    }
}

/// 读取视频流信息：(帧率, 宽, 高)
fn read_stream_info(path: &Path) -> Result<(f64, u32, u32)> {
    let ictx = ffmpeg::format::input(&path).context("无法打开视频文件")?;

    let video_stream = ictx
        .streams()
        .best(ffmpeg::media::Type::Video)
        .context("未找到视频流")?;

    let decoder = ffmpeg::codec::context::Context::from_parameters(video_stream.parameters())
        .context("无法创建解码器上下文")?
        .decoder()
        .video()
        .context("无法创建视频解码器")?;

    let fps = video_stream.avg_frame_rate();
    let fps_value = if fps.denominator() > 0 {
        fps.numerator() as f64 / fps.denominator() as f64
    } else {
        30.0
    };

    Ok((fps_value, decoder.width(), decoder.height()))
}

/// seek 到目标时间之前最近的关键帧，再向后解码，取最接近目标时间的一帧
fn decode_frame_at(path: &Path, target_time: f64) -> Result<DynamicImage> {
    let mut ictx = ffmpeg::format::input(&path).context("无法打开视频文件")?;

    let (stream_index, time_base, parameters) = {
        let stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .context("未找到视频流")?;
        (stream.index(), stream.time_base(), stream.parameters())
    };

    let mut decoder = ffmpeg::codec::context::Context::from_parameters(parameters)
        .context("无法创建解码器上下文")?
        .decoder()
        .video()
        .context("无法创建视频解码器")?;

    let mut scaler = ffmpeg::software::scaling::Context::get(
        decoder.format(),
        decoder.width(),
        decoder.height(),
        ffmpeg::format::Pixel::RGB24,
        decoder.width(),
        decoder.height(),
        ffmpeg::software::scaling::Flags::BILINEAR,
    )
    .context("无法创建缩放器")?;

    let timestamp = (target_time * ffmpeg::ffi::AV_TIME_BASE as f64) as i64;
    ictx.seek(timestamp, ..timestamp)
        .context(format!("seek 到 {:.2}s 失败", target_time))?;
    decoder.flush();

    // 最多读取的数据包数，避免在损坏的文件上无限读取
    const MAX_PACKETS_TO_READ: usize = 500;

    let to_seconds = |ts: i64| {
        ts as f64 * time_base.numerator() as f64 / time_base.denominator().max(1) as f64
    };

    let mut best: Option<(f64, ffmpeg::frame::Video)> = None;
    let mut packets_read = 0;
    let mut reached = false;

    for (stream, packet) in ictx.packets() {
        if stream.index() != stream_index {
            continue;
        }
        packets_read += 1;
        if packets_read > MAX_PACKETS_TO_READ {
            break;
        }
        if decoder.send_packet(&packet).is_err() {
            continue;
        }
        if receive_closest(&mut decoder, target_time, &to_seconds, &mut best) {
            reached = true;
            break;
        }
    }

    // 数据包读完时解码器里可能还缓存着重排序的帧（B 帧），需要冲刷出来
    if !reached && decoder.send_eof().is_ok() {
        receive_closest(&mut decoder, target_time, &to_seconds, &mut best);
    }

    let (_, frame) = best.context(format!("{:.2}s 处没有可解码的帧", target_time))?;
    let mut rgb_frame = ffmpeg::frame::Video::empty();
    scaler
        .run(&frame, &mut rgb_frame)
        .context("帧格式转换失败")?;
    frame_to_image(&rgb_frame)
}

/// 取出解码器中已就绪的帧，保留离目标时间最近的一帧；越过目标时间时返回 true
fn receive_closest(
    decoder: &mut ffmpeg::codec::decoder::Video,
    target_time: f64,
    to_seconds: &impl Fn(i64) -> f64,
    best: &mut Option<(f64, ffmpeg::frame::Video)>,
) -> bool {
    let mut decoded = ffmpeg::frame::Video::empty();
    while decoder.receive_frame(&mut decoded).is_ok() {
        let frame_time = decoded.timestamp().map(to_seconds).unwrap_or(0.0);
        if is_closer(frame_time, target_time, best.as_ref().map(|(diff, _)| *diff)) {
            *best = Some(((frame_time - target_time).abs(), decoded.clone()));
        }
        // 已经越过目标时间，后面的帧只会更远
        if frame_time >= target_time {
            return true;
        }
    }
    false
}

fn is_closer(frame_time: f64, target_time: f64, best_diff: Option<f64>) -> bool {
    let diff = (frame_time - target_time).abs();
    best_diff.map_or(true, |best_diff| diff < best_diff)
}

/// RGB24 帧转 DynamicImage（按行拷贝，跳过 stride 填充）
fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<DynamicImage> {
    let width = frame.width();
    let height = frame.height();
    let stride = frame.stride(0);
    let data = frame.data(0);
    let row_bytes = width as usize * 3;

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for y in 0..height as usize {
        let start = y * stride;
        let row = data
            .get(start..start + row_bytes)
            .context("帧数据长度不足")?;
        pixels.extend_from_slice(row);
    }

    let buffer = image::RgbImage::from_raw(width, height, pixels).context("构建图像失败")?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

pub(crate) fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image
        .write_to(
            &mut Cursor::new(&mut bytes),
            image::ImageOutputFormat::Jpeg(quality),
        )
        .context("JPEG 编码失败")?;
    Ok(bytes)
}
