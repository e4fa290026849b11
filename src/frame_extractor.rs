use std::path::Path;
use std::sync::Arc;

use crate::error::ExtractionError;
use crate::temp_file::TempFile;
use crate::video_processor::{VideoDecoder, VideoHandle};

/// 按秒抽帧，每帧写入一个临时 JPEG 文件
#[derive(Clone)]
pub struct FrameExtractor {
    decoder: Arc<dyn VideoDecoder>,
}

impl FrameExtractor {
    pub fn new(decoder: Arc<dyn VideoDecoder>) -> Self {
        Self { decoder }
    }

    pub async fn extract(
        &self,
        video: &VideoHandle,
        offset_seconds: u32,
        dir: &Path,
    ) -> Result<TempFile, ExtractionError> {
        let bytes = self
            .decoder
            .frame(video, offset_seconds)
            .await
            .map_err(|e| ExtractionError::Frame {
                offset: offset_seconds,
                reason: format!("{:#}", e),
            })?;
        if bytes.is_empty() {
            return Err(ExtractionError::Frame {
                offset: offset_seconds,
                reason: ExtractionError::Empty.to_string(),
            });
        }

        let prefix = format!("frame_{:03}_", offset_seconds);
        TempFile::write_in(dir, &prefix, ".jpg", &bytes)
            .await
            .map_err(|e| ExtractionError::Frame {
                offset: offset_seconds,
                reason: format!("failed to write frame into {}: {}", dir.display(), e),
            })
    }
}
