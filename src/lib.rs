pub mod analysis_client;
pub mod audio_extractor;
pub mod config;
pub mod error;
pub mod frame_extractor;
pub mod handler;
pub mod image_analysis;
pub mod metadata;
pub mod oss_client;
pub mod processor;
pub mod staging;
pub mod temp_file;
pub mod video_processor;

pub use analysis_client::{AnalysisService, HttpAnalysisClient, RetryPolicy, RetryingAnalysisClient, ServiceConfig};
pub use audio_extractor::{AudioExtractor, AudioFormat};
pub use config::{AppConfig, ConfigLoader, ConfigOverrides, ServerConfig};
pub use error::{AnalysisError, ExtractionError, PipelineError, StagingError, StagingOp};
pub use frame_extractor::FrameExtractor;
pub use image_analysis::{ImageAnalyzer, ImageSource};
pub use metadata::{AnalysisPayload, AnalysisResult, FrameResult, PipelineReport};
pub use oss_client::{ObjectStore, OssClient, OssConfig};
pub use processor::{PipelineConfig, PipelineOrchestrator, VideoJob};
pub use staging::{KeySpace, StagedArtifact, StagingStore};
pub use temp_file::TempFile;
pub use video_processor::{FfmpegDecoder, VideoDecoder, VideoHandle};
