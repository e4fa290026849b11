use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// 管线级错误：只用于进入逐帧循环之前的失败
///
/// 循环开始后的所有失败都会被记录为 `AnalysisResult::Failure`，不会走到这里。
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Video duration {duration:.2}s exceeds the {limit:.0}s limit")]
    DurationExceeded { duration: f64, limit: f64 },

    #[error("{0}")]
    MissingInput(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("infrastructure failure: {0}")]
    Infrastructure(String),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error("pipeline run cancelled by caller")]
    Cancelled,
}

impl PipelineError {
    pub fn missing_input(msg: impl Into<String>) -> Self {
        Self::MissingInput(msg.into())
    }

    pub fn infrastructure(msg: impl Into<String>) -> Self {
        Self::Infrastructure(msg.into())
    }

    /// 调用方（用户）引起的错误，Web 层映射为 400
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PipelineError::DurationExceeded { .. }
                | PipelineError::MissingInput(_)
                | PipelineError::InvalidInput(_)
        )
    }
}

/// 抽帧 / 抽音频失败
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("frame extraction failed at {offset}s: {reason}")]
    Frame { offset: u32, reason: String },

    #[error("audio extraction failed: {0}")]
    Audio(String),

    #[error("decoder produced an empty artifact")]
    Empty,

    #[error("failed to write audio artifact {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// 暂存操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingOp {
    Put,
    Delete,
}

impl fmt::Display for StagingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StagingOp::Put => f.write_str("put"),
            StagingOp::Delete => f.write_str("delete"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("staging {op} failed for {key}: {reason}")]
    Store {
        op: StagingOp,
        key: String,
        reason: String,
    },

    #[error("failed to read local artifact {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StagingError {
    pub fn op(&self) -> StagingOp {
        match self {
            StagingError::Store { op, .. } => *op,
            StagingError::Read { .. } => StagingOp::Put,
        }
    }
}

/// 单次远程分析调用失败（每一种都算作一次失败的尝试）
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for AnalysisError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AnalysisError::Timeout
        } else if err.is_decode() {
            AnalysisError::InvalidResponse(err.to_string())
        } else {
            AnalysisError::Network(err.to_string())
        }
    }
}
