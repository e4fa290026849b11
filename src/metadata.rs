use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// 远程分析服务返回的 JSON 对象，按原样保留
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnalysisPayload(Map<String, Value>);

impl AnalysisPayload {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// 图片标签（视觉分析结果）
    pub fn labels(&self) -> Vec<&str> {
        self.0
            .get("labels")
            .and_then(Value::as_array)
            .map(|labels| labels.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// 转写文本（音频分析结果）
    pub fn transcript(&self) -> Option<&str> {
        self.0.get("transcript").and_then(Value::as_str)
    }
}

/// 视觉分析响应结构
///
/// 已知字段做类型校验，其他字段通过 `extra` 原样保留。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageAnnotations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 转写服务响应结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 响应结构类型，在 HTTP 边界上校验
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSchema {
    Image,
    Transcript,
}

impl ResponseSchema {
    /// 校验并转换为 payload；非对象或已知字段类型不符时返回错误
    pub fn validate(self, value: Value) -> Result<AnalysisPayload, String> {
        if !value.is_object() {
            return Err(format!("expected a JSON object, got {}", kind_of(&value)));
        }
        let normalized = match self {
            ResponseSchema::Image => serde_json::from_value::<ImageAnnotations>(value)
                .and_then(serde_json::to_value),
            ResponseSchema::Transcript => serde_json::from_value::<Transcript>(value)
                .and_then(serde_json::to_value),
        }
        .map_err(|e| e.to_string())?;

        match normalized {
            Value::Object(fields) => Ok(AnalysisPayload(fields)),
            other => Err(format!("expected a JSON object, got {}", kind_of(&other))),
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 单个产物的分析结果
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisResult {
    Success(AnalysisPayload),
    Failure(String),
}

impl AnalysisResult {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AnalysisResult::Success(_))
    }

    pub fn payload(&self) -> Option<&AnalysisPayload> {
        match self {
            AnalysisResult::Success(payload) => Some(payload),
            AnalysisResult::Failure(_) => None,
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            AnalysisResult::Success(_) => None,
            AnalysisResult::Failure(reason) => Some(reason),
        }
    }
}

/// 成功时输出 payload 本身，失败时输出 `{"error": reason}`
impl Serialize for AnalysisResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            AnalysisResult::Success(payload) => payload.serialize(serializer),
            AnalysisResult::Failure(reason) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("error", reason)?;
                map.end()
            }
        }
    }
}

/// 某一秒的帧结果
#[derive(Debug, Clone, PartialEq)]
pub struct FrameResult {
    /// 从 1 开始的秒数
    pub offset_seconds: u32,
    pub result: AnalysisResult,
}

/// 一次管线运行的最终结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    #[serde(rename = "images", serialize_with = "serialize_frames")]
    frames: Vec<FrameResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio: Option<AnalysisResult>,
    failed_offsets: BTreeSet<u32>,
}

fn serialize_frames<S: Serializer>(frames: &[FrameResult], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(frames.iter().map(|frame| &frame.result))
}

impl PipelineReport {
    /// 按 offset 升序整理帧结果；完成顺序不影响输出顺序
    pub fn new(mut frames: Vec<FrameResult>, audio: Option<AnalysisResult>) -> Self {
        frames.sort_by_key(|frame| frame.offset_seconds);
        let failed_offsets = frames
            .iter()
            .filter(|frame| !frame.result.is_success())
            .map(|frame| frame.offset_seconds)
            .collect();
        Self {
            frames,
            audio,
            failed_offsets,
        }
    }

    pub fn frames(&self) -> &[FrameResult] {
        &self.frames
    }

    pub fn audio(&self) -> Option<&AnalysisResult> {
        self.audio.as_ref()
    }

    pub fn failed_offsets(&self) -> &BTreeSet<u32> {
        &self.failed_offsets
    }

    pub fn success_count(&self) -> usize {
        self.frames.len() - self.failed_offsets.len()
    }
}
