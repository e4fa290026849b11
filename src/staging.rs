use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{StagingError, StagingOp};
use crate::oss_client::ObjectStore;
use crate::temp_file::TempFile;

/// 已上传到对象存储的产物
///
/// `remote_key` 是上传时实际使用的键，删除时原样使用；
/// 本地文件随本结构一起释放。
#[derive(Debug)]
pub struct StagedArtifact {
    local: TempFile,
    remote_key: String,
    remote_url: String,
}

impl StagedArtifact {
    pub fn remote_key(&self) -> &str {
        &self.remote_key
    }

    pub fn remote_url(&self) -> &str {
        &self.remote_url
    }
}

/// 产物在对象存储中的命名空间：`{prefix}/{owner}/{run}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    root: String,
}

impl KeySpace {
    pub fn new(prefix: &str, owner_id: &str, run_id: &str) -> Self {
        let mut root = String::new();
        let prefix = prefix.trim_matches('/');
        if !prefix.is_empty() {
            root.push_str(prefix);
            root.push('/');
        }
        root.push_str(&sanitize_segment(owner_id));
        if !run_id.is_empty() {
            root.push('/');
            root.push_str(&sanitize_segment(run_id));
        }
        Self { root }
    }

    pub fn frame(&self, offset_seconds: u32) -> String {
        format!("{}/{}.jpg", self.root, offset_seconds)
    }

    pub fn audio(&self, extension: &str) -> String {
        format!("{}/audio.{}", self.root, extension)
    }

    pub fn image(&self, unique: &str, file_name: &str) -> String {
        format!("{}/images/{}_{}", self.root, unique, sanitize_segment(file_name))
    }
}

/// 键中只保留 `[A-Za-z0-9._-]`，其他字符替换为 `_`
pub fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// 暂存：把本地产物上传到对象存储，得到分析服务可访问的 URL
#[derive(Clone)]
pub struct StagingStore {
    store: Arc<dyn ObjectStore>,
}

impl StagingStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub async fn put(&self, local: TempFile, key: String) -> Result<StagedArtifact, StagingError> {
        let body = tokio::fs::read(local.path())
            .await
            .map_err(|source| StagingError::Read {
                path: local.path().to_path_buf(),
                source,
            })?;
        let content_type = guess_content_type(&key);

        let remote_url = self
            .store
            .put_object(&key, body, content_type)
            .await
            .map_err(|e| StagingError::Store {
                op: StagingOp::Put,
                key: key.clone(),
                reason: format!("{:#}", e),
            })?;

        debug!("📤 [暂存] 已上传: {}", key);
        Ok(StagedArtifact {
            local,
            remote_key: key,
            remote_url,
        })
    }

    /// 删除已暂存的对象；失败只记录日志，由调用方决定是否上报
    pub async fn delete(&self, artifact: StagedArtifact) -> Result<(), StagingError> {
        let StagedArtifact {
            local, remote_key, ..
        } = artifact;
        drop(local);

        match self.store.delete_object(&remote_key).await {
            Ok(()) => {
                debug!("🗑️  [暂存] 已删除: {}", remote_key);
                Ok(())
            }
            Err(e) => {
                warn!("⚠️  [暂存] 删除对象失败，对象将残留: {} - {:#}", remote_key, e);
                Err(StagingError::Store {
                    op: StagingOp::Delete,
                    key: remote_key,
                    reason: format!("{:#}", e),
                })
            }
        }
    }
}

/// 根据文件扩展名猜测 Content-Type
pub fn guess_content_type(object_key: &str) -> &'static str {
    let ext = Path::new(object_key)
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "aac" => "audio/aac",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        puts: Mutex<Vec<(String, Vec<u8>, String)>>,
        deletes: Mutex<Vec<String>>,
        fail_delete: bool,
    }

    #[async_trait]
    impl ObjectStore for RecordingStore {
        async fn put_object(
            &self,
            key: &str,
            body: Vec<u8>,
            content_type: &str,
        ) -> anyhow::Result<String> {
            self.puts
                .lock()
                .unwrap()
                .push((key.to_string(), body, content_type.to_string()));
            Ok(format!("https://store.test/{}", key))
        }

        async fn delete_object(&self, key: &str) -> anyhow::Result<()> {
            self.deletes.lock().unwrap().push(key.to_string());
            if self.fail_delete {
                anyhow::bail!("store unreachable");
            }
            Ok(())
        }
    }

    #[test]
    fn key_space_is_namespaced_by_owner_and_run() {
        let keys = KeySpace::new("/assets/video/", "user@example.com", "run1");
        assert_eq!(keys.frame(7), "assets/video/user_example.com/run1/7.jpg");
        assert_eq!(keys.audio("aac"), "assets/video/user_example.com/run1/audio.aac");
        assert_eq!(
            keys.image("abc", "my photo.png"),
            "assets/video/user_example.com/run1/images/abc_my_photo.png"
        );
    }

    #[test]
    fn sanitize_never_returns_empty_or_dot_segments() {
        assert_eq!(sanitize_segment(""), "_");
        assert_eq!(sanitize_segment(".."), "_");
        assert_eq!(sanitize_segment("../etc"), "_etc");
    }

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(guess_content_type("a/1.jpg"), "image/jpeg");
        assert_eq!(guess_content_type("a/audio.AAC"), "audio/aac");
        assert_eq!(guess_content_type("a/blob"), "application/octet-stream");
    }

    #[tokio::test]
    async fn put_then_delete_uses_recorded_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordingStore::default());
        let staging = StagingStore::new(store.clone());

        let local = TempFile::write_in(dir.path(), "frame_", ".jpg", b"jpeg").await.unwrap();
        let local_path = local.path().to_path_buf();
        let artifact = staging.put(local, "k/1.jpg".to_string()).await.unwrap();
        assert_eq!(artifact.remote_url(), "https://store.test/k/1.jpg");
        assert!(local_path.exists());

        staging.delete(artifact).await.unwrap();
        assert!(!local_path.exists());

        let puts = store.puts.lock().unwrap();
        assert_eq!(puts[0].1, b"jpeg");
        assert_eq!(puts[0].2, "image/jpeg");
        assert_eq!(*store.deletes.lock().unwrap(), vec!["k/1.jpg".to_string()]);
    }

    #[tokio::test]
    async fn delete_failure_is_reported_and_local_file_still_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordingStore {
            fail_delete: true,
            ..Default::default()
        });
        let staging = StagingStore::new(store);

        let local = TempFile::write_in(dir.path(), "frame_", ".jpg", b"jpeg").await.unwrap();
        let local_path = local.path().to_path_buf();
        let artifact = staging.put(local, "k/2.jpg".to_string()).await.unwrap();

        let err = staging.delete(artifact).await.unwrap_err();
        assert_eq!(err.op(), StagingOp::Delete);
        assert!(!local_path.exists());
    }
}
