use anyhow::{Context, Result};
use configparser::ini::Ini;
use std::env;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::analysis_client::{RetryPolicy, ServiceConfig};
use crate::audio_extractor::AudioFormat;
use crate::oss_client::OssConfig;
use crate::processor::PipelineConfig;

const CONFIG_FILE_NAME: &str = "video-analyze.ini";

/// Web 服务配置
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// 监听地址
    pub bind: String,
    /// 上传大小上限（字节）
    pub max_upload_bytes: usize,
    /// 请求未携带 `x-user-id` 时使用的 owner
    pub default_owner: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9000".to_string(),
            max_upload_bytes: 256 * 1024 * 1024,
            default_owner: "anonymous".to_string(),
        }
    }
}

/// 完整的应用配置
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
    pub storage: OssConfig,
    pub analysis: ServiceConfig,
    /// 未配置时不做音频转写
    pub transcription: Option<ServiceConfig>,
    pub server: ServerConfig,
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
}

/// 命令行参数覆盖项
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind: Option<String>,
    pub audio_enabled: Option<bool>,
    pub max_concurrent_frames: Option<usize>,
    pub log_level: Option<String>,
}

/// 单个配置来源的读取：环境变量优先，其次 INI 文件
struct Sources<'a, E> {
    env: E,
    ini: Option<&'a Ini>,
}

impl<'a, E> Sources<'a, E>
where
    E: Fn(&str) -> Option<String>,
{
    fn raw(&self, env_names: &[&str], section: &str, key: &str) -> Option<String> {
        env_names
            .iter()
            .find_map(|name| (self.env)(name))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .or_else(|| {
                self.ini
                    .and_then(|ini| ini.get(section, key))
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
            })
    }

    fn parsed<T>(&self, env_names: &[&str], section: &str, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.raw(env_names, section, key) {
            Some(value) => value
                .parse::<T>()
                .map(Some)
                .map_err(|e| anyhow::anyhow!("配置项 {}.{} 的值无效: {:?} ({})", section, key, value, e)),
            None => Ok(None),
        }
    }

    fn flag(&self, env_names: &[&str], section: &str, key: &str) -> Result<Option<bool>> {
        match self.raw(env_names, section, key) {
            Some(value) => parse_bool(&value)
                .map(Some)
                .with_context(|| format!("配置项 {}.{} 的值无效: {:?}", section, key, value)),
            None => Ok(None),
        }
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => anyhow::bail!("无法解析为布尔值: {}", other),
    }
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    pub fn load(config_file: Option<&Path>, overrides: ConfigOverrides) -> Result<AppConfig> {
        let ini = match config_file {
            Some(path) => Some(Self::read_ini(path)?),
            None => match Self::find_default_config() {
                Some(path) => {
                    tracing::debug!("使用配置文件: {}", path.display());
                    Some(Self::read_ini(&path)?)
                }
                None => None,
            },
        };
        Self::load_from_sources(overrides, |name| env::var(name).ok(), ini.as_ref())
    }

    /// 合并各来源；环境变量通过 `env` 读取，便于测试时替换
    pub fn load_from_sources<E>(
        overrides: ConfigOverrides,
        env: E,
        ini: Option<&Ini>,
    ) -> Result<AppConfig>
    where
        E: Fn(&str) -> Option<String>,
    {
        let src = Sources { env, ini };
        let defaults = PipelineConfig::default();
        let server_defaults = ServerConfig::default();

        // [pipeline]
        let max_attempts = src
            .parsed::<u32>(&["VIDEO_ANALYZE_MAX_ATTEMPTS"], "pipeline", "max_attempts")?
            .unwrap_or(defaults.retry.max_attempts);
        if max_attempts == 0 {
            anyhow::bail!("pipeline.max_attempts 必须大于 0");
        }
        let retry_delay_secs = src
            .parsed::<u64>(&["VIDEO_ANALYZE_RETRY_DELAY_SECS"], "pipeline", "retry_delay_secs")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.retry.delay);
        let max_concurrent_frames = match overrides.max_concurrent_frames {
            Some(n) => n,
            None => src
                .parsed::<usize>(&["VIDEO_ANALYZE_CONCURRENCY"], "pipeline", "max_concurrent_frames")?
                .unwrap_or(defaults.max_concurrent_frames),
        }
        .max(1);
        let audio_enabled = match overrides.audio_enabled {
            Some(enabled) => enabled,
            None => src
                .flag(&["VIDEO_ANALYZE_AUDIO"], "pipeline", "audio_enabled")?
                .unwrap_or(defaults.audio_enabled),
        };

        let pipeline = PipelineConfig {
            max_duration_secs: src
                .parsed::<f64>(&["VIDEO_ANALYZE_MAX_DURATION"], "pipeline", "max_duration_secs")?
                .unwrap_or(defaults.max_duration_secs),
            retry: RetryPolicy {
                max_attempts,
                delay: retry_delay_secs,
            },
            max_concurrent_frames,
            audio_enabled,
            audio_format: src
                .parsed::<AudioFormat>(&["VIDEO_ANALYZE_AUDIO_FORMAT"], "pipeline", "audio_format")?
                .unwrap_or(defaults.audio_format),
            transcription_attempts: src
                .parsed::<u32>(&[], "pipeline", "transcription_attempts")?
                .unwrap_or(defaults.transcription_attempts)
                .max(1),
            key_prefix: src
                .raw(&["VIDEO_ANALYZE_KEY_PREFIX"], "pipeline", "key_prefix")
                .unwrap_or(defaults.key_prefix),
            temp_root: src
                .raw(&["VIDEO_ANALYZE_TEMP_DIR"], "pipeline", "temp_dir")
                .map(PathBuf::from),
        };

        // 必需项：缺失时一次性列出
        let mut missing = Vec::new();
        let mut required = |value: Option<String>, name: &str| {
            if value.is_none() {
                missing.push(name.to_string());
            }
            value.unwrap_or_default()
        };

        // [oss]
        let storage = OssConfig {
            bucket: required(src.raw(&["OSS_BUCKET"], "oss", "bucket"), "oss.bucket (OSS_BUCKET)"),
            endpoint: required(
                src.raw(&["OSS_ENDPOINT"], "oss", "endpoint"),
                "oss.endpoint (OSS_ENDPOINT)",
            ),
            access_key_id: required(
                src.raw(&["ALIBABA_CLOUD_ACCESS_KEY_ID"], "oss", "access_key_id"),
                "oss.access_key_id (ALIBABA_CLOUD_ACCESS_KEY_ID)",
            ),
            access_key_secret: required(
                src.raw(&["ALIBABA_CLOUD_ACCESS_KEY_SECRET"], "oss", "access_key_secret"),
                "oss.access_key_secret (ALIBABA_CLOUD_ACCESS_KEY_SECRET)",
            ),
            security_token: src.raw(&["ALIBABA_CLOUD_SECURITY_TOKEN"], "oss", "security_token"),
            public_base_url: src.raw(&["OSS_PUBLIC_BASE_URL"], "oss", "public_base_url"),
            url_expiry: src
                .parsed::<u64>(&["OSS_URL_EXPIRY_SECS"], "oss", "url_expiry_secs")?
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            timeout: Duration::from_secs(
                src.parsed::<u64>(&[], "oss", "timeout_secs")?.unwrap_or(60),
            ),
        };

        // [analysis]
        let analysis = ServiceConfig {
            endpoint: required(
                src.raw(&["ANALYSIS_URL", "LAMBDA_URL"], "analysis", "url"),
                "analysis.url (ANALYSIS_URL)",
            ),
            api_key: src.raw(&["ANALYSIS_API_KEY"], "analysis", "api_key"),
            timeout: Duration::from_secs(
                src.parsed::<u64>(&[], "analysis", "timeout_secs")?.unwrap_or(30),
            ),
        };

        if !missing.is_empty() {
            anyhow::bail!("缺少必需配置: {}", missing.join(", "));
        }

        // [transcription]
        let transcription = match src.raw(&["TRANSCRIPTION_URL"], "transcription", "url") {
            Some(endpoint) => Some(ServiceConfig {
                endpoint,
                api_key: src.raw(&["TRANSCRIPTION_API_KEY"], "transcription", "api_key"),
                timeout: Duration::from_secs(
                    src.parsed::<u64>(&[], "transcription", "timeout_secs")?
                        .unwrap_or(120),
                ),
            }),
            None => None,
        };
        if pipeline.audio_enabled && transcription.is_none() {
            anyhow::bail!("开启音频分析需要配置 transcription.url (TRANSCRIPTION_URL)");
        }

        // [server]
        let bind = match overrides.bind {
            Some(bind) => bind,
            None => match src.parsed::<u16>(&["FC_SERVER_PORT"], "server", "port")? {
                Some(port) => format!("0.0.0.0:{}", port),
                None => src
                    .raw(&[], "server", "bind")
                    .unwrap_or(server_defaults.bind),
            },
        };
        let server = ServerConfig {
            bind,
            max_upload_bytes: src
                .parsed::<usize>(&[], "server", "max_upload_mb")?
                .map(|mb| mb * 1024 * 1024)
                .unwrap_or(server_defaults.max_upload_bytes),
            default_owner: src
                .raw(&[], "server", "default_owner")
                .unwrap_or(server_defaults.default_owner),
        };

        // [logging]
        let log_level = overrides
            .log_level
            .or_else(|| src.raw(&["LOG_LEVEL"], "logging", "level"))
            .unwrap_or_else(|| "info".to_string());

        Ok(AppConfig {
            pipeline,
            storage,
            analysis,
            transcription,
            server,
            log_level,
        })
    }

    /// 读取 INI 配置文件
    pub fn read_ini(config_path: &Path) -> Result<Ini> {
        if !config_path.exists() {
            anyhow::bail!("配置文件不存在: {}", config_path.display());
        }
        let mut ini = Ini::new();
        ini.load(config_path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;
        Ok(ini)
    }

    /// 按默认位置查找配置文件
    fn find_default_config() -> Option<PathBuf> {
        let mut candidates = vec![
            PathBuf::from(CONFIG_FILE_NAME),
            PathBuf::from(format!(".{}", CONFIG_FILE_NAME)),
        ];
        if let Some(home) = env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(format!(".{}", CONFIG_FILE_NAME)));
        }
        candidates.push(PathBuf::from("/etc").join(CONFIG_FILE_NAME));

        candidates.into_iter().find(|path| path.exists())
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let defaults = PipelineConfig::default();
        let server = ServerConfig::default();
        let mut ini = Ini::new();
        let mut set = |section: &str, key: &str, value: String| {
            ini.set(section, key, Some(value));
        };

        set("pipeline", "max_duration_secs", format!("{}", defaults.max_duration_secs));
        set("pipeline", "max_attempts", defaults.retry.max_attempts.to_string());
        set("pipeline", "retry_delay_secs", defaults.retry.delay.as_secs().to_string());
        set("pipeline", "max_concurrent_frames", defaults.max_concurrent_frames.to_string());
        set("pipeline", "audio_enabled", defaults.audio_enabled.to_string());
        set("pipeline", "audio_format", defaults.audio_format.extension().to_string());
        set("pipeline", "transcription_attempts", defaults.transcription_attempts.to_string());
        set("pipeline", "key_prefix", defaults.key_prefix);
        set("pipeline", "temp_dir", String::new());

        set("oss", "bucket", String::new());
        set("oss", "endpoint", String::new());
        set("oss", "access_key_id", String::new());
        set("oss", "access_key_secret", String::new());
        set("oss", "security_token", String::new());
        set("oss", "public_base_url", String::new());
        set("oss", "url_expiry_secs", String::new());
        set("oss", "timeout_secs", "60".to_string());

        set("analysis", "url", String::new());
        set("analysis", "api_key", String::new());
        set("analysis", "timeout_secs", "30".to_string());

        set("transcription", "url", String::new());
        set("transcription", "api_key", String::new());
        set("transcription", "timeout_secs", "120".to_string());

        set("server", "bind", server.bind);
        set("server", "max_upload_mb", (server.max_upload_bytes / 1024 / 1024).to_string());
        set("server", "default_owner", server.default_owner);

        set("logging", "level", "info".to_string());

        if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("创建目录失败: {}", parent.display()))?;
        }
        ini.write(config_path)
            .with_context(|| format!("写入配置文件失败: {}", config_path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn required_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("OSS_BUCKET", "media"),
            ("OSS_ENDPOINT", "oss-cn-hangzhou.aliyuncs.com"),
            ("ALIBABA_CLOUD_ACCESS_KEY_ID", "id"),
            ("ALIBABA_CLOUD_ACCESS_KEY_SECRET", "secret"),
            ("ANALYSIS_URL", "https://vision.test/analyze"),
        ])
    }

    fn load(
        env: &HashMap<&'static str, &'static str>,
        ini: Option<&Ini>,
        overrides: ConfigOverrides,
    ) -> Result<AppConfig> {
        ConfigLoader::load_from_sources(overrides, |name| env.get(name).map(|v| v.to_string()), ini)
    }

    fn ini(contents: &str) -> Ini {
        let mut ini = Ini::new();
        ini.read(contents.to_string()).unwrap();
        ini
    }

    #[test]
    fn defaults_apply_when_only_required_values_are_set() {
        let config = load(&required_env(), None, ConfigOverrides::default()).unwrap();

        assert_eq!(config.pipeline.max_duration_secs, 120.0);
        assert_eq!(config.pipeline.retry.max_attempts, 3);
        assert_eq!(config.pipeline.retry.delay, Duration::from_secs(5));
        assert_eq!(config.pipeline.max_concurrent_frames, 4);
        assert!(!config.pipeline.audio_enabled);
        assert_eq!(config.pipeline.key_prefix, "assets/video-analyze");
        assert!(config.transcription.is_none());
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.server.max_upload_bytes, 256 * 1024 * 1024);
        assert_eq!(config.server.default_owner, "anonymous");
        assert_eq!(config.storage.timeout, Duration::from_secs(60));
        assert!(config.storage.url_expiry.is_none());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn cli_beats_env_beats_file() {
        let mut env = required_env();
        env.insert("VIDEO_ANALYZE_CONCURRENCY", "6");
        env.insert("VIDEO_ANALYZE_MAX_ATTEMPTS", "5");
        let file = ini(
            "[pipeline]\nmax_concurrent_frames = 2\nmax_attempts = 2\nretry_delay_secs = 1\n\
             [logging]\nlevel = debug\n",
        );

        let config = load(
            &env,
            Some(&file),
            ConfigOverrides {
                max_concurrent_frames: Some(8),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(config.pipeline.max_concurrent_frames, 8);
        assert_eq!(config.pipeline.retry.max_attempts, 5);
        assert_eq!(config.pipeline.retry.delay, Duration::from_secs(1));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn log_level_flag_beats_env_and_file() {
        let mut env = required_env();
        env.insert("LOG_LEVEL", "warn");
        let file = ini("[logging]\nlevel = debug\n");

        let from_env = load(&env, Some(&file), ConfigOverrides::default()).unwrap();
        assert_eq!(from_env.log_level, "warn");

        let from_flag = load(
            &env,
            Some(&file),
            ConfigOverrides {
                log_level: Some("trace".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(from_flag.log_level, "trace");
    }

    #[test]
    fn required_values_can_come_from_file() {
        let file = ini(
            "[oss]\nbucket = media\nendpoint = oss.test\naccess_key_id = id\naccess_key_secret = s\n\
             url_expiry_secs = 600\n[analysis]\nurl = https://vision.test\napi_key = k\n",
        );
        let config = load(&HashMap::new(), Some(&file), ConfigOverrides::default()).unwrap();
        assert_eq!(config.storage.bucket, "media");
        assert_eq!(config.storage.url_expiry, Some(Duration::from_secs(600)));
        assert_eq!(config.analysis.api_key.as_deref(), Some("k"));
    }

    #[test]
    fn missing_required_values_are_listed() {
        let err = load(&HashMap::new(), None, ConfigOverrides::default()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("oss.bucket"));
        assert!(message.contains("analysis.url"));
    }

    #[test]
    fn legacy_lambda_url_is_accepted() {
        let mut env = required_env();
        env.remove("ANALYSIS_URL");
        env.insert("LAMBDA_URL", "https://lambda.test");
        let config = load(&env, None, ConfigOverrides::default()).unwrap();
        assert_eq!(config.analysis.endpoint, "https://lambda.test");
    }

    #[test]
    fn fc_server_port_sets_bind_unless_cli_overrides() {
        let mut env = required_env();
        env.insert("FC_SERVER_PORT", "9100");
        let config = load(&env, None, ConfigOverrides::default()).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9100");

        let config = load(
            &env,
            None,
            ConfigOverrides {
                bind: Some("127.0.0.1:8080".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
    }

    #[test]
    fn audio_requires_transcription_service() {
        let mut env = required_env();
        env.insert("VIDEO_ANALYZE_AUDIO", "true");
        assert!(load(&env, None, ConfigOverrides::default()).is_err());

        env.insert("TRANSCRIPTION_URL", "https://speech.test");
        env.insert("VIDEO_ANALYZE_AUDIO_FORMAT", "mp3");
        let config = load(&env, None, ConfigOverrides::default()).unwrap();
        assert!(config.pipeline.audio_enabled);
        assert_eq!(config.pipeline.audio_format, AudioFormat::Mp3);
        assert_eq!(
            config.transcription.unwrap().timeout,
            Duration::from_secs(120)
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut env = required_env();
        env.insert("VIDEO_ANALYZE_MAX_DURATION", "two minutes");
        let err = load(&env, None, ConfigOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("pipeline.max_duration_secs"));

        let mut env = required_env();
        env.insert("VIDEO_ANALYZE_MAX_ATTEMPTS", "0");
        assert!(load(&env, None, ConfigOverrides::default()).is_err());
    }

    #[test]
    fn default_config_file_round_trips_through_loader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join(CONFIG_FILE_NAME);
        ConfigLoader::create_default_config(&path).unwrap();

        let file = ConfigLoader::read_ini(&path).unwrap();
        assert_eq!(file.get("server", "bind").as_deref(), Some("0.0.0.0:9000"));

        let config = load(&required_env(), Some(&file), ConfigOverrides::default()).unwrap();
        assert_eq!(config.pipeline.max_concurrent_frames, 4);
        assert_eq!(config.server.max_upload_bytes, 256 * 1024 * 1024);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ConfigLoader::read_ini(&dir.path().join("nope.ini")).is_err());
    }
}
