use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use video_analyze::{
    handler, AppConfig, ConfigLoader, ConfigOverrides, FfmpegDecoder, HttpAnalysisClient,
    ImageAnalyzer, OssClient, PipelineOrchestrator, StagingStore,
};

/// 视频内容分析工具 - 逐秒抽帧、上传、调用分析服务并汇总结果
#[derive(Parser, Debug)]
#[command(name = "video-analyze")]
#[command(about = "视频内容分析：逐秒抽帧、暂存、远程分析、汇总", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// CLI 模式：分析本地视频文件，输出 JSON 结果
    Analyze {
        /// 输入视频文件路径
        #[arg(short, long)]
        input: PathBuf,

        /// 产物所属用户（用于对象存储键）
        #[arg(long, default_value = "cli")]
        owner: String,

        /// 配置文件路径（可选，支持 .ini 格式）
        /// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
        #[arg(long)]
        config: Option<PathBuf>,

        /// 同时分析音轨（需要配置转写服务）
        #[arg(long)]
        audio: bool,

        /// 同时处理的帧数
        /// 可通过环境变量 VIDEO_ANALYZE_CONCURRENCY 或配置文件设置
        #[arg(long)]
        concurrency: Option<usize>,

        /// 日志级别（trace/debug/info/warn/error），RUST_LOG 优先
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Web 服务模式：提供 /analyzeVideo 和 /analyzeImage
    Serve {
        /// 监听地址（默认从环境变量 FC_SERVER_PORT 读取，如果不存在则使用 0.0.0.0:9000）
        #[arg(short, long)]
        bind: Option<String>,

        /// 配置文件路径
        #[arg(long)]
        config: Option<PathBuf>,

        /// 日志级别（trace/debug/info/warn/error），RUST_LOG 优先
        #[arg(long)]
        log_level: Option<String>,
    },
    /// 生成默认配置文件
    InitConfig {
        /// 输出路径
        #[arg(short, long, default_value = "video-analyze.ini")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Analyze {
            input,
            owner,
            config: config_file,
            audio,
            concurrency,
            log_level,
        } => {
            let overrides = ConfigOverrides {
                audio_enabled: audio.then_some(true),
                max_concurrent_frames: concurrency,
                log_level,
                ..Default::default()
            };
            let config = ConfigLoader::load(config_file.as_deref(), overrides)
                .context("加载配置失败")?;
            init_tracing(&config.log_level);

            let (pipeline, _) = build_services(&config)?;
            let job = pipeline.prepare(&input, &owner).await?;
            let report = pipeline.run(job, CancellationToken::new()).await?;

            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("序列化结果失败")?
            );
        }
        Commands::Serve {
            bind,
            config: config_file,
            log_level,
        } => {
            let overrides = ConfigOverrides {
                bind,
                log_level,
                ..Default::default()
            };
            let config = ConfigLoader::load(config_file.as_deref(), overrides)
                .context("加载配置失败")?;
            init_tracing(&config.log_level);
            start_web_server(&config).await?;
        }
        Commands::InitConfig { path } => {
            ConfigLoader::create_default_config(&path)?;
            println!("已生成配置文件: {}", path.display());
        }
    }

    Ok(())
}

/// 初始化日志：优先使用 RUST_LOG，其次配置中的日志级别
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// 按配置装配解码器、对象存储和分析服务
fn build_services(config: &AppConfig) -> Result<(Arc<PipelineOrchestrator>, Arc<ImageAnalyzer>)> {
    let decoder = Arc::new(FfmpegDecoder::new()?);
    let store = Arc::new(OssClient::new(config.storage.clone()).context("创建 OSS 客户端失败")?);
    let staging = StagingStore::new(store);
    let vision = Arc::new(
        HttpAnalysisClient::vision(config.analysis.clone()).context("创建分析服务客户端失败")?,
    );

    let mut pipeline = PipelineOrchestrator::new(
        config.pipeline.clone(),
        decoder,
        staging.clone(),
        vision.clone(),
    );
    if let Some(transcription) = &config.transcription {
        let client = HttpAnalysisClient::transcription(transcription.clone())
            .context("创建转写服务客户端失败")?;
        pipeline = pipeline.with_transcription(Arc::new(client));
    }

    let images = ImageAnalyzer::new(staging, vision, config.pipeline.key_prefix.clone());
    Ok((Arc::new(pipeline), Arc::new(images)))
}

async fn start_web_server(config: &AppConfig) -> Result<()> {
    let (pipeline, images) = build_services(config)?;
    let upload_dir = config
        .pipeline
        .temp_root
        .clone()
        .unwrap_or_else(std::env::temp_dir)
        .join("video-analyze-uploads");
    let state = handler::AppState::new(pipeline, images, &config.server, upload_dir)?;
    let app = handler::router(state);

    let bind = config.server.bind.as_str();
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .context(format!("绑定地址失败: {}", bind))?;

    log_endpoints(bind, config);

    axum::serve(listener, app)
        .await
        .context("启动服务器失败")?;

    Ok(())
}

fn log_endpoints(bind: &str, config: &AppConfig) {
    tracing::info!("Web 服务器启动在: http://{}", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("可用端点:");
    tracing::info!("  • 健康检查: GET  http://{}/health", bind);
    tracing::info!("  • 视频分析: POST http://{}/analyzeVideo", bind);
    tracing::info!("  • 图片分析: POST http://{}/analyzeImage", bind);
    tracing::info!(
        "  • 时长上限 {:.0}秒, 并发 {}, 音频 {}, 临时目录 {}",
        config.pipeline.max_duration_secs,
        config.pipeline.max_concurrent_frames,
        if config.pipeline.audio_enabled { "开启" } else { "关闭" },
        config
            .pipeline
            .temp_root
            .as_deref()
            .map(Path::display)
            .map(|d| d.to_string())
            .unwrap_or_else(|| "系统默认".to_string())
    );
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}
