use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use video_structure::{
    ConfigLoader, ConfigOverrides, DocumentLocation, HttpFrameSampler, HttpStructureAnalyzer,
    LocalDocumentStore, PipelineStatus, StructureProcessor,
};

/// 节目结构分析工具 - 镜头/场景分组、结构分类、SMPTE 标记与广告插入点
#[derive(Parser, Debug)]
#[command(name = "video-structure")]
#[command(about = "节目结构分析：镜头与场景分组、结构元素分类、广告插入点搜索", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 分析一个节目的帧记录
    Analyze {
        /// 输入目录（包含 frames.json，可选 audio.json / analysis.json）
        #[arg(short, long)]
        input: String,

        /// 输出目录（未指定时使用配置中的 output_bucket）
        #[arg(short, long)]
        output: Option<String>,

        /// 配置文件路径（可选，支持 .ini 格式）
        /// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
        #[arg(long)]
        config: Option<PathBuf>,

        /// 镜头切分相似度阈值
        /// 可通过环境变量 VIDEO_STRUCTURE_SHOT_SIMILARITY_THRESHOLD 或配置文件设置
        #[arg(long)]
        shot_threshold: Option<f32>,

        /// 场景合并相似度阈值
        #[arg(long)]
        scene_threshold: Option<f32>,

        /// 广告插入点搜索间隔（毫秒）
        #[arg(long)]
        break_interval: Option<u64>,

        /// 启用时间顺序校验
        #[arg(long)]
        validate: bool,

        /// 本次调用允许用于边界细化的时间（秒）
        #[arg(long)]
        budget_secs: Option<u64>,
    },
    /// 生成默认配置文件
    InitConfig {
        #[arg(short, long, default_value = "video-structure.ini")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Analyze {
            input,
            output,
            config: config_file,
            shot_threshold,
            scene_threshold,
            break_interval,
            validate,
            budget_secs,
        } => {
            let overrides = ConfigOverrides {
                shot_similarity_threshold: shot_threshold,
                scene_similarity_threshold: scene_threshold,
                break_interval_millis: break_interval,
                validate_temporal_order: validate.then_some(true),
                refine_budget_secs: budget_secs,
                ..ConfigOverrides::default()
            };
            let config = ConfigLoader::load_extended_config(config_file.as_deref(), overrides)
                .context("加载配置失败")?;

            // 初始化日志（RUST_LOG 优先）
            let filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
            tracing_subscriber::fmt().with_env_filter(filter).init();

            let output_bucket = output
                .or_else(|| config.output_bucket.clone())
                .context("未指定输出目录：请使用 --output 或配置 output_bucket")?;
            let input = DocumentLocation::new(input, "");
            let output = DocumentLocation::new(
                output_bucket,
                config.output_prefix.clone().unwrap_or_default(),
            );

            let pipeline = &config.pipeline;
            println!(
                "使用配置: shot_threshold={:.2}, scene_threshold={:.2}, break_interval={}ms, validate={}",
                pipeline.shot_similarity_threshold,
                pipeline.scene_similarity_threshold,
                pipeline.break_interval_millis,
                pipeline.validate_temporal_order
            );

            let timeout = std::time::Duration::from_secs(config.request_timeout_secs);
            let store = Arc::new(LocalDocumentStore::new(config.storage_root.clone()));
            let mut processor = StructureProcessor::new(pipeline.clone(), store);
            if let Some(url) = &config.sampler_url {
                processor = processor.with_sampler(Arc::new(HttpFrameSampler::new(url, timeout)));
            }
            if let Some(url) = &config.analyzer_url {
                processor =
                    processor.with_analyzer(Arc::new(HttpStructureAnalyzer::new(url, timeout)));
            }

            let deadline = Utc::now() + Duration::seconds(pipeline.refine_budget_secs as i64);
            let status = processor
                .process(&input, &output, deadline)
                .await
                .context("结构分析失败")?;

            match status {
                PipelineStatus::Completed(summary) => {
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                }
                PipelineStatus::RefinementPending { progress } => {
                    println!(
                        "边界细化未完成（{}%），请再次运行同一命令继续",
                        progress.progress_percent
                    );
                    println!("{}", serde_json::to_string_pretty(&progress)?);
                }
            }
        }
        Commands::InitConfig { path } => {
            ConfigLoader::create_default_config(&path).context("创建配置文件失败")?;
            println!("已生成默认配置文件: {}", path.display());
        }
    }

    Ok(())
}
