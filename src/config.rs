use anyhow::Result;
use configparser::ini::Ini;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// 默认配置文件名
const CONFIG_FILE_NAME: &str = "video-structure.ini";
/// 环境变量前缀
const ENV_PREFIX: &str = "VIDEO_STRUCTURE_";

const DEFAULT_PROMPT_TEMPLATE: &str = "Given the following scene descriptions of a TV episode, \
identify the programme structure (recap, intro, opening credits, title, programme, \
end credits, post credits scene) and return a listOfKeyElements with start/end in milliseconds.";

/// 结构分析流水线配置
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// 相邻帧相似度低于该值时切分镜头
    pub shot_similarity_threshold: f32,
    /// 相邻帧时间间隔超过该值（毫秒）时切分镜头
    pub shot_max_gap_millis: u64,
    pub scene_similarity_threshold: f32,
    pub scene_max_gap_millis: u64,
    /// 边界细化并发数，`None` 表示使用 CPU 核数
    pub refine_workers: Option<usize>,
    pub refine_bailout_limit: u32,
    /// 距离截止时间不足该值（毫秒）时不再领取新的边界
    pub refine_deadline_margin_millis: u64,
    /// 单次调用允许用于边界细化的时间（秒）
    pub refine_budget_secs: u64,
    /// 是否启用时间顺序校验（默认关闭）
    pub validate_temporal_order: bool,
    pub analysis_prompt_template: String,
    /// 广告插入点搜索间隔（毫秒）
    pub break_interval_millis: u64,
    /// 搜索窗口半宽（毫秒）
    pub break_offset_millis: u64,
    pub ad_similarity_ceiling: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shot_similarity_threshold: 0.85,
            shot_max_gap_millis: 3_000,
            scene_similarity_threshold: 0.70,
            scene_max_gap_millis: 5_000,
            refine_workers: None,
            refine_bailout_limit: 10,
            refine_deadline_margin_millis: 2_000,
            refine_budget_secs: 600,
            validate_temporal_order: false,
            analysis_prompt_template: DEFAULT_PROMPT_TEMPLATE.to_string(),
            break_interval_millis: 300_000,
            break_offset_millis: 150_000,
            ad_similarity_ceiling: 0.70,
        }
    }
}

/// 单个配置来源（命令行、环境变量或配置文件）提供的取值
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub shot_similarity_threshold: Option<f32>,
    pub shot_max_gap_millis: Option<u64>,
    pub scene_similarity_threshold: Option<f32>,
    pub scene_max_gap_millis: Option<u64>,
    pub refine_workers: Option<usize>,
    pub refine_bailout_limit: Option<u32>,
    pub refine_deadline_margin_millis: Option<u64>,
    pub refine_budget_secs: Option<u64>,
    pub validate_temporal_order: Option<bool>,
    pub analysis_prompt_template: Option<String>,
    pub break_interval_millis: Option<u64>,
    pub break_offset_millis: Option<u64>,
    pub ad_similarity_ceiling: Option<f32>,
}

impl ConfigOverrides {
    /// 合并两个来源，`self` 优先
    pub fn or(self, fallback: ConfigOverrides) -> ConfigOverrides {
        ConfigOverrides {
            shot_similarity_threshold: self
                .shot_similarity_threshold
                .or(fallback.shot_similarity_threshold),
            shot_max_gap_millis: self.shot_max_gap_millis.or(fallback.shot_max_gap_millis),
            scene_similarity_threshold: self
                .scene_similarity_threshold
                .or(fallback.scene_similarity_threshold),
            scene_max_gap_millis: self.scene_max_gap_millis.or(fallback.scene_max_gap_millis),
            refine_workers: self.refine_workers.or(fallback.refine_workers),
            refine_bailout_limit: self.refine_bailout_limit.or(fallback.refine_bailout_limit),
            refine_deadline_margin_millis: self
                .refine_deadline_margin_millis
                .or(fallback.refine_deadline_margin_millis),
            refine_budget_secs: self.refine_budget_secs.or(fallback.refine_budget_secs),
            validate_temporal_order: self
                .validate_temporal_order
                .or(fallback.validate_temporal_order),
            analysis_prompt_template: self
                .analysis_prompt_template
                .or(fallback.analysis_prompt_template),
            break_interval_millis: self.break_interval_millis.or(fallback.break_interval_millis),
            break_offset_millis: self.break_offset_millis.or(fallback.break_offset_millis),
            ad_similarity_ceiling: self.ad_similarity_ceiling.or(fallback.ad_similarity_ceiling),
        }
    }

    /// 未提供的字段使用默认值
    pub fn resolve(self) -> PipelineConfig {
        let defaults = PipelineConfig::default();
        PipelineConfig {
            shot_similarity_threshold: self
                .shot_similarity_threshold
                .unwrap_or(defaults.shot_similarity_threshold),
            shot_max_gap_millis: self.shot_max_gap_millis.unwrap_or(defaults.shot_max_gap_millis),
            scene_similarity_threshold: self
                .scene_similarity_threshold
                .unwrap_or(defaults.scene_similarity_threshold),
            scene_max_gap_millis: self
                .scene_max_gap_millis
                .unwrap_or(defaults.scene_max_gap_millis),
            refine_workers: self.refine_workers.or(defaults.refine_workers),
            refine_bailout_limit: self
                .refine_bailout_limit
                .unwrap_or(defaults.refine_bailout_limit),
            refine_deadline_margin_millis: self
                .refine_deadline_margin_millis
                .unwrap_or(defaults.refine_deadline_margin_millis),
            refine_budget_secs: self.refine_budget_secs.unwrap_or(defaults.refine_budget_secs),
            validate_temporal_order: self
                .validate_temporal_order
                .unwrap_or(defaults.validate_temporal_order),
            analysis_prompt_template: self
                .analysis_prompt_template
                .unwrap_or(defaults.analysis_prompt_template),
            break_interval_millis: self
                .break_interval_millis
                .unwrap_or(defaults.break_interval_millis),
            break_offset_millis: self
                .break_offset_millis
                .unwrap_or(defaults.break_offset_millis),
            ad_similarity_ceiling: self
                .ad_similarity_ceiling
                .unwrap_or(defaults.ad_similarity_ceiling),
        }
    }
}

/// 扩展配置（外部服务地址、存储位置、日志级别）
#[derive(Debug, Clone)]
pub struct ExtendedConfig {
    pub pipeline: PipelineConfig,
    /// 抽帧服务地址，未配置时跳过边界细化
    pub sampler_url: Option<String>,
    /// 语义分析服务地址，未配置时只使用已知类型
    pub analyzer_url: Option<String>,
    /// 外部服务请求超时（秒）
    pub request_timeout_secs: u64,
    /// 本地文档存储根目录
    pub storage_root: PathBuf,
    pub output_bucket: Option<String>,
    pub output_prefix: Option<String>,
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    pub fn load_config(config_file: Option<&Path>, cli: ConfigOverrides) -> Result<PipelineConfig> {
        // 1. 配置文件（显式指定的文件必须能读取）
        let file = match config_file {
            Some(path) => Some(Self::load_ini(path)?),
            None => Self::load_ini_from_default_locations(),
        };
        let file_values = file.as_ref().map(Self::overrides_from_ini).unwrap_or_default();

        // 2. 环境变量
        let env_values = Self::overrides_from_env();

        // 3. 合并
        Ok(cli.or(env_values).or(file_values).resolve())
    }

    /// 读取 `VIDEO_STRUCTURE_*` 环境变量
    fn overrides_from_env() -> ConfigOverrides {
        ConfigOverrides {
            shot_similarity_threshold: env_value("SHOT_SIMILARITY_THRESHOLD"),
            shot_max_gap_millis: env_value("SHOT_MAX_GAP_MILLIS"),
            scene_similarity_threshold: env_value("SCENE_SIMILARITY_THRESHOLD"),
            scene_max_gap_millis: env_value("SCENE_MAX_GAP_MILLIS"),
            refine_workers: env_value("REFINE_WORKERS"),
            refine_bailout_limit: env_value("REFINE_BAILOUT_LIMIT"),
            refine_deadline_margin_millis: env_value("REFINE_DEADLINE_MARGIN_MILLIS"),
            refine_budget_secs: env_value("REFINE_BUDGET_SECS"),
            validate_temporal_order: env_value("VALIDATE_TEMPORAL_ORDER"),
            analysis_prompt_template: env_value("ANALYSIS_PROMPT_TEMPLATE"),
            break_interval_millis: env_value("BREAK_INTERVAL_MILLIS"),
            break_offset_millis: env_value("BREAK_OFFSET_MILLIS"),
            ad_similarity_ceiling: env_value("AD_SIMILARITY_CEILING"),
        }
    }

    /// 从 INI 各节读取取值，缺失时回退到 [DEFAULT] 节
    fn overrides_from_ini(ini: &Ini) -> ConfigOverrides {
        ConfigOverrides {
            shot_similarity_threshold: ini_value(ini, "shot", "similarity_threshold"),
            shot_max_gap_millis: ini_value(ini, "shot", "max_gap_millis"),
            scene_similarity_threshold: ini_value(ini, "scene", "similarity_threshold"),
            scene_max_gap_millis: ini_value(ini, "scene", "max_gap_millis"),
            refine_workers: ini_value(ini, "refine", "workers"),
            refine_bailout_limit: ini_value(ini, "refine", "bailout_limit"),
            refine_deadline_margin_millis: ini_value(ini, "refine", "deadline_margin_millis"),
            refine_budget_secs: ini_value(ini, "refine", "budget_secs"),
            validate_temporal_order: ini_value(ini, "classifier", "validate_temporal_order"),
            analysis_prompt_template: ini_value(ini, "classifier", "analysis_prompt_template"),
            break_interval_millis: ini_value(ini, "ad_break", "interval_millis"),
            break_offset_millis: ini_value(ini, "ad_break", "offset_millis"),
            ad_similarity_ceiling: ini_value(ini, "ad_break", "similarity_ceiling"),
        }
    }

    fn load_ini(config_path: &Path) -> Result<Ini> {
        if !config_path.exists() {
            return Err(anyhow::anyhow!("配置文件不存在: {}", config_path.display()));
        }

        let mut config_parser = Ini::new();
        config_parser
            .load(config_path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;
        Ok(config_parser)
    }

    /// 依次尝试默认位置，找不到时返回 `None`
    fn load_ini_from_default_locations() -> Option<Ini> {
        let hidden = format!(".{}", CONFIG_FILE_NAME);
        let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME), PathBuf::from(&hidden)];
        if let Some(home) = env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(&hidden));
        }
        candidates.push(PathBuf::from("/etc").join(CONFIG_FILE_NAME));

        candidates
            .iter()
            .find(|path| path.exists())
            .and_then(|path| match Self::load_ini(path) {
                Ok(ini) => Some(ini),
                Err(e) => {
                    tracing::warn!("⚠️  忽略无法读取的配置文件: {}", e);
                    None
                }
            })
    }

    /// 加载扩展配置（外部服务、存储、日志）
    pub fn load_extended_config(
        config_file: Option<&Path>,
        cli: ConfigOverrides,
    ) -> Result<ExtendedConfig> {
        let pipeline = Self::load_config(config_file, cli)?;

        let file = match config_file {
            Some(path) => Some(Self::load_ini(path)?),
            None => Self::load_ini_from_default_locations(),
        };
        let from_file = |section: &str, key: &str| -> Option<String> {
            file.as_ref().and_then(|ini| ini_value(ini, section, key))
        };

        let sampler_url = env_value("SAMPLER_URL").or_else(|| from_file("services", "sampler_url"));
        let analyzer_url =
            env_value("ANALYZER_URL").or_else(|| from_file("services", "analyzer_url"));
        let request_timeout_secs = env_value("REQUEST_TIMEOUT_SECS")
            .or_else(|| from_file("services", "request_timeout_secs").and_then(|v| v.parse().ok()))
            .unwrap_or(60);
        let storage_root = env_value::<String>("STORAGE_ROOT")
            .or_else(|| from_file("storage", "root"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let output_bucket =
            env_value("OUTPUT_BUCKET").or_else(|| from_file("storage", "output_bucket"));
        let output_prefix =
            env_value("OUTPUT_PREFIX").or_else(|| from_file("storage", "output_prefix"));
        let log_level = env_value("LOG_LEVEL")
            .or_else(|| from_file("logging", "level"))
            .unwrap_or_else(|| "info".to_string());

        Ok(ExtendedConfig {
            pipeline,
            sampler_url,
            analyzer_url,
            request_timeout_secs,
            storage_root,
            output_bucket,
            output_prefix,
            log_level,
        })
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let defaults = PipelineConfig::default();
        let mut config_parser = Ini::new();
        let mut set = |section: &str, key: &str, value: String| {
            config_parser.set(section, key, Some(value));
        };

        set("shot", "similarity_threshold", defaults.shot_similarity_threshold.to_string());
        set("shot", "max_gap_millis", defaults.shot_max_gap_millis.to_string());
        set("scene", "similarity_threshold", defaults.scene_similarity_threshold.to_string());
        set("scene", "max_gap_millis", defaults.scene_max_gap_millis.to_string());
        set("refine", "workers", String::new());
        set("refine", "bailout_limit", defaults.refine_bailout_limit.to_string());
        set(
            "refine",
            "deadline_margin_millis",
            defaults.refine_deadline_margin_millis.to_string(),
        );
        set("refine", "budget_secs", defaults.refine_budget_secs.to_string());
        set(
            "classifier",
            "validate_temporal_order",
            defaults.validate_temporal_order.to_string(),
        );
        set("classifier", "analysis_prompt_template", defaults.analysis_prompt_template);
        set("ad_break", "interval_millis", defaults.break_interval_millis.to_string());
        set("ad_break", "offset_millis", defaults.break_offset_millis.to_string());
        set("ad_break", "similarity_ceiling", defaults.ad_similarity_ceiling.to_string());
        set("services", "sampler_url", String::new());
        set("services", "analyzer_url", String::new());
        set("services", "request_timeout_secs", "60".to_string());
        set("storage", "root", ".".to_string());
        set("storage", "output_bucket", String::new());
        set("storage", "output_prefix", String::new());
        set("logging", "level", "info".to_string());

        config_parser
            .write(config_path)
            .map_err(|e| anyhow::anyhow!("写入配置文件失败: {}: {}", config_path.display(), e))?;

        Ok(())
    }
}

fn env_value<T: FromStr>(key: &str) -> Option<T> {
    env::var(format!("{}{}", ENV_PREFIX, key))
        .ok()
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse().ok())
}

fn ini_value<T: FromStr>(ini: &Ini, section: &str, key: &str) -> Option<T> {
    ini.get(section, key)
        .or_else(|| ini.get("DEFAULT", key))
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_file(name: &str) -> PathBuf {
        env::temp_dir().join(format!("{}-{}", uuid::Uuid::new_v4(), name))
    }

    #[test]
    fn test_defaults() {
        let config = ConfigOverrides::default().resolve();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.break_interval_millis, 300_000);
        assert_eq!(config.break_offset_millis, 150_000);
        assert!(!config.validate_temporal_order);
        assert!(config.refine_workers.is_none());
    }

    #[test]
    fn test_earlier_source_wins() {
        let cli = ConfigOverrides {
            shot_similarity_threshold: Some(0.9),
            ..ConfigOverrides::default()
        };
        let file = ConfigOverrides {
            shot_similarity_threshold: Some(0.5),
            scene_max_gap_millis: Some(9_000),
            ..ConfigOverrides::default()
        };
        let config = cli.or(file).resolve();
        assert_eq!(config.shot_similarity_threshold, 0.9);
        assert_eq!(config.scene_max_gap_millis, 9_000);
        assert_eq!(config.scene_similarity_threshold, 0.70);
    }

    #[test]
    fn test_default_file_round_trip() {
        let path = scratch_file("video-structure.ini");
        ConfigLoader::create_default_config(&path).unwrap();

        let ini = ConfigLoader::load_ini(&path).unwrap();
        let config = ConfigLoader::overrides_from_ini(&ini).resolve();
        assert_eq!(config, PipelineConfig::default());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_ini_sections() {
        let path = scratch_file("custom.ini");
        std::fs::write(
            &path,
            "[shot]\nsimilarity_threshold = 0.6\n[refine]\nworkers = 3\n\
             [classifier]\nvalidate_temporal_order = true\n[ad_break]\ninterval_millis = 60000\n",
        )
        .unwrap();

        let ini = ConfigLoader::load_ini(&path).unwrap();
        let config = ConfigLoader::overrides_from_ini(&ini).resolve();
        assert_eq!(config.shot_similarity_threshold, 0.6);
        assert_eq!(config.refine_workers, Some(3));
        assert!(config.validate_temporal_order);
        assert_eq!(config.break_interval_millis, 60_000);
        assert_eq!(config.shot_max_gap_millis, 3_000);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let path = scratch_file("missing.ini");
        assert!(ConfigLoader::load_config(Some(&path), ConfigOverrides::default()).is_err());
    }
}
