use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::ad_break::{AdBreakReport, AdBreakSearch};
use crate::boundary_refiner::{
    boundaries_from_shots, BoundaryRefiner, RefinementProgress, RefinementState,
};
use crate::classifier::{describe_scenes, StructuralClassifier};
use crate::collaborators::{FrameSampler, StructureAnalyzer};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    AudioSignals, ExternalAnalysis, Frame, FrameMap, Scene, SmpteMarker, Span, StructuralElement,
};
use crate::scene_grouper::SceneGrouper;
use crate::shot_grouper::ShotGrouper;
use crate::similarity::annotate_neighbours;
use crate::smpte::build_markers;
use crate::storage::{download_json, upload_json, DocumentStore};

/// 输入：帧记录
pub const FRAMES_KEY: &str = "frames.json";
/// 输入：音频停顿与响度（可选）
pub const AUDIO_KEY: &str = "audio.json";
/// 输入：预先计算的语义分析结果（可选，未配置分析服务时使用）
pub const ANALYSIS_KEY: &str = "analysis.json";

pub const SHOTS_TO_SCENES_KEY: &str = "shots_to_scenes.json";
pub const FRAME_EMBEDDINGS_KEY: &str = "frame_embeddings.json";
pub const SMPTE_ELEMENTS_KEY: &str = "smpte_elements.json";
pub const SCENE_OUTPUT_KEY: &str = "scene_output.json";
pub const AD_BREAKS_KEY: &str = "ad_breaks.json";
pub const REFINE_STATE_KEY: &str = "refine_state.json";

/// 文档位置：bucket + 路径前缀
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentLocation {
    pub bucket: String,
    pub prefix: String,
}

impl DocumentLocation {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    pub fn key(&self, name: &str) -> String {
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", prefix, name)
        }
    }
}

/// 镜头与场景的对应关系
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SceneShots {
    pub scene_id: u32,
    pub shot_range: [u32; 2],
    pub frame_range: Span,
    pub timestamp_range: Span,
    pub shots: Vec<ShotSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShotSummary {
    pub shot_id: u32,
    pub frame_range: Span,
    pub timestamp_range: Span,
}

/// 结构元素与 SMPTE 标记
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SmpteDocument {
    pub elements: Vec<StructuralElement>,
    pub markers: Vec<SmpteMarker>,
}

/// 完成时的统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSummary {
    pub frame_count: usize,
    pub shot_count: usize,
    pub scene_count: usize,
    pub element_count: usize,
    pub marker_count: usize,
    pub ad_break_count: usize,
}

/// 一次调用的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStatus {
    Completed(PipelineSummary),
    /// 边界细化未在截止时间前完成，已保存中间状态，需要再次调用
    RefinementPending { progress: RefinementProgress },
}

/// 结构分析流程驱动
pub struct StructureProcessor {
    config: PipelineConfig,
    store: Arc<dyn DocumentStore>,
    sampler: Option<Arc<dyn FrameSampler>>,
    analyzer: Option<Arc<dyn StructureAnalyzer>>,
}

impl StructureProcessor {
    pub fn new(config: PipelineConfig, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            config,
            store,
            sampler: None,
            analyzer: None,
        }
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn FrameSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn StructureAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// 处理一个节目
    ///
    /// 输出位置存在 `refine_state.json` 时视为续跑：从输出位置读取扩充后的帧记录。
    pub async fn process(
        &self,
        input: &DocumentLocation,
        output: &DocumentLocation,
        deadline: DateTime<Utc>,
    ) -> Result<PipelineStatus> {
        let store = self.store.as_ref();
        let total_start = Instant::now();
        info!(
            "🎬 [处理流程] 开始处理: {}/{}",
            input.bucket,
            input.key(FRAMES_KEY)
        );
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        // 1. 读取输入
        let load_start = Instant::now();
        let saved_state: Option<RefinementState> =
            download_json(store, &output.bucket, &output.key(REFINE_STATE_KEY)).await?;
        let frames: Vec<Frame> = if saved_state.is_some() {
            info!("⏳ [处理流程] 检测到未完成的边界细化，从上次保存的帧记录续跑");
            download_json(store, &output.bucket, &output.key(FRAME_EMBEDDINGS_KEY))
                .await?
                .context("续跑时缺少帧记录")?
        } else {
            download_json(store, &input.bucket, &input.key(FRAMES_KEY))
                .await?
                .with_context(|| format!("帧记录不存在: {}", input.key(FRAMES_KEY)))?
        };
        let audio = match download_json::<AudioSignals>(store, &input.bucket, &input.key(AUDIO_KEY))
            .await
        {
            Ok(Some(audio)) => audio,
            Ok(None) => {
                warn!("⚠️  [处理流程] 没有音频数据，跳过对白与响度标注");
                AudioSignals::default()
            }
            Err(e) => {
                warn!("⚠️  [处理流程] 音频数据无法读取，忽略: {:#}", e);
                AudioSignals::default()
            }
        };
        let mut frames = index_frames(frames)?;
        info!(
            "✅ [处理流程] 读取输入完成，耗时: {:.2}秒",
            load_start.elapsed().as_secs_f64()
        );
        info!("  • 帧数: {}", frames.len());

        // 2. 标注音频与相邻帧相似度
        audio.annotate_frames(frames.values_mut());
        annotate_neighbours(frames.values_mut(), false)?;

        // 3. 镜头分组
        let shot_start = Instant::now();
        let shot_grouper = ShotGrouper::new(
            self.config.shot_similarity_threshold,
            self.config.shot_max_gap_millis,
        );
        let mut shots = shot_grouper.group(frames.values().cloned())?;
        info!(
            "✅ [处理流程] 镜头分组完成，耗时: {:.2}秒",
            shot_start.elapsed().as_secs_f64()
        );

        // 4. 边界细化（可能需要多次调用）
        if let Some(sampler) = &self.sampler {
            let refine_start = Instant::now();
            let mut state = saved_state
                .unwrap_or_else(|| RefinementState::new(boundaries_from_shots(&shots)));
            let refiner = BoundaryRefiner::new(
                Arc::clone(sampler),
                self.config.refine_workers,
                self.config.refine_bailout_limit,
            )
            .with_deadline_margin(chrono::Duration::milliseconds(
                self.config.refine_deadline_margin_millis as i64,
            ));

            let progress = refiner
                .refine(&mut state, &mut frames, deadline)
                .await
                .map_err(|e| {
                    error!("❌ [处理流程] 边界细化失败: {}", e);
                    e
                })?;
            info!(
                "✅ [处理流程] 边界细化本次完成 {} 个，总进度 {}%，耗时: {:.2}秒",
                progress.processed_this_run,
                progress.progress_percent,
                refine_start.elapsed().as_secs_f64()
            );

            upload_json(store, &output.bucket, &output.key(REFINE_STATE_KEY), &state).await?;
            if !progress.complete {
                let frame_list: Vec<&Frame> = frames.values().collect();
                upload_json(
                    store,
                    &output.bucket,
                    &output.key(FRAME_EMBEDDINGS_KEY),
                    &frame_list,
                )
                .await?;
                info!(
                    "⏸️  [处理流程] 边界细化未完成（{}/{}），已保存中间状态",
                    progress.processed_count, progress.total_count
                );
                return Ok(PipelineStatus::RefinementPending { progress });
            }

            // 用扩充后的帧重新分组
            shots = shot_grouper.group(frames.values().cloned())?;
        } else {
            warn!("⚠️  [处理流程] 未配置抽帧服务，跳过边界细化");
        }

        // 5. 场景分组
        let scene_start = Instant::now();
        let mut scenes = SceneGrouper::new(
            self.config.scene_similarity_threshold,
            self.config.scene_max_gap_millis,
        )
        .group(shots.clone())?;
        info!(
            "✅ [处理流程] 场景分组完成，耗时: {:.2}秒",
            scene_start.elapsed().as_secs_f64()
        );

        // 6. 语义分析与结构分类
        let classify_start = Instant::now();
        let analysis = self.fetch_analysis(&scenes, input).await;
        let elements = StructuralClassifier::new(self.config.validate_temporal_order)
            .classify(&mut scenes, analysis.as_ref())?;
        let markers = build_markers(&elements, &scenes)?;
        info!(
            "✅ [处理流程] 结构分类完成，耗时: {:.2}秒",
            classify_start.elapsed().as_secs_f64()
        );

        // 7. 广告插入点
        let ad_start = Instant::now();
        let report = AdBreakSearch::new(
            self.config.break_interval_millis,
            self.config.break_offset_millis,
            self.config.ad_similarity_ceiling,
        )
        .search(&scenes, &markers, &audio)?;
        info!(
            "✅ [处理流程] 广告插入点搜索完成，耗时: {:.2}秒",
            ad_start.elapsed().as_secs_f64()
        );

        // 8. 写出结果
        let summary = PipelineSummary {
            frame_count: frames.len(),
            shot_count: shots.len(),
            scene_count: scenes.len(),
            element_count: elements.len(),
            marker_count: markers.len(),
            ad_break_count: report.candidates.len(),
        };
        self.write_outputs(output, &frames, &scenes, elements, markers, &report)
            .await?;

        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!(
            "🎉 [处理流程] 处理完成，总耗时: {:.2}秒",
            total_start.elapsed().as_secs_f64()
        );
        info!("  • 镜头数: {}", summary.shot_count);
        info!("  • 场景数: {}", summary.scene_count);
        info!("  • 结构元素: {}", summary.element_count);
        info!("  • 广告插入点: {}", summary.ad_break_count);

        Ok(PipelineStatus::Completed(summary))
    }

    /// 获取语义分析结果，失败只记录警告
    async fn fetch_analysis(
        &self,
        scenes: &[Scene],
        input: &DocumentLocation,
    ) -> Option<ExternalAnalysis> {
        if let Some(analyzer) = &self.analyzer {
            let descriptions = describe_scenes(scenes);
            return match analyzer
                .analyze(&descriptions, &self.config.analysis_prompt_template)
                .await
            {
                Ok(analysis) => Some(analysis),
                Err(e) => {
                    warn!("⚠️  [处理流程] 语义分析失败，仅使用已知类型: {:#}", e);
                    None
                }
            };
        }

        match download_json(self.store.as_ref(), &input.bucket, &input.key(ANALYSIS_KEY)).await {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!("⚠️  [处理流程] 语义分析结果无法读取，忽略: {:#}", e);
                None
            }
        }
    }

    async fn write_outputs(
        &self,
        output: &DocumentLocation,
        frames: &FrameMap,
        scenes: &[Scene],
        elements: Vec<StructuralElement>,
        markers: Vec<SmpteMarker>,
        report: &AdBreakReport,
    ) -> Result<()> {
        let store = self.store.as_ref();
        let bucket = &output.bucket;

        let shots_to_scenes: Vec<SceneShots> = scenes.iter().map(scene_shots).collect();
        upload_json(store, bucket, &output.key(SHOTS_TO_SCENES_KEY), &shots_to_scenes).await?;

        let frame_list: Vec<&Frame> = frames.values().collect();
        upload_json(store, bucket, &output.key(FRAME_EMBEDDINGS_KEY), &frame_list).await?;

        let smpte = SmpteDocument { elements, markers };
        upload_json(store, bucket, &output.key(SMPTE_ELEMENTS_KEY), &smpte).await?;

        upload_json(store, bucket, &output.key(SCENE_OUTPUT_KEY), scenes).await?;
        upload_json(store, bucket, &output.key(AD_BREAKS_KEY), report).await?;
        Ok(())
    }
}

/// 校验帧号严格递增并建立帧表
fn index_frames(frames: Vec<Frame>) -> PipelineResult<FrameMap> {
    if frames.is_empty() {
        return Err(PipelineError::EmptyInput("frames"));
    }
    for pair in frames.windows(2) {
        if pair[1].frame_num <= pair[0].frame_num {
            return Err(PipelineError::FrameOrder {
                previous: pair[0].frame_num,
                current: pair[1].frame_num,
            });
        }
    }
    Ok(frames.into_iter().map(|f| (f.frame_num, f)).collect())
}

fn scene_shots(scene: &Scene) -> SceneShots {
    SceneShots {
        scene_id: scene.scene_id,
        shot_range: scene.shot_range,
        frame_range: scene.frame_range,
        timestamp_range: scene.timestamp_range,
        shots: scene
            .shots
            .iter()
            .map(|shot| ShotSummary {
                shot_id: shot.shot_id,
                frame_range: shot.frame_range,
                timestamp_range: shot.timestamp_range,
            })
            .collect(),
    }
}
