use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    AdBreakCandidate, AudioSignals, KnownType, Scene, SmpteMarker, Span, StructuralType,
};
use crate::similarity::{intervals_intersect, max_cross_similarity};
use crate::smpte::{type_for_label, FIRST_FRAME_OF_COMPOSITION, LAST_FRAME_OF_COMPOSITION};

/// 广告插入点搜索结果，按时间升序
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdBreakReport {
    pub candidates: Vec<AdBreakCandidate>,
}

impl AdBreakReport {
    /// 按名次排列的候选
    pub fn ranked(&self) -> Vec<&AdBreakCandidate> {
        let mut ranked: Vec<&AdBreakCandidate> = self.candidates.iter().collect();
        ranked.sort_by_key(|c| c.ranking);
        ranked
    }
}

/// 在节目时间线上按固定间隔搜索广告插入点
pub struct AdBreakSearch {
    interval_millis: u64,
    offset_millis: u64,
    similarity_ceiling: f32,
}

/// 标记对应的种子权重
fn marker_weight(marker_type: StructuralType) -> Option<(f32, &'static str)> {
    match marker_type {
        StructuralType::BlackFrames => Some((1.0, "Blackframe marker")),
        StructuralType::Transition => Some((0.8, "Transition marker")),
        StructuralType::Title => Some((0.8, "Title marker")),
        _ => None,
    }
}

/// 已知类型场景的权重
fn known_type_weight(known_type: KnownType) -> (f32, &'static str) {
    match known_type {
        KnownType::BlackFrames => (1.0, "Blackframe scene"),
        KnownType::Monochrome => (0.8, "Monochrome scene"),
        KnownType::ColorBars => (0.3, "Colorbars scene"),
        KnownType::CountdownClock => (0.3, "Countdown scene"),
    }
}

impl AdBreakSearch {
    pub fn new(interval_millis: u64, offset_millis: u64, similarity_ceiling: f32) -> Self {
        Self {
            interval_millis,
            offset_millis,
            similarity_ceiling,
        }
    }

    /// 搜索候选插入点
    ///
    /// 每个场景最多一个候选，已有候选不会被覆盖。
    pub fn search(
        &self,
        scenes: &[Scene],
        markers: &[SmpteMarker],
        audio: &AudioSignals,
    ) -> PipelineResult<AdBreakReport> {
        if scenes.is_empty() {
            return Err(PipelineError::EmptyInput("scenes"));
        }

        let span = programme_span(scenes, markers);
        let programme: Vec<&Scene> = scenes
            .iter()
            .filter(|s| intervals_intersect(s.timestamp_range, span, true))
            .collect();
        info!(
            "🔍 [广告插入点] 节目区间 {:?}，共 {} 个场景",
            span,
            programme.len()
        );

        let mut candidates: BTreeMap<u32, AdBreakCandidate> = BTreeMap::new();

        for marker in markers {
            let marker_type = type_for_label(&marker.label)?;
            let Some((weight, reason)) = marker_weight(marker_type) else {
                continue;
            };
            let Some(scene) = programme.iter().find(|s| {
                s.frame_range[0] <= marker.frame_num && marker.frame_num <= s.frame_range[1]
            }) else {
                continue;
            };
            candidates
                .entry(scene.scene_id)
                .or_insert_with(|| candidate(scene, weight, reason, None, audio));
        }

        if self.interval_millis > 0 {
            let mut target = span[0] + self.interval_millis;
            while target <= span[1] {
                let window = [
                    target.saturating_sub(self.offset_millis),
                    target + self.offset_millis,
                ];
                let windowed: Vec<&Scene> = programme
                    .iter()
                    .copied()
                    .filter(|s| intervals_intersect(s.timestamp_range, window, true))
                    .collect();
                if windowed.is_empty() {
                    debug!("[广告插入点] 窗口 {:?} 内没有场景", window);
                } else {
                    for found in self.evaluate_window(&windowed, target, audio)? {
                        candidates.entry(found.scene_id).or_insert(found);
                    }
                }
                target += self.interval_millis;
            }
        }

        let mut candidates: Vec<AdBreakCandidate> = candidates.into_values().collect();
        rank(&mut candidates);
        info!("✅ [广告插入点] 共找到 {} 个候选", candidates.len());
        Ok(AdBreakReport { candidates })
    }

    /// 按信号强弱依次尝试，前一种信号有结果时不再尝试后面的
    fn evaluate_window(
        &self,
        windowed: &[&Scene],
        target: u64,
        audio: &AudioSignals,
    ) -> PipelineResult<Vec<AdBreakCandidate>> {
        let known: Vec<AdBreakCandidate> = windowed
            .iter()
            .filter_map(|scene| {
                let (weight, reason) = known_type_weight(scene.known_type?);
                Some(candidate(scene, weight, reason, None, audio))
            })
            .collect();
        if !known.is_empty() {
            return Ok(known);
        }

        if windowed.len() >= 2 {
            let in_range = similarity_in_range(windowed)?;
            if let Some((i, sim)) = self.lowest_below_ceiling(in_range.into_iter().map(Some)) {
                return Ok(vec![candidate(
                    windowed[i],
                    0.6,
                    "Similarity in range",
                    Some(sim),
                    audio,
                )]);
            }
        }

        let rms = windowed
            .iter()
            .map(|s| s.sim_to_previous_scene.map(|stats| stats.rms));
        if let Some((i, sim)) = self.lowest_below_ceiling(rms) {
            return Ok(vec![candidate(
                windowed[i],
                0.6,
                "Similarity to previous scene",
                Some(sim),
                audio,
            )]);
        }

        let boundary = windowed
            .iter()
            .map(|s| s.first_frame().and_then(|f| f.embed_similarity));
        if let Some((i, sim)) = self.lowest_below_ceiling(boundary) {
            return Ok(vec![candidate(
                windowed[i],
                0.5,
                "Similarity to previous frame",
                Some(sim),
                audio,
            )]);
        }

        let closest = windowed
            .iter()
            .min_by_key(|s| s.timestamp_range[0].abs_diff(target))
            .copied();
        if let Some(scene) = closest {
            let sim = scene
                .sim_to_previous_scene
                .map(|stats| stats.rms)
                .or_else(|| scene.first_frame().and_then(|f| f.embed_similarity));
            if sim.map_or(true, |s| s < self.similarity_ceiling) {
                return Ok(vec![candidate(scene, 0.2, "Closest to target", sim, audio)]);
            }
        }

        Ok(Vec::new())
    }

    /// 低于相似度上限的最小值，相同时取靠前的场景
    fn lowest_below_ceiling(
        &self,
        values: impl Iterator<Item = Option<f32>>,
    ) -> Option<(usize, f32)> {
        let mut best: Option<(usize, f32)> = None;
        for (i, value) in values.enumerate() {
            let Some(value) = value else { continue };
            if value >= self.similarity_ceiling {
                continue;
            }
            if best.map_or(true, |(_, b)| value < b) {
                best = Some((i, value));
            }
        }
        best
    }
}

/// FFOC 到 LFOC 之间的区间，没有标记时取整个时间线
fn programme_span(scenes: &[Scene], markers: &[SmpteMarker]) -> Span {
    let find = |label: &str| {
        markers
            .iter()
            .find(|m| m.label == label)
            .map(|m| m.timestamp_millis)
    };
    let start = find(FIRST_FRAME_OF_COMPOSITION)
        .unwrap_or_else(|| scenes.first().map_or(0, |s| s.timestamp_range[0]));
    let end = find(LAST_FRAME_OF_COMPOSITION)
        .unwrap_or_else(|| scenes.last().map_or(0, |s| s.timestamp_range[1]));
    [start, end.max(start)]
}

/// 窗口内每个场景与其它场景最大交叉相似度的平均值
fn similarity_in_range(windowed: &[&Scene]) -> PipelineResult<Vec<f32>> {
    let n = windowed.len();
    let mut totals = vec![0.0f32; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let sim = max_cross_similarity(windowed[i].frames(), windowed[j].frames())?
                .unwrap_or(0.0);
            totals[i] += sim;
            totals[j] += sim;
        }
    }
    Ok(totals.into_iter().map(|t| t / (n - 1) as f32).collect())
}

fn candidate(
    scene: &Scene,
    weight: f32,
    reason: &str,
    chosen_sim: Option<f32>,
    audio: &AudioSignals,
) -> AdBreakCandidate {
    let start = scene.timestamp_range[0];
    AdBreakCandidate {
        scene_id: scene.scene_id,
        timestamp_range: scene.timestamp_range,
        weight,
        reason: reason.to_string(),
        chosen_sim,
        pause: audio.pause_at(start),
        loudness_props: audio.loudness_at(start).cloned(),
        ranking: 0,
    }
}

/// 按权重降序、时间升序分配名次，再按时间升序输出
fn rank(candidates: &mut [AdBreakCandidate]) {
    candidates.sort_by(|a, b| {
        b.weight
            .total_cmp(&a.weight)
            .then(a.timestamp_range[0].cmp(&b.timestamp_range[0]))
            .then(a.scene_id.cmp(&b.scene_id))
    });
    for (i, c) in candidates.iter_mut().enumerate() {
        c.ranking = i as u32 + 1;
    }
    candidates.sort_by_key(|c| (c.timestamp_range[0], c.scene_id));
}
