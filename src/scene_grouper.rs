use tracing::{debug, info};

use crate::error::PipelineResult;
use crate::models::{Frame, LoudnessTag, Scene, SceneAudio, Shot};
use crate::similarity::{frame_similarity, max_cross_similarity, similarity_stats};

/// 场景分组器，把连续镜头合并为场景
pub struct SceneGrouper {
    /// 镜头边界相似度不低于该值时继续合并
    similarity_threshold: f32,
    /// 镜头边界时间间隔不超过该值（毫秒）时继续合并
    max_gap_millis: u64,
}

impl SceneGrouper {
    pub fn new(similarity_threshold: f32, max_gap_millis: u64) -> Self {
        Self {
            similarity_threshold,
            max_gap_millis,
        }
    }

    /// 分组并计算场景间相似度，`scene_id` 按数组顺序从 0 重新编号
    ///
    /// 边界细化之后用扩充过的镜头重新调用即可重新分组。
    pub fn group(&self, shots: impl IntoIterator<Item = Shot>) -> PipelineResult<Vec<Scene>> {
        let mut groups: Vec<Vec<Shot>> = Vec::new();
        let mut current: Vec<Shot> = Vec::new();

        for shot in shots {
            if let Some(previous) = current.last() {
                if !self.keeps_open(previous, &shot)? {
                    groups.push(std::mem::take(&mut current));
                }
            }
            current.push(shot);
        }
        if !current.is_empty() {
            groups.push(current);
        }

        let mut scenes: Vec<Scene> = groups
            .into_iter()
            .enumerate()
            .map(|(i, shots)| build_scene(i as u32, shots))
            .collect();

        annotate_cross_scene_similarity(&mut scenes)?;

        info!("✅ [场景分组] 共生成 {} 个场景", scenes.len());
        Ok(scenes)
    }

    /// 边界相似度足够高且时间间隔足够短时，两个镜头属于同一场景
    fn keeps_open(&self, previous: &Shot, next: &Shot) -> PipelineResult<bool> {
        let (Some(last), Some(first)) = (previous.last_frame(), next.first_frame()) else {
            return Ok(false);
        };

        let gap = first.timestamp_millis.saturating_sub(last.timestamp_millis);
        if gap > self.max_gap_millis {
            return Ok(false);
        }

        let similarity = frame_similarity(last, first)?;
        debug!(
            "[场景分组] 镜头 {} -> {} 边界相似度 {:.3}，间隔 {}ms",
            previous.shot_id, next.shot_id, similarity, gap
        );
        Ok(similarity >= self.similarity_threshold)
    }
}

fn build_scene(scene_id: u32, shots: Vec<Shot>) -> Scene {
    let first_shot = shots.first();
    let last_shot = shots.last();
    let audio = summarize_audio(shots.iter().flat_map(|s| s.frames.iter()));

    Scene {
        scene_id,
        shot_range: [
            first_shot.map_or(0, |s| s.shot_id),
            last_shot.map_or(0, |s| s.shot_id),
        ],
        frame_range: [
            first_shot.map_or(0, |s| s.frame_range[0]),
            last_shot.map_or(0, |s| s.frame_range[1]),
        ],
        timestamp_range: [
            first_shot.map_or(0, |s| s.timestamp_range[0]),
            last_shot.map_or(0, |s| s.timestamp_range[1]),
        ],
        // 多个已知类型并存时取最早出现的
        known_type: shots.iter().find_map(|s| s.known_type),
        audio,
        sim_to_previous_scene: None,
        sim_to_all_scenes: None,
        segment_type: None,
        segment_type_group: None,
        program_structure_response: None,
        shots,
    }
}

/// 汇总场景内各帧的对白与响度标签
pub fn summarize_audio<'a>(frames: impl IntoIterator<Item = &'a Frame>) -> SceneAudio {
    let mut any_dialogue = false;
    let mut any_pause = false;
    let mut tagged = 0usize;
    let mut silent = 0usize;
    let mut quiet = 0usize;

    for frame in frames {
        match frame.pause_in_dialogue {
            Some(false) => any_dialogue = true,
            Some(true) => any_pause = true,
            None => {}
        }
        if let Some(level) = frame.loudness_level {
            tagged += 1;
            if level == LoudnessTag::Silent {
                silent += 1;
            }
            if level.is_quiet() {
                quiet += 1;
            }
        }
    }

    SceneAudio {
        has_dialogue: if any_dialogue {
            Some(true)
        } else if any_pause {
            Some(false)
        } else {
            None
        },
        silent: (tagged > 0).then_some(silent == tagged),
        quiet: (tagged > 0).then_some(quiet == tagged),
    }
}

/// 场景两两之间的最大交叉相似度矩阵（对角线为 0）
pub fn cross_similarity_matrix(scenes: &[Scene]) -> PipelineResult<Vec<Vec<f32>>> {
    let n = scenes.len();
    let mut matrix = vec![vec![0.0f32; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let sim = max_cross_similarity(scenes[i].frames(), scenes[j].frames())?.unwrap_or(0.0);
            matrix[i][j] = sim;
            matrix[j][i] = sim;
        }
    }
    Ok(matrix)
}

/// 计算 `sim_to_previous_scene` 与 `sim_to_all_scenes`
pub fn annotate_cross_scene_similarity(scenes: &mut [Scene]) -> PipelineResult<()> {
    let matrix = cross_similarity_matrix(scenes)?;

    let mut previous_stats = Vec::with_capacity(scenes.len());
    for i in 0..scenes.len() {
        let stats = if i == 0 {
            None
        } else {
            similarity_stats(scenes[i - 1].frames(), scenes[i].frames())?
        };
        previous_stats.push(stats);
    }

    let n = scenes.len();
    for (i, (scene, stats)) in scenes.iter_mut().zip(previous_stats).enumerate() {
        scene.sim_to_previous_scene = stats;
        scene.sim_to_all_scenes = if n > 1 {
            let total: f32 = (0..n).filter(|&j| j != i).map(|j| matrix[i][j]).sum();
            Some(total / (n - 1) as f32)
        } else {
            None
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::KnownType;
    use crate::shot_grouper::ShotGrouper;
    use crate::similarity::tests::frame;

    fn shot(shot_id: u32, frames: Vec<Frame>) -> Shot {
        Shot {
            shot_id,
            frame_range: [frames[0].frame_num, frames[frames.len() - 1].frame_num],
            timestamp_range: [
                frames[0].timestamp_millis,
                frames[frames.len() - 1].timestamp_millis,
            ],
            known_type: frames[0].known_type,
            frames,
        }
    }

    fn sample_shots() -> Vec<Shot> {
        vec![
            shot(0, vec![frame(0, 0, vec![1.0, 0.0]), frame(1, 1000, vec![1.0, 0.1])]),
            shot(1, vec![frame(2, 2000, vec![1.0, 0.2]), frame(3, 3000, vec![0.9, 0.3])]),
            shot(2, vec![frame(4, 4000, vec![0.0, 1.0]), frame(5, 5000, vec![0.1, 1.0])]),
            shot(3, vec![frame(6, 60_000, vec![0.1, 1.0])]),
        ]
    }

    #[test]
    fn test_group_by_similarity_and_gap() {
        let scenes = SceneGrouper::new(0.7, 5_000).group(sample_shots()).unwrap();
        let ranges: Vec<[u32; 2]> = scenes.iter().map(|s| s.shot_range).collect();
        // 镜头 1→2 相似度过低，镜头 2→3 间隔过大
        assert_eq!(ranges, vec![[0, 1], [2, 2], [3, 3]]);
        let ids: Vec<u32> = scenes.iter().map(|s| s.scene_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(scenes[0].timestamp_range, [0, 3000]);
        assert_eq!(scenes[0].frame_range, [0, 3]);
    }

    #[test]
    fn test_cross_scene_similarity() {
        let scenes = SceneGrouper::new(0.7, 5_000).group(sample_shots()).unwrap();
        assert!(scenes[0].sim_to_previous_scene.is_none());
        let stats = scenes[1].sim_to_previous_scene.unwrap();
        assert!(stats.min <= stats.rms && stats.rms <= stats.max);
        assert!(stats.max < 0.5);
        // 场景 1 与场景 2 几乎相同
        let stats = scenes[2].sim_to_previous_scene.unwrap();
        assert!(stats.max > 0.99);
        assert!(scenes[0].sim_to_all_scenes.unwrap() < scenes[2].sim_to_all_scenes.unwrap());
    }

    #[test]
    fn test_earliest_known_type_wins() {
        let mut black = frame(2, 2000, vec![1.0, 0.0]);
        black.known_type = Some(KnownType::BlackFrames);
        let mut mono = frame(3, 3000, vec![1.0, 0.0]);
        mono.known_type = Some(KnownType::Monochrome);
        let shots = vec![
            shot(0, vec![frame(0, 0, vec![1.0, 0.0])]),
            shot(1, vec![black]),
            shot(2, vec![mono]),
        ];
        let scenes = SceneGrouper::new(0.7, 5_000).group(shots).unwrap();
        assert_eq!(scenes.len(), 1);
        assert_eq!(scenes[0].known_type, Some(KnownType::BlackFrames));
    }

    #[test]
    fn test_summarize_audio() {
        let mut a = frame(0, 0, vec![1.0]);
        a.loudness_level = Some(LoudnessTag::Silent);
        a.pause_in_dialogue = Some(true);
        let mut b = frame(1, 1000, vec![1.0]);
        b.loudness_level = Some(LoudnessTag::Quiet);
        b.pause_in_dialogue = Some(true);
        let audio = summarize_audio([&a, &b]);
        assert_eq!(audio.has_dialogue, Some(false));
        assert_eq!(audio.silent, Some(false));
        assert_eq!(audio.quiet, Some(true));

        b.pause_in_dialogue = Some(false);
        assert_eq!(summarize_audio([&a, &b]).has_dialogue, Some(true));
        assert_eq!(summarize_audio([&frame(2, 0, vec![1.0])]), SceneAudio::default());
    }

    #[test]
    fn test_scenes_partition_shots_and_are_deterministic() {
        let frames: Vec<Frame> = (0..30)
            .map(|i| {
                let angle = ((i / 4) as f32 * 0.9) % 3.0;
                frame(i as u64 * 10, i as u64 * 1000, vec![angle.cos(), angle.sin()])
            })
            .collect();
        let run = || {
            let shots = ShotGrouper::new(0.95, 5_000).group(frames.clone()).unwrap();
            SceneGrouper::new(0.3, 5_000).group(shots).unwrap()
        };
        let scenes = run();
        let mut expected_shot = 0;
        for scene in &scenes {
            assert_eq!(scene.shot_range[0], expected_shot);
            expected_shot = scene.shot_range[1] + 1;
        }
        for pair in scenes.windows(2) {
            assert!(pair[0].timestamp_range[1] < pair[1].timestamp_range[0]);
        }
        assert_eq!(
            serde_json::to_string(&scenes).unwrap(),
            serde_json::to_string(&run()).unwrap()
        );
    }
}
