use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};
use crate::models::{Frame, Shot};
use crate::similarity::frame_similarity;

/// 镜头分组器，把按帧号排序的帧切分成镜头
pub struct ShotGrouper {
    /// 相邻帧相似度低于该值时切分
    similarity_threshold: f32,
    /// 相邻帧时间间隔超过该值（毫秒）时切分
    max_gap_millis: u64,
}

impl ShotGrouper {
    pub fn new(similarity_threshold: f32, max_gap_millis: u64) -> Self {
        Self {
            similarity_threshold,
            max_gap_millis,
        }
    }

    /// 单次线性扫描，输出连续、不重叠、`shot_id` 从 0 开始编号的镜头
    pub fn group(&self, frames: impl IntoIterator<Item = Frame>) -> PipelineResult<Vec<Shot>> {
        let mut shots: Vec<Shot> = Vec::new();
        let mut current: Vec<Frame> = Vec::new();

        for frame in frames {
            if let Some(previous) = current.last() {
                if frame.frame_num <= previous.frame_num {
                    return Err(PipelineError::FrameOrder {
                        previous: previous.frame_num,
                        current: frame.frame_num,
                    });
                }
                if self.is_cut(previous, &frame)? {
                    let shot_id = shots.len() as u32;
                    shots.push(build_shot(shot_id, std::mem::take(&mut current)));
                }
            }
            current.push(frame);
        }

        if !current.is_empty() {
            let shot_id = shots.len() as u32;
            shots.push(build_shot(shot_id, current));
        }

        info!("✅ [镜头分组] 共生成 {} 个镜头", shots.len());
        Ok(shots)
    }

    /// 已知类型变化、时间间隔过大或相似度不足都会切分镜头
    fn is_cut(&self, previous: &Frame, current: &Frame) -> PipelineResult<bool> {
        if previous.known_type != current.known_type {
            debug!(
                "[镜头分组] 帧 {} 已知类型变化: {:?} -> {:?}",
                current.frame_num, previous.known_type, current.known_type
            );
            return Ok(true);
        }

        let gap = current
            .timestamp_millis
            .saturating_sub(previous.timestamp_millis);
        if gap > self.max_gap_millis {
            debug!("[镜头分组] 帧 {} 时间间隔 {}ms 过大", current.frame_num, gap);
            return Ok(true);
        }

        let similarity = frame_similarity(previous, current)?;
        Ok(similarity < self.similarity_threshold)
    }
}

fn build_shot(shot_id: u32, frames: Vec<Frame>) -> Shot {
    let first = frames.first();
    let last = frames.last();
    Shot {
        shot_id,
        frame_range: [
            first.map_or(0, |f| f.frame_num),
            last.map_or(0, |f| f.frame_num),
        ],
        timestamp_range: [
            first.map_or(0, |f| f.timestamp_millis),
            last.map_or(0, |f| f.timestamp_millis),
        ],
        known_type: first.and_then(|f| f.known_type),
        frames,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::KnownType;
    use crate::similarity::tests::frame;

    /// 按角度构造单位向量，相邻帧的余弦相似度即为角度差的余弦
    fn frames_from_angles(angles: &[f32]) -> Vec<Frame> {
        angles
            .iter()
            .enumerate()
            .map(|(i, a)| frame(i as u64, i as u64 * 1000, vec![a.cos(), a.sin()]))
            .collect()
    }

    #[test]
    fn test_alternating_similarity_example() {
        // 帧 3→4 与 7→8 的相似度为 0.40，其余为 0.95
        let high = 0.95f32.acos();
        let low = 0.40f32.acos();
        let mut angles = Vec::new();
        let mut angle = 0.0f32;
        for i in 0..10 {
            angles.push(angle);
            angle += if i == 3 || i == 7 { low } else { high };
        }
        let shots = ShotGrouper::new(0.8, 10_000)
            .group(frames_from_angles(&angles))
            .unwrap();
        let ranges: Vec<[u64; 2]> = shots.iter().map(|s| s.frame_range).collect();
        assert_eq!(ranges, vec![[0, 3], [4, 7], [8, 9]]);
        let ids: Vec<u32> = shots.iter().map(|s| s.shot_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_time_gap_starts_new_shot() {
        let mut frames = frames_from_angles(&[0.0, 0.0, 0.0]);
        frames[2].timestamp_millis = 60_000;
        let shots = ShotGrouper::new(0.8, 5_000).group(frames).unwrap();
        assert_eq!(shots.len(), 2);
        assert_eq!(shots[1].timestamp_range, [60_000, 60_000]);
    }

    #[test]
    fn test_known_type_change_starts_new_shot() {
        let mut frames = frames_from_angles(&[0.0; 5]);
        frames[2].known_type = Some(KnownType::BlackFrames);
        frames[3].known_type = Some(KnownType::BlackFrames);
        let shots = ShotGrouper::new(0.8, 5_000).group(frames).unwrap();
        assert_eq!(shots.len(), 3);
        assert_eq!(shots[1].frame_range, [2, 3]);
        assert_eq!(shots[1].known_type, Some(KnownType::BlackFrames));
        assert_eq!(shots[2].known_type, None);
    }

    #[test]
    fn test_shots_partition_frames() {
        let angles: Vec<f32> = (0..40).map(|i| (i / 7) as f32 * 1.2 % 3.0).collect();
        let mut frames = frames_from_angles(&angles);
        // 模拟采样间隔
        for (i, f) in frames.iter_mut().enumerate() {
            f.frame_num = i as u64 * 25;
        }
        let input: Vec<u64> = frames.iter().map(|f| f.frame_num).collect();
        let shots = ShotGrouper::new(0.9, 5_000).group(frames).unwrap();
        let output: Vec<u64> = shots
            .iter()
            .flat_map(|s| s.frames.iter().map(|f| f.frame_num))
            .collect();
        assert_eq!(input, output);
        for pair in shots.windows(2) {
            assert!(pair[0].frame_range[1] < pair[1].frame_range[0]);
        }
    }

    #[test]
    fn test_empty_and_unordered_input() {
        assert!(ShotGrouper::new(0.8, 1000).group(Vec::new()).unwrap().is_empty());
        let mut frames = frames_from_angles(&[0.0, 0.0]);
        frames[1].frame_num = 0;
        assert!(matches!(
            ShotGrouper::new(0.8, 1000).group(frames),
            Err(PipelineError::FrameOrder { .. })
        ));
    }
}
