use crate::error::{PipelineError, PipelineResult};
use crate::models::{Frame, PerceptualHash, SimilarityStats, Span};

/// 计算两个嵌入向量的余弦相似度
///
/// 任一向量为零向量时返回 0.0。
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> PipelineResult<f32> {
    if a.len() != b.len() {
        return Err(PipelineError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// 归一化汉明距离，范围 0.0-1.0
pub fn hash_distance(a: &PerceptualHash, b: &PerceptualHash) -> PipelineResult<f32> {
    let (left, right) = (a.as_bytes(), b.as_bytes());
    if left.len() != right.len() {
        return Err(PipelineError::HashLengthMismatch {
            left: left.len(),
            right: right.len(),
        });
    }
    if left.is_empty() {
        return Ok(0.0);
    }

    let differing: u32 = left
        .iter()
        .zip(right)
        .map(|(x, y)| (x ^ y).count_ones())
        .sum();
    Ok(differing as f32 / a.bit_len() as f32)
}

/// 判断两个闭区间是否相交
///
/// `inclusive` 为 false 时端点相接不算相交。
pub fn intervals_intersect(a: Span, b: Span, inclusive: bool) -> bool {
    if inclusive {
        a[0] <= b[1] && b[0] <= a[1]
    } else {
        a[0] < b[1] && b[0] < a[1]
    }
}

/// 两个区间重叠部分的长度
pub fn overlap_len(a: Span, b: Span) -> u64 {
    a[1].min(b[1]).saturating_sub(a[0].max(b[0]))
}

/// 两帧的嵌入相似度
pub fn frame_similarity(a: &Frame, b: &Frame) -> PipelineResult<f32> {
    cosine_similarity(&a.embedding, &b.embedding)
}

/// 两组帧之间所有两两相似度的 `[min, max, rms]`
pub fn similarity_stats<'a, 'b>(
    left: impl IntoIterator<Item = &'a Frame>,
    right: impl IntoIterator<Item = &'b Frame> + Clone,
) -> PipelineResult<Option<SimilarityStats>> {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    let mut sum_squares = 0.0f64;
    let mut count = 0usize;

    for a in left {
        for b in right.clone() {
            let sim = frame_similarity(a, b)?;
            min = min.min(sim);
            max = max.max(sim);
            sum_squares += (sim as f64) * (sim as f64);
            count += 1;
        }
    }

    if count == 0 {
        return Ok(None);
    }
    Ok(Some(SimilarityStats {
        min,
        max,
        rms: (sum_squares / count as f64).sqrt() as f32,
    }))
}

/// 两组帧之间的最大交叉相似度
pub fn max_cross_similarity<'a, 'b>(
    left: impl IntoIterator<Item = &'a Frame>,
    right: impl IntoIterator<Item = &'b Frame> + Clone,
) -> PipelineResult<Option<f32>> {
    Ok(similarity_stats(left, right)?.map(|stats| stats.max))
}

/// 计算每帧相对前一帧的 `embed_similarity` 与 `hash_distance`
///
/// `only_dirty` 为 true 时只重新计算带 `dirty` 标记的帧；处理后清除标记。
/// 返回重新计算的帧数。
pub fn annotate_neighbours<'a>(
    frames: impl IntoIterator<Item = &'a mut Frame>,
    only_dirty: bool,
) -> PipelineResult<usize> {
    let mut frames: Vec<&mut Frame> = frames.into_iter().collect();
    let mut recomputed = 0;

    if let Some(first) = frames.first_mut() {
        if !only_dirty || first.dirty {
            first.embed_similarity = None;
            first.hash_distance = None;
            first.dirty = false;
            recomputed += 1;
        }
    }

    for i in 1..frames.len() {
        let (head, tail) = frames.split_at_mut(i);
        let previous: &Frame = &*head[i - 1];
        let current: &mut Frame = &mut *tail[0];
        if only_dirty && !current.dirty {
            continue;
        }
        current.embed_similarity = Some(frame_similarity(previous, current)?);
        current.hash_distance = Some(hash_distance(&previous.hash, &current.hash)?);
        current.dirty = false;
        recomputed += 1;
    }

    Ok(recomputed)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn frame(frame_num: u64, timestamp_millis: u64, embedding: Vec<f32>) -> Frame {
        Frame {
            frame_num,
            timestamp_millis,
            smpte_timecode: format!("00:00:{:02}:00", timestamp_millis / 1000),
            embedding,
            hash: PerceptualHash::from_bytes(vec![0u8; 8]),
            laplacian: 0.0,
            known_type: None,
            loudness_level: None,
            pause_in_dialogue: None,
            hash_distance: None,
            embed_similarity: None,
            dirty: false,
        }
    }

    #[test]
    fn test_cosine_similarity() {
        let sim = cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]).unwrap();
        assert!((sim - 1.0).abs() < 1e-6);
        let sim = cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap();
        assert!(sim.abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).unwrap(), 0.0);
    }

    #[test]
    fn test_cosine_dimension_mismatch() {
        let err = cosine_similarity(&[1.0, 0.0], &[1.0]).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::DimensionMismatch { left: 2, right: 1 }
        ));
    }

    #[test]
    fn test_hash_distance() {
        let a = PerceptualHash::from_bytes(vec![0b0000_0000, 0xff]);
        let b = PerceptualHash::from_bytes(vec![0b0000_1111, 0xff]);
        assert!((hash_distance(&a, &b).unwrap() - 4.0 / 16.0).abs() < 1e-6);
        assert_eq!(hash_distance(&a, &a).unwrap(), 0.0);
        let short = PerceptualHash::from_bytes(vec![0]);
        assert!(hash_distance(&a, &short).is_err());
    }

    #[test]
    fn test_intervals_intersect() {
        assert!(intervals_intersect([0, 10], [10, 20], true));
        assert!(!intervals_intersect([0, 10], [10, 20], false));
        assert!(intervals_intersect([0, 10], [5, 6], false));
        assert!(!intervals_intersect([0, 10], [11, 20], true));
        assert_eq!(overlap_len([0, 10], [5, 20]), 5);
        assert_eq!(overlap_len([0, 10], [15, 20]), 0);
    }

    #[test]
    fn test_similarity_stats() {
        let left = vec![frame(0, 0, vec![1.0, 0.0])];
        let right = vec![frame(1, 1000, vec![1.0, 0.0]), frame(2, 2000, vec![0.0, 1.0])];
        let stats = similarity_stats(left.iter(), right.iter()).unwrap().unwrap();
        assert!(stats.min.abs() < 1e-6);
        assert!((stats.max - 1.0).abs() < 1e-6);
        assert!((stats.rms - 0.5f32.sqrt()).abs() < 1e-5);
        assert!(similarity_stats(left.iter(), Vec::<Frame>::new().iter())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_annotate_only_dirty_frames() {
        let mut frames = vec![
            frame(0, 0, vec![1.0, 0.0]),
            frame(1, 1000, vec![1.0, 0.0]),
            frame(2, 2000, vec![0.0, 1.0]),
        ];
        assert_eq!(annotate_neighbours(frames.iter_mut(), false).unwrap(), 3);
        assert!(frames[0].embed_similarity.is_none());
        assert!((frames[1].embed_similarity.unwrap() - 1.0).abs() < 1e-6);

        frames[2].embedding = vec![1.0, 0.0];
        assert_eq!(annotate_neighbours(frames.iter_mut(), true).unwrap(), 0);
        assert!(frames[2].embed_similarity.unwrap().abs() < 1e-6);

        frames[2].dirty = true;
        assert_eq!(annotate_neighbours(frames.iter_mut(), true).unwrap(), 1);
        assert!((frames[2].embed_similarity.unwrap() - 1.0).abs() < 1e-6);
        assert!(!frames[2].dirty);
    }
}
