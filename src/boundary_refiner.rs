use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::collaborators::FrameSampler;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Frame, FrameMap, Shot};
use crate::similarity::annotate_neighbours;

/// 边界两端帧的引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BoundaryFrame {
    pub frame_num: u64,
    pub timestamp_millis: u64,
    #[serde(default)]
    pub smpte_timecode: String,
}

impl From<&Frame> for BoundaryFrame {
    fn from(frame: &Frame) -> Self {
        Self {
            frame_num: frame.frame_num,
            timestamp_millis: frame.timestamp_millis,
            smpte_timecode: frame.smpte_timecode.clone(),
        }
    }
}

/// 抽帧服务返回的补充帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SampledFrames {
    pub new_frames: Vec<Frame>,
    pub api_calls_consumed: u32,
}

/// 需要补帧的镜头/场景边界
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Boundary {
    pub from_frame: BoundaryFrame,
    pub to_frame: BoundaryFrame,
    /// 已完成时记录补帧结果，重入时跳过
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<SampledFrames>,
}

impl Boundary {
    pub fn is_done(&self) -> bool {
        self.response.is_some()
    }

    /// 新帧必须落在 `[from, to]` 之内
    fn validate(&self, sampled: &SampledFrames) -> PipelineResult<()> {
        let low = self.from_frame.frame_num;
        let high = self.to_frame.frame_num;
        for frame in &sampled.new_frames {
            if frame.frame_num < low || frame.frame_num > high {
                return Err(PipelineError::FrameNumbering {
                    frame_num: frame.frame_num,
                    from_frame: low,
                    to_frame: high,
                });
            }
        }
        Ok(())
    }
}

/// 边界细化的持久化状态，每次调用结束后保存
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RefinementState {
    pub boundaries: Vec<Boundary>,
    /// 已经执行的有效调用次数
    #[serde(default)]
    pub invocations: u32,
    #[serde(default)]
    pub api_calls_consumed: u64,
}

impl RefinementState {
    pub fn new(boundaries: Vec<Boundary>) -> Self {
        Self {
            boundaries,
            invocations: 0,
            api_calls_consumed: 0,
        }
    }

    pub fn processed_count(&self) -> usize {
        self.boundaries.iter().filter(|b| b.is_done()).count()
    }

    pub fn total_count(&self) -> usize {
        self.boundaries.len()
    }

    /// 四舍五入后的完成百分比
    pub fn progress_percent(&self) -> u32 {
        let total = self.total_count();
        if total == 0 {
            return 100;
        }
        ((self.processed_count() as f64 / total as f64) * 100.0).round() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.processed_count() == self.total_count()
    }
}

/// 单次调用的进度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefinementProgress {
    pub processed_this_run: usize,
    pub processed_count: usize,
    pub total_count: usize,
    pub progress_percent: u32,
    pub complete: bool,
}

impl RefinementProgress {
    fn of(state: &RefinementState, processed_this_run: usize) -> Self {
        Self {
            processed_this_run,
            processed_count: state.processed_count(),
            total_count: state.total_count(),
            progress_percent: state.progress_percent(),
            complete: state.is_complete(),
        }
    }
}

/// 为相邻镜头之间帧号间隔大于 1 的位置生成边界
pub fn boundaries_from_shots(shots: &[Shot]) -> Vec<Boundary> {
    shots
        .windows(2)
        .filter_map(|pair| {
            let from = pair[0].last_frame()?;
            let to = pair[1].first_frame()?;
            (to.frame_num.saturating_sub(from.frame_num) > 1).then(|| Boundary {
                from_frame: from.into(),
                to_frame: to.into(),
                response: None,
            })
        })
        .collect()
}

/// 边界细化器：固定大小的工作池并行补帧，受截止时间约束，可多次调用续跑
pub struct BoundaryRefiner {
    sampler: Arc<dyn FrameSampler>,
    /// 工作池大小
    workers: usize,
    /// 最大调用次数，超过即为致命错误
    bailout_limit: u32,
    /// 距离截止时间不足该值时不再开始新的边界
    deadline_margin: Duration,
}

impl BoundaryRefiner {
    pub fn new(sampler: Arc<dyn FrameSampler>, workers: Option<usize>, bailout_limit: u32) -> Self {
        let workers = workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        Self {
            sampler,
            workers: workers.max(1),
            bailout_limit,
            deadline_margin: Duration::zero(),
        }
    }

    pub fn with_deadline_margin(mut self, margin: Duration) -> Self {
        self.deadline_margin = margin;
        self
    }

    /// 执行一次细化调用
    ///
    /// 各工作任务只处理自己的分片，返回结果批次；所有任务结束后在当前任务中
    /// 单线程校验并合并到帧表，随后只重新计算受影响帧的相邻字段。
    pub async fn refine(
        &self,
        state: &mut RefinementState,
        frames: &mut FrameMap,
        deadline: DateTime<Utc>,
    ) -> PipelineResult<RefinementProgress> {
        let pending: Vec<usize> = state
            .boundaries
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_done())
            .map(|(i, _)| i)
            .collect();

        if pending.is_empty() {
            debug!("[边界细化] 没有待处理的边界");
            return Ok(RefinementProgress::of(state, 0));
        }

        if state.invocations >= self.bailout_limit {
            error!(
                "❌ [边界细化] 已调用 {} 次仍有 {} 个边界未完成",
                state.invocations,
                pending.len()
            );
            return Err(PipelineError::BailoutExceeded {
                limit: self.bailout_limit,
            });
        }
        state.invocations += 1;

        let chunk_size = pending.len().div_ceil(self.workers);
        info!(
            "⏳ [边界细化] 第 {} 次调用: {} 个待处理边界，{} 个工作任务",
            state.invocations,
            pending.len(),
            pending.len().div_ceil(chunk_size)
        );

        let mut handles = Vec::new();
        for (worker_id, partition) in pending.chunks(chunk_size).enumerate() {
            let jobs: Vec<(usize, BoundaryFrame, BoundaryFrame)> = partition
                .iter()
                .map(|&i| {
                    let boundary = &state.boundaries[i];
                    (i, boundary.from_frame.clone(), boundary.to_frame.clone())
                })
                .collect();
            let sampler = Arc::clone(&self.sampler);
            let margin = self.deadline_margin;
            handles.push(tokio::spawn(async move {
                run_worker(worker_id, jobs, sampler, deadline, margin).await
            }));
        }

        let mut completed: Vec<(usize, SampledFrames)> = Vec::new();
        for joined in join_all(handles).await {
            let batch = joined.map_err(|e| PipelineError::Worker(e.to_string()))?;
            completed.extend(batch);
        }
        completed.sort_by_key(|(i, _)| *i);

        for (i, sampled) in &completed {
            state.boundaries[*i].validate(sampled)?;
        }

        let processed_this_run = completed.len();
        let mut inserted = 0usize;
        for (i, sampled) in completed {
            inserted += merge_frames(frames, &sampled.new_frames);
            state.api_calls_consumed += u64::from(sampled.api_calls_consumed);
            state.boundaries[i].response = Some(sampled);
        }
        let recomputed = annotate_neighbours(frames.values_mut(), true)?;

        let progress = RefinementProgress::of(state, processed_this_run);
        info!(
            "✅ [边界细化] 本次完成 {} 个边界，新增 {} 帧，重新计算 {} 帧，进度 {}/{} ({}%)",
            processed_this_run,
            inserted,
            recomputed,
            progress.processed_count,
            progress.total_count,
            progress.progress_percent
        );
        Ok(progress)
    }
}

/// 顺序处理一个分片，每个边界开始前检查截止时间
async fn run_worker(
    worker_id: usize,
    jobs: Vec<(usize, BoundaryFrame, BoundaryFrame)>,
    sampler: Arc<dyn FrameSampler>,
    deadline: DateTime<Utc>,
    margin: Duration,
) -> Vec<(usize, SampledFrames)> {
    let mut results = Vec::with_capacity(jobs.len());
    for (index, from, to) in jobs {
        if Utc::now() + margin >= deadline {
            info!("⏱️  [边界细化] 工作任务 {} 接近截止时间，停止", worker_id);
            break;
        }
        match sampler.extract_frames(&from, &to).await {
            Ok(sampled) => {
                debug!(
                    "[边界细化] 工作任务 {}: 边界 {}-{} 获得 {} 帧",
                    worker_id,
                    from.frame_num,
                    to.frame_num,
                    sampled.new_frames.len()
                );
                results.push((index, sampled));
            }
            Err(e) => {
                warn!(
                    "⚠️  [边界细化] 边界 {}-{} 补帧失败，留待下次调用: {}",
                    from.frame_num, to.frame_num, e
                );
            }
        }
    }
    results
}

/// 把新帧并入帧表，已存在的帧号保持不变；新帧及其后继帧标记为 dirty
fn merge_frames(frames: &mut FrameMap, new_frames: &[Frame]) -> usize {
    let mut inserted = Vec::new();
    for frame in new_frames {
        if frames.contains_key(&frame.frame_num) {
            continue;
        }
        let mut frame = frame.clone();
        frame.dirty = true;
        inserted.push(frame.frame_num);
        frames.insert(frame.frame_num, frame);
    }
    for frame_num in &inserted {
        if let Some((_, next)) = frames.range_mut((Excluded(*frame_num), Unbounded)).next() {
            next.dirty = true;
        }
    }
    inserted.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::tests::frame;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 在边界中点生成一帧的测试抽帧器
    struct MidpointSampler {
        calls: AtomicUsize,
        offset: u64,
    }

    impl MidpointSampler {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                offset: 0,
            }
        }
    }

    #[async_trait]
    impl FrameSampler for MidpointSampler {
        async fn extract_frames(
            &self,
            from: &BoundaryFrame,
            to: &BoundaryFrame,
        ) -> anyhow::Result<SampledFrames> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let frame_num = (from.frame_num + to.frame_num) / 2 + self.offset;
            let timestamp = (from.timestamp_millis + to.timestamp_millis) / 2;
            Ok(SampledFrames {
                new_frames: vec![frame(frame_num, timestamp, vec![1.0, 0.0])],
                api_calls_consumed: 2,
            })
        }
    }

    /// 越靠前的边界返回越慢，打乱完成顺序
    struct ReversedLatencySampler;

    #[async_trait]
    impl FrameSampler for ReversedLatencySampler {
        async fn extract_frames(
            &self,
            from: &BoundaryFrame,
            to: &BoundaryFrame,
        ) -> anyhow::Result<SampledFrames> {
            let delay = 50u64.saturating_sub(from.frame_num);
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            Ok(SampledFrames {
                new_frames: vec![
                    frame(from.frame_num + 3, from.timestamp_millis + 300, vec![1.0, 0.5]),
                    frame(to.frame_num - 3, to.timestamp_millis - 300, vec![0.5, 1.0]),
                ],
                api_calls_consumed: 1,
            })
        }
    }

    fn sample_frames() -> FrameMap {
        (0..5u64)
            .map(|i| (i * 10, frame(i * 10, i * 1000, vec![1.0, 0.0])))
            .collect()
    }

    fn sample_state(frames: &FrameMap) -> RefinementState {
        let list: Vec<&Frame> = frames.values().collect();
        let boundaries = list
            .windows(2)
            .map(|pair| Boundary {
                from_frame: pair[0].into(),
                to_frame: pair[1].into(),
                response: None,
            })
            .collect();
        RefinementState::new(boundaries)
    }

    #[tokio::test]
    async fn test_deadline_in_past_does_nothing() {
        let sampler = Arc::new(MidpointSampler::new());
        let refiner = BoundaryRefiner::new(sampler.clone(), Some(2), 10);
        let mut frames = sample_frames();
        let mut state = sample_state(&frames);

        let progress = refiner
            .refine(&mut state, &mut frames, Utc::now() - Duration::seconds(5))
            .await
            .unwrap();

        assert_eq!(progress.processed_this_run, 0);
        assert_eq!(progress.processed_count, 0);
        assert_eq!(progress.progress_percent, 0);
        assert!(!progress.complete);
        assert_eq!(sampler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(frames.len(), 5);
    }

    #[tokio::test]
    async fn test_refine_all_then_idempotent() {
        let sampler = Arc::new(MidpointSampler::new());
        let refiner = BoundaryRefiner::new(sampler.clone(), Some(3), 10);
        let mut frames = sample_frames();
        let mut state = sample_state(&frames);
        let deadline = Utc::now() + Duration::minutes(5);

        let progress = refiner.refine(&mut state, &mut frames, deadline).await.unwrap();
        assert!(progress.complete);
        assert_eq!(progress.processed_this_run, 4);
        assert_eq!(progress.progress_percent, 100);
        assert_eq!(state.api_calls_consumed, 8);
        let keys: Vec<u64> = frames.keys().copied().collect();
        assert_eq!(keys, vec![0, 5, 10, 15, 20, 25, 30, 35, 40]);
        assert!(frames.values().all(|f| !f.dirty));
        assert!(frames[&5].embed_similarity.is_some());

        let snapshot = (frames.clone(), state.clone());
        let progress = refiner.refine(&mut state, &mut frames, deadline).await.unwrap();
        assert_eq!(progress.processed_this_run, 0);
        assert_eq!(sampler.calls.load(Ordering::SeqCst), 4);
        assert_eq!((frames, state), snapshot);
    }

    #[tokio::test]
    async fn test_merge_is_independent_of_worker_count() {
        let deadline = Utc::now() + Duration::minutes(5);
        let mut results = Vec::new();
        for workers in [1, 4] {
            let sampler = Arc::new(ReversedLatencySampler);
            let refiner = BoundaryRefiner::new(sampler, Some(workers), 10);
            let mut frames = sample_frames();
            let mut state = sample_state(&frames);
            let progress = refiner.refine(&mut state, &mut frames, deadline).await.unwrap();
            assert!(progress.complete);
            results.push((frames, state));
        }

        let (single, parallel) = (&results[0], &results[1]);
        assert_eq!(single.0.len(), 13);
        assert_eq!(single.0, parallel.0);
        assert_eq!(single.1, parallel.1);
        assert_eq!(
            serde_json::to_vec(&single.0.values().collect::<Vec<_>>()).unwrap(),
            serde_json::to_vec(&parallel.0.values().collect::<Vec<_>>()).unwrap()
        );
    }

    #[tokio::test]
    async fn test_out_of_range_frame_is_fatal() {
        let sampler = Arc::new(MidpointSampler {
            calls: AtomicUsize::new(0),
            offset: 100,
        });
        let refiner = BoundaryRefiner::new(sampler, Some(1), 10);
        let mut frames = sample_frames();
        let mut state = sample_state(&frames);

        let err = refiner
            .refine(&mut state, &mut frames, Utc::now() + Duration::minutes(5))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::FrameNumbering { .. }));
        assert_eq!(frames.len(), 5);
    }

    #[tokio::test]
    async fn test_bailout_limit_is_fatal() {
        let refiner = BoundaryRefiner::new(Arc::new(MidpointSampler::new()), Some(1), 3);
        let mut frames = sample_frames();
        let mut state = sample_state(&frames);
        state.invocations = 3;

        let err = refiner
            .refine(&mut state, &mut frames, Utc::now() + Duration::minutes(5))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::BailoutExceeded { limit: 3 }));
    }

    #[test]
    fn test_boundaries_from_shots_skip_adjacent_frames() {
        let shot = |id: u32, nums: &[u64]| Shot {
            shot_id: id,
            frame_range: [nums[0], nums[nums.len() - 1]],
            timestamp_range: [nums[0] * 40, nums[nums.len() - 1] * 40],
            known_type: None,
            frames: nums.iter().map(|&n| frame(n, n * 40, vec![1.0])).collect(),
        };
        let shots = vec![shot(0, &[0, 25]), shot(1, &[26, 50]), shot(2, &[75])];
        let boundaries = boundaries_from_shots(&shots);
        assert_eq!(boundaries.len(), 1);
        assert_eq!(boundaries[0].from_frame.frame_num, 50);
        assert_eq!(boundaries[0].to_frame.frame_num, 75);
    }
}
