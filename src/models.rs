use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::PipelineError;

/// 闭区间 `[起点, 终点]`（毫秒或帧号）
pub type Span = [u64; 2];

/// 以帧号为键的帧表，所有派生结构都从这里重新计算
pub type FrameMap = BTreeMap<u64, Frame>;

fn is_false(value: &bool) -> bool {
    !*value
}

/// 感知哈希（JSON 中以十六进制字符串表示）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PerceptualHash(Vec<u8>);

impl PerceptualHash {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// 哈希位数
    pub fn bit_len(&self) -> usize {
        self.0.len() * 8
    }
}

impl TryFrom<String> for PerceptualHash {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let digits = value.trim();
        if digits.len() % 2 != 0 {
            return Err(PipelineError::InvalidHash(value.clone()));
        }
        let mut bytes = Vec::with_capacity(digits.len() / 2);
        for pair in digits.as_bytes().chunks(2) {
            let text = std::str::from_utf8(pair)
                .map_err(|_| PipelineError::InvalidHash(value.clone()))?;
            let byte = u8::from_str_radix(text, 16)
                .map_err(|_| PipelineError::InvalidHash(value.clone()))?;
            bytes.push(byte);
        }
        Ok(Self(bytes))
    }
}

impl From<PerceptualHash> for String {
    fn from(hash: PerceptualHash) -> Self {
        hash.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// 确定性视觉检测器给出的帧类型标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KnownType {
    BlackFrames,
    Monochrome,
    ColorBars,
    CountdownClock,
}

impl KnownType {
    /// 已知类型对应的结构类型（单色帧视为转场）
    pub fn structural_type(self) -> StructuralType {
        match self {
            KnownType::BlackFrames => StructuralType::BlackFrames,
            KnownType::Monochrome => StructuralType::Transition,
            KnownType::ColorBars => StructuralType::ColorBars,
            KnownType::CountdownClock => StructuralType::CountdownClock,
        }
    }
}

/// 响度等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoudnessTag {
    Silent,
    Quiet,
    Moderate,
    Loud,
}

impl LoudnessTag {
    pub fn is_quiet(self) -> bool {
        matches!(self, LoudnessTag::Silent | LoudnessTag::Quiet)
    }
}

/// 结构元素类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StructuralType {
    BlackFrames,
    Transition,
    TechnicalSlate,
    ColorBars,
    CountdownClock,
    Idents,
    Recap,
    Intro,
    OpeningCredits,
    Title,
    Programme,
    Rating,
    EndCredits,
    NextEpisodeCredits,
    PostCreditsScene,
    TextlessElement,
    Undefined,
}

impl StructuralType {
    /// 折叠成结构元素时使用的分组类型
    pub fn group(self) -> StructuralType {
        match self {
            StructuralType::NextEpisodeCredits => StructuralType::EndCredits,
            other => other,
        }
    }

    /// 节目正片之前的技术性内容（彩条、倒计时、场记板、黑场）
    pub fn is_technical(self) -> bool {
        matches!(
            self,
            StructuralType::BlackFrames
                | StructuralType::ColorBars
                | StructuralType::CountdownClock
                | StructuralType::TechnicalSlate
        )
    }
}

impl fmt::Display for StructuralType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 单个采样帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Frame {
    /// 帧序号（唯一且递增，允许有间隔）
    pub frame_num: u64,
    /// 时间戳（毫秒）
    pub timestamp_millis: u64,
    /// SMPTE 时间码
    #[serde(default)]
    pub smpte_timecode: String,
    /// 视觉嵌入向量
    pub embedding: Vec<f32>,
    /// 感知哈希
    pub hash: PerceptualHash,
    /// 拉普拉斯方差（清晰度）
    #[serde(default)]
    pub laplacian: f32,
    /// 确定性检测器标签
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_type: Option<KnownType>,
    /// 响度等级
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loudness_level: Option<LoudnessTag>,
    /// 是否处于对白停顿中（`Some(false)` 表示有对白）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_in_dialogue: Option<bool>,
    /// 与前一帧的哈希距离
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_distance: Option<f32>,
    /// 与前一帧的嵌入相似度
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed_similarity: Option<f32>,
    /// 相邻字段需要重新计算
    #[serde(default, skip_serializing_if = "is_false")]
    pub dirty: bool,
}

/// 镜头：相邻帧高度相似的连续帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Shot {
    pub shot_id: u32,
    pub frame_range: Span,
    pub timestamp_range: Span,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_type: Option<KnownType>,
    pub frames: Vec<Frame>,
}

impl Shot {
    pub fn first_frame(&self) -> Option<&Frame> {
        self.frames.first()
    }

    pub fn last_frame(&self) -> Option<&Frame> {
        self.frames.last()
    }
}

/// 帧间相似度统计 `[min, max, rms]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SimilarityStats {
    pub min: f32,
    pub max: f32,
    pub rms: f32,
}

/// 场景级音频摘要
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SceneAudio {
    /// 是否包含对白（无说话人标注时为 None）
    #[serde(default)]
    pub has_dialogue: Option<bool>,
    /// 所有带响度标签的帧都是静音
    #[serde(default)]
    pub silent: Option<bool>,
    /// 所有带响度标签的帧都是静音或低响度
    #[serde(default)]
    pub quiet: Option<bool>,
}

/// 场景：在较宽松阈值下连续的一组镜头
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Scene {
    pub scene_id: u32,
    pub shot_range: [u32; 2],
    pub frame_range: Span,
    pub timestamp_range: Span,
    pub shots: Vec<Shot>,
    /// 场景内最早出现的已知类型
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_type: Option<KnownType>,
    #[serde(default)]
    pub audio: SceneAudio,
    /// 与前一场景所有帧两两相似度的统计
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sim_to_previous_scene: Option<SimilarityStats>,
    /// 与其它每个场景最大交叉相似度的平均值
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sim_to_all_scenes: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_type: Option<StructuralType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_type_group: Option<StructuralType>,
    /// 与场景时间范围重叠最多的语义分析条目
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_structure_response: Option<KeyElement>,
}

impl Scene {
    pub fn frames(&self) -> impl Iterator<Item = &Frame> + Clone {
        self.shots.iter().flat_map(|shot| shot.frames.iter())
    }

    pub fn first_frame(&self) -> Option<&Frame> {
        self.shots.first().and_then(Shot::first_frame)
    }

    pub fn last_frame(&self) -> Option<&Frame> {
        self.shots.last().and_then(Shot::last_frame)
    }

    pub fn start_millis(&self) -> u64 {
        self.timestamp_range[0]
    }
}

/// 外部语义分析返回的单个结构条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KeyElement {
    /// 起始时间（毫秒）
    pub start: u64,
    /// 结束时间（毫秒）
    pub end: u64,
    pub sequence_type: StructuralType,
    /// 降级时可采用的备选类型
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<StructuralType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// 外部语义分析结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExternalAnalysis {
    #[serde(default)]
    pub program_name: Option<String>,
    #[serde(default)]
    pub list_of_key_elements: Vec<KeyElement>,
}

/// 提交给语义分析服务的场景描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SceneDescription {
    pub scene_id: u32,
    pub timestamp_range: Span,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// 结构元素中对场景的引用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SceneRef {
    pub scene_id: u32,
    pub timestamp_range: Span,
}

/// 结构元素：共享同一分组类型的连续场景
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StructuralElement {
    #[serde(rename = "type")]
    pub element_type: StructuralType,
    pub timestamp_range: Span,
    pub scenes: Vec<SceneRef>,
    /// 为填补未标注区间而生成
    #[serde(default, skip_serializing_if = "is_false")]
    pub synthetic: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub misclassified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_type: Option<StructuralType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_type: Option<StructuralType>,
}

impl StructuralElement {
    pub fn first_scene_id(&self) -> Option<u32> {
        self.scenes.first().map(|s| s.scene_id)
    }

    pub fn last_scene_id(&self) -> Option<u32> {
        self.scenes.last().map(|s| s.scene_id)
    }
}

/// SMPTE 边界标记
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SmpteMarker {
    pub label: String,
    #[serde(rename = "type")]
    pub marker_type: StructuralType,
    pub frame_num: u64,
    pub smpte_timecode: String,
    pub timestamp_millis: u64,
}

/// 响度分组
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoudnessGroup {
    pub label: LoudnessTag,
    pub timestamp_range: Span,
    /// `[min, max, mean]`
    pub min_max_mean: [f32; 3],
}

/// 音频元数据（按起始时间单调排序）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AudioSignals {
    /// 对白停顿区间
    #[serde(default)]
    pub pauses: Vec<Span>,
    #[serde(default)]
    pub loudness: Vec<LoudnessGroup>,
}

impl AudioSignals {
    pub fn is_empty(&self) -> bool {
        self.pauses.is_empty() && self.loudness.is_empty()
    }

    /// 包含给定时间点的停顿区间
    pub fn pause_at(&self, timestamp: u64) -> Option<Span> {
        let idx = self.pauses.partition_point(|p| p[0] <= timestamp);
        if idx == 0 {
            return None;
        }
        let pause = self.pauses[idx - 1];
        (pause[1] >= timestamp).then_some(pause)
    }

    /// 包含给定时间点的响度分组
    pub fn loudness_at(&self, timestamp: u64) -> Option<&LoudnessGroup> {
        let idx = self
            .loudness
            .partition_point(|g| g.timestamp_range[0] <= timestamp);
        if idx == 0 {
            return None;
        }
        let group = &self.loudness[idx - 1];
        (group.timestamp_range[1] >= timestamp).then_some(group)
    }

    /// 为缺少音频标签的帧补充响度与停顿信息
    ///
    /// 没有停顿数据时不推断对白状态。
    pub fn annotate_frames<'a>(&self, frames: impl IntoIterator<Item = &'a mut Frame>) {
        for frame in frames {
            if frame.loudness_level.is_none() {
                frame.loudness_level = self.loudness_at(frame.timestamp_millis).map(|g| g.label);
            }
            if frame.pause_in_dialogue.is_none() && !self.pauses.is_empty() {
                frame.pause_in_dialogue = Some(self.pause_at(frame.timestamp_millis).is_some());
            }
        }
    }
}

/// 广告插入候选点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AdBreakCandidate {
    pub scene_id: u32,
    pub timestamp_range: Span,
    pub weight: f32,
    pub reason: String,
    /// 选中时使用的相似度
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen_sim: Option<f32>,
    /// 与起点重合的对白停顿
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause: Option<Span>,
    /// 与起点重合的响度分组
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loudness_props: Option<LoudnessGroup>,
    /// 按权重降序、时间升序得到的名次（从 1 开始，可重新计算）
    #[serde(default)]
    pub ranking: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_hex_roundtrip_and_rejects_garbage() {
        let hash = PerceptualHash::try_from("0fa1".to_string()).unwrap();
        assert_eq!(hash.as_bytes(), &[0x0f, 0xa1]);
        assert_eq!(String::from(hash), "0fa1");
        assert!(PerceptualHash::try_from("abc".to_string()).is_err());
        assert!(PerceptualHash::try_from("zz".to_string()).is_err());
    }

    #[test]
    fn test_audio_lookup() {
        let audio = AudioSignals {
            pauses: vec![[1000, 2000], [5000, 5500]],
            loudness: vec![LoudnessGroup {
                label: LoudnessTag::Quiet,
                timestamp_range: [0, 3000],
                min_max_mean: [-40.0, -20.0, -30.0],
            }],
        };
        assert_eq!(audio.pause_at(1500), Some([1000, 2000]));
        assert_eq!(audio.pause_at(2000), Some([1000, 2000]));
        assert_eq!(audio.pause_at(3000), None);
        assert_eq!(audio.pause_at(500), None);
        assert_eq!(audio.loudness_at(2999).map(|g| g.label), Some(LoudnessTag::Quiet));
        assert!(audio.loudness_at(3001).is_none());
    }

    #[test]
    fn test_frame_rejects_unknown_fields() {
        let json = r#"{"frameNum":1,"timestampMillis":0,"embedding":[1.0],"hash":"00","bogus":1}"#;
        assert!(serde_json::from_str::<Frame>(json).is_err());
        let json = r#"{"frameNum":1,"timestampMillis":0,"embedding":[1.0],"hash":"00"}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.frame_num, 1);
        assert!(!frame.dirty);
    }
}
