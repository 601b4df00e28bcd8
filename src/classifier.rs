use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    ExternalAnalysis, KeyElement, KnownType, Scene, SceneDescription, SceneRef, Span,
    StructuralElement, StructuralType,
};
use crate::similarity::{intervals_intersect, overlap_len};

/// 结构分类器：标注场景类型、折叠为结构元素并校验时间顺序
pub struct StructuralClassifier {
    /// 是否启用时间顺序校验
    validate_temporal_order: bool,
}

/// 元素级信号，用于降级判断
#[derive(Debug, Clone, Copy, Default)]
struct ElementSignals {
    has_dialogue: bool,
    silent: bool,
    quiet: bool,
    monochrome: bool,
    sub_type: Option<StructuralType>,
}

impl ElementSignals {
    fn of(element: &StructuralElement, scenes: &[Scene]) -> Self {
        let members: Vec<&Scene> = element
            .scenes
            .iter()
            .filter_map(|r| scenes.get(r.scene_id as usize))
            .collect();
        let tagged = !members.is_empty();

        Self {
            has_dialogue: members.iter().any(|s| s.audio.has_dialogue == Some(true)),
            silent: tagged && members.iter().all(|s| s.audio.silent == Some(true)),
            quiet: tagged && members.iter().all(|s| s.audio.quiet == Some(true)),
            monochrome: members
                .iter()
                .any(|s| s.known_type == Some(KnownType::Monochrome)),
            sub_type: members
                .iter()
                .find_map(|s| s.program_structure_response.as_ref()?.sub_type),
        }
    }
}

/// 已经接受的元素类型
#[derive(Debug, Clone, Copy)]
struct Accepted {
    element_type: StructuralType,
    monochrome: bool,
    synthetic: bool,
}

impl StructuralClassifier {
    pub fn new(validate_temporal_order: bool) -> Self {
        Self {
            validate_temporal_order,
        }
    }

    /// 完整分类流程：标注场景 → 折叠元素 →（可选）时间顺序校验
    pub fn classify(
        &self,
        scenes: &mut [Scene],
        analysis: Option<&ExternalAnalysis>,
    ) -> PipelineResult<Vec<StructuralElement>> {
        self.label_scenes(scenes, analysis);
        let mut elements = self.build_elements(scenes)?;
        if self.validate_temporal_order {
            self.validate_order(&mut elements, scenes);
        }
        info!("✅ [结构分类] 共生成 {} 个结构元素", elements.len());
        Ok(elements)
    }

    /// 按优先级标注：确定性已知类型 > 语义分析 > Undefined
    pub fn label_scenes(&self, scenes: &mut [Scene], analysis: Option<&ExternalAnalysis>) {
        if analysis.is_none() {
            warn!("⚠️  [结构分类] 没有语义分析结果，仅使用已知类型标注");
        }

        for scene in scenes.iter_mut() {
            let matched = analysis.and_then(|a| best_key_element(a, scene.timestamp_range));
            let segment_type = match (scene.known_type, matched) {
                (Some(known), _) => known.structural_type(),
                (None, Some(element)) => element.sequence_type,
                (None, None) => StructuralType::Undefined,
            };
            scene.program_structure_response = matched.cloned();
            scene.segment_type = Some(segment_type);
            scene.segment_type_group = Some(segment_type.group());
        }
    }

    /// 把分组类型相同的连续场景折叠为元素
    ///
    /// 未标注（Undefined）的场景段折叠为合成的 Programme 元素；
    /// 元素之间及开头的空隙同样用合成 Programme 填补，覆盖 `[0, 最后场景结束]`。
    pub fn build_elements(&self, scenes: &[Scene]) -> PipelineResult<Vec<StructuralElement>> {
        if scenes.is_empty() {
            return Err(PipelineError::EmptyInput("scenes"));
        }

        let group_of =
            |scene: &Scene| scene.segment_type_group.unwrap_or(StructuralType::Undefined);
        let mut elements: Vec<StructuralElement> = Vec::new();
        let mut start = 0;
        while start < scenes.len() {
            let group = group_of(&scenes[start]);
            let mut end = start;
            while end + 1 < scenes.len() && group_of(&scenes[end + 1]) == group {
                end += 1;
            }

            let synthetic = group == StructuralType::Undefined;
            if synthetic {
                debug!(
                    "[结构分类] 场景 {}-{} 未标注，填补为 Programme",
                    scenes[start].scene_id, scenes[end].scene_id
                );
            }
            elements.push(StructuralElement {
                element_type: if synthetic {
                    StructuralType::Programme
                } else {
                    group
                },
                timestamp_range: [
                    scenes[start].timestamp_range[0],
                    scenes[end].timestamp_range[1],
                ],
                scenes: scenes[start..=end]
                    .iter()
                    .map(|s| SceneRef {
                        scene_id: s.scene_id,
                        timestamp_range: s.timestamp_range,
                    })
                    .collect(),
                synthetic,
                misclassified: false,
                original_type: None,
                suggested_type: None,
            });
            start = end + 1;
        }

        elements.sort_by_key(|e| e.timestamp_range[0]);
        Ok(backfill(elements))
    }

    /// 时间顺序校验：顺序扫描，每个元素只与已接受的前序类型比较
    fn validate_order(&self, elements: &mut [StructuralElement], scenes: &[Scene]) {
        let mut accepted: Vec<Accepted> = Vec::with_capacity(elements.len());

        for element in elements.iter_mut() {
            // 空隙填补元素不含场景，不参与校验
            if element.scenes.is_empty() {
                continue;
            }
            let signals = ElementSignals::of(element, scenes);
            let original = element.element_type;

            let mut current = check_technical_slate(original, &accepted);
            current = check_recap_intro(current, &accepted, &signals);
            current = check_after_end_credits(current, &accepted, &signals);
            current = check_textless(current, &accepted);
            current = check_transition(current, &signals);

            if current != original {
                info!(
                    "🔁 [结构分类] 元素 {:?} 由 {} 降级为 {}",
                    element.timestamp_range, original, current
                );
                element.misclassified = true;
                element.original_type = Some(original);
                element.suggested_type = Some(current);
                element.element_type = current;
            }

            accepted.push(Accepted {
                element_type: current,
                monochrome: signals.monochrome,
                synthetic: element.synthetic,
            });
        }
    }
}

/// 与场景时间范围重叠最多的语义分析条目，重叠相同时取靠前者
fn best_key_element(analysis: &ExternalAnalysis, range: Span) -> Option<&KeyElement> {
    let point = range[0] == range[1];
    let mut best: Option<(&KeyElement, u64)> = None;
    for element in &analysis.list_of_key_elements {
        let span = [element.start, element.end];
        let overlap = overlap_len(range, span);
        let matches = overlap > 0 || (point && intervals_intersect(range, span, true));
        if !matches {
            continue;
        }
        if best.map_or(true, |(_, o)| overlap > o) {
            best = Some((element, overlap));
        }
    }
    best.map(|(element, _)| element)
}

/// 填补开头及元素之间的空隙
///
/// 与合成 Programme 元素相邻的空隙并入该元素，其余空隙插入一个不含场景的合成 Programme。
/// 有标注的元素保持其场景的真实时间范围。
fn backfill(elements: Vec<StructuralElement>) -> Vec<StructuralElement> {
    let mut filled: Vec<StructuralElement> = Vec::with_capacity(elements.len() * 2);
    let mut uncovered = 0u64;
    for mut element in elements {
        let start = element.timestamp_range[0];
        if start > uncovered {
            let extend_previous = filled.last().map_or(false, |prev| prev.synthetic);
            if extend_previous {
                if let Some(prev) = filled.last_mut() {
                    prev.timestamp_range[1] = start - 1;
                }
            } else if element.synthetic {
                element.timestamp_range[0] = uncovered;
            } else {
                debug!("[结构分类] 空隙 [{}, {}] 填补为 Programme", uncovered, start - 1);
                filled.push(gap_filler([uncovered, start - 1]));
            }
        }
        uncovered = uncovered.max(element.timestamp_range[1].saturating_add(1));
        filled.push(element);
    }
    filled
}

fn gap_filler(range: Span) -> StructuralElement {
    StructuralElement {
        element_type: StructuralType::Programme,
        timestamp_range: range,
        scenes: Vec::new(),
        synthetic: true,
        misclassified: false,
        original_type: None,
        suggested_type: None,
    }
}

/// 场记板之前只能出现技术性内容
fn check_technical_slate(current: StructuralType, accepted: &[Accepted]) -> StructuralType {
    if current != StructuralType::TechnicalSlate {
        return current;
    }
    let valid = accepted
        .iter()
        .all(|a| a.element_type.is_technical() || a.monochrome);
    if valid {
        current
    } else {
        StructuralType::Programme
    }
}

/// 前情提要/片头只能出现在正片之前
fn check_recap_intro(
    current: StructuralType,
    accepted: &[Accepted],
    signals: &ElementSignals,
) -> StructuralType {
    let programme_seen = accepted
        .iter()
        .any(|a| a.element_type == StructuralType::Programme && !a.synthetic);
    if !programme_seen {
        return current;
    }

    let mut current = current;
    let mut sub_type = signals.sub_type;
    while matches!(current, StructuralType::Recap | StructuralType::Intro) {
        if let Some(sub) = sub_type.take().filter(|s| *s != current) {
            current = sub;
            continue;
        }
        current = match current {
            StructuralType::Recap => StructuralType::Intro,
            _ => StructuralType::Programme,
        };
    }
    current
}

/// 片尾字幕之后不能再出现片头字幕或正片
fn check_after_end_credits(
    current: StructuralType,
    accepted: &[Accepted],
    signals: &ElementSignals,
) -> StructuralType {
    let ended = accepted.iter().any(|a| {
        matches!(
            a.element_type,
            StructuralType::EndCredits
                | StructuralType::PostCreditsScene
                | StructuralType::TextlessElement
        )
    });
    if !ended {
        return current;
    }

    let mut current = current;
    let mut sub_type = signals.sub_type;
    while matches!(
        current,
        StructuralType::OpeningCredits | StructuralType::Programme
    ) {
        if let Some(sub) = sub_type.take().filter(|s| *s != current) {
            current = sub;
            continue;
        }
        current = match current {
            StructuralType::OpeningCredits => StructuralType::Programme,
            _ if signals.has_dialogue => StructuralType::PostCreditsScene,
            _ if signals.silent => StructuralType::TextlessElement,
            _ => StructuralType::Undefined,
        };
    }
    current
}

/// 无字幕素材必须位于片尾字幕之后
fn check_textless(current: StructuralType, accepted: &[Accepted]) -> StructuralType {
    if current != StructuralType::TextlessElement {
        return current;
    }
    if accepted
        .iter()
        .any(|a| a.element_type == StructuralType::EndCredits)
    {
        current
    } else {
        StructuralType::Programme
    }
}

/// 转场必须无对白，且为单色或低响度
fn check_transition(current: StructuralType, signals: &ElementSignals) -> StructuralType {
    if current != StructuralType::Transition {
        return current;
    }
    if !signals.has_dialogue && (signals.monochrome || signals.quiet) {
        current
    } else {
        StructuralType::Programme
    }
}

/// 提交给语义分析服务的场景摘要
pub fn describe_scenes(scenes: &[Scene]) -> Vec<SceneDescription> {
    scenes
        .iter()
        .map(|scene| {
            let mut parts = vec![format!(
                "{} shots, {}ms",
                scene.shots.len(),
                scene.timestamp_range[1].saturating_sub(scene.timestamp_range[0])
            )];
            if let Some(known) = scene.known_type {
                parts.push(format!("{:?}", known));
            }
            match scene.audio.has_dialogue {
                Some(true) => parts.push("dialogue".to_string()),
                Some(false) => parts.push("no dialogue".to_string()),
                None => {}
            }
            if scene.audio.silent == Some(true) {
                parts.push("silent".to_string());
            }
            SceneDescription {
                scene_id: scene.scene_id,
                timestamp_range: scene.timestamp_range,
                description: Some(parts.join(", ")),
            }
        })
        .collect()
}
