use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};
use crate::models::{Frame, Scene, SmpteMarker, StructuralElement, StructuralType};

/// 各结构类型的首帧/末帧标签
const LABEL_TABLE: &[(StructuralType, &str, &str)] = &[
    (StructuralType::BlackFrames, "FFCB", "LFCB"),
    (StructuralType::Transition, "FFTR", "LFTR"),
    (StructuralType::TechnicalSlate, "FFHS", "LFHS"),
    (StructuralType::ColorBars, "FFBT", "LFBT"),
    (StructuralType::CountdownClock, "FFCD", "LFCD"),
    (StructuralType::Idents, "FFCL", "LFCL"),
    (StructuralType::Recap, "FFRC", "LFRC"),
    (StructuralType::Intro, "FFIN", "LFIN"),
    (StructuralType::OpeningCredits, "FFTC", "LFTC"),
    (StructuralType::Title, "FFTI", "LFTI"),
    (StructuralType::Programme, "FFSP", "LFSP"),
    (StructuralType::Rating, "FFRT", "LFRT"),
    (StructuralType::EndCredits, "FFEC", "LFEC"),
    (StructuralType::NextEpisodeCredits, "FFNE", "LFNE"),
    (StructuralType::PostCreditsScene, "FFPC", "LFPC"),
    (StructuralType::TextlessElement, "FFTS", "LFTS"),
];

/// 节目成片首帧
pub const FIRST_FRAME_OF_COMPOSITION: &str = "FFOC";
/// 节目成片末帧
pub const LAST_FRAME_OF_COMPOSITION: &str = "LFOC";

/// 结构类型对应的首帧/末帧标签，`Undefined` 没有标签
pub fn labels_for(element_type: StructuralType) -> Option<(&'static str, &'static str)> {
    LABEL_TABLE
        .iter()
        .find(|(t, _, _)| *t == element_type)
        .map(|(_, first, last)| (*first, *last))
}

/// 根据标签反查结构类型，未知标签属于配置错误
pub fn type_for_label(label: &str) -> PipelineResult<StructuralType> {
    if label == FIRST_FRAME_OF_COMPOSITION || label == LAST_FRAME_OF_COMPOSITION {
        return Ok(StructuralType::Programme);
    }
    LABEL_TABLE
        .iter()
        .find(|(_, first, last)| *first == label || *last == label)
        .map(|(t, _, _)| *t)
        .ok_or_else(|| PipelineError::UnknownSmpteLabel(label.to_string()))
}

fn marker(label: &str, marker_type: StructuralType, frame: &Frame) -> SmpteMarker {
    SmpteMarker {
        label: label.to_string(),
        marker_type,
        frame_num: frame.frame_num,
        smpte_timecode: frame.smpte_timecode.clone(),
        timestamp_millis: frame.timestamp_millis,
    }
}

/// 元素首个场景的首帧与最后场景的末帧
fn element_frames<'a>(
    element: &StructuralElement,
    scenes: &'a [Scene],
) -> Option<(&'a Frame, &'a Frame)> {
    let first = scenes
        .get(element.first_scene_id()? as usize)?
        .first_frame()?;
    let last = scenes.get(element.last_scene_id()? as usize)?.last_frame()?;
    Some((first, last))
}

/// 生成 SMPTE 标记，按时间升序返回
///
/// `scenes` 必须按 `scene_id` 排列。FFOC 取第一个非技术性元素的首帧，
/// LFOC 取最后一个非技术性元素的末帧。
pub fn build_markers(
    elements: &[StructuralElement],
    scenes: &[Scene],
) -> PipelineResult<Vec<SmpteMarker>> {
    if elements.is_empty() {
        return Err(PipelineError::EmptyInput("structural elements"));
    }

    let mut markers = Vec::new();
    for element in elements {
        let Some((first_label, last_label)) = labels_for(element.element_type) else {
            continue;
        };
        let Some((first, last)) = element_frames(element, scenes) else {
            debug!("[结构分类] {} 元素没有帧，跳过标记", element.element_type);
            continue;
        };
        markers.push(marker(first_label, element.element_type, first));
        markers.push(marker(last_label, element.element_type, last));
    }

    let composition = |element: &&StructuralElement| {
        !element.element_type.is_technical() && element_frames(element, scenes).is_some()
    };
    if let Some(start) = elements.iter().find(composition) {
        if let Some((first, _)) = element_frames(start, scenes) {
            markers.push(marker(FIRST_FRAME_OF_COMPOSITION, start.element_type, first));
        }
    }
    if let Some(end) = elements.iter().rev().find(composition) {
        if let Some((_, last)) = element_frames(end, scenes) {
            markers.push(marker(LAST_FRAME_OF_COMPOSITION, end.element_type, last));
        }
    }

    markers.sort_by_key(|m| m.timestamp_millis);
    info!("✅ [结构分类] 生成 {} 个 SMPTE 标记", markers.len());
    Ok(markers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_lookup() {
        assert_eq!(labels_for(StructuralType::EndCredits), Some(("FFEC", "LFEC")));
        assert_eq!(labels_for(StructuralType::Undefined), None);
        assert_eq!(type_for_label("LFEC").unwrap(), StructuralType::EndCredits);
        assert_eq!(type_for_label("FFOC").unwrap(), StructuralType::Programme);
        assert!(matches!(
            type_for_label("XXXX"),
            Err(PipelineError::UnknownSmpteLabel(_))
        ));
    }

    #[test]
    fn test_every_label_is_unique() {
        let mut labels: Vec<&str> = LABEL_TABLE
            .iter()
            .flat_map(|(_, first, last)| [*first, *last])
            .collect();
        labels.push(FIRST_FRAME_OF_COMPOSITION);
        labels.push(LAST_FRAME_OF_COMPOSITION);
        let count = labels.len();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), count);
    }

    #[test]
    fn test_empty_elements_is_fatal() {
        assert!(matches!(
            build_markers(&[], &[]),
            Err(PipelineError::EmptyInput(_))
        ));
    }
}
