use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use crate::boundary_refiner::{BoundaryFrame, SampledFrames};
use crate::models::{ExternalAnalysis, SceneDescription};

/// 外部抽帧服务：在两帧之间补充采样帧并计算嵌入
#[async_trait]
pub trait FrameSampler: Send + Sync {
    async fn extract_frames(
        &self,
        from: &BoundaryFrame,
        to: &BoundaryFrame,
    ) -> Result<SampledFrames>;
}

/// 外部语义分析服务：根据场景描述给出节目结构
#[async_trait]
pub trait StructureAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        scene_descriptions: &[SceneDescription],
        prompt_template: &str,
    ) -> Result<ExternalAnalysis>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExtractFramesRequest<'a> {
    from_frame: &'a BoundaryFrame,
    to_frame: &'a BoundaryFrame,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest<'a> {
    scene_descriptions: &'a [SceneDescription],
    prompt_template: &'a str,
}

/// 通过 HTTP JSON 接口调用的抽帧服务
pub struct HttpFrameSampler {
    endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFrameSampler {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl FrameSampler for HttpFrameSampler {
    async fn extract_frames(
        &self,
        from: &BoundaryFrame,
        to: &BoundaryFrame,
    ) -> Result<SampledFrames> {
        let request = ExtractFramesRequest {
            from_frame: from,
            to_frame: to,
        };
        post_json(&self.client, &self.endpoint, &request, self.timeout)
            .await
            .with_context(|| format!("抽帧请求失败: {}-{}", from.frame_num, to.frame_num))
    }
}

/// 通过 HTTP JSON 接口调用的语义分析服务
pub struct HttpStructureAnalyzer {
    endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpStructureAnalyzer {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl StructureAnalyzer for HttpStructureAnalyzer {
    async fn analyze(
        &self,
        scene_descriptions: &[SceneDescription],
        prompt_template: &str,
    ) -> Result<ExternalAnalysis> {
        let request = AnalyzeRequest {
            scene_descriptions,
            prompt_template,
        };
        post_json(&self.client, &self.endpoint, &request, self.timeout)
            .await
            .context("语义分析请求失败")
    }
}

/// POST JSON 并解析响应，非 2xx 状态视为失败
async fn post_json<Req: Serialize + ?Sized, Resp: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    body: &Req,
    timeout: Duration,
) -> Result<Resp> {
    let response = client
        .post(url)
        .json(body)
        .timeout(timeout)
        .send()
        .await
        .with_context(|| format!("请求失败: {}", url))?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        tracing::warn!("服务返回错误状态: {} - {} - {}", url, status, error_text);
        anyhow::bail!("服务返回错误状态: {}", status);
    }

    response
        .json::<Resp>()
        .await
        .with_context(|| format!("解析响应失败: {}", url))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_payload_shape() {
        let from = BoundaryFrame {
            frame_num: 10,
            timestamp_millis: 400,
            smpte_timecode: "00:00:00:10".to_string(),
        };
        let to = BoundaryFrame {
            frame_num: 35,
            timestamp_millis: 1400,
            smpte_timecode: "00:00:01:10".to_string(),
        };
        let json = serde_json::to_value(ExtractFramesRequest {
            from_frame: &from,
            to_frame: &to,
        })
        .unwrap();
        assert_eq!(json["fromFrame"]["frameNum"], 10);
        assert_eq!(json["toFrame"]["timestampMillis"], 1400);

        let scenes = vec![SceneDescription {
            scene_id: 0,
            timestamp_range: [0, 1000],
            description: None,
        }];
        let json = serde_json::to_value(AnalyzeRequest {
            scene_descriptions: &scenes,
            prompt_template: "describe",
        })
        .unwrap();
        assert_eq!(json["sceneDescriptions"][0]["sceneId"], 0);
        assert_eq!(json["promptTemplate"], "describe");
    }
}
