use thiserror::Error;

/// 结构分析流程的结果类型
pub type PipelineResult<T> = Result<T, PipelineError>;

/// 结构分析流程中的致命错误
///
/// 可选信号缺失（音频、语义分析等）不属于错误，只记录日志；
/// 这里的每一种错误都会中止当前流程。
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("向量维度不一致: {left} != {right}")]
    DimensionMismatch { left: usize, right: usize },

    #[error("感知哈希长度不一致: {left} != {right}")]
    HashLengthMismatch { left: usize, right: usize },

    #[error("无效的感知哈希: {0}")]
    InvalidHash(String),

    #[error("帧序号必须严格递增: {previous} 之后出现 {current}")]
    FrameOrder { previous: u64, current: u64 },

    #[error("帧序号越界: 新帧 {frame_num} 不在边界 [{from_frame}, {to_frame}] 内")]
    FrameNumbering {
        frame_num: u64,
        from_frame: u64,
        to_frame: u64,
    },

    #[error("未知的 SMPTE 标签: {0}")]
    UnknownSmpteLabel(String),

    #[error("输入为空: {0}")]
    EmptyInput(&'static str),

    #[error("边界细化重试次数超过上限 {limit}")]
    BailoutExceeded { limit: u32 },

    #[error("工作线程失败: {0}")]
    Worker(String),
}
