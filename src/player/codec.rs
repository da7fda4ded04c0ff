use crate::core::{FramePayload, Rational, Result};
use crate::player::demuxer_source::MediaPacket;

/// `send_packet` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// 已接收
    Accepted,
    /// 暂时不能接收输入，必须先取走已有输出（EAGAIN）
    Again,
}

/// `receive_frame` 的结果
#[derive(Debug)]
pub enum ReceiveStatus {
    Frame(DecodedFrame),
    /// 需要更多输入（EAGAIN）
    Again,
    /// 当前这一代数据已全部输出
    Eof,
}

/// 解码原语产出的一帧
///
/// 时间戳以 `time_base` 为单位；音频帧已经转换成输出设备的采样格式。
#[derive(Debug, Default)]
pub struct DecodedFrame {
    pub pts: Option<i64>,
    pub pkt_dts: Option<i64>,
    pub best_effort: Option<i64>,
    pub time_base: Rational,
    /// 在源中的字节位置，未知为 -1
    pub pos: i64,
    /// 采样宽高比，未知为 0/1
    pub sar: Rational,
    pub payload: FramePayload,
}

/// 解码原语接口
///
/// 语义与 FFmpeg 的 send/receive 模型一致：
/// `send_packet(None)` 进入排空模式，之后 `receive_frame` 最终返回 `Eof`；
/// `flush` 清空内部状态并退出排空模式。
pub trait DecodeBackend: Send {
    fn send_packet(&mut self, packet: Option<&MediaPacket>) -> Result<SendStatus>;

    fn receive_frame(&mut self) -> Result<ReceiveStatus>;

    fn flush(&mut self);

    /// 获取描述信息（用于调试）
    fn description(&self) -> String;
}
