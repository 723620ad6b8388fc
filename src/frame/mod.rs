//! 帧校验模块
//!
//! 校验入站消息的目的地址并原地规范化。校验失败时帧保持不变。

use log::warn;
use thiserror::Error;

use crate::address::{RankSet, Role, PROCESS_RANK_NA};
use crate::proto::taskd::Message;

/// 成功状态码
pub const ACK_OK: u32 = 0;

/// 帧校验错误
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("message is nil")]
    NilMessage,
    #[error("message header is nil")]
    NilHeader,
    #[error("src or dst position is nil")]
    NilPosition,
    #[error("dst role is illegal")]
    DstRoleIllegal,
    #[error("dst server rank is illegal")]
    DstSrvRankIllegal,
    #[error("dst process rank is illegal")]
    DstProcessRankIllegal,
}

impl FrameError {
    /// 写入Ack的状态码
    pub fn code(&self) -> u32 {
        match self {
            FrameError::NilMessage => 1,
            FrameError::NilHeader => 2,
            FrameError::NilPosition => 3,
            FrameError::DstRoleIllegal => 4,
            FrameError::DstSrvRankIllegal => 5,
            FrameError::DstProcessRankIllegal => 6,
        }
    }

    pub fn from_code(code: u32) -> Option<FrameError> {
        match code {
            1 => Some(FrameError::NilMessage),
            2 => Some(FrameError::NilHeader),
            3 => Some(FrameError::NilPosition),
            4 => Some(FrameError::DstRoleIllegal),
            5 => Some(FrameError::DstSrvRankIllegal),
            6 => Some(FrameError::DstProcessRankIllegal),
            _ => None,
        }
    }

    /// 指标标签
    pub fn reason(&self) -> &'static str {
        match self {
            FrameError::NilMessage => "nil_message",
            FrameError::NilHeader => "nil_header",
            FrameError::NilPosition => "nil_position",
            FrameError::DstRoleIllegal => "dst_role_illegal",
            FrameError::DstSrvRankIllegal => "dst_srv_rank_illegal",
            FrameError::DstProcessRankIllegal => "dst_process_rank_illegal",
        }
    }
}

/// 校验并规范化消息帧
///
/// 1. 消息、消息头、src/dst必须存在
/// 2. dst角色必须属于封闭角色集合
/// 3. 含广播符的server_rank改写为"*"，否则必须是干净的整数列表
/// 4. 无进程属性的角色process_rank强制为"-1"，否则按server_rank规则校验
///
/// 对自身输出再次调用不会产生任何变化。
pub fn validate_and_correct_frame(msg: Option<&mut Message>) -> Result<(), FrameError> {
    let result = correct(msg);
    if let Err(e) = &result {
        warn!("frame rejected: {}", e);
        metrics::counter!("taskd_frames_rejected_total", "reason" => e.reason()).increment(1);
    }
    result
}

fn correct(msg: Option<&mut Message>) -> Result<(), FrameError> {
    let msg = msg.ok_or(FrameError::NilMessage)?;
    let header = msg.header.as_mut().ok_or(FrameError::NilHeader)?;
    if header.src.is_none() {
        return Err(FrameError::NilPosition);
    }
    let dst = header.dst.as_mut().ok_or(FrameError::NilPosition)?;

    let role = Role::parse(&dst.role).ok_or(FrameError::DstRoleIllegal)?;
    let server_rank = RankSet::parse(&dst.server_rank).ok_or(FrameError::DstSrvRankIllegal)?;

    // 全部校验通过后才写回
    let process_rank = if role.has_process_property() {
        let ranks = RankSet::parse(&dst.process_rank).ok_or(FrameError::DstProcessRankIllegal)?;
        normalized(&dst.process_rank, &ranks)
    } else {
        PROCESS_RANK_NA.to_string()
    };

    dst.server_rank = normalized(&dst.server_rank, &server_rank);
    dst.process_rank = process_rank;
    Ok(())
}

/// 广播改写为规范符，整数列表保持原样
fn normalized(raw: &str, ranks: &RankSet) -> String {
    if ranks.is_broadcast() {
        ranks.canonical()
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        for code in 1..=6 {
            let err = FrameError::from_code(code).unwrap();
            assert_eq!(err.code(), code);
        }
        assert_eq!(FrameError::from_code(ACK_OK), None);
    }
}
