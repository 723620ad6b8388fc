//! 传输层 - 同步请求/Ack，调用方有限次重试
//!
//! 传输实现本身不做自动重试，重试只发生在`send_with_retry`调用处。

pub mod heartbeat;
pub mod local;
#[cfg(feature = "zmq-transport")]
pub mod zmq;

use std::thread;
use std::time::Duration;

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::frame::{validate_and_correct_frame, FrameError, ACK_OK};
use crate::plugin::{Msg, MsgSink};
use crate::proto::taskd::{Ack, Message, MessageHeader, Position};
use crate::snapshot::{AddressBook, SnapShot};

pub use heartbeat::HeartbeatSender;
pub use local::{BusTransport, LocalBus, Mailbox};

/// 接收端无法投递或中继
pub const ACK_UNROUTABLE: u32 = 100;

/// 传输错误
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("destination unreachable: {0}")]
    Unreachable(String),
    #[error("frame rejected by receiver, code {0}")]
    Rejected(u32),
    #[error("ack timeout after {0:?}")]
    Timeout(Duration),
    #[error("ack uuid mismatch: expected {expected}, got {got}")]
    AckMismatch { expected: String, got: String },
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),
    #[error("Protobuf encode error: {0}")]
    Encode(#[from] prost::EncodeError),
    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("transport closed")]
    Closed,
    #[error("send failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<TransportError>,
    },
    #[cfg(feature = "zmq-transport")]
    #[error("ZMQ error: {0}")]
    Zmq(#[from] ::zmq::Error),
}

impl TransportError {
    /// 接收端明确拒绝的帧重发也不会成功
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Rejected(_) | TransportError::Frame(_))
    }
}

/// 传输协作方
pub trait Transport: Send + Sync {
    /// 发送一条消息并同步等待Ack
    fn sync_send_message(
        &self,
        uuid: &str,
        mtype: &str,
        body: &str,
        dst: &Position,
    ) -> Result<Ack, TransportError>;
}

/// 固定间隔重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    #[serde(with = "millis")]
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(100),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// 按策略重试发送，Ack非OK视为拒绝
pub fn send_with_retry<T: Transport + ?Sized>(
    transport: &T,
    policy: &RetryPolicy,
    uuid: &str,
    mtype: &str,
    body: &str,
    dst: &Position,
) -> Result<Ack, TransportError> {
    let attempts = policy.attempts.max(1);
    let mut last = TransportError::Closed;
    for attempt in 1..=attempts {
        let result = transport
            .sync_send_message(uuid, mtype, body, dst)
            .and_then(|ack| match ack.code {
                ACK_OK => Ok(ack),
                code => Err(TransportError::Rejected(code)),
            });
        match result {
            Ok(ack) => return Ok(ack),
            Err(e) if !e.is_retryable() => {
                error!("send {} to {} rejected: {}", uuid, dst, e);
                return Err(e);
            }
            Err(e) => {
                warn!("send {} to {} failed (attempt {}/{}): {}", uuid, dst, attempt, attempts, e);
                last = e;
                if attempt < attempts {
                    thread::sleep(policy.delay);
                }
            }
        }
    }
    Err(TransportError::RetriesExhausted {
        attempts,
        last: Box::new(last),
    })
}

/// 组装一条线上消息
pub fn build_message(uuid: &str, mtype: &str, body: &str, src: &Position, dst: &Position) -> Message {
    Message {
        header: Some(MessageHeader {
            uuid: uuid.to_string(),
            mtype: mtype.to_string(),
            src: Some(src.clone()),
            dst: Some(dst.clone()),
        }),
        body: body.to_string(),
    }
}

/// 一批消息的投递统计，按接收者计数
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
}

/// 把插件产出的Msg解析为地址并逐个接收者发送
pub struct MsgDispatcher<T: Transport> {
    transport: T,
    src: Position,
    policy: RetryPolicy,
}

impl<T: Transport> MsgDispatcher<T> {
    pub fn new(transport: T, src: Position, policy: RetryPolicy) -> Self {
        Self {
            transport,
            src,
            policy,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn dispatch_msgs<B: AddressBook + ?Sized>(&self, book: &B, msgs: &[Msg]) -> DispatchReport {
        let mut report = DispatchReport::default();
        for msg in msgs {
            let body = match msg.body.to_json() {
                Ok(b) => b,
                Err(e) => {
                    error!("failed to encode msg body {:?}: {}", msg.body, e);
                    report.failed += msg.receivers.len();
                    continue;
                }
            };
            for receiver in &msg.receivers {
                match self.send_one(book, receiver, &msg.body.msg_type, &body) {
                    Ok(()) => report.sent += 1,
                    Err(e) => {
                        error!("dispatch to {} failed: {}", receiver, e);
                        report.failed += 1;
                    }
                }
            }
        }
        metrics::counter!("taskd_messages_sent_total").increment(report.sent as u64);
        metrics::counter!("taskd_messages_failed_total").increment(report.failed as u64);
        report
    }

    fn send_one<B: AddressBook + ?Sized>(
        &self,
        book: &B,
        receiver: &str,
        mtype: &str,
        body: &str,
    ) -> Result<(), TransportError> {
        let dst = book
            .position_of(receiver)
            .ok_or_else(|| TransportError::Unreachable(receiver.to_string()))?;
        let uuid = Uuid::new_v4().to_string();

        // 本地先校验，非法地址不上线
        let mut frame = build_message(&uuid, mtype, body, &self.src, dst);
        validate_and_correct_frame(Some(&mut frame))?;
        let dst = frame
            .header
            .and_then(|h| h.dst)
            .ok_or(TransportError::Frame(FrameError::NilPosition))?;

        let ack = send_with_retry(&self.transport, &self.policy, &uuid, mtype, body, &dst)?;
        debug!("msg {} to {} acked by {:?}", uuid, receiver, ack.src);
        Ok(())
    }
}

impl<T: Transport> MsgSink for MsgDispatcher<T> {
    fn dispatch(&self, shot: &SnapShot, msgs: &[Msg]) -> DispatchReport {
        self.dispatch_msgs(shot, msgs)
    }
}
