//! 插件契约 - Predicate → Handle → PullMsg
//!
//! 每个插件是一个长期存在的有状态决策单元。运行时每周期用同一份快照
//! 依次驱动所有插件，插件的出站消息通过`pull_msg`一次性取走。

pub mod profiling;
pub mod rescheduling;
pub mod runtime;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::feature::{Feature, UnknownFeatureCode};
use crate::snapshot::SnapShot;

pub use profiling::ProfilingConsensusPlugin;
pub use rescheduling::JobReschedulingPlugin;
pub use runtime::{MsgSink, PluginRuntime, TickReport};

/// 插件错误
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("插件已注册: {0}")]
    DuplicatePlugin(String),
    #[error("插件未注册: {0}")]
    UnknownPlugin(String),
    #[error("接收者不存在: {0}")]
    MissingReceiver(String),
    #[error("插件状态异常: {0}")]
    InvalidState(String),
    #[error("消息编码错误: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Feature(#[from] UnknownFeatureCode),
}

/// 本周期是否参与
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateStatus {
    Candidate,
    Unselect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredicateResult {
    pub plugin_name: String,
    pub candidate_status: CandidateStatus,
    pub predicate_stream: HashMap<String, String>,
}

impl PredicateResult {
    pub fn candidate(plugin_name: &str) -> Self {
        Self {
            plugin_name: plugin_name.to_string(),
            candidate_status: CandidateStatus::Candidate,
            predicate_stream: HashMap::new(),
        }
    }

    pub fn unselect(plugin_name: &str) -> Self {
        Self {
            plugin_name: plugin_name.to_string(),
            candidate_status: CandidateStatus::Unselect,
            predicate_stream: HashMap::new(),
        }
    }

    pub fn with_stream(mut self, key: &str, value: impl Into<String>) -> Self {
        self.predicate_stream.insert(key.to_string(), value.into());
        self
    }

    pub fn is_candidate(&self) -> bool {
        self.candidate_status == CandidateStatus::Candidate
    }
}

/// 处理阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleStage {
    Init,
    /// 后续周期继续处理
    Process,
    /// 本轮工作完成
    Final,
    Exception,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleResult {
    pub stage: HandleStage,
}

impl HandleResult {
    pub fn new(stage: HandleStage) -> Self {
        Self { stage }
    }

    /// Final与Exception都表示插件的临时状态已经落定
    pub fn is_settled(&self) -> bool {
        matches!(self.stage, HandleStage::Final | HandleStage::Exception)
    }
}

/// 消息体，以JSON字符串承载于`Message.body`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MsgBody {
    pub msg_type: String,
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub extension: HashMap<String, String>,
}

impl MsgBody {
    pub fn new(feature: Feature, message: impl Into<String>) -> Self {
        Self {
            msg_type: feature.msg_type().to_string(),
            code: feature.code(),
            message: message.into(),
            extension: HashMap::new(),
        }
    }

    pub fn with_extension(mut self, key: &str, value: impl Into<String>) -> Self {
        self.extension.insert(key.to_string(), value.into());
        self
    }

    pub fn feature(&self) -> Result<Feature, UnknownFeatureCode> {
        Feature::try_from(self.code)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// 与地址无关的出站消息，可有多个接收者
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub receivers: Vec<String>,
    pub body: MsgBody,
}

impl Msg {
    pub fn new(receivers: Vec<String>, body: MsgBody) -> Self {
        Self { receivers, body }
    }

    pub fn to(receiver: impl Into<String>, body: MsgBody) -> Self {
        Self {
            receivers: vec![receiver.into()],
            body,
        }
    }
}

/// 插件私有的出站队列，单消费者，取走即清空
#[derive(Debug, Default)]
pub struct MsgQueue {
    pending: Vec<Msg>,
}

impl MsgQueue {
    pub fn push(&mut self, msg: Msg) {
        self.pending.push(msg);
    }

    pub fn drain(&mut self) -> Vec<Msg> {
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Manager侧插件
///
/// `predicate`只读快照并把本周期需要的数据暂存到实例字段，
/// `handle`基于暂存数据修改权威状态并生成消息。
/// 同一实例只会被单一控制流调用。
pub trait ManagerPlugin: Send {
    fn name(&self) -> &str;

    fn predicate(&mut self, shot: &SnapShot) -> Result<PredicateResult, PluginError>;

    fn handle(&mut self) -> Result<HandleResult, PluginError>;

    /// 返回并清空全部待发消息
    fn pull_msg(&mut self) -> Vec<Msg>;

    /// 注销或关闭时调用一次
    fn release(&mut self) -> Result<(), PluginError>;
}
