//! taskd 核心库入口
//!
//! 训练作业控制面的消息寻址/路由协议与基于快照的插件运行时。
//! 角色层级: Controller > Manager > Agent > Worker。

pub mod address;
pub mod command;
pub mod config;
pub mod executor;
pub mod feature;
pub mod frame;
pub mod logging;
pub mod plugin;
pub mod proto;
pub mod route;
pub mod snapshot;
pub mod transport;

/// 参与者注册错误
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("未知角色: {0}")]
    UnknownRole(String),
    #[error("非法rank: {0}")]
    InvalidRank(String),
}

/// 通用错误类型
#[derive(thiserror::Error, Debug)]
pub enum TaskdError {
    #[error("帧校验失败: {0}")]
    Frame(#[from] frame::FrameError),

    #[error("传输错误: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("插件错误: {0}")]
    Plugin(#[from] plugin::PluginError),

    #[error("配置错误: {0}")]
    Config(#[from] config::ConfigError),

    #[error("注册失败: {0}")]
    Registration(#[from] RegistrationError),

    #[error("上报处理失败: {0}")]
    Ingest(#[from] snapshot::board::IngestError),

    #[error("动作执行失败: {0}")]
    Executor(#[from] executor::ExecutorError),
}

pub type Result<T> = std::result::Result<T, TaskdError>;

// 公开导出模块的公共接口
pub use address::{Role, BROADCAST_RANK, PROCESS_RANK_NA};
pub use config::TaskdConfig;
pub use feature::Feature;
pub use frame::{validate_and_correct_frame, FrameError, ACK_OK};
pub use plugin::{
    CandidateStatus, HandleResult, HandleStage, JobReschedulingPlugin, ManagerPlugin, Msg, MsgBody,
    PluginRuntime, PredicateResult, ProfilingConsensusPlugin,
};
pub use proto::taskd::{Ack, Message, MessageHeader, Position};
pub use route::{dst_case, DstCase};
pub use snapshot::{SnapShot, StatusBoard};
pub use transport::{LocalBus, MsgDispatcher, RetryPolicy, Transport, TransportError};
