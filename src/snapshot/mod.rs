//! 快照模块 - 每个协调周期产生一次的不可变聚合视图
//!
//! 插件只通过`&SnapShot`读取，借用在调用结束时失效，无法跨周期持有。

pub mod board;

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::proto::taskd::Position;

pub use board::StatusBoard;

/// Manager的参与者名称
pub const MANAGER_NAME: &str = "manager";
/// Controller的参与者名称
pub const CONTROLLER_NAME: &str = "controller";

/// 状态表/命令表中的约定键
pub mod keys {
    /// Agent: 主进程不可恢复故障
    pub const MASTER_FAULT: &str = "master_fault";
    /// Agent: 单调递增的故障序号
    pub const FAULT_SEQ: &str = "fault_seq";
    /// Agent: 故障rank列表
    pub const FAULT_RANKS: &str = "fault_ranks";
    /// Controller命令: 杀死主控
    pub const KILL_MASTER: &str = "kill_master";
    /// Controller命令: 故障恢复进行中
    pub const FAULT_RECOVERY: &str = "fault_recovery";
    /// Worker状态/命令: 默认域采集
    pub const PROFILING_DEFAULT: &str = "profiling_default";
    /// Worker状态/命令: 通信域采集
    pub const PROFILING_COMM: &str = "profiling_comm";
}

pub fn worker_name(server_rank: u32, process_rank: u32) -> String {
    format!("worker-{}-{}", server_rank, process_rank)
}

pub fn agent_name(server_rank: u32) -> String {
    format!("agent-{}", server_rank)
}

/// 单个参与者的状态与命令表
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub pos: Position,
    pub status: HashMap<String, String>,
    pub command: HashMap<String, String>,
    pub heartbeat: Option<DateTime<Utc>>,
}

impl ParticipantInfo {
    pub fn new(pos: Position) -> Self {
        Self {
            pos,
            ..Default::default()
        }
    }

    pub fn status_of(&self, key: &str) -> Option<&str> {
        self.status.get(key).map(String::as_str)
    }

    pub fn command_of(&self, key: &str) -> Option<&str> {
        self.command.get(key).map(String::as_str)
    }
}

/// 每周期的聚合快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapShot {
    pub job_name: String,
    pub tick: u64,
    /// 作业期望的Worker总数
    pub expected_workers: usize,
    pub worker_infos: BTreeMap<String, ParticipantInfo>,
    pub agent_infos: BTreeMap<String, ParticipantInfo>,
    pub cluster_infos: BTreeMap<String, ParticipantInfo>,
    pub mgr_infos: BTreeMap<String, ParticipantInfo>,
}

impl SnapShot {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            ..Default::default()
        }
    }

    /// 按名称查找参与者
    pub fn participant(&self, name: &str) -> Option<&ParticipantInfo> {
        self.worker_infos
            .get(name)
            .or_else(|| self.agent_infos.get(name))
            .or_else(|| self.cluster_infos.get(name))
            .or_else(|| self.mgr_infos.get(name))
    }
}

/// 参与者名称到地址的解析
pub trait AddressBook {
    fn position_of(&self, name: &str) -> Option<&Position>;
}

impl AddressBook for SnapShot {
    fn position_of(&self, name: &str) -> Option<&Position> {
        self.participant(name).map(|info| &info.pos)
    }
}

/// 快照生产者
pub trait SnapshotSource: Send + Sync {
    /// 暂时无法产出快照时返回None，本周期跳过
    fn snapshot(&self) -> Option<SnapShot>;
}
