//! 状态看板 - 进程内的快照聚合器
//!
//! 收集各参与者的注册、心跳与状态上报，每个周期产出一份不可变快照。

use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::address::Role;
use crate::feature::{
    FaultCode, Feature, LifecycleCode, NicCode, ProfilingCode, RegistrationCode, StressCode,
    UnknownFeatureCode,
};
use crate::frame::FrameError;
use crate::plugin::MsgBody;
use crate::proto::taskd::{Message, Position};
use crate::RegistrationError;

use super::{
    agent_name, keys, worker_name, ParticipantInfo, SnapShot, SnapshotSource, CONTROLLER_NAME,
    MANAGER_NAME,
};

/// 入站上报处理错误
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("非法消息帧: {0}")]
    Frame(#[from] FrameError),
    #[error("消息体解析失败: {0}")]
    Body(#[from] serde_json::Error),
    #[error(transparent)]
    Feature(#[from] UnknownFeatureCode),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error("未注册的参与者: {0}")]
    UnknownParticipant(String),
}

/// 根据地址推导参与者名称，rank必须是单个整数
pub fn participant_name(pos: &Position) -> Result<String, RegistrationError> {
    let role = Role::parse(&pos.role).ok_or_else(|| RegistrationError::UnknownRole(pos.role.clone()))?;
    let single = |raw: &str| {
        raw.parse::<u32>()
            .map_err(|_| RegistrationError::InvalidRank(pos.to_string()))
    };
    let name = match role {
        Role::Worker => worker_name(single(&pos.server_rank)?, single(&pos.process_rank)?),
        Role::Agent => agent_name(single(&pos.server_rank)?),
        Role::Manager => MANAGER_NAME.to_string(),
        Role::Controller => CONTROLLER_NAME.to_string(),
    };
    Ok(name)
}

/// 状态看板
pub struct StatusBoard {
    current: Mutex<SnapShot>,
}

impl StatusBoard {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            current: Mutex::new(SnapShot::new(job_name)),
        }
    }

    pub fn set_expected_workers(&self, count: usize) {
        self.current.lock().expected_workers = count;
    }

    /// 注册参与者，按角色放入对应的子表；重复注册保留已有状态
    pub fn register(&self, pos: Position) -> Result<String, RegistrationError> {
        let name = participant_name(&pos)?;
        let role = Role::parse(&pos.role).ok_or_else(|| RegistrationError::UnknownRole(pos.role.clone()))?;
        let mut shot = self.current.lock();
        let table = match role {
            Role::Worker => &mut shot.worker_infos,
            Role::Agent => &mut shot.agent_infos,
            Role::Manager => &mut shot.mgr_infos,
            Role::Controller => &mut shot.cluster_infos,
        };
        if table.contains_key(&name) {
            debug!("{} registered again", name);
        } else {
            info!("{} registered at {}", name, pos);
            table.insert(name.clone(), ParticipantInfo::new(pos));
        }
        Ok(name)
    }

    pub fn update_status(&self, name: &str, key: &str, value: impl Into<String>) -> bool {
        self.with_participant(name, |info| {
            info.status.insert(key.to_string(), value.into());
        })
    }

    pub fn set_command(&self, name: &str, key: &str, value: impl Into<String>) -> bool {
        self.with_participant(name, |info| {
            info.command.insert(key.to_string(), value.into());
        })
    }

    pub fn clear_command(&self, name: &str, key: &str) -> bool {
        self.with_participant(name, |info| {
            info.command.remove(key);
        })
    }

    pub fn touch_heartbeat(&self, name: &str) -> bool {
        self.with_participant(name, |info| info.heartbeat = Some(Utc::now()))
    }

    /// 产出新快照，tick递增
    pub fn snapshot(&self) -> SnapShot {
        let mut shot = self.current.lock();
        shot.tick += 1;
        shot.clone()
    }

    /// 处理一条入站上报，返回其功能码
    pub fn ingest(&self, msg: &Message) -> Result<Feature, IngestError> {
        let header = msg.header.as_ref().ok_or(FrameError::NilHeader)?;
        let src = header.src.as_ref().ok_or(FrameError::NilPosition)?;
        let body = MsgBody::from_json(&msg.body)?;
        let feature = body.feature()?;

        if feature == Feature::Registration(RegistrationCode::Register) {
            self.register(src.clone())?;
            return Ok(feature);
        }

        let name = participant_name(src)?;
        let known = match feature {
            Feature::Registration(RegistrationCode::Register) => true,
            Feature::Registration(RegistrationCode::Heartbeat) => self.touch_heartbeat(&name),
            Feature::Fault(FaultCode::Report) => self.record_fault(&name, &body),
            Feature::Fault(FaultCode::Recovered) => self.with_participant(&name, |info| {
                info.status.insert(keys::MASTER_FAULT.to_string(), "false".to_string());
                info.status.remove(keys::FAULT_RANKS);
            }),
            Feature::Profiling(ProfilingCode::DomainStatus) => self.with_participant(&name, |info| {
                for key in [keys::PROFILING_DEFAULT, keys::PROFILING_COMM] {
                    if let Some(v) = body.extension.get(key) {
                        info.status.insert(key.to_string(), v.clone());
                    }
                }
            }),
            Feature::Nic(NicCode::SwitchResult) => {
                self.record_result(&name, "nic_switch", &body)
            }
            Feature::Stress(StressCode::Result) => {
                self.record_result(&name, "stress_test", &body)
            }
            // 下行命令，不属于看板
            Feature::Registration(RegistrationCode::RegisterAck)
            | Feature::Profiling(ProfilingCode::Switch)
            | Feature::Nic(NicCode::Switch)
            | Feature::Stress(StressCode::Start)
            | Feature::Lifecycle(LifecycleCode::DestroyController)
            | Feature::Lifecycle(LifecycleCode::ExitAgent) => {
                debug!("ignore downstream {} from {}", feature, name);
                true
            }
        };
        if !known {
            warn!("{} from unregistered participant {}", feature, name);
            return Err(IngestError::UnknownParticipant(name));
        }
        Ok(feature)
    }

    fn record_fault(&self, name: &str, body: &MsgBody) -> bool {
        self.with_participant(name, |info| {
            let seq = info
                .status_of(keys::FAULT_SEQ)
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0)
                + 1;
            info.status.insert(keys::FAULT_SEQ.to_string(), seq.to_string());
            let master_fault = body
                .extension
                .get(keys::MASTER_FAULT)
                .cloned()
                .unwrap_or_else(|| "false".to_string());
            info.status.insert(keys::MASTER_FAULT.to_string(), master_fault);
            if let Some(ranks) = body.extension.get(keys::FAULT_RANKS) {
                info.status.insert(keys::FAULT_RANKS.to_string(), ranks.clone());
            }
        })
    }

    fn record_result(&self, name: &str, key: &str, body: &MsgBody) -> bool {
        let success = body
            .extension
            .get("success")
            .cloned()
            .unwrap_or_else(|| "false".to_string());
        self.update_status(name, key, success)
    }

    fn with_participant<F>(&self, name: &str, f: F) -> bool
    where
        F: FnOnce(&mut ParticipantInfo),
    {
        let mut shot = self.current.lock();
        let SnapShot {
            worker_infos,
            agent_infos,
            cluster_infos,
            mgr_infos,
            ..
        } = &mut *shot;
        let info = worker_infos
            .get_mut(name)
            .or_else(|| agent_infos.get_mut(name))
            .or_else(|| cluster_infos.get_mut(name))
            .or_else(|| mgr_infos.get_mut(name));
        match info {
            Some(info) => {
                f(info);
                true
            }
            None => false,
        }
    }
}

impl SnapshotSource for StatusBoard {
    fn snapshot(&self) -> Option<SnapShot> {
        Some(StatusBoard::snapshot(self))
    }
}
