//! 作业重调度插件
//!
//! 按故障影响范围分级处理:
//! - rank0 Agent新上报故障且没有kill-master信号: 只让rank0 Agent退出重启
//! - 出现kill-master信号: 销毁Controller并级联退出rank0 Agent

use log::{debug, info};

use crate::feature::{Feature, LifecycleCode};
use crate::snapshot::{agent_name, keys, SnapShot};

use super::{
    HandleResult, HandleStage, ManagerPlugin, Msg, MsgBody, MsgQueue, PluginError, PredicateResult,
};

pub const JOB_RESCHEDULING_PLUGIN: &str = "JobReschedulingPlugin";

const STREAM_KILL_MASTER: &str = "kill_master";
const STREAM_FAULT_OCCUR: &str = "fault_occur";

#[derive(Debug, Default)]
pub struct JobReschedulingPlugin {
    /// None为空闲，Some(Process)为处理中
    process_status: Option<HandleStage>,
    kill_master: bool,
    fault_occur: bool,
    /// 已处理的最大故障序号
    handled_fault_seq: u64,
    /// 本轮predicate观察到的故障序号
    observed_fault_seq: u64,
    job_name: String,
    controllers: Vec<String>,
    rank0_agent: Option<String>,
    queue: MsgQueue,
}

impl JobReschedulingPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_flight(&self) -> bool {
        self.process_status == Some(HandleStage::Process)
    }

    pub fn kill_master(&self) -> bool {
        self.kill_master
    }

    pub fn fault_occur(&self) -> bool {
        self.fault_occur
    }

    /// 已在排队但尚未被取走的消息数
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn reset(&mut self) {
        self.process_status = None;
        self.kill_master = false;
        self.fault_occur = false;
    }

    fn stash(&mut self, shot: &SnapShot, fault_seq: u64) {
        self.job_name = shot.job_name.clone();
        self.controllers = shot.cluster_infos.keys().cloned().collect();
        let rank0 = agent_name(0);
        self.rank0_agent = shot.agent_infos.contains_key(&rank0).then_some(rank0);
        self.observed_fault_seq = fault_seq;
    }

    fn candidate(&self) -> PredicateResult {
        PredicateResult::candidate(JOB_RESCHEDULING_PLUGIN)
            .with_stream(STREAM_KILL_MASTER, self.kill_master.to_string())
            .with_stream(STREAM_FAULT_OCCUR, self.fault_occur.to_string())
    }

    fn rank0_receiver(&self) -> Result<String, PluginError> {
        self.rank0_agent
            .clone()
            .ok_or_else(|| PluginError::MissingReceiver(agent_name(0)))
    }

    fn exit_rank0(&mut self, agent: String, reason: &str) {
        let body = MsgBody::new(Feature::Lifecycle(LifecycleCode::ExitAgent), reason)
            .with_extension("job", self.job_name.clone());
        self.queue.push(Msg::to(agent, body));
    }

    fn settle_fault_seq(&mut self) {
        self.handled_fault_seq = self.handled_fault_seq.max(self.observed_fault_seq);
    }
}

/// rank0 Agent随新故障序号上报主进程故障，或上游同时下发kill-master与故障恢复标志
///
/// master_fault在收到恢复上报前一直保持"true"，必须配合未处理的故障序号才算信号
fn kill_master_signal(shot: &SnapShot, fault_seq: u64, handled_fault_seq: u64) -> bool {
    let rank0_master_fault = fault_seq > handled_fault_seq
        && shot
            .agent_infos
            .get(&agent_name(0))
            .and_then(|agent| agent.status_of(keys::MASTER_FAULT))
            == Some("true");
    let upstream_kill = shot.cluster_infos.values().any(|cluster| {
        cluster.command_of(keys::KILL_MASTER) == Some("true")
            && cluster.command_of(keys::FAULT_RECOVERY) == Some("true")
    });
    rank0_master_fault || upstream_kill
}

fn rank0_fault_seq(shot: &SnapShot) -> u64 {
    shot.agent_infos
        .get(&agent_name(0))
        .and_then(|agent| agent.status_of(keys::FAULT_SEQ))
        .and_then(|seq| seq.parse().ok())
        .unwrap_or(0)
}

impl ManagerPlugin for JobReschedulingPlugin {
    fn name(&self) -> &str {
        JOB_RESCHEDULING_PLUGIN
    }

    fn predicate(&mut self, shot: &SnapShot) -> Result<PredicateResult, PluginError> {
        let fault_seq = rank0_fault_seq(shot);
        let kill = kill_master_signal(shot, fault_seq, self.handled_fault_seq);

        if self.is_in_flight() {
            self.kill_master = kill;
            self.stash(shot, fault_seq);
            return Ok(self.candidate());
        }

        if kill {
            debug!("kill-master signal observed at tick {}", shot.tick);
            self.kill_master = true;
        } else if fault_seq > self.handled_fault_seq {
            debug!("rank0 reported fault seq {} at tick {}", fault_seq, shot.tick);
            self.fault_occur = true;
        } else {
            return Ok(PredicateResult::unselect(JOB_RESCHEDULING_PLUGIN));
        }

        self.process_status = Some(HandleStage::Process);
        self.stash(shot, fault_seq);
        Ok(self.candidate())
    }

    fn handle(&mut self) -> Result<HandleResult, PluginError> {
        if self.kill_master {
            let agent = self.rank0_receiver()?;
            if self.controllers.is_empty() {
                return Err(PluginError::MissingReceiver(
                    crate::snapshot::CONTROLLER_NAME.to_string(),
                ));
            }
            let destroy = MsgBody::new(
                Feature::Lifecycle(LifecycleCode::DestroyController),
                "kill master requested",
            )
            .with_extension("job", self.job_name.clone());
            self.queue.push(Msg::new(self.controllers.clone(), destroy));
            self.exit_rank0(agent, "controller destroyed, exit for rescheduling");

            info!("job {}: destroy controller and exit rank0 agent", self.job_name);
            self.settle_fault_seq();
            self.reset();
            return Ok(HandleResult::new(HandleStage::Final));
        }

        if self.fault_occur {
            let agent = self.rank0_receiver()?;
            self.exit_rank0(agent, "rank0 fault, exit for rescheduling");

            info!(
                "job {}: rank0 fault seq {} handled, exit rank0 agent",
                self.job_name, self.observed_fault_seq
            );
            self.settle_fault_seq();
            self.process_status = None;
            self.fault_occur = false;
            return Ok(HandleResult::new(HandleStage::Final));
        }

        self.process_status = None;
        Ok(HandleResult::new(HandleStage::Final))
    }

    fn pull_msg(&mut self) -> Vec<Msg> {
        self.queue.drain()
    }

    fn release(&mut self) -> Result<(), PluginError> {
        let dropped = self.queue.drain().len();
        if dropped > 0 {
            debug!("{} released with {} pending messages", JOB_RESCHEDULING_PLUGIN, dropped);
        }
        self.reset();
        Ok(())
    }
}
