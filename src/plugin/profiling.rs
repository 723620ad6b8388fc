//! 性能采集域一致性插件
//!
//! Manager不会根据单个Worker的上报判定某个域已打开或已关闭，
//! 只有当前已知的全部Worker都收敛到期望状态时才切换聚合状态，
//! 中间过程统一为Waiting。

use std::collections::BTreeMap;
use std::fmt;

use log::{debug, info, warn};

use crate::feature::{Feature, ProfilingCode};
use crate::snapshot::{keys, ParticipantInfo, SnapShot};

use super::{
    HandleResult, HandleStage, ManagerPlugin, Msg, MsgBody, MsgQueue, PluginError, PredicateResult,
};

pub const PROFILING_CONSENSUS_PLUGIN: &str = "ProfilingConsensusPlugin";

/// 采集域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProfilingDomain {
    Default,
    Comm,
}

impl ProfilingDomain {
    pub const ALL: [ProfilingDomain; 2] = [ProfilingDomain::Default, ProfilingDomain::Comm];

    /// 状态表与命令表共用的键
    pub fn key(&self) -> &'static str {
        match self {
            ProfilingDomain::Default => keys::PROFILING_DEFAULT,
            ProfilingDomain::Comm => keys::PROFILING_COMM,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProfilingDomain::Default => "default",
            ProfilingDomain::Comm => "comm",
        }
    }
}

/// 单个Worker单个域的执行结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainResult {
    On,
    Off,
    Exception,
}

impl DomainResult {
    pub fn parse(raw: &str) -> Option<DomainResult> {
        match raw {
            "on" => Some(DomainResult::On),
            "off" => Some(DomainResult::Off),
            "exception" => Some(DomainResult::Exception),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DomainResult::On => "on",
            DomainResult::Off => "off",
            DomainResult::Exception => "exception",
        }
    }
}

/// Worker上报的双域状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerDomainStatus {
    pub default: DomainResult,
    pub comm: DomainResult,
}

impl WorkerDomainStatus {
    pub fn get(&self, domain: ProfilingDomain) -> DomainResult {
        match domain {
            ProfilingDomain::Default => self.default,
            ProfilingDomain::Comm => self.comm,
        }
    }

    /// 两个键都缺失时视为未上报，缺失的单个域按Off处理
    fn from_info(info: &ParticipantInfo) -> Option<Self> {
        let default = info.status_of(keys::PROFILING_DEFAULT);
        let comm = info.status_of(keys::PROFILING_COMM);
        if default.is_none() && comm.is_none() {
            return None;
        }
        let parse = |raw: Option<&str>| raw.and_then(DomainResult::parse).unwrap_or(DomainResult::Off);
        Some(Self {
            default: parse(default),
            comm: parse(comm),
        })
    }
}

/// 期望的开关状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfilingCommand {
    pub default: bool,
    pub comm: bool,
}

impl ProfilingCommand {
    pub fn enabled(&self, domain: ProfilingDomain) -> bool {
        match domain {
            ProfilingDomain::Default => self.default,
            ProfilingDomain::Comm => self.comm,
        }
    }

    /// 命令表中没有任何采集键时返回None
    fn from_table(info: &ParticipantInfo) -> Option<Self> {
        let default = info.command_of(keys::PROFILING_DEFAULT);
        let comm = info.command_of(keys::PROFILING_COMM);
        if default.is_none() && comm.is_none() {
            return None;
        }
        Some(Self {
            default: default == Some("on"),
            comm: comm == Some("on"),
        })
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

/// 域聚合状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateState {
    Closed,
    Waiting,
    Opened,
    Exception,
}

impl AggregateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateState::Closed => "closed",
            AggregateState::Waiting => "waiting",
            AggregateState::Opened => "opened",
            AggregateState::Exception => "exception",
        }
    }
}

impl fmt::Display for AggregateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 聚合状态变化记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainNotification {
    pub tick: u64,
    pub domain: ProfilingDomain,
    pub from: AggregateState,
    pub to: AggregateState,
}

/// 任一异常即异常；全部达到期望即打开/关闭；否则等待
///
/// None表示已知但尚未上报的Worker，按未收敛处理
pub fn aggregate<I>(results: I, enabled: bool) -> AggregateState
where
    I: IntoIterator<Item = Option<DomainResult>>,
{
    let target = if enabled { DomainResult::On } else { DomainResult::Off };
    let mut converged = true;
    for result in results {
        if result == Some(DomainResult::Exception) {
            return AggregateState::Exception;
        }
        converged &= result == Some(target);
    }
    match (converged, enabled) {
        (true, true) => AggregateState::Opened,
        (true, false) => AggregateState::Closed,
        (false, _) => AggregateState::Waiting,
    }
}

/// 先查集群级命令表，再查本Manager的命令表
fn resolve_command(shot: &SnapShot) -> Option<ProfilingCommand> {
    shot.cluster_infos
        .values()
        .find_map(ProfilingCommand::from_table)
        .or_else(|| shot.mgr_infos.values().find_map(ProfilingCommand::from_table))
}

#[derive(Debug)]
pub struct ProfilingConsensusPlugin {
    worker_status: BTreeMap<String, WorkerDomainStatus>,
    last_applied: Option<ProfilingCommand>,
    aggregates: BTreeMap<ProfilingDomain, AggregateState>,
    notifications: Vec<DomainNotification>,

    // predicate暂存，供handle使用
    new_command: Option<ProfilingCommand>,
    changed: Vec<(String, WorkerDomainStatus)>,
    departed: Vec<String>,
    known_workers: Vec<String>,
    expected_workers: usize,
    controllers: Vec<String>,
    tick: u64,

    queue: MsgQueue,
}

impl Default for ProfilingConsensusPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfilingConsensusPlugin {
    pub fn new() -> Self {
        Self {
            worker_status: BTreeMap::new(),
            last_applied: None,
            aggregates: ProfilingDomain::ALL
                .iter()
                .map(|d| (*d, AggregateState::Closed))
                .collect(),
            notifications: Vec::new(),
            new_command: None,
            changed: Vec::new(),
            departed: Vec::new(),
            known_workers: Vec::new(),
            expected_workers: 0,
            controllers: Vec::new(),
            tick: 0,
            queue: MsgQueue::default(),
        }
    }

    pub fn aggregate_state(&self, domain: ProfilingDomain) -> AggregateState {
        self.aggregates
            .get(&domain)
            .copied()
            .unwrap_or(AggregateState::Closed)
    }

    pub fn last_applied(&self) -> Option<ProfilingCommand> {
        self.last_applied
    }

    pub fn notifications(&self) -> &[DomainNotification] {
        &self.notifications
    }

    pub fn worker_status(&self, worker: &str) -> Option<WorkerDomainStatus> {
        self.worker_status.get(worker).copied()
    }

    /// 期望的Worker尚未全部注册
    fn population_incomplete(&self) -> bool {
        self.known_workers.len() < self.expected_workers.max(1)
    }

    fn domain_aggregate(&self, domain: ProfilingDomain, enabled: bool) -> AggregateState {
        let state = aggregate(
            self.known_workers
                .iter()
                .map(|name| self.worker_status.get(name).map(|s| s.get(domain))),
            enabled,
        );
        match state {
            AggregateState::Opened | AggregateState::Closed if self.population_incomplete() => {
                AggregateState::Waiting
            }
            other => other,
        }
    }

    fn recompute_aggregates(&mut self, desired: ProfilingCommand) {
        for domain in ProfilingDomain::ALL {
            let next = self.domain_aggregate(domain, desired.enabled(domain));
            let prev = self.aggregate_state(domain);
            if next == prev {
                continue;
            }
            info!("profiling domain {} changed: {} -> {}", domain.as_str(), prev, next);
            self.aggregates.insert(domain, next);
            self.notifications.push(DomainNotification {
                tick: self.tick,
                domain,
                from: prev,
                to: next,
            });
            if !self.controllers.is_empty() {
                let body = MsgBody::new(
                    Feature::Profiling(ProfilingCode::DomainStatus),
                    format!("profiling domain {} {}", domain.as_str(), next),
                )
                .with_extension("domain", domain.as_str())
                .with_extension("state", next.as_str());
                self.queue.push(Msg::new(self.controllers.clone(), body));
            }
        }
    }

    /// 全部期望Worker注册完成后才广播，并推进last_applied
    fn broadcast(&mut self, command: ProfilingCommand) -> bool {
        if self.population_incomplete() {
            debug!(
                "defer profiling switch: {}/{} workers registered",
                self.known_workers.len(),
                self.expected_workers.max(1)
            );
            return false;
        }
        let body = MsgBody::new(Feature::Profiling(ProfilingCode::Switch), "profiling switch")
            .with_extension(ProfilingDomain::Default.key(), on_off(command.default))
            .with_extension(ProfilingDomain::Comm.key(), on_off(command.comm));
        self.queue.push(Msg::new(self.known_workers.clone(), body));
        self.last_applied = Some(command);
        info!(
            "profiling switch broadcast to {} workers: default={} comm={}",
            self.known_workers.len(),
            on_off(command.default),
            on_off(command.comm)
        );
        true
    }
}

impl ManagerPlugin for ProfilingConsensusPlugin {
    fn name(&self) -> &str {
        PROFILING_CONSENSUS_PLUGIN
    }

    fn predicate(&mut self, shot: &SnapShot) -> Result<PredicateResult, PluginError> {
        let new_command = resolve_command(shot).filter(|cmd| Some(*cmd) != self.last_applied);
        let changed: Vec<(String, WorkerDomainStatus)> = shot
            .worker_infos
            .iter()
            .filter_map(|(name, info)| {
                let status = WorkerDomainStatus::from_info(info)?;
                (self.worker_status.get(name) != Some(&status)).then(|| (name.clone(), status))
            })
            .collect();

        let departed: Vec<String> = self
            .worker_status
            .keys()
            .filter(|name| !shot.worker_infos.contains_key(*name))
            .cloned()
            .collect();
        let population_changed = shot.expected_workers != self.expected_workers
            || !shot.worker_infos.keys().eq(self.known_workers.iter());

        if new_command.is_none() && changed.is_empty() && departed.is_empty() && !population_changed {
            return Ok(PredicateResult::unselect(PROFILING_CONSENSUS_PLUGIN));
        }

        let result = PredicateResult::candidate(PROFILING_CONSENSUS_PLUGIN)
            .with_stream("new_command", new_command.is_some().to_string())
            .with_stream("changed_workers", changed.len().to_string())
            .with_stream("departed_workers", departed.len().to_string());

        self.new_command = new_command;
        self.changed = changed;
        self.departed = departed;
        self.known_workers = shot.worker_infos.keys().cloned().collect();
        self.expected_workers = shot.expected_workers;
        self.controllers = shot.cluster_infos.keys().cloned().collect();
        self.tick = shot.tick;
        Ok(result)
    }

    fn handle(&mut self) -> Result<HandleResult, PluginError> {
        for (name, status) in self.changed.drain(..) {
            debug!("worker {} profiling status: default={} comm={}", name, status.default.as_str(), status.comm.as_str());
            self.worker_status.insert(name, status);
        }
        for name in self.departed.drain(..) {
            debug!("worker {} left, drop its profiling status", name);
            self.worker_status.remove(&name);
        }

        let desired = self.new_command.or(self.last_applied).unwrap_or_default();
        self.recompute_aggregates(desired);

        let Some(command) = self.new_command else {
            return Ok(HandleResult::new(HandleStage::Final));
        };
        if self.broadcast(command) {
            self.new_command = None;
            Ok(HandleResult::new(HandleStage::Final))
        } else {
            Ok(HandleResult::new(HandleStage::Process))
        }
    }

    fn pull_msg(&mut self) -> Vec<Msg> {
        self.queue.drain()
    }

    fn release(&mut self) -> Result<(), PluginError> {
        let dropped = self.queue.drain().len();
        if dropped > 0 {
            warn!("{} released with {} pending messages", PROFILING_CONSENSUS_PLUGIN, dropped);
        }
        self.worker_status.clear();
        self.changed.clear();
        self.departed.clear();
        self.new_command = None;
        Ok(())
    }
}
