//! 插件运行时
//!
//! 每个周期获取一份快照，按注册顺序依次驱动插件。
//! 单个插件的错误只影响它本周期的产出，不会中断循环。

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

use crate::snapshot::{SnapShot, SnapshotSource};
use crate::transport::DispatchReport;

use super::{HandleStage, ManagerPlugin, Msg, PluginError};

/// 出错阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginPhase {
    Predicate,
    Handle,
}

impl PluginPhase {
    fn as_str(&self) -> &'static str {
        match self {
            PluginPhase::Predicate => "predicate",
            PluginPhase::Handle => "handle",
        }
    }
}

/// 单个插件本周期的产出
#[derive(Debug)]
pub struct PluginOutput {
    pub plugin: String,
    pub stage: HandleStage,
    pub msgs: Vec<Msg>,
}

#[derive(Debug)]
pub struct PluginFailure {
    pub plugin: String,
    pub phase: PluginPhase,
    pub error: PluginError,
}

/// 一个周期的执行结果
#[derive(Debug, Default)]
pub struct TickReport {
    pub tick: u64,
    /// 只包含candidate且处理成功的插件
    pub outputs: Vec<PluginOutput>,
    pub unselected: Vec<String>,
    pub errors: Vec<PluginFailure>,
}

impl TickReport {
    pub fn msg_count(&self) -> usize {
        self.outputs.iter().map(|o| o.msgs.len()).sum()
    }

    pub fn output_of(&self, plugin: &str) -> Option<&PluginOutput> {
        self.outputs.iter().find(|o| o.plugin == plugin)
    }

    pub fn into_msgs(self) -> Vec<Msg> {
        self.outputs.into_iter().flat_map(|o| o.msgs).collect()
    }
}

/// 出站消息的去处
pub trait MsgSink: Send + Sync {
    fn dispatch(&self, shot: &SnapShot, msgs: &[Msg]) -> DispatchReport;
}

/// 运行结束时的统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u64,
    pub skipped: u64,
    pub sent: usize,
    pub failed: usize,
}

#[derive(Default)]
pub struct PluginRuntime {
    plugins: Vec<Box<dyn ManagerPlugin>>,
}

impl PluginRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Box<dyn ManagerPlugin>) -> Result<(), PluginError> {
        let name = plugin.name().to_string();
        if self.plugins.iter().any(|p| p.name() == name) {
            return Err(PluginError::DuplicatePlugin(name));
        }
        info!("plugin {} registered", name);
        self.plugins.push(plugin);
        Ok(())
    }

    /// 注销插件并调用一次release
    pub fn deregister(&mut self, name: &str) -> Result<(), PluginError> {
        let idx = self
            .plugins
            .iter()
            .position(|p| p.name() == name)
            .ok_or_else(|| PluginError::UnknownPlugin(name.to_string()))?;
        let mut plugin = self.plugins.remove(idx);
        plugin.release()?;
        info!("plugin {} deregistered", name);
        Ok(())
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// 用同一份快照依次驱动全部插件
    pub fn tick(&mut self, shot: &SnapShot) -> TickReport {
        let mut report = TickReport {
            tick: shot.tick,
            ..Default::default()
        };

        for plugin in self.plugins.iter_mut() {
            let name = plugin.name().to_string();

            let predicate = match plugin.predicate(shot) {
                Ok(p) => p,
                Err(e) => {
                    record_failure(&mut report, name, PluginPhase::Predicate, e);
                    continue;
                }
            };
            if !predicate.is_candidate() {
                report.unselected.push(name);
                continue;
            }

            match plugin.handle() {
                Ok(result) => {
                    let msgs = plugin.pull_msg();
                    debug!(
                        "plugin {} handled at tick {}: {:?}, {} msgs",
                        name,
                        shot.tick,
                        result.stage,
                        msgs.len()
                    );
                    report.outputs.push(PluginOutput {
                        plugin: name,
                        stage: result.stage,
                        msgs,
                    });
                }
                Err(e) => {
                    // 出错的插件本周期不产出任何消息
                    let discarded = plugin.pull_msg().len();
                    if discarded > 0 {
                        warn!("plugin {} discarded {} msgs after handle error", name, discarded);
                    }
                    record_failure(&mut report, name, PluginPhase::Handle, e);
                }
            }
        }
        report
    }

    /// 释放全部插件，每个插件只释放一次
    pub fn shutdown(&mut self) {
        for mut plugin in self.plugins.drain(..) {
            if let Err(e) = plugin.release() {
                error!("plugin {} release failed: {}", plugin.name(), e);
            }
        }
    }

    /// 周期驱动循环，关闭信号优先
    ///
    /// `shutdown`收到信号或发送端被丢弃时退出，并释放全部插件。
    pub async fn run<S, K>(
        mut self,
        source: Arc<S>,
        sink: Arc<K>,
        interval: Duration,
        mut shutdown: oneshot::Receiver<()>,
    ) -> RunSummary
    where
        S: SnapshotSource + ?Sized + 'static,
        K: MsgSink + ?Sized + 'static,
    {
        let mut summary = RunSummary::default();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        'run: loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break 'run,
                _ = ticker.tick() => {
                    let Some(shot) = source.snapshot() else {
                        summary.skipped += 1;
                        debug!("no snapshot available, skip tick");
                        continue;
                    };
                    summary.ticks += 1;
                    let msgs = self.tick(&shot).into_msgs();
                    if msgs.is_empty() {
                        continue;
                    }

                    let sink = Arc::clone(&sink);
                    let dispatch = tokio::task::spawn_blocking(move || sink.dispatch(&shot, &msgs));
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => break 'run,
                        joined = dispatch => match joined {
                            Ok(r) => {
                                summary.sent += r.sent;
                                summary.failed += r.failed;
                            }
                            Err(e) => error!("dispatch task failed: {}", e),
                        },
                    }
                }
            }
        }

        info!("plugin runtime stopping after {} ticks", summary.ticks);
        self.shutdown();
        summary
    }
}

impl Drop for PluginRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn record_failure(report: &mut TickReport, plugin: String, phase: PluginPhase, error: PluginError) {
    error!("plugin {} {} failed: {}", plugin, phase.as_str(), error);
    metrics::counter!(
        "taskd_plugin_errors_total",
        "plugin" => plugin.clone(),
        "phase" => phase.as_str()
    )
    .increment(1);
    report.errors.push(PluginFailure {
        plugin,
        phase,
        error,
    });
}
