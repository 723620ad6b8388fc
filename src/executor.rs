//! 动作执行器 - 硬件类动作(压测、网卡切换等)的执行抽象
//!
//! 执行器在构造时注入，协调核心不关心具体实现。长耗时动作执行期间
//! 由心跳任务持续上报存活，动作返回的瞬间停止心跳。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::command::{CommandSlot, Offer};
use crate::feature::{Feature, NicCode, StressCode};
use crate::plugin::MsgBody;
use crate::proto::taskd::{Message, Position};
use crate::transport::{send_with_retry, HeartbeatSender, RetryPolicy, Transport};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("动作执行失败: {0}")]
    Failed(String),
    #[error("动作执行崩溃: {0}")]
    Panicked(String),
}

/// 待执行的动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub id: String,
    pub feature: Feature,
    pub params: HashMap<String, String>,
}

impl ActionRequest {
    pub fn new(feature: Feature) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            feature,
            params: HashMap::new(),
        }
    }

    /// 从入站消息解析，只接受需要执行器的功能
    pub fn from_message(msg: &Message) -> Option<Self> {
        let header = msg.header.as_ref()?;
        let body = MsgBody::from_json(&msg.body).ok()?;
        let feature = body.feature().ok()?;
        match feature {
            Feature::Stress(StressCode::Start) | Feature::Nic(NicCode::Switch) => Some(Self {
                id: header.uuid.clone(),
                feature,
                params: body.extension,
            }),
            _ => None,
        }
    }

    /// 结果上报使用的功能码
    pub fn result_feature(&self) -> Feature {
        match self.feature {
            Feature::Stress(_) => Feature::Stress(StressCode::Result),
            Feature::Nic(_) => Feature::Nic(NicCode::SwitchResult),
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub id: String,
    pub success: bool,
    pub detail: String,
}

/// 动作执行能力
pub trait ActionExecutor: Send + Sync {
    /// 可能长时间阻塞
    fn execute(&self, request: &ActionRequest) -> Result<ActionOutcome, ExecutorError>;
}

/// 在阻塞线程上执行动作，执行期间发送心跳
pub async fn run_with_heartbeat(
    executor: Arc<dyn ActionExecutor>,
    request: ActionRequest,
    heartbeat: Option<HeartbeatSender>,
) -> Result<ActionOutcome, ExecutorError> {
    let (done_tx, done_rx) = oneshot::channel();
    let beats = heartbeat.map(|hb| hb.spawn(done_rx));

    let result = tokio::task::spawn_blocking(move || executor.execute(&request)).await;
    let _ = done_tx.send(());
    if let Some(beats) = beats {
        match beats.await {
            Ok(n) => debug!("{} heartbeats sent during action", n),
            Err(e) => warn!("heartbeat task join failed: {}", e),
        }
    }

    result.map_err(|e| ExecutorError::Panicked(e.to_string()))?
}

/// 顺序执行动作的工作者
///
/// 请求通过容量为1的命令槽进入，执行结果通过传输层上报给`report_to`。
pub struct ActionWorker {
    executor: Arc<dyn ActionExecutor>,
    slot: CommandSlot<ActionRequest>,
    transport: Arc<dyn Transport>,
    report_to: Position,
    heartbeat_interval: Duration,
    policy: RetryPolicy,
}

impl ActionWorker {
    pub fn new(
        executor: Arc<dyn ActionExecutor>,
        transport: Arc<dyn Transport>,
        report_to: Position,
        heartbeat_interval: Duration,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            executor,
            slot: CommandSlot::new(),
            transport,
            report_to,
            heartbeat_interval,
            policy,
        }
    }

    /// 供入站消息泵使用的命令槽
    pub fn slot(&self) -> CommandSlot<ActionRequest> {
        self.slot.clone()
    }

    /// 解析消息并投递到命令槽，非动作消息返回None
    pub fn offer_message(&self, msg: &Message) -> Option<Offer> {
        ActionRequest::from_message(msg).map(|req| self.slot.offer(req))
    }

    /// 启动工作循环，返回已处理的动作数
    pub fn spawn(self, mut shutdown: oneshot::Receiver<()>) -> JoinHandle<usize> {
        tokio::spawn(async move {
            let mut handled = 0usize;
            let mut poll = tokio::time::interval(Duration::from_millis(20));
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => break,
                    _ = poll.tick() => {}
                }
                let Some(request) = self.slot.take() else {
                    continue;
                };
                handled += 1;
                self.process(request).await;
            }
            info!("action worker stopped after {} actions", handled);
            handled
        })
    }

    async fn process(&self, request: ActionRequest) {
        info!("executing action {} ({})", request.id, request.feature);
        let heartbeat = HeartbeatSender::new(
            Arc::clone(&self.transport),
            self.report_to.clone(),
            self.heartbeat_interval,
        );
        let result_feature = request.result_feature();
        let id = request.id.clone();

        let outcome = run_with_heartbeat(Arc::clone(&self.executor), request, Some(heartbeat)).await;
        let body = match &outcome {
            Ok(o) => MsgBody::new(result_feature, o.detail.clone())
                .with_extension("success", o.success.to_string())
                .with_extension("action_id", id.clone()),
            Err(e) => {
                error!("action {} failed: {}", id, e);
                MsgBody::new(result_feature, e.to_string())
                    .with_extension("success", "false")
                    .with_extension("action_id", id.clone())
            }
        };
        let body = match body.to_json() {
            Ok(b) => b,
            Err(e) => {
                error!("failed to encode action result: {}", e);
                return;
            }
        };

        let transport = Arc::clone(&self.transport);
        let dst = self.report_to.clone();
        let policy = self.policy;
        let mtype = result_feature.msg_type();
        let sent = tokio::task::spawn_blocking(move || {
            let uuid = Uuid::new_v4().to_string();
            send_with_retry(transport.as_ref(), &policy, &uuid, mtype, &body, &dst)
        })
        .await;
        match sent {
            Ok(Ok(_)) => debug!("action {} result reported", id),
            Ok(Err(e)) => error!("action {} result report failed: {}", id, e),
            Err(e) => error!("action {} report task failed: {}", id, e),
        }
    }
}
