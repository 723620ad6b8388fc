//! 心跳发送
//!
//! 心跳在独立任务中运行，收到完成信号后立即停止；
//! 取消之后不再发出新的心跳，已在发送中的一次不保证送达。

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::feature::{Feature, RegistrationCode};
use crate::plugin::MsgBody;
use crate::proto::taskd::Position;

use super::Transport;

/// 心跳发送器
pub struct HeartbeatSender {
    transport: Arc<dyn Transport>,
    dst: Position,
    interval: Duration,
    jitter_pct: u32,
}

impl HeartbeatSender {
    pub fn new(transport: Arc<dyn Transport>, dst: Position, interval: Duration) -> Self {
        Self {
            transport,
            dst,
            interval,
            jitter_pct: 0,
        }
    }

    /// 间隔随机抖动±pct%
    pub fn with_jitter(mut self, pct: u32) -> Self {
        self.jitter_pct = pct.min(50);
        self
    }

    fn next_interval(&self) -> Duration {
        if self.jitter_pct == 0 {
            return self.interval;
        }
        let span = self.jitter_pct * 2;
        let jitter = rand::random_range(0..=span);
        let upper = self.interval + self.interval * jitter / 100;
        upper.saturating_sub(self.interval * self.jitter_pct / 100)
    }

    fn encode_body() -> Option<String> {
        let body = MsgBody::new(Feature::Registration(RegistrationCode::Heartbeat), "heartbeat")
            .with_extension("timestamp", chrono::Utc::now().timestamp().to_string());
        match body.to_json() {
            Ok(b) => Some(b),
            Err(e) => {
                warn!("failed to encode heartbeat: {}", e);
                None
            }
        }
    }

    /// 启动心跳任务，返回已发送的心跳数
    pub fn spawn(self, mut done: oneshot::Receiver<()>) -> JoinHandle<u64> {
        tokio::spawn(async move {
            let mut sent = 0u64;
            loop {
                let wait = self.next_interval();
                tokio::select! {
                    biased;
                    _ = &mut done => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                let Some(body) = Self::encode_body() else {
                    continue;
                };
                let transport = Arc::clone(&self.transport);
                let dst = self.dst.clone();
                let send = tokio::task::spawn_blocking(move || {
                    let uuid = Uuid::new_v4().to_string();
                    let mtype = Feature::Registration(RegistrationCode::Heartbeat).msg_type();
                    transport.sync_send_message(&uuid, mtype, &body, &dst)
                });

                tokio::select! {
                    biased;
                    _ = &mut done => break,
                    joined = send => match joined {
                        Ok(Ok(_)) => {
                            sent += 1;
                            metrics::counter!("taskd_heartbeats_sent_total").increment(1);
                        }
                        Ok(Err(e)) => warn!("heartbeat to {} failed: {}", self.dst, e),
                        Err(e) => warn!("heartbeat task failed: {}", e),
                    },
                }
            }
            debug!("heartbeat to {} stopped after {} beats", self.dst, sent);
            sent
        })
    }
}
