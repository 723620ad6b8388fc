//! 进程内消息总线
//!
//! 每个参与者以地址挂载到总线，可指定父节点。投递时先把rank列表展开为
//! 单个rank，再从发送方出发逐跳判定: 本地消费、向父节点中继、向子节点
//! 中继或同层横向中继。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};
use parking_lot::RwLock;

use crate::address::{RankSet, Role, BROADCAST_RANK};
use crate::frame::{validate_and_correct_frame, FrameError, ACK_OK};
use crate::proto::taskd::{Ack, Message, Position};
use crate::route::{dst_case, DstCase};

use super::{build_message, Transport, TransportError};

struct Node {
    pos: Position,
    parent: Option<String>,
    inbox: Sender<Message>,
}

/// 参与者的收件箱
pub struct Mailbox {
    pos: Position,
    rx: Receiver<Message>,
}

impl Mailbox {
    pub fn pos(&self) -> &Position {
        &self.pos
    }

    pub fn try_recv(&self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Message, TransportError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => TransportError::Timeout(timeout),
            RecvTimeoutError::Disconnected => TransportError::Closed,
        })
    }

    /// 取出当前全部消息
    pub fn drain(&self) -> Vec<Message> {
        self.rx.try_iter().collect()
    }
}

#[derive(Clone, Default)]
pub struct LocalBus {
    nodes: Arc<RwLock<HashMap<String, Node>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 挂载参与者，重复挂载会替换旧收件箱
    pub fn attach(&self, pos: Position, parent: Option<&Position>) -> Mailbox {
        let (tx, rx) = unbounded();
        let key = pos.key();
        self.nodes.write().insert(
            key.clone(),
            Node {
                pos: pos.clone(),
                parent: parent.map(Position::key),
                inbox: tx,
            },
        );
        debug!("{} attached to local bus", key);
        Mailbox { pos, rx }
    }

    pub fn detach(&self, pos: &Position) {
        self.nodes.write().remove(&pos.key());
    }

    /// 以`src`身份发送的传输句柄
    pub fn transport(&self, src: Position) -> BusTransport {
        BusTransport {
            bus: self.clone(),
            src,
        }
    }

    /// 校验并投递一条消息，返回首个接收者的Ack
    pub fn deliver(&self, mut msg: Message) -> Result<Ack, TransportError> {
        let uuid = msg.header.as_ref().map(|h| h.uuid.clone()).unwrap_or_default();
        if let Err(e) = validate_and_correct_frame(Some(&mut msg)) {
            return Ok(Ack {
                uuid,
                code: e.code(),
                src: None,
            });
        }
        let header = msg.header.as_ref().ok_or(FrameError::NilHeader)?;
        let (Some(src), Some(dst)) = (header.src.clone(), header.dst.clone()) else {
            return Err(FrameError::NilPosition.into());
        };

        let nodes = self.nodes.read();
        let origin = src.key();
        if !nodes.contains_key(&origin) {
            return Err(TransportError::Unreachable(format!("sender {} not attached", src)));
        }

        let mut delivered: Vec<String> = Vec::new();
        for target in expand_ranks(&dst) {
            route(&nodes, &origin, &target, &msg, &mut delivered);
        }

        let first = delivered
            .first()
            .and_then(|key| nodes.get(key))
            .map(|node| node.pos.clone())
            .ok_or_else(|| TransportError::Unreachable(dst.to_string()))?;
        debug!("msg {} from {} delivered to {} participants", uuid, src, delivered.len());
        Ok(Ack {
            uuid,
            code: ACK_OK,
            src: Some(first),
        })
    }
}

/// 从`origin`出发逐跳路由到`target`，已访问的节点不再进入
fn route(
    nodes: &HashMap<String, Node>,
    origin: &str,
    target: &Position,
    msg: &Message,
    delivered: &mut Vec<String>,
) {
    let broadcast =
        target.server_rank == BROADCAST_RANK || target.process_rank == BROADCAST_RANK;
    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::from([origin.to_string()]);

    while let Some(key) = queue.pop_front() {
        if !visited.insert(key.clone()) {
            continue;
        }
        let Some(node) = nodes.get(&key) else {
            continue;
        };
        match dst_case(Some(&node.pos), Some(target)) {
            DstCase::ToSelf => {
                if !delivered.contains(&key) {
                    if node.inbox.send(msg.clone()).is_ok() {
                        delivered.push(key.clone());
                    } else {
                        warn!("mailbox of {} closed", node.pos);
                    }
                }
                if broadcast {
                    queue.extend(peers(nodes, node));
                }
            }
            DstCase::ToUpperLevel => queue.extend(node.parent.clone()),
            DstCase::ToLowerLevel => queue.extend(
                nodes
                    .iter()
                    .filter(|(_, n)| n.parent.as_deref() == Some(key.as_str()))
                    .map(|(k, _)| k.clone()),
            ),
            DstCase::ToSameLevel => queue.extend(peers(nodes, node)),
            DstCase::Unknown => {}
        }
    }
}

fn peers<'a>(nodes: &'a HashMap<String, Node>, node: &'a Node) -> impl Iterator<Item = String> + 'a {
    nodes
        .iter()
        .filter(move |(_, n)| n.pos.role == node.pos.role)
        .map(|(k, _)| k.clone())
}

/// 把rank列表展开为单rank地址，广播保持不变，重复rank去重
fn expand_ranks(dst: &Position) -> Vec<Position> {
    let servers = rank_items(&dst.server_rank);
    let has_process = Role::parse(&dst.role).is_some_and(|r| r.has_process_property());
    let processes = if has_process {
        rank_items(&dst.process_rank)
    } else {
        vec![dst.process_rank.clone()]
    };

    let mut out = Vec::with_capacity(servers.len() * processes.len());
    for srv in &servers {
        for proc in &processes {
            out.push(Position {
                role: dst.role.clone(),
                server_rank: srv.clone(),
                process_rank: proc.clone(),
            });
        }
    }
    out
}

fn rank_items(raw: &str) -> Vec<String> {
    match RankSet::parse(raw).and_then(|r| r.distinct()) {
        Some(ranks) => ranks.iter().map(|r| r.to_string()).collect(),
        None => vec![raw.to_string()],
    }
}

/// 总线上的发送端
#[derive(Clone)]
pub struct BusTransport {
    bus: LocalBus,
    src: Position,
}

impl BusTransport {
    pub fn src(&self) -> &Position {
        &self.src
    }
}

impl Transport for BusTransport {
    fn sync_send_message(
        &self,
        uuid: &str,
        mtype: &str,
        body: &str,
        dst: &Position,
    ) -> Result<Ack, TransportError> {
        self.bus.deliver(build_message(uuid, mtype, body, &self.src, dst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_dedups_ranks() {
        let expanded = expand_ranks(&Position::worker("1,1,2", "0"));
        let keys: Vec<String> = expanded.iter().map(|p| p.key()).collect();
        assert_eq!(keys, vec!["Worker/1/0", "Worker/2/0"]);

        let agents = expand_ranks(&Position::agent("*"));
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].server_rank, "*");
    }
}
