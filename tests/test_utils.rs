#![allow(dead_code)]

use taskd::feature::Feature;
use taskd::snapshot::{
    agent_name, worker_name, ParticipantInfo, SnapShot, CONTROLLER_NAME, MANAGER_NAME,
};
use taskd::{Message, MessageHeader, Msg, Position};

/// 测试专用的快照构造器
pub struct SnapshotBuilder {
    shot: SnapShot,
}

impl SnapshotBuilder {
    pub fn new(job: &str) -> Self {
        Self {
            shot: SnapShot::new(job),
        }
    }

    pub fn tick(mut self, tick: u64) -> Self {
        self.shot.tick = tick;
        self
    }

    pub fn expected_workers(mut self, count: usize) -> Self {
        self.shot.expected_workers = count;
        self
    }

    pub fn controller(mut self) -> Self {
        self.shot
            .cluster_infos
            .entry(CONTROLLER_NAME.to_string())
            .or_insert_with(|| ParticipantInfo::new(Position::controller()));
        self
    }

    pub fn manager(mut self) -> Self {
        self.shot
            .mgr_infos
            .entry(MANAGER_NAME.to_string())
            .or_insert_with(|| ParticipantInfo::new(Position::manager()));
        self
    }

    pub fn agent(mut self, srv: u32) -> Self {
        self.shot
            .agent_infos
            .entry(agent_name(srv))
            .or_insert_with(|| ParticipantInfo::new(Position::agent(srv.to_string())));
        self
    }

    pub fn worker(mut self, srv: u32, proc: u32) -> Self {
        self.shot
            .worker_infos
            .entry(worker_name(srv, proc))
            .or_insert_with(|| ParticipantInfo::new(Position::worker(srv.to_string(), proc.to_string())));
        self
    }

    pub fn agent_status(self, srv: u32, key: &str, value: &str) -> Self {
        let mut b = self.agent(srv);
        if let Some(info) = b.shot.agent_infos.get_mut(&agent_name(srv)) {
            info.status.insert(key.to_string(), value.to_string());
        }
        b
    }

    pub fn worker_status(self, srv: u32, proc: u32, key: &str, value: &str) -> Self {
        let mut b = self.worker(srv, proc);
        if let Some(info) = b.shot.worker_infos.get_mut(&worker_name(srv, proc)) {
            info.status.insert(key.to_string(), value.to_string());
        }
        b
    }

    pub fn controller_command(self, key: &str, value: &str) -> Self {
        let mut b = self.controller();
        if let Some(info) = b.shot.cluster_infos.get_mut(CONTROLLER_NAME) {
            info.command.insert(key.to_string(), value.to_string());
        }
        b
    }

    pub fn manager_command(self, key: &str, value: &str) -> Self {
        let mut b = self.manager();
        if let Some(info) = b.shot.mgr_infos.get_mut(MANAGER_NAME) {
            info.command.insert(key.to_string(), value.to_string());
        }
        b
    }

    pub fn build(self) -> SnapShot {
        self.shot
    }
}

pub fn init_logger() {
    taskd::logging::init("debug");
}

/// 构造一条src为Manager的消息帧
pub fn frame_to(dst: Position) -> Message {
    Message {
        header: Some(MessageHeader {
            uuid: "test-uuid".to_string(),
            mtype: "test".to_string(),
            src: Some(Position::manager()),
            dst: Some(dst),
        }),
        body: String::new(),
    }
}

pub fn dst_of(msg: &Message) -> Position {
    msg.header.as_ref().unwrap().dst.clone().unwrap()
}

pub fn feature_of(msg: &Msg) -> Feature {
    msg.body.feature().unwrap()
}
