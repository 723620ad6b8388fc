//! 传输层测试: 重试、本地总线路由与消息分发

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use taskd::feature::{Feature, LifecycleCode};
use taskd::frame::FrameError;
use taskd::transport::{send_with_retry, Mailbox};
use taskd::{
    Ack, LocalBus, Msg, MsgBody, MsgDispatcher, Position, RetryPolicy, Transport, TransportError,
    ACK_OK,
};

mod test_utils;
use test_utils::{dst_of, frame_to, init_logger, SnapshotBuilder};

/// 前`failures`次返回超时，之后返回固定状态码
struct FlakyTransport {
    failures: u32,
    code: u32,
    calls: AtomicU32,
}

impl FlakyTransport {
    fn new(failures: u32, code: u32) -> Self {
        Self {
            failures,
            code,
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transport for FlakyTransport {
    fn sync_send_message(
        &self,
        uuid: &str,
        _mtype: &str,
        _body: &str,
        dst: &Position,
    ) -> Result<Ack, TransportError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Err(TransportError::Timeout(Duration::from_millis(1)));
        }
        Ok(Ack {
            uuid: uuid.to_string(),
            code: self.code,
            src: Some(dst.clone()),
        })
    }
}

fn fast_policy(attempts: u32) -> RetryPolicy {
    RetryPolicy {
        attempts,
        delay: Duration::from_millis(1),
    }
}

#[test]
fn test_retry_recovers_from_transient_failures() {
    init_logger();
    let transport = FlakyTransport::new(2, ACK_OK);
    let ack = send_with_retry(&transport, &fast_policy(3), "u-1", "t", "{}", &Position::manager()).unwrap();
    assert_eq!(ack.uuid, "u-1");
    assert_eq!(transport.calls(), 3);
}

#[test]
fn test_retry_exhausted() {
    let transport = FlakyTransport::new(10, ACK_OK);
    let err = send_with_retry(&transport, &fast_policy(3), "u-2", "t", "{}", &Position::manager()).unwrap_err();
    match err {
        TransportError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, TransportError::Timeout(_)));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(transport.calls(), 3);
}

#[test]
fn test_rejected_ack_is_not_retried() {
    let code = FrameError::DstRoleIllegal.code();
    let transport = FlakyTransport::new(0, code);
    let err = send_with_retry(&transport, &fast_policy(5), "u-3", "t", "{}", &Position::manager()).unwrap_err();
    assert!(matches!(err, TransportError::Rejected(c) if c == code));
    assert!(!err.is_retryable());
    assert_eq!(transport.calls(), 1);
}

#[test]
fn test_zero_attempts_still_sends_once() {
    let transport = FlakyTransport::new(0, ACK_OK);
    assert!(send_with_retry(&transport, &fast_policy(0), "u-4", "t", "{}", &Position::manager()).is_ok());
    assert_eq!(transport.calls(), 1);
}

struct Cluster {
    bus: LocalBus,
    controller: Mailbox,
    manager: Mailbox,
    agents: Vec<Mailbox>,
    workers: Vec<Mailbox>,
}

/// 1个Controller、1个Manager、2个Agent，每个Agent下2个Worker
fn cluster() -> Cluster {
    let bus = LocalBus::new();
    let controller = bus.attach(Position::controller(), None);
    let manager = bus.attach(Position::manager(), Some(&Position::controller()));
    let mut agents = Vec::new();
    let mut workers = Vec::new();
    for srv in 0..2 {
        let agent_pos = Position::agent(srv.to_string());
        agents.push(bus.attach(agent_pos.clone(), Some(&Position::manager())));
        for proc in 0..2 {
            workers.push(bus.attach(
                Position::worker(srv.to_string(), proc.to_string()),
                Some(&agent_pos),
            ));
        }
    }
    Cluster {
        bus,
        controller,
        manager,
        agents,
        workers,
    }
}

fn counts(boxes: &[Mailbox]) -> Vec<usize> {
    boxes.iter().map(|b| b.drain().len()).collect()
}

#[test]
fn test_bus_routes_down_to_single_worker() {
    init_logger();
    let c = cluster();
    let ack = c
        .bus
        .transport(Position::manager())
        .sync_send_message("d-1", "test", "{}", &Position::worker("1", "0"))
        .unwrap();
    assert_eq!(ack.code, ACK_OK);
    assert_eq!(ack.src, Some(Position::worker("1", "0")));
    assert_eq!(counts(&c.workers), vec![0, 0, 1, 0]);
    assert_eq!(counts(&c.agents), vec![0, 0]);
}

#[test]
fn test_bus_routes_up_through_parents() {
    let c = cluster();
    let ack = c
        .bus
        .transport(Position::worker("0", "1"))
        .sync_send_message("u-1", "test", "{}", &Position::controller())
        .unwrap();
    assert_eq!(ack.code, ACK_OK);
    assert_eq!(c.controller.drain().len(), 1);
    assert!(c.manager.try_recv().is_none());
}

#[test]
fn test_bus_broadcast_and_rank_lists() {
    let c = cluster();
    let transport = c.bus.transport(Position::controller());

    transport
        .sync_send_message("b-1", "test", "{}", &Position::worker("*", "*"))
        .unwrap();
    assert_eq!(counts(&c.workers), vec![1, 1, 1, 1]);

    // 重复rank只投递一次
    transport
        .sync_send_message("b-2", "test", "{}", &Position::worker("0,0,1", "1"))
        .unwrap();
    assert_eq!(counts(&c.workers), vec![0, 1, 0, 1]);

    transport
        .sync_send_message("b-3", "test", "{}", &Position::agent("*"))
        .unwrap();
    assert_eq!(counts(&c.agents), vec![1, 1]);
}

#[test]
fn test_bus_same_level_relay() {
    let c = cluster();
    c.bus
        .transport(Position::agent("0"))
        .sync_send_message("s-1", "test", "{}", &Position::agent("1"))
        .unwrap();
    assert_eq!(counts(&c.agents), vec![0, 1]);
}

#[test]
fn test_bus_acks_frame_errors_with_code() {
    let c = cluster();
    let mut frame = frame_to(Position::agent("0,x"));
    frame.header.as_mut().unwrap().uuid = "bad-1".to_string();
    let ack = c.bus.deliver(frame).unwrap();
    assert_eq!(ack.uuid, "bad-1");
    assert_eq!(ack.code, FrameError::DstSrvRankIllegal.code());
    assert_eq!(counts(&c.agents), vec![0, 0]);
}

#[test]
fn test_bus_unreachable_destination() {
    let c = cluster();
    let result = c
        .bus
        .transport(Position::manager())
        .sync_send_message("x-1", "test", "{}", &Position::agent("7"));
    assert!(matches!(result, Err(TransportError::Unreachable(_))));

    let stranger = c
        .bus
        .transport(Position::agent("9"))
        .sync_send_message("x-2", "test", "{}", &Position::manager());
    assert!(matches!(stranger, Err(TransportError::Unreachable(_))));
}

#[test]
fn test_detached_mailbox_stops_receiving() {
    let c = cluster();
    c.bus.detach(&Position::worker("1", "1"));
    c.bus
        .transport(Position::manager())
        .sync_send_message("w-1", "test", "{}", &Position::worker("*", "*"))
        .unwrap();
    assert_eq!(counts(&c.workers), vec![1, 1, 1, 0]);
}

#[test]
fn test_mailbox_timeout() {
    let c = cluster();
    let err = c.manager.recv_timeout(Duration::from_millis(5)).unwrap_err();
    assert!(matches!(err, TransportError::Timeout(_)));
}

#[test]
fn test_dispatcher_resolves_names_and_counts_receivers() {
    init_logger();
    let c = cluster();
    let shot = SnapshotBuilder::new("job-t")
        .controller()
        .agent(0)
        .agent(1)
        .build();
    let dispatcher = MsgDispatcher::new(
        c.bus.transport(Position::manager()),
        Position::manager(),
        fast_policy(2),
    );

    let exit = MsgBody::new(Feature::Lifecycle(LifecycleCode::ExitAgent), "exit")
        .with_extension("job", "job-t");
    let msgs = vec![
        Msg::new(vec!["agent-0".to_string(), "agent-1".to_string()], exit),
        Msg::to(
            "agent-5",
            MsgBody::new(Feature::Lifecycle(LifecycleCode::ExitAgent), "nobody"),
        ),
    ];
    let report = dispatcher.dispatch_msgs(&shot, &msgs);
    assert_eq!(report.sent, 2);
    assert_eq!(report.failed, 1);

    let received = c.agents[1].try_recv().unwrap();
    assert_eq!(dst_of(&received), Position::agent("1"));
    let header = received.header.as_ref().unwrap();
    assert_eq!(header.src, Some(Position::manager()));
    assert_eq!(header.mtype, "lifecycle");
    assert!(!header.uuid.is_empty());
    let body = MsgBody::from_json(&received.body).unwrap();
    assert_eq!(body.extension.get("job").map(String::as_str), Some("job-t"));
    assert_eq!(c.agents[0].drain().len(), 1);
}

#[cfg(feature = "zmq-transport")]
mod zmq_transport {
    use std::thread;
    use std::time::Duration;

    use taskd::frame::FrameError;
    use taskd::transport::zmq::{ZmqIngress, ZmqTransport};
    use taskd::{Position, Transport, ACK_OK};

    #[test]
    fn test_dealer_router_round_trip() {
        let (inbox_tx, inbox_rx) = crossbeam_channel::unbounded();
        let ingress = ZmqIngress::bind("tcp://127.0.0.1:*", Position::agent("0"), inbox_tx).unwrap();
        let endpoint = ingress.current_endpoint().unwrap();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let server = thread::spawn(move || ingress.run(stop_rx));

        let client = ZmqTransport::connect(&endpoint, Position::manager(), Duration::from_secs(2)).unwrap();
        let ack = client
            .sync_send_message("z-1", "test", "{}", &Position::agent("0"))
            .unwrap();
        assert_eq!(ack.uuid, "z-1");
        assert_eq!(ack.code, ACK_OK);
        let received = inbox_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(received.header.unwrap().uuid, "z-1");

        let ack = client
            .sync_send_message("z-2", "test", "{}", &Position::agent("0,x"))
            .unwrap();
        assert_eq!(ack.code, FrameError::DstSrvRankIllegal.code());
        assert!(inbox_rx.try_recv().is_err());

        stop_tx.send(()).unwrap();
        server.join().unwrap().unwrap();
    }
}
