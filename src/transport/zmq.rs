//! ZMQ传输: DEALER发送端与ROUTER接收端
//!
//! 帧为protobuf编码的`Message`/`Ack`。发送端在接收超时内阻塞等待Ack，
//! 接收端对每个入站帧先校验、分类，再回复Ack。

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use prost::Message as _;
use zmq::{Context, Socket, DEALER, POLLIN, ROUTER};

use crate::frame::{validate_and_correct_frame, FrameError, ACK_OK};
use crate::proto::taskd::{Ack, Message, Position};
use crate::route::{dst_case, DstCase};

use super::{build_message, Transport, TransportError, ACK_UNROUTABLE};

/// 请求/Ack交互的DEALER端
pub struct ZmqTransport {
    _ctx: Context,
    socket: Mutex<Socket>,
    src: Position,
    timeout: Duration,
}

impl ZmqTransport {
    pub fn connect(endpoint: &str, src: Position, timeout: Duration) -> Result<Self, TransportError> {
        let ctx = Context::new();
        let socket = ctx.socket(DEALER)?;
        socket.set_rcvtimeo(timeout.as_millis() as i32)?;
        socket.set_linger(0)?;
        socket.connect(endpoint)?;
        info!("zmq transport for {} connected to {}", src, endpoint);
        Ok(Self {
            _ctx: ctx,
            socket: Mutex::new(socket),
            src,
            timeout,
        })
    }
}

impl Transport for ZmqTransport {
    fn sync_send_message(
        &self,
        uuid: &str,
        mtype: &str,
        body: &str,
        dst: &Position,
    ) -> Result<Ack, TransportError> {
        let frame = build_message(uuid, mtype, body, &self.src, dst).encode_to_vec();
        let socket = self.socket.lock();
        socket.send(frame, 0)?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let raw = match socket.recv_bytes(0) {
                Ok(raw) => raw,
                Err(zmq::Error::EAGAIN) => return Err(TransportError::Timeout(self.timeout)),
                Err(e) => return Err(e.into()),
            };
            let ack = Ack::decode(raw.as_slice())?;
            if ack.uuid == uuid {
                return Ok(ack);
            }
            // 之前已超时的那次请求的Ack
            debug!("dropping stale ack {}", ack.uuid);
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout(self.timeout));
            }
        }
    }
}

/// ROUTER端，接收发往`local`的帧
pub struct ZmqIngress {
    _ctx: Context,
    socket: Socket,
    local: Position,
    inbox: Sender<Message>,
    relay: Option<Arc<dyn Transport>>,
}

impl ZmqIngress {
    pub fn bind(endpoint: &str, local: Position, inbox: Sender<Message>) -> Result<Self, TransportError> {
        let ctx = Context::new();
        let socket = ctx.socket(ROUTER)?;
        socket.bind(endpoint)?;
        info!("zmq ingress for {} bound on {}", local, endpoint);
        Ok(Self {
            _ctx: ctx,
            socket,
            local,
            inbox,
            relay: None,
        })
    }

    /// 不是发往`local`的帧经`relay`转发
    pub fn with_relay(mut self, relay: Arc<dyn Transport>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn current_endpoint(&self) -> Result<String, TransportError> {
        self.socket
            .get_last_endpoint()
            .map(|opt| opt.unwrap_or_default())
            .map_err(TransportError::from)
    }

    /// 最多处理一个入站帧，返回是否处理了
    pub fn poll_once(&self, timeout: Duration) -> Result<bool, TransportError> {
        let mut items = [self.socket.as_poll_item(POLLIN)];
        zmq::poll(&mut items, timeout.as_millis() as i64)?;
        if !items[0].is_readable() {
            return Ok(false);
        }

        let mut parts = self.socket.recv_multipart(0)?;
        let Some(payload) = parts.pop() else {
            return Ok(false);
        };
        let Some(identity) = parts.into_iter().next() else {
            warn!("frame without routing identity dropped");
            return Ok(false);
        };

        let ack = self.accept(&payload);
        self.socket.send(identity, zmq::SNDMORE)?;
        self.socket.send(ack.encode_to_vec(), 0)?;
        Ok(true)
    }

    /// 轮询直到收到`shutdown`
    pub fn run(&self, shutdown: Receiver<()>) -> Result<(), TransportError> {
        loop {
            if shutdown.try_recv().is_ok() {
                info!("zmq ingress for {} stopping", self.local);
                return Ok(());
            }
            if let Err(e) = self.poll_once(Duration::from_millis(100)) {
                error!("zmq ingress poll failed: {}", e);
            }
        }
    }

    fn accept(&self, payload: &[u8]) -> Ack {
        let mut msg = match Message::decode(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!("undecodable frame ({} bytes): {}", payload.len(), e);
                return self.ack(String::new(), FrameError::NilMessage.code());
            }
        };
        let uuid = msg.header.as_ref().map(|h| h.uuid.clone()).unwrap_or_default();
        if let Err(e) = validate_and_correct_frame(Some(&mut msg)) {
            return self.ack(uuid, e.code());
        }

        let dst = msg.header.as_ref().and_then(|h| h.dst.clone());
        match dst_case(Some(&self.local), dst.as_ref()) {
            DstCase::ToSelf => match self.inbox.send(msg) {
                Ok(()) => self.ack(uuid, ACK_OK),
                Err(_) => self.ack(uuid, ACK_UNROUTABLE),
            },
            DstCase::Unknown => self.ack(uuid, ACK_UNROUTABLE),
            case => self.forward(uuid, case, msg),
        }
    }

    fn forward(&self, uuid: String, case: DstCase, msg: Message) -> Ack {
        let (Some(relay), Some(header)) = (&self.relay, msg.header) else {
            warn!("no relay for {:?} frame {}", case, uuid);
            return self.ack(uuid, ACK_UNROUTABLE);
        };
        let Some(dst) = header.dst else {
            return self.ack(uuid, FrameError::NilPosition.code());
        };
        match relay.sync_send_message(&uuid, &header.mtype, &msg.body, &dst) {
            Ok(ack) => ack,
            Err(e) => {
                warn!("relay of {} failed: {}", uuid, e);
                self.ack(uuid, ACK_UNROUTABLE)
            }
        }
    }

    fn ack(&self, uuid: String, code: u32) -> Ack {
        Ack {
            uuid,
            code,
            src: Some(self.local.clone()),
        }
    }
}
