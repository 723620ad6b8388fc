//! 入站命令槽 - 基于crossbeam-channel的容量为1的通道
//!
//! 生产者永不阻塞: 槽已满时丢弃旧命令，只保留最新的一条。

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::debug;

/// 投递结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// 替换了尚未被取走的旧命令
    ReplacedStale,
    /// 并发生产者抢先占满了槽
    Dropped,
}

pub struct CommandSlot<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Clone for CommandSlot<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> Default for CommandSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CommandSlot<T> {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    pub fn offer(&self, cmd: T) -> Offer {
        let cmd = match self.tx.try_send(cmd) {
            Ok(()) => return Offer::Queued,
            Err(TrySendError::Full(cmd)) => cmd,
            Err(TrySendError::Disconnected(_)) => return Offer::Dropped,
        };
        let stale = self.rx.try_recv().is_ok();
        match self.tx.try_send(cmd) {
            Ok(()) if stale => {
                debug!("stale command replaced");
                Offer::ReplacedStale
            }
            Ok(()) => Offer::Queued,
            Err(_) => Offer::Dropped,
        }
    }

    pub fn take(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn is_pending(&self) -> bool {
        !self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_command_wins() {
        let slot = CommandSlot::new();
        assert_eq!(slot.offer(1), Offer::Queued);
        assert_eq!(slot.offer(2), Offer::ReplacedStale);
        assert_eq!(slot.offer(3), Offer::ReplacedStale);
        assert_eq!(slot.take(), Some(3));
        assert_eq!(slot.take(), None);
        assert!(!slot.is_pending());
    }
}
