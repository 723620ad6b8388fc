//! 运行配置
//!
//! 先从JSON文件加载，再用`TASKD_*`环境变量覆盖。

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proto::taskd::Position;
use crate::transport::{HeartbeatSender, RetryPolicy, Transport};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("配置文件读取失败: {0}")]
    Io(#[from] std::io::Error),
    #[error("配置解析失败: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("配置项{key}非法: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskdConfig {
    /// 协调周期(毫秒)
    pub tick_interval_ms: u64,
    pub send_retry: RetryPolicy,
    pub heartbeat_interval_ms: u64,
    /// 心跳间隔抖动百分比
    pub heartbeat_jitter_pct: u32,
    pub log_filter: String,
}

impl Default for TaskdConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            send_retry: RetryPolicy::default(),
            heartbeat_interval_ms: 5000,
            heartbeat_jitter_pct: 5,
            log_filter: "info".to_string(),
        }
    }
}

impl TaskdConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    /// 读取环境变量覆盖，未设置的项保持不变
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// 以任意查找函数覆盖配置，便于测试
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TASKD_TICK_INTERVAL_MS") {
            self.tick_interval_ms = parse_env("TASKD_TICK_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("TASKD_SEND_RETRY_ATTEMPTS") {
            self.send_retry.attempts = parse_env("TASKD_SEND_RETRY_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("TASKD_SEND_RETRY_DELAY_MS") {
            self.send_retry.delay = Duration::from_millis(parse_env("TASKD_SEND_RETRY_DELAY_MS", &v)?);
        }
        if let Some(v) = lookup("TASKD_HEARTBEAT_INTERVAL_MS") {
            self.heartbeat_interval_ms = parse_env("TASKD_HEARTBEAT_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("TASKD_LOG") {
            self.log_filter = v;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_ms == 0 {
            return Err(invalid("tick_interval_ms", self.tick_interval_ms));
        }
        if self.send_retry.attempts == 0 {
            return Err(invalid("send_retry.attempts", self.send_retry.attempts));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(invalid("heartbeat_interval_ms", self.heartbeat_interval_ms));
        }
        if self.heartbeat_jitter_pct > 50 {
            return Err(invalid("heartbeat_jitter_pct", self.heartbeat_jitter_pct));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// 按配置的间隔与抖动构造心跳发送器
    pub fn heartbeat_sender(&self, transport: Arc<dyn Transport>, dst: Position) -> HeartbeatSender {
        HeartbeatSender::new(transport, dst, self.heartbeat_interval())
            .with_jitter(self.heartbeat_jitter_pct)
    }
}

fn invalid(key: &'static str, value: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| invalid(key, raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = TaskdConfig::from_json_str(r#"{"tick_interval_ms": 250}"#).unwrap();
        assert_eq!(config.tick_interval(), Duration::from_millis(250));
        assert_eq!(config.send_retry, RetryPolicy::default());
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn test_retry_delay_in_millis() {
        let config =
            TaskdConfig::from_json_str(r#"{"send_retry": {"attempts": 5, "delay": 20}}"#).unwrap();
        assert_eq!(config.send_retry.attempts, 5);
        assert_eq!(config.send_retry.delay, Duration::from_millis(20));
    }

    #[test]
    fn test_env_overrides() {
        let config = TaskdConfig::default()
            .with_overrides(|key| match key {
                "TASKD_SEND_RETRY_ATTEMPTS" => Some("7".to_string()),
                "TASKD_LOG" => Some("debug".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.send_retry.attempts, 7);
        assert_eq!(config.log_filter, "debug");

        let err = TaskdConfig::default()
            .with_overrides(|key| (key == "TASKD_TICK_INTERVAL_MS").then(|| "0".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "tick_interval_ms", .. }));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(TaskdConfig::from_json_str(r#"{"tick_interval_ms": 0}"#).is_err());
        assert!(TaskdConfig::from_json_str(r#"{"tick_interval_ms": "x"}"#).is_err());
    }
}
