//! 日志初始化
//!
//! `RUST_LOG`优先，未设置时使用配置中的过滤级别。重复初始化不报错。

use env_logger::{Builder, Env};

pub fn init(default_filter: &str) {
    let env = Env::default().default_filter_or(default_filter);
    if Builder::from_env(env)
        .format_timestamp_millis()
        .try_init()
        .is_err()
    {
        log::debug!("logger already initialized");
    }
}
