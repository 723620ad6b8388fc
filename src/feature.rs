//! 功能码 - 按功能族划分的消息码
//!
//! 线上仍是单一整数命名空间，进程内统一转换为`Feature`，
//! 接收端按功能族穷举匹配。

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("unknown feature code {0}")]
pub struct UnknownFeatureCode(pub i32);

/// 注册
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationCode {
    Register,
    RegisterAck,
    Heartbeat,
}

/// 故障上报
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultCode {
    Report,
    Recovered,
}

/// 性能采集开关
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfilingCode {
    /// 下发开关命令
    Switch,
    /// 上报域状态
    DomainStatus,
}

/// 网卡切换
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NicCode {
    Switch,
    SwitchResult,
}

/// 压测
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StressCode {
    Start,
    Result,
}

/// 控制器与节点生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleCode {
    DestroyController,
    ExitAgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Registration(RegistrationCode),
    Fault(FaultCode),
    Profiling(ProfilingCode),
    Nic(NicCode),
    Stress(StressCode),
    Lifecycle(LifecycleCode),
}

impl Feature {
    pub fn code(&self) -> i32 {
        match self {
            Feature::Registration(RegistrationCode::Register) => 101,
            Feature::Registration(RegistrationCode::RegisterAck) => 102,
            Feature::Registration(RegistrationCode::Heartbeat) => 103,
            Feature::Fault(FaultCode::Report) => 201,
            Feature::Fault(FaultCode::Recovered) => 202,
            Feature::Profiling(ProfilingCode::Switch) => 301,
            Feature::Profiling(ProfilingCode::DomainStatus) => 302,
            Feature::Nic(NicCode::Switch) => 401,
            Feature::Nic(NicCode::SwitchResult) => 402,
            Feature::Stress(StressCode::Start) => 501,
            Feature::Stress(StressCode::Result) => 502,
            Feature::Lifecycle(LifecycleCode::DestroyController) => 601,
            Feature::Lifecycle(LifecycleCode::ExitAgent) => 602,
        }
    }

    /// 功能族名称，作为MsgBody.msg_type和线上mtype
    pub fn msg_type(&self) -> &'static str {
        match self {
            Feature::Registration(_) => "registration",
            Feature::Fault(_) => "fault",
            Feature::Profiling(_) => "profiling",
            Feature::Nic(_) => "nic",
            Feature::Stress(_) => "stress",
            Feature::Lifecycle(_) => "lifecycle",
        }
    }
}

impl TryFrom<i32> for Feature {
    type Error = UnknownFeatureCode;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        let feature = match code {
            101 => Feature::Registration(RegistrationCode::Register),
            102 => Feature::Registration(RegistrationCode::RegisterAck),
            103 => Feature::Registration(RegistrationCode::Heartbeat),
            201 => Feature::Fault(FaultCode::Report),
            202 => Feature::Fault(FaultCode::Recovered),
            301 => Feature::Profiling(ProfilingCode::Switch),
            302 => Feature::Profiling(ProfilingCode::DomainStatus),
            401 => Feature::Nic(NicCode::Switch),
            402 => Feature::Nic(NicCode::SwitchResult),
            501 => Feature::Stress(StressCode::Start),
            502 => Feature::Stress(StressCode::Result),
            601 => Feature::Lifecycle(LifecycleCode::DestroyController),
            602 => Feature::Lifecycle(LifecycleCode::ExitAgent),
            other => return Err(UnknownFeatureCode(other)),
        };
        Ok(feature)
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.msg_type(), self.code())
    }
}
