/// 参与者地址
#[derive(serde::Serialize, serde::Deserialize)]
#[derive(Eq, Hash)]
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Position {
    /// 角色名称: Worker / Agent / Manager / Controller
    #[prost(string, tag = "1")]
    pub role: ::prost::alloc::string::String,
    /// 逗号分隔的服务器rank列表，或广播符"*"
    #[prost(string, tag = "2")]
    pub server_rank: ::prost::alloc::string::String,
    /// 逗号分隔的进程rank列表、广播符"*"，无进程属性的角色为"-1"
    #[prost(string, tag = "3")]
    pub process_rank: ::prost::alloc::string::String,
}
/// 消息头
#[derive(serde::Serialize, serde::Deserialize)]
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageHeader {
    #[prost(string, tag = "1")]
    pub uuid: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub mtype: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "3")]
    pub src: ::core::option::Option<Position>,
    #[prost(message, optional, tag = "4")]
    pub dst: ::core::option::Option<Position>,
}
/// 控制面消息
#[derive(serde::Serialize, serde::Deserialize)]
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(message, optional, tag = "1")]
    pub header: ::core::option::Option<MessageHeader>,
    /// JSON编码的MsgBody
    #[prost(string, tag = "2")]
    pub body: ::prost::alloc::string::String,
}
/// 消息确认
#[derive(serde::Serialize, serde::Deserialize)]
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ack {
    #[prost(string, tag = "1")]
    pub uuid: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub code: u32,
    #[prost(message, optional, tag = "3")]
    pub src: ::core::option::Option<Position>,
}
