//! 地址模型 - 角色层级与rank集合
//!
//! 角色按可寻址范围从细到粗排列: Worker < Agent < Manager < Controller。
//! 只有Worker携带进程粒度，其余角色的process_rank固定为"-1"。

use std::fmt;

use crate::proto::taskd::Position;

/// 广播符
pub const BROADCAST_RANK: &str = "*";

/// 无进程属性角色的process_rank
pub const PROCESS_RANK_NA: &str = "-1";

/// Manager/Controller只有一个实例，server_rank固定为"0"
const SINGLETON_RANK: &str = "0";

/// 参与者角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Worker,
    Agent,
    Manager,
    Controller,
}

impl Role {
    /// 全部角色，按层级升序
    pub const ALL: [Role; 4] = [Role::Worker, Role::Agent, Role::Manager, Role::Controller];

    /// 解析线上角色名称
    pub fn parse(name: &str) -> Option<Role> {
        match name {
            "Worker" => Some(Role::Worker),
            "Agent" => Some(Role::Agent),
            "Manager" => Some(Role::Manager),
            "Controller" => Some(Role::Controller),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Worker => "Worker",
            Role::Agent => "Agent",
            Role::Manager => "Manager",
            Role::Controller => "Controller",
        }
    }

    /// 层级越高，可表示的参与者范围越大
    pub fn level(&self) -> u8 {
        match self {
            Role::Worker => 1,
            Role::Agent => 2,
            Role::Manager => 3,
            Role::Controller => 4,
        }
    }

    /// process_rank是否有意义
    pub fn has_process_property(&self) -> bool {
        matches!(self, Role::Worker)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 未知角色返回None
pub fn role_level(role: &str) -> Option<u8> {
    Role::parse(role).map(|r| r.level())
}

pub fn role_has_process_property(role: &str) -> bool {
    Role::parse(role).is_some_and(|r| r.has_process_property())
}

/// 解析后的rank字段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RankSet {
    Broadcast,
    List(Vec<u64>),
}

impl RankSet {
    /// 解析rank字符串
    ///
    /// 只要包含广播符就视为广播；否则必须是干净的逗号分隔非负整数列表，
    /// 允许重复，不允许空项和空白。单个rank以u64承载，超出u64的数字串视为非法。
    pub fn parse(raw: &str) -> Option<RankSet> {
        if raw.contains(BROADCAST_RANK) {
            return Some(RankSet::Broadcast);
        }
        if raw.is_empty() {
            return None;
        }
        let mut ranks = Vec::new();
        for item in raw.split(',') {
            if item.is_empty() || !item.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            ranks.push(item.parse::<u64>().ok()?);
        }
        Some(RankSet::List(ranks))
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, RankSet::Broadcast)
    }

    pub fn contains(&self, rank: u64) -> bool {
        match self {
            RankSet::Broadcast => true,
            RankSet::List(ranks) => ranks.contains(&rank),
        }
    }

    /// 去重后的rank列表，广播返回None
    pub fn distinct(&self) -> Option<Vec<u64>> {
        match self {
            RankSet::Broadcast => None,
            RankSet::List(ranks) => {
                let mut out: Vec<u64> = Vec::with_capacity(ranks.len());
                for r in ranks {
                    if !out.contains(r) {
                        out.push(*r);
                    }
                }
                Some(out)
            }
        }
    }

    /// 规范形式: 广播为"*"，列表保持原顺序
    pub fn canonical(&self) -> String {
        match self {
            RankSet::Broadcast => BROADCAST_RANK.to_string(),
            RankSet::List(ranks) => ranks
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

impl Position {
    pub fn with_role(role: Role, server_rank: impl Into<String>, process_rank: impl Into<String>) -> Self {
        Self {
            role: role.as_str().to_string(),
            server_rank: server_rank.into(),
            process_rank: process_rank.into(),
        }
    }

    pub fn worker(server_rank: impl Into<String>, process_rank: impl Into<String>) -> Self {
        Self::with_role(Role::Worker, server_rank, process_rank)
    }

    pub fn agent(server_rank: impl Into<String>) -> Self {
        Self::with_role(Role::Agent, server_rank, PROCESS_RANK_NA)
    }

    pub fn manager() -> Self {
        Self::with_role(Role::Manager, SINGLETON_RANK, PROCESS_RANK_NA)
    }

    pub fn controller() -> Self {
        Self::with_role(Role::Controller, SINGLETON_RANK, PROCESS_RANK_NA)
    }

    /// 角色名不在封闭集合内时返回None
    pub fn role_kind(&self) -> Option<Role> {
        Role::parse(&self.role)
    }

    /// 稳定的字符串键 "Role/srv/proc"
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.role, self.server_rank, self.process_rank)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}:{}]", self.role, self.server_rank, self.process_rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_follow_breadth() {
        let levels: Vec<u8> = Role::ALL.iter().map(|r| r.level()).collect();
        assert!(levels.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(role_level("Nope"), None);
    }

    #[test]
    fn test_rank_parse() {
        assert_eq!(RankSet::parse("1,2,2"), Some(RankSet::List(vec![1, 2, 2])));
        assert_eq!(RankSet::parse("1,*"), Some(RankSet::Broadcast));
        assert_eq!(RankSet::parse("1,,2"), None);
        assert_eq!(RankSet::parse(" 1"), None);
        assert_eq!(RankSet::parse("-1"), None);
        assert_eq!(RankSet::parse(""), None);
        assert_eq!(RankSet::parse("1,2,2").and_then(|r| r.distinct()), Some(vec![1, 2]));
        assert_eq!(
            RankSet::parse("4294967296"),
            Some(RankSet::List(vec![4_294_967_296]))
        );
        assert_eq!(RankSet::parse("18446744073709551616"), None);
    }
}
