//! 路由分类 - 根据本地地址与目的地址判定投递方式
//!
//! 跨层级一律中继，不比较rank；到达目的层级后再重新判定rank是否匹配。

use crate::address::{Role, BROADCAST_RANK};
use crate::proto::taskd::Position;

/// 投递方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DstCase {
    /// 地址缺失或角色未知
    Unknown,
    /// 本地消费
    ToSelf,
    /// 向上中继(目的层级更高)
    ToUpperLevel,
    /// 向下中继(目的层级更低)
    ToLowerLevel,
    /// 同层横向中继
    ToSameLevel,
}

impl DstCase {
    pub fn is_relay(&self) -> bool {
        matches!(self, DstCase::ToUpperLevel | DstCase::ToLowerLevel | DstCase::ToSameLevel)
    }
}

/// 判定`dst`相对于`self_pos`的投递方式
pub fn dst_case(self_pos: Option<&Position>, dst: Option<&Position>) -> DstCase {
    let (Some(me), Some(dst)) = (self_pos, dst) else {
        return DstCase::Unknown;
    };
    if me == dst {
        return DstCase::ToSelf;
    }
    let (Some(my_role), Some(dst_role)) = (Role::parse(&me.role), Role::parse(&dst.role)) else {
        return DstCase::Unknown;
    };

    let (my_level, dst_level) = (my_role.level(), dst_role.level());
    if dst_level > my_level {
        return DstCase::ToUpperLevel;
    }
    if dst_level < my_level {
        return DstCase::ToLowerLevel;
    }

    if rank_matches(&me.server_rank, &dst.server_rank) {
        if !dst_role.has_process_property() {
            return DstCase::ToSelf;
        }
        if rank_matches(&me.process_rank, &dst.process_rank) {
            return DstCase::ToSelf;
        }
    }
    DstCase::ToSameLevel
}

fn rank_matches(mine: &str, dst: &str) -> bool {
    mine == dst || dst == BROADCAST_RANK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_crossing_ignores_ranks() {
        let agent = Position::agent("3");
        assert_eq!(dst_case(Some(&agent), Some(&Position::worker("7", "1"))), DstCase::ToLowerLevel);
        assert_eq!(dst_case(Some(&agent), Some(&Position::manager())), DstCase::ToUpperLevel);
    }

    #[test]
    fn test_unknown_when_missing() {
        assert_eq!(dst_case(None, Some(&Position::manager())), DstCase::Unknown);
        assert_eq!(dst_case(Some(&Position::manager()), None), DstCase::Unknown);
    }
}
