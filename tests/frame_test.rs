//! 帧校验测试

use proptest::prelude::*;
use taskd::{validate_and_correct_frame, FrameError, Message, MessageHeader, Position};

mod test_utils;
use test_utils::{dst_of, frame_to};

#[test]
fn test_nil_checks_in_order() {
    assert_eq!(validate_and_correct_frame(None), Err(FrameError::NilMessage));

    let mut no_header = Message {
        header: None,
        body: String::new(),
    };
    assert_eq!(validate_and_correct_frame(Some(&mut no_header)), Err(FrameError::NilHeader));

    let mut no_src = frame_to(Position::agent("1"));
    no_src.header.as_mut().unwrap().src = None;
    assert_eq!(validate_and_correct_frame(Some(&mut no_src)), Err(FrameError::NilPosition));

    let mut no_dst = Message {
        header: Some(MessageHeader {
            uuid: "u".to_string(),
            mtype: "t".to_string(),
            src: Some(Position::manager()),
            dst: None,
        }),
        body: String::new(),
    };
    assert_eq!(validate_and_correct_frame(Some(&mut no_dst)), Err(FrameError::NilPosition));
}

#[test]
fn test_illegal_role() {
    let mut msg = frame_to(Position {
        role: "Scheduler".to_string(),
        server_rank: "0".to_string(),
        process_rank: "-1".to_string(),
    });
    assert_eq!(validate_and_correct_frame(Some(&mut msg)), Err(FrameError::DstRoleIllegal));
}

#[test]
fn test_server_rank_rules() {
    let mut bad = frame_to(Position::agent("1,2,x"));
    let before = bad.clone();
    assert_eq!(validate_and_correct_frame(Some(&mut bad)), Err(FrameError::DstSrvRankIllegal));
    assert_eq!(bad, before, "rejected frame must stay untouched");

    let mut list = frame_to(Position::agent("1,2,3"));
    assert!(validate_and_correct_frame(Some(&mut list)).is_ok());
    assert_eq!(dst_of(&list).server_rank, "1,2,3");

    let mut wildcard = frame_to(Position::agent("*"));
    assert!(validate_and_correct_frame(Some(&mut wildcard)).is_ok());
    assert_eq!(dst_of(&wildcard).server_rank, "*");

    let mut partial = frame_to(Position::agent("1,*,3"));
    assert!(validate_and_correct_frame(Some(&mut partial)).is_ok());
    assert_eq!(dst_of(&partial).server_rank, "*");

    // 超出u32的十进制rank仍然合法
    let mut wide = frame_to(Position::agent("1,4294967296"));
    assert!(validate_and_correct_frame(Some(&mut wide)).is_ok());
    assert_eq!(dst_of(&wide).server_rank, "1,4294967296");
}

#[test]
fn test_process_rank_forced_for_coarse_roles() {
    let mut msg = frame_to(Position {
        role: "Agent".to_string(),
        server_rank: "2".to_string(),
        process_rank: "garbage".to_string(),
    });
    assert!(validate_and_correct_frame(Some(&mut msg)).is_ok());
    assert_eq!(dst_of(&msg).process_rank, "-1");
}

#[test]
fn test_worker_process_rank_checked() {
    let mut bad = frame_to(Position::worker("0", "1,a"));
    assert_eq!(
        validate_and_correct_frame(Some(&mut bad)),
        Err(FrameError::DstProcessRankIllegal)
    );
    assert_eq!(dst_of(&bad).process_rank, "1,a");

    let mut ok = frame_to(Position::worker("0,1", "3,*"));
    assert!(validate_and_correct_frame(Some(&mut ok)).is_ok());
    let dst = dst_of(&ok);
    assert_eq!(dst.server_rank, "0,1");
    assert_eq!(dst.process_rank, "*");
}

#[test]
fn test_bad_process_rank_does_not_touch_server_rank() {
    let mut msg = frame_to(Position::worker("1,*", "x"));
    assert_eq!(
        validate_and_correct_frame(Some(&mut msg)),
        Err(FrameError::DstProcessRankIllegal)
    );
    assert_eq!(dst_of(&msg).server_rank, "1,*");
}

fn rank_field() -> impl Strategy<Value = String> {
    prop_oneof![
        prop::collection::vec(0u32..64, 1..5).prop_map(|v| v
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(",")),
        Just("*".to_string()),
        "[0-9,*]{1,6}",
        "[0-9a-z,\\-]{0,6}",
    ]
}

fn role_name() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("Worker".to_string()),
        Just("Agent".to_string()),
        Just("Manager".to_string()),
        Just("Controller".to_string()),
    ]
}

proptest! {
    #[test]
    fn prop_validation_is_idempotent(role in role_name(), srv in rank_field(), proc in rank_field()) {
        let mut msg = frame_to(Position { role, server_rank: srv, process_rank: proc });
        if validate_and_correct_frame(Some(&mut msg)).is_ok() {
            let once = msg.clone();
            prop_assert!(validate_and_correct_frame(Some(&mut msg)).is_ok());
            prop_assert_eq!(msg, once);
        }
    }

    #[test]
    fn prop_broadcast_normalizes_to_sentinel(prefix in "[0-9,]{0,4}", suffix in "[0-9,a-z]{0,4}") {
        let srv = format!("{}*{}", prefix, suffix);
        let mut msg = frame_to(Position::worker(srv, format!("{}*", prefix)));
        prop_assert!(validate_and_correct_frame(Some(&mut msg)).is_ok());
        let dst = dst_of(&msg);
        prop_assert_eq!(dst.server_rank, "*");
        prop_assert_eq!(dst.process_rank, "*");
    }
}
