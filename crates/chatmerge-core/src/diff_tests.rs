//! Unit tests for the diff engine.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use uuid::Uuid;

use super::*;
use crate::error::TimeShiftError;
use crate::memory::InMemoryDao;
use crate::models::{
    ChatId, ChatType, ContentPhoto, MessageRegular, MessageSourceId, MessageTyped,
    RichTextElement, Timestamp, User, UserId, NO_INTERNAL_ID,
};

fn m(id: i64) -> MasterInternalId {
    MasterInternalId(id)
}

fn s(id: i64) -> SlaveInternalId {
    SlaveInternalId(id)
}

fn text_message(src_id: Option<i64>, ts: i64, text: &str) -> Message {
    Message::new(
        NO_INTERNAL_ID,
        src_id.map(MessageSourceId),
        Timestamp(ts),
        UserId(2),
        vec![RichTextElement::Plain { text: text.to_owned() }],
        MessageTyped::Regular(MessageRegular {
            edit_timestamp: None,
            forward_from_name: None,
            reply_to_source_id: None,
            content: None,
        }),
    )
}

fn photo_message(src_id: i64, ts: i64, path: &str) -> Message {
    Message::new(
        NO_INTERNAL_ID,
        Some(MessageSourceId(src_id)),
        Timestamp(ts),
        UserId(2),
        vec![],
        MessageTyped::Regular(MessageRegular {
            edit_timestamp: None,
            forward_from_name: None,
            reply_to_source_id: None,
            content: Some(crate::models::Content::Photo(ContentPhoto {
                path: Some(path.to_owned()),
                width: 100,
                height: 100,
            })),
        }),
    )
}

fn migrate_from_message(src_id: i64, ts: i64, from_id: i64) -> Message {
    Message::new(
        NO_INTERNAL_ID,
        Some(MessageSourceId(src_id)),
        Timestamp(ts),
        UserId(from_id),
        vec![],
        MessageTyped::Service(MessageService::GroupMigrateFrom { title: "Old Group".to_owned() }),
    )
}

struct Fixture {
    master_dao: InMemoryDao,
    master_ds: Dataset,
    master_chat: Chat,
    slave_dao: InMemoryDao,
    slave_ds: Dataset,
    slave_chat: Chat,
    master_root: PathBuf,
    slave_root: PathBuf,
}

fn fixture(master_msgs: Vec<Message>, slave_msgs: Vec<Message>) -> Fixture {
    fn side(tag: &str, msgs: Vec<Message>) -> (InMemoryDao, Dataset, Chat, PathBuf) {
        let base_dir = std::env::temp_dir().join(format!("chatmerge-diff-{tag}-{}", Uuid::new_v4()));
        let ds = Dataset {
            uuid: Uuid::new_v4(),
            alias: tag.to_owned(),
            source_type: "telegram".to_owned(),
        };
        let users = vec![
            User {
                ds_uuid: ds.uuid,
                id: UserId(1),
                first_name: Some("Me".to_owned()),
                last_name: None,
                username: None,
                phone_number: None,
            },
            User {
                ds_uuid: ds.uuid,
                id: UserId(2),
                first_name: Some("John".to_owned()),
                last_name: None,
                username: None,
                phone_number: None,
            },
        ];
        let chat = Chat {
            ds_uuid: ds.uuid,
            id: ChatId(1),
            name: Some("Chat".to_owned()),
            tpe: ChatType::PrivateGroup,
            img_path: None,
            member_ids: vec![UserId(1), UserId(2)],
            msg_count: msgs.len() as i64,
        };
        let root = base_dir.join(ds.uuid.to_string());
        std::fs::create_dir_all(&root).expect("create dataset root");
        let mut dao = InMemoryDao::new(format!("{tag}-dao"), base_dir);
        dao.add_dataset(ds.clone(), users, vec![(chat.clone(), msgs)]);
        (dao, ds, chat, root)
    }

    let (master_dao, master_ds, master_chat, master_root) = side("master", master_msgs);
    let (slave_dao, slave_ds, slave_chat, slave_root) = side("slave", slave_msgs);
    Fixture {
        master_dao,
        master_ds,
        master_chat,
        slave_dao,
        slave_ds,
        slave_chat,
        master_root,
        slave_root,
    }
}

async fn run_analysis(f: &Fixture) -> Result<Vec<MessagesMergeDiff>> {
    let mut analyzer =
        DatasetDiffAnalyzer::new(&f.master_dao, &f.master_ds, &f.slave_dao, &f.slave_ds)
            .await?
            .with_batch_size(3);
    analyzer
        .analyze(&f.master_chat, &f.slave_chat, "test chat", &AtomicBool::new(false))
        .await
}

// ============================================================================
// Core scenarios
// ============================================================================

#[tokio::test]
async fn identity_yields_single_match() {
    let msgs = || vec![text_message(Some(1), 1, "hi"), text_message(Some(2), 2, "yo")];
    let f = fixture(msgs(), msgs());

    let sections = run_analysis(&f).await.expect("analyze");
    assert_eq!(
        sections,
        vec![MessagesMergeDiff::Match {
            first_master_id: m(1),
            last_master_id: m(2),
            first_slave_id: s(1),
            last_slave_id: s(2),
        }]
    );
}

#[tokio::test]
async fn appended_messages_become_add() {
    let msg = |i: i64| text_message(Some(i), 1000 + i, &format!("msg {i}"));
    let f = fixture(vec![msg(1), msg(2)], vec![msg(1), msg(2), msg(3), msg(4)]);

    let sections = run_analysis(&f).await.expect("analyze");
    assert_eq!(
        sections,
        vec![
            MessagesMergeDiff::Match {
                first_master_id: m(1),
                last_master_id: m(2),
                first_slave_id: s(1),
                last_slave_id: s(2),
            },
            MessagesMergeDiff::Add { first_slave_id: s(3), last_slave_id: s(4) },
        ]
    );
}

#[tokio::test]
async fn prepend_and_append_around_a_match() {
    let msg = |i: i64| text_message(Some(i), 1000 + i, &format!("msg {i}"));
    let f = fixture(vec![msg(3)], vec![msg(1), msg(2), msg(3), msg(4)]);

    let sections = run_analysis(&f).await.expect("analyze");
    assert_eq!(
        sections,
        vec![
            MessagesMergeDiff::Add { first_slave_id: s(1), last_slave_id: s(2) },
            MessagesMergeDiff::Match {
                first_master_id: m(1),
                last_master_id: m(1),
                first_slave_id: s(3),
                last_slave_id: s(3),
            },
            MessagesMergeDiff::Add { first_slave_id: s(4), last_slave_id: s(4) },
        ]
    );
}

#[tokio::test]
async fn same_source_id_with_different_text_is_a_conflict() {
    let f = fixture(
        vec![text_message(Some(5), 1000, "a")],
        vec![text_message(Some(5), 1000, "b")],
    );

    let sections = run_analysis(&f).await.expect("analyze");
    assert_eq!(
        sections,
        vec![MessagesMergeDiff::Replace {
            first_master_id: m(1),
            last_master_id: m(1),
            first_slave_id: s(1),
            last_slave_id: s(1),
        }]
    );
}

#[tokio::test]
async fn new_media_on_slave_side_is_a_replace() {
    let f = fixture(
        vec![photo_message(7, 1000, "p.jpg")],
        vec![photo_message(7, 1000, "p.jpg")],
    );
    // The file exists only on the slave side.
    std::fs::write(f.slave_root.join("p.jpg"), vec![0u8; 42]).expect("write slave media");

    let sections = run_analysis(&f).await.expect("analyze");
    assert_eq!(
        sections,
        vec![MessagesMergeDiff::Replace {
            first_master_id: m(1),
            last_master_id: m(1),
            first_slave_id: s(1),
            last_slave_id: s(1),
        }]
    );
}

#[tokio::test]
async fn media_present_on_both_sides_is_a_match() {
    let f = fixture(
        vec![photo_message(7, 1000, "p.jpg")],
        vec![photo_message(7, 1000, "p.jpg")],
    );
    std::fs::write(f.master_root.join("p.jpg"), b"same").expect("write master media");
    std::fs::write(f.slave_root.join("p.jpg"), b"same").expect("write slave media");

    let sections = run_analysis(&f).await.expect("analyze");
    assert!(matches!(sections.as_slice(), [MessagesMergeDiff::Match { .. }]));
}

#[tokio::test]
async fn time_shift_is_fatal_with_direction_and_magnitude() {
    let f = fixture(
        vec![text_message(Some(9), 1000, "x")],
        vec![text_message(Some(9), 1000 + 3600, "x")],
    );

    let err = run_analysis(&f).await.expect_err("should detect time shift");
    match err {
        Error::TimeShift(TimeShiftError { shift_secs, .. }) => {
            assert_eq!(shift_secs, 3600);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // The operator-facing message names the direction and magnitude.
    let f = fixture(
        vec![text_message(Some(9), 1000, "x")],
        vec![text_message(Some(9), 1000 + 3600, "x")],
    );
    let message = run_analysis(&f).await.expect_err("shift").to_string();
    assert!(message.contains("slave is ahead of master by 3600 sec (1 hr)"), "{message}");
}

#[tokio::test]
async fn retain_then_add_then_match() {
    let f = fixture(
        vec![text_message(None, 1, "a"), text_message(None, 3, "c")],
        vec![text_message(None, 2, "b"), text_message(None, 3, "c")],
    );

    let sections = run_analysis(&f).await.expect("analyze");
    assert_eq!(
        sections,
        vec![
            MessagesMergeDiff::Retain { first_master_id: m(1), last_master_id: m(1) },
            MessagesMergeDiff::Add { first_slave_id: s(1), last_slave_id: s(1) },
            MessagesMergeDiff::Match {
                first_master_id: m(2),
                last_master_id: m(2),
                first_slave_id: s(2),
                last_slave_id: s(2),
            },
        ]
    );
}

// ============================================================================
// State machine edge cases
// ============================================================================

#[tokio::test]
async fn migrate_from_user_id_widening_is_a_single_replace() {
    let narrow_id = 42;
    let wide_id = narrow_id + (1i64 << 32);
    let f = fixture(
        vec![migrate_from_message(10, 1000, narrow_id)],
        vec![migrate_from_message(10, 1000, wide_id)],
    );

    let sections = run_analysis(&f).await.expect("analyze");
    assert_eq!(
        sections,
        vec![MessagesMergeDiff::Replace {
            first_master_id: m(1),
            last_master_id: m(1),
            first_slave_id: s(1),
            last_slave_id: s(1),
        }]
    );
}

#[tokio::test]
async fn migrate_from_with_unrelated_author_change_is_a_conflict() {
    // Both ids below the widening threshold: the special case must not fire.
    let f = fixture(
        vec![migrate_from_message(10, 1000, 42)],
        vec![migrate_from_message(10, 1000, 43)],
    );

    let sections = run_analysis(&f).await.expect("analyze");
    assert!(matches!(sections.as_slice(), [MessagesMergeDiff::Replace { .. }]));
}

#[tokio::test]
async fn conflict_run_spans_consecutive_conflicting_pairs() {
    let f = fixture(
        vec![text_message(Some(1), 1000, "a"), text_message(Some(2), 1001, "c")],
        vec![text_message(Some(1), 1000, "b"), text_message(Some(2), 1001, "d")],
    );

    let sections = run_analysis(&f).await.expect("analyze");
    assert_eq!(
        sections,
        vec![MessagesMergeDiff::Replace {
            first_master_id: m(1),
            last_master_id: m(2),
            first_slave_id: s(1),
            last_slave_id: s(2),
        }]
    );
}

#[tokio::test]
async fn conflict_run_absorbs_unorderable_pairs() {
    // Once a conflict is open it continues on practical inequality alone;
    // the second pair here has no usable ordering key (timestamps tie, no
    // common source id) and must not trip the ordering check.
    let f = fixture(
        vec![text_message(Some(1), 1000, "a"), text_message(None, 1005, "weird")],
        vec![text_message(Some(1), 1000, "b"), text_message(Some(99), 1005, "other")],
    );

    let sections = run_analysis(&f).await.expect("analyze");
    assert_eq!(
        sections,
        vec![MessagesMergeDiff::Replace {
            first_master_id: m(1),
            last_master_id: m(2),
            first_slave_id: s(1),
            last_slave_id: s(2),
        }]
    );
}

#[tokio::test]
async fn conflict_run_closes_at_the_next_matching_pair() {
    let f = fixture(
        vec![text_message(Some(1), 1000, "a"), text_message(Some(2), 1001, "x")],
        vec![text_message(Some(1), 1000, "b"), text_message(Some(2), 1001, "x")],
    );

    let sections = run_analysis(&f).await.expect("analyze");
    assert_eq!(
        sections,
        vec![
            MessagesMergeDiff::Replace {
                first_master_id: m(1),
                last_master_id: m(1),
                first_slave_id: s(1),
                last_slave_id: s(1),
            },
            MessagesMergeDiff::Match {
                first_master_id: m(2),
                last_master_id: m(2),
                first_slave_id: s(2),
                last_slave_id: s(2),
            },
        ]
    );
}

#[tokio::test]
async fn identical_consecutive_messages_stay_one_match() {
    // Messages identical in timestamp and text are ordered equal; they must
    // align pairwise into a single Match run, not get double-counted.
    let msgs = || vec![text_message(None, 1000, "dup"), text_message(None, 1000, "dup")];
    let f = fixture(msgs(), msgs());

    let sections = run_analysis(&f).await.expect("analyze");
    assert_eq!(
        sections,
        vec![MessagesMergeDiff::Match {
            first_master_id: m(1),
            last_master_id: m(2),
            first_slave_id: s(1),
            last_slave_id: s(2),
        }]
    );
}

#[tokio::test]
async fn unordered_tie_is_a_data_integrity_error() {
    // Same timestamp, no source ids, different text: not orderable.
    let f = fixture(
        vec![text_message(None, 1000, "a")],
        vec![text_message(None, 1000, "b")],
    );

    let err = run_analysis(&f).await.expect_err("should fail");
    assert!(matches!(err, Error::DataIntegrity { .. }), "{err:?}");
}

#[tokio::test]
async fn cancellation_aborts_promptly() {
    let msg = |i: i64| text_message(Some(i), 1000 + i, &format!("msg {i}"));
    let f = fixture(vec![msg(1), msg(2)], vec![msg(1), msg(2)]);

    let mut analyzer =
        DatasetDiffAnalyzer::new(&f.master_dao, &f.master_ds, &f.slave_dao, &f.slave_ds)
            .await
            .expect("analyzer");
    let cancelled = AtomicBool::new(true);
    let err = analyzer
        .analyze(&f.master_chat, &f.slave_chat, "test chat", &cancelled)
        .await
        .expect_err("should cancel");
    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn empty_chats_produce_no_sections() {
    let f = fixture(vec![], vec![]);
    let sections = run_analysis(&f).await.expect("analyze");
    assert!(sections.is_empty());
}

#[tokio::test]
async fn sections_cover_both_streams_in_order() {
    // Master: 1..=6, slave: 3..=8. Expect Retain(1..2), Match(3..6), Add(7..8).
    let msg = |i: i64| text_message(Some(i), 1000 + i, &format!("msg {i}"));
    let f = fixture(
        (1..=6).map(msg).collect(),
        (3..=8).map(msg).collect(),
    );

    let sections = run_analysis(&f).await.expect("analyze");
    assert_eq!(
        sections,
        vec![
            MessagesMergeDiff::Retain { first_master_id: m(1), last_master_id: m(2) },
            MessagesMergeDiff::Match {
                first_master_id: m(3),
                last_master_id: m(6),
                first_slave_id: s(1),
                last_slave_id: s(4),
            },
            MessagesMergeDiff::Add { first_slave_id: s(5), last_slave_id: s(6) },
        ]
    );

    // No two adjacent sections share a label.
    let labels: Vec<std::mem::Discriminant<MessagesMergeDiff>> =
        sections.iter().map(std::mem::discriminant).collect();
    for pair in labels.windows(2) {
        assert_ne!(pair[0], pair[1]);
    }
}

#[tokio::test]
async fn analyze_chats_fills_in_combine_sections() {
    let msg = |i: i64| text_message(Some(i), 1000 + i, &format!("msg {i}"));
    let f = fixture(vec![msg(1)], vec![msg(1), msg(2)]);

    let mut analyzer =
        DatasetDiffAnalyzer::new(&f.master_dao, &f.master_ds, &f.slave_dao, &f.slave_ds)
            .await
            .expect("analyzer");
    let options = analyzer
        .analyze_chats(
            vec![
                ChatMergeRequest::Keep { master_chat: f.master_chat.clone() },
                ChatMergeRequest::Combine {
                    master_chat: f.master_chat.clone(),
                    slave_chat: f.slave_chat.clone(),
                },
            ],
            &AtomicBool::new(false),
        )
        .await
        .expect("analyze chats");

    assert!(matches!(options[0], ChatMergeOption::Keep { .. }));
    match &options[1] {
        ChatMergeOption::Combine { sections, .. } => {
            assert_eq!(sections.len(), 2);
            assert!(matches!(sections[0], MessagesMergeDiff::Match { .. }));
            assert!(matches!(sections[1], MessagesMergeDiff::Add { .. }));
        }
        other => panic!("unexpected option: {other:?}"),
    }
}
