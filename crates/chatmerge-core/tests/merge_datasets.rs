//! End-to-end merge tests against SQLite DAOs on both sides, with real
//! media files.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use uuid::Uuid;

use chatmerge_core::dao::{ChatHistoryDao, MutableChatHistoryDao};
use chatmerge_core::diff::{DatasetDiffAnalyzer, MessagesMergeDiff};
use chatmerge_core::merge::{merge_datasets, ChatMergeOption, ChatMergeRequest};
use chatmerge_core::models::{
    Chat, ChatId, ChatType, Content, ContentPhoto, Dataset, DatasetRoot, Message, MessageRegular,
    MessageSourceId, MessageTyped, RichTextElement, Timestamp, User, UserId, NO_INTERNAL_ID,
};
use chatmerge_core::SqliteDao;

fn text_message(src_id: i64, ts: i64, text: &str) -> Message {
    Message::new(
        NO_INTERNAL_ID,
        Some(MessageSourceId(src_id)),
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
            content: Some(Content::Photo(ContentPhoto {
                path: Some(path.to_owned()),
                width: 100,
                height: 100,
            })),
        }),
    )
}

struct Side {
    dao: SqliteDao,
    ds: Dataset,
    chat: Chat,
    root: DatasetRoot,
}

async fn side(tag: &str, msgs: Vec<Message>) -> Side {
    let mut db_path = std::env::temp_dir();
    db_path.push(format!("chatmerge-e2e-{tag}-{}", Uuid::new_v4()));
    db_path.push("history.db");

    let mut dao = SqliteDao::open(&db_path).await.expect("open db");
    let ds = dao
        .insert_dataset(Dataset {
            uuid: Uuid::new_v4(),
            alias: tag.to_owned(),
            source_type: "telegram".to_owned(),
        })
        .await
        .expect("insert dataset");

    for (id, first, is_myself) in [(1, "Me", true), (2, "John", false)] {
        dao.insert_user(
            User {
                ds_uuid: ds.uuid,
                id: UserId(id),
                first_name: Some(first.to_owned()),
                last_name: None,
                username: None,
                phone_number: None,
            },
            is_myself,
        )
        .await
        .expect("insert user");
    }

    let root = dao.dataset_root(&ds.uuid).await.expect("root");
    let chat = dao
        .insert_chat(
            Chat {
                ds_uuid: ds.uuid,
                id: ChatId(1),
                name: Some("Chat".to_owned()),
                tpe: ChatType::PrivateGroup,
                img_path: None,
                member_ids: vec![UserId(1), UserId(2)],
                msg_count: 0,
            },
            &root,
        )
        .await
        .expect("insert chat");
    dao.insert_messages(msgs, &chat, &root).await.expect("insert messages");

    Side { dao, ds, chat, root }
}

async fn target(tag: &str) -> (SqliteDao, PathBuf) {
    let mut db_path = std::env::temp_dir();
    db_path.push(format!("chatmerge-e2e-target-{tag}-{}", Uuid::new_v4()));
    db_path.push("merged.db");
    let dao = SqliteDao::open(&db_path).await.expect("open target");
    let data_dir = db_path.parent().expect("data dir").to_path_buf();
    (dao, data_dir)
}

async fn analyze_pair(master: &Side, slave: &Side) -> Vec<ChatMergeOption> {
    let mut analyzer =
        DatasetDiffAnalyzer::new(&master.dao, &master.ds, &slave.dao, &slave.ds)
            .await
            .expect("analyzer");
    analyzer
        .analyze_chats(
            vec![ChatMergeRequest::Combine {
                master_chat: master.chat.clone(),
                slave_chat: slave.chat.clone(),
            }],
            &AtomicBool::new(false),
        )
        .await
        .expect("analyze")
}

async fn merge_with_defaults(master: &Side, slave: &Side, target_dao: &mut SqliteDao) -> Dataset {
    let options = analyze_pair(master, slave).await;
    let decisions = options.into_iter().map(ChatMergeOption::into_default_decision).collect();
    merge_datasets(
        &master.dao,
        &master.ds,
        &slave.dao,
        &slave.ds,
        vec![],
        decisions,
        target_dao,
        &AtomicBool::new(false),
    )
    .await
    .expect("merge")
}

#[tokio::test]
async fn merge_consolidates_disjoint_histories() {
    let msg = |i: i64| text_message(i, 1000 + i, &format!("msg {i}"));
    let master = side("master", (1..=4).map(msg).collect()).await;
    let slave = side("slave", (3..=6).map(msg).collect()).await;
    let (mut target_dao, _) = target("disjoint").await;

    let new_ds = merge_with_defaults(&master, &slave, &mut target_dao).await;

    let chats = target_dao.chats(&new_ds.uuid).await.expect("chats");
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].chat.msg_count, 6);

    let msgs = target_dao.first_messages(&chats[0].chat, 100).await.expect("messages");
    let texts: Vec<&str> = msgs.iter().map(|msg| msg.searchable_string.as_str()).collect();
    assert_eq!(texts, vec!["msg 1", "msg 2", "msg 3", "msg 4", "msg 5", "msg 6"]);
}

#[tokio::test]
async fn new_media_wins_by_default_and_lands_in_the_target() {
    let master = side("master", vec![photo_message(7, 1000, "p.jpg")]).await;
    let slave = side("slave", vec![photo_message(7, 1000, "p.jpg")]).await;
    let payload = vec![1u8; 42];
    std::fs::write(slave.root.to_absolute("p.jpg"), &payload).expect("slave media");

    // The analyzer must flag this pair as a replacement opportunity.
    let options = analyze_pair(&master, &slave).await;
    match &options[0] {
        ChatMergeOption::Combine { sections, .. } => {
            assert!(matches!(sections.as_slice(), [MessagesMergeDiff::Replace { .. }]));
        }
        other => panic!("unexpected option: {other:?}"),
    }

    let (mut target_dao, _) = target("media").await;
    let new_ds = merge_with_defaults(&master, &slave, &mut target_dao).await;

    let target_root = target_dao.dataset_root(&new_ds.uuid).await.expect("root");
    assert_eq!(
        std::fs::read(target_root.to_absolute("p.jpg")).expect("copied media"),
        payload
    );
}

#[tokio::test]
async fn merged_chat_reanalyzed_against_itself_is_one_match() {
    let msg = |i: i64| text_message(i, 1000 + i, &format!("msg {i}"));
    let master = side("master", (1..=3).map(msg).collect()).await;
    let slave = side("slave", (2..=5).map(msg).collect()).await;
    let (mut target_dao, _) = target("fixpoint").await;

    let new_ds = merge_with_defaults(&master, &slave, &mut target_dao).await;
    let merged_chat = target_dao
        .chats(&new_ds.uuid)
        .await
        .expect("chats")
        .remove(0)
        .chat;

    let mut analyzer =
        DatasetDiffAnalyzer::new(&target_dao, &new_ds, &target_dao, &new_ds)
            .await
            .expect("analyzer");
    let sections = analyzer
        .analyze(&merged_chat, &merged_chat, "merged chat", &AtomicBool::new(false))
        .await
        .expect("re-analysis");

    assert_eq!(sections.len(), 1);
    assert!(matches!(sections[0], MessagesMergeDiff::Match { .. }));
}

#[tokio::test]
async fn repeated_merge_into_fresh_targets_is_identical() {
    let master = side("master", vec![photo_message(1, 1000, "p.jpg"), text_message(2, 1002, "b")])
        .await;
    let slave = side("slave", vec![photo_message(1, 1000, "p.jpg"), text_message(2, 1002, "b")])
        .await;
    std::fs::write(master.root.to_absolute("p.jpg"), b"media-bytes").expect("master media");
    std::fs::write(slave.root.to_absolute("p.jpg"), b"media-bytes").expect("slave media");

    let (mut target_one, _) = target("one").await;
    let (mut target_two, _) = target("two").await;
    let ds_one = merge_with_defaults(&master, &slave, &mut target_one).await;
    let ds_two = merge_with_defaults(&master, &slave, &mut target_two).await;

    let chat_one = target_one.chats(&ds_one.uuid).await.expect("chats").remove(0).chat;
    let chat_two = target_two.chats(&ds_two.uuid).await.expect("chats").remove(0).chat;
    assert_eq!(chat_one.msg_count, chat_two.msg_count);

    let root_one = target_one.dataset_root(&ds_one.uuid).await.expect("root");
    let root_two = target_two.dataset_root(&ds_two.uuid).await.expect("root");
    assert_eq!(
        std::fs::read(root_one.to_absolute("p.jpg")).expect("one"),
        std::fs::read(root_two.to_absolute("p.jpg")).expect("two"),
    );

    let msgs_one = target_one.first_messages(&chat_one, 100).await.expect("one");
    let msgs_two = target_two.first_messages(&chat_two, 100).await.expect("two");
    let strip = |msgs: Vec<Message>| -> Vec<Message> {
        msgs.into_iter()
            .map(|mut m| {
                m.internal_id = NO_INTERNAL_ID;
                m
            })
            .collect()
    };
    assert_eq!(strip(msgs_one), strip(msgs_two));
}

#[tokio::test]
async fn populated_target_gets_a_backup_file() {
    let master = side("master", vec![text_message(1, 1001, "a")]).await;
    let slave = side("slave", vec![text_message(1, 1001, "a")]).await;
    let (mut target_dao, data_dir) = target("backup").await;

    // First merge populates the target; no backup yet.
    merge_with_defaults(&master, &slave, &mut target_dao).await;
    assert!(!data_dir.join("backups").exists());

    // Second merge finds data and backs it up first.
    merge_with_defaults(&master, &slave, &mut target_dao).await;
    let backups: Vec<_> = std::fs::read_dir(data_dir.join("backups"))
        .expect("backups dir")
        .collect();
    assert_eq!(backups.len(), 1);
}
