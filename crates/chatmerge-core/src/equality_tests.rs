//! Unit tests for practical equality.

use std::fs;

use uuid::Uuid;

use super::*;
use crate::models::{
    ContentPhoto, MessageRegular, MessageSourceId, MessageTyped, RichTextElement, Timestamp,
    UserId, NO_INTERNAL_ID,
};

fn temp_root(tag: &str) -> DatasetRoot {
    let mut path = std::env::temp_dir();
    path.push(format!("chatmerge-eq-{tag}-{}", Uuid::new_v4()));
    fs::create_dir_all(&path).expect("create temp root");
    DatasetRoot(path)
}

fn write_file(root: &DatasetRoot, rel: &str, bytes: &[u8]) {
    let abs = root.to_absolute(rel);
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(abs, bytes).expect("write file");
}

fn photo_message(path: Option<&str>) -> Message {
    Message::new(
        NO_INTERNAL_ID,
        Some(MessageSourceId(7)),
        Timestamp(1000),
        UserId(1),
        vec![RichTextElement::Plain { text: "pic".to_owned() }],
        MessageTyped::Regular(MessageRegular {
            edit_timestamp: None,
            forward_from_name: None,
            reply_to_source_id: None,
            content: Some(Content::Photo(ContentPhoto {
                path: path.map(str::to_owned),
                width: 100,
                height: 100,
            })),
        }),
    )
}

fn text_message(text: &str) -> Message {
    Message::new(
        NO_INTERNAL_ID,
        Some(MessageSourceId(1)),
        Timestamp(1000),
        UserId(1),
        vec![RichTextElement::Plain { text: text.to_owned() }],
        MessageTyped::Regular(MessageRegular {
            edit_timestamp: None,
            forward_from_name: None,
            reply_to_source_id: None,
            content: None,
        }),
    )
}

#[test]
fn identical_text_messages_are_equal() {
    let master_root = temp_root("m");
    let slave_root = temp_root("s");
    let mut ctx = PracticalEqCtx::new(master_root.clone(), slave_root.clone());

    assert!(ctx.messages_equal(&text_message("hi"), &text_message("hi")).expect("cmp"));
    assert!(!ctx.messages_equal(&text_message("hi"), &text_message("yo")).expect("cmp"));
}

#[test]
fn internal_id_is_ignored() {
    let master_root = temp_root("m");
    let slave_root = temp_root("s");
    let mut ctx = PracticalEqCtx::new(master_root.clone(), slave_root.clone());

    let a = text_message("hi");
    let mut b = text_message("hi");
    b.internal_id = crate::models::MessageInternalId(999);
    assert!(ctx.messages_equal(&a, &b).expect("cmp"));
}

#[test]
fn forward_from_name_is_ignored() {
    let master_root = temp_root("m");
    let slave_root = temp_root("s");
    let mut ctx = PracticalEqCtx::new(master_root.clone(), slave_root.clone());

    let a = text_message("hi");
    let mut b = text_message("hi");
    match &mut b.typed {
        MessageTyped::Regular(r) => r.forward_from_name = Some("Someone".to_owned()),
        _ => unreachable!(),
    }
    assert!(ctx.messages_equal(&a, &b).expect("cmp"));
}

#[test]
fn files_equal_when_both_absent() {
    let master_root = temp_root("m");
    let slave_root = temp_root("s");
    let mut ctx = PracticalEqCtx::new(master_root.clone(), slave_root.clone());

    // Paths set on both sides but no file exists anywhere.
    let a = photo_message(Some("p.jpg"));
    let b = photo_message(Some("p.jpg"));
    assert!(ctx.messages_equal(&a, &b).expect("cmp"));

    // Unset path and missing file resolve to the same "nothing".
    let c = photo_message(None);
    assert!(ctx.files_equal(Some("p.jpg"), None).expect("cmp"));
    assert!(ctx.messages_equal(&a, &c).expect("cmp"));
}

#[test]
fn files_differ_when_present_only_on_one_side() {
    let master_root = temp_root("m");
    let slave_root = temp_root("s");
    write_file(&slave_root, "p.jpg", b"42 bytes of payload");
    let mut ctx = PracticalEqCtx::new(master_root.clone(), slave_root.clone());

    let a = photo_message(Some("p.jpg"));
    let b = photo_message(Some("p.jpg"));
    assert!(!ctx.messages_equal(&a, &b).expect("cmp"));
}

#[test]
fn files_equal_by_content_not_by_path() {
    let master_root = temp_root("m");
    let slave_root = temp_root("s");
    write_file(&master_root, "a/photo.jpg", b"same-bytes");
    write_file(&slave_root, "b/pic.jpg", b"same-bytes");
    let mut ctx = PracticalEqCtx::new(master_root.clone(), slave_root.clone());

    assert!(ctx.files_equal(Some("a/photo.jpg"), Some("b/pic.jpg")).expect("cmp"));
}

#[test]
fn files_differ_by_content() {
    let master_root = temp_root("m");
    let slave_root = temp_root("s");
    write_file(&master_root, "p.jpg", b"one");
    write_file(&slave_root, "p.jpg", b"two");
    let mut ctx = PracticalEqCtx::new(master_root.clone(), slave_root.clone());

    assert!(!ctx.files_equal(Some("p.jpg"), Some("p.jpg")).expect("cmp"));
}

#[test]
fn digests_are_cached_for_the_run() {
    let master_root = temp_root("m");
    let slave_root = temp_root("s");
    write_file(&master_root, "p.jpg", b"payload");
    write_file(&slave_root, "p.jpg", b"payload");
    let mut ctx = PracticalEqCtx::new(master_root.clone(), slave_root.clone());

    assert!(ctx.files_equal(Some("p.jpg"), Some("p.jpg")).expect("cmp"));

    // Mutating the file mid-run is not picked up: the digest is per-run state.
    write_file(&slave_root, "p.jpg", b"changed");
    assert!(ctx.files_equal(Some("p.jpg"), Some("p.jpg")).expect("cmp"));
}

#[test]
fn disregarding_content_ignores_content_differences() {
    let master_root = temp_root("m");
    let slave_root = temp_root("s");
    write_file(&slave_root, "p.jpg", b"new file");
    let mut ctx = PracticalEqCtx::new(master_root.clone(), slave_root.clone());

    let a = photo_message(Some("p.jpg"));
    let b = photo_message(Some("p.jpg"));
    assert!(!ctx.messages_equal(&a, &b).expect("cmp"));
    assert!(ctx.messages_equal_disregarding_content(&a, &b).expect("cmp"));
}

#[test]
fn group_edit_photo_compared_by_bytes() {
    let master_root = temp_root("m");
    let slave_root = temp_root("s");
    write_file(&master_root, "g.jpg", b"old");
    write_file(&slave_root, "g.jpg", b"new");
    let mut ctx = PracticalEqCtx::new(master_root.clone(), slave_root.clone());

    let photo = || ContentPhoto {
        path: Some("g.jpg".to_owned()),
        width: 10,
        height: 10,
    };
    let a = Message::new(
        NO_INTERNAL_ID,
        None,
        Timestamp(5),
        UserId(1),
        vec![],
        MessageTyped::Service(MessageService::GroupEditPhoto { photo: photo() }),
    );
    let b = Message::new(
        NO_INTERNAL_ID,
        None,
        Timestamp(5),
        UserId(1),
        vec![],
        MessageTyped::Service(MessageService::GroupEditPhoto { photo: photo() }),
    );
    assert!(!ctx.messages_equal(&a, &b).expect("cmp"));
    assert!(ctx.messages_equal_disregarding_content(&a, &b).expect("cmp"));
}
