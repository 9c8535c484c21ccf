//! Conversation registry semantics: handles, cascade rules, join, the
//! media cache, and the mixer surface. Remote-participant call flows
//! live in the integration tests.

use super::{expect_event, test_ua};
use crate::conversation::{events::ConversationEvent, AutoHoldMode};
use bytes::Bytes;
use std::time::Duration;

#[tokio::test]
async fn test_destroyed_conversation_is_not_found() {
    let (mut ua, _net) = test_ua("reg1").await;

    let conv = ua.manager.create_conversation(AutoHoldMode::Disabled);
    assert_eq!(
        ua.manager.conversation_members(conv).await,
        Some(vec![]),
        "fresh conversation is queryable and empty"
    );

    ua.manager.destroy_conversation(conv);
    expect_event(&mut ua, "ConversationDestroyed", |e| {
        matches!(e, ConversationEvent::ConversationDestroyed { conversation } if *conversation == conv)
    })
    .await;
    assert_eq!(ua.manager.conversation_members(conv).await, None);
}

#[tokio::test]
async fn test_conversation_cascade_destroys_memberless_participant() {
    let (mut ua, _net) = test_ua("reg2").await;

    let conv = ua.manager.create_conversation(AutoHoldMode::Disabled);
    let tone = ua.manager.create_media_participant(conv, "tone:ringback");
    assert_eq!(
        ua.manager.participant_conversations(tone).await,
        Some(vec![conv])
    );

    ua.manager.destroy_conversation(conv);
    expect_event(&mut ua, "ParticipantDestroyed", |e| {
        matches!(e, ConversationEvent::ParticipantDestroyed { participant } if *participant == tone)
    })
    .await;
    assert_eq!(ua.manager.participant_conversations(tone).await, None);
}

#[tokio::test]
async fn test_join_preserves_membership_union() {
    let (mut ua, _net) = test_ua("reg3").await;

    let a = ua.manager.create_conversation(AutoHoldMode::Disabled);
    let b = ua.manager.create_conversation(AutoHoldMode::Disabled);
    let p1 = ua.manager.create_media_participant(a, "tone:holding");
    let p2 = ua.manager.create_media_participant(b, "tone:ringback");

    ua.manager.join_conversation(a, b);
    expect_event(&mut ua, "source destroyed", |e| {
        matches!(e, ConversationEvent::ConversationDestroyed { conversation } if *conversation == a)
    })
    .await;

    let members = ua
        .manager
        .conversation_members(b)
        .await
        .expect("b survives the join");
    assert!(members.contains(&p1) && members.contains(&p2));
    assert_eq!(ua.manager.conversation_members(a).await, None);

    // join never releases anyone
    assert_eq!(
        ua.manager.participant_conversations(p1).await,
        Some(vec![b])
    );
}

#[tokio::test]
async fn test_media_participant_with_duration_self_destructs() {
    let (mut ua, _net) = test_ua("reg4").await;

    let conv = ua.manager.create_conversation(AutoHoldMode::Disabled);
    let tone = ua
        .manager
        .create_media_participant(conv, "tone:1;duration=50");

    expect_event(&mut ua, "MediaResourceDone", |e| {
        matches!(e, ConversationEvent::MediaResourceDone { participant } if *participant == tone)
    })
    .await;
    expect_event(&mut ua, "ParticipantDestroyed", |e| {
        matches!(e, ConversationEvent::ParticipantDestroyed { participant } if *participant == tone)
    })
    .await;
    assert_eq!(ua.manager.participant_conversations(tone).await, None);
}

#[tokio::test]
async fn test_cache_backed_media_participant() {
    let (mut ua, _net) = test_ua("reg5").await;
    let conv = ua.manager.create_conversation(AutoHoldMode::Disabled);

    // a missing cache entry fails the participant immediately, and the
    // failure is distinguishable from playback running to completion
    let missing = ua.manager.create_media_participant(conv, "cache:absent");
    let event = expect_event(&mut ua, "MediaResourceFailed for missing entry", |e| {
        matches!(e, ConversationEvent::MediaResourceFailed { participant, .. } if *participant == missing)
    })
    .await;
    match event {
        ConversationEvent::MediaResourceFailed { error, .. } => {
            assert!(error.contains("absent"));
        }
        _ => unreachable!(),
    }
    // the handle was never registered
    assert_eq!(ua.manager.participant_conversations(missing).await, None);

    ua.manager.add_buffer_to_cache(
        "welcome",
        Bytes::from_static(b"\x00\x01pcm"),
        crate::conversation::media::CodecTag::RawPcm16,
    );
    let hit = ua.manager.create_media_participant(conv, "cache:welcome");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        ua.manager.participant_conversations(hit).await,
        Some(vec![conv])
    );
}

#[tokio::test]
async fn test_destroy_participant_is_idempotent() {
    let (mut ua, _net) = test_ua("reg6").await;
    let conv = ua.manager.create_conversation(AutoHoldMode::Disabled);
    let tone = ua.manager.create_media_participant(conv, "tone:busy");

    ua.manager.destroy_participant(tone);
    ua.manager.destroy_participant(tone);
    expect_event(&mut ua, "ParticipantDestroyed", |e| {
        matches!(e, ConversationEvent::ParticipantDestroyed { participant } if *participant == tone)
    })
    .await;

    // the second destroy is a no-op: no second destroyed event, and the
    // conversation is still alive and empty
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut extra = 0;
    while let Ok(event) = ua.events.try_recv() {
        if matches!(event, ConversationEvent::ParticipantDestroyed { participant } if participant == tone)
        {
            extra += 1;
        }
    }
    assert_eq!(extra, 0);
    assert_eq!(ua.manager.conversation_members(conv).await, Some(vec![]));
}

#[tokio::test]
async fn test_application_timer_round_trips_data() {
    let (mut ua, _net) = test_ua("reg7").await;
    ua.manager
        .start_application_timer(9, 1234, 5678, Duration::from_millis(30));
    let event = expect_event(&mut ua, "ApplicationTimer", |e| {
        matches!(e, ConversationEvent::ApplicationTimer { id: 9, .. })
    })
    .await;
    match event {
        ConversationEvent::ApplicationTimer { id, data1, data2 } => {
            assert_eq!((id, data1, data2), (9, 1234, 5678));
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_bridge_matrix_render_via_manager() {
    let (ua, _net) = test_ua("reg8").await;
    let conv = ua.manager.create_conversation(AutoHoldMode::Disabled);
    let p1 = ua.manager.create_media_participant(conv, "tone:holding");
    let p2 = ua.manager.create_media_participant(conv, "tone:ringback");
    ua.manager.modify_participant_contribution(conv, p1, 50, 100);

    let rendered = ua.manager.output_bridge_matrix().await;
    assert!(rendered.contains(&p1.to_string()));
    assert!(rendered.contains(&p2.to_string()));
}

#[tokio::test]
async fn test_local_participant_is_singleton() {
    let (ua, _net) = test_ua("reg9").await;
    let first = ua.manager.create_local_participant();
    let second = ua.manager.create_local_participant();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(ua.manager.participant_conversations(first).await.is_some());
    // the second handle was minted but never materialized
    assert!(ua.manager.participant_conversations(second).await.is_none());
}
