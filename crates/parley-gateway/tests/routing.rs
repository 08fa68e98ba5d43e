mod common;

use std::sync::atomic::Ordering;

use common::{Harness, direct, group, sent_message, user};
use parley_types::events::{AckResult, ClientCommand, ErrorCode, ServerEvent};
use parley_types::models::{MessageContent, MessageKind, MessageStatus};

#[tokio::test]
async fn direct_message_to_online_recipient_is_delivered() {
    let h = Harness::new();
    let (alice, bob) = (user("alice"), user("bob"));
    let a = h.connect(&alice).await;
    let mut b = h.connect(&bob).await;

    let ack = h.send(&a, direct(&bob, "Hi Bob")).await;
    let sent = sent_message(&ack);
    assert_eq!(sent.status, MessageStatus::Delivered);

    let delivered = b.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].id, sent.id);
    assert_eq!(delivered[0].status, MessageStatus::Delivered);
    assert_eq!(delivered[0].content.text.as_deref(), Some("Hi Bob"));

    let store = h.gateway.router().store();
    let stored = store.get_message(sent.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Delivered);

    let conversation = store
        .get_conversation(sent.conversation_id)
        .await
        .unwrap()
        .unwrap();
    let summary = conversation.last_message.unwrap();
    assert_eq!(summary.preview, "Hi Bob");
    assert_eq!(summary.sender_id, alice.user_id);
}

#[tokio::test]
async fn direct_message_to_offline_recipient_waits_for_history() {
    let h = Harness::new();
    let (alice, bob) = (user("alice"), user("bob"));
    let a = h.connect(&alice).await;

    let sent = sent_message(&h.send(&a, direct(&bob, "Are you there?")).await);
    assert_eq!(sent.status, MessageStatus::Sent);

    let mut b = h.connect(&bob).await;
    assert!(b.delivered().is_empty());

    let page = h
        .gateway
        .router()
        .history(&bob, sent.conversation_id, None, 50)
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].status, MessageStatus::Delivered);

    let stored = h
        .gateway
        .router()
        .store()
        .get_message(sent.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, MessageStatus::Delivered);
}

#[tokio::test]
async fn direct_message_to_self_is_rejected() {
    let h = Harness::new();
    let alice = user("alice");
    let a = h.connect(&alice).await;

    let ack = h.send(&a, direct(&alice, "me")).await;
    assert_eq!(ack.error_code(), Some(ErrorCode::InvalidIntent));
}

#[tokio::test]
async fn empty_content_is_rejected() {
    let h = Harness::new();
    let (alice, bob) = (user("alice"), user("bob"));
    let a = h.connect(&alice).await;

    let ack = h
        .send(
            &a,
            ClientCommand::SendDirect {
                recipient_id: bob.user_id,
                kind: MessageKind::Text,
                content: MessageContent::text("   "),
            },
        )
        .await;
    assert_eq!(ack.error_code(), Some(ErrorCode::InvalidIntent));
    assert!(h.gateway.router().conversations(&alice).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_messages_share_one_conversation() {
    let h = Harness::new();
    let (alice, bob) = (user("alice"), user("bob"));

    let mut tasks = Vec::new();
    for i in 0..8 {
        let router = h.gateway.router().clone();
        let (from, to) = if i % 2 == 0 {
            (alice.clone(), bob.clone())
        } else {
            (bob.clone(), alice.clone())
        };
        tasks.push(tokio::spawn(async move {
            router
                .send_direct(&from, to.user_id, MessageKind::Text, MessageContent::text("hey"))
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let conversations = h.gateway.router().conversations(&alice).await.unwrap();
    assert_eq!(conversations.len(), 1);

    let messages = h
        .gateway
        .router()
        .store()
        .list_messages(conversations[0].id, None, 50)
        .await
        .unwrap();
    assert_eq!(messages.len(), 8);
    let mut seqs: Vec<i64> = messages.iter().map(|m| m.seq).collect();
    seqs.sort();
    seqs.dedup();
    assert_eq!(seqs.len(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reads_advance_status_once() {
    let h = Harness::new();
    let (alice, bob) = (user("alice"), user("bob"));
    let mut a = h.connect(&alice).await;
    let _b = h.connect(&bob).await;
    a.drain();

    let sent = sent_message(&h.send(&a, direct(&bob, "read me")).await);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let router = h.gateway.router().clone();
        let reader = bob.clone();
        let id = sent.id;
        tasks.push(tokio::spawn(async move { router.mark_read(&reader, id).await }));
    }
    let mut newly = 0;
    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.status, MessageStatus::Read);
        if outcome.newly_read {
            newly += 1;
        }
    }
    assert_eq!(newly, 1);

    let store = h.gateway.router().store();
    let stored = store.get_message(sent.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Read);
    assert_eq!(stored.read_by.len(), 1);

    // A late delivery update cannot move it backwards
    assert!(!store.update_message_status(sent.id, MessageStatus::Delivered).await.unwrap());
    let stored = store.get_message(sent.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Read);

    let receipts: Vec<_> = a
        .drain()
        .into_iter()
        .filter(|e| matches!(e, ServerEvent::MessageRead { reader_id, .. } if *reader_id == bob.user_id))
        .collect();
    assert_eq!(receipts.len(), 1);
}

#[tokio::test]
async fn sender_reading_own_message_does_not_advance_status() {
    let h = Harness::new();
    let (alice, bob) = (user("alice"), user("bob"));
    let a = h.connect(&alice).await;

    let sent = sent_message(&h.send(&a, direct(&bob, "note")).await);
    let ack = h
        .send(&a, ClientCommand::MarkRead { message_id: sent.id })
        .await;

    match ack.result() {
        Some(AckResult::Read { status, newly_read, .. }) => {
            assert_eq!(*status, MessageStatus::Sent);
            assert!(*newly_read);
        }
        other => panic!("unexpected ack {:?}", other),
    }
}

#[tokio::test]
async fn outsider_cannot_mark_read() {
    let h = Harness::new();
    let (alice, bob, eve) = (user("alice"), user("bob"), user("eve"));
    let a = h.connect(&alice).await;
    let e = h.connect(&eve).await;

    let sent = sent_message(&h.send(&a, direct(&bob, "private")).await);
    let ack = h
        .send(&e, ClientCommand::MarkRead { message_id: sent.id })
        .await;
    assert_eq!(ack.error_code(), Some(ErrorCode::Denied));
}

#[tokio::test]
async fn group_broadcast_reaches_every_member_including_sender() {
    let h = Harness::new();
    let (alice, bob, carol) = (user("alice"), user("bob"), user("carol"));
    let conversation = h.create_group(&alice, &[&bob, &carol]).await;

    let mut clients = vec![
        h.connect(&alice).await,
        h.connect(&bob).await,
        h.connect(&carol).await,
    ];
    for client in &clients {
        let ack = h
            .send(client, ClientCommand::JoinRoom { conversation_id: conversation.id })
            .await;
        assert!(ack.is_ok(), "{:?}", ack);
    }
    for client in clients.iter_mut() {
        client.drain();
    }

    let sent = sent_message(&h.send(&clients[1], group(conversation.id, "hello")).await);
    assert_eq!(sent.status, MessageStatus::Sent);

    for client in clients.iter_mut() {
        let delivered = client.delivered();
        assert_eq!(delivered.len(), 1, "{} missed the message", client.identity.username);
        assert_eq!(delivered[0].id, sent.id);
    }
}

#[tokio::test]
async fn group_send_without_joining_is_rejected_and_not_persisted() {
    let h = Harness::new();
    let (alice, bob) = (user("alice"), user("bob"));
    let conversation = h.create_group(&alice, &[&bob]).await;
    let b = h.connect(&bob).await;

    let ack = h.send(&b, group(conversation.id, "sneaky")).await;
    assert_eq!(ack.error_code(), Some(ErrorCode::NotAMember));

    let messages = h
        .gateway
        .router()
        .store()
        .list_messages(conversation.id, None, 50)
        .await
        .unwrap();
    assert!(messages.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn group_delivery_follows_commit_order() {
    let h = Harness::new();
    let (alice, bob, carol) = (user("alice"), user("bob"), user("carol"));
    let conversation = h.create_group(&alice, &[&bob, &carol]).await;

    let a = h.connect(&alice).await;
    let mut b = h.connect(&bob).await;
    let c = h.connect(&carol).await;
    for client in [&a, &b, &c] {
        h.send(client, ClientCommand::JoinRoom { conversation_id: conversation.id })
            .await;
    }
    b.drain();

    let mut tasks = Vec::new();
    for (client, identity) in [(a.id(), alice.clone()), (c.id(), carol.clone())] {
        let router = h.gateway.router().clone();
        let conversation_id = conversation.id;
        tasks.push(tokio::spawn(async move {
            for i in 0..10 {
                router
                    .send_group(
                        client,
                        &identity,
                        conversation_id,
                        MessageKind::Text,
                        MessageContent::text(format!("{} #{}", identity.username, i)),
                    )
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let seqs: Vec<i64> = b.delivered().iter().map(|m| m.seq).collect();
    assert_eq!(seqs.len(), 20);
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "out of order: {:?}", seqs);
}

#[tokio::test]
async fn group_read_keeps_status_and_notifies_sender() {
    let h = Harness::new();
    let (alice, bob) = (user("alice"), user("bob"));
    let conversation = h.create_group(&alice, &[&bob]).await;
    let mut a = h.connect(&alice).await;
    let b = h.connect(&bob).await;
    h.send(&a, ClientCommand::JoinRoom { conversation_id: conversation.id })
        .await;

    let sent = sent_message(&h.send(&a, group(conversation.id, "minutes")).await);
    a.drain();

    let outcome = h.gateway.router().mark_read(&bob, sent.id).await.unwrap();
    assert!(outcome.newly_read);
    assert_eq!(outcome.status, MessageStatus::Sent);

    let stored = h
        .gateway
        .router()
        .store()
        .get_message(sent.id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.has_reader(bob.user_id));
    assert_eq!(stored.status, MessageStatus::Sent);

    assert!(a.drain().iter().any(|e| matches!(
        e,
        ServerEvent::MessageRead { message_id, .. } if *message_id == sent.id
    )));
    drop(b);
}

#[tokio::test]
async fn disconnect_leaves_rooms_and_tells_remaining_members() {
    let h = Harness::new();
    let (alice, bob, carol) = (user("alice"), user("bob"), user("carol"));
    let conversation = h.create_group(&alice, &[&bob, &carol]).await;

    let mut a = h.connect(&alice).await;
    let mut b = h.connect(&bob).await;
    let c = h.connect(&carol).await;
    for client in [&a, &b, &c] {
        h.send(client, ClientCommand::JoinRoom { conversation_id: conversation.id })
            .await;
    }
    a.drain();
    b.drain();

    h.gateway.on_disconnect(c.id()).await;

    let members = h.gateway.rooms().members_of(conversation.id).await;
    assert_eq!(members.len(), 2);
    assert!(!members.contains(&c.id()));
    assert!(h.gateway.rooms().rooms_of(c.id()).await.is_empty());

    for client in [&mut a, &mut b] {
        let events = client.drain();
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::PresenceChanged { user_id, online: false, .. } if *user_id == carol.user_id
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::RoomMembershipChanged { user_id, joined: false, .. } if *user_id == carol.user_id
        )));
    }

    let sent = sent_message(&h.send(&a, group(conversation.id, "still here")).await);
    assert_eq!(b.delivered()[0].id, sent.id);
}

#[tokio::test]
async fn join_requires_group_participation() {
    let h = Harness::new();
    let (alice, bob, eve) = (user("alice"), user("bob"), user("eve"));
    let conversation = h.create_group(&alice, &[&bob]).await;
    let a = h.connect(&alice).await;
    let e = h.connect(&eve).await;

    let ack = h
        .send(&e, ClientCommand::JoinRoom { conversation_id: conversation.id })
        .await;
    assert_eq!(ack.error_code(), Some(ErrorCode::Denied));

    let dm = sent_message(&h.send(&a, direct(&bob, "hi")).await);
    let ack = h
        .send(&a, ClientCommand::JoinRoom { conversation_id: dm.conversation_id })
        .await;
    assert_eq!(ack.error_code(), Some(ErrorCode::Denied));

    let ack = h
        .send(&a, ClientCommand::JoinRoom { conversation_id: uuid::Uuid::new_v4() })
        .await;
    assert_eq!(ack.error_code(), Some(ErrorCode::NotFound));
}

#[tokio::test]
async fn leave_room_is_idempotent() {
    let h = Harness::new();
    let (alice, bob) = (user("alice"), user("bob"));
    let conversation = h.create_group(&alice, &[&bob]).await;
    let mut a = h.connect(&alice).await;
    h.send(&a, ClientCommand::JoinRoom { conversation_id: conversation.id })
        .await;
    a.drain();

    let leave = ClientCommand::LeaveRoom { conversation_id: conversation.id };
    assert!(h.send(&a, leave.clone()).await.is_ok());
    assert!(h.send(&a, leave).await.is_ok());

    let notices = a
        .drain()
        .into_iter()
        .filter(|e| matches!(e, ServerEvent::RoomMembershipChanged { joined: false, .. }))
        .count();
    assert_eq!(notices, 1);
    assert!(!h.gateway.rooms().is_member(a.id(), conversation.id).await);
}

#[tokio::test]
async fn typing_never_echoes_to_originator() {
    let h = Harness::new();
    let (alice, bob) = (user("alice"), user("bob"));
    let conversation = h.create_group(&alice, &[&bob]).await;
    let mut a = h.connect(&alice).await;
    let mut b = h.connect(&bob).await;
    for client in [&a, &b] {
        h.send(client, ClientCommand::JoinRoom { conversation_id: conversation.id })
            .await;
    }
    a.drain();
    b.drain();

    let ack = h
        .send(&a, ClientCommand::TypingStart { conversation_id: conversation.id })
        .await;
    assert!(ack.is_ok());
    assert!(a.drain().is_empty());
    assert!(matches!(
        b.drain().as_slice(),
        [ServerEvent::Typing { is_typing: true, .. }]
    ));

    // Direct conversations go to the counterpart only
    let dm = sent_message(&h.send(&a, direct(&bob, "psst")).await);
    b.drain();
    let ack = h
        .send(&b, ClientCommand::TypingStop { conversation_id: dm.conversation_id })
        .await;
    assert!(ack.is_ok());
    assert!(b.drain().is_empty());
    assert!(matches!(
        a.drain().as_slice(),
        [ServerEvent::Typing { is_typing: false, user_id, .. }] if *user_id == bob.user_id
    ));
}

#[tokio::test]
async fn typing_in_unjoined_group_is_rejected() {
    let h = Harness::new();
    let (alice, bob) = (user("alice"), user("bob"));
    let conversation = h.create_group(&alice, &[&bob]).await;
    let b = h.connect(&bob).await;

    let ack = h
        .send(&b, ClientCommand::TypingStart { conversation_id: conversation.id })
        .await;
    assert_eq!(ack.error_code(), Some(ErrorCode::NotAMember));
}

#[tokio::test]
async fn removing_a_member_revokes_their_room() {
    let h = Harness::new();
    let (alice, bob) = (user("alice"), user("bob"));
    let carol = user("carol");
    let conversation = h.create_group(&alice, &[&bob, &carol]).await;
    let mut a = h.connect(&alice).await;
    let mut b = h.connect(&bob).await;
    for client in [&a, &b] {
        h.send(client, ClientCommand::JoinRoom { conversation_id: conversation.id })
            .await;
    }
    a.drain();
    b.drain();

    // Only the owner may remove someone else
    let denied = h
        .gateway
        .router()
        .remove_member(&bob, conversation.id, carol.user_id)
        .await;
    assert!(denied.is_err());

    let removed = h
        .gateway
        .router()
        .remove_member(&alice, conversation.id, bob.user_id)
        .await
        .unwrap();
    assert!(removed);

    assert!(b.drain().iter().any(|e| matches!(
        e,
        ServerEvent::RoomMembershipChanged { user_id, joined: false, .. } if *user_id == bob.user_id
    )));
    assert!(a.drain().iter().any(|e| matches!(
        e,
        ServerEvent::RoomMembershipChanged { user_id, joined: false, .. } if *user_id == bob.user_id
    )));

    let ack = h.send(&b, group(conversation.id, "let me back")).await;
    assert_eq!(ack.error_code(), Some(ErrorCode::NotAMember));
    let ack = h
        .send(&b, ClientCommand::JoinRoom { conversation_id: conversation.id })
        .await;
    assert_eq!(ack.error_code(), Some(ErrorCode::Denied));
}

#[tokio::test]
async fn summary_failure_does_not_fail_the_send() {
    let (h, faulty) = Harness::with_faulty_store();
    let (alice, bob) = (user("alice"), user("bob"));
    let a = h.connect(&alice).await;
    let mut b = h.connect(&bob).await;

    faulty.fail_summary.store(true, Ordering::SeqCst);
    let ack = h.send(&a, direct(&bob, "still works")).await;
    let sent = sent_message(&ack);

    assert_eq!(sent.status, MessageStatus::Delivered);
    assert_eq!(b.delivered().len(), 1);
    let conversation = h
        .store
        .database()
        .get_conversation(sent.conversation_id)
        .unwrap()
        .unwrap();
    assert!(conversation.last_message.is_none());
}

#[tokio::test]
async fn persist_failure_fails_the_send_and_pushes_nothing() {
    let (h, faulty) = Harness::with_faulty_store();
    let (alice, bob) = (user("alice"), user("bob"));
    let a = h.connect(&alice).await;
    let mut b = h.connect(&bob).await;

    faulty.fail_append.store(true, Ordering::SeqCst);
    let ack = h.send(&a, direct(&bob, "lost")).await;

    assert_eq!(ack.error_code(), Some(ErrorCode::StoreFailure));
    assert!(b.delivered().is_empty());
}

#[tokio::test]
async fn push_to_a_closed_queue_leaves_the_message_sent() {
    let h = Harness::new();
    let (alice, bob) = (user("alice"), user("bob"));
    let a = h.connect(&alice).await;
    let b = h.connect(&bob).await;

    // Bob's queue closes before his transport reports the disconnect
    drop(b);
    assert!(h.gateway.presence().lookup(bob.user_id).await.is_some());

    let ack = h.send(&a, direct(&bob, "into the void")).await;
    assert!(ack.is_ok(), "send must succeed for the sender: {:?}", ack);
    let sent = sent_message(&ack);
    assert_eq!(sent.status, MessageStatus::Sent);

    let stored = h.store.database().get_message(sent.id).unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Sent);
}

#[tokio::test]
async fn status_write_failure_still_pushes_but_acks_sent() {
    let (h, faulty) = Harness::with_faulty_store();
    let (alice, bob) = (user("alice"), user("bob"));
    let a = h.connect(&alice).await;
    let mut b = h.connect(&bob).await;

    faulty.fail_status.store(true, Ordering::SeqCst);
    let ack = h.send(&a, direct(&bob, "half done")).await;
    let sent = sent_message(&ack);

    assert_eq!(sent.status, MessageStatus::Sent);
    let delivered = b.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].id, sent.id);

    let stored = h.store.database().get_message(sent.id).unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Sent);
}

#[tokio::test]
async fn typing_to_a_closed_peer_still_acks() {
    let h = Harness::new();
    let (alice, bob) = (user("alice"), user("bob"));
    let a = h.connect(&alice).await;
    let b = h.connect(&bob).await;

    let sent = sent_message(&h.send(&a, direct(&bob, "hey")).await);
    drop(b);

    let ack = h
        .send(&a, ClientCommand::TypingStart { conversation_id: sent.conversation_id })
        .await;
    assert!(matches!(
        ack.result(),
        Some(AckResult::Typing { is_typing: true, .. })
    ));
}
