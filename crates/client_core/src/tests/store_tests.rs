use super::*;
use chrono::TimeZone;

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().expect("timestamp")
}

fn store_for(self_id: i64) -> ChatStore {
    let mut store = ChatStore::default();
    store.set_self(UserId(self_id));
    store
}

fn direct_message(id: i64, sender: i64, text: &str, at: i64) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        sender_id: Some(UserId(sender)),
        recipient_id: None,
        group_id: None,
        text: Some(text.to_string()),
        image_b64: None,
        sent_at: ts(at),
    }
}

fn group_message(id: i64, sender: i64, group: i64, text: &str, at: i64) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        sender_id: Some(UserId(sender)),
        recipient_id: None,
        group_id: Some(GroupId(group)),
        text: Some(text.to_string()),
        image_b64: None,
        sent_at: ts(at),
    }
}

fn user(id: i64, name: &str, last_seen: Option<i64>) -> UserSummary {
    UserSummary {
        user_id: UserId(id),
        display_name: name.to_string(),
        avatar_url: None,
        last_seen: last_seen.map(ts),
        last_activity: None,
    }
}

fn group(id: i64, name: &str) -> GroupSummary {
    GroupSummary {
        group_id: GroupId(id),
        name: name.to_string(),
        avatar_url: None,
        member_ids: vec![UserId(1), UserId(2)],
        last_activity: None,
    }
}

#[test]
fn duplicate_message_event_appends_exactly_once() {
    let mut store = store_for(99);
    store.select_direct(UserId(5));

    let message = direct_message(1, 5, "hi", 10);
    let first = store.apply_event(
        PushEvent::NewMessage {
            message: message.clone(),
        },
        ts(10),
    );
    let second = store.apply_event(PushEvent::NewMessage { message }, ts(11));

    assert_eq!(first, Applied::MessageAppended(ConversationKey::Direct(UserId(5))));
    assert_eq!(second, Applied::Duplicate(MessageId(1)));
    assert_eq!(store.messages_for(ConversationKey::Direct(UserId(5))).len(), 1);
}

#[test]
fn unread_counter_is_monotonic_and_resets_on_activation() {
    let mut store = store_for(99);
    store.select_direct(UserId(1));

    for id in 1..=3 {
        store.apply_event(
            PushEvent::NewMessage {
                message: direct_message(id, 2, "ping", 10 + id),
            },
            ts(10 + id),
        );
    }

    let peer_key = ConversationKey::Direct(UserId(2));
    assert_eq!(store.unread_count(peer_key), 3);

    let selection = store.select_direct(UserId(2));
    assert!(selection.changed);
    assert_eq!(store.unread_count(peer_key), 0);
}

#[test]
fn message_for_inactive_peer_leaves_active_backlog_alone() {
    let mut store = store_for(99);
    store.select_direct(UserId(1));
    let ticket = store.begin_history_load(ConversationKey::Direct(UserId(1)));
    store.complete_history_load(ticket, vec![direct_message(1, 1, "hello", 5)]);

    let applied = store.apply_event(
        PushEvent::NewMessage {
            message: direct_message(2, 2, "hi", 20),
        },
        ts(20),
    );

    assert_eq!(applied, Applied::UnreadIncremented(ConversationKey::Direct(UserId(2))));
    assert_eq!(store.unread_count(ConversationKey::Direct(UserId(2))), 1);
    assert_eq!(store.messages_for(ConversationKey::Direct(UserId(1))).len(), 1);
    assert!(store.messages_for(ConversationKey::Direct(UserId(2))).is_empty());
}

#[test]
fn reselecting_the_active_conversation_is_a_noop() {
    let mut store = store_for(99);
    assert!(store.select_direct(UserId(5)).changed);
    let again = store.select_direct(UserId(5));
    assert!(!again.changed);
    assert_eq!(again.active, Some(ConversationKey::Direct(UserId(5))));
}

#[test]
fn selecting_a_group_displaces_the_direct_selection() {
    let mut store = store_for(99);
    store.select_direct(UserId(5));
    let selection = store.select_group(GroupId(9));

    assert!(selection.changed);
    assert_eq!(store.active_conversation(), Some(ConversationKey::Group(GroupId(9))));
    assert_eq!(
        store.active_conversation().and_then(|key| key.as_direct()),
        None
    );
}

#[test]
fn pending_send_is_cleared_by_the_push_echo_then_post_response_dedups() {
    let mut store = store_for(7);
    let key = ConversationKey::Group(GroupId(3));
    store.select_group(GroupId(3));
    store.begin_send(key, MessageDraft::text("hello"), ts(1));
    assert!(store.pending_for(key).is_some());

    // Push echo lands before the POST response is processed.
    let echo = group_message(41, 7, 3, "hello", 2);
    let applied = store.apply_event(
        PushEvent::NewMessage {
            message: echo.clone(),
        },
        ts(2),
    );
    assert_eq!(applied, Applied::MessageAppended(key));
    assert!(store.pending_for(key).is_none());

    // The POST response arrives later with the same confirmed message.
    let late = store.apply_event(PushEvent::NewMessage { message: echo }, ts(3));
    assert_eq!(late, Applied::Duplicate(MessageId(41)));
    assert_eq!(store.messages_for(key).len(), 1);
}

#[test]
fn second_send_replaces_the_pending_slot() {
    let mut store = store_for(7);
    let key = ConversationKey::Direct(UserId(2));
    store.begin_send(key, MessageDraft::text("first"), ts(1));
    store.begin_send(key, MessageDraft::text("second"), ts(2));

    let pending = store.pending_for(key).expect("slot");
    assert_eq!(pending.draft, MessageDraft::text("second"));
}

#[test]
fn fail_send_clears_the_slot_and_returns_the_draft() {
    let mut store = store_for(7);
    let key = ConversationKey::Direct(UserId(2));
    store.begin_send(key, MessageDraft::text("lost"), ts(1));

    let draft = store.fail_send(key);
    assert_eq!(draft, Some(MessageDraft::text("lost")));
    assert!(store.pending_for(key).is_none());
    assert!(store.fail_send(key).is_none());
}

#[test]
fn own_echo_for_background_conversation_confirms_without_unread() {
    let mut store = store_for(7);
    store.select_direct(UserId(3));
    store.begin_send(ConversationKey::Direct(UserId(3)), MessageDraft::text("bye"), ts(1));
    store.select_direct(UserId(4));

    let mut echo = direct_message(8, 7, "bye", 2);
    echo.recipient_id = Some(UserId(3));
    let applied = store.apply_event(PushEvent::NewMessage { message: echo }, ts(2));

    assert_eq!(applied, Applied::SendConfirmed(ConversationKey::Direct(UserId(3))));
    assert!(store.pending_for(ConversationKey::Direct(UserId(3))).is_none());
    assert_eq!(store.unread_count(ConversationKey::Direct(UserId(3))), 0);
}

#[test]
fn stale_history_response_is_discarded_after_newer_activation() {
    let mut store = store_for(99);
    store.select_direct(UserId(5));
    let first = store.begin_history_load(ConversationKey::Direct(UserId(5)));
    store.select_direct(UserId(6));
    let second = store.begin_history_load(ConversationKey::Direct(UserId(6)));

    let stale = store.complete_history_load(first, vec![direct_message(1, 5, "old", 5)]);
    assert_eq!(stale, HistoryOutcome::Stale);
    assert!(store.messages_for(ConversationKey::Direct(UserId(5))).is_empty());
    assert!(store.is_history_loading());

    let fresh = store.complete_history_load(second, vec![direct_message(2, 6, "new", 6)]);
    assert_eq!(fresh, HistoryOutcome::Loaded { count: 1 });
    assert!(!store.is_history_loading());
    assert_eq!(store.messages_for(ConversationKey::Direct(UserId(6))).len(), 1);
}

#[test]
fn failed_history_load_preserves_the_previous_backlog() {
    let mut store = store_for(99);
    store.select_direct(UserId(5));
    let ticket = store.begin_history_load(ConversationKey::Direct(UserId(5)));
    store.complete_history_load(ticket, vec![direct_message(1, 5, "kept", 5)]);

    store.clear_selection();
    store.select_direct(UserId(5));
    let retry = store.begin_history_load(ConversationKey::Direct(UserId(5)));
    assert!(store.is_history_loading());

    let outcome = store.abort_history_load(retry);
    assert_eq!(outcome, HistoryOutcome::Failed);
    assert!(!store.is_history_loading());
    assert_eq!(store.messages_for(ConversationKey::Direct(UserId(5))).len(), 1);
}

#[test]
fn arrival_order_is_preserved_across_history_and_push() {
    let mut store = store_for(99);
    store.select_direct(UserId(5));
    let ticket = store.begin_history_load(ConversationKey::Direct(UserId(5)));
    store.complete_history_load(ticket, vec![direct_message(1, 5, "a", 10)]);

    store.apply_event(
        PushEvent::NewMessage {
            message: direct_message(2, 5, "b", 11),
        },
        ts(11),
    );

    let backlog = store.messages_for(ConversationKey::Direct(UserId(5)));
    let ids: Vec<i64> = backlog.iter().map(|m| m.message_id.0).collect();
    assert_eq!(ids, vec![1, 2]);
}

#[test]
fn typing_signals_for_inactive_conversations_are_discarded() {
    let mut store = store_for(99);
    store.select_direct(UserId(2));

    let dropped = store.apply_event(
        PushEvent::GroupTyping {
            group_id: GroupId(9),
            sender_id: UserId(4),
        },
        ts(1),
    );
    assert_eq!(dropped, Applied::Dropped);

    let started = store.apply_event(PushEvent::UserTyping { sender_id: UserId(2) }, ts(1));
    assert_eq!(started, Applied::TypingStarted(ConversationKey::Direct(UserId(2))));
    assert_eq!(store.typing_actor(ts(2)), Some(UserId(2)));
}

#[test]
fn only_the_matching_actor_stops_a_group_typing_indicator() {
    let mut store = store_for(99);
    store.select_group(GroupId(1));
    store.apply_event(
        PushEvent::GroupTyping {
            group_id: GroupId(1),
            sender_id: UserId(4),
        },
        ts(1),
    );

    let mismatch = store.apply_event(
        PushEvent::GroupStopTyping {
            group_id: GroupId(1),
            sender_id: UserId(5),
        },
        ts(2),
    );
    assert_eq!(mismatch, Applied::Dropped);
    assert_eq!(store.typing_actor(ts(2)), Some(UserId(4)));

    let stopped = store.apply_event(
        PushEvent::GroupStopTyping {
            group_id: GroupId(1),
            sender_id: UserId(4),
        },
        ts(3),
    );
    assert_eq!(stopped, Applied::TypingStopped(ConversationKey::Group(GroupId(1))));
    assert_eq!(store.typing_actor(ts(3)), None);
}

#[test]
fn typing_indicator_expires_when_the_stop_event_is_lost() {
    let mut store = store_for(99);
    store.select_direct(UserId(2));
    store.apply_event(PushEvent::UserTyping { sender_id: UserId(2) }, ts(0));

    assert_eq!(store.typing_actor(ts(3)), Some(UserId(2)));
    assert_eq!(store.typing_actor(ts(10)), None);

    assert_eq!(store.expire_typing(ts(3)), None);
    assert_eq!(
        store.expire_typing(ts(10)),
        Some(ConversationKey::Direct(UserId(2)))
    );
    assert_eq!(store.typing_actor(ts(2)), None);
}

#[test]
fn changing_selection_drops_the_typing_indicator() {
    let mut store = store_for(99);
    store.select_direct(UserId(2));
    store.apply_event(PushEvent::UserTyping { sender_id: UserId(2) }, ts(0));

    store.select_group(GroupId(1));
    assert_eq!(store.typing_actor(ts(1)), None);
}

#[test]
fn message_event_without_any_identity_is_dropped() {
    let mut store = store_for(99);
    store.select_direct(UserId(1));

    let orphan = MessagePayload {
        message_id: MessageId(77),
        sender_id: None,
        recipient_id: None,
        group_id: None,
        text: Some("lost".to_string()),
        image_b64: None,
        sent_at: ts(1),
    };
    let applied = store.apply_event(PushEvent::NewMessage { message: orphan }, ts(1));

    assert_eq!(applied, Applied::Dropped);
    assert!(store.messages_for(ConversationKey::Direct(UserId(1))).is_empty());
    assert_eq!(store.total_unread(), 0);
}

#[test]
fn message_event_without_text_or_image_is_dropped() {
    let mut store = store_for(99);
    store.select_direct(UserId(5));

    let mut empty = direct_message(3, 5, "", 1);
    empty.text = None;
    let applied = store.apply_event(PushEvent::NewMessage { message: empty }, ts(1));

    assert_eq!(applied, Applied::Dropped);
    assert!(store.messages_for(ConversationKey::Direct(UserId(5))).is_empty());
}

#[test]
fn presence_toggles_and_records_last_seen() {
    let mut store = store_for(99);
    store.replace_users(vec![user(2, "blair", None)]);

    store.apply_event(
        PushEvent::PresenceChanged {
            user_id: UserId(2),
            online: true,
        },
        ts(1),
    );
    assert!(store.is_online(UserId(2)));

    store.apply_event(
        PushEvent::PresenceChanged {
            user_id: UserId(2),
            online: false,
        },
        ts(50),
    );
    assert!(!store.is_online(UserId(2)));
    assert_eq!(store.last_seen(UserId(2)), Some(ts(50)));
    assert_eq!(store.users()[0].last_seen, Some(ts(50)));
}

#[test]
fn user_last_seen_event_updates_the_directory_entry() {
    let mut store = store_for(99);
    store.replace_users(vec![user(3, "casey", Some(10))]);

    store.apply_event(
        PushEvent::UserLastSeen {
            user_id: UserId(3),
            last_seen: ts(90),
        },
        ts(91),
    );
    assert_eq!(store.users()[0].last_seen, Some(ts(90)));
    assert_eq!(store.last_seen(UserId(3)), Some(ts(90)));
}

#[test]
fn seeded_unread_counts_never_overwrite_the_active_conversation() {
    let mut store = store_for(99);
    store.select_direct(UserId(2));

    let mut counts = HashMap::new();
    counts.insert(ConversationKey::Direct(UserId(2)), 4);
    counts.insert(ConversationKey::Direct(UserId(3)), 2);
    counts.insert(ConversationKey::Group(GroupId(1)), 7);
    store.seed_unread_counts(counts);

    assert_eq!(store.unread_count(ConversationKey::Direct(UserId(2))), 0);
    assert_eq!(store.unread_count(ConversationKey::Direct(UserId(3))), 2);
    assert_eq!(store.unread_count(ConversationKey::Group(GroupId(1))), 7);
}

#[test]
fn sidebar_orders_online_users_first_then_by_recency() {
    let mut store = store_for(99);
    store.replace_users(vec![
        user(1, "alice", Some(10)),
        user(2, "blair", Some(5)),
        user(3, "casey", Some(60)),
        user(99, "self", None),
    ]);
    store.apply_event(
        PushEvent::PresenceChanged {
            user_id: UserId(2),
            online: true,
        },
        ts(1),
    );

    let rows = store.sidebar_users(SidebarFilter::default());
    let ids: Vec<i64> = rows.iter().map(|u| u.user_id.0).collect();
    assert_eq!(ids, vec![2, 3, 1]);
}

#[test]
fn sidebar_filters_by_name_and_online_flag() {
    let mut store = store_for(99);
    store.replace_users(vec![
        user(1, "Alice", None),
        user(2, "Blair", None),
        user(3, "Alan", None),
    ]);
    store.apply_event(
        PushEvent::PresenceChanged {
            user_id: UserId(1),
            online: true,
        },
        ts(1),
    );

    let by_name = store.sidebar_users(SidebarFilter {
        online_only: false,
        name_contains: Some("al"),
    });
    let names: Vec<&str> = by_name.iter().map(|u| u.display_name.as_str()).collect();
    assert_eq!(names, vec!["Alice", "Alan"]);

    let online_only = store.sidebar_users(SidebarFilter {
        online_only: true,
        name_contains: None,
    });
    assert_eq!(online_only.len(), 1);
    assert_eq!(online_only[0].user_id, UserId(1));
}

#[test]
fn groups_are_listed_by_name() {
    let mut store = store_for(99);
    store.replace_groups(vec![group(1, "zeta"), group(2, "alpha"), group(3, "mid")]);

    let names: Vec<&str> = store
        .sorted_groups()
        .iter()
        .map(|g| g.name.as_str())
        .collect();
    assert_eq!(names, vec!["alpha", "mid", "zeta"]);
}

#[test]
fn directory_events_upsert_users_and_groups() {
    let mut store = store_for(99);
    store.apply_event(
        PushEvent::UserJoined {
            user: user(4, "drew", None),
        },
        ts(1),
    );
    store.apply_event(
        PushEvent::GroupCreated {
            group: group(8, "team"),
        },
        ts(2),
    );
    assert_eq!(store.users().len(), 1);
    assert_eq!(store.groups().len(), 1);

    // Re-announcing replaces rather than duplicates.
    store.apply_event(
        PushEvent::UserJoined {
            user: user(4, "drew-renamed", None),
        },
        ts(3),
    );
    assert_eq!(store.users().len(), 1);
    assert_eq!(store.users()[0].display_name, "drew-renamed");
}

#[test]
fn incoming_messages_bump_conversation_recency() {
    let mut store = store_for(99);
    store.replace_groups(vec![group(3, "team")]);
    store.select_direct(UserId(1));

    store.apply_event(
        PushEvent::NewMessage {
            message: group_message(5, 2, 3, "news", 80),
        },
        ts(80),
    );

    assert_eq!(store.group(GroupId(3)).and_then(|g| g.last_activity), Some(ts(80)));
    assert_eq!(store.unread_count(ConversationKey::Group(GroupId(3))), 1);
}

#[test]
fn group_membership_event_requests_a_roster_refetch() {
    let mut store = store_for(99);
    let applied = store.apply_event(PushEvent::GroupMembersAdded { group_id: GroupId(6) }, ts(1));
    assert_eq!(applied, Applied::RosterRefetchNeeded(GroupId(6)));
}
