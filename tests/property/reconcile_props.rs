#![allow(clippy::unwrap_used, clippy::missing_panics_doc)]

//! Property-based reconciliation tests.
//!
//! Uses proptest to verify, for arbitrary arrival orders with duplicates:
//! 1. Every conversation list is sorted by `created_at` with unique ids.
//! 2. Delivering the same traffic again changes nothing.
//! 3. History pages and live delivery converge on the same list.

use std::collections::HashSet;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use rentwire::bus::EventBus;
use rentwire::reconcile::MessageReconciler;
use rentwire_proto::message::{ConversationId, Message, MessageId, MessageType, UserId};

fn conversation() -> ConversationId {
    ConversationId::new("listing-1")
}

prop_compose! {
    /// Messages drawn from a small id and timestamp space so duplicates and
    /// timestamp ties are common.
    fn arb_message()(
        id in 0u8..24,
        secs in 0i64..40,
        sender in prop_oneof![Just("renter"), Just("owner")],
    ) -> Message {
        Message {
            id: MessageId::new(format!("m-{id}")),
            conversation_id: conversation(),
            sender_id: UserId::new(sender),
            content: format!("body {id}"),
            kind: MessageType::Text,
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            is_edited: false,
            is_read: false,
            reply_to_id: None,
        }
    }
}

fn ids(messages: &[Message]) -> Vec<MessageId> {
    messages.iter().map(|m| m.id.clone()).collect()
}

proptest! {
    #[test]
    fn list_is_ordered_and_unique(traffic in proptest::collection::vec(arb_message(), 0..64)) {
        let bus = EventBus::new(16);
        let reconciler = MessageReconciler::new();
        for message in traffic.clone() {
            reconciler.receive(message, &bus);
        }

        let list = reconciler.messages(&conversation());
        prop_assert!(list.windows(2).all(|w| w[0].created_at <= w[1].created_at));

        let distinct: HashSet<MessageId> = traffic.iter().map(|m| m.id.clone()).collect();
        let listed: HashSet<MessageId> = ids(&list).into_iter().collect();
        prop_assert_eq!(list.len(), listed.len());
        prop_assert_eq!(listed, distinct);
    }

    #[test]
    fn redelivery_is_a_no_op(traffic in proptest::collection::vec(arb_message(), 0..64)) {
        let bus = EventBus::new(16);
        let reconciler = MessageReconciler::new();
        for message in traffic.clone() {
            reconciler.receive(message, &bus);
        }
        let before = reconciler.messages(&conversation());

        for message in traffic {
            prop_assert!(!reconciler.receive(message, &bus));
        }
        prop_assert_eq!(reconciler.messages(&conversation()), before);
    }

    #[test]
    fn first_copy_of_an_id_wins(traffic in proptest::collection::vec(arb_message(), 1..64)) {
        let bus = EventBus::new(16);
        let reconciler = MessageReconciler::new();
        for message in traffic.clone() {
            reconciler.receive(message, &bus);
        }

        let mut seen = HashSet::new();
        for first in traffic.iter().filter(|m| seen.insert(m.id.clone())) {
            let stored = reconciler.get(&conversation(), &first.id).unwrap();
            prop_assert_eq!(stored.created_at, first.created_at);
            prop_assert_eq!(&stored.sender_id, &first.sender_id);
        }
    }

    #[test]
    fn pages_and_live_traffic_converge(
        traffic in proptest::collection::vec(arb_message(), 0..64),
        split in 0usize..64,
    ) {
        let bus = EventBus::new(16);
        let live = MessageReconciler::new();
        for message in traffic.clone() {
            live.receive(message, &bus);
        }

        // Same traffic, but the tail arrives first as a history page.
        let split = split.min(traffic.len());
        let (head, tail) = traffic.split_at(split);
        let paged = MessageReconciler::new();
        paged.merge_page(&conversation(), tail.to_vec(), &bus);
        for message in head.iter().cloned() {
            paged.receive(message, &bus);
        }

        let live_ids: HashSet<MessageId> = ids(&live.messages(&conversation())).into_iter().collect();
        let paged_list = paged.messages(&conversation());
        let paged_ids: HashSet<MessageId> = ids(&paged_list).into_iter().collect();
        prop_assert_eq!(live_ids, paged_ids);
        prop_assert!(paged_list.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }
}
