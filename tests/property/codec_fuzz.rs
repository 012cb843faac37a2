//! Property-based codec tests.
//!
//! Uses proptest to verify:
//! 1. Arbitrary text never panics the decoder (it returns `Err` gracefully).
//! 2. Any well-formed `new_message` frame decodes to the message it carries.

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use rentwire_proto::codec;
use rentwire_proto::event::ServerEvent;
use rentwire_proto::message::{ConversationId, Message, MessageId, MessageType, UserId};
use rentwire_proto::op::ClientOp;

fn arb_kind() -> impl Strategy<Value = MessageType> {
    prop_oneof![
        Just(MessageType::Text),
        Just(MessageType::Image),
        Just(MessageType::File),
        Just(MessageType::System),
    ]
}

prop_compose! {
    fn arb_message()(
        id in "[a-z0-9-]{1,36}",
        conversation in "[a-z0-9]{1,12}",
        sender in "[a-z0-9]{1,12}",
        content in "\\PC{1,256}",
        kind in arb_kind(),
        secs in 0i64..4_000_000_000,
        is_edited in any::<bool>(),
        is_read in any::<bool>(),
        reply in proptest::option::of("[a-z0-9]{1,8}"),
    ) -> Message {
        Message {
            id: MessageId::new(id),
            conversation_id: ConversationId::new(conversation),
            sender_id: UserId::new(sender),
            content,
            kind,
            created_at: Utc.timestamp_opt(secs, 0).single().unwrap_or_default(),
            is_edited,
            is_read,
            reply_to_id: reply.map(MessageId::new),
        }
    }
}

proptest! {
    #[test]
    fn decoding_arbitrary_text_never_panics(text in "\\PC{0,512}") {
        let _ = codec::decode::<ServerEvent>(&text);
        let _ = codec::decode::<ClientOp>(&text);
    }

    #[test]
    fn new_message_frames_carry_the_message(msg in arb_message()) {
        let text = codec::encode(&ServerEvent::NewMessage(msg.clone())).unwrap();
        let decoded: ServerEvent = codec::decode(&text).unwrap();
        prop_assert_eq!(decoded, ServerEvent::NewMessage(msg));
    }
}
