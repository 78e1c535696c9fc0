//! Proptest generators for property-based testing.

use proptest::prelude::*;

use chatstore_core::{DialogId, MessageId, MessageRecord, MessageSearchFilter};

use crate::fixtures::dated_message;

/// A valid, non-secret dialog id.
pub fn dialog_id() -> impl Strategy<Value = DialogId> {
    prop_oneof![1i64..1_000_000, -1_000_000i64..-1].prop_map(DialogId::new)
}

/// A valid message id.
pub fn message_id() -> impl Strategy<Value = MessageId> {
    (1i64..1 << 40).prop_map(MessageId::new)
}

/// A filter other than `Empty`.
pub fn search_filter() -> impl Strategy<Value = MessageSearchFilter> {
    prop::sample::select(MessageSearchFilter::ALL[1..].to_vec())
}

/// A lowercase word the full-text tokenizer keeps whole.
pub fn search_word() -> impl Strategy<Value = String> {
    "[a-z]{3,10}".prop_map(String::from)
}

/// Payload bytes of up to `max_len`.
pub fn payload(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// Parameters for one dated, optionally searchable message.
#[derive(Debug, Clone)]
pub struct MessageParams {
    pub message_id: i64,
    pub date: i32,
    pub filter: Option<MessageSearchFilter>,
    pub words: Vec<String>,
}

impl Arbitrary for MessageParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            1i64..10_000,
            0i32..1_000,
            prop::option::of(search_filter()),
            prop::collection::vec(search_word(), 0..4),
        )
            .prop_map(|(message_id, date, filter, words)| MessageParams {
                message_id,
                date,
                filter,
                words,
            })
            .boxed()
    }
}

/// Build the record `params` describes. Searchable messages use the message
/// id as their search id.
pub fn message_from_params(dialog_id: DialogId, params: &MessageParams) -> MessageRecord {
    let mut record = dated_message(dialog_id, params.message_id, params.date);
    if let Some(filter) = params.filter {
        record = record.with_filter(filter);
    }
    if !params.words.is_empty() {
        record = record.with_search_text(params.message_id, params.words.join(" "));
    }
    record
}

/// One operation against a key-value store.
#[derive(Debug, Clone)]
pub enum KvOp {
    Set(String, Vec<u8>),
    Erase(String),
    EraseByPrefix(String),
}

/// Operations over a small key space so sets, erases and prefixes collide.
pub fn kv_op() -> impl Strategy<Value = KvOp> {
    let key = "(ab|ac|b)[0-3]";
    prop_oneof![
        4 => (key, payload(16)).prop_map(|(key, value)| KvOp::Set(key, value)),
        2 => key.prop_map(KvOp::Erase),
        1 => "(a|ab|b)".prop_map(KvOp::EraseByPrefix),
    ]
}
