//! Synthetic messages written by the generator.

use std::fmt;

/// A single stream message carrying one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    field: String,
    value: String,
}

impl Message {
    /// Build the message sent by worker `thread_index` at position `sequence`
    /// of its loop. The value reads `<thread_index>-message-<sequence>`.
    #[must_use]
    pub fn labeled(field: &str, thread_index: u16, sequence: u64) -> Self {
        Self {
            field: field.to_string(),
            value: label(thread_index, sequence),
        }
    }

    /// The field name.
    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    /// The field value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.field, self.value)
    }
}

/// The label for message `sequence` of worker `thread_index`.
#[must_use]
pub fn label(thread_index: u16, sequence: u64) -> String {
    format!("{thread_index}-message-{sequence}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn first_message_of_first_worker() {
        let msg = Message::labeled("message", 0, 0);
        assert_eq!(msg.field(), "message");
        assert_eq!(msg.value(), "0-message-0");
        assert_eq!(msg.to_string(), "message=0-message-0");
    }

    proptest! {
        #[test]
        fn label_embeds_index_and_sequence(thread_index: u16, sequence: u64) {
            let value = label(thread_index, sequence);
            let (idx, seq) = value
                .split_once("-message-")
                .expect("label must contain the separator");
            prop_assert_eq!(idx.parse::<u16>().expect("index"), thread_index);
            prop_assert_eq!(seq.parse::<u64>().expect("sequence"), sequence);
        }
    }
}
