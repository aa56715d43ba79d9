// src/domain/message.rs

//! Request types exchanged between callers and providers.

use std::fmt;
use std::sync::Arc;

use crate::{PubSubError, Result};

/// A topic/queue identifier.
///
/// A `GroupName` is handed verbatim to the broker's native addressing: a
/// Kafka topic, an AMQP queue, a Redis channel. It is treated as an opaque
/// routing key and never parsed or rewritten by this crate; the only check
/// applied is that it is not empty.
///
/// Group names are immutable, cheap to clone, and safe to share across
/// threads.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupName(Arc<str>);

impl GroupName {
    /// Borrow the group name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(PubSubError::EmptyGroupName);
        }
        Ok(())
    }
}

impl<T> From<T> for GroupName
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        GroupName(value.into())
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single message to publish.
///
/// Created per [`send`](crate::Provider::send) call and consumed by it.
///
/// ```
/// # use mom_pubsub::MessageRequest;
/// let request = MessageRequest::new("orders", "hello".to_string());
/// assert_eq!(request.group_name.as_str(), "orders");
/// ```
#[derive(Clone, Debug)]
pub struct MessageRequest<T> {
    /// Channel the message is published to.
    pub group_name: GroupName,

    /// The message body. Text is sent verbatim, anything else goes through
    /// the provider's serializer.
    pub message: T,
}

impl<T> MessageRequest<T> {
    pub fn new(group_name: impl Into<GroupName>, message: T) -> Self {
        Self {
            group_name: group_name.into(),
            message,
        }
    }
}

/// Identifies the channel a subscription consumes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscribeRequest {
    pub group_name: GroupName,
}

impl SubscribeRequest {
    pub fn new(group_name: impl Into<GroupName>) -> Self {
        Self {
            group_name: group_name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn empty_group_name_is_rejected() {
        let group = GroupName::from("");
        assert!(matches!(group.validate(), Err(PubSubError::EmptyGroupName)));
    }

    #[test]
    fn group_name_is_passed_through_untouched() {
        // ---
        let group = GroupName::from(" Orders/EU.*#");
        assert!(group.validate().is_ok());
        assert_eq!(group.as_str(), " Orders/EU.*#");
        assert_eq!(group.to_string(), " Orders/EU.*#");
    }
}
