/// Content type of every message published by [`crate::QueueClient::send_message`].
pub const TEXT_PLAIN: &str = "text/plain";

/// A message body with its properties.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Content {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// The subset of the basic properties the client sets or reads.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
}

/// A message published by the client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishedMessage {
    pub message: Content,
}

impl PublishedMessage {
    /// Plain text message, the only kind of message the queue client sends.
    pub fn text(body: &str) -> Self {
        PublishedMessage {
            message: Content {
                body: body.as_bytes().to_vec(),
                properties: MessageProperties {
                    content_type: Some(TEXT_PLAIN.to_owned()),
                },
            },
        }
    }
}

/// A delivered message.
///
/// The queue client consumes with automatic acknowledgement, so the `delivery_tag` is only
/// informative: the message was already acked by the time the handler sees it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub message: Content,
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

impl DeliveredMessage {
    pub fn body(&self) -> &[u8] {
        &self.message.body
    }

    /// Body as text, invalid UTF-8 sequences are replaced.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.message.body)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.message.properties.content_type.as_deref()
    }
}
