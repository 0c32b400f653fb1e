//! The broker client capability the queue client is built on.
//!
//! The queue client doesn't speak any wire protocol itself, it drives a connector, the
//! connections it dials and the channels opened on them. [`crate::amqp`] implements these traits
//! with lapin, [`crate::memory`] with an in-process broker.

use crate::message::{DeliveredMessage, PublishedMessage};
use crate::model::{AutoDelete, Durable, Exclusive, Immediate, Mandatory, NoAck, NoLocal, NoWait};
use anyhow::Result;
use futures::stream::BoxStream;
use std::fmt;
use std::future::Future;
use tokio::sync::oneshot;

/// Stream of the messages delivered to a consumer. It ends when the consumer is cancelled or the
/// channel is closed.
pub type DeliveryStream = BoxStream<'static, Result<DeliveredMessage>>;

/// Dials connections to a broker.
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    fn dial(&self, url: &str) -> impl Future<Output = Result<Self::Connection>> + Send;
}

/// A transport connection to the broker.
pub trait Connection: Send + Sync + 'static {
    type Channel: Channel;

    fn open_channel(&self) -> impl Future<Output = Result<Self::Channel>> + Send;

    /// Closes the connection normally. Closing an already broken connection may fail, callers
    /// treat that as best effort.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

/// A logical channel over a connection.
pub trait Channel: Send + Sync + 'static {
    fn set_confirm_mode(&self, enabled: bool) -> impl Future<Output = Result<()>> + Send;

    fn declare_queue(
        &self,
        queue_name: &str,
        durable: Durable,
        exclusive: Exclusive,
        auto_delete: AutoDelete,
        no_wait: NoWait,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Registers a one-shot notification which fires when the channel or its connection becomes
    /// unusable.
    fn close_notification(&self) -> Result<CloseSignal>;

    fn publish(
        &self,
        exchange_name: &str,
        routing_key: &str,
        mandatory: Mandatory,
        immediate: Immediate,
        message: PublishedMessage,
    ) -> impl Future<Output = Result<()>> + Send;

    fn consume(
        &self,
        queue_name: &str,
        consumer_tag: &str,
        no_ack: NoAck,
        exclusive: Exclusive,
        no_local: NoLocal,
        no_wait: NoWait,
    ) -> impl Future<Output = Result<DeliveryStream>> + Send;
}

/// Why a connection or a channel became unusable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseReason {
    pub reply_code: u16,
    pub reply_text: String,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.reply_code, self.reply_text)
    }
}

/// Sending half of a close notification, held by the broker side.
#[derive(Debug)]
pub struct CloseNotifier {
    tx: Option<oneshot::Sender<CloseReason>>,
}

/// Receiving half of a close notification. It resolves once, with the reason of the close.
#[derive(Debug)]
pub struct CloseSignal {
    rx: oneshot::Receiver<CloseReason>,
}

/// Creates a connected notifier and signal pair.
pub fn close_notification() -> (CloseNotifier, CloseSignal) {
    let (tx, rx) = oneshot::channel();

    (CloseNotifier { tx: Some(tx) }, CloseSignal { rx })
}

impl CloseNotifier {
    /// Fires the signal. Only the first call has effect, it returns `false` afterwards or if
    /// nobody listens.
    pub fn notify(&mut self, reason: CloseReason) -> bool {
        match self.tx.take() {
            Some(tx) => tx.send(reason).is_ok(),
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        matches!(&self.tx, Some(tx) if !tx.is_closed())
    }
}

impl CloseSignal {
    /// Waits for the close. If the notifier is dropped without firing, the channel is
    /// considered to be gone.
    pub async fn closed(self) -> CloseReason {
        match self.rx.await {
            Ok(reason) => reason,
            Err(_) => CloseReason {
                reply_code: crate::model::ConnectionError::ConnectionForced as u16,
                reply_text: "Close notifier dropped".to_owned(),
            },
        }
    }
}
