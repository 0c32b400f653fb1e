//! In-process broker.
//!
//! It implements the broker traits without any networking, so the queue client can be exercised
//! deterministically: dials can be made fail, connections can be dropped as if the network went
//! away, and the queues can be inspected. Queues are only reachable through the default exchange.

use crate::broker::{self, CloseNotifier, CloseReason, CloseSignal, Connector, DeliveryStream};
use crate::client_error;
use crate::message::{Content, DeliveredMessage, PublishedMessage};
use crate::model::{
    AutoDelete, ChannelError, ConnectionError, Durable, Exclusive, Immediate, Mandatory, NoAck, NoLocal, NoWait,
};
use anyhow::Result;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

type ConnectionId = u64;

#[derive(Debug, Default)]
struct BrokerState {
    unreachable: bool,
    failing_dials: u32,
    failing_consumes: u32,
    dial_attempts: Vec<Instant>,
    last_connection_id: ConnectionId,
    connections: HashMap<ConnectionId, ConnectionState>,
    queues: HashMap<String, QueueState>,
    last_delivery_tag: u64,
}

#[derive(Debug, Default)]
struct ConnectionState {
    close_notifiers: Vec<CloseNotifier>,
    confirm_mode: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct QueueFlags {
    durable: bool,
    exclusive: bool,
    auto_delete: bool,
}

#[derive(Debug)]
struct QueueState {
    flags: QueueFlags,
    /// Messages waiting for a consumer.
    messages: VecDeque<Content>,
    /// Every message ever published to the queue.
    published: Vec<PublishedMessage>,
    consumers: Vec<QueueConsumer>,
}

#[derive(Debug)]
struct QueueConsumer {
    connection_id: ConnectionId,
    consumer_tag: String,
    exclusive: bool,
    sink: mpsc::UnboundedSender<Result<DeliveredMessage>>,
}

impl QueueState {
    fn new(flags: QueueFlags) -> Self {
        QueueState {
            flags,
            messages: VecDeque::new(),
            published: vec![],
            consumers: vec![],
        }
    }

    /// Hands over the content to the first consumer which is still listening, or keeps it in
    /// the queue.
    fn dispatch(&mut self, queue_name: &str, content: Content, last_delivery_tag: &mut u64) {
        self.consumers.retain(|c| !c.sink.is_closed());

        let mut content = content;

        for consumer in &self.consumers {
            *last_delivery_tag += 1;

            let message = DeliveredMessage {
                message: content,
                consumer_tag: consumer.consumer_tag.clone(),
                delivery_tag: *last_delivery_tag,
                redelivered: false,
                exchange: "".to_owned(),
                routing_key: queue_name.to_owned(),
            };

            match consumer.sink.send(Ok(message)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(Ok(undelivered))) => content = undelivered.message,
                Err(mpsc::error::SendError(Err(_))) => return,
            }
        }

        self.messages.push_back(content);
    }
}

/// Handle of the in-process broker. Clones share the same broker.
#[derive(Clone, Debug, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next `n` dials will be refused.
    pub fn fail_next_dials(&self, n: u32) {
        self.state().failing_dials = n;
    }

    /// Refuses every dial until it is set back to reachable.
    pub fn set_reachable(&self, reachable: bool) {
        self.state().unreachable = !reachable;
    }

    /// The next `n` consumer registrations will be refused.
    pub fn fail_next_consumes(&self, n: u32) {
        self.state().failing_consumes = n;
    }

    /// Points in time of all the dials, successful or not.
    pub fn dial_attempts(&self) -> Vec<Instant> {
        self.state().dial_attempts.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.state().connections.len()
    }

    /// True if any open connection switched on publisher confirms.
    pub fn confirm_mode_enabled(&self) -> bool {
        self.state().connections.values().any(|c| c.confirm_mode)
    }

    /// Closes all the connections as if the network failed. Close notifications fire and the
    /// consumers of those connections end. Returns the number of connections dropped.
    pub fn drop_connections(&self) -> usize {
        let mut state = self.state();
        let dropped: Vec<_> = state.connections.drain().collect();
        let count = dropped.len();

        for (id, mut connection) in dropped {
            remove_consumers(&mut state, id);

            for notifier in connection.close_notifiers.iter_mut() {
                notifier.notify(CloseReason {
                    reply_code: ConnectionError::ConnectionForced as u16,
                    reply_text: "CONNECTION_FORCED - broker forced connection closure".to_owned(),
                });
            }
        }

        count
    }

    /// Declares a queue from the administration side.
    pub fn declare_queue(&self, queue_name: &str, durable: Durable, exclusive: Exclusive, auto_delete: AutoDelete) {
        let flags = QueueFlags {
            durable: durable.0,
            exclusive: exclusive.0,
            auto_delete: auto_delete.0,
        };

        self.state()
            .queues
            .entry(queue_name.to_owned())
            .or_insert_with(|| QueueState::new(flags));
    }

    pub fn queue_exists(&self, queue_name: &str) -> bool {
        self.state().queues.contains_key(queue_name)
    }

    /// Publishes a text message to the queue as another producer would do.
    pub fn publish(&self, queue_name: &str, body: &str) {
        let mut state = self.state();
        let BrokerState {
            queues,
            last_delivery_tag,
            ..
        } = &mut *state;

        if let Some(queue) = queues.get_mut(queue_name) {
            let published = PublishedMessage::text(body);

            queue.published.push(published.clone());
            queue.dispatch(queue_name, published.message, last_delivery_tag);
        }
    }

    /// Messages waiting in the queue for a consumer.
    pub fn queued_messages(&self, queue_name: &str) -> Vec<Content> {
        self.state()
            .queues
            .get(queue_name)
            .map(|q| q.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All the messages published to the queue, consumed or not.
    pub fn published_messages(&self, queue_name: &str) -> Vec<PublishedMessage> {
        self.state()
            .queues
            .get(queue_name)
            .map(|q| q.published.clone())
            .unwrap_or_default()
    }

    pub fn consumer_count(&self, queue_name: &str) -> usize {
        self.state()
            .queues
            .get(queue_name)
            .map(|q| q.consumers.iter().filter(|c| !c.sink.is_closed()).count())
            .unwrap_or_default()
    }
}

fn remove_consumers(state: &mut BrokerState, connection_id: ConnectionId) {
    for queue in state.queues.values_mut() {
        queue.consumers.retain(|c| c.connection_id != connection_id);
    }
}

impl Connector for MemoryBroker {
    type Connection = MemoryConnection;

    async fn dial(&self, url: &str) -> Result<MemoryConnection> {
        let mut state = self.state();

        state.dial_attempts.push(Instant::now());

        if state.failing_dials > 0 || state.unreachable {
            state.failing_dials = state.failing_dials.saturating_sub(1);

            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("Connection refused: {url}"),
            )
            .into());
        }

        state.last_connection_id += 1;

        let id = state.last_connection_id;

        state.connections.insert(id, ConnectionState::default());

        Ok(MemoryConnection {
            id,
            broker: self.clone(),
        })
    }
}

/// A connection to the in-process broker.
#[derive(Debug)]
pub struct MemoryConnection {
    id: ConnectionId,
    broker: MemoryBroker,
}

impl broker::Connection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> Result<MemoryChannel> {
        if !self.broker.state().connections.contains_key(&self.id) {
            return client_error!(ConnectionError::ConnectionForced, "Connection is closed");
        }

        Ok(MemoryChannel {
            connection_id: self.id,
            broker: self.broker.clone(),
        })
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.state();

        state.connections.remove(&self.id);
        remove_consumers(&mut state, self.id);

        Ok(())
    }
}

/// A channel of an in-process connection. It is usable as long as its connection is open.
#[derive(Debug)]
pub struct MemoryChannel {
    connection_id: ConnectionId,
    broker: MemoryBroker,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        let state = self.broker.state();

        if !state.connections.contains_key(&self.connection_id) {
            return client_error!(ConnectionError::ChannelError, "Channel is closed");
        }

        Ok(state)
    }
}

impl broker::Channel for MemoryChannel {
    async fn set_confirm_mode(&self, enabled: bool) -> Result<()> {
        let mut state = self.open_state()?;

        if let Some(connection) = state.connections.get_mut(&self.connection_id) {
            connection.confirm_mode = enabled;
        }

        Ok(())
    }

    async fn declare_queue(
        &self,
        queue_name: &str,
        durable: Durable,
        exclusive: Exclusive,
        auto_delete: AutoDelete,
        _no_wait: NoWait,
    ) -> Result<()> {
        let mut state = self.open_state()?;
        let flags = QueueFlags {
            durable: durable.0,
            exclusive: exclusive.0,
            auto_delete: auto_delete.0,
        };

        match state.queues.get(queue_name) {
            Some(queue) if queue.flags != flags => client_error!(
                ChannelError::PreconditionFailed,
                format!("PRECONDITION_FAILED - inequivalent arguments for queue '{queue_name}'")
            ),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(queue_name.to_owned(), QueueState::new(flags));

                Ok(())
            }
        }
    }

    fn close_notification(&self) -> Result<CloseSignal> {
        let mut state = self.open_state()?;
        let (notifier, signal) = broker::close_notification();

        if let Some(connection) = state.connections.get_mut(&self.connection_id) {
            connection.close_notifiers.push(notifier);
        }

        Ok(signal)
    }

    async fn publish(
        &self,
        exchange_name: &str,
        routing_key: &str,
        _mandatory: Mandatory,
        _immediate: Immediate,
        message: PublishedMessage,
    ) -> Result<()> {
        let mut state = self.open_state()?;

        if !exchange_name.is_empty() {
            return client_error!(
                ChannelError::NotFound,
                format!("NOT_FOUND - no exchange '{exchange_name}'")
            );
        }

        let BrokerState {
            queues,
            last_delivery_tag,
            ..
        } = &mut *state;

        // Unroutable messages are dropped by the default exchange.
        if let Some(queue) = queues.get_mut(routing_key) {
            queue.published.push(message.clone());
            queue.dispatch(routing_key, message.message, last_delivery_tag);
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue_name: &str,
        consumer_tag: &str,
        no_ack: NoAck,
        exclusive: Exclusive,
        _no_local: NoLocal,
        _no_wait: NoWait,
    ) -> Result<DeliveryStream> {
        let mut state = self.open_state()?;

        if state.failing_consumes > 0 {
            state.failing_consumes -= 1;

            return client_error!(
                ChannelError::AccessRefused,
                format!("ACCESS_REFUSED - cannot consume from '{queue_name}'")
            );
        }

        if !no_ack.0 {
            return client_error!(ConnectionError::NotAllowed, "Only auto-ack consumers are supported");
        }

        let BrokerState {
            queues,
            last_delivery_tag,
            ..
        } = &mut *state;

        let Some(queue) = queues.get_mut(queue_name) else {
            return client_error!(ChannelError::NotFound, format!("NOT_FOUND - no queue '{queue_name}'"));
        };

        queue.consumers.retain(|c| !c.sink.is_closed());

        if queue.consumers.iter().any(|c| c.exclusive) || (exclusive.0 && !queue.consumers.is_empty()) {
            return client_error!(
                ChannelError::ResourceLocked,
                format!("RESOURCE_LOCKED - queue '{queue_name}' has an exclusive consumer")
            );
        }

        let consumer_tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", rand::random::<u64>())
        } else {
            consumer_tag.to_owned()
        };

        let (sink, stream) = mpsc::unbounded_channel();

        queue.consumers.push(QueueConsumer {
            connection_id: self.connection_id,
            consumer_tag,
            exclusive: exclusive.0,
            sink,
        });

        let waiting: Vec<_> = queue.messages.drain(..).collect();

        for content in waiting {
            queue.dispatch(queue_name, content, last_delivery_tag);
        }

        Ok(UnboundedReceiverStream::new(stream).boxed())
    }
}
