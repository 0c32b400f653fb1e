use crate::backoff::{Backoff, ReconnectPolicy};
use crate::broker::{Channel, CloseSignal, Connection, Connector};
use crate::client_error;
use crate::consumer::{self, MessageHandler};
use crate::message::PublishedMessage;
use crate::model::{
    AutoDelete, ConnectionError, Durable, Exclusive, GenerationId, Immediate, Mandatory, NoAck,
    NoLocal, NoWait,
};
use anyhow::Result;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

type ChannelOf<C> = <<C as Connector>::Connection as Connection>::Channel;

/// A live connection and its channel. They are created and dropped together.
struct Session<C: Connector> {
    generation: GenerationId,
    connection: C::Connection,
    channel: ChannelOf<C>,
    /// Cancelled when the session stops being the live one.
    token: CancellationToken,
}

/// The close signal of the latest session, waiting for the supervisor to pick it up.
struct ArmedSignal {
    generation: Generation,
    signal: CloseSignal,
}

struct Shared<C: Connector> {
    name: String,
    url: String,
    /// The url with the password masked, for the logs.
    display_url: String,
    connector: C,
    policy: ReconnectPolicy,
    session: watch::Sender<Option<Arc<Session<C>>>>,
    closed: Mutex<Option<ArmedSignal>>,
    last_generation: AtomicU64,
    shutdown: CancellationToken,
}

/// Handle of one successful connection, passed to the `on_connect` callback.
///
/// Work started for a connection should stop when the generation is retired, that is when the
/// connection stops being the live one.
#[derive(Clone, Debug)]
pub struct Generation {
    id: GenerationId,
    token: CancellationToken,
}

impl Generation {
    pub fn id(&self) -> GenerationId {
        self.id
    }

    pub fn is_retired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the connection of this generation is not usable anymore.
    pub async fn retired(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Client of one queue over one connection and channel, which reconnects whenever the
/// connection is lost.
///
/// Cloning is cheap, clones share the same connection. Typically one task runs
/// [`QueueClient::connect_and_keep_alive`] and the others publish or consume through clones.
pub struct QueueClient<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for QueueClient<C> {
    fn clone(&self) -> Self {
        QueueClient {
            shared: self.shared.clone(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Masks the password of the url. Urls which cannot be parsed are shown as they are.
fn redact_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            if parsed.set_password(Some("***")).is_err() {
                return url.to_owned();
            }

            parsed.to_string()
        }
        _ => url.to_owned(),
    }
}

impl<C: Connector> QueueClient<C> {
    /// Creates the client, it doesn't connect yet.
    pub fn new(name: &str, url: &str, connector: C) -> Self {
        Self::with_policy(name, url, connector, ReconnectPolicy::default())
    }

    pub fn with_policy(name: &str, url: &str, connector: C, policy: ReconnectPolicy) -> Self {
        let (session, _) = watch::channel(None);

        QueueClient {
            shared: Arc::new(Shared {
                name: name.to_owned(),
                url: url.to_owned(),
                display_url: redact_url(url),
                connector,
                policy,
                session,
                closed: Mutex::new(None),
                last_generation: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        self.shared.policy
    }

    pub fn is_connected(&self) -> bool {
        self.shared.session.borrow().is_some()
    }

    /// Generation of the live connection, if there is any.
    pub fn generation(&self) -> Option<GenerationId> {
        self.shared.session.borrow().as_ref().map(|s| s.generation)
    }

    /// Waits until there is a live connection.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut sessions = self.shared.session.subscribe();

        tokio::select! {
            result = sessions.wait_for(Option::is_some) => result.map(drop).map_err(anyhow::Error::new),
            _ = self.shared.shutdown.cancelled() => {
                client_error!(ConnectionError::ConnectionForced, "Client is shut down")
            }
        }
    }

    /// Connects to the broker, opens a channel and declares the queue.
    ///
    /// Any failure is logged and reported as `false`, in that case the previous state of the
    /// client is left untouched.
    pub async fn connect(&self) -> bool {
        match self.attempt_connect().await {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    "[{}] Failed to connect to {}: {:#}",
                    self.shared.name, self.shared.display_url, e
                );

                false
            }
        }
    }

    async fn attempt_connect(&self) -> Result<GenerationId> {
        let shared = &self.shared;

        info!("[{}] Attempting to connect to {}", shared.name, shared.display_url);

        let generation = self.open_session().await?;

        info!(
            "[{}] Connected to {} (generation {})",
            shared.name, shared.display_url, generation
        );

        Ok(generation)
    }

    async fn open_session(&self) -> Result<GenerationId> {
        let connection = self.shared.connector.dial(&self.shared.url).await?;

        match self.prepare_channel(&connection).await {
            Ok((channel, signal)) => {
                let (generation, superseded) = self.install(connection, channel, signal);

                if let Some(previous) = superseded {
                    debug!(
                        "[{}] Generation {} is superseded by {}",
                        self.shared.name, previous.generation, generation
                    );

                    self.close_session(previous).await;
                }

                Ok(generation)
            }
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    debug!(
                        "[{}] Closing the half-opened connection failed: {:#}",
                        self.shared.name, close_err
                    );
                }

                Err(e)
            }
        }
    }

    async fn prepare_channel(&self, connection: &C::Connection) -> Result<(ChannelOf<C>, CloseSignal)> {
        let channel = connection.open_channel().await?;

        channel.set_confirm_mode(false).await?;
        channel
            .declare_queue(
                &self.shared.name,
                Durable(false),
                Exclusive(false),
                AutoDelete(false),
                NoWait(false),
            )
            .await?;

        let signal = channel.close_notification()?;

        Ok((channel, signal))
    }

    /// Makes the freshly opened connection the live one and arms its close signal. Returns the
    /// session it replaced, if any.
    fn install(
        &self,
        connection: C::Connection,
        channel: ChannelOf<C>,
        signal: CloseSignal,
    ) -> (GenerationId, Option<Arc<Session<C>>>) {
        let shared = &self.shared;
        let id = shared.last_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = shared.shutdown.child_token();

        let armed = ArmedSignal {
            generation: Generation {
                id,
                token: token.clone(),
            },
            signal,
        };

        let session = Arc::new(Session {
            generation: id,
            connection,
            channel,
            token,
        });

        // The armed signal always belongs to the live session.
        let mut closed = lock(&shared.closed);

        *closed = Some(armed);

        let previous = shared.session.send_replace(Some(session));

        (id, previous)
    }

    /// Connects and reconnects to the broker until the client is shut down.
    ///
    /// Failed attempts are retried with exponential backoff. After every successful connection
    /// `on_connect` is called once, on this task, before waiting for the connection to close;
    /// it should spawn longer work (like [`QueueClient::consume_messages`]) instead of running
    /// it. A connection opened by a direct [`QueueClient::connect`] call, before the loop starts,
    /// while it waits between attempts or by replacing the live one, is taken over without
    /// dialing again.
    pub async fn connect_and_keep_alive<F>(&self, mut on_connect: F)
    where
        F: FnMut(Generation) + Send,
    {
        let shared = &self.shared;
        let mut backoff = Backoff::new(shared.policy);
        let mut reconnect = true;

        loop {
            if reconnect && !self.connect_with_backoff(&mut backoff).await {
                self.release().await;
                return;
            }

            backoff.reset();

            let armed = lock(&shared.closed).take();
            let Some(ArmedSignal { generation, signal }) = armed else {
                reconnect = true;
                continue;
            };

            on_connect(generation.clone());

            reconnect = tokio::select! {
                reason = signal.closed() => {
                    let retired = self.retire(generation.id).await;

                    if retired {
                        warn!("[{}] Connection closed: {}", shared.name, reason);
                    }

                    retired
                }
                _ = shared.shutdown.cancelled() => {
                    self.release().await;
                    return;
                }
            };
        }
    }

    /// Connects, waiting more and more between the failed attempts. Returns `false` if the
    /// client is shut down in the meantime.
    async fn connect_with_backoff(&self, backoff: &mut Backoff) -> bool {
        let shared = &self.shared;
        let mut sessions = shared.session.subscribe();

        loop {
            if shared.shutdown.is_cancelled() {
                return false;
            }

            if lock(&shared.closed).is_some() {
                debug!("[{}] Taking over a connection opened meanwhile", shared.name);

                return true;
            }

            let attempt = tokio::select! {
                attempt = self.attempt_connect() => attempt,
                _ = shared.shutdown.cancelled() => return false,
            };

            let e = match attempt {
                Ok(_) => return !shared.shutdown.is_cancelled(),
                Err(e) => e,
            };

            let delay = backoff.next_delay();

            warn!(
                "[{}] Failed to connect to {}: {:#}. Retrying in {:?}...",
                shared.name, shared.display_url, e, delay
            );

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);

            // A direct connect ends the wait.
            let mut watching = true;

            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    _ = shared.shutdown.cancelled() => return false,
                    changed = sessions.changed(), if watching => match changed {
                        Ok(()) if lock(&shared.closed).is_some() => break,
                        Ok(()) => {}
                        Err(_) => watching = false,
                    },
                }
            }
        }
    }

    /// Drops the session of `generation` if it is still the live one. Returns `false` if it was
    /// already replaced or released.
    async fn retire(&self, generation: GenerationId) -> bool {
        let mut retired = None;

        self.shared.session.send_if_modified(|current| {
            if matches!(current, Some(session) if session.generation == generation) {
                retired = current.take();
                true
            } else {
                false
            }
        });

        match retired {
            Some(session) => {
                self.close_session(session).await;
                true
            }
            None => {
                debug!("[{}] Generation {} was already retired", self.shared.name, generation);
                false
            }
        }
    }

    /// Drops the live session whatever generation it is.
    async fn release(&self) {
        let released = {
            let mut closed = lock(&self.shared.closed);

            closed.take();
            self.shared.session.send_replace(None)
        };

        if let Some(session) = released {
            self.close_session(session).await;

            info!("[{}] Disconnected from {}", self.shared.name, self.shared.display_url);
        }
    }

    async fn close_session(&self, session: Arc<Session<C>>) {
        session.token.cancel();

        debug!("[{}] Generation {} is retired", self.shared.name, session.generation);

        if let Err(e) = session.connection.close().await {
            debug!(
                "[{}] Closing connection of generation {} failed: {:#}",
                self.shared.name, session.generation, e
            );
        }
    }

    /// Asks the keep alive loop and the consumers to stop.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Shuts the client down and closes the live connection.
    pub async fn close(&self) {
        self.shutdown();
        self.release().await;
    }

    fn live_session(&self) -> Result<Arc<Session<C>>> {
        match self.shared.session.borrow().clone() {
            Some(session) => Ok(session),
            None => client_error!(
                ConnectionError::ChannelError,
                format!("Queue {} has no live channel", self.shared.name)
            ),
        }
    }

    /// Publishes a plain text message to the queue through the default exchange.
    ///
    /// There is no publisher confirm and no retry; transport errors are returned as they are.
    pub async fn send_message(&self, message: &str) -> Result<()> {
        let session = self.live_session()?;

        session
            .channel
            .publish(
                "",
                &self.shared.name,
                Mandatory(false),
                Immediate(false),
                PublishedMessage::text(message),
            )
            .await
    }

    /// Consumes the queue, calling `handler` for every message in delivery order.
    ///
    /// Messages are acknowledged automatically on delivery, before the handler runs, so a
    /// failing handler doesn't cause redelivery (at-most-once delivery).
    ///
    /// Returns when the connection the consumer was started on is retired or when the broker
    /// ends the consumer. Errors of the delivery stream and
    /// failures to register the consumer are returned.
    pub async fn consume_messages<H>(&self, handler: H) -> Result<()>
    where
        H: MessageHandler,
    {
        let name = &self.shared.name;
        let session = self.live_session()?;

        let deliveries = match session
            .channel
            .consume(name, "", NoAck(true), Exclusive(false), NoLocal(false), NoWait(false))
            .await
        {
            Ok(deliveries) => deliveries,
            Err(e) => {
                error!("[{}] Failed to register a consumer: {:#}", name, e);

                return Err(e);
            }
        };

        let token = session.token.clone();
        drop(session);

        info!("[{}] Waiting for messages...", name);

        consumer::spawn(name.clone(), deliveries, handler, token).await?
    }
}
