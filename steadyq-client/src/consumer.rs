use crate::broker::DeliveryStream;
use crate::message::DeliveredMessage;
use anyhow::Result;
use futures::StreamExt;
use log::{debug, error, info};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Callback of a consumer. It is called for every delivered message, one at a time.
///
/// Any `FnMut(DeliveredMessage)` closure is a handler.
pub trait MessageHandler: Send + 'static {
    fn on_message(&mut self, message: DeliveredMessage);
}

impl<F> MessageHandler for F
where
    F: FnMut(DeliveredMessage) + Send + 'static,
{
    fn on_message(&mut self, message: DeliveredMessage) {
        self(message)
    }
}

/// Spawns the task which feeds the handler from the delivery stream until the token is
/// cancelled or the stream ends.
pub(crate) fn spawn<H: MessageHandler>(
    queue_name: String,
    deliveries: DeliveryStream,
    handler: H,
    token: CancellationToken,
) -> JoinHandle<Result<()>> {
    tokio::spawn(delivery_loop(queue_name, deliveries, handler, token))
}

async fn delivery_loop<H: MessageHandler>(
    queue_name: String,
    mut deliveries: DeliveryStream,
    mut handler: H,
    token: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            biased;

            _ = token.cancelled() => {
                debug!("[{}] Consumer stopped, its connection is retired", queue_name);

                return Ok(());
            }
            delivery = deliveries.next() => match delivery {
                Some(Ok(message)) => handler.on_message(message),
                Some(Err(e)) => {
                    error!("[{}] Delivery stream failed: {:#}", queue_name, e);

                    return Err(e);
                }
                None => {
                    info!("[{}] Consumer ended by the broker", queue_name);

                    return Ok(());
                }
            }
        }
    }
}
