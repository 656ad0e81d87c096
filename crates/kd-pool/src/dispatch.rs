//! Borrow-dispatch-return helper for the HTTP pool

use tracing::debug;

use kd_common::EndpointKey;

use crate::http::{DispatchOutcome, HttpDispatcherFactory, OutboundMessage};
use crate::pool::KeyedPool;
use crate::Result;

/// Send one message through a pooled dispatcher.
///
/// The dispatcher is invalidated after a transport failure and released otherwise.
pub async fn send(
    pool: &KeyedPool<HttpDispatcherFactory>,
    key: &EndpointKey,
    message: &OutboundMessage,
) -> Result<DispatchOutcome> {
    let mut dispatcher = pool.borrow(key).await?;
    let outcome = dispatcher.dispatch(message).await;

    if let DispatchOutcome::ConnectionFailed { reason } = &outcome {
        debug!(endpoint = %key, reason = %reason, "Invalidating dispatcher after transport failure");
        dispatcher.invalidate().await;
    } else {
        dispatcher.release().await;
    }

    Ok(outcome)
}
