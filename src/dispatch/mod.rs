//! # Validation interceptor and internal command dispatch.
//!
//! Every signal produced by the inbound pipeline passes through a
//! [`SignalInterceptor`] before it reaches the internal command channel. A
//! rejection turns into an error-reply signal for the originator and a
//! `ValidationRejected` event; the signal is not forwarded and the
//! connection stays up.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::ValidationRejection;
use crate::events::{Bus, Event, EventKind};
use crate::model::{Connection, Signal};

/// Signal name carried by validation error replies.
const REJECTION_REPLY_NAME: &str = "error.validation";

/// Hook validating signals before internal dispatch.
///
/// Implementations must not block on the connection's own traffic; the
/// worker awaits the interceptor inline for each signal.
#[async_trait]
pub trait SignalInterceptor: Send + Sync + 'static {
    /// Accepts or rejects one signal for the given connection.
    async fn intercept(
        &self,
        connection: &Connection,
        signal: &Signal,
    ) -> Result<(), ValidationRejection>;
}

/// Baseline validation: a signal must name an operation and act under at
/// least one authorization subject.
pub struct DefaultInterceptor;

#[async_trait]
impl SignalInterceptor for DefaultInterceptor {
    async fn intercept(
        &self,
        _connection: &Connection,
        signal: &Signal,
    ) -> Result<(), ValidationRejection> {
        if signal.name.is_empty() {
            return Err(ValidationRejection::new("signal has no name"));
        }
        if signal.authorization_subjects.is_empty() {
            return Err(ValidationRejection::new(
                "signal carries no authorization subject",
            ));
        }
        Ok(())
    }
}

/// What became of one dispatched signal.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Accepted and handed to the internal command channel.
    Forwarded,
    /// Rejected by the interceptor; the reply is for the originator.
    Rejected(Signal),
    /// The internal command channel is gone; the signal was dropped.
    Dropped,
}

/// Forwards validated signals from one connection into the platform's
/// command channel.
pub struct CommandDispatcher {
    connection: Arc<Connection>,
    interceptor: Arc<dyn SignalInterceptor>,
    commands: mpsc::Sender<Signal>,
    bus: Bus,
}

impl CommandDispatcher {
    /// Builds a dispatcher for one connection.
    pub fn new(
        connection: Arc<Connection>,
        interceptor: Arc<dyn SignalInterceptor>,
        commands: mpsc::Sender<Signal>,
        bus: Bus,
    ) -> Self {
        Self {
            connection,
            interceptor,
            commands,
            bus,
        }
    }

    /// Validates and forwards one signal.
    ///
    /// Awaiting the channel send applies backpressure to the session read
    /// loop when the platform is slower than the wire.
    pub async fn dispatch(&self, signal: Signal) -> DispatchOutcome {
        if let Err(rejection) = self.interceptor.intercept(&self.connection, &signal).await {
            warn!(
                connection = %self.connection.id,
                signal = %signal.name,
                reason = %rejection.reason, "signal rejected by validation"
            );
            self.bus.publish(
                Event::now(EventKind::ValidationRejected)
                    .with_connection(&self.connection.id)
                    .with_reason(rejection.reason.clone()),
            );
            return DispatchOutcome::Rejected(rejection_reply(&signal, &rejection));
        }

        match self.commands.send(signal).await {
            Ok(()) => DispatchOutcome::Forwarded,
            Err(_) => {
                warn!(
                    connection = %self.connection.id,
                    "command channel closed, signal dropped"
                );
                DispatchOutcome::Dropped
            }
        }
    }
}

/// Error reply echoing the originator's correlation id.
fn rejection_reply(original: &Signal, rejection: &ValidationRejection) -> Signal {
    let mut reply = Signal::event(
        REJECTION_REPLY_NAME,
        serde_json::json!({ "reason": rejection.reason }),
    );
    reply.correlation_id = original.correlation_id;
    reply.entity = original.entity.clone();
    reply.headers = original.headers.clone();
    reply
}
