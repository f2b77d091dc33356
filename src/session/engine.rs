use std::sync::Arc;

use super::message::{AppMessage, Direction, FixMessage, OutboundMessage, SessionEvent};
use crate::error::Result;

/// Callbacks the protocol engine drives from its own I/O thread.
///
/// Implementations must return quickly; nothing here may wait on the
/// strategy side.
pub trait FixApplication: Send + Sync {
    /// Admin traffic. Outbound messages may be edited before they hit the wire.
    fn on_admin_message(&self, direction: Direction, message: &mut FixMessage);

    fn on_app_message(&self, message: AppMessage);

    fn on_session_event(&self, event: SessionEvent);
}

/// The FIX engine as seen from this crate: session layer, sequencing and
/// transport live behind it.
#[cfg_attr(test, mockall::automock)]
pub trait ProtocolEngine: Send + Sync {
    /// Connect and send logon; inbound traffic is delivered to `application`.
    fn start(&self, application: Arc<dyn FixApplication>) -> Result<()>;

    fn send(&self, message: OutboundMessage) -> Result<()>;

    /// Logout and disconnect
    fn stop(&self) -> Result<()>;
}
