//! Application callbacks.
//!
//! Setting a handler with [`Client::set_handler`](crate::Client::set_handler)
//! switches the client to background mode: a dispatch thread reads from the
//! network and calls the handler as packets arrive. Callbacks never run
//! while the engine's lock is held, so they may call back into the client.

use crate::error::ClientError;
use crate::registry::DeliveredMessage;

/// Identifies one QoS 1/2 publish until it is acknowledged.
pub type DeliveryToken = u16;

/// Handler trait for client events.
///
/// All methods have default implementations.
pub trait MqttHandler: Send {
    /// Called for each received message.
    ///
    /// Returning `false` leaves the message at the head of the queue; it is
    /// offered again on a later dispatch cycle.
    #[allow(unused_variables)]
    fn message_arrived(&mut self, message: &DeliveredMessage) -> bool {
        true
    }

    /// Called when the broker has acknowledged a QoS 1/2 publish.
    #[allow(unused_variables)]
    fn delivery_complete(&mut self, token: DeliveryToken) {}

    /// Called when an established connection drops without
    /// [`Client::disconnect`](crate::Client::disconnect).
    #[allow(unused_variables)]
    fn connection_lost(&mut self, cause: &ClientError) {}
}
