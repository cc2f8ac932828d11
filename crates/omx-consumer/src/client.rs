//! Client callback contracts.
//!
//! Every delivered message is handed to `on_all` first and then to the
//! kind-specific callback. Callbacks always execute on the thread that
//! calls `dispatch`; the engine spawns no delivery threads.

use std::sync::Arc;

use omx_core::{ItemMsg, OmxError};

use crate::handle::Handle;

/// Identity of the item an event was delivered for.
#[derive(Debug, Clone)]
pub struct ItemEvent {
    pub handle: Handle,
    /// Opaque application token supplied at registration.
    pub closure: u64,
    /// Name of the service the item is routed to, when resolved.
    pub service_name: Option<String>,
}

/// Receiver of item stream events.
///
/// Default impls are no-ops so clients implement only what they consume.
pub trait ConsumerClient: Send + Sync {
    /// Catch-all, invoked before the specific callback for every message.
    fn on_all(&self, _msg: &ItemMsg, _event: &ItemEvent) {}

    fn on_refresh(&self, _msg: &ItemMsg, _event: &ItemEvent) {}
    fn on_update(&self, _msg: &ItemMsg, _event: &ItemEvent) {}
    fn on_status(&self, _msg: &ItemMsg, _event: &ItemEvent) {}
    fn on_generic(&self, _msg: &ItemMsg, _event: &ItemEvent) {}
    fn on_ack(&self, _msg: &ItemMsg, _event: &ItemEvent) {}
}

/// Optional error receiver.
///
/// When installed on the engine, registration-surface errors are routed
/// here and the failing call returns [`Handle::NONE`] instead of `Err`.
pub trait ErrorClient: Send + Sync {
    fn on_invalid_usage(&self, _text: &str) {}
    fn on_invalid_handle(&self, _handle: u64, _text: &str) {}
    fn on_memory_exhaustion(&self, _text: &str) {}
}

/// Route an error to the proper [`ErrorClient`] callback.
pub fn notify_error(client: &Arc<dyn ErrorClient>, err: &OmxError) {
    match err {
        OmxError::MemoryExhaustion(text) => client.on_memory_exhaustion(text),
        OmxError::InvalidUsage(text) => client.on_invalid_usage(text),
        OmxError::InvalidHandle(handle) => client.on_invalid_handle(*handle, &err.text()),
    }
}
