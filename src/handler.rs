//! Connection-scoped application hooks.
use crate::channel::ChannelRef;
use crate::message::Headers;

/// Hooks invoked on the connection itself: the banner, new channels, and any event that the
/// routing rules in [`crate::connection`] did not target at a specific channel (`FullyBooted`,
/// `ChannelReload`, `OriginateResponse`, and so on).
///
/// Every method defaults to a no-op; applications override only the ones they care about,
/// either by hand or via the `#[connection_handler(hook_name)]` attribute macro.
#[async_trait::async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn banner_received(&self, _banner: &str) {}
    async fn new_channel(&self, _name: &str, _channel: ChannelRef) {}
    async fn event(&self, _name: &str, _headers: &Headers) {}
}

/// A `ConnectionHandler` that ignores everything. Used as the default when a connection is
/// built without an explicit handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopConnectionHandler;
#[async_trait::async_trait]
impl ConnectionHandler for NoopConnectionHandler {}
