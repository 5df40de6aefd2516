//! The channel registry and channel state machine.
//!
//! Every live call leg ("channel") Asterisk tells us about is tracked here as a
//! [`ChannelState`] behind a cheaply-cloneable [`ChannelRef`] handle. The registry is the single
//! owner of every channel; application hooks only ever see the shared handle, never an owned
//! value, mirroring the "the router owns the handlers, handlers never own the router" split the
//! rest of this crate's host project uses for its own core types.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::asyncagi::{AgiCompletion, AsyncAgiHandler};
use crate::error::AmiError;
use crate::message::Headers;

/// The canonical (code, description) table for `ChannelState`/`State`.
const STATE_TABLE: [(u8, &str); 10] = [
    (0, "Down"),
    (1, "Rsrvd"),
    (2, "OffHook"),
    (3, "Dialing"),
    (4, "Ring"),
    (5, "Ringing"),
    (6, "Up"),
    (7, "Busy"),
    (8, "Dialing Offhook"),
    (9, "Pre-ring"),
];

fn state_desc(code: u8) -> &'static str {
    STATE_TABLE
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, d)| *d)
        .unwrap_or("Unknown")
}
fn state_from_desc(desc: &str) -> Option<u8> {
    STATE_TABLE
        .iter()
        .find(|(_, d)| d.eq_ignore_ascii_case(desc))
        .map(|(c, _)| *c)
}

/// A single `(context, extension, priority, application, app_data)` tuple from a `Newexten`
/// event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionEntry {
    pub context: String,
    pub extension: String,
    pub priority: i32,
    pub application: String,
    pub app_data: String,
}

/// The hooks a channel's owner may install to observe its lifecycle.
///
/// Every method defaults to a no-op; applications override only the ones they care about,
/// either by hand or via the `#[channel_handler(hook_name)]` attribute macro.
#[async_trait::async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn new_state(&self, _state: u8, _desc: &str) {}
    async fn new_caller_id(&self, _number: Option<&str>, _name: Option<&str>) {}
    async fn variable_set(&self, _variable: &str, _value: &str) {}
    async fn extension_entered(
        &self,
        _context: &str,
        _extension: &str,
        _priority: i32,
        _application: &str,
        _app_data: &str,
    ) {
    }
    async fn renamed(&self, _old_name: &str, _new_name: &str) {}
    async fn linked(&self, _peer: ChannelRef) {}
    async fn unlinked(&self, _peer: ChannelRef) {}
    async fn dial_begun(&self, _destination: &str, _dial_string: Option<&str>) {}
    async fn dial_ended(&self, _dial_status: Option<&str>) {}
    async fn hung_up(&self, _cause: i32, _cause_text: &str) {}
}

/// The mutable state of a single tracked channel.
pub struct ChannelState {
    pub name: String,
    pub params: Headers,
    pub state: u8,
    pub caller_id: (Option<String>, Option<String>),
    pub variables: HashMap<String, String>,
    pub extensions: Vec<ExtensionEntry>,
    pub linked_to: Option<String>,
    pub pending_agi: HashMap<String, AgiCompletion>,
    pub channel_handler: Option<Arc<dyn ChannelHandler>>,
    pub async_agi_handler: Option<Arc<dyn AsyncAgiHandler>>,
}
impl std::fmt::Debug for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ChannelState")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("caller_id", &self.caller_id)
            .field("linked_to", &self.linked_to)
            .finish_non_exhaustive()
    }
}

/// A shared, cheaply-cloneable handle to a tracked channel.
///
/// The registry is this handle's only owner; `linked_to` is stored as a plain name and resolved
/// against the registry at the point of use rather than as a second strong reference, so a
/// channel can never keep another alive past its `Hangup`.
///
/// Locking is synchronous and held only for the duration of a closure passed to `with`/
/// `with_mut`, never across an `.await` — this lets `Connection`'s action-correlation flows
/// grab `&mut Connection` access back between pipeline stages instead of holding a borrow for
/// an entire multi-action exchange.
#[derive(Debug, Clone)]
pub struct ChannelRef(Arc<Mutex<ChannelState>>);
impl ChannelRef {
    fn new(state: ChannelState) -> Self {
        Self(Arc::new(Mutex::new(state)))
    }

    pub fn with<R>(&self, f: impl FnOnce(&ChannelState) -> R) -> R {
        f(&self.0.lock().unwrap())
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut ChannelState) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }

    pub fn name(&self) -> String {
        self.with(|c| c.name.clone())
    }

    /// Install the handler that will receive this channel's lifecycle hooks.
    pub fn set_handler(&self, handler: Arc<dyn ChannelHandler>) {
        self.with_mut(|c| c.channel_handler = Some(handler));
    }

    /// Install the handler that will receive this channel's AsyncAGI `Start` hook.
    pub fn set_async_agi_handler(&self, handler: Arc<dyn AsyncAgiHandler>) {
        self.with_mut(|c| c.async_agi_handler = Some(handler));
    }
}

fn caller_id_from_headers(headers: &Headers) -> (Option<String>, Option<String>) {
    let number = headers
        .get("calleridnum")
        .or_else(|| headers.get("callerid"))
        .cloned();
    let name = headers.get("calleridname").cloned();
    (number, name)
}

fn resolve_state(headers: &Headers) -> Result<(u8, String), AmiError> {
    if let Some(raw) = headers.get("channelstate") {
        let code: u8 = raw
            .parse()
            .map_err(|_| AmiError::Protocol(crate::message::ProtocolError::MalformedHeaderLine(raw.clone())))?;
        let desc = headers
            .get("channelstatedesc")
            .cloned()
            .unwrap_or_else(|| state_desc(code).to_owned());
        return Ok((code, desc));
    }
    if let Some(desc) = headers.get("state") {
        let code = state_from_desc(desc).ok_or_else(|| {
            AmiError::Protocol(crate::message::ProtocolError::MalformedHeaderLine(desc.clone()))
        })?;
        return Ok((code, state_desc(code).to_owned()));
    }
    Ok((0, state_desc(0).to_owned()))
}

fn init_channel_state(name: String, headers: &Headers) -> Result<ChannelState, AmiError> {
    let (code, desc) = resolve_state(headers)?;
    let mut params = headers.clone();
    params.insert("channelstate".to_owned(), code.to_string());
    params.insert("channelstatedesc".to_owned(), desc);
    Ok(ChannelState {
        name,
        params,
        state: code,
        caller_id: caller_id_from_headers(headers),
        variables: HashMap::new(),
        extensions: Vec::new(),
        linked_to: None,
        pending_agi: HashMap::new(),
        channel_handler: None,
        async_agi_handler: None,
    })
}

/// The live population of tracked channels, keyed by current name.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, ChannelRef>,
}
impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<ChannelRef> {
        self.channels.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Handle `Newchannel`: create and register a channel under `headers["channel"]`.
    pub fn new_channel(&mut self, headers: &Headers) -> Result<ChannelRef, AmiError> {
        let name = headers
            .get("channel")
            .cloned()
            .ok_or_else(|| AmiError::Protocol(crate::message::ProtocolError::BadMessage))?;
        let state = init_channel_state(name.clone(), headers)?;
        let channel = ChannelRef::new(state);
        self.channels.insert(name, channel.clone());
        Ok(channel)
    }

    pub async fn apply_newstate(&self, name: &str, headers: &Headers) -> Result<(), AmiError> {
        let channel = self.require(name)?;
        let (code, desc) = resolve_state(headers)?;
        channel.with_mut(|c| {
            c.state = code;
            c.params.insert("channelstate".to_owned(), code.to_string());
            c.params.insert("channelstatedesc".to_owned(), desc.clone());
        });
        if let Some(handler) = channel.with(|c| c.channel_handler.clone()) {
            handler.new_state(code, &desc).await;
        }
        Ok(())
    }

    pub async fn apply_new_caller_id(&self, name: &str, headers: &Headers) -> Result<(), AmiError> {
        let channel = self.require(name)?;
        let (number, cid_name) = caller_id_from_headers(headers);
        channel.with_mut(|c| c.caller_id = (number.clone(), cid_name.clone()));
        if let Some(handler) = channel.with(|c| c.channel_handler.clone()) {
            handler
                .new_caller_id(number.as_deref(), cid_name.as_deref())
                .await;
        }
        Ok(())
    }

    pub async fn apply_var_set(&self, name: &str, headers: &Headers) -> Result<(), AmiError> {
        let channel = self.require(name)?;
        let variable = headers
            .get("variable")
            .cloned()
            .ok_or(AmiError::Protocol(crate::message::ProtocolError::BadMessage))?;
        let value = headers.get("value").cloned().unwrap_or_default();
        channel.with_mut(|c| {
            c.variables.insert(variable.clone(), value.clone());
        });
        if let Some(handler) = channel.with(|c| c.channel_handler.clone()) {
            handler.variable_set(&variable, &value).await;
        }
        Ok(())
    }

    pub async fn apply_newexten(&self, name: &str, headers: &Headers) -> Result<(), AmiError> {
        let channel = self.require(name)?;
        let entry = ExtensionEntry {
            context: headers.get("context").cloned().unwrap_or_default(),
            extension: headers.get("extension").cloned().unwrap_or_default(),
            priority: headers
                .get("priority")
                .and_then(|p| p.parse().ok())
                .unwrap_or_default(),
            application: headers.get("application").cloned().unwrap_or_default(),
            app_data: headers.get("appdata").cloned().unwrap_or_default(),
        };
        channel.with_mut(|c| c.extensions.push(entry.clone()));
        if let Some(handler) = channel.with(|c| c.channel_handler.clone()) {
            handler
                .extension_entered(
                    &entry.context,
                    &entry.extension,
                    entry.priority,
                    &entry.application,
                    &entry.app_data,
                )
                .await;
        }
        Ok(())
    }

    pub async fn apply_rename(&mut self, headers: &Headers) -> Result<(), AmiError> {
        let old_name = headers
            .get("oldname")
            .or_else(|| headers.get("channel"))
            .cloned()
            .ok_or(AmiError::Protocol(crate::message::ProtocolError::BadMessage))?;
        let new_name = headers
            .get("newname")
            .cloned()
            .ok_or(AmiError::Protocol(crate::message::ProtocolError::BadMessage))?;
        let channel = self
            .channels
            .remove(&old_name)
            .ok_or_else(|| AmiError::UnknownChannel(old_name.clone()))?;
        channel.with_mut(|c| c.name = new_name.clone());
        self.channels.insert(new_name.clone(), channel.clone());
        if let Some(handler) = channel.with(|c| c.channel_handler.clone()) {
            handler.renamed(&old_name, &new_name).await;
        }
        Ok(())
    }

    pub async fn apply_link(&self, headers: &Headers) -> Result<(), AmiError> {
        let (a, b) = self.link_pair(headers)?;
        for (this_name, other_name) in [(&a, &b), (&b, &a)] {
            let channel = self.require(this_name)?;
            let already_linked = channel.with(|c| c.linked_to.is_some());
            if already_linked {
                return Err(AmiError::AlreadyLinked(this_name.clone()));
            }
            let peer = self.require(other_name)?;
            channel.with_mut(|c| c.linked_to = Some(other_name.clone()));
            if let Some(handler) = channel.with(|c| c.channel_handler.clone()) {
                handler.linked(peer).await;
            }
        }
        Ok(())
    }

    pub async fn apply_unlink(&self, headers: &Headers) -> Result<(), AmiError> {
        let (a, b) = self.link_pair(headers)?;
        for (this_name, other_name) in [(&a, &b), (&b, &a)] {
            let channel = self.require(this_name)?;
            let linked_to = channel.with(|c| c.linked_to.clone());
            match linked_to {
                Some(peer_name) if &peer_name == other_name => {}
                _ => return Err(AmiError::NotLinked(this_name.clone(), other_name.clone())),
            }
            let peer = self.require(other_name)?;
            channel.with_mut(|c| c.linked_to = None);
            if let Some(handler) = channel.with(|c| c.channel_handler.clone()) {
                handler.unlinked(peer).await;
            }
        }
        Ok(())
    }

    fn link_pair(&self, headers: &Headers) -> Result<(String, String), AmiError> {
        let a = headers
            .get("channel1")
            .cloned()
            .ok_or(AmiError::Protocol(crate::message::ProtocolError::BadMessage))?;
        let b = headers
            .get("channel2")
            .cloned()
            .ok_or(AmiError::Protocol(crate::message::ProtocolError::BadMessage))?;
        Ok((a, b))
    }

    pub async fn apply_dial(&self, name: &str, headers: &Headers) -> Result<(), AmiError> {
        let channel = self.require(name)?;
        let sub_event = headers
            .get("subevent")
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_else(|| "begin".to_owned());
        let handler = channel.with(|c| c.channel_handler.clone());
        match sub_event.as_str() {
            "begin" => {
                let destination = headers.get("destination").cloned().unwrap_or_default();
                let dial_string = headers.get("dialstring").cloned();
                if let Some(handler) = handler {
                    handler.dial_begun(&destination, dial_string.as_deref()).await;
                }
            }
            "end" => {
                let dial_status = headers.get("dialstatus").cloned();
                if let Some(handler) = handler {
                    handler.dial_ended(dial_status.as_deref()).await;
                }
            }
            other => {
                return Err(AmiError::Protocol(crate::message::ProtocolError::MalformedHeaderLine(
                    other.to_owned(),
                )))
            }
        }
        Ok(())
    }

    /// Handle `Hangup`: invoke the hook, proactively clear a linked peer's `linked_to`, then
    /// remove the channel. No subsequent event may reach it.
    pub async fn apply_hangup(&mut self, name: &str, headers: &Headers) -> Result<(), AmiError> {
        let channel = self.require(name)?;
        let cause: i32 = headers.get("cause").and_then(|c| c.parse().ok()).unwrap_or(0);
        let cause_text = headers.get("cause-txt").cloned().unwrap_or_default();
        if let Some(handler) = channel.with(|c| c.channel_handler.clone()) {
            handler.hung_up(cause, &cause_text).await;
        }
        let peer_name = channel.with(|c| c.linked_to.clone());
        if let Some(peer_name) = peer_name {
            if let Some(peer) = self.channels.get(&peer_name) {
                peer.with_mut(|c| c.linked_to = None);
            }
        }
        self.channels.remove(name);
        Ok(())
    }

    /// All currently tracked channels, for connection-wide teardown.
    pub fn channels(&self) -> impl Iterator<Item = &ChannelRef> {
        self.channels.values()
    }

    fn require(&self, name: &str) -> Result<ChannelRef, AmiError> {
        self.channels
            .get(name)
            .cloned()
            .ok_or_else(|| AmiError::UnknownChannel(name.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn state_table_round_trips() {
        assert_eq!(state_desc(0), "Down");
        assert_eq!(state_from_desc("down"), Some(0));
        assert_eq!(state_from_desc("Pre-ring"), Some(9));
        assert_eq!(state_from_desc("nonsense"), None);
    }

    #[test]
    fn new_channel_modern_dialect() {
        let mut registry = ChannelRegistry::new();
        let h = headers(&[
            ("channel", "Foo/202-0"),
            ("channelstate", "0"),
            ("channelstatedesc", "Down"),
            ("calleridnum", "202"),
            ("calleridname", "Foo"),
        ]);
        registry.new_channel(&h).unwrap();
        assert_eq!(registry.len(), 1);
        let channel = registry.get("Foo/202-0").unwrap();
        assert_eq!(
            channel.with(|c| (c.state, c.caller_id.clone())),
            (0, (Some("202".to_owned()), Some("Foo".to_owned())))
        );
    }

    #[test]
    fn new_channel_legacy_dialect() {
        let mut registry = ChannelRegistry::new();
        let h = headers(&[
            ("channel", "Foo/202-0"),
            ("state", "Down"),
            ("callerid", "202"),
            ("calleridname", "Foo"),
        ]);
        let channel = registry.new_channel(&h).unwrap();
        let (state, desc) = channel.with(|c| (c.state, c.params.get("channelstatedesc").cloned()));
        assert_eq!(state, 0);
        assert_eq!(desc, Some("Down".to_owned()));
    }

    #[test]
    fn hangup_clears_peer_link() {
        let mut registry = ChannelRegistry::new();
        registry.new_channel(&headers(&[("channel", "A")])).unwrap();
        registry.new_channel(&headers(&[("channel", "B")])).unwrap();
        futures_block(registry.apply_link(&headers(&[("channel1", "A"), ("channel2", "B")])))
            .unwrap();
        futures_block(registry.apply_hangup("A", &headers(&[("cause", "16")]))).unwrap();
        assert_eq!(registry.len(), 1);
        let b = registry.get("B").unwrap();
        assert_eq!(b.with(|c| c.linked_to.clone()), None);
    }

    #[test]
    fn double_link_is_protocol_error() {
        let mut registry = ChannelRegistry::new();
        registry.new_channel(&headers(&[("channel", "A")])).unwrap();
        registry.new_channel(&headers(&[("channel", "B")])).unwrap();
        let link = headers(&[("channel1", "A"), ("channel2", "B")]);
        futures_block(registry.apply_link(&link)).unwrap();
        let err = futures_block(registry.apply_link(&link)).unwrap_err();
        assert!(matches!(err, AmiError::AlreadyLinked(_)));
    }

    #[test]
    fn unlink_from_wrong_peer_is_protocol_error() {
        let mut registry = ChannelRegistry::new();
        registry.new_channel(&headers(&[("channel", "A")])).unwrap();
        registry.new_channel(&headers(&[("channel", "B")])).unwrap();
        registry.new_channel(&headers(&[("channel", "C")])).unwrap();
        futures_block(registry.apply_link(&headers(&[("channel1", "A"), ("channel2", "B")])))
            .unwrap();
        let err = futures_block(
            registry.apply_unlink(&headers(&[("channel1", "A"), ("channel2", "C")])),
        )
        .unwrap_err();
        assert!(matches!(err, AmiError::NotLinked(_, _)));
    }

    #[test]
    fn rename_preserves_identity() {
        let mut registry = ChannelRegistry::new();
        registry.new_channel(&headers(&[("channel", "A")])).unwrap();
        futures_block(registry.apply_rename(&headers(&[("oldname", "A"), ("newname", "B")])))
            .unwrap();
        assert!(registry.get("A").is_none());
        assert!(registry.get("B").is_some());
    }

    /// A tiny blocking executor for colocated unit tests so they can exercise `async fn`
    /// registry methods without pulling in `#[tokio::test]` for simple, non-timing-sensitive
    /// assertions.
    fn futures_block<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }
}
