//! Outbound actions and the table that correlates their responses back to the caller.
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::AmiError;
use crate::message::{serialize_fields, Headers, ResponseKind};

/// An outbound action's field list, in the order it should be serialized. Order is never
/// semantically significant and no test may depend on it.
pub type ActionFields = Vec<(String, String)>;

/// A write-once result slot returned to the caller of an action (or an AsyncAGI command, or an
/// async origination). Wraps a `tokio::sync::oneshot::Receiver` so callers `.await` it directly
/// without depending on `tokio::sync` themselves.
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T, AmiError>>,
}
impl<T> Future for Pending<T> {
    type Output = Result<T, AmiError>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(AmiError::Disconnected)),
            Poll::Pending => Poll::Pending,
        }
    }
}
impl<T> Pending<T> {
    fn new() -> (oneshot::Sender<Result<T, AmiError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Wrap an already-created receiver. Used by callers that need to hand out the paired
    /// `oneshot::Sender` themselves (two-stage flows, per-channel AGI completions).
    pub(crate) fn from_receiver(rx: oneshot::Receiver<Result<T, AmiError>>) -> Self {
        Self { rx }
    }
}

/// Tracks outstanding actions by their `ActionID`, resolving or rejecting each one when its
/// `Response` message arrives.
#[derive(Debug, Default)]
pub struct ActionCorrelator {
    pending: HashMap<String, oneshot::Sender<Result<(Headers, Option<String>), AmiError>>>,
}
impl ActionCorrelator {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Assign an `ActionID` (reusing one already present in `fields`), serialize the action, and
    /// register a pending completion for it.
    pub fn begin(
        &mut self,
        name: &str,
        mut fields: ActionFields,
    ) -> (String, Vec<u8>, Pending<(Headers, Option<String>)>) {
        let actionid = fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("actionid"))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if !fields.iter().any(|(k, _)| k.eq_ignore_ascii_case("actionid")) {
            fields.push(("ActionID".to_owned(), actionid.clone()));
        }
        fields.insert(0, ("Action".to_owned(), name.to_owned()));

        let wire = serialize_fields(fields.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let (sender, pending) = Pending::new();
        self.pending.insert(actionid.clone(), sender);
        (actionid, wire.into_bytes(), pending)
    }

    /// Resolve or reject the pending action named by `headers["actionid"]`.
    pub fn resolve(
        &mut self,
        kind: ResponseKind,
        mut headers: Headers,
        body: Option<String>,
    ) -> Result<(), AmiError> {
        let Some(actionid) = headers.remove("actionid") else {
            return Err(AmiError::Protocol(crate::message::ProtocolError::BadMessage));
        };
        let Some(sender) = self.pending.remove(&actionid) else {
            return Err(AmiError::UnknownActionId(actionid));
        };
        let result = match kind {
            ResponseKind::Success | ResponseKind::Follows => Ok((headers, body)),
            ResponseKind::Error => Err(AmiError::ActionFailed(headers)),
        };
        let _ = sender.send(result);
        Ok(())
    }

    /// Drop every outstanding sender. Each corresponding `Pending` resolves with
    /// [`AmiError::Disconnected`] on its own, via the dropped-sender recv error.
    pub fn disconnect(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
