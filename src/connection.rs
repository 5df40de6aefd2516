//! `Connection` drives the whole pipeline for a single AMI session: bytes in, frames out,
//! dispatched to the channel registry, the action correlator, or the application's hooks.
//!
//! One logical task owns a `Connection`; `bytes_received` and the various `send_*`/`login_*`
//! methods are ordinary `&mut self` methods, so the borrow checker enforces "no two callbacks
//! run concurrently for one connection" without any internal locking. Multi-action flows
//! (`login_md5`, `originate_*`) never hold `&mut self` across a suspension point: each stage
//! sends its action and registers a plain callback keyed by `ActionID`, then returns control to
//! the caller immediately. The callback runs later, from inside `bytes_received`, where `&mut
//! self` is naturally available again.
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;
use uuid::Uuid;
#[cfg(feature = "tracing")]
use tracing::Level;

use crate::action::{ActionCorrelator, ActionFields, Pending};
use crate::asyncagi::{self, OriginationCompletion};
use crate::channel::{ChannelRef, ChannelRegistry};
use crate::config::ConnectionConfig;
use crate::error::AmiError;
use crate::event;
use crate::handler::ConnectionHandler;
use crate::message::{Frame, Headers, LineFramer, MessageAssembler, ProtocolError, ResponseKind};
use crate::transport::Transport;

type ActionOutcome = Result<(Headers, Option<String>), AmiError>;
type Continuation<T> = Box<dyn FnOnce(&mut Connection<T>, ActionOutcome) + Send>;

/// A single session with an Asterisk manager interface.
pub struct Connection<T: Transport> {
    config: ConnectionConfig,
    framer: LineFramer,
    assembler: MessageAssembler,
    correlator: ActionCorrelator,
    registry: ChannelRegistry,
    continuations: HashMap<String, Continuation<T>>,
    pending_originations: HashMap<String, OriginationCompletion>,
    pending_originate_responses: HashMap<String, oneshot::Sender<Result<Headers, AmiError>>>,
    connection_handler: Arc<dyn ConnectionHandler>,
    transport: T,
    banner: Option<String>,
}
impl<T: Transport> Connection<T> {
    pub fn new(transport: T, connection_handler: Arc<dyn ConnectionHandler>, config: ConnectionConfig) -> Self {
        Self {
            framer: LineFramer::new(config.max_line_len),
            assembler: MessageAssembler::new(),
            correlator: ActionCorrelator::new(),
            registry: ChannelRegistry::new(),
            continuations: HashMap::new(),
            pending_originations: HashMap::new(),
            pending_originate_responses: HashMap::new(),
            connection_handler,
            transport,
            banner: None,
            config,
        }
    }

    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }
    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Feed newly-received bytes into the pipeline. Drives the framer, the message assembler,
    /// event dispatch, and action correlation; returns the first fault that the connection's
    /// [`ConnectionConfig`] classifies as connection-dropping.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, bytes), level = Level::TRACE))]
    pub async fn bytes_received(&mut self, bytes: &[u8]) -> Result<(), AmiError> {
        let lines = match self.framer.feed(bytes) {
            Ok(lines) => lines,
            Err(e) => return self.handle_fault(AmiError::Protocol(e)).await,
        };
        for line in lines {
            let frame = match self.assembler.push_line(line) {
                Ok(frame) => frame,
                Err(e) => {
                    self.handle_fault(AmiError::Protocol(e)).await?;
                    continue;
                }
            };
            let Some(frame) = frame else { continue };
            let result = match frame {
                Frame::Banner(banner) => {
                    self.banner = Some(banner.clone());
                    self.connection_handler.banner_received(&banner).await;
                    Ok(())
                }
                Frame::Event { name, headers } => self.dispatch_event(name, headers).await,
                Frame::Response { kind, headers, body } => self.dispatch_response(kind, headers, body),
            };
            if let Err(e) = result {
                self.handle_fault(e).await?;
            }
        }
        Ok(())
    }

    fn dispatch_response(&mut self, kind: ResponseKind, headers: Headers, body: Option<String>) -> Result<(), AmiError> {
        let actionid = headers.get("actionid").cloned();
        if let Some(actionid) = actionid.filter(|id| self.continuations.contains_key(id)) {
            let cont = self.continuations.remove(&actionid).expect("just checked contains_key");
            let mut headers = headers;
            headers.remove("actionid");
            let outcome = match kind {
                ResponseKind::Success | ResponseKind::Follows => Ok((headers, body)),
                ResponseKind::Error => Err(AmiError::ActionFailed(headers)),
            };
            cont(self, outcome);
            return Ok(());
        }
        self.correlator.resolve(kind, headers, body)
    }

    async fn handle_fault(&mut self, err: AmiError) -> Result<(), AmiError> {
        if self.config.is_non_drop(&err) {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %err, "non-fatal AMI error, connection stays open");
            Ok(())
        } else {
            #[cfg(feature = "tracing")]
            tracing::error!(error = %err, "fatal AMI error, closing connection");
            self.transport.close();
            self.disconnect();
            Err(err)
        }
    }

    /// Reject every in-flight pending (actions, AsyncAGI commands, async originations) with
    /// [`AmiError::Disconnected`] by dropping their completion senders.
    pub fn disconnect(&mut self) {
        self.correlator.disconnect();
        self.continuations.clear();
        self.pending_originations.clear();
        self.pending_originate_responses.clear();
        for channel in self.registry.channels() {
            channel.with_mut(|c| c.pending_agi.clear());
        }
    }

    async fn dispatch_event(&mut self, name: String, headers: Headers) -> Result<(), AmiError> {
        let lower = name.to_ascii_lowercase();

        if lower == "newchannel" {
            let channel = self.registry.new_channel(&headers)?;
            let cname = channel.name();
            self.connection_handler.new_channel(&cname, channel).await;
            return Ok(());
        }
        if lower == "asyncagi" {
            return self.dispatch_async_agi(&headers).await;
        }
        if lower == "originateresponse" {
            if let Some(actionid) = headers.get("actionid").cloned() {
                if let Some(sender) = self.pending_originate_responses.remove(&actionid) {
                    let success = headers
                        .get("response")
                        .map(|r| r.eq_ignore_ascii_case("success"))
                        .unwrap_or(false);
                    let result = if success {
                        Ok(headers.clone())
                    } else {
                        Err(AmiError::ActionFailed(headers.clone()))
                    };
                    let _ = sender.send(result);
                }
            }
            self.connection_handler.event(&name, &headers).await;
            return Ok(());
        }

        let names = event::routing_set(&name, &headers);
        let is_known_channel_event = matches!(
            lower.as_str(),
            "newstate" | "newcallerid" | "varset" | "newexten" | "rename" | "link" | "unlink" | "hangup" | "dial"
        );

        if is_known_channel_event && !names.is_empty() && names.iter().all(|n| self.registry.get(n).is_some()) {
            match lower.as_str() {
                "newstate" => self.registry.apply_newstate(&names[0], &headers).await?,
                "newcallerid" => self.registry.apply_new_caller_id(&names[0], &headers).await?,
                "varset" => self.registry.apply_var_set(&names[0], &headers).await?,
                "newexten" => self.registry.apply_newexten(&names[0], &headers).await?,
                "rename" => self.registry.apply_rename(&headers).await?,
                "hangup" => self.registry.apply_hangup(&names[0], &headers).await?,
                "link" => self.registry.apply_link(&headers).await?,
                "unlink" => self.registry.apply_unlink(&headers).await?,
                "dial" => self.registry.apply_dial(&names[0], &headers).await?,
                _ => unreachable!("matched above"),
            }
            return Ok(());
        }

        self.connection_handler.event(&name, &headers).await;
        Ok(())
    }

    async fn dispatch_async_agi(&mut self, headers: &Headers) -> Result<(), AmiError> {
        let channel_name = headers
            .get("channel")
            .cloned()
            .ok_or(AmiError::Protocol(ProtocolError::BadMessage))?;
        let sub_event = headers
            .get("subevent")
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_default();
        match sub_event.as_str() {
            "start" => {
                let channel = self
                    .registry
                    .get(&channel_name)
                    .ok_or_else(|| AmiError::UnknownChannel(channel_name.clone()))?;
                let env = headers
                    .get("env")
                    .map(|e| asyncagi::parse_env(e))
                    .unwrap_or_default();
                let async_orig_id = channel.with(|c| c.variables.get("AsyncOrigId").cloned());
                if let Some(orig_id) = async_orig_id {
                    if let Some(sender) = self.pending_originations.remove(&orig_id) {
                        let _ = sender.send(Ok((channel, env)));
                        return Ok(());
                    }
                }
                let context = headers.get("context").cloned().unwrap_or_default();
                let extension = headers.get("extension").cloned().unwrap_or_default();
                let priority: i32 = headers.get("priority").and_then(|p| p.parse().ok()).unwrap_or_default();
                let handler = channel.with(|c| c.async_agi_handler.clone());
                if let Some(handler) = handler {
                    handler.async_agi_started(&context, &extension, priority, &env).await;
                }
                Ok(())
            }
            "exec" => {
                let command_id = headers
                    .get("commandid")
                    .cloned()
                    .ok_or(AmiError::Protocol(ProtocolError::BadMessage))?;
                let channel = self
                    .registry
                    .get(&channel_name)
                    .ok_or_else(|| AmiError::UnknownChannel(channel_name.clone()))?;
                let sender = channel.with_mut(|c| c.pending_agi.remove(&command_id));
                let Some(sender) = sender else {
                    return Err(AmiError::UnknownAsyncAgiCommand(command_id));
                };
                let result_raw = headers.get("result").cloned().unwrap_or_default();
                let _ = sender.send(asyncagi::parse_exec_result(&result_raw));
                Ok(())
            }
            // `End` and anything else: ignored, matching the original's `event_asyncagi`,
            // which only branches on `Start`/`Exec` and does nothing otherwise.
            _ => Ok(()),
        }
    }

    /// Send a raw action. Most callers want a higher-level method (`login_md5`, `send_agi`,
    /// `originate_channel_exten_priority`); this is the escape hatch for everything else.
    pub fn send_action(&mut self, name: &str, fields: ActionFields) -> Pending<(Headers, Option<String>)> {
        let (_actionid, wire, pending) = self.correlator.begin(name, fields);
        self.transport.send_bytes(&wire);
        pending
    }

    /// Send an action and run `cont` against `self` once its response arrives, instead of
    /// resolving a `Pending`. Lets a multi-stage flow (`login_md5`) react to an intermediate
    /// response and send its next action without ever holding `&mut self` across an `.await`.
    fn send_action_with_continuation(
        &mut self,
        name: &str,
        mut fields: ActionFields,
        cont: impl FnOnce(&mut Connection<T>, ActionOutcome) + Send + 'static,
    ) -> String {
        let actionid = fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("actionid"))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if !fields.iter().any(|(k, _)| k.eq_ignore_ascii_case("actionid")) {
            fields.push(("ActionID".to_owned(), actionid.clone()));
        }
        fields.insert(0, ("Action".to_owned(), name.to_owned()));
        let wire = crate::message::serialize_fields(fields.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        self.continuations.insert(actionid.clone(), Box::new(cont));
        self.transport.send_bytes(wire.as_bytes());
        actionid
    }

    /// MD5 challenge-response login (§4.6). Sends `Challenge`, computes the response key once
    /// its answer arrives, then sends `Login` — all without blocking the connection in between.
    pub fn login_md5(&mut self, username: &str, secret: &str) -> Pending<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let username = username.to_owned();
        let secret = secret.to_owned();
        self.send_action_with_continuation(
            "Challenge",
            vec![("AuthType".to_owned(), "MD5".to_owned())],
            move |conn, result| {
                let challenge = match result.and_then(|(headers, _)| {
                    headers
                        .get("challenge")
                        .cloned()
                        .ok_or(AmiError::Protocol(ProtocolError::BadMessage))
                }) {
                    Ok(challenge) => challenge,
                    Err(e) => {
                        let _ = done_tx.send(Err(e));
                        return;
                    }
                };
                let mut ctx = md5::Context::new();
                ctx.consume(challenge.as_bytes());
                ctx.consume(secret.as_bytes());
                let key = format!("{:x}", ctx.compute());
                conn.send_action_with_continuation(
                    "Login",
                    vec![
                        ("AuthType".to_owned(), "MD5".to_owned()),
                        ("Username".to_owned(), username),
                        ("Key".to_owned(), key),
                    ],
                    move |_conn, result| {
                        let outcome = result.map(|_| ()).map_err(|e| match e {
                            AmiError::ActionFailed(_) => AmiError::AuthenticationFailed,
                            other => other,
                        });
                        let _ = done_tx.send(outcome);
                    },
                );
            },
        );
        Pending::from_receiver(done_rx)
    }

    /// Plaintext login. Not the challenge-response family this crate otherwise favors, but
    /// Asterisk's `Login` action has always accepted a plaintext `Secret` directly.
    pub fn login_plain(&mut self, username: &str, secret: &str) -> Pending<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send_action_with_continuation(
            "Login",
            vec![
                ("Username".to_owned(), username.to_owned()),
                ("Secret".to_owned(), secret.to_owned()),
            ],
            move |_conn, result| {
                let outcome = result.map(|_| ()).map_err(|e| match e {
                    AmiError::ActionFailed(_) => AmiError::AuthenticationFailed,
                    other => other,
                });
                let _ = done_tx.send(outcome);
            },
        );
        Pending::from_receiver(done_rx)
    }

    /// Place an outbound call (§4.7). The returned `Pending` resolves with the `OriginateResponse`
    /// event's headers, correlated by the `Originate` action's own `ActionID`. If the action
    /// itself is rejected at the queueing stage, the same `Pending` carries that failure.
    pub fn originate_channel_exten_priority(
        &mut self,
        channel: &str,
        context: &str,
        exten: &str,
        priority: i32,
        caller_id: Option<&str>,
    ) -> Pending<Headers> {
        let actionid = Uuid::new_v4().to_string();
        let (result_tx, result_rx) = oneshot::channel();
        self.pending_originate_responses.insert(actionid.clone(), result_tx);
        let mut fields = vec![
            ("ActionID".to_owned(), actionid.clone()),
            ("Channel".to_owned(), channel.to_owned()),
            ("Context".to_owned(), context.to_owned()),
            ("Exten".to_owned(), exten.to_owned()),
            ("Priority".to_owned(), priority.to_string()),
            ("Async".to_owned(), "true".to_owned()),
        ];
        if let Some(cid) = caller_id {
            fields.push(("CallerID".to_owned(), cid.to_owned()));
        }
        self.send_action_with_continuation("Originate", fields, move |conn, result| {
            if let Err(e) = result {
                if let Some(sender) = conn.pending_originate_responses.remove(&actionid) {
                    let _ = sender.send(Err(e));
                }
            }
        });
        Pending::from_receiver(result_rx)
    }

    /// Originate a call into an AsyncAGI session (§4.8). The returned `Pending` resolves once
    /// the newly-created channel's `AsyncAGI Start` sub-event arrives.
    pub fn originate_async_agi(&mut self, channel: &str, caller_id: Option<&str>) -> Pending<(ChannelRef, HashMap<String, String>)> {
        let orig_id = Uuid::new_v4().to_string();
        let (result_tx, result_rx) = oneshot::channel();
        self.pending_originations.insert(orig_id.clone(), result_tx);
        let mut fields = vec![
            ("Channel".to_owned(), channel.to_owned()),
            ("Application".to_owned(), "AGI".to_owned()),
            ("Data".to_owned(), "agi:async".to_owned()),
            ("Async".to_owned(), "true".to_owned()),
            ("Variable".to_owned(), format!("AsyncOrigId={orig_id}")),
        ];
        if let Some(cid) = caller_id {
            fields.push(("CallerID".to_owned(), cid.to_owned()));
        }
        self.send_action_with_continuation("Originate", fields, move |conn, result| {
            if let Err(e) = result {
                if let Some(sender) = conn.pending_originations.remove(&orig_id) {
                    let _ = sender.send(Err(e));
                }
            }
        });
        Pending::from_receiver(result_rx)
    }

    /// Issue an AGI command over an AsyncAGI channel (§4.8). The per-command completion is
    /// registered against the channel eagerly, before the queueing response is known, which is
    /// simpler than gating it on that response and differs only in the rare case where the `AGI`
    /// action itself is rejected — then the `Pending` simply never resolves until the connection
    /// (and with it, the channel's whole `pending_agi` map) is torn down.
    pub fn send_agi(&mut self, channel_name: &str, command: &str) -> Result<Pending<(i32, HashMap<String, String>)>, AmiError> {
        let channel = self
            .registry
            .get(channel_name)
            .ok_or_else(|| AmiError::UnknownChannel(channel_name.to_owned()))?;
        if channel.with(|c| c.pending_agi.len()) >= self.config.max_pending_agi_per_channel {
            return Err(AmiError::TooManyPendingAgiCommands(channel_name.to_owned()));
        }
        let commandid = Uuid::new_v4().to_string();
        let (result_tx, result_rx) = oneshot::channel();
        channel.with_mut(|c| c.pending_agi.insert(commandid.clone(), result_tx));
        let fields = vec![
            ("Channel".to_owned(), channel_name.to_owned()),
            ("Command".to_owned(), command.to_owned()),
            ("CommandID".to_owned(), commandid.clone()),
        ];
        self.send_action_with_continuation("AGI", fields, move |_conn, result| {
            if let Err(e) = result {
                if let Some(sender) = channel.with_mut(|c| c.pending_agi.remove(&commandid)) {
                    let _ = sender.send(Err(e));
                }
            }
        });
        Ok(Pending::from_receiver(result_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NoopConnectionHandler;
    use crate::transport::MemoryTransport;
    use std::sync::Mutex as StdMutex;

    fn connection() -> Connection<MemoryTransport> {
        Connection::new(
            MemoryTransport::new(),
            Arc::new(NoopConnectionHandler),
            ConnectionConfig::default(),
        )
    }

    #[tokio::test]
    async fn banner_then_event() {
        #[derive(Default)]
        struct Recorder(StdMutex<Vec<(String, Headers)>>);
        #[async_trait::async_trait]
        impl ConnectionHandler for Recorder {
            async fn event(&self, name: &str, headers: &Headers) {
                self.0.lock().unwrap().push((name.to_owned(), headers.clone()));
            }
        }
        let recorder = Arc::new(Recorder::default());
        let mut conn = Connection::new(MemoryTransport::new(), recorder.clone(), ConnectionConfig::default());
        conn.bytes_received(b"Asterisk Call Manager/1.3\r\n").await.unwrap();
        conn.bytes_received(b"Event: FullyBooted\r\nStatus: Fully Booted\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(conn.banner(), Some("Asterisk Call Manager/1.3"));
        let events = recorder.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "FullyBooted");
        assert_eq!(events[0].1.get("status"), Some(&"Fully Booted".to_owned()));
    }

    #[tokio::test]
    async fn md5_login_round_trip() {
        let mut conn = connection();
        conn.bytes_received(b"Asterisk Call Manager/1.3\r\n").await.unwrap();

        let login = conn.login_md5("u", "s");

        let sent = conn.transport.sent_str().to_owned();
        assert!(sent.contains("action: Challenge\r\n"));
        assert!(sent.contains("authtype: MD5\r\n"));
        let actionid = sent
            .lines()
            .find_map(|l| l.strip_prefix("actionid: "))
            .unwrap()
            .to_owned();
        conn.transport.take();

        conn.bytes_received(format!("Response: Success\r\nActionID: {actionid}\r\nChallenge: foo\r\n\r\n").as_bytes())
            .await
            .unwrap();

        let second_sent = conn.transport.sent_str().to_owned();
        assert!(second_sent.contains("action: Login\r\n"));
        let expected_key = format!("{:x}", md5::compute("foos"));
        assert!(second_sent.contains(&format!("key: {expected_key}\r\n")));
        let login_actionid = second_sent
            .lines()
            .find_map(|l| l.strip_prefix("actionid: "))
            .unwrap()
            .to_owned();

        conn.bytes_received(format!("Response: Success\r\nActionID: {login_actionid}\r\n\r\n").as_bytes())
            .await
            .unwrap();

        assert!(login.await.is_ok());
    }

    #[tokio::test]
    async fn md5_login_rejects_bad_credentials() {
        let mut conn = connection();
        conn.bytes_received(b"Asterisk Call Manager/1.3\r\n").await.unwrap();
        let login = conn.login_md5("u", "s");
        let sent = conn.transport.sent_str().to_owned();
        let actionid = sent.lines().find_map(|l| l.strip_prefix("actionid: ")).unwrap().to_owned();
        conn.transport.take();
        conn.bytes_received(format!("Response: Success\r\nActionID: {actionid}\r\nChallenge: foo\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let second_sent = conn.transport.sent_str().to_owned();
        let login_actionid = second_sent.lines().find_map(|l| l.strip_prefix("actionid: ")).unwrap().to_owned();
        conn.bytes_received(
            format!("Response: Error\r\nActionID: {login_actionid}\r\nMessage: Authentication failed\r\n\r\n").as_bytes(),
        )
        .await
        .unwrap();
        let err = login.await.unwrap_err();
        assert!(matches!(err, AmiError::AuthenticationFailed));
    }

    #[tokio::test]
    async fn channel_lifecycle_scenario() {
        let mut conn = connection();
        conn.bytes_received(b"Asterisk Call Manager/1.3\r\n").await.unwrap();
        conn.bytes_received(
            b"Event: Newchannel\r\nChannel: Foo/202-0\r\nChannelState: 0\r\nChannelStateDesc: Down\r\nCallerIDNum: 202\r\nCallerIDName: Foo\r\n\r\n",
        )
        .await
        .unwrap();
        assert_eq!(conn.registry().len(), 1);
        conn.bytes_received(b"Event: VarSet\r\nChannel: Foo/202-0\r\nVariable: X\r\nValue: Y\r\n\r\n")
            .await
            .unwrap();
        let channel = conn.registry().get("Foo/202-0").unwrap();
        assert_eq!(channel.with(|c| c.variables.get("X").cloned()), Some("Y".to_owned()));
        conn.bytes_received(b"Event: Hangup\r\nChannel: Foo/202-0\r\nCause: 16\r\nCause-Txt: Normal Clearing\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(conn.registry().len(), 0);
    }

    #[tokio::test]
    async fn legacy_dialect_newchannel() {
        let mut conn = connection();
        conn.bytes_received(b"Asterisk Call Manager/1.3\r\n").await.unwrap();
        conn.bytes_received(
            b"Event: Newchannel\r\nChannel: Foo/202-0\r\nState: Down\r\nCallerID: 202\r\nCallerIDName: Foo\r\n\r\n",
        )
        .await
        .unwrap();
        let channel = conn.registry().get("Foo/202-0").unwrap();
        let (state, caller_id) = channel.with(|c| (c.state, c.caller_id.clone()));
        assert_eq!(state, 0);
        assert_eq!(caller_id, (Some("202".to_owned()), Some("Foo".to_owned())));
    }

    #[tokio::test]
    async fn link_then_double_link_is_fatal() {
        let mut conn = connection();
        conn.bytes_received(b"Asterisk Call Manager/1.3\r\n").await.unwrap();
        conn.bytes_received(b"Event: Newchannel\r\nChannel: A\r\n\r\n").await.unwrap();
        conn.bytes_received(b"Event: Newchannel\r\nChannel: B\r\n\r\n").await.unwrap();
        conn.bytes_received(b"Event: Link\r\nChannel1: A\r\nChannel2: B\r\n\r\n")
            .await
            .unwrap();
        let a = conn.registry().get("A").unwrap();
        assert_eq!(a.with(|c| c.linked_to.clone()), Some("B".to_owned()));
        let err = conn
            .bytes_received(b"Event: Link\r\nChannel1: A\r\nChannel2: B\r\n\r\n")
            .await
            .unwrap_err();
        assert!(matches!(err, AmiError::AlreadyLinked(_)));
    }

    #[tokio::test]
    async fn originate_response_resolves_pending_by_actionid() {
        let mut conn = connection();
        conn.bytes_received(b"Asterisk Call Manager/1.3\r\n").await.unwrap();
        let pending = conn.originate_channel_exten_priority("SIP/1", "default", "100", 1, None);
        let sent = conn.transport.sent_str().to_owned();
        assert!(sent.contains("action: Originate\r\n"));
        let actionid = sent.lines().find_map(|l| l.strip_prefix("actionid: ")).unwrap().to_owned();
        conn.bytes_received(format!("Response: Success\r\nActionID: {actionid}\r\nMessage: Originate successfully queued\r\n\r\n").as_bytes())
            .await
            .unwrap();
        conn.bytes_received(
            format!("Event: OriginateResponse\r\nActionID: {actionid}\r\nResponse: Success\r\nChannel: SIP/1\r\n\r\n").as_bytes(),
        )
        .await
        .unwrap();
        let headers = pending.await.unwrap();
        assert_eq!(headers.get("channel"), Some(&"SIP/1".to_owned()));
    }

    #[tokio::test]
    async fn originate_queueing_failure_rejects_pending_directly() {
        let mut conn = connection();
        conn.bytes_received(b"Asterisk Call Manager/1.3\r\n").await.unwrap();
        let pending = conn.originate_channel_exten_priority("SIP/1", "default", "100", 1, None);
        let sent = conn.transport.sent_str().to_owned();
        let actionid = sent.lines().find_map(|l| l.strip_prefix("actionid: ")).unwrap().to_owned();
        conn.bytes_received(format!("Response: Error\r\nActionID: {actionid}\r\nMessage: Unable to create channel\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let err = pending.await.unwrap_err();
        assert!(matches!(err, AmiError::ActionFailed(_)));
    }

    #[tokio::test]
    async fn async_agi_round_trip() {
        let mut conn = connection();
        conn.bytes_received(b"Asterisk Call Manager/1.3\r\n").await.unwrap();
        let pending = conn.originate_async_agi("SIP/1", None);
        let sent = conn.transport.sent_str().to_owned();
        let orig_id = sent
            .lines()
            .find_map(|l| l.strip_prefix("variable: AsyncOrigId="))
            .unwrap()
            .to_owned();
        let actionid = sent.lines().find_map(|l| l.strip_prefix("actionid: ")).unwrap().to_owned();
        conn.bytes_received(format!("Response: Success\r\nActionID: {actionid}\r\nMessage: Originate successfully queued\r\n\r\n").as_bytes())
            .await
            .unwrap();
        conn.bytes_received(b"Event: Newchannel\r\nChannel: SIP/1-0\r\n\r\n").await.unwrap();
        let channel = conn.registry().get("SIP/1-0").unwrap();
        channel.with_mut(|c| {
            c.variables.insert("AsyncOrigId".to_owned(), orig_id.clone());
        });
        conn.bytes_received(
            format!(
                "Event: AsyncAGI\r\nSubEvent: Start\r\nChannel: SIP/1-0\r\nEnv: agi_context%3A%20default%0A\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();
        let (started_channel, env) = pending.await.unwrap();
        assert_eq!(started_channel.name(), "SIP/1-0");
        assert_eq!(env.get("agi_context"), Some(&"default".to_owned()));

        let agi_pending = conn.send_agi("SIP/1-0", "ANSWER").unwrap();
        let sent = conn.transport.sent_str().to_owned();
        let commandid = sent
            .lines()
            .find_map(|l| l.strip_prefix("commandid: "))
            .unwrap()
            .to_owned();
        conn.bytes_received(
            format!(
                "Event: AsyncAGI\r\nSubEvent: Exec\r\nChannel: SIP/1-0\r\nCommandID: {commandid}\r\nResult: 200%20result%3D0%0A\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();
        let (code, _vars) = agi_pending.await.unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn send_agi_rejects_once_channel_is_at_capacity() {
        let mut conn = Connection::new(
            MemoryTransport::new(),
            Arc::new(NoopConnectionHandler),
            ConnectionConfig {
                max_pending_agi_per_channel: 1,
                ..ConnectionConfig::default()
            },
        );
        conn.bytes_received(b"Asterisk Call Manager/1.3\r\n").await.unwrap();
        conn.bytes_received(b"Event: Newchannel\r\nChannel: SIP/1-0\r\n\r\n").await.unwrap();
        let _first = conn.send_agi("SIP/1-0", "ANSWER").unwrap();
        let err = conn.send_agi("SIP/1-0", "HANGUP").unwrap_err();
        assert!(matches!(err, AmiError::TooManyPendingAgiCommands(name) if name == "SIP/1-0"));
    }
}
