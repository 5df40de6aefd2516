//! AsyncAGI: AGI command invocation multiplexed over the AMI event stream.
use std::collections::HashMap;

use percent_encoding::percent_decode_str;
use tokio::sync::oneshot;

use crate::channel::ChannelRef;
use crate::error::AmiError;

/// The completion slot a channel holds for one outstanding `AGI` action, keyed by `CommandID`.
pub type AgiCompletion = oneshot::Sender<Result<(i32, HashMap<String, String>), AmiError>>;

/// The completion slot a connection holds for one outstanding async origination, keyed by the
/// `AsyncOrigId` it injected as a channel variable.
pub type OriginationCompletion = oneshot::Sender<Result<(ChannelRef, HashMap<String, String>), AmiError>>;

/// The hook a channel's owner may install to observe an AsyncAGI session starting, for sessions
/// that were not the result of this connection's own `originate_async_agi` call.
#[async_trait::async_trait]
pub trait AsyncAgiHandler: Send + Sync {
    async fn async_agi_started(
        &self,
        _context: &str,
        _extension: &str,
        _priority: i32,
        _env: &HashMap<String, String>,
    ) {
    }
}

/// Percent-decode and parse an AsyncAGI `Start` sub-event's `env` header: newline-separated
/// `key: value` lines.
pub fn parse_env(raw: &str) -> HashMap<String, String> {
    let decoded = percent_decode_str(raw).decode_utf8_lossy();
    let mut env = HashMap::new();
    for line in decoded.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            env.insert(key.trim().to_owned(), value.trim_start().to_owned());
        }
    }
    env
}

/// Percent-decode and parse an AsyncAGI `Exec` sub-event's `result` header: `<code> k1=v1
/// k2=v2 ...`, one of which is `result=<int>`.
pub fn parse_exec_result(raw: &str) -> Result<(i32, HashMap<String, String>), AmiError> {
    let decoded = percent_decode_str(raw).decode_utf8_lossy();
    let decoded = decoded.trim();
    let (code_str, remainder) = decoded.split_once(' ').unwrap_or((decoded, ""));
    let code: i32 = code_str
        .parse()
        .map_err(|_| AmiError::Protocol(crate::message::ProtocolError::MalformedHeaderLine(decoded.to_owned())))?;
    if code != 200 {
        return Err(AmiError::AsyncAgiCommandFailed(code, remainder.to_owned()));
    }
    let mut pairs = HashMap::new();
    for token in remainder.split_whitespace() {
        if let Some((key, value)) = token.split_once('=') {
            pairs.insert(key.to_owned(), value.to_owned());
        }
    }
    let result = pairs
        .remove("result")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    Ok((result, pairs))
}
