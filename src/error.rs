//! Contains all the ways in which talking to an Asterisk Manager Interface can fail.
use crate::message::{Headers, ProtocolError};

/// Errors arising while driving a connection to the manager interface.
#[derive(Debug)]
pub enum AmiError {
    /// The underlying transport could not be read from or written to.
    Io(std::io::Error),
    /// A byte stream that did not conform to the AMI framing rules.
    Protocol(ProtocolError),
    /// Sending an Action failed because the connection has already shut down.
    Disconnected,
    /// An Action was sent, but the manager returned `Response: Error`.
    ActionFailed(Headers),
    /// An Action was sent with `Response: Follows` expected, but a plain response came back,
    /// or vice versa.
    UnexpectedResponseShape,
    /// Login was attempted, but the manager rejected the credentials.
    AuthenticationFailed,
    /// A Channel was referenced by name, but no such channel is currently tracked.
    UnknownChannel(String),
    /// An `Unlink` event named a channel pair that was not currently linked.
    NotLinked(String, String),
    /// A second `Link` event named a channel that is already linked to someone else.
    AlreadyLinked(String),
    /// A `Response` arrived whose `ActionID` does not match any pending action. Non-fatal; the
    /// connection stays open and this is only ever logged.
    UnknownActionId(String),
    /// AsyncAGI correlation failed: the `CommandID` on an `AsyncAGI Exec` event did not match
    /// any outstanding command. Non-fatal; the connection stays open and this is only ever
    /// logged.
    UnknownAsyncAgiCommand(String),
    /// An `AsyncAGI Exec` completion carried a non-200 result code.
    AsyncAgiCommandFailed(i32, String),
    /// `send_agi` was called against a channel that already has
    /// [`crate::config::ConnectionConfig::max_pending_agi_per_channel`] commands outstanding.
    TooManyPendingAgiCommands(String),
}
impl std::fmt::Display for AmiError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error talking to the manager: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Disconnected => write!(f, "the connection has already been closed"),
            Self::ActionFailed(headers) => write!(f, "action failed: {headers:?}"),
            Self::UnexpectedResponseShape => {
                write!(f, "response did not have the expected Success/Error/Follows shape")
            }
            Self::AuthenticationFailed => write!(f, "login was rejected by the manager"),
            Self::UnknownChannel(name) => write!(f, "no channel named {name:?} is tracked"),
            Self::NotLinked(a, b) => write!(f, "channels {a:?} and {b:?} were not linked"),
            Self::AlreadyLinked(name) => write!(f, "channel {name:?} is already linked"),
            Self::UnknownActionId(id) => {
                write!(f, "no pending action with ActionID {id:?}")
            }
            Self::UnknownAsyncAgiCommand(id) => {
                write!(f, "no pending AsyncAGI command with CommandID {id:?}")
            }
            Self::AsyncAgiCommandFailed(code, msg) => {
                write!(f, "AsyncAGI command failed ({code}): {msg}")
            }
            Self::TooManyPendingAgiCommands(name) => {
                write!(f, "channel {name:?} already has the maximum number of AsyncAGI commands outstanding")
            }
        }
    }
}
/// Discriminant-only view of [`AmiError`], used by [`crate::config::ConnectionConfig`] to decide
/// which error kinds are tolerated without dropping the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AmiErrorKind {
    Io,
    Protocol,
    Disconnected,
    ActionFailed,
    UnexpectedResponseShape,
    AuthenticationFailed,
    UnknownChannel,
    NotLinked,
    AlreadyLinked,
    UnknownActionId,
    UnknownAsyncAgiCommand,
    AsyncAgiCommandFailed,
    TooManyPendingAgiCommands,
}
impl AmiError {
    pub fn kind(&self) -> AmiErrorKind {
        match self {
            Self::Io(_) => AmiErrorKind::Io,
            Self::Protocol(_) => AmiErrorKind::Protocol,
            Self::Disconnected => AmiErrorKind::Disconnected,
            Self::ActionFailed(_) => AmiErrorKind::ActionFailed,
            Self::UnexpectedResponseShape => AmiErrorKind::UnexpectedResponseShape,
            Self::AuthenticationFailed => AmiErrorKind::AuthenticationFailed,
            Self::UnknownChannel(_) => AmiErrorKind::UnknownChannel,
            Self::NotLinked(_, _) => AmiErrorKind::NotLinked,
            Self::AlreadyLinked(_) => AmiErrorKind::AlreadyLinked,
            Self::UnknownActionId(_) => AmiErrorKind::UnknownActionId,
            Self::UnknownAsyncAgiCommand(_) => AmiErrorKind::UnknownAsyncAgiCommand,
            Self::AsyncAgiCommandFailed(_, _) => AmiErrorKind::AsyncAgiCommandFailed,
            Self::TooManyPendingAgiCommands(_) => AmiErrorKind::TooManyPendingAgiCommands,
        }
    }
}
impl std::error::Error for AmiError {}
impl From<std::io::Error> for AmiError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
impl From<ProtocolError> for AmiError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}
