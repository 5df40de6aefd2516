//! Connection-wide knobs. Not a config-file loader: this is a handful of constructor
//! parameters with sensible defaults, not environment-parsed magic.
use std::collections::HashSet;

use crate::error::AmiErrorKind;

/// Tunables for a single [`crate::connection::Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum length, in bytes, of a single line before it is terminated by `\r\n`. Exceeding
    /// this is a protocol fault.
    pub max_line_len: usize,
    /// Error kinds that are logged and ignored rather than closing the connection.
    pub non_drop_errors: HashSet<AmiErrorKind>,
    /// Upper bound on the number of AsyncAGI commands a single channel may have outstanding at
    /// once. `send_agi` rejects with
    /// [`crate::error::AmiError::TooManyPendingAgiCommands`] once a channel is at this limit,
    /// rather than letting a buggy caller grow its `pending_agi` map unboundedly.
    pub max_pending_agi_per_channel: usize,
}
impl Default for ConnectionConfig {
    fn default() -> Self {
        let mut non_drop_errors = HashSet::new();
        non_drop_errors.insert(AmiErrorKind::UnknownActionId);
        non_drop_errors.insert(AmiErrorKind::UnknownAsyncAgiCommand);
        Self {
            max_line_len: 64 * 1024,
            non_drop_errors,
            max_pending_agi_per_channel: 64,
        }
    }
}
impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `error` should be logged and swallowed rather than closing the connection.
    pub fn is_non_drop(&self, error: &crate::error::AmiError) -> bool {
        self.non_drop_errors.contains(&error.kind())
    }
}
