//! In-flight request table.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;

use super::ClientError;
use crate::protocol::CommandName;

/// Outcome delivered to a waiting call.
pub(crate) type Reply = Result<Value, ClientError>;

#[derive(Debug)]
struct Pending {
    command: CommandName,
    reply: oneshot::Sender<Reply>,
}

/// Pending calls keyed by request id. At most one live entry per id.
#[derive(Debug, Default)]
pub(crate) struct PendingRequests {
    inner: Mutex<HashMap<String, Pending>>,
}

impl PendingRequests {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `request_id`. Returns `None` if it is already live.
    pub(crate) fn insert(
        &self,
        request_id: &str,
        command: CommandName,
    ) -> Option<oneshot::Receiver<Reply>> {
        let mut pending = self.lock();
        if pending.contains_key(request_id) {
            return None;
        }
        let (reply, rx) = oneshot::channel();
        pending.insert(request_id.to_string(), Pending { command, reply });
        Some(rx)
    }

    /// Settles and removes `request_id`. Returns the command it was for, or
    /// `None` if nothing was waiting.
    pub(crate) fn resolve(&self, request_id: &str, reply: Reply) -> Option<CommandName> {
        let entry = self.lock().remove(request_id)?;
        // The caller may have given up between lookup and send.
        let _ = entry.reply.send(reply);
        Some(entry.command)
    }

    /// Forgets `request_id` without settling it.
    pub(crate) fn remove(&self, request_id: &str) -> bool {
        self.lock().remove(request_id).is_some()
    }

    /// Rejects every live entry with `error`. Returns how many there were.
    pub(crate) fn fail_all(&self, error: &ClientError) -> usize {
        let drained: Vec<Pending> = self.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.reply.send(Err(error.clone()));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}
