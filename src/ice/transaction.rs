use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::CheckError;
use crate::io::{StunMessage, TransId};
use crate::util::Pii;

/// Receives the response of a registered transaction.
pub type Waiter = oneshot::Receiver<StunMessage>;

struct Pending {
    tx: oneshot::Sender<StunMessage>,
    local: SocketAddr,
    remote: SocketAddr,
}

/// Correlates outgoing Binding Requests with their responses.
///
/// The map behind the lock is the only thing the sending and receiving
/// sides share. A response wakes exactly one waiter.
#[derive(Default)]
pub struct TransactionTracker {
    pending: Mutex<HashMap<TransId, Pending>>,
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transaction before its request is sent.
    pub fn add_transaction(
        &self,
        trans_id: TransId,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<Waiter, CheckError> {
        let mut pending = self.pending.lock();

        match pending.entry(trans_id) {
            Entry::Occupied(_) => Err(CheckError::DuplicateTransaction(trans_id)),
            Entry::Vacant(v) => {
                let (tx, rx) = oneshot::channel();
                v.insert(Pending { tx, local, remote });
                trace!("Add transaction {}", trans_id);
                Ok(rx)
            }
        }
    }

    /// Deliver a response from `source`.
    ///
    /// Returns false if nothing waits for it, or the response comes from
    /// another address than the request was sent to.
    pub fn on_response(&self, message: StunMessage, source: SocketAddr) -> bool {
        let trans_id = message.trans_id();
        let mut pending = self.pending.lock();

        let entry = match pending.entry(trans_id) {
            Entry::Occupied(e) => e,
            Entry::Vacant(_) => {
                debug!("No transaction for STUN response: {}", trans_id);
                return false;
            }
        };

        if entry.get().remote != source {
            // Responses must be symmetric to the request.
            debug!(
                "STUN response from unexpected source {}, expected {}",
                Pii(source),
                Pii(entry.get().remote)
            );
            return false;
        }

        let p = entry.remove();
        trace!("Resolve transaction {} sent from {}", trans_id, p.local);

        // The waiter might have given up just now.
        p.tx.send(message).is_ok()
    }

    /// Unregister a transaction.
    pub fn remove(&self, trans_id: TransId) -> bool {
        self.pending.lock().remove(&trans_id).is_some()
    }

    /// Number of transactions awaiting a response.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
