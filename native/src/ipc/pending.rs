// Outstanding outbound requests keyed by correlation id.

use log::{debug, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::oneshot;

use super::protocol::{Method, RpcId};
use crate::error::{BridgeError, BridgeResult};

pub type CallOutcome = BridgeResult<Value>;

struct PendingCall {
    sender: oneshot::Sender<CallOutcome>,
    method: Method,
    created_at: Instant,
}

#[derive(Default)]
struct PendingState {
    next_id: i64,
    calls: HashMap<i64, PendingCall>,
    closed: bool,
}

/// Pending request table.
///
/// Flow:
/// 1. `register()` allocates the next id and a receiver
/// 2. the caller writes the request frame
/// 3. the pump calls `complete()` when the matching response arrives
/// 4. `cancel()` drops an entry whose caller timed out or went away
///
/// Once `fail_all()` has run the table refuses new registrations, so no call
/// can start after its channel is gone.
#[derive(Default)]
pub struct PendingRequests {
    state: Mutex<PendingState>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, method: &Method) -> BridgeResult<(i64, oneshot::Receiver<CallOutcome>)> {
        let mut state = self.state();
        if state.closed {
            return Err(BridgeError::TransportClosed);
        }

        state.next_id += 1;
        let id = state.next_id;
        let (sender, receiver) = oneshot::channel();
        state.calls.insert(
            id,
            PendingCall {
                sender,
                method: method.clone(),
                created_at: Instant::now(),
            },
        );
        Ok((id, receiver))
    }

    /// Resolve the call waiting on `id`. Returns false when nothing was
    /// waiting for it, which the caller reports as a protocol violation.
    pub fn complete(&self, id: &RpcId, outcome: CallOutcome) -> bool {
        let RpcId::Number(number) = id else {
            warn!("[RPC] Response for foreign id {} ignored", id);
            return false;
        };

        let Some(call) = self.state().calls.remove(number) else {
            warn!("[RPC] Response for unknown or expired id {}", id);
            return false;
        };

        debug!(
            "[RPC] {} (id {}) answered in {:?}",
            call.method,
            number,
            call.created_at.elapsed()
        );
        if call.sender.send(outcome).is_err() {
            debug!("[RPC] Caller for id {} went away before the response", number);
        }
        true
    }

    /// Drop the entry for `id` without resolving it.
    pub fn cancel(&self, id: i64) -> Option<Method> {
        self.state().calls.remove(&id).map(|call| call.method)
    }

    /// Fail every outstanding call with `TransportClosed` and refuse new ones.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<(i64, PendingCall)> = {
            let mut state = self.state();
            state.closed = true;
            state.calls.drain().collect()
        };

        let count = drained.len();
        for (id, call) in drained {
            debug!("[RPC] Failing {} (id {}): transport closed", call.method, id);
            let _ = call.sender.send(Err(BridgeError::TransportClosed));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.state().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_complete_resolves_matching_call_once() {
        let pending = PendingRequests::new();
        let (first, rx_first) = pending.register(&Method::GetServerReadHandle).unwrap();
        let (second, _rx_second) = pending.register(&Method::GetServerWriteHandle).unwrap();
        assert!(second > first);

        assert!(pending.complete(&RpcId::Number(first), Ok(json!(5))));
        assert!(!pending.complete(&RpcId::Number(first), Ok(json!(6))));
        assert_eq!(rx_first.await.unwrap().unwrap(), json!(5));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_unknown_ids_are_rejected() {
        let pending = PendingRequests::new();
        assert!(!pending.complete(&RpcId::Number(99), Ok(Value::Null)));
        assert!(!pending.complete(&RpcId::String("abc".into()), Ok(Value::Null)));
    }

    #[tokio::test]
    async fn test_fail_all_closes_table() {
        let pending = PendingRequests::new();
        let (_, rx) = pending.register(&Method::ForwardKeyEvent).unwrap();

        assert_eq!(pending.fail_all(), 1);
        assert!(rx.await.unwrap().unwrap_err().is_transport_closed());
        assert!(pending
            .register(&Method::ForwardKeyEvent)
            .unwrap_err()
            .is_transport_closed());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_cancel_removes_entry() {
        let pending = PendingRequests::new();
        let (id, _rx) = pending.register(&Method::SetMouseCursor).unwrap();
        assert_eq!(pending.cancel(id), Some(Method::SetMouseCursor));
        assert_eq!(pending.cancel(id), None);
    }
}
