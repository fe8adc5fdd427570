// Input events forwarded into the overlay and their capture acknowledgments.

use log::{debug, warn};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

use super::surface::SurfaceId;
use crate::error::{BridgeError, BridgeResult};

/// Platform input descriptor. Fields other than the type and coordinates
/// pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none", serialize_with = "coordinate")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none", serialize_with = "coordinate")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none", serialize_with = "coordinate")]
    pub global_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none", serialize_with = "coordinate")]
    pub global_y: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InputEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            x: None,
            y: None,
            global_x: None,
            global_y: None,
            extra: Map::new(),
        }
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.x = Some(x);
        self.y = Some(y);
        self
    }

    pub fn at_global(mut self, global_x: f64, global_y: f64) -> Self {
        self.global_x = Some(global_x);
        self.global_y = Some(global_y);
        self
    }

    /// Wheel events arrive with the target's client origin folded into the
    /// local coordinates; shift them back by the local/global offset.
    pub fn correct_wheel_coordinates(&mut self) {
        if let (Some(x), Some(global_x)) = (self.x, self.global_x) {
            self.x = Some(x - (global_x - x));
        }
        if let (Some(y), Some(global_y)) = (self.y, self.global_y) {
            self.y = Some(y - (global_y - y));
        }
    }
}

/// Whole coordinates go back out as JSON integers, the way targets send them.
fn coordinate<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
    const EXACT_INTEGER: f64 = 9_007_199_254_740_992.0; // 2^53
    match *value {
        Some(v) if v.fract() == 0.0 && v.abs() < EXACT_INTEGER => serializer.serialize_some(&(v as i64)),
        Some(v) => serializer.serialize_some(&v),
        None => serializer.serialize_none(),
    }
}

/// Correlates one forwarded event with its capture report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputAckToken {
    pub surface_id: SurfaceId,
    pub sequence: u64,
}

#[derive(Default)]
struct AckState {
    next_sequence: u64,
    waiting: HashMap<InputAckToken, oneshot::Sender<bool>>,
}

/// Outstanding input acknowledgments, one per forwarded event.
#[derive(Default)]
pub struct InputAcks {
    state: Mutex<AckState>,
}

impl InputAcks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, AckState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn issue(self: &Arc<Self>, surface_id: SurfaceId) -> PendingAck {
        let (sender, receiver) = oneshot::channel();
        let token = {
            let mut state = self.state();
            state.next_sequence += 1;
            let token = InputAckToken {
                surface_id,
                sequence: state.next_sequence,
            };
            state.waiting.insert(token, sender);
            token
        };

        PendingAck {
            acks: Arc::clone(self),
            token,
            receiver: Some(receiver),
        }
    }

    /// Deliver the capture decision for `token`. Returns false for unknown,
    /// expired or already resolved tokens.
    pub fn resolve(&self, token: InputAckToken, captured: bool) -> bool {
        let Some(sender) = self.state().waiting.remove(&token) else {
            warn!("[INPUT] Ack for unknown token {:?}", token);
            return false;
        };
        sender.send(captured).is_ok()
    }

    /// Abandon every ack still waiting on `surface_id`.
    pub fn cancel_surface(&self, surface_id: SurfaceId) -> usize {
        let mut state = self.state();
        let before = state.waiting.len();
        state.waiting.retain(|token, _| token.surface_id != surface_id);
        let cancelled = before - state.waiting.len();
        if cancelled > 0 {
            debug!("[INPUT] Cancelled {} acks for surface {}", cancelled, surface_id);
        }
        cancelled
    }

    pub fn cancel_all(&self) -> usize {
        let mut state = self.state();
        let cancelled = state.waiting.len();
        state.waiting.clear();
        cancelled
    }

    pub fn outstanding(&self) -> usize {
        self.state().waiting.len()
    }

    fn forget(&self, token: InputAckToken) {
        self.state().waiting.remove(&token);
    }
}

/// Waiter for one acknowledgment. Dropping it discards the token.
pub struct PendingAck {
    acks: Arc<InputAcks>,
    token: InputAckToken,
    receiver: Option<oneshot::Receiver<bool>>,
}

impl PendingAck {
    pub fn token(&self) -> InputAckToken {
        self.token
    }

    pub async fn wait(mut self, timeout: Option<Duration>) -> BridgeResult<bool> {
        let receiver = self
            .receiver
            .take()
            .ok_or_else(|| BridgeError::ProtocolViolation("ack already awaited".into()))?;

        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, receiver).await.map_err(|_| {
                warn!("[INPUT] No ack for {:?} within {:?}", self.token, limit);
                BridgeError::RpcTimeout {
                    method: "input acknowledgment".into(),
                    timeout_ms: limit.as_millis() as u64,
                }
            })?,
            None => receiver.await,
        };

        outcome.map_err(|_| {
            BridgeError::HandleLifecycleViolation(format!(
                "surface {} went away before acknowledging input",
                self.token.surface_id
            ))
        })
    }
}

impl Drop for PendingAck {
    fn drop(&mut self) {
        self.acks.forget(self.token);
    }
}

/// Overlay-side "captured since last check" flag.
///
/// Set whenever an event is observed at capture phase; read and cleared by
/// each acknowledgment round.
#[derive(Debug, Default)]
pub struct InputCaptureTracker {
    captured: AtomicBool,
}

impl InputCaptureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_capture_phase(&self) {
        self.captured.store(true, Ordering::SeqCst);
    }

    pub fn acknowledge(&self) -> bool {
        self.captured.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wheel_correction() {
        let mut event = InputEvent::new("mouseWheel").at(100.0, 50.0).at_global(150.0, 80.0);
        event.correct_wheel_coordinates();
        assert_eq!(event.x, Some(50.0));
        assert_eq!(event.y, Some(20.0));
    }

    #[test]
    fn test_wheel_correction_needs_both_coordinates() {
        let mut event = InputEvent::new("mouseWheel").at(100.0, 50.0);
        event.correct_wheel_coordinates();
        assert_eq!(event.x, Some(100.0));
        assert_eq!(event.y, Some(50.0));
    }

    #[test]
    fn test_unknown_fields_survive() {
        let raw = json!({
            "type": "mouseWheel", "x": 3, "globalX": 9, "deltaY": -120, "modifiers": ["shift"]
        });
        let event: InputEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.kind, "mouseWheel");
        assert_eq!(event.global_x, Some(9.0));
        assert_eq!(event.extra["deltaY"], json!(-120));

        let back = serde_json::to_value(&event).unwrap();
        assert_eq!(back["modifiers"], json!(["shift"]));
        assert_eq!(back["globalX"], json!(9));
        assert!(back.get("y").is_none());
    }

    #[test]
    fn test_coordinates_keep_their_json_form() {
        let raw = json!({"type": "mouseMove", "x": 100, "y": 12.5, "globalX": -3, "globalY": 0});
        let event: InputEvent = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&event).unwrap(), raw);

        let mut wheel = InputEvent::new("mouseWheel").at(100.0, 50.0).at_global(150.0, 80.0);
        wheel.correct_wheel_coordinates();
        let sent = serde_json::to_value(&wheel).unwrap();
        assert_eq!(sent["x"], json!(50));
        assert_eq!(sent["y"], json!(20));
    }

    #[tokio::test]
    async fn test_ack_resolves_once() {
        let acks = InputAcks::new();
        let pending = acks.issue(4);
        let token = pending.token();
        assert_eq!(token.surface_id, 4);

        assert!(acks.resolve(token, true));
        assert!(!acks.resolve(token, false));
        assert!(pending.wait(Some(Duration::from_secs(1))).await.unwrap());
        assert_eq!(acks.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_ack_timeout_discards_token() {
        let acks = InputAcks::new();
        let pending = acks.issue(1);
        let token = pending.token();

        let err = pending.wait(Some(Duration::from_millis(10))).await.unwrap_err();
        assert!(matches!(err, BridgeError::RpcTimeout { .. }));
        assert_eq!(acks.outstanding(), 0);
        assert!(!acks.resolve(token, true));
    }

    #[tokio::test]
    async fn test_cancel_surface_only_hits_that_surface() {
        let acks = InputAcks::new();
        let old = acks.issue(1);
        let current = acks.issue(2);

        assert_eq!(acks.cancel_surface(1), 1);
        assert!(matches!(
            old.wait(None).await.unwrap_err(),
            BridgeError::HandleLifecycleViolation(_)
        ));

        let token = current.token();
        assert!(acks.resolve(token, false));
        assert!(!current.wait(None).await.unwrap());
    }

    #[test]
    fn test_dropped_waiter_releases_token() {
        let acks = InputAcks::new();
        drop(acks.issue(3));
        assert_eq!(acks.outstanding(), 0);
    }

    #[test]
    fn test_capture_flag_cleared_by_ack() {
        let tracker = InputCaptureTracker::new();
        assert!(!tracker.acknowledge());
        tracker.observe_capture_phase();
        tracker.observe_capture_phase();
        assert!(tracker.acknowledge());
        assert!(!tracker.acknowledge());
    }
}
