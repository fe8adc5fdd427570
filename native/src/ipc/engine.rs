// JSON-RPC engine: one pump per channel, sequential handler dispatch and
// correlated outbound calls.

use futures::FutureExt;
use log::{debug, error, info, trace, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use super::pending::PendingRequests;
use super::pipe::{memory_pipe, PipeReader, PipeWriter};
use super::protocol::{decode_frame, Decoded, Frame, Inbound, Method, RpcError, RpcId, RpcMessage};
use crate::error::{BridgeError, BridgeResult};

pub type HandlerFuture = Pin<Box<dyn Future<Output = BridgeResult<Option<Value>>> + Send>>;
type MethodHandler = Arc<dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync>;

/// One inbound and one outbound pipe forming a full-duplex connection.
pub struct RpcChannel {
    pub inbound: PipeReader,
    pub outbound: PipeWriter,
}

impl RpcChannel {
    pub fn new(inbound: PipeReader, outbound: PipeWriter) -> Self {
        Self { inbound, outbound }
    }

    /// Two channels wired to each other in memory.
    pub fn memory_pair(capacity: usize) -> (RpcChannel, RpcChannel) {
        let (a_inbound, b_outbound) = memory_pipe(capacity);
        let (b_inbound, a_outbound) = memory_pipe(capacity);
        (
            RpcChannel::new(a_inbound, a_outbound),
            RpcChannel::new(b_inbound, b_outbound),
        )
    }
}

/// Read positional parameter `index`.
pub fn positional<T: DeserializeOwned>(params: &[Value], index: usize, name: &str) -> BridgeResult<T> {
    let value = params
        .get(index)
        .ok_or_else(|| BridgeError::InvalidParams(format!("missing parameter '{}'", name)))?;
    serde_json::from_value(value.clone())
        .map_err(|e| BridgeError::InvalidParams(format!("parameter '{}': {}", name, e)))
}

enum Dispatch {
    Single(Decoded),
    Batch(Vec<Decoded>),
    Reply(RpcMessage),
}

struct EngineShared {
    label: String,
    call_timeout: Option<Duration>,
    writer: Mutex<Option<PipeWriter>>,
    pending: PendingRequests,
    handlers: RwLock<HashMap<Method, MethodHandler>>,
    quit: watch::Sender<bool>,
    done: watch::Sender<bool>,
    dispatcher: StdMutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

/// JSON-RPC peer bound to one `RpcChannel`.
///
/// A reader task routes responses straight to the pending table and queues
/// requests for a single dispatcher task, so handlers run one at a time and
/// may themselves issue calls on the same channel. Cloning is cheap.
#[derive(Clone)]
pub struct RpcEngine {
    shared: Arc<EngineShared>,
}

impl RpcEngine {
    pub fn new(label: impl Into<String>, call_timeout: Option<Duration>) -> Self {
        let (quit, _) = watch::channel(false);
        let (done, _) = watch::channel(false);
        Self {
            shared: Arc::new(EngineShared {
                label: label.into(),
                call_timeout,
                writer: Mutex::new(None),
                pending: PendingRequests::new(),
                handlers: RwLock::new(HashMap::new()),
                quit,
                done,
                dispatcher: StdMutex::new(None),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Register the handler for `method`. A handler resolving to `None`
    /// produces no response frame, even for a request carrying an id.
    pub fn register_method<F, Fut>(&self, method: Method, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BridgeResult<Option<Value>>> + Send + 'static,
    {
        let handler: MethodHandler =
            Arc::new(move |params: Vec<Value>| -> HandlerFuture { Box::pin(handler(params)) });
        let mut handlers = self
            .shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.insert(method.clone(), handler).is_some() {
            debug!("[RPC] {} replaced handler for {}", self.shared.label, method);
        }
    }

    /// Attach the channel and spawn the pump and dispatcher tasks.
    pub async fn start(&self, channel: RpcChannel) -> BridgeResult<()> {
        if *self.shared.quit.borrow() {
            return Err(BridgeError::TransportClosed);
        }
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::ProtocolViolation(format!(
                "{} engine already started",
                self.shared.label
            )));
        }

        let RpcChannel { inbound, outbound } = channel;
        *self.shared.writer.lock().await = Some(outbound);

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&self.shared), dispatch_rx));
        *self
            .shared
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(dispatcher);

        tokio::spawn(pump_loop(Arc::clone(&self.shared), inbound, dispatch_tx));
        info!("[RPC] {} engine started", self.shared.label);
        Ok(())
    }

    /// Call `method` with the engine's default deadline.
    pub async fn call(&self, method: Method, params: Vec<Value>) -> BridgeResult<Value> {
        self.call_with_timeout(method, params, self.shared.call_timeout)
            .await
    }

    /// Call `method` and wait for its response. `None` waits indefinitely.
    pub async fn call_with_timeout(
        &self,
        method: Method,
        params: Vec<Value>,
        timeout: Option<Duration>,
    ) -> BridgeResult<Value> {
        let (id, receiver) = self.shared.pending.register(&method)?;
        let _guard = CancelOnDrop {
            pending: &self.shared.pending,
            id,
        };

        let request = RpcMessage::Request {
            method: method.clone(),
            params,
            id: RpcId::Number(id),
        };
        // The deadline covers the write as well as the response.
        let exchange = async {
            self.shared.write_frame(&Frame::Single(request)).await?;
            let outcome: BridgeResult<Value> = receiver
                .await
                .unwrap_or(Err(BridgeError::TransportClosed));
            outcome
        };

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, exchange).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        "[RPC] {} {} (id {}) timed out after {:?}",
                        self.shared.label, method, id, limit
                    );
                    Err(BridgeError::RpcTimeout {
                        method: method.to_string(),
                        timeout_ms: limit.as_millis() as u64,
                    })
                }
            },
            None => exchange.await,
        }
    }

    /// Send a notification; never waits for an answer.
    pub async fn notify(&self, method: Method, params: Vec<Value>) -> BridgeResult<()> {
        let message = RpcMessage::Notification { method, params };
        self.shared.write_frame(&Frame::Single(message)).await
    }

    /// Ask the pump to stop without waiting for it.
    pub fn quit(&self) {
        self.shared.quit.send_replace(true);
    }

    /// Stop the pump, fail outstanding calls and release both pipe ends.
    pub async fn close(&self) {
        self.quit();
        if !self.shared.started.load(Ordering::SeqCst) {
            self.shared.finish().await;
            return;
        }
        self.wait_closed().await;
    }

    pub async fn wait_closed(&self) {
        let mut done = self.shared.done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.done.borrow()
    }

    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }
}

struct CancelOnDrop<'a> {
    pending: &'a PendingRequests,
    id: i64,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(method) = self.pending.cancel(self.id) {
            debug!("[RPC] Abandoned {} (id {})", method, self.id);
        }
    }
}

/// Tears the writer down unless the write settles. A frame cut off halfway
/// leaves the stream unframed, so nothing more may follow it.
struct InFlightWrite<'a> {
    writer: &'a mut Option<PipeWriter>,
    quit: &'a watch::Sender<bool>,
    label: &'a str,
    settled: bool,
}

impl Drop for InFlightWrite<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(mut writer) = self.writer.take() {
            writer.close();
            debug!("[RPC] {} outbound pipe dropped mid-frame", self.label);
        }
        self.quit.send_replace(true);
    }
}

async fn quit_requested(quit: &mut watch::Receiver<bool>) {
    let _ = quit.wait_for(|quit| *quit).await;
}

impl EngineShared {
    async fn write_frame(&self, frame: &Frame) -> BridgeResult<()> {
        let text = frame.encode()?;
        let mut quit = self.quit.subscribe();
        if *quit.borrow() {
            return Err(BridgeError::TransportClosed);
        }

        let mut guard = self.writer.lock().await;
        let mut in_flight = InFlightWrite {
            writer: &mut *guard,
            quit: &self.quit,
            label: &self.label,
            settled: false,
        };
        let Some(writer) = in_flight.writer.as_mut() else {
            in_flight.settled = true;
            return Err(BridgeError::TransportClosed);
        };

        let result = tokio::select! {
            result = writer.write_message(&text) => result,
            _ = quit_requested(&mut quit) => Err(BridgeError::TransportClosed),
        };

        match &result {
            Ok(()) => trace!("[RPC] {} -> {}", self.label, text),
            Err(BridgeError::TransportClosed) => {}
            Err(e) => warn!("[RPC] {} write failed: {}", self.label, e),
        }
        // A closed transport leaves the guard unsettled so it tears down.
        in_flight.settled = !matches!(result, Err(BridgeError::TransportClosed));
        result
    }

    fn route(&self, text: &str, dispatch: &mpsc::UnboundedSender<Dispatch>) {
        trace!("[RPC] {} <- {}", self.label, text);

        let job = match decode_frame(text) {
            Err(invalid) => {
                warn!("[RPC] {} rejected frame: {}", self.label, invalid.error.message);
                Dispatch::Reply(RpcMessage::ErrorResponse {
                    error: invalid.error,
                    id: invalid.id,
                })
            }
            Ok(Inbound::Single(Ok(message))) if message.is_response() => {
                self.settle(message);
                return;
            }
            Ok(Inbound::Single(entry)) => Dispatch::Single(entry),
            Ok(Inbound::Batch(entries)) => {
                let mut work = Vec::with_capacity(entries.len());
                for entry in entries {
                    match entry {
                        Ok(message) if message.is_response() => self.settle(message),
                        other => work.push(other),
                    }
                }
                if work.is_empty() {
                    return;
                }
                Dispatch::Batch(work)
            }
        };

        if dispatch.send(job).is_err() {
            debug!("[RPC] {} dispatcher gone, dropping frame", self.label);
        }
    }

    fn settle(&self, message: RpcMessage) {
        match message {
            RpcMessage::Response { result, id } => {
                self.pending.complete(&id, Ok(result));
            }
            RpcMessage::ErrorResponse {
                error,
                id: Some(id),
            } => {
                self.pending.complete(&id, Err(BridgeError::from(error)));
            }
            RpcMessage::ErrorResponse { error, id: None } => {
                warn!(
                    "[RPC] {} peer reported uncorrelated error {}: {}",
                    self.label, error.code, error.message
                );
            }
            _ => {}
        }
    }

    async fn handle(&self, entry: Decoded) -> Option<RpcMessage> {
        let message = match entry {
            Ok(message) => message,
            Err(invalid) => {
                warn!("[RPC] {} invalid message: {}", self.label, invalid.error.message);
                return invalid.into_reply();
            }
        };

        let (method, params, id) = match message {
            RpcMessage::Request { method, params, id } => (method, params, Some(id)),
            RpcMessage::Notification { method, params } => (method, params, None),
            response => {
                self.settle(response);
                return None;
            }
        };

        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&method)
            .cloned();
        let Some(handler) = handler else {
            warn!("[RPC] {} no handler for {}", self.label, method);
            return id.map(|id| RpcMessage::error_reply(id, RpcError::method_not_found(method.as_str())));
        };

        debug!("[RPC] {} dispatching {} (id {:?})", self.label, method, id);
        let outcome = AssertUnwindSafe(async move { handler(params).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!("[RPC] {} handler for {} panicked", self.label, method);
                Err(BridgeError::Collaborator(format!("handler for {} panicked", method)))
            });
        match outcome {
            Ok(Some(result)) => id.map(|id| RpcMessage::Response { result, id }),
            Ok(None) => None,
            Err(e) => {
                warn!("[RPC] {} {} failed: {}", self.label, method, e);
                id.map(|id| RpcMessage::error_reply(id, RpcError::from(&e)))
            }
        }
    }

    async fn finish(&self) {
        self.quit.send_replace(true);

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = dispatcher {
            task.abort();
        }

        let failed = self.pending.fail_all();
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.close();
        }

        self.done.send_replace(true);
        info!(
            "[RPC] {} channel closed ({} pending calls failed)",
            self.label, failed
        );
    }
}

async fn pump_loop(
    shared: Arc<EngineShared>,
    mut reader: PipeReader,
    dispatch: mpsc::UnboundedSender<Dispatch>,
) {
    let mut quit = shared.quit.subscribe();

    loop {
        let text = tokio::select! {
            _ = quit_requested(&mut quit) => {
                debug!("[RPC] {} pump asked to quit", shared.label);
                break;
            }
            frame = reader.read_message() => match frame {
                Ok(text) => text,
                Err(BridgeError::TransportClosed) => {
                    info!("[RPC] {} peer closed the channel", shared.label);
                    break;
                }
                Err(e) => {
                    error!("[RPC] {} read failed: {}", shared.label, e);
                    break;
                }
            },
        };

        shared.route(&text, &dispatch);
    }

    reader.close();
    drop(dispatch);
    shared.finish().await;
}

async fn dispatch_loop(shared: Arc<EngineShared>, mut jobs: mpsc::UnboundedReceiver<Dispatch>) {
    while let Some(job) = jobs.recv().await {
        let frame = match job {
            Dispatch::Reply(message) => Some(Frame::Single(message)),
            Dispatch::Single(entry) => shared.handle(entry).await.map(Frame::Single),
            Dispatch::Batch(entries) => {
                let mut replies = Vec::with_capacity(entries.len());
                for entry in entries {
                    if let Some(reply) = shared.handle(entry).await {
                        replies.push(reply);
                    }
                }
                (!replies.is_empty()).then_some(Frame::Batch(replies))
            }
        };

        if let Some(frame) = frame {
            if let Err(e) = shared.write_frame(&frame).await {
                if e.is_transport_closed() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::codes;
    use serde_json::json;

    const CAPACITY: usize = 64 * 1024;

    /// A started engine plus the raw far ends of its pipes.
    async fn engine_with_raw_peer(label: &str) -> (RpcEngine, PipeReader, PipeWriter) {
        let (near_in, far_out) = memory_pipe(CAPACITY);
        let (far_in, near_out) = memory_pipe(CAPACITY);
        let engine = RpcEngine::new(label, None);
        engine
            .register_method(Method::ForwardKeyEvent, |params| async move {
                let event: Value = positional(&params, 0, "event")?;
                Ok(Some(json!(event["type"] == "keyDown")))
            });
        engine.register_method(Method::SurfaceDestroyed, |_| async { Ok(None) });
        engine.start(RpcChannel::new(near_in, near_out)).await.unwrap();
        (engine, far_in, far_out)
    }

    async fn read_json(reader: &mut PipeReader) -> Value {
        serde_json::from_str(&reader.read_message().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_call_between_engines() {
        let (a, b) = RpcChannel::memory_pair(CAPACITY);
        let server = RpcEngine::new("server", None);
        server.register_method(Method::GetServerReadHandle, |_| async { Ok(Some(json!(17))) });
        server.start(a).await.unwrap();

        let client = RpcEngine::new("client", Some(Duration::from_secs(5)));
        client.start(b).await.unwrap();

        let result = client.call(Method::GetServerReadHandle, vec![]).await.unwrap();
        assert_eq!(result, json!(17));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_notification_and_empty_result_produce_no_frame() {
        let (_engine, mut peer_in, mut peer_out) = engine_with_raw_peer("server").await;

        peer_out
            .write_message(r#"{"jsonrpc":"2.0","method":"ForwardKeyEvent","params":[{"type":"keyDown"}]}"#)
            .await
            .unwrap();
        peer_out
            .write_message(r#"{"jsonrpc":"2.0","method":"SurfaceDestroyed","params":[],"id":1}"#)
            .await
            .unwrap();
        peer_out
            .write_message(r#"{"jsonrpc":"2.0","method":"ForwardKeyEvent","params":[{"type":"keyUp"}],"id":2}"#)
            .await
            .unwrap();

        let reply = read_json(&mut peer_in).await;
        assert_eq!(reply, json!({"jsonrpc": "2.0", "result": false, "id": 2}));
    }

    #[tokio::test]
    async fn test_protocol_errors_are_contained() {
        let (_engine, mut peer_in, mut peer_out) = engine_with_raw_peer("server").await;

        peer_out
            .write_message(r#"{"jsonrpc":"2.0","method":"DrawSomething","id":"u"}"#)
            .await
            .unwrap();
        let reply = read_json(&mut peer_in).await;
        assert_eq!(reply["error"]["code"], json!(codes::METHOD_NOT_FOUND));
        assert_eq!(reply["id"], json!("u"));

        peer_out
            .write_message(r#"{"jsonrpc":"1.0","method":"ForwardKeyEvent","id":3}"#)
            .await
            .unwrap();
        let reply = read_json(&mut peer_in).await;
        assert_eq!(reply["error"]["code"], json!(codes::INVALID_REQUEST));
        assert_eq!(reply["id"], json!(3));

        peer_out
            .write_message(r#"{"jsonrpc":"2.0","method":"ForwardKeyEvent","params":[],"id":4}"#)
            .await
            .unwrap();
        let reply = read_json(&mut peer_in).await;
        assert_eq!(reply["error"]["code"], json!(codes::INVALID_PARAMS));

        peer_out.write_message("{oops").await.unwrap();
        let reply = read_json(&mut peer_in).await;
        assert_eq!(reply["error"]["code"], json!(codes::PARSE_ERROR));
        assert_eq!(reply["id"], Value::Null);

        // The pump is still alive.
        peer_out
            .write_message(r#"{"jsonrpc":"2.0","method":"ForwardKeyEvent","params":[{"type":"keyDown"}],"id":5}"#)
            .await
            .unwrap();
        let reply = read_json(&mut peer_in).await;
        assert_eq!(reply, json!({"jsonrpc": "2.0", "result": true, "id": 5}));
    }

    #[tokio::test]
    async fn test_batch_collects_every_response_in_order() {
        let (_engine, mut peer_in, mut peer_out) = engine_with_raw_peer("server").await;

        peer_out
            .write_message(
                r#"[
                    {"jsonrpc":"2.0","method":"ForwardKeyEvent","params":[{"type":"keyDown"}],"id":10},
                    {"jsonrpc":"2.0","method":"SurfaceDestroyed"},
                    {"jsonrpc":"2.0","method":"Missing","id":11},
                    {"jsonrpc":"2.0","method":"ForwardKeyEvent","params":[{"type":"char"}],"id":12}
                ]"#,
            )
            .await
            .unwrap();

        let reply = read_json(&mut peer_in).await;
        let replies = reply.as_array().unwrap();
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0]["id"], json!(10));
        assert_eq!(replies[0]["result"], json!(true));
        assert_eq!(replies[1]["id"], json!(11));
        assert_eq!(replies[1]["error"]["code"], json!(codes::METHOD_NOT_FOUND));
        assert_eq!(replies[2]["id"], json!(12));
        assert_eq!(replies[2]["result"], json!(false));

        // A batch of notifications gets nothing back; the next answer is for 13.
        peer_out
            .write_message(r#"[{"jsonrpc":"2.0","method":"SurfaceDestroyed"}]"#)
            .await
            .unwrap();
        peer_out
            .write_message(r#"{"jsonrpc":"2.0","method":"ForwardKeyEvent","params":[{"type":"keyDown"}],"id":13}"#)
            .await
            .unwrap();
        assert_eq!(read_json(&mut peer_in).await["id"], json!(13));
    }

    #[tokio::test]
    async fn test_call_times_out_and_forgets_id() {
        let (engine, mut peer_in, _peer_out) = engine_with_raw_peer("client").await;

        let err = engine
            .call_with_timeout(
                Method::SetMouseCursor,
                vec![json!("pointer")],
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::RpcTimeout { .. }));
        assert_eq!(engine.pending_calls(), 0);

        let request = read_json(&mut peer_in).await;
        assert_eq!(request["method"], json!("SetMouseCursor"));
        assert_eq!(request["params"], json!(["pointer"]));
    }

    #[tokio::test]
    async fn test_deadline_covers_write_to_stalled_peer() {
        let (near_in, _far_out) = memory_pipe(CAPACITY);
        // The peer never reads, so a frame larger than this never fits.
        let (_far_in, near_out) = memory_pipe(16);
        let engine = RpcEngine::new("client", None);
        engine.start(RpcChannel::new(near_in, near_out)).await.unwrap();

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            engine.call_with_timeout(
                Method::SetMouseCursor,
                vec![json!("pointer")],
                Some(Duration::from_millis(50)),
            ),
        )
        .await
        .expect("deadline did not cover the write");
        assert!(matches!(outcome, Err(BridgeError::RpcTimeout { .. })));
        assert_eq!(engine.pending_calls(), 0);

        // Half a frame is in the pipe; the channel cannot carry more.
        tokio::time::timeout(Duration::from_secs(2), engine.wait_closed())
            .await
            .unwrap();
        assert!(engine
            .notify(Method::SurfaceDestroyed, vec![])
            .await
            .unwrap_err()
            .is_transport_closed());
    }

    #[tokio::test]
    async fn test_panicking_handler_answers_internal_error() {
        let (engine, mut peer_in, mut peer_out) = engine_with_raw_peer("server").await;
        engine.register_method(Method::SetMouseCursor, |params| async move {
            if params.first() == Some(&json!("text")) {
                panic!("cursor backend exploded");
            }
            Ok(None)
        });

        peer_out
            .write_message(r#"{"jsonrpc":"2.0","method":"SetMouseCursor","params":["text"],"id":1}"#)
            .await
            .unwrap();
        let reply = read_json(&mut peer_in).await;
        assert_eq!(reply["id"], json!(1));
        assert_eq!(reply["error"]["code"], json!(codes::INTERNAL_ERROR));

        // The dispatcher survived.
        peer_out
            .write_message(r#"{"jsonrpc":"2.0","method":"ForwardKeyEvent","params":[{"type":"keyDown"}],"id":2}"#)
            .await
            .unwrap();
        let reply = read_json(&mut peer_in).await;
        assert_eq!(reply, json!({"jsonrpc": "2.0", "result": true, "id": 2}));
    }

    #[tokio::test]
    async fn test_remote_error_surfaces_to_caller() {
        let (engine, mut peer_in, mut peer_out) = engine_with_raw_peer("client").await;

        let call = tokio::spawn({
            let engine = engine.clone();
            async move { engine.call(Method::SetSharedTextureHandle, vec![json!(1)]).await }
        });

        let request = read_json(&mut peer_in).await;
        let reply = json!({
            "jsonrpc": "2.0",
            "error": {"code": -32001, "message": "no surface"},
            "id": request["id"],
        });
        peer_out.write_message(&reply.to_string()).await.unwrap();

        match call.await.unwrap().unwrap_err() {
            BridgeError::Remote { code, message } => {
                assert_eq!(code, -32001);
                assert_eq!(message, "no surface");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_resolves_outstanding_call() {
        let (engine, _peer_in, _peer_out) = engine_with_raw_peer("client").await;

        let call = tokio::spawn({
            let engine = engine.clone();
            async move { engine.call(Method::ForwardKeyEvent, vec![json!({})]).await }
        });
        while engine.pending_calls() == 0 {
            tokio::task::yield_now().await;
        }

        engine.close().await;
        assert!(call.await.unwrap().unwrap_err().is_transport_closed());
        assert!(engine.is_closed());
        assert!(engine
            .notify(Method::SurfaceDestroyed, vec![])
            .await
            .unwrap_err()
            .is_transport_closed());
    }

    #[tokio::test]
    async fn test_peer_hangup_resolves_outstanding_call() {
        let (engine, peer_in, peer_out) = engine_with_raw_peer("client").await;

        let call = tokio::spawn({
            let engine = engine.clone();
            async move { engine.call(Method::ForwardKeyEvent, vec![json!({})]).await }
        });
        while engine.pending_calls() == 0 {
            tokio::task::yield_now().await;
        }

        drop(peer_out);
        drop(peer_in);
        assert!(call.await.unwrap().unwrap_err().is_transport_closed());
        engine.wait_closed().await;
    }

    #[tokio::test]
    async fn test_handler_may_call_back_on_same_channel() {
        let (a, b) = RpcChannel::memory_pair(CAPACITY);
        let host = RpcEngine::new("host", Some(Duration::from_secs(5)));
        let target = RpcEngine::new("target", Some(Duration::from_secs(5)));

        target.register_method(Method::SetMouseCursor, |params| async move {
            let cursor: String = positional(&params, 0, "cursor")?;
            Ok(Some(json!(cursor == "text")))
        });

        let host_for_handler = host.clone();
        host.register_method(Method::ForwardPointerEvent, move |_| {
            let host = host_for_handler.clone();
            async move {
                let applied = host.call(Method::SetMouseCursor, vec![json!("text")]).await?;
                Ok(Some(applied))
            }
        });

        host.start(a).await.unwrap();
        target.start(b).await.unwrap();

        let result = target
            .call(Method::ForwardPointerEvent, vec![json!({"type": "mouseMove"})])
            .await
            .unwrap();
        assert_eq!(result, json!(true));
    }
}
