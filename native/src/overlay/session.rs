// Host-side overlay session: serves the target's surface and input calls and
// drives the shared texture / overlay view pair.

use arc_swap::ArcSwapOption;
use log::{debug, info, trace, warn};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};

use super::input::{InputAckToken, InputAcks, InputEvent};
use super::surface::{
    DirtyRect, OverlaySurface, OverlayViewFactory, SharedSurfaceHandle, SharedTextureFactory,
    SurfaceId, SurfaceState,
};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::ipc::engine::{positional, RpcChannel, RpcEngine};
use crate::ipc::handshake::{ExchangeHandles, HostHandshake};
use crate::ipc::protocol::{AdapterLuid, HandleValue, Method};

enum OverlayEvent {
    Loaded(SurfaceId),
    CursorChanged(SurfaceId, String),
}

struct SinkShared {
    current: ArcSwapOption<SharedSurfaceHandle>,
    acks: Arc<InputAcks>,
    events: mpsc::UnboundedSender<OverlayEvent>,
}

/// Callbacks from an overlay view back into its session.
///
/// `paint` and `input_ack` complete synchronously on the calling thread;
/// `loaded` and `cursor_changed` are queued for the session task.
#[derive(Clone)]
pub struct OverlayEventSink {
    shared: Arc<SinkShared>,
}

impl OverlayEventSink {
    /// Copy a paint into the published texture. Returns `Ok(false)` when no
    /// texture is published for `surface_id`.
    pub fn paint(&self, surface_id: SurfaceId, dirty: DirtyRect, pixels: &[u8]) -> BridgeResult<bool> {
        match self.shared.current.load_full() {
            Some(surface) if surface.surface_id() == surface_id => {
                surface.copy_dirty(dirty, pixels)?;
                Ok(true)
            }
            _ => {
                trace!("[SURFACE] Paint for surface {} skipped, no valid texture", surface_id);
                Ok(false)
            }
        }
    }

    pub fn input_ack(&self, token: InputAckToken, captured: bool) -> bool {
        self.shared.acks.resolve(token, captured)
    }

    pub fn loaded(&self, surface_id: SurfaceId) {
        self.queue(OverlayEvent::Loaded(surface_id));
    }

    pub fn cursor_changed(&self, surface_id: SurfaceId, cursor: impl Into<String>) {
        self.queue(OverlayEvent::CursorChanged(surface_id, cursor.into()));
    }

    fn queue(&self, event: OverlayEvent) {
        if self.shared.events.send(event).is_err() {
            debug!("[SURFACE] Session gone, overlay event dropped");
        }
    }
}

struct LiveSurface {
    texture: Arc<SharedSurfaceHandle>,
    overlay: OverlaySurface,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputKind {
    Pointer,
    Wheel,
    Key,
}

/// Collaborators the session renders through.
#[derive(Clone)]
pub struct Collaborators {
    pub textures: Arc<dyn SharedTextureFactory>,
    pub views: Arc<dyn OverlayViewFactory>,
}

/// The host end of one host/target connection.
pub struct HostSession {
    server: RpcEngine,
    client: RpcEngine,
    collaborators: Collaborators,
    handshake: Arc<HostHandshake>,
    slot: Mutex<Option<LiveSurface>>,
    /// Texture offered to the target but not yet owned by a live surface.
    unconfirmed: ArcSwapOption<SharedSurfaceHandle>,
    sink: Arc<SinkShared>,
    next_surface_id: AtomicU32,
    ack_timeout: Option<Duration>,
    stopping: watch::Sender<bool>,
    stopped: watch::Sender<bool>,
}

impl HostSession {
    /// Register every host method, start both channels and the overlay event
    /// task. The session shuts itself down when either channel closes.
    pub async fn start(
        server_channel: RpcChannel,
        client_channel: RpcChannel,
        exchange: ExchangeHandles,
        config: &BridgeConfig,
        collaborators: Collaborators,
    ) -> BridgeResult<Arc<Self>> {
        let server = RpcEngine::new("host-server", config.call_timeout);
        let client = RpcEngine::new("host-client", config.call_timeout);
        let handshake = HostHandshake::install(&server, exchange);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let session = Arc::new(Self {
            server,
            client,
            collaborators,
            handshake,
            slot: Mutex::new(None),
            unconfirmed: ArcSwapOption::empty(),
            sink: Arc::new(SinkShared {
                current: ArcSwapOption::empty(),
                acks: InputAcks::new(),
                events: events_tx,
            }),
            next_surface_id: AtomicU32::new(0),
            ack_timeout: config.ack_timeout,
            stopping: watch::channel(false).0,
            stopped: watch::channel(false).0,
        });

        session.register_handlers();
        session.client.start(client_channel).await?;
        session.server.start(server_channel).await?;

        tokio::spawn(overlay_event_loop(
            Arc::downgrade(&session),
            events_rx,
            session.stopping.subscribe(),
        ));
        tokio::spawn(close_on_channel_loss(
            Arc::downgrade(&session),
            session.server.clone(),
            session.client.clone(),
        ));

        info!("[HOST] Session started");
        Ok(session)
    }

    fn register_handlers(self: &Arc<Self>) {
        self.route(Method::SurfaceCreated, |session, params| async move {
            session.on_surface_created(params).await.map(|()| None)
        });
        self.route(Method::SurfaceDestroyed, |session, _| async move {
            session.on_surface_destroyed().await.map(|()| None)
        });

        for (method, kind) in [
            (Method::ForwardPointerEvent, InputKind::Pointer),
            (Method::ForwardWheelEvent, InputKind::Wheel),
            (Method::ForwardKeyEvent, InputKind::Key),
        ] {
            self.route(method, move |session, params| async move {
                let captured = session.on_forward_input(kind, params).await?;
                Ok(Some(json!(captured)))
            });
        }
    }

    /// Register a server handler that reaches the session through a weak
    /// reference, so the engine does not keep the session alive.
    fn route<F, Fut>(self: &Arc<Self>, method: Method, handler: F)
    where
        F: Fn(Arc<Self>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BridgeResult<Option<Value>>> + Send + 'static,
    {
        let weak = Arc::downgrade(self);
        self.server.register_method(method, move |params| {
            let call = weak.upgrade().map(|session| handler(session, params));
            async move {
                match call {
                    Some(call) => call.await,
                    None => Err(BridgeError::TransportClosed),
                }
            }
        });
    }

    pub fn handshake(&self) -> &Arc<HostHandshake> {
        &self.handshake
    }

    pub fn server(&self) -> &RpcEngine {
        &self.server
    }

    pub fn client(&self) -> &RpcEngine {
        &self.client
    }

    /// Id and state of the live surface, if any.
    pub async fn surface_state(&self) -> Option<(SurfaceId, SurfaceState)> {
        self.slot
            .lock()
            .await
            .as_ref()
            .map(|live| (live.overlay.id(), live.overlay.state()))
    }

    /// Handle currently published to the target, if any.
    pub fn published_texture(&self) -> Option<HandleValue> {
        self.sink.current.load_full().map(|surface| surface.handle())
    }

    pub fn outstanding_input_acks(&self) -> usize {
        self.sink.acks.outstanding()
    }

    async fn on_surface_created(&self, params: Vec<Value>) -> BridgeResult<()> {
        let adapter: AdapterLuid = positional(&params, 0, "adapterLuid")?;
        let width: u32 = positional(&params, 1, "width")?;
        let height: u32 = positional(&params, 2, "height")?;
        if width < 1 || height < 1 {
            return Err(BridgeError::InvalidParams(
                "width and height must be at least 1".into(),
            ));
        }

        let mut slot = self.slot.lock().await;
        if let Some(live) = slot.as_ref() {
            return Err(BridgeError::HandleLifecycleViolation(format!(
                "surface {} is still live",
                live.overlay.id()
            )));
        }

        let surface_id = self.next_surface_id.fetch_add(1, Ordering::SeqCst) + 1;
        let texture = self
            .collaborators
            .textures
            .create_shared_texture(adapter, width, height)?;
        let texture = Arc::new(SharedSurfaceHandle::new(
            surface_id, adapter, width, height, texture,
        ));
        info!(
            "[SURFACE] Surface {} ({}x{} on adapter {}) publishing texture {}",
            surface_id,
            width,
            height,
            adapter,
            texture.handle()
        );

        // Shutdown withdraws this if the handler never reaches the end.
        self.unconfirmed.store(Some(Arc::clone(&texture)));
        if let Err(e) = self.publish(texture.handle()).await {
            warn!("[SURFACE] Target did not take texture {}: {}", texture.handle(), e);
            if !e.is_transport_closed() {
                let _ = self.publish(HandleValue::INVALID).await;
            }
            self.unconfirmed.store(None);
            return Err(e);
        }
        self.sink.current.store(Some(Arc::clone(&texture)));

        let events = OverlayEventSink {
            shared: Arc::clone(&self.sink),
        };
        let view = match self
            .collaborators
            .views
            .create_view(surface_id, width, height, events)
        {
            Ok(view) => view,
            Err(e) => {
                warn!("[SURFACE] Overlay view for surface {} failed: {}", surface_id, e);
                self.sink.current.store(None);
                let _ = self.publish(HandleValue::INVALID).await;
                self.unconfirmed.store(None);
                return Err(e);
            }
        };

        let mut overlay = OverlaySurface::new(surface_id);
        overlay.attach(view)?;
        *slot = Some(LiveSurface { texture, overlay });
        self.unconfirmed.store(None);
        Ok(())
    }

    async fn on_surface_destroyed(&self) -> BridgeResult<()> {
        let live = self.slot.lock().await.take();
        match live {
            Some(live) => self.teardown(live).await,
            None => {
                warn!("[SURFACE] SurfaceDestroyed with no live surface");
                Ok(())
            }
        }
    }

    /// Unpublish, then destroy the view, then release the texture.
    async fn teardown(&self, mut live: LiveSurface) -> BridgeResult<()> {
        let surface_id = live.overlay.id();
        self.sink.current.store(None);

        let unpublished = self.publish(HandleValue::INVALID).await;
        if let Err(e) = &unpublished {
            warn!(
                "[SURFACE] Could not withdraw texture of surface {}: {}",
                surface_id, e
            );
        }

        live.overlay.destroy();
        let cancelled = self.sink.acks.cancel_surface(surface_id);
        drop(live.texture);
        info!(
            "[SURFACE] Surface {} torn down ({} input acks abandoned)",
            surface_id, cancelled
        );
        unpublished
    }

    async fn publish(&self, handle: HandleValue) -> BridgeResult<()> {
        let ack = self
            .client
            .call(
                Method::SetSharedTextureHandle,
                vec![serde_json::to_value(handle)?],
            )
            .await?;
        if ack != Value::Bool(true) {
            debug!("[SURFACE] SetSharedTextureHandle({}) acknowledged with {}", handle, ack);
        }
        Ok(())
    }

    async fn on_forward_input(&self, kind: InputKind, params: Vec<Value>) -> BridgeResult<bool> {
        let mut event: InputEvent = positional(&params, 0, "event")?;

        let (surface_id, view) = {
            let slot = self.slot.lock().await;
            match slot.as_ref() {
                Some(live) if live.overlay.is_loaded() => (live.overlay.id(), live.overlay.view()?),
                _ => {
                    debug!("[INPUT] No loaded surface, {:?} event '{}' not forwarded", kind, event.kind);
                    return Ok(false);
                }
            }
        };

        if view.is_focusable() && !view.is_focused() {
            view.focus();
        }
        if kind == InputKind::Wheel {
            event.correct_wheel_coordinates();
        }
        view.send_input_event(&event)?;

        let pending = self.sink.acks.issue(surface_id);
        view.request_input_ack(pending.token())?;
        let captured = pending.wait(self.ack_timeout).await?;
        trace!(
            "[INPUT] {:?} '{}' on surface {} captured={}",
            kind,
            event.kind,
            surface_id,
            captured
        );
        Ok(captured)
    }

    async fn handle_overlay_event(&self, event: OverlayEvent) {
        match event {
            OverlayEvent::Loaded(surface_id) => {
                let mut slot = self.slot.lock().await;
                match slot.as_mut() {
                    Some(live) if live.overlay.id() == surface_id => {
                        if let Err(e) = live.overlay.mark_loaded() {
                            warn!("[SURFACE] {}", e);
                        }
                    }
                    _ => debug!("[SURFACE] Stale loaded signal for surface {}", surface_id),
                }
            }
            OverlayEvent::CursorChanged(surface_id, cursor) => {
                let current = self
                    .slot
                    .lock()
                    .await
                    .as_ref()
                    .is_some_and(|live| live.overlay.id() == surface_id);
                if !current {
                    debug!("[SURFACE] Cursor change from stale surface {}", surface_id);
                    return;
                }
                match self.client.call(Method::SetMouseCursor, vec![json!(cursor)]).await {
                    Ok(_) => debug!("[SURFACE] Cursor set to '{}'", cursor),
                    Err(e) => warn!("[SURFACE] SetMouseCursor('{}') failed: {}", cursor, e),
                }
            }
        }
    }

    /// Tear down the live surface and close both channels. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopping.send_replace(true) {
            self.wait_closed().await;
            return;
        }
        info!("[HOST] Shutting down session");

        let live = self.slot.lock().await.take();
        if let Some(live) = live {
            if let Err(e) = self.teardown(live).await {
                debug!("[HOST] Surface teardown during shutdown: {}", e);
            }
        }
        if let Some(texture) = self.unconfirmed.swap(None) {
            warn!(
                "[SURFACE] Withdrawing texture {} of unfinished surface {}",
                texture.handle(),
                texture.surface_id()
            );
            self.sink.current.store(None);
            if let Err(e) = self.publish(HandleValue::INVALID).await {
                debug!("[HOST] Withdraw during shutdown: {}", e);
            }
            drop(texture);
        }
        self.sink.acks.cancel_all();

        self.server.close().await;
        self.client.close().await;
        self.stopped.send_replace(true);
        info!("[HOST] Session closed");
    }

    pub async fn wait_closed(&self) {
        let mut stopped = self.stopped.subscribe();
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.stopped.borrow()
    }
}

async fn stop_requested(stopping: &mut watch::Receiver<bool>) {
    let _ = stopping.wait_for(|stopping| *stopping).await;
}

async fn overlay_event_loop(
    session: Weak<HostSession>,
    mut events: mpsc::UnboundedReceiver<OverlayEvent>,
    mut stopping: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = stop_requested(&mut stopping) => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(session) = session.upgrade() else {
            break;
        };
        session.handle_overlay_event(event).await;
    }
    debug!("[SURFACE] Overlay event task finished");
}

async fn close_on_channel_loss(session: Weak<HostSession>, server: RpcEngine, client: RpcEngine) {
    tokio::select! {
        _ = server.wait_closed() => info!("[HOST] Server channel closed"),
        _ = client.wait_closed() => info!("[HOST] Client channel closed"),
    }
    if let Some(session) = session.upgrade() {
        session.shutdown().await;
    }
}
