// Target-side bridge: the hooked process's half of the connection.

use log::{debug, info};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::ipc::engine::{positional, RpcChannel, RpcEngine};
use crate::ipc::handshake::{connect_target, LaunchHandles};
use crate::ipc::protocol::{AdapterLuid, HandleValue, Method};
use crate::overlay::input::InputEvent;

/// Receives what the host publishes to the target's renderer.
pub trait TargetSurfaceSink: Send + Sync {
    /// `HandleValue::INVALID` withdraws the current texture.
    fn set_shared_texture_handle(&self, handle: HandleValue) -> BridgeResult<()>;
    fn set_mouse_cursor(&self, cursor: &str) -> BridgeResult<()>;
}

pub struct TargetBridge {
    client: RpcEngine,
    server: RpcEngine,
}

impl TargetBridge {
    /// Run the handshake on inherited launch handles.
    pub async fn connect(
        launch: LaunchHandles,
        config: &BridgeConfig,
        sink: Arc<dyn TargetSurfaceSink>,
    ) -> BridgeResult<Self> {
        let client = RpcEngine::new("target-client", config.call_timeout);
        let server_channel = connect_target(
            &client,
            launch,
            config.max_message_size,
            config.handshake_timeout,
        )
        .await?;

        let server = serve(sink);
        if let Err(e) = server.start(server_channel).await {
            client.close().await;
            return Err(e);
        }
        info!("[TARGET] Connected to host");
        Ok(Self { client, server })
    }

    /// Connect using `OVERLAY_PIPE_READ`/`OVERLAY_PIPE_WRITE`.
    pub async fn from_env(config: &BridgeConfig, sink: Arc<dyn TargetSurfaceSink>) -> BridgeResult<Self> {
        let launch = LaunchHandles::from_env()?;
        Self::connect(launch, config, sink).await
    }

    /// Run over channels that are already connected, skipping the handshake.
    pub async fn attach(
        client_channel: RpcChannel,
        server_channel: RpcChannel,
        config: &BridgeConfig,
        sink: Arc<dyn TargetSurfaceSink>,
    ) -> BridgeResult<Self> {
        let client = RpcEngine::new("target-client", config.call_timeout);
        client.start(client_channel).await?;
        let server = serve(sink);
        server.start(server_channel).await?;
        Ok(Self { client, server })
    }

    pub fn client(&self) -> &RpcEngine {
        &self.client
    }

    pub async fn surface_created(&self, adapter: AdapterLuid, width: u32, height: u32) -> BridgeResult<()> {
        debug!("[TARGET] Surface created {}x{} on {}", width, height, adapter);
        self.client
            .notify(
                Method::SurfaceCreated,
                vec![serde_json::to_value(adapter)?, json!(width), json!(height)],
            )
            .await
    }

    pub async fn surface_destroyed(&self) -> BridgeResult<()> {
        debug!("[TARGET] Surface destroyed");
        self.client.notify(Method::SurfaceDestroyed, Vec::new()).await
    }

    /// Returns whether the overlay captured the event.
    pub async fn forward_pointer_event(&self, event: &InputEvent) -> BridgeResult<bool> {
        self.forward(Method::ForwardPointerEvent, event).await
    }

    pub async fn forward_wheel_event(&self, event: &InputEvent) -> BridgeResult<bool> {
        self.forward(Method::ForwardWheelEvent, event).await
    }

    pub async fn forward_key_event(&self, event: &InputEvent) -> BridgeResult<bool> {
        self.forward(Method::ForwardKeyEvent, event).await
    }

    async fn forward(&self, method: Method, event: &InputEvent) -> BridgeResult<bool> {
        let result = self
            .client
            .call(method.clone(), vec![serde_json::to_value(event)?])
            .await?;
        result.as_bool().ok_or_else(|| {
            BridgeError::ProtocolViolation(format!("{} answered {} instead of a bool", method, result))
        })
    }

    pub async fn close(&self) {
        self.client.close().await;
        self.server.close().await;
        info!("[TARGET] Disconnected");
    }

    /// Resolves once either channel has closed.
    pub async fn wait_closed(&self) {
        tokio::select! {
            _ = self.client.wait_closed() => {}
            _ = self.server.wait_closed() => {}
        }
    }
}

fn serve(sink: Arc<dyn TargetSurfaceSink>) -> RpcEngine {
    let server = RpcEngine::new("target-server", None);

    let texture_sink = Arc::clone(&sink);
    server.register_method(Method::SetSharedTextureHandle, move |params| {
        let sink = Arc::clone(&texture_sink);
        async move {
            let handle: HandleValue = positional(&params, 0, "handle")?;
            debug!("[TARGET] Shared texture handle {}", handle);
            sink.set_shared_texture_handle(handle)?;
            Ok(Some(Value::Bool(true)))
        }
    });

    server.register_method(Method::SetMouseCursor, move |params| {
        let sink = Arc::clone(&sink);
        async move {
            let cursor: String = positional(&params, 0, "cursor")?;
            sink.set_mouse_cursor(&cursor)?;
            Ok(Some(Value::Bool(true)))
        }
    });

    server
}
