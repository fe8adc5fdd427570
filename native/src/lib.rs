pub mod config;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod overlay;
pub mod target;

// Re-export core types for binaries and embedders.
pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use ipc::{
    ExchangeHandles, HandleValue, HostPipes, LaunchHandles, Method, RpcChannel, RpcEngine,
};
pub use overlay::{
    Collaborators, DirtyRect, HeadlessTextureFactory, HeadlessViewFactory, HostSession,
    InputEvent, OverlayEventSink, SurfaceState,
};
pub use target::{TargetBridge, TargetSurfaceSink};

pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
