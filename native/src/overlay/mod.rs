// Shared surface lifecycle and input forwarding on the host side.

pub mod headless;
pub mod input;
pub mod session;
pub mod surface;

pub use headless::{HeadlessTextureFactory, HeadlessViewFactory};
pub use input::{InputAckToken, InputAcks, InputCaptureTracker, InputEvent, PendingAck};
pub use session::{Collaborators, HostSession, OverlayEventSink};
pub use surface::{
    DirtyRect, OverlaySurface, OverlayView, OverlayViewFactory, SharedSurfaceHandle,
    SharedTexture, SharedTextureFactory, SurfaceId, SurfaceState,
};
