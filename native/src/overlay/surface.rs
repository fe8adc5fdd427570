// Shared GPU surface, overlay view lifecycle and the collaborator traits
// that render into them.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::input::{InputAckToken, InputEvent};
use super::session::OverlayEventSink;
use crate::error::{BridgeError, BridgeResult};
use crate::ipc::protocol::{AdapterLuid, HandleValue};

pub type SurfaceId = u32;

const BYTES_PER_PIXEL: usize = 4; // BGRA

/// Region of a paint event, in texture pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl DirtyRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        let right = self.x as u64 + self.width as u64;
        let bottom = self.y as u64 + self.height as u64;
        right <= width as u64 && bottom <= height as u64
    }
}

/// GPU texture shareable with another process. Releasing happens on drop.
pub trait SharedTexture: Send + Sync {
    fn shared_handle(&self) -> HandleValue;

    /// Copy `dirty` out of a full-size BGRA frame.
    fn update(&self, dirty: DirtyRect, pixels: &[u8]) -> BridgeResult<()>;
}

pub trait SharedTextureFactory: Send + Sync {
    fn create_shared_texture(
        &self,
        adapter: AdapterLuid,
        width: u32,
        height: u32,
    ) -> BridgeResult<Box<dyn SharedTexture>>;
}

/// The off-screen overlay window rendering into a shared surface.
pub trait OverlayView: Send + Sync {
    fn is_focusable(&self) -> bool;
    fn is_focused(&self) -> bool;
    fn focus(&self);
    fn send_input_event(&self, event: &InputEvent) -> BridgeResult<()>;

    /// Ask the overlay to report, through `OverlayEventSink::input_ack`,
    /// whether it captured the events delivered so far.
    fn request_input_ack(&self, token: InputAckToken) -> BridgeResult<()>;

    fn destroy(&self);
}

pub trait OverlayViewFactory: Send + Sync {
    fn create_view(
        &self,
        surface_id: SurfaceId,
        width: u32,
        height: u32,
        events: OverlayEventSink,
    ) -> BridgeResult<Arc<dyn OverlayView>>;
}

/// A shared texture published to the target.
pub struct SharedSurfaceHandle {
    surface_id: SurfaceId,
    adapter: AdapterLuid,
    width: u32,
    height: u32,
    texture: Box<dyn SharedTexture>,
}

impl SharedSurfaceHandle {
    pub fn new(
        surface_id: SurfaceId,
        adapter: AdapterLuid,
        width: u32,
        height: u32,
        texture: Box<dyn SharedTexture>,
    ) -> Self {
        Self {
            surface_id,
            adapter,
            width,
            height,
            texture,
        }
    }

    pub fn surface_id(&self) -> SurfaceId {
        self.surface_id
    }

    pub fn adapter(&self) -> AdapterLuid {
        self.adapter
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn handle(&self) -> HandleValue {
        self.texture.shared_handle()
    }

    /// Copy a dirty region of a full frame into the texture.
    pub fn copy_dirty(&self, dirty: DirtyRect, pixels: &[u8]) -> BridgeResult<()> {
        if !dirty.fits_within(self.width, self.height) {
            return Err(BridgeError::InvalidParams(format!(
                "dirty rect {:?} outside {}x{}",
                dirty, self.width, self.height
            )));
        }

        let expected = BYTES_PER_PIXEL * self.width as usize * self.height as usize;
        if pixels.len() != expected {
            return Err(BridgeError::InvalidParams(format!(
                "image buffer is {} bytes, expected {}",
                pixels.len(),
                expected
            )));
        }

        self.texture.update(dirty, pixels)
    }
}

impl fmt::Debug for SharedSurfaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSurfaceHandle")
            .field("surface_id", &self.surface_id)
            .field("adapter", &self.adapter)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("handle", &self.handle())
            .finish()
    }
}

impl Drop for SharedSurfaceHandle {
    fn drop(&mut self) {
        debug!(
            "[SURFACE] Releasing texture {} of surface {}",
            self.handle(),
            self.surface_id
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    Uninitialized,
    Created,
    Loaded,
    Destroyed,
}

/// Overlay surface bound to one shared texture.
///
/// `Uninitialized -> Created -> Loaded -> Destroyed`. Input is only accepted
/// while `Loaded`; every use after `Destroyed` is an error.
pub struct OverlaySurface {
    id: SurfaceId,
    state: SurfaceState,
    view: Option<Arc<dyn OverlayView>>,
}

impl OverlaySurface {
    pub fn new(id: SurfaceId) -> Self {
        Self {
            id,
            state: SurfaceState::Uninitialized,
            view: None,
        }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn state(&self) -> SurfaceState {
        self.state
    }

    pub fn is_loaded(&self) -> bool {
        self.state == SurfaceState::Loaded
    }

    fn violation(&self, what: &str) -> BridgeError {
        BridgeError::HandleLifecycleViolation(format!(
            "surface {} cannot {} while {:?}",
            self.id, what, self.state
        ))
    }

    pub fn attach(&mut self, view: Arc<dyn OverlayView>) -> BridgeResult<()> {
        if self.state != SurfaceState::Uninitialized {
            return Err(self.violation("attach a view"));
        }
        self.view = Some(view);
        self.state = SurfaceState::Created;
        debug!("[SURFACE] Surface {} created", self.id);
        Ok(())
    }

    pub fn mark_loaded(&mut self) -> BridgeResult<()> {
        match self.state {
            SurfaceState::Created => {
                self.state = SurfaceState::Loaded;
                info!("[SURFACE] Surface {} loaded", self.id);
                Ok(())
            }
            SurfaceState::Loaded => Ok(()),
            _ => Err(self.violation("load")),
        }
    }

    pub fn view(&self) -> BridgeResult<Arc<dyn OverlayView>> {
        match (&self.view, self.state) {
            (Some(view), SurfaceState::Created | SurfaceState::Loaded) => Ok(Arc::clone(view)),
            _ => Err(self.violation("be used")),
        }
    }

    /// Destroy the view. Returns false if it was already destroyed.
    pub fn destroy(&mut self) -> bool {
        if self.state == SurfaceState::Destroyed {
            return false;
        }
        if let Some(view) = self.view.take() {
            view.destroy();
        }
        self.state = SurfaceState::Destroyed;
        debug!("[SURFACE] Surface {} destroyed", self.id);
        true
    }
}
