// GPU-less collaborators: in-memory textures and an overlay view that loads
// instantly. Used when no rendering backend is available.

use log::debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::input::{InputAckToken, InputCaptureTracker, InputEvent};
use super::session::OverlayEventSink;
use super::surface::{
    DirtyRect, OverlayView, OverlayViewFactory, SharedTexture, SharedTextureFactory, SurfaceId,
};
use crate::error::{BridgeError, BridgeResult};
use crate::ipc::protocol::{AdapterLuid, HandleValue};

const FIRST_HANDLE: u64 = 0x1000;

/// Hands out BGRA buffers in process memory with made-up share handles.
pub struct HeadlessTextureFactory {
    next_handle: AtomicU64,
}

impl Default for HeadlessTextureFactory {
    fn default() -> Self {
        Self {
            next_handle: AtomicU64::new(FIRST_HANDLE),
        }
    }
}

impl HeadlessTextureFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SharedTextureFactory for HeadlessTextureFactory {
    fn create_shared_texture(
        &self,
        adapter: AdapterLuid,
        width: u32,
        height: u32,
    ) -> BridgeResult<Box<dyn SharedTexture>> {
        let handle = HandleValue(self.next_handle.fetch_add(4, Ordering::SeqCst));
        debug!(
            "[SURFACE] Headless texture {} ({}x{}) for adapter {}",
            handle, width, height, adapter
        );
        Ok(Box::new(MemoryTexture::new(handle, width, height)))
    }
}

/// A full-frame BGRA buffer.
pub struct MemoryTexture {
    handle: HandleValue,
    width: u32,
    height: u32,
    pixels: Mutex<Vec<u8>>,
}

impl MemoryTexture {
    pub fn new(handle: HandleValue, width: u32, height: u32) -> Self {
        Self {
            handle,
            width,
            height,
            pixels: Mutex::new(vec![0; 4 * width as usize * height as usize]),
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.pixels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SharedTexture for MemoryTexture {
    fn shared_handle(&self) -> HandleValue {
        self.handle
    }

    fn update(&self, dirty: DirtyRect, frame: &[u8]) -> BridgeResult<()> {
        let mut pixels = self.pixels.lock().unwrap_or_else(PoisonError::into_inner);
        if frame.len() != pixels.len() {
            return Err(BridgeError::InvalidParams(format!(
                "frame is {} bytes, texture holds {}",
                frame.len(),
                pixels.len()
            )));
        }

        if !dirty.fits_within(self.width, self.height) {
            return Err(BridgeError::InvalidParams(format!(
                "dirty rect {:?} outside {}x{}",
                dirty, self.width, self.height
            )));
        }

        let stride = 4 * self.width as usize;
        let span = 4 * dirty.width as usize;
        for row in dirty.y..dirty.y + dirty.height {
            let start = row as usize * stride + 4 * dirty.x as usize;
            pixels[start..start + span].copy_from_slice(&frame[start..start + span]);
        }
        Ok(())
    }
}

/// Creates `HeadlessView`s that report loaded as soon as they exist.
#[derive(Default)]
pub struct HeadlessViewFactory {
    capture_input: bool,
}

impl HeadlessViewFactory {
    /// `capture_input` decides whether the view claims the events it gets.
    pub fn new(capture_input: bool) -> Self {
        Self { capture_input }
    }
}

impl OverlayViewFactory for HeadlessViewFactory {
    fn create_view(
        &self,
        surface_id: SurfaceId,
        _width: u32,
        _height: u32,
        events: OverlayEventSink,
    ) -> BridgeResult<Arc<dyn OverlayView>> {
        let view = Arc::new(HeadlessView {
            surface_id,
            capture_input: self.capture_input,
            tracker: InputCaptureTracker::new(),
            focused: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            events: events.clone(),
        });
        events.loaded(surface_id);
        Ok(view)
    }
}

pub struct HeadlessView {
    surface_id: SurfaceId,
    capture_input: bool,
    tracker: InputCaptureTracker,
    focused: AtomicBool,
    destroyed: AtomicBool,
    events: OverlayEventSink,
}

impl HeadlessView {
    fn ensure_alive(&self) -> BridgeResult<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(BridgeError::HandleLifecycleViolation(format!(
                "headless view {} is destroyed",
                self.surface_id
            )));
        }
        Ok(())
    }
}

impl OverlayView for HeadlessView {
    fn is_focusable(&self) -> bool {
        !self.destroyed.load(Ordering::SeqCst)
    }

    fn is_focused(&self) -> bool {
        self.focused.load(Ordering::SeqCst)
    }

    fn focus(&self) {
        self.focused.store(true, Ordering::SeqCst);
    }

    fn send_input_event(&self, event: &InputEvent) -> BridgeResult<()> {
        self.ensure_alive()?;
        if self.capture_input {
            self.tracker.observe_capture_phase();
        }
        debug!("[INPUT] Headless view {} got '{}'", self.surface_id, event.kind);
        Ok(())
    }

    fn request_input_ack(&self, token: InputAckToken) -> BridgeResult<()> {
        self.ensure_alive()?;
        self.events.input_ack(token, self.tracker.acknowledge());
        Ok(())
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_texture_copies_only_dirty_rows() {
        let texture = MemoryTexture::new(HandleValue(8), 2, 2);
        let frame: Vec<u8> = (1..=16).collect();

        texture.update(DirtyRect::new(1, 1, 1, 1), &frame).unwrap();
        let pixels = texture.snapshot();
        assert_eq!(&pixels[..12], &[0u8; 12]);
        assert_eq!(&pixels[12..], &[13, 14, 15, 16]);

        assert!(texture.update(DirtyRect::full(2, 2), &frame[..8]).is_err());
    }

    #[test]
    fn test_memory_texture_rejects_rect_outside_texture() {
        let texture = MemoryTexture::new(HandleValue(8), 2, 2);
        let frame = vec![7u8; 16];

        for dirty in [
            DirtyRect::new(1, 0, 2, 1),
            DirtyRect::new(0, 1, 1, 2),
            DirtyRect::new(u32::MAX, u32::MAX, 2, 2),
        ] {
            assert!(matches!(
                texture.update(dirty, &frame),
                Err(BridgeError::InvalidParams(_))
            ));
        }
        assert_eq!(texture.snapshot(), vec![0u8; 16]);
    }

    #[test]
    fn test_factory_handles_are_distinct_and_valid() {
        let factory = HeadlessTextureFactory::new();
        let a = factory
            .create_shared_texture(AdapterLuid::new(1, 0), 4, 4)
            .unwrap();
        let b = factory
            .create_shared_texture(AdapterLuid::new(1, 0), 4, 4)
            .unwrap();
        assert_ne!(a.shared_handle(), b.shared_handle());
        assert!(a.shared_handle().is_valid());
    }
}
