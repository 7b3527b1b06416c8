//! Producer → orchestrator frame handoff.
//!
//! Three frame buffers circulate: one owned by the producer, one pending in
//! the handoff, one being encoded. Buffers change hands by moving the
//! owned `Frame`, so pixels are never copied. The mutex guards only the
//! exchange itself.
//!
//! ```text
//! producer ──publish(frame)──► [pending] ──next()──► orchestrator
//!    ▲                                                   │
//!    └───────────── spare ◄──────── recycle(frame) ──────┘
//! ```

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::draw::types::{DamageMap, Frame};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A published frame and its optional damage bitmap.
#[derive(Debug)]
pub struct PendingFrame {
    pub frame: Frame,
    /// Valid for this frame only.
    pub damage: Option<DamageMap>,
}

/// What the orchestrator woke up for.
#[derive(Debug)]
pub enum HandoffEvent {
    Frame(PendingFrame),
    /// Window geometry changed; carries the new frame size when known.
    GeometryChanged(Option<(u32, u32)>),
    Timeout,
    Shutdown,
}

#[derive(Default)]
struct Slots {
    pending: Option<PendingFrame>,
    spare: Vec<Frame>,
    geometry: Option<Option<(u32, u32)>>,
    shutdown: bool,
}

/// The exchange point between one producer and one orchestrator.
pub struct FrameHandoff {
    slots: Mutex<Slots>,
    ready: Condvar,
}

impl FrameHandoff {
    /// Create the handoff with two spare buffers and return the producer's
    /// first buffer.
    pub fn new(width: u32, height: u32) -> (Self, Frame) {
        let handoff = Self {
            slots: Mutex::new(Slots {
                spare: vec![Frame::new(width, height), Frame::new(width, height)],
                ..Default::default()
            }),
            ready: Condvar::new(),
        };
        (handoff, Frame::new(width, height))
    }

    /// Publish a finished frame and take back a buffer to draw the next one
    /// into.
    ///
    /// If the orchestrator has not picked up the previous frame yet, that
    /// frame is superseded and its buffer is handed back. The returned
    /// buffer's content is stale.
    pub fn publish(&self, frame: Frame, damage: Option<DamageMap>) -> Frame {
        let (width, height) = (frame.width, frame.height);
        let mut slots = lock(&self.slots);
        let superseded = slots.pending.replace(PendingFrame { frame, damage });
        let next = match superseded {
            Some(old) => Some(old.frame),
            None => slots.spare.pop(),
        };
        drop(slots);
        self.ready.notify_one();
        match next {
            Some(f) if f.width == width && f.height == height => f,
            _ => Frame::new(width, height),
        }
    }

    /// Announce a geometry change. A pending frame of the old size is
    /// dropped.
    pub fn signal_geometry_change(&self, size: Option<(u32, u32)>) {
        let mut slots = lock(&self.slots);
        if let (Some((w, h)), Some(p)) = (size, &slots.pending) {
            if p.frame.width != w || p.frame.height != h {
                slots.pending = None;
            }
        }
        slots.geometry = Some(size);
        drop(slots);
        self.ready.notify_one();
    }

    /// Wake the orchestrator for good.
    pub fn shutdown(&self) {
        lock(&self.slots).shutdown = true;
        self.ready.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.slots).shutdown
    }

    /// Wait up to `timeout` for something to do. Shutdown wins over a
    /// geometry change, which wins over a frame.
    pub fn next(&self, timeout: Duration) -> HandoffEvent {
        let slots = lock(&self.slots);
        let (mut slots, _) = self
            .ready
            .wait_timeout_while(slots, timeout, |s| {
                !s.shutdown && s.geometry.is_none() && s.pending.is_none()
            })
            .unwrap_or_else(|p| p.into_inner());
        if slots.shutdown {
            HandoffEvent::Shutdown
        } else if let Some(size) = slots.geometry.take() {
            HandoffEvent::GeometryChanged(size)
        } else if let Some(pending) = slots.pending.take() {
            HandoffEvent::Frame(pending)
        } else {
            HandoffEvent::Timeout
        }
    }

    /// Return a buffer the orchestrator is done with.
    pub fn recycle(&self, frame: Frame) {
        let mut slots = lock(&self.slots);
        if slots.spare.len() < 2 {
            slots.spare.push(frame);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tagged(mut f: Frame, v: u32) -> Frame {
        f.set_pixel(0, 0, v);
        f
    }

    #[test]
    fn frames_move_without_copy() {
        let (h, buf) = FrameHandoff::new(32, 32);
        let buf = tagged(buf, 7);
        let ptr = buf.data.as_ptr();
        let _next = h.publish(buf, None);
        match h.next(Duration::from_millis(10)) {
            HandoffEvent::Frame(p) => {
                assert_eq!(p.frame.data.as_ptr(), ptr);
                assert_eq!(p.frame.pixel(0, 0), 7);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn newer_frame_supersedes_pending() {
        let (h, a) = FrameHandoff::new(16, 16);
        let b = h.publish(tagged(a, 1), None);
        let returned = h.publish(tagged(b, 2), None);
        // The superseded frame comes straight back to the producer.
        assert_eq!(returned.pixel(0, 0), 1);
        match h.next(Duration::from_millis(10)) {
            HandoffEvent::Frame(p) => assert_eq!(p.frame.pixel(0, 0), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn times_out_when_idle() {
        let (h, _) = FrameHandoff::new(16, 16);
        assert!(matches!(h.next(Duration::from_millis(5)), HandoffEvent::Timeout));
    }

    #[test]
    fn geometry_change_drops_stale_frame() {
        let (h, a) = FrameHandoff::new(16, 16);
        h.publish(a, None);
        h.signal_geometry_change(Some((32, 16)));
        assert!(matches!(
            h.next(Duration::from_millis(5)),
            HandoffEvent::GeometryChanged(Some((32, 16)))
        ));
        assert!(matches!(h.next(Duration::from_millis(5)), HandoffEvent::Timeout));
    }

    #[test]
    fn publish_after_resize_allocates_new_size() {
        let (h, _) = FrameHandoff::new(16, 16);
        let big = Frame::new(48, 32);
        let next = h.publish(big, None);
        assert_eq!((next.width, next.height), (48, 32));
    }

    #[test]
    fn shutdown_wakes_waiter() {
        let (h, _) = FrameHandoff::new(16, 16);
        let h = Arc::new(h);
        let waiter = {
            let h = h.clone();
            std::thread::spawn(move || h.next(Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(10));
        h.shutdown();
        assert!(matches!(waiter.join().unwrap(), HandoffEvent::Shutdown));
    }
}
