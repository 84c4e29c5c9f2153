//! Latest-value-wins frame slot
//!
//! One writer (the capture loop) replaces the value; any number of stream
//! connections wait for the next replacement. Readers that fall behind skip
//! intermediate frames instead of queueing them.

use tokio::sync::watch;

use crate::frame::SharedFrame;

/// Shared "latest frame" cell
#[derive(Debug)]
pub struct LatestFrame {
    tx: watch::Sender<Option<SharedFrame>>,
}

impl Default for LatestFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl LatestFrame {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Replace the slot unconditionally and wake every waiting reader
    pub fn publish(&self, frame: SharedFrame) {
        self.tx.send_replace(Some(frame));
    }

    /// The frame currently held, if any has been published
    pub fn current(&self) -> Option<SharedFrame> {
        self.tx.borrow().clone()
    }

    /// Reader that first yields the current frame (if any), then each newer one
    pub fn subscribe(&self) -> FrameSubscriber {
        let mut rx = self.tx.subscribe();
        rx.mark_changed();
        FrameSubscriber { rx }
    }
}

/// Per-connection reader of a [`LatestFrame`]
#[derive(Debug)]
pub struct FrameSubscriber {
    rx: watch::Receiver<Option<SharedFrame>>,
}

impl FrameSubscriber {
    /// Wait for a frame this reader has not seen yet
    ///
    /// Blocks until the first frame exists. Returns `None` once the slot has
    /// been dropped.
    pub async fn next(&mut self) -> Option<SharedFrame> {
        loop {
            self.rx.changed().await.ok()?;
            let current = self.rx.borrow_and_update().clone();
            if current.is_some() {
                return current;
            }
        }
    }
}
