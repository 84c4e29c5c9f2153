//! Captured camera frames
//!
//! Frames are immutable once captured and are passed around as `Arc<Frame>`,
//! so every consumer sees the same pixels without copying the buffer.

use std::sync::Arc;
use std::time::Instant;

/// Bytes per pixel (RGB8)
pub const CHANNELS: usize = 3;

/// A single captured frame
#[derive(Clone, Debug)]
pub struct Frame {
    /// RGB pixel data, row-major, no padding
    data: Vec<u8>,
    /// Frame width
    width: u32,
    /// Frame height
    height: u32,
    /// Capture sequence number
    sequence: u64,
    /// Capture timestamp
    captured_at: Instant,
}

/// Shared handle handed to every sink
pub type SharedFrame = Arc<Frame>;

impl Frame {
    /// Wrap an RGB buffer captured now
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Self {
        Self {
            data,
            width,
            height,
            sequence,
            captured_at: Instant::now(),
        }
    }

    /// A frame filled with a single colour
    pub fn solid(width: u32, height: u32, rgb: [u8; 3], sequence: u64) -> Self {
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixels * CHANNELS);
        for _ in 0..pixels {
            data.extend_from_slice(&rgb);
        }
        Self::new(data, width, height, sequence)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Raw RGB bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether the buffer length matches the declared dimensions
    pub fn is_well_formed(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() == self.width as usize * self.height as usize * CHANNELS
    }

    /// RGB value at a pixel, `None` outside the frame
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * CHANNELS;
        self.data
            .get(idx..idx + CHANNELS)
            .map(|p| [p[0], p[1], p[2]])
    }

    /// Nearest-neighbour rescale to the given size
    ///
    /// Returns a clone when the size already matches.
    pub fn resized(&self, target_width: u32, target_height: u32) -> Frame {
        if self.width == target_width && self.height == target_height {
            return self.clone();
        }

        let mut output = vec![0u8; target_width as usize * target_height as usize * CHANNELS];
        if self.width == 0 || self.height == 0 {
            return Frame {
                data: output,
                width: target_width,
                height: target_height,
                sequence: self.sequence,
                captured_at: self.captured_at,
            };
        }

        let x_ratio = self.width as f32 / target_width as f32;
        let y_ratio = self.height as f32 / target_height as f32;

        for y in 0..target_height {
            let src_y = ((y as f32 * y_ratio) as u32).min(self.height - 1);
            for x in 0..target_width {
                let src_x = ((x as f32 * x_ratio) as u32).min(self.width - 1);
                let src_idx = (src_y as usize * self.width as usize + src_x as usize) * CHANNELS;
                let dst_idx = (y as usize * target_width as usize + x as usize) * CHANNELS;

                if src_idx + 2 < self.data.len() {
                    output[dst_idx..dst_idx + CHANNELS]
                        .copy_from_slice(&self.data[src_idx..src_idx + CHANNELS]);
                }
            }
        }

        Frame {
            data: output,
            width: target_width,
            height: target_height,
            sequence: self.sequence,
            captured_at: self.captured_at,
        }
    }
}
