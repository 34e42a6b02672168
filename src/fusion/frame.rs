//! Sensor frame inputs for depth fusion
//!
//! Frames borrow the collaborator's buffers; nothing is copied until samples
//! are accepted.

use glam::Mat4;
use thiserror::Error;

use crate::core::camera::{is_valid_view, Projection};

/// Reasons a frame is rejected without touching the map
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameError {
    #[error("depth image has zero size ({width}x{height})")]
    EmptyDepth { width: usize, height: usize },
    #[error("depth buffer holds {actual} samples, expected {expected}")]
    DepthLength { expected: usize, actual: usize },
    #[error("color buffer holds {actual} bytes, expected {expected}")]
    ColorLength { expected: usize, actual: usize },
    #[error("color image {color_width}x{color_height} is not compatible with depth {depth_width}x{depth_height}")]
    ColorDimensions {
        depth_width: usize,
        depth_height: usize,
        color_width: usize,
        color_height: usize,
    },
    #[error("view matrix is not finite or not invertible")]
    InvalidPose,
    #[error("projection parameters are degenerate")]
    InvalidProjection,
    #[error("image size {width}x{height} overflows the addressable buffer length")]
    DimensionOverflow { width: usize, height: usize },
}

/// Raw depth samples
#[derive(Debug, Clone, Copy)]
pub enum DepthSamples<'a> {
    /// Unsigned millimeters, 0 = no reading
    Millimeters(&'a [u16]),
    /// Meters, 0 or non-finite = no reading
    Meters(&'a [f32]),
}

impl DepthSamples<'_> {
    pub fn len(&self) -> usize {
        match self {
            DepthSamples::Millimeters(data) => data.len(),
            DepthSamples::Meters(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample `idx` in meters. Missing readings come back as 0.
    #[inline]
    pub fn meters(&self, idx: usize) -> f32 {
        match self {
            DepthSamples::Millimeters(data) => data.get(idx).map_or(0.0, |&mm| mm as f32 * 0.001),
            DepthSamples::Meters(data) => data
                .get(idx)
                .copied()
                .filter(|d| d.is_finite())
                .unwrap_or(0.0),
        }
    }
}

/// Row-major depth map
#[derive(Debug, Clone, Copy)]
pub struct DepthImage<'a> {
    pub width: usize,
    pub height: usize,
    pub samples: DepthSamples<'a>,
}

impl<'a> DepthImage<'a> {
    pub fn millimeters(data: &'a [u16], width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            samples: DepthSamples::Millimeters(data),
        }
    }

    pub fn meters(data: &'a [f32], width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            samples: DepthSamples::Meters(data),
        }
    }

    pub fn validate(&self) -> Result<(), FrameError> {
        if self.width == 0 || self.height == 0 {
            return Err(FrameError::EmptyDepth {
                width: self.width,
                height: self.height,
            });
        }
        let expected = self
            .width
            .checked_mul(self.height)
            .ok_or(FrameError::DimensionOverflow {
                width: self.width,
                height: self.height,
            })?;
        if self.samples.len() != expected {
            return Err(FrameError::DepthLength {
                expected,
                actual: self.samples.len(),
            });
        }
        Ok(())
    }
}

/// Byte layout of a color pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
    Rgba,
    Bgra,
}

impl ChannelOrder {
    pub fn channels(self) -> usize {
        match self {
            ChannelOrder::Rgb | ChannelOrder::Bgr => 3,
            ChannelOrder::Rgba | ChannelOrder::Bgra => 4,
        }
    }

    /// Reorder one pixel to RGB
    #[inline]
    fn to_rgb(self, px: &[u8]) -> [u8; 3] {
        match self {
            ChannelOrder::Rgb | ChannelOrder::Rgba => [px[0], px[1], px[2]],
            ChannelOrder::Bgr | ChannelOrder::Bgra => [px[2], px[1], px[0]],
        }
    }
}

/// Row-major 8-bit color image
#[derive(Debug, Clone, Copy)]
pub struct ColorImage<'a> {
    pub width: usize,
    pub height: usize,
    pub order: ChannelOrder,
    pub data: &'a [u8],
}

impl<'a> ColorImage<'a> {
    pub fn new(data: &'a [u8], width: usize, height: usize, order: ChannelOrder) -> Self {
        Self {
            width,
            height,
            order,
            data,
        }
    }

    /// Check buffer length and that the resolution is the depth resolution
    /// or an exact integer multiple of it on both axes.
    pub fn validate_against(&self, depth: &DepthImage<'_>) -> Result<(), FrameError> {
        let expected = self
            .width
            .checked_mul(self.height)
            .and_then(|pixels| pixels.checked_mul(self.order.channels()))
            .ok_or(FrameError::DimensionOverflow {
                width: self.width,
                height: self.height,
            })?;
        if self.data.len() != expected {
            return Err(FrameError::ColorLength {
                expected,
                actual: self.data.len(),
            });
        }

        let compatible = self.width >= depth.width
            && self.height >= depth.height
            && self.width % depth.width == 0
            && self.height % depth.height == 0
            && self.width / depth.width == self.height / depth.height;
        if !compatible {
            return Err(FrameError::ColorDimensions {
                depth_width: depth.width,
                depth_height: depth.height,
                color_width: self.width,
                color_height: self.height,
            });
        }
        Ok(())
    }

    /// RGB color in [0, 1] at depth pixel `(x, y)`. Assumes a validated frame.
    #[inline]
    pub fn sample(&self, x: usize, y: usize, depth_width: usize) -> Option<[f32; 3]> {
        let factor = self.width / depth_width.max(1);
        let (cx, cy) = (x * factor, y * factor);
        let channels = self.order.channels();
        let start = (cy * self.width + cx) * channels;
        let px = self.data.get(start..start + channels)?;
        let [r, g, b] = self.order.to_rgb(px);
        Some([r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0])
    }
}

/// One sensor frame handed in by the capture collaborator
#[derive(Debug, Clone, Copy)]
pub struct SensorFrame<'a> {
    pub depth: DepthImage<'a>,
    pub color: Option<ColorImage<'a>>,
    /// World-to-camera transform
    pub view: Mat4,
    pub projection: Projection,
}

impl<'a> SensorFrame<'a> {
    pub fn new(depth: DepthImage<'a>, view: Mat4, projection: Projection) -> Self {
        Self {
            depth,
            color: None,
            view,
            projection,
        }
    }

    pub fn with_color(mut self, color: ColorImage<'a>) -> Self {
        self.color = Some(color);
        self
    }

    /// Reject the frame before any sample is read
    pub fn validate(&self) -> Result<(), FrameError> {
        self.depth.validate()?;
        if let Some(color) = &self.color {
            color.validate_against(&self.depth)?;
        }
        if !is_valid_view(&self.view) {
            return Err(FrameError::InvalidPose);
        }
        if !self.projection.is_valid() {
            return Err(FrameError::InvalidProjection);
        }
        Ok(())
    }
}
