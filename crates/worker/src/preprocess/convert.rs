//! Image decoding and normalisation
//!
//! Decoded images are always 3-channel RGB. The transform keeps the target
//! aspect ratio with a centred crop (shrunk further by `zoom`), resizes
//! bilinearly to the engine input, then scales every channel to `[0, 1]` and
//! applies `(v - mean[c]) / std[c]`.
//!
//! Planes are emitted in RGB order (plane 0 is red), so `mean` and `std` are
//! RGB-ordered too. Models trained on BGR input need their first layer or
//! their normalisation values reordered.

use super::Payload;
use crate::input::EngineInputData;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use skinscan_common::config::ImageSettings;
use skinscan_common::Result;
use skinscan_proto::ErrorCode;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Channel count of every decoded image
const DECODED_CHANNELS: usize = 3;

/// Per-request preprocessing failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConvertError {
    #[error("data is empty")]
    DataEmpty,

    #[error("file does not exist: {0}")]
    FileNotFound(PathBuf),

    #[error("cannot decode image: {0}")]
    DecodeFailed(String),

    #[error("expected {expected} channels, source has {actual}")]
    ChannelMismatch { expected: usize, actual: usize },

    #[error("image {width}x{height} is smaller than target {target_width}x{target_height}")]
    ImageTooSmall {
        width: u32,
        height: u32,
        target_width: u32,
        target_height: u32,
    },
}

impl ConvertError {
    /// Wire code reported to the client
    pub fn code(&self) -> ErrorCode {
        match self {
            ConvertError::DataEmpty => ErrorCode::DataEmpty,
            ConvertError::FileNotFound(_) => ErrorCode::FileNotFound,
            ConvertError::DecodeFailed(_) => ErrorCode::DecodeFailed,
            ConvertError::ChannelMismatch { .. } => ErrorCode::ChannelMismatch,
            ConvertError::ImageTooSmall { .. } => ErrorCode::ImageTooSmall,
        }
    }
}

/// Turns a client payload into engine input
pub trait ImageConverter: Send + Sync {
    fn convert(&self, payload: &Payload) -> std::result::Result<EngineInputData, ConvertError>;
}

/// Converter backed by the `image` crate
#[derive(Debug, Clone)]
pub struct ImageConvertor {
    settings: ImageSettings,
}

impl ImageConvertor {
    /// Create a converter; geometry must already be filled from the engine
    pub fn new(settings: ImageSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &ImageSettings {
        &self.settings
    }

    /// Decode an in-memory encoded image
    pub fn convert_bytes(&self, data: &[u8]) -> std::result::Result<EngineInputData, ConvertError> {
        if data.is_empty() {
            return Err(ConvertError::DataEmpty);
        }

        let image = image::load_from_memory(data)
            .map_err(|e| ConvertError::DecodeFailed(e.to_string()))?;

        self.prepare(&image.to_rgb8())
    }

    /// Decode an image file
    pub fn convert_path(&self, path: &Path) -> std::result::Result<EngineInputData, ConvertError> {
        if !path.exists() {
            return Err(ConvertError::FileNotFound(path.to_path_buf()));
        }

        let image = image::open(path).map_err(|e| {
            ConvertError::DecodeFailed(format!("{}: {}", path.display(), e))
        })?;

        self.prepare(&image.to_rgb8())
    }

    /// Crop, resize and normalise a decoded image
    pub fn prepare(&self, source: &RgbImage) -> std::result::Result<EngineInputData, ConvertError> {
        let settings = &self.settings;

        if settings.channels != DECODED_CHANNELS {
            return Err(ConvertError::ChannelMismatch {
                expected: settings.channels,
                actual: DECODED_CHANNELS,
            });
        }

        let (width, height) = source.dimensions();
        if width < settings.width || height < settings.height {
            return Err(ConvertError::ImageTooSmall {
                width,
                height,
                target_width: settings.width,
                target_height: settings.height,
            });
        }

        let (crop_width, crop_height) = self.crop_size(width, height);
        let x = (width - crop_width) / 2;
        let y = (height - crop_height) / 2;
        debug!(
            "Crop image from {}x{} to {}x{} at ({}, {})",
            width, height, crop_width, crop_height, x, y
        );

        let cropped = imageops::crop_imm(source, x, y, crop_width, crop_height).to_image();
        let resized = imageops::resize(&cropped, settings.width, settings.height, FilterType::Triangle);

        let plane_len = (settings.width * settings.height) as usize;
        let mut planes = vec![Vec::with_capacity(plane_len); DECODED_CHANNELS];
        for pixel in resized.pixels() {
            for (c, plane) in planes.iter_mut().enumerate() {
                let value = pixel[c] as f32 / 255.0;
                plane.push((value - settings.mean[c]) / settings.std[c]);
            }
        }

        Ok(EngineInputData::new(planes))
    }

    /// Largest centred region with the target aspect ratio, divided by zoom
    fn crop_size(&self, width: u32, height: u32) -> (u32, u32) {
        let target_width = self.settings.width as f32;
        let target_height = self.settings.height as f32;

        let (crop_width, crop_height) = if target_height > target_width {
            let ratio = target_width / target_height;
            let scaled = ratio * height as f32;
            if scaled <= width as f32 {
                (scaled as u32, height)
            } else {
                (width, (width as f32 / ratio) as u32)
            }
        } else {
            let ratio = target_height / target_width;
            let scaled = ratio * width as f32;
            if scaled <= height as f32 {
                (width, scaled as u32)
            } else {
                ((height as f32 / ratio) as u32, height)
            }
        };

        let zoom = self.settings.zoom;
        let crop_width = ((crop_width as f32 / zoom) as u32).clamp(1, width);
        let crop_height = ((crop_height as f32 / zoom) as u32).clamp(1, height);
        (crop_width, crop_height)
    }

    /// Deterministic gradient image at the target resolution, used for
    /// latency estimation
    pub fn synthetic_image(&self) -> RgbImage {
        let width = self.settings.width.max(1);
        let height = self.settings.height.max(1);
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([
                (x * 255 / width) as u8,
                (y * 255 / height) as u8,
                ((x + y) % 256) as u8,
            ])
        })
    }
}

impl ImageConverter for ImageConvertor {
    fn convert(&self, payload: &Payload) -> std::result::Result<EngineInputData, ConvertError> {
        let result = match payload {
            Payload::Bytes(data) => self.convert_bytes(data),
            Payload::Path(path) => self.convert_path(path),
        };

        if let Err(e) = &result {
            warn!("Image conversion failed: {}", e);
        }

        result
    }
}
