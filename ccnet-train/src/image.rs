//! Image debugging hooks for image datasets.
//!
//! Rendering real reconstructions needs the model; the hub only drives an
//! [`ImageDebugger`] at checkpoints and forwards the picture to the tracker.

use ccnet_core::{MlError, Result};
use ndarray::{ArrayD, ArrayView3, Axis, Ix3};

/// An 8-bit picture, row-major, `channels` interleaved values per pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugImage {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub pixels: Vec<u8>,
}

impl DebugImage {
    /// Binary PGM (1 channel) or PPM (3 channels) encoding.
    pub fn to_pnm(&self) -> Result<Vec<u8>> {
        let magic = match self.channels {
            1 => "P5",
            3 => "P6",
            n => {
                return Err(MlError::invalid_input(format!(
                    "cannot encode {n}-channel image as PNM"
                )));
            }
        };
        let mut out = format!("{magic}\n{} {}\n255\n", self.width, self.height).into_bytes();
        out.extend_from_slice(&self.pixels);
        Ok(out)
    }
}

/// Produces debug pictures during training.
pub trait ImageDebugger {
    /// Receive the samples selected for display at the start of training.
    fn initialize(&mut self, samples: &[ArrayD<f32>]) -> Result<()>;

    /// Refresh internal state before a checkpoint.
    fn update_images(&mut self) -> Result<()>;

    /// Current picture, if any.
    fn display_image(&self) -> Option<DebugImage>;
}

/// Tiles `[channels, height, width]` or `[height, width]` samples side by
/// side, min-max scaled per sample.
#[derive(Debug, Default)]
pub struct SampleGridDebugger {
    samples: Vec<ArrayD<f32>>,
    rendered: Option<DebugImage>,
}

impl SampleGridDebugger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether samples of `shape` can be rendered: grayscale `[H, W]`, or
    /// `[1|3, H, W]`.
    pub fn supports(shape: &[usize]) -> bool {
        matches!(shape, [_, _] | [1 | 3, _, _])
    }

    fn planes(sample: &ArrayD<f32>) -> Result<ArrayView3<'_, f32>> {
        let view = match sample.ndim() {
            2 => sample.view().insert_axis(Axis(0)),
            _ => sample.view(),
        };
        view.into_dimensionality::<Ix3>()
            .map_err(|e| MlError::shape(e.to_string()))
    }

    fn render(&self) -> Result<Option<DebugImage>> {
        let Some(first) = self.samples.first() else {
            return Ok(None);
        };
        if !Self::supports(first.shape()) {
            return Err(MlError::shape(format!(
                "debug images must be [H, W] or [1|3, H, W], got {:?}",
                first.shape()
            )));
        }
        let (channels, height, width) = Self::planes(first)?.dim();

        let grid_width = width * self.samples.len();
        let mut pixels = vec![0u8; grid_width * height * channels];
        for (tile, sample) in self.samples.iter().enumerate() {
            if sample.shape() != first.shape() {
                return Err(MlError::shape("debug samples differ in shape"));
            }
            let lo = sample.iter().copied().fold(f32::INFINITY, f32::min);
            let hi = sample.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let span = if hi > lo { hi - lo } else { 1.0 };
            for ((c, y, x), v) in Self::planes(sample)?.indexed_iter() {
                let col = tile * width + x;
                let idx = (y * grid_width + col) * channels + c;
                pixels[idx] = (((v - lo) / span) * 255.0).round() as u8;
            }
        }

        Ok(Some(DebugImage {
            width: grid_width,
            height,
            channels,
            pixels,
        }))
    }
}

impl ImageDebugger for SampleGridDebugger {
    fn initialize(&mut self, samples: &[ArrayD<f32>]) -> Result<()> {
        self.samples = samples.to_vec();
        self.rendered = None;
        Ok(())
    }

    fn update_images(&mut self) -> Result<()> {
        self.rendered = self.render()?;
        Ok(())
    }

    fn display_image(&self) -> Option<DebugImage> {
        self.rendered.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn};

    #[test]
    fn test_grid_tiles_samples() {
        let a = Array::from_shape_vec(IxDyn(&[1, 2, 2]), vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        let b = Array::from_shape_vec(IxDyn(&[1, 2, 2]), vec![5.0; 4]).unwrap();
        let mut debugger = SampleGridDebugger::new();
        debugger.initialize(&[a, b]).unwrap();
        assert!(debugger.display_image().is_none());

        debugger.update_images().unwrap();
        let image = debugger.display_image().unwrap();
        assert_eq!((image.width, image.height, image.channels), (4, 2, 1));
        assert_eq!(image.pixels, vec![0, 85, 0, 0, 170, 255, 0, 0]);
        assert!(image.to_pnm().unwrap().starts_with(b"P5\n4 2\n255\n"));
    }

    #[test]
    fn test_grayscale_samples_render_as_one_channel() {
        let a = Array::from_shape_vec(IxDyn(&[2, 4]), (0..8).map(|v| v as f32).collect()).unwrap();
        let mut debugger = SampleGridDebugger::new();
        debugger.initialize(&[a]).unwrap();
        debugger.update_images().unwrap();

        let image = debugger.display_image().unwrap();
        assert_eq!((image.width, image.height, image.channels), (4, 2, 1));
        assert_eq!(image.pixels.first(), Some(&0));
        assert_eq!(image.pixels.last(), Some(&255));
    }

    #[test]
    fn test_supported_shapes() {
        assert!(SampleGridDebugger::supports(&[28, 28]));
        assert!(SampleGridDebugger::supports(&[1, 28, 28]));
        assert!(SampleGridDebugger::supports(&[3, 8, 8]));
        assert!(!SampleGridDebugger::supports(&[4, 8, 8]));
        assert!(!SampleGridDebugger::supports(&[64]));
        assert!(!SampleGridDebugger::supports(&[2, 3, 4, 5]));
    }

    #[test]
    fn test_rejects_flat_samples() {
        let flat = Array::zeros(IxDyn(&[8]));
        let mut debugger = SampleGridDebugger::new();
        debugger.initialize(&[flat]).unwrap();
        assert!(debugger.update_images().is_err());
    }
}
