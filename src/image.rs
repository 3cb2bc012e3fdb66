//! The high-dynamic-range image accumulator: named float buffers with
//! pointwise additive merge, written out as Rgba32F OpenEXR.

use std::path::Path;

use anyhow::{bail, Context, Result};
use image::{DynamicImage, Rgba32FImage};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    width: u32,
    height: u32,
    buffers: Vec<(String, Vec<f32>)>,
}

impl Image {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            buffers: Vec::new(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn add_buffer(&mut self, name: &str, value: f32) {
        let len = (self.width * self.height) as usize;
        self.buffers.push((name.to_string(), vec![value; len]));
    }

    pub fn buffer(&self, name: &str) -> Option<&[f32]> {
        self.buffers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, data)| data.as_slice())
    }

    pub fn buffer_mut(&mut self, name: &str) -> Option<&mut [f32]> {
        self.buffers
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, data)| data.as_mut_slice())
    }

    /// Pointwise sum over matching buffers; buffers only the other image
    /// has are ignored. Dimensions must agree.
    pub fn merge(&mut self, other: &Image) -> Result<()> {
        if self.width != other.width || self.height != other.height {
            bail!(
                "cannot merge a {}x{} tile into a {}x{} image",
                other.width,
                other.height,
                self.width,
                self.height
            );
        }
        for (name, data) in &mut self.buffers {
            if let Some(theirs) = other.buffer(name) {
                for (mine, add) in data.iter_mut().zip(theirs) {
                    *mine += add;
                }
            }
        }
        Ok(())
    }

    /// Write the image as Rgba32F OpenEXR. Buffers named `r`, `g`, `b`,
    /// and `a` populate the channels; missing color channels are zero and
    /// a missing alpha is fully opaque.
    pub fn to_exr_file(&self, path: &Path) -> Result<()> {
        let len = (self.width * self.height) as usize;
        let zeros = vec![0.0f32; len];
        let r = self.buffer("r").unwrap_or(&zeros);
        let g = self.buffer("g").unwrap_or(&zeros);
        let b = self.buffer("b").unwrap_or(&zeros);
        let a = self.buffer("a");

        let pixels = Rgba32FImage::from_fn(self.width, self.height, |x, y| {
            let i = (y * self.width + x) as usize;
            image::Rgba([r[i], g[i], b[i], a.map(|a| a[i]).unwrap_or(1.0)])
        });

        DynamicImage::ImageRgba32F(pixels)
            .save(path)
            .with_context(|| format!("cannot write image {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_pointwise_addition_over_matching_buffers() {
        let mut base = Image::new(2, 2);
        base.add_buffer("r", 1.0);
        base.add_buffer("g", 0.0);

        let mut tile = Image::new(2, 2);
        tile.add_buffer("r", 0.25);
        tile.add_buffer("depth", 9.0);

        base.merge(&tile).unwrap();
        assert_eq!(base.buffer("r").unwrap(), &[1.25; 4]);
        assert_eq!(base.buffer("g").unwrap(), &[0.0; 4]);
        assert!(base.buffer("depth").is_none());
    }

    #[test]
    fn merge_rejects_mismatched_dimensions() {
        let mut base = Image::new(4, 2);
        assert!(base.merge(&Image::new(2, 2)).is_err());
    }

    #[test]
    fn exr_file_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tile.exr");

        let mut img = Image::new(3, 2);
        img.add_buffer("r", 0.5);
        img.add_buffer("g", 0.25);
        img.add_buffer("b", 0.125);
        img.to_exr_file(&path).unwrap();

        assert!(path.metadata().unwrap().len() > 0);
    }
}
