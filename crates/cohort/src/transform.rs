//! Image decoding and the fixed-size tensor transform.
//!
//! Decode → grayscale/RGB → Lanczos3 resize → center crop → `[0, 1]` floats →
//! optional standardization. The transform is a pure function of the image
//! bytes and its parameters.

use std::path::Path;

use image::imageops::FilterType;
use image::DynamicImage;

use crate::config::DataConfig;
use crate::error::{CohortError, CohortResult};

/// Global intensity mean of the training corpus.
pub const PIXEL_MEAN: f32 = 0.5364;
/// Global intensity standard deviation of the training corpus.
pub const PIXEL_STD: f32 = 0.2816;

/// Channel-major `(C, H, W)` float image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub data: Vec<f32>,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl ImageTensor {
    pub fn zeros(channels: usize, height: usize, width: usize) -> Self {
        Self {
            data: vec![0.0; channels * height * width],
            channels,
            height,
            width,
        }
    }

    /// Single-channel square tensor with ones on the main diagonal.
    pub fn diagonal(size: usize) -> Self {
        let mut t = Self::zeros(1, size, size);
        for i in 0..size {
            t.data[i * size + i] = 1.0;
        }
        t
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.channels, self.height, self.width]
    }

    fn at(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[(c * self.height + y) * self.width + x]
    }

    /// Rotate by `k` quarter turns counter-clockwise.
    pub fn rotate90(&self, k: usize) -> Self {
        let mut out = self.clone();
        for _ in 0..(k % 4) {
            out = out.rotate_once();
        }
        out
    }

    fn rotate_once(&self) -> Self {
        let (h, w) = (self.height, self.width);
        let mut data = Vec::with_capacity(self.data.len());
        for c in 0..self.channels {
            // New image is w × h: out[y][x] = in[x][w - 1 - y]
            for y in 0..w {
                for x in 0..h {
                    data.push(self.at(c, x, w - 1 - y));
                }
            }
        }
        Self {
            data,
            channels: self.channels,
            height: w,
            width: h,
        }
    }

    /// Mirror along the vertical axis.
    pub fn flip_horizontal(&self) -> Self {
        let mut data = Vec::with_capacity(self.data.len());
        for c in 0..self.channels {
            for y in 0..self.height {
                for x in (0..self.width).rev() {
                    data.push(self.at(c, y, x));
                }
            }
        }
        Self { data, ..*self }
    }

    /// Affine intensity change `x * scale + shift`.
    pub fn jitter(&self, scale: f32, shift: f32) -> Self {
        Self {
            data: self.data.iter().map(|v| v * scale + shift).collect(),
            ..*self
        }
    }
}

/// How the decoded image is brought to the target size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeMode {
    /// Resize the shorter side to the target keeping aspect ratio, then
    /// center-crop. Used for normal training data.
    ShorterSide,
    /// Resize to exactly target × target. Used for test data.
    Exact,
}

/// Parameters of the image → tensor pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTransform {
    pub image_size: u32,
    pub channels: usize,
    pub standardize: bool,
    pub resize: ResizeMode,
}

impl ImageTransform {
    pub fn new(image_size: u32, channels: usize, standardize: bool, resize: ResizeMode) -> Self {
        Self {
            image_size,
            channels,
            standardize,
            resize,
        }
    }

    pub fn from_config(config: &DataConfig, resize: ResizeMode) -> Self {
        Self::new(config.image_size, config.img_channels, config.standardize, resize)
    }

    /// Decode `path` and transform it.
    pub fn load(&self, path: &Path) -> CohortResult<ImageTensor> {
        let img = image::open(path).map_err(|source| CohortError::Image {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(self.apply(&img))
    }

    /// Transform an already decoded image.
    pub fn apply(&self, img: &DynamicImage) -> ImageTensor {
        let s = self.image_size;
        let img = match self.channels {
            1 => DynamicImage::ImageLuma8(img.to_luma8()),
            _ => DynamicImage::ImageRgb8(img.to_rgb8()),
        };

        let img = match self.resize {
            ResizeMode::Exact => img.resize_exact(s, s, FilterType::Lanczos3),
            ResizeMode::ShorterSide => {
                let (w, h) = (img.width(), img.height());
                let (nw, nh) = shorter_side_dims(w, h, s);
                img.resize_exact(nw, nh, FilterType::Lanczos3)
            }
        };
        let img = center_crop(&img, s);

        let size = s as usize;
        let mut tensor = ImageTensor::zeros(self.channels, size, size);
        match self.channels {
            1 => {
                let gray = img.to_luma8();
                for (i, p) in gray.pixels().enumerate() {
                    tensor.data[i] = p.0[0] as f32 / 255.0;
                }
            }
            _ => {
                let rgb = img.to_rgb8();
                let plane = size * size;
                for (i, p) in rgb.pixels().enumerate() {
                    for c in 0..3 {
                        tensor.data[c * plane + i] = p.0[c] as f32 / 255.0;
                    }
                }
            }
        }

        if self.standardize {
            for v in tensor.data.iter_mut() {
                *v = (*v - PIXEL_MEAN) / PIXEL_STD;
            }
        }
        tensor
    }
}

/// Output dimensions when the shorter side is scaled to `target`.
pub fn shorter_side_dims(width: u32, height: u32, target: u32) -> (u32, u32) {
    if width <= height {
        let nh = (height as u64 * target as u64 / width.max(1) as u64) as u32;
        (target, nh.max(target))
    } else {
        let nw = (width as u64 * target as u64 / height.max(1) as u64) as u32;
        (nw.max(target), target)
    }
}

fn center_crop(img: &DynamicImage, size: u32) -> DynamicImage {
    if img.width() == size && img.height() == size {
        return img.clone();
    }
    let left = img.width().saturating_sub(size) / 2;
    let top = img.height().saturating_sub(size) / 2;
    img.crop_imm(left, top, size, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    fn gradient(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(w, h, |x, y| {
            Luma([((x * 7 + y * 3) % 256) as u8])
        }))
    }

    #[test]
    fn test_shorter_side_dims() {
        assert_eq!(shorter_side_dims(320, 390, 128), (128, 156));
        assert_eq!(shorter_side_dims(390, 320, 128), (156, 128));
        assert_eq!(shorter_side_dims(64, 64, 32), (32, 32));
    }

    #[test]
    fn test_output_shape_both_modes() {
        let img = gradient(40, 60);
        for mode in [ResizeMode::ShorterSide, ResizeMode::Exact] {
            let t = ImageTransform::new(16, 1, false, mode).apply(&img);
            assert_eq!(t.shape(), [1, 16, 16]);
            assert_eq!(t.data.len(), 256);
        }
        let t = ImageTransform::new(16, 3, false, ResizeMode::Exact).apply(&img);
        assert_eq!(t.shape(), [3, 16, 16]);
    }

    #[test]
    fn test_values_in_unit_range() {
        let t = ImageTransform::new(20, 1, false, ResizeMode::ShorterSide).apply(&gradient(50, 30));
        assert!(t.data.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_standardize_constant_image() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(8, 8, Luma([255])));
        let t = ImageTransform::new(8, 1, true, ResizeMode::Exact).apply(&img);
        let expected = (1.0 - PIXEL_MEAN) / PIXEL_STD;
        assert!(t.data.iter().all(|v| (v - expected).abs() < 1e-5));
    }

    #[test]
    fn test_transform_is_deterministic() {
        let img = gradient(33, 47);
        let tf = ImageTransform::new(24, 1, true, ResizeMode::ShorterSide);
        assert_eq!(tf.apply(&img), tf.apply(&img));
    }

    #[test]
    fn test_rgb_channel_planes() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([255, 0, 51])));
        let t = ImageTransform::new(4, 3, false, ResizeMode::Exact).apply(&img);
        assert!((t.data[0] - 1.0).abs() < 1e-6);
        assert!(t.data[16].abs() < 1e-6);
        assert!((t.data[32] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_rotate_and_flip() {
        // 1 × 2 × 2: [[a, b], [c, d]]
        let t = ImageTensor {
            data: vec![1.0, 2.0, 3.0, 4.0],
            channels: 1,
            height: 2,
            width: 2,
        };
        // Counter-clockwise: [[b, d], [a, c]]
        assert_eq!(t.rotate90(1).data, vec![2.0, 4.0, 1.0, 3.0]);
        assert_eq!(t.rotate90(2).data, vec![4.0, 3.0, 2.0, 1.0]);
        assert_eq!(t.rotate90(4), t);
        assert_eq!(t.flip_horizontal().data, vec![2.0, 1.0, 4.0, 3.0]);
    }

    #[test]
    fn test_diagonal_mask() {
        let m = ImageTensor::diagonal(3);
        assert_eq!(m.data, vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_load_missing_file_is_image_error() {
        let tf = ImageTransform::new(8, 1, false, ResizeMode::Exact);
        let err = tf.load(Path::new("/definitely/not/here.png")).unwrap_err();
        assert!(matches!(err, CohortError::Image { .. }));
    }
}
