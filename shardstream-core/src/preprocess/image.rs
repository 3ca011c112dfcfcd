//! Image decoding, encoding and augmentation
//!
//! Encoders turn a decoded image into a normalised `[C, H, W]` tensor.
//! Augmentation runs after encoding, on the tensor itself.

use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array, Array3, Axis, Dimension};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::f32::consts::PI;

use crate::error::DecodeError;

/// Decode PNG or JPEG bytes
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, DecodeError> {
    image::load_from_memory(bytes).map_err(|e| DecodeError::Image(e.to_string()))
}

/// Image to `[C, H, W]` features
pub trait ImageEncoder: Send + Sync {
    /// Encode one image
    fn encode(&self, image: &DynamicImage) -> Array3<f32>;

    /// Shape of every encoded tensor, `[C, H, W]`
    fn output_shape(&self) -> [usize; 3];
}

/// Configuration for CLIP-style encoding
#[derive(Debug, Clone, PartialEq)]
pub struct ClipImageEncoderConfig {
    /// Output side length
    pub size: u32,
    /// Normalization mean (RGB)
    pub mean: [f32; 3],
    /// Normalization standard deviation (RGB)
    pub std: [f32; 3],
    /// Rescaling factor applied to raw pixel values
    pub rescale_factor: f32,
}

impl Default for ClipImageEncoderConfig {
    fn default() -> Self {
        Self {
            size: 224,
            #[allow(clippy::excessive_precision)]
            mean: [0.48145466, 0.4578275, 0.40821073],
            #[allow(clippy::excessive_precision)]
            std: [0.26862954, 0.26130258, 0.27577711],
            rescale_factor: 1.0 / 255.0,
        }
    }
}

/// Shortest-side resize, center crop, rescale and normalise
#[derive(Debug, Clone, Default)]
pub struct ClipImageEncoder {
    config: ClipImageEncoderConfig,
}

impl ClipImageEncoder {
    /// Create an encoder
    pub fn new(config: ClipImageEncoderConfig) -> Self {
        Self { config }
    }
}

impl ImageEncoder for ClipImageEncoder {
    fn encode(&self, image: &DynamicImage) -> Array3<f32> {
        let size = self.config.size;
        let rgb = image
            .resize_to_fill(size, size, FilterType::Triangle)
            .to_rgb8();
        let (width, height) = (rgb.width() as usize, rgb.height() as usize);
        let scale = self.config.rescale_factor;

        Array3::from_shape_fn((3, height, width), |(c, y, x)| {
            let value = rgb.get_pixel(x as u32, y as u32)[c] as f32;
            (value * scale - self.config.mean[c]) / self.config.std[c]
        })
    }

    fn output_shape(&self) -> [usize; 3] {
        let side = self.config.size as usize;
        [3, side, side]
    }
}

/// Random flip plus brightness and hue jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Augmentation {
    /// Probability of a horizontal flip
    pub flip_prob: f64,
    /// Brightness factor drawn from `[1 - b, 1 + b]`
    pub brightness: f32,
    /// Hue rotation drawn from `[-h, h]` turns
    pub hue: f32,
}

impl Default for Augmentation {
    fn default() -> Self {
        Self {
            flip_prob: 0.5,
            brightness: 0.5,
            hue: 0.3,
        }
    }
}

impl Augmentation {
    /// No-op augmentation
    pub fn disabled() -> Self {
        Self {
            flip_prob: 0.0,
            brightness: 0.0,
            hue: 0.0,
        }
    }

    /// Augment `tensor` in place.
    ///
    /// The last three axes are `[C, H, W]`; leading axes share one draw.
    pub fn apply<D: Dimension>(&self, tensor: &mut Array<f32, D>, rng: &mut ChaCha8Rng) {
        let flip = rng.gen_bool(self.flip_prob.clamp(0.0, 1.0));
        let factor = 1.0 + self.brightness * rng.gen_range(-1.0f32..=1.0);
        let turns = self.hue * rng.gen_range(-1.0f32..=1.0);

        let ndim = tensor.ndim();
        if ndim < 3 {
            return;
        }

        if flip {
            tensor.invert_axis(Axis(ndim - 1));
        }
        if factor != 1.0 {
            tensor.mapv_inplace(|v| v * factor);
        }

        let channel_axis = Axis(ndim - 3);
        if turns != 0.0 && tensor.len_of(channel_axis) == 3 {
            let m = hue_rotation(turns * 2.0 * PI);
            for mut lane in tensor.lanes_mut(channel_axis) {
                let (r, g, b) = (lane[0], lane[1], lane[2]);
                lane[0] = m[0][0] * r + m[0][1] * g + m[0][2] * b;
                lane[1] = m[1][0] * r + m[1][1] * g + m[1][2] * b;
                lane[2] = m[2][0] * r + m[2][1] * g + m[2][2] * b;
            }
        }
    }
}

/// RGB -> YIQ, rotate the chroma plane by `theta`, YIQ -> RGB
fn hue_rotation(theta: f32) -> [[f32; 3]; 3] {
    const TO_YIQ: [[f32; 3]; 3] = [
        [0.299, 0.587, 0.114],
        [0.596, -0.274, -0.322],
        [0.211, -0.523, 0.312],
    ];
    const TO_RGB: [[f32; 3]; 3] = [
        [1.0, 0.956, 0.621],
        [1.0, -0.272, -0.647],
        [1.0, -1.106, 1.703],
    ];
    let (sin, cos) = theta.sin_cos();
    let rotate = [[1.0, 0.0, 0.0], [0.0, cos, -sin], [0.0, sin, cos]];
    matmul(&TO_RGB, &matmul(&rotate, &TO_YIQ))
}

fn matmul(a: &[[f32; 3]; 3], b: &[[f32; 3]; 3]) -> [[f32; 3]; 3] {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod testing {
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    /// PNG bytes of a solid-colour image
    pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb([200, 120, 40]));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::png_bytes;
    use super::*;
    use ndarray::Array4;
    use rand::SeedableRng;

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_image(b"not an image"), Err(DecodeError::Image(_))));
        assert_eq!(decode_image(&png_bytes(4, 3)).unwrap().width(), 4);
    }

    #[test]
    fn test_clip_encoder_shape() {
        let encoder = ClipImageEncoder::new(ClipImageEncoderConfig {
            size: 16,
            ..Default::default()
        });
        let image = decode_image(&png_bytes(40, 20)).unwrap();
        let tensor = encoder.encode(&image);
        assert_eq!(tensor.shape(), &[3, 16, 16]);
        assert_eq!(encoder.output_shape(), [3, 16, 16]);

        let expected = (200.0 / 255.0 - 0.48145466) / 0.26862954;
        assert!((tensor[[0, 8, 8]] - expected).abs() < 1e-3);
    }

    #[test]
    fn test_hue_rotation_identity_at_zero() {
        let m = hue_rotation(0.0);
        for (i, row) in m.iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((v - expected).abs() < 0.01, "m[{}][{}] = {}", i, j, v);
            }
        }
    }

    #[test]
    fn test_augmentation_reproducible_and_shape_preserving() {
        let base = Array4::from_shape_fn((2, 3, 4, 5), |(n, c, y, x)| (n + c + y * x) as f32);
        let aug = Augmentation::default();

        let mut a = base.clone();
        let mut b = base.clone();
        aug.apply(&mut a, &mut ChaCha8Rng::seed_from_u64(1));
        aug.apply(&mut b, &mut ChaCha8Rng::seed_from_u64(1));
        assert_eq!(a, b);
        assert_eq!(a.shape(), base.shape());

        let mut c = base.clone();
        Augmentation::disabled().apply(&mut c, &mut ChaCha8Rng::seed_from_u64(1));
        assert_eq!(c, base);
    }
}
