//! Grayscale and depth image buffers.

use crate::error::FrameError;

/// 8-bit grayscale image, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct GrayImage {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl GrayImage {
    pub fn new(width: usize, height: usize, data: Vec<u8>) -> Result<Self, FrameError> {
        if data.len() != width * height {
            return Err(FrameError::InvalidBuffer {
                width,
                height,
                len: data.len(),
            });
        }
        Ok(Self { width, height, data })
    }

    pub fn filled(width: usize, height: usize, value: u8) -> Self {
        Self {
            width,
            height,
            data: vec![value; width * height],
        }
    }

    /// Builds an image by evaluating `f(x, y)` at every pixel.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> u8) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self { width, height, data }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: u8) {
        self.data[y * self.width + x] = value;
    }

    /// Pixel access with coordinates clamped to the border.
    #[inline]
    pub fn get_clamped(&self, x: isize, y: isize) -> u8 {
        let xc = x.clamp(0, self.width as isize - 1) as usize;
        let yc = y.clamp(0, self.height as isize - 1) as usize;
        self.get(xc, yc)
    }

    /// Bilinear sample at a sub-pixel position. `None` outside the image.
    pub fn sample_bilinear(&self, x: f64, y: f64) -> Option<f64> {
        if x < 0.0 || y < 0.0 || x > (self.width - 1) as f64 || y > (self.height - 1) as f64 {
            return None;
        }
        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let fx = x - x0 as f64;
        let fy = y - y0 as f64;
        let top = self.get(x0, y0) as f64 * (1.0 - fx) + self.get(x1, y0) as f64 * fx;
        let bottom = self.get(x0, y1) as f64 * (1.0 - fx) + self.get(x1, y1) as f64 * fx;
        Some(top * (1.0 - fy) + bottom * fy)
    }

    /// Standard deviation of the intensities.
    pub fn contrast(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let n = self.data.len() as f64;
        let mean = self.data.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = self
            .data
            .iter()
            .map(|&v| {
                let d = v as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        var.sqrt()
    }

    /// Separable Gaussian blur with a kernel radius of ⌈3σ⌉.
    pub fn gaussian_blur(&self, sigma: f64) -> GrayImage {
        if sigma <= 0.0 || self.data.is_empty() {
            return self.clone();
        }
        let radius = (3.0 * sigma).ceil() as isize;
        let mut kernel: Vec<f64> = (-radius..=radius)
            .map(|i| (-(i * i) as f64 / (2.0 * sigma * sigma)).exp())
            .collect();
        let sum: f64 = kernel.iter().sum();
        kernel.iter_mut().for_each(|k| *k /= sum);

        let mut horizontal = vec![0.0f64; self.data.len()];
        for y in 0..self.height {
            for x in 0..self.width {
                let mut acc = 0.0;
                for (k, w) in kernel.iter().enumerate() {
                    acc += w * self.get_clamped(x as isize + k as isize - radius, y as isize) as f64;
                }
                horizontal[y * self.width + x] = acc;
            }
        }
        let mut out = vec![0u8; self.data.len()];
        for y in 0..self.height {
            for x in 0..self.width {
                let mut acc = 0.0;
                for (k, w) in kernel.iter().enumerate() {
                    let yy = (y as isize + k as isize - radius).clamp(0, self.height as isize - 1) as usize;
                    acc += w * horizontal[yy * self.width + x];
                }
                out[y * self.width + x] = acc.round().clamp(0.0, 255.0) as u8;
            }
        }
        GrayImage {
            width: self.width,
            height: self.height,
            data: out,
        }
    }

    /// Bilinear resize to the given dimensions.
    pub fn resize(&self, width: usize, height: usize) -> GrayImage {
        if width == self.width && height == self.height {
            return self.clone();
        }
        let sx = self.width as f64 / width.max(1) as f64;
        let sy = self.height as f64 / height.max(1) as f64;
        GrayImage::from_fn(width, height, |x, y| {
            let src_x = ((x as f64 + 0.5) * sx - 0.5).clamp(0.0, (self.width - 1) as f64);
            let src_y = ((y as f64 + 0.5) * sy - 0.5).clamp(0.0, (self.height - 1) as f64);
            self.sample_bilinear(src_x, src_y)
                .map_or(0, |v| v.round().clamp(0.0, 255.0) as u8)
        })
    }
}

/// Metric depth image, row-major. Zero or negative entries are invalid.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthImage {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl DepthImage {
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Result<Self, FrameError> {
        if data.len() != width * height {
            return Err(FrameError::InvalidBuffer {
                width,
                height,
                len: data.len(),
            });
        }
        Ok(Self { width, height, data })
    }

    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> f32) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self { width, height, data }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Depth at a pixel, `None` when invalid or out of bounds.
    pub fn get(&self, x: usize, y: usize) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let d = self.data[y * self.width + x];
        (d.is_finite() && d > 0.0).then_some(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_mismatched_buffer() {
        assert!(matches!(
            GrayImage::new(4, 4, vec![0; 15]),
            Err(FrameError::InvalidBuffer { len: 15, .. })
        ));
    }

    #[test]
    fn test_blur_preserves_constant_image() {
        let img = GrayImage::filled(20, 10, 77);
        assert_eq!(img.gaussian_blur(2.0), img);
    }

    #[test]
    fn test_bilinear_midpoint() {
        let img = GrayImage::new(2, 1, vec![0, 100]).expect("image");
        assert_eq!(img.sample_bilinear(0.5, 0.0), Some(50.0));
        assert!(img.sample_bilinear(1.5, 0.0).is_none());
    }

    #[test]
    fn test_contrast_of_flat_image_is_zero() {
        assert_eq!(GrayImage::filled(8, 8, 30).contrast(), 0.0);
        let checker = GrayImage::from_fn(8, 8, |x, y| if (x + y) % 2 == 0 { 0 } else { 200 });
        assert!((checker.contrast() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_resize_halves_dimensions() {
        let img = GrayImage::from_fn(40, 30, |x, _| (x * 5) as u8);
        let small = img.resize(20, 15);
        assert_eq!((small.width(), small.height()), (20, 15));
    }
}
