//! Texture data and its GPU-side form.

use half::f16;

use crate::errors::{LumenError, Result};
use crate::hal::TextureId;

/// Formats accepted for in-memory and decoded texture data.
const SUPPORTED_FORMATS: &[(wgpu::TextureFormat, u32, u32)] = &[
    // (format, bytes per pixel, components)
    (wgpu::TextureFormat::Rgba8Unorm, 4, 4),
    (wgpu::TextureFormat::Rgba8UnormSrgb, 4, 4),
    (wgpu::TextureFormat::Rgba16Float, 8, 4),
    (wgpu::TextureFormat::Rgba32Float, 16, 4),
    (wgpu::TextureFormat::R8Unorm, 1, 1),
];

fn format_info(format: wgpu::TextureFormat) -> Option<(u32, u32)> {
    SUPPORTED_FORMATS
        .iter()
        .find(|(f, _, _)| *f == format)
        .map(|&(_, bpp, components)| (bpp, components))
}

fn format_index(format: wgpu::TextureFormat) -> u8 {
    SUPPORTED_FORMATS
        .iter()
        .position(|(f, _, _)| *f == format)
        .map_or(u8::MAX, |i| i as u8)
}

/// Raw pixel data plus format metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    pub format: wgpu::TextureFormat,
    pub pixels: Vec<u8>,
    pub has_transparency: bool,
}

/// One level of a mip chain.
#[derive(Debug, Clone, PartialEq)]
pub struct MipLevel {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl ImageData {
    /// RGBA8 sRGB data; transparency is detected from the alpha channel.
    #[must_use]
    pub fn from_rgba8(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        let has_transparency = pixels.chunks_exact(4).any(|p| p[3] < 255);
        Self {
            width,
            height,
            format: wgpu::TextureFormat::Rgba8UnormSrgb,
            pixels,
            has_transparency,
        }
    }

    #[must_use]
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let pixels = rgba.repeat((width * height) as usize);
        Self::from_rgba8(width, height, pixels)
    }

    /// Decodes an encoded image (PNG, JPEG, HDR).
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes)?;
        Ok(Self::from_dynamic(image))
    }

    #[must_use]
    pub fn from_dynamic(image: image::DynamicImage) -> Self {
        match image {
            image::DynamicImage::ImageRgb32F(_) | image::DynamicImage::ImageRgba32F(_) => {
                let rgba = image.to_rgba32f();
                let (width, height) = rgba.dimensions();
                let has_transparency = rgba.pixels().any(|p| p.0[3] < 1.0);
                Self {
                    width,
                    height,
                    format: wgpu::TextureFormat::Rgba32Float,
                    pixels: bytemuck::cast_slice(rgba.as_raw()).to_vec(),
                    has_transparency,
                }
            }
            other => {
                let rgba = other.to_rgba8();
                let (width, height) = rgba.dimensions();
                Self::from_rgba8(width, height, rgba.into_raw())
            }
        }
    }

    #[must_use]
    pub fn bytes_per_pixel(&self) -> u32 {
        format_info(self.format).map_or(0, |(bpp, _)| bpp)
    }

    pub fn validate(&self, source_name: &str) -> Result<()> {
        let fail = |reason: String| {
            Err(LumenError::MalformedTexture {
                source_name: source_name.to_owned(),
                reason,
            })
        };
        let Some((bpp, _)) = format_info(self.format) else {
            return fail(format!("unsupported format {:?}", self.format));
        };
        if self.width == 0 || self.height == 0 {
            return fail(format!("zero-sized image {}x{}", self.width, self.height));
        }
        let expected = self.width as usize * self.height as usize * bpp as usize;
        if self.pixels.len() != expected {
            return fail(format!(
                "{} bytes for {}x{} {:?}, expected {expected}",
                self.pixels.len(),
                self.width,
                self.height,
                self.format
            ));
        }
        Ok(())
    }

    /// Cache identity of in-memory data: dimensions, format and
    /// transparency. The payload is deliberately not hashed.
    #[must_use]
    pub fn shape_hash(&self) -> u64 {
        let mut bytes = [0u8; 10];
        bytes[0..4].copy_from_slice(&self.width.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.height.to_le_bytes());
        bytes[8] = format_index(self.format);
        bytes[9] = u8::from(self.has_transparency);
        xxhash_rust::xxh3::xxh3_64(&bytes)
    }

    /// Nearest-neighbour downsample so neither side exceeds `max_size`.
    /// Returns `None` when the image already fits.
    #[must_use]
    pub fn clamped(&self, max_size: u32) -> Option<Self> {
        if self.width <= max_size && self.height <= max_size {
            return None;
        }
        let scale = max_size as f32 / self.width.max(self.height) as f32;
        let width = ((self.width as f32 * scale) as u32).clamp(1, max_size);
        let height = ((self.height as f32 * scale) as u32).clamp(1, max_size);
        let bpp = self.bytes_per_pixel() as usize;

        let mut pixels = Vec::with_capacity(width as usize * height as usize * bpp);
        for y in 0..height {
            let sy = (y as u64 * u64::from(self.height) / u64::from(height)) as usize;
            for x in 0..width {
                let sx = (x as u64 * u64::from(self.width) / u64::from(width)) as usize;
                let src = (sy * self.width as usize + sx) * bpp;
                pixels.extend_from_slice(&self.pixels[src..src + bpp]);
            }
        }
        Some(Self {
            width,
            height,
            format: self.format,
            pixels,
            has_transparency: self.has_transparency,
        })
    }

    /// Full mip level count for these dimensions.
    #[must_use]
    pub fn full_mip_count(&self) -> u32 {
        32 - self.width.max(self.height).max(1).leading_zeros()
    }

    /// Box-filtered levels 1.. of the mip chain.
    #[must_use]
    pub fn mip_chain(&self) -> Vec<MipLevel> {
        let Some((bpp, components)) = format_info(self.format) else {
            return Vec::new();
        };
        let component_size = (bpp / components) as usize;
        let components = components as usize;

        let mut levels = Vec::new();
        let (mut width, mut height) = (self.width, self.height);
        let mut src = self.pixels.clone();

        while width > 1 || height > 1 {
            let (w2, h2) = ((width / 2).max(1), (height / 2).max(1));
            let mut owned = Vec::with_capacity(w2 as usize * h2 as usize * bpp as usize);
            for y in 0..h2 {
                for x in 0..w2 {
                    for c in 0..components {
                        let mut sum = 0.0;
                        let mut taps = 0.0;
                        for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                            let sx = (x * 2 + dx).min(width - 1) as usize;
                            let sy = (y * 2 + dy).min(height - 1) as usize;
                            let at = ((sy * width as usize + sx) * components + c) * component_size;
                            sum += read_component(&src[at..at + component_size]);
                            taps += 1.0;
                        }
                        write_component(&mut owned, sum / taps, component_size);
                    }
                }
            }
            levels.push(MipLevel {
                width: w2,
                height: h2,
                pixels: owned.clone(),
            });
            width = w2;
            height = h2;
            src = owned;
        }
        levels
    }
}

fn read_component(bytes: &[u8]) -> f32 {
    match bytes.len() {
        1 => f32::from(bytes[0]),
        2 => f16::from_le_bytes([bytes[0], bytes[1]]).to_f32(),
        _ => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
    }
}

fn write_component(out: &mut Vec<u8>, value: f32, size: usize) {
    match size {
        1 => out.push(value.round().clamp(0.0, 255.0) as u8),
        2 => out.extend_from_slice(&f16::from_f32(value).to_le_bytes()),
        _ => out.extend_from_slice(&value.to_le_bytes()),
    }
}

/// A texture resident on the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuTexture {
    pub id: TextureId,
    pub width: u32,
    pub height: u32,
    pub format: wgpu::TextureFormat,
    pub mip_levels: u32,
    pub has_transparency: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_hash_ignores_payload() {
        let a = ImageData::solid(4, 4, [255, 0, 0, 255]);
        let b = ImageData::solid(4, 4, [0, 255, 0, 255]);
        let c = ImageData::solid(4, 4, [0, 255, 0, 128]);
        assert_eq!(a.shape_hash(), b.shape_hash());
        assert_ne!(a.shape_hash(), c.shape_hash());
    }

    #[test]
    fn test_validate_size_mismatch() {
        let mut img = ImageData::solid(2, 2, [0; 4]);
        img.pixels.pop();
        assert!(matches!(
            img.validate("x"),
            Err(LumenError::MalformedTexture { .. })
        ));
    }

    #[test]
    fn test_clamp_keeps_aspect() {
        let img = ImageData::solid(64, 16, [1, 2, 3, 255]);
        let clamped = img.clamped(32).unwrap();
        assert_eq!((clamped.width, clamped.height), (32, 8));
        assert!(clamped.validate("x").is_ok());
        assert!(img.clamped(64).is_none());
    }

    #[test]
    fn test_mip_chain_box_filter() {
        // 2x1: black and white texels average to mid grey.
        let img = ImageData::from_rgba8(2, 1, vec![0, 0, 0, 255, 255, 255, 255, 255]);
        let chain = img.mip_chain();
        assert_eq!(chain.len(), 1);
        assert_eq!((chain[0].width, chain[0].height), (1, 1));
        assert_eq!(chain[0].pixels[0], 128);
        assert_eq!(img.full_mip_count(), 2);
    }

    #[test]
    fn test_mip_chain_half_float() {
        let one = f16::from_f32(1.0).to_le_bytes();
        let pixels: Vec<u8> = std::iter::repeat_n(one, 4 * 4).flatten().collect();
        let img = ImageData {
            width: 2,
            height: 2,
            format: wgpu::TextureFormat::Rgba16Float,
            pixels,
            has_transparency: false,
        };
        let chain = img.mip_chain();
        assert_eq!(chain[0].pixels.len(), 8);
        assert_eq!(f16::from_le_bytes([chain[0].pixels[0], chain[0].pixels[1]]).to_f32(), 1.0);
    }
}
