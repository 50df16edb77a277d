//! # Fingerprint Module
//!
//! Derives a perceptual difference hash (dHash) from image bytes.
//!
//! ## Algorithm
//! 1. Decode and convert to single-channel greyscale
//! 2. Force-fill resize to a `grid` x `grid` image (16x16 by default)
//! 3. For each row, compare every pixel with its right neighbour
//!    (`grid - 1` comparisons per row); bit is `1` when the left pixel is
//!    strictly brighter
//! 4. Pack bits four at a time into hex digits, most significant bit first,
//!    zero-padding an incomplete final nibble
//!
//! A 16x16 grid yields 240 bits, i.e. a 60 digit hex string. The output must
//! stay bit-for-bit stable: stored fingerprints are compared across runs.
//!
//! dHash tracks structural gradients. It survives mild recompression and
//! resizing but not rotation or cropping.

mod decode;
mod resize;

pub use decode::{decode_bytes, decode_path};
pub use resize::{resize_to_grayscale, GridResizer};

use crate::error::{CompareError, FingerprintError};
use image::{DynamicImage, GenericImageView, GrayImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default fingerprint grid edge
pub const DEFAULT_GRID: u32 = 16;

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// A fixed-width lowercase hex fingerprint.
///
/// Every digit carries four bits. Two fingerprints are only comparable when
/// they have the same length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Parse a hex string, normalising to lowercase
    pub fn parse(hex: &str) -> Result<Self, CompareError> {
        if hex.is_empty() {
            return Err(CompareError::Empty);
        }
        if let Some((position, found)) = hex.char_indices().find(|(_, c)| !c.is_ascii_hexdigit())
        {
            return Err(CompareError::InvalidHex { position, found });
        }
        Ok(Self(hex.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of hex digits
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of bits the fingerprint encodes
    pub fn bit_len(&self) -> u32 {
        (self.0.len() * 4) as u32
    }

    /// Nibble values, one per hex digit
    pub fn nibbles(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.bytes().map(nibble_value)
    }
}

fn nibble_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        // Construction only admits lowercase hex digits
        _ => 0,
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = CompareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = CompareError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

/// Produces difference-hash fingerprints
#[derive(Debug, Clone, Copy)]
pub struct FingerprintGenerator {
    grid: u32,
}

impl FingerprintGenerator {
    /// Create a generator with a custom grid edge (minimum 2)
    pub fn new(grid: u32) -> Self {
        Self { grid: grid.max(2) }
    }

    pub fn grid(&self) -> u32 {
        self.grid
    }

    /// Hex digits in every fingerprint this generator emits
    pub fn fingerprint_len(&self) -> usize {
        let bits = (self.grid * (self.grid - 1)) as usize;
        bits.div_ceil(4)
    }

    /// Fingerprint encoded image bytes
    pub fn fingerprint(&self, bytes: &[u8]) -> Result<Fingerprint, FingerprintError> {
        let image = decode_bytes(bytes)?;
        self.fingerprint_image(&image)
    }

    /// Fingerprint an already decoded image
    pub fn fingerprint_image(&self, image: &DynamicImage) -> Result<Fingerprint, FingerprintError> {
        let (width, height) = image.dimensions();
        let required = u64::from(self.grid) * u64::from(self.grid);
        if u64::from(width) * u64::from(height) < required {
            return Err(FingerprintError::TooSmall {
                width,
                height,
                grid: self.grid,
            });
        }

        let gray = resize_to_grayscale(image, self.grid, self.grid)?;
        Ok(Fingerprint(pack_bits(&difference_bits(&gray))))
    }
}

impl Default for FingerprintGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_GRID)
    }
}

/// Row-wise left-vs-right comparisons of a greyscale grid
fn difference_bits(gray: &GrayImage) -> Vec<bool> {
    let (width, height) = gray.dimensions();
    let mut bits = Vec::with_capacity((height * width.saturating_sub(1)) as usize);
    for y in 0..height {
        for x in 0..width.saturating_sub(1) {
            bits.push(gray.get_pixel(x, y)[0] > gray.get_pixel(x + 1, y)[0]);
        }
    }
    bits
}

/// Pack bits MSB-first into hex digits; the last nibble is zero-padded
fn pack_bits(bits: &[bool]) -> String {
    bits.chunks(4)
        .map(|chunk| {
            let nibble = chunk
                .iter()
                .enumerate()
                .filter(|(_, bit)| **bit)
                .fold(0u8, |acc, (i, _)| acc | (1 << (3 - i)));
            HEX_DIGITS[nibble as usize] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, ImageFormat, Luma, Rgb};
    use std::io::Cursor;

    fn png_bytes(image: &DynamicImage) -> Vec<u8> {
        let mut bytes = Cursor::new(Vec::new());
        image.write_to(&mut bytes, ImageFormat::Png).unwrap();
        bytes.into_inner()
    }

    #[test]
    fn packs_msb_first_and_pads_last_nibble() {
        assert_eq!(pack_bits(&[true, false, false, false]), "8");
        assert_eq!(pack_bits(&[false, false, false, true]), "1");
        assert_eq!(pack_bits(&[true, true, true, true, true]), "f8");
        assert_eq!(pack_bits(&[false, true, true]), "6");
    }

    #[test]
    fn difference_bits_compare_right_neighbour() {
        let gray: GrayImage = ImageBuffer::from_raw(3, 1, vec![200, 100, 100]).unwrap();
        assert_eq!(difference_bits(&gray), vec![true, false]);
    }

    #[test]
    fn sixteen_grid_yields_sixty_hex_digits() {
        let generator = FingerprintGenerator::default();
        assert_eq!(generator.fingerprint_len(), 60);

        let image = DynamicImage::ImageRgb8(ImageBuffer::from_fn(64, 48, |x, y| {
            Rgb([(x * 4) as u8, (y * 5) as u8, ((x * y) % 255) as u8])
        }));
        let fingerprint = generator.fingerprint(&png_bytes(&image)).unwrap();
        assert_eq!(fingerprint.len(), 60);
        assert_eq!(fingerprint.bit_len(), 240);
    }

    #[test]
    fn uniform_image_is_all_zero() {
        let image = DynamicImage::ImageLuma8(ImageBuffer::from_pixel(32, 32, Luma([128u8])));
        let fingerprint = FingerprintGenerator::default()
            .fingerprint_image(&image)
            .unwrap();
        assert_eq!(fingerprint.as_str(), "0".repeat(60));
    }

    #[test]
    fn left_to_right_darkening_sets_every_bit() {
        let image = DynamicImage::ImageLuma8(ImageBuffer::from_fn(160, 32, |x, _| {
            Luma([(255 - x) as u8])
        }));
        let fingerprint = FingerprintGenerator::default()
            .fingerprint_image(&image)
            .unwrap();
        assert_eq!(fingerprint.as_str(), "f".repeat(60));
    }

    #[test]
    fn same_bytes_give_same_fingerprint() {
        let image = DynamicImage::ImageRgb8(ImageBuffer::from_fn(50, 50, |x, y| {
            Rgb([((x + y) * 2) as u8, 10, 200])
        }));
        let bytes = png_bytes(&image);
        let generator = FingerprintGenerator::default();
        assert_eq!(
            generator.fingerprint(&bytes).unwrap(),
            generator.fingerprint(&bytes).unwrap()
        );
    }

    #[test]
    fn rejects_images_smaller_than_grid() {
        let image = DynamicImage::ImageLuma8(ImageBuffer::from_pixel(8, 8, Luma([10u8])));
        let result = FingerprintGenerator::default().fingerprint_image(&image);
        assert!(matches!(result, Err(FingerprintError::TooSmall { .. })));
    }

    #[test]
    fn rejects_undecodable_bytes() {
        let result = FingerprintGenerator::default().fingerprint(b"\x00\x01\x02");
        assert!(matches!(result, Err(FingerprintError::InvalidImage { .. })));
    }

    #[test]
    fn parse_normalises_case_and_rejects_non_hex() {
        assert_eq!(Fingerprint::parse("F0a1").unwrap().as_str(), "f0a1");
        assert_eq!(
            Fingerprint::parse("f0g1"),
            Err(CompareError::InvalidHex {
                position: 2,
                found: 'g'
            })
        );
        assert_eq!(Fingerprint::parse(""), Err(CompareError::Empty));
    }

    #[test]
    fn serde_round_trips_as_plain_string() {
        let fingerprint = Fingerprint::parse("abc123").unwrap();
        let json = serde_json::to_string(&fingerprint).unwrap();
        assert_eq!(json, "\"abc123\"");
        assert!(serde_json::from_str::<Fingerprint>("\"xyz\"").is_err());
    }
}
