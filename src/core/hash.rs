use std::fmt;
use std::io;
use std::path::Path;

use clap::ValueEnum;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use image_hasher::{HashAlg, Hasher, HasherConfig, ImageHash};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Image decoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Hash computation failed: {message}")]
    ComputationFailed { message: String },
}

/// The perceptual hash functions a run can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
pub enum HashFunction {
    /// DCT-based perceptual hash
    #[value(name = "phash")]
    #[serde(rename = "phash")]
    Perceptual,
    /// Mean-threshold hash
    #[value(name = "ahash")]
    #[serde(rename = "ahash")]
    Average,
    /// Horizontal gradient hash
    #[value(name = "dhash")]
    #[serde(rename = "dhash")]
    Difference,
    /// Haar wavelet hash
    #[value(name = "whash")]
    #[serde(rename = "whash")]
    Wavelet,
}

impl HashFunction {
    pub fn name(self) -> &'static str {
        match self {
            HashFunction::Perceptual => "phash",
            HashFunction::Average => "ahash",
            HashFunction::Difference => "dhash",
            HashFunction::Wavelet => "whash",
        }
    }
}

impl fmt::Display for HashFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Opaque hash signature. Its string form is the grouping key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PerceptualHash(String);

impl PerceptualHash {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

const HASH_SIDE: u32 = 8;
const WAVELET_INPUT_SIDE: u32 = 64;

/// Computes perceptual hashes with one configured function.
pub struct ImageHasher {
    function: HashFunction,
    hasher: Option<Hasher>,
}

impl ImageHasher {
    pub fn new(function: HashFunction) -> Self {
        let config = HasherConfig::new().hash_size(HASH_SIDE, HASH_SIDE);
        let hasher = match function {
            HashFunction::Perceptual => Some(config.hash_alg(HashAlg::Mean).preproc_dct().to_hasher()),
            HashFunction::Average => Some(config.hash_alg(HashAlg::Mean).to_hasher()),
            HashFunction::Difference => Some(config.hash_alg(HashAlg::Gradient).to_hasher()),
            HashFunction::Wavelet => None,
        };
        Self { function, hasher }
    }

    pub fn function(&self) -> HashFunction {
        self.function
    }

    /// Decode the file and hash its pixels.
    pub fn hash_file(&self, path: &Path) -> Result<PerceptualHash, HashError> {
        let img = ImageReader::open(path)?.with_guessed_format()?.decode()?;
        self.hash_image(&img)
    }

    pub fn hash_image(&self, img: &DynamicImage) -> Result<PerceptualHash, HashError> {
        match &self.hasher {
            Some(hasher) => Ok(PerceptualHash::new(hasher.hash_image(img).to_base64())),
            None => {
                let bits = wavelet_bits(img);
                let hash = ImageHash::<Box<[u8]>>::from_bytes(&bits).map_err(|e| {
                    HashError::ComputationFailed {
                        message: format!("{e:?}"),
                    }
                })?;
                Ok(PerceptualHash::new(hash.to_base64()))
            }
        }
    }
}

/// Haar wavelet hash: the low-frequency band of a 64x64 grayscale reduction,
/// thresholded against its median.
fn wavelet_bits(img: &DynamicImage) -> Vec<u8> {
    let gray = img
        .resize_exact(WAVELET_INPUT_SIDE, WAVELET_INPUT_SIDE, FilterType::Lanczos3)
        .to_luma8();
    let mut plane: Vec<f32> = gray.pixels().map(|p| f32::from(p[0]) / 255.0).collect();
    let mut side = WAVELET_INPUT_SIDE as usize;
    while side > HASH_SIDE as usize {
        plane = haar_approximation(&plane, side);
        side /= 2;
    }

    let mut sorted = plane.clone();
    sorted.sort_by(f32::total_cmp);
    let mid = sorted.len() / 2;
    let median = (sorted[mid - 1] + sorted[mid]) / 2.0;

    let mut bits = vec![0u8; plane.len().div_ceil(8)];
    for (i, value) in plane.iter().enumerate() {
        if *value > median {
            bits[i / 8] |= 1 << (i % 8);
        }
    }
    bits
}

/// One level of the 2-D Haar transform, keeping only the LL band.
fn haar_approximation(plane: &[f32], side: usize) -> Vec<f32> {
    let half = side / 2;
    let mut out = vec![0.0; half * half];
    for y in 0..half {
        for x in 0..half {
            let top = 2 * y * side + 2 * x;
            let bottom = top + side;
            out[y * half + x] =
                (plane[top] + plane[top + 1] + plane[bottom] + plane[bottom + 1]) / 2.0;
        }
    }
    out
}
