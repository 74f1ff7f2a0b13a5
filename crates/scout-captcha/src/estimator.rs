use async_trait::async_trait;
use image::{GrayImage, ImageReader, LumaA};
use scout_core::ScoutError;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Alpha at or above which a piece pixel counts as part of the piece.
pub const OPAQUE_ALPHA: u8 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GapEstimate {
    /// Horizontal pixel offset of the gap's left edge in the challenge image.
    pub position: u32,
    /// In `[0, 1]`.
    pub confidence: f64,
}

/// Strategy that locates the gap a puzzle piece fits into.
#[async_trait]
pub trait GapEstimator: Send + Sync {
    async fn estimate(&self, challenge: &[u8], piece: &[u8]) -> Result<GapEstimate, ScoutError>;
}

/// Slides the opaque part of the piece across the challenge at the same rows and picks the
/// offset with the lowest mean absolute luminance difference.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateMatchEstimator;

impl TemplateMatchEstimator {
    pub fn new() -> Self {
        Self
    }

    pub fn estimate_blocking(challenge: &[u8], piece: &[u8]) -> Result<GapEstimate, ScoutError> {
        let background = decode(challenge, "challenge")?.to_luma8();
        let piece = decode(piece, "piece")?.to_luma_alpha8();
        let mask = PieceMask::from_image(&piece)?;

        if mask.max_y >= background.height() {
            return Err(ScoutError::validation(format!(
                "piece rows reach {} but the challenge is only {} px tall",
                mask.max_y,
                background.height()
            )));
        }
        if mask.width() > background.width() {
            return Err(ScoutError::validation(format!(
                "piece is {} px wide but the challenge is only {} px wide",
                mask.width(),
                background.width()
            )));
        }

        let last_offset = background.width() - mask.width();
        let mut best: Option<(u32, f64)> = None;
        let mut total_cost = 0.0;
        for offset in 0..=last_offset {
            let cost = mask.cost_at(&background, offset);
            total_cost += cost;
            if best.map_or(true, |(_, best_cost)| cost < best_cost) {
                best = Some((offset, cost));
            }
        }
        let (position, best_cost) = best.unwrap_or((0, 0.0));
        let mean_cost = total_cost / f64::from(last_offset + 1);
        let confidence = if mean_cost > 0.0 {
            (1.0 - best_cost / mean_cost).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Ok(GapEstimate {
            position,
            confidence,
        })
    }
}

#[async_trait]
impl GapEstimator for TemplateMatchEstimator {
    async fn estimate(&self, challenge: &[u8], piece: &[u8]) -> Result<GapEstimate, ScoutError> {
        let challenge = challenge.to_vec();
        let piece = piece.to_vec();
        tokio::task::spawn_blocking(move || Self::estimate_blocking(&challenge, &piece))
            .await
            .map_err(|err| ScoutError::Storage(anyhow::anyhow!("gap estimation task failed: {err}")))?
    }
}

fn decode(bytes: &[u8], what: &str) -> Result<image::DynamicImage, ScoutError> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|err| ScoutError::validation(format!("reading {what} image: {err}")))?
        .decode()
        .map_err(|err| ScoutError::validation(format!("decoding {what} image: {err}")))
}

/// Opaque pixels of the piece inside their bounding box.
struct PieceMask {
    min_x: u32,
    max_x: u32,
    max_y: u32,
    pixels: Vec<(u32, u32, u8)>,
}

impl PieceMask {
    fn from_image(piece: &image::ImageBuffer<LumaA<u8>, Vec<u8>>) -> Result<Self, ScoutError> {
        let pixels: Vec<(u32, u32, u8)> = piece
            .enumerate_pixels()
            .filter(|(_, _, px)| px.0[1] >= OPAQUE_ALPHA)
            .map(|(x, y, px)| (x, y, px.0[0]))
            .collect();
        let (Some(min_x), Some(max_x), Some(max_y)) = (
            pixels.iter().map(|p| p.0).min(),
            pixels.iter().map(|p| p.0).max(),
            pixels.iter().map(|p| p.1).max(),
        ) else {
            return Err(ScoutError::validation("piece image has no opaque pixels"));
        };
        Ok(Self {
            min_x,
            max_x,
            max_y,
            pixels,
        })
    }

    fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    fn cost_at(&self, background: &GrayImage, offset: u32) -> f64 {
        let sum: u64 = self
            .pixels
            .iter()
            .map(|&(x, y, luma)| {
                let bg = background.get_pixel(offset + (x - self.min_x), y).0[0];
                u64::from(luma.abs_diff(bg))
            })
            .sum();
        sum as f64 / self.pixels.len() as f64
    }
}
