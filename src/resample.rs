//! Image resampling through any transform model
//!
//! Every destination pixel is mapped back into the source with the model's
//! inverse conversion, row by row, which is the access pattern the adapters'
//! caches are tuned for.

use std::sync::Arc;

use serde::Serialize;

use crate::error::PoolResult;
use crate::pool::{CompressiblePooledVector, CountLimitedPool};
use crate::transform::TransfoModel;

/// Dimensions of an interleaved 8-bit raster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterLayout {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
}

impl RasterLayout {
    pub fn new(width: usize, height: usize, channels: usize) -> Self {
        Self {
            width,
            height,
            channels: channels.clamp(1, 4),
        }
    }

    pub fn stride(&self) -> usize {
        self.width * self.channels
    }

    pub fn len(&self) -> usize {
        self.stride() * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarpStats {
    pub converted: usize,
    /// Pixels left untouched because their conversion failed
    pub failed: usize,
}

impl WarpStats {
    fn merge(&mut self, other: WarpStats) {
        self.converted += other.converted;
        self.failed += other.failed;
    }
}

/// Warp `src` into `dst`. Pixels whose conversion fails keep their value.
pub fn warp_image(
    model: &dyn TransfoModel,
    src: &[u8],
    src_layout: RasterLayout,
    dst: &mut [u8],
    dst_layout: RasterLayout,
) -> WarpStats {
    let mut stats = WarpStats::default();
    if src_layout.is_empty() || dst_layout.is_empty() {
        return stats;
    }
    let stride = dst_layout.stride();
    for (dst_y, row) in dst.chunks_mut(stride).take(dst_layout.height).enumerate() {
        stats.merge(warp_row(model, src, src_layout, row, dst_y, dst_layout.channels));
    }
    stats
}

/// Warp into rows held by a compressible pool, so that only the most recently
/// written rows stay inflated when the image exceeds the pool budget
pub fn warp_into_pool(
    model: &dyn TransfoModel,
    src: &[u8],
    src_layout: RasterLayout,
    dst_layout: RasterLayout,
    pool: &Arc<CountLimitedPool<u8>>,
) -> PoolResult<(Vec<CompressiblePooledVector<u8>>, WarpStats)> {
    let mut stats = WarpStats::default();
    let mut rows = Vec::with_capacity(dst_layout.height);
    let mut scratch = vec![0u8; dst_layout.stride()];

    for dst_y in 0..dst_layout.height {
        scratch.iter_mut().for_each(|value| *value = 0);
        if !src_layout.is_empty() {
            stats.merge(warp_row(model, src, src_layout, &mut scratch, dst_y, dst_layout.channels));
        }
        let row = CompressiblePooledVector::with_capacity(pool, scratch.len())?;
        row.extend_from_slice(&scratch)?;
        rows.push(row);
    }
    Ok((rows, stats))
}

fn warp_row(
    model: &dyn TransfoModel,
    src: &[u8],
    src_layout: RasterLayout,
    row: &mut [u8],
    dst_y: usize,
    channels: usize,
) -> WarpStats {
    let mut stats = WarpStats::default();
    for (dst_x, pixel) in row.chunks_mut(channels).enumerate() {
        // Map destination pixel to source coordinates
        let Ok(p) = model.convert_inverse(dst_x as f64, dst_y as f64) else {
            stats.failed += 1;
            continue;
        };
        let sample = bilinear_sample(src, src_layout, p.x, p.y);
        for (value, sampled) in pixel.iter_mut().zip(sample.iter()) {
            *value = *sampled;
        }
        stats.converted += 1;
    }
    stats
}

/// Bilinear interpolation, clamped to the image borders
fn bilinear_sample(src: &[u8], layout: RasterLayout, x: f64, y: f64) -> [u8; 4] {
    let RasterLayout {
        width,
        height,
        channels,
    } = layout;
    let stride = layout.stride();

    let x = x.max(0.0).min((width - 1) as f64);
    let y = y.max(0.0).min((height - 1) as f64);

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let mut result = [0u8; 4];

    for (c, out) in result.iter_mut().enumerate().take(channels) {
        let p00 = src.get(y0 * stride + x0 * channels + c).copied().unwrap_or(0) as f64;
        let p10 = src.get(y0 * stride + x1 * channels + c).copied().unwrap_or(0) as f64;
        let p01 = src.get(y1 * stride + x0 * channels + c).copied().unwrap_or(0) as f64;
        let p11 = src.get(y1 * stride + x1 * channels + c).copied().unwrap_or(0) as f64;

        let value = p00 * (1.0 - fx) * (1.0 - fy)
            + p10 * fx * (1.0 - fy)
            + p01 * (1.0 - fx) * fy
            + p11 * fx * fy;

        *out = value.round().clamp(0.0, 255.0) as u8;
    }

    result
}

/// Black and white squares of `cell` pixels, replicated on every channel
pub fn checkerboard(layout: RasterLayout, cell: usize) -> Vec<u8> {
    let cell = cell.max(1);
    let mut data = Vec::with_capacity(layout.len());
    for y in 0..layout.height {
        for x in 0..layout.width {
            let value = if (x / cell + y / cell) % 2 == 0 { 255 } else { 0 };
            data.extend(std::iter::repeat(value).take(layout.channels));
        }
    }
    data
}
