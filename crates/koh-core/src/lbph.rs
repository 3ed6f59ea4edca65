//! Local Binary Patterns Histograms (LBPH) face model.
//!
//! Each face is reduced to a grid of 256-bin histograms of 3x3 LBP codes.
//! Prediction is nearest neighbour over all trained samples using the
//! symmetric chi-square distance, so lower is better and identical faces
//! score `0.0`. Histograms are normalized per cell, which makes faces of
//! different crop sizes comparable.

use crate::engine::{FaceModel, ModelError};
use crate::types::{FaceImage, Identity};

const LBPH_BINS: usize = 256;
const LBPH_DEFAULT_GRID: usize = 8;
/// Smallest face that still yields one LBP code.
const LBPH_MIN_SIDE: u32 = 3;

/// Clockwise neighbour offsets starting top-left.
const NEIGHBOURS: [(i32, i32); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
];

pub struct LbphModel {
    grid_x: usize,
    grid_y: usize,
    samples: Vec<(Identity, Vec<f32>)>,
}

impl Default for LbphModel {
    fn default() -> Self {
        Self::new()
    }
}

impl LbphModel {
    pub fn new() -> Self {
        Self::with_grid(LBPH_DEFAULT_GRID, LBPH_DEFAULT_GRID)
    }

    pub fn with_grid(grid_x: usize, grid_y: usize) -> Self {
        Self {
            grid_x: grid_x.max(1),
            grid_y: grid_y.max(1),
            samples: Vec::new(),
        }
    }

    fn histogram(&self, face: &FaceImage) -> Result<Vec<f32>, ModelError> {
        if face.width() < LBPH_MIN_SIDE || face.height() < LBPH_MIN_SIDE {
            return Err(ModelError::FaceTooSmall {
                width: face.width(),
                height: face.height(),
            });
        }

        let (codes, w, h) = lbp_codes(face);
        let mut hist = vec![0.0f32; self.grid_x * self.grid_y * LBPH_BINS];

        for gy in 0..self.grid_y {
            let y0 = gy * h / self.grid_y;
            let y1 = (gy + 1) * h / self.grid_y;
            for gx in 0..self.grid_x {
                let x0 = gx * w / self.grid_x;
                let x1 = (gx + 1) * w / self.grid_x;
                let cell_pixels = (y1 - y0) * (x1 - x0);
                if cell_pixels == 0 {
                    continue;
                }

                let cell = &mut hist[(gy * self.grid_x + gx) * LBPH_BINS..][..LBPH_BINS];
                for y in y0..y1 {
                    for &code in &codes[y * w + x0..y * w + x1] {
                        cell[code as usize] += 1.0;
                    }
                }
                let norm = cell_pixels as f32;
                cell.iter_mut().for_each(|v| *v /= norm);
            }
        }

        Ok(hist)
    }
}

/// LBP code for every interior pixel; returns `(codes, width, height)`.
fn lbp_codes(face: &FaceImage) -> (Vec<u8>, usize, usize) {
    let w = face.width() as usize - 2;
    let h = face.height() as usize - 2;
    let mut codes = Vec::with_capacity(w * h);

    for y in 1..=h as i32 {
        for x in 1..=w as i32 {
            let center = face.pixel(x as u32, y as u32);
            let mut code = 0u8;
            for (bit, (dx, dy)) in NEIGHBOURS.iter().enumerate() {
                let n = face.pixel((x + dx) as u32, (y + dy) as u32);
                if n >= center {
                    code |= 1 << bit;
                }
            }
            codes.push(code);
        }
    }

    (codes, w, h)
}

/// Symmetric chi-square distance between two histograms.
fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&p, &q)| {
            let sum = (p + q) as f64;
            if sum > f64::EPSILON {
                let diff = (p - q) as f64;
                diff * diff / sum
            } else {
                0.0
            }
        })
        .sum()
}

impl FaceModel for LbphModel {
    fn train(&mut self, faces: &[FaceImage], labels: &[Identity]) -> Result<(), ModelError> {
        // Compute everything first so a bad face leaves the model untouched.
        let hists = faces
            .iter()
            .map(|f| self.histogram(f))
            .collect::<Result<Vec<_>, _>>()?;
        self.samples.extend(labels.iter().cloned().zip(hists));
        Ok(())
    }

    fn predict(&self, face: &FaceImage) -> Result<Option<(Identity, f64)>, ModelError> {
        if self.samples.is_empty() {
            return Ok(None);
        }
        let probe = self.histogram(face)?;

        let mut best: Option<(&Identity, f64)> = None;
        for (label, hist) in &self.samples {
            let dist = chi_square(&probe, hist);
            if best.map_or(true, |(_, d)| dist < d) {
                best = Some((label, dist));
            }
        }
        Ok(best.map(|(label, dist)| (label.clone(), dist)))
    }

    fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn min_face_side(&self) -> u32 {
        LBPH_MIN_SIDE
    }
}
