// density.rs

use ndarray::{Array2, Zip};
use std::fmt;
use std::str::FromStr;

use crate::process::NicheError;

/// Default grid resolution (100x100 cells over the pooled background scores).
pub const DEFAULT_RESOLUTION: usize = 100;

/// Regular grid over the shared ordination plane. Identical for every group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpec {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
    pub resolution: usize,
}

impl GridSpec {
    /// Bounding box of `scores`; a zero-width axis is widened by 0.5 each way.
    pub fn from_scores(scores: &[[f64; 2]], resolution: usize) -> Result<Self, NicheError> {
        if resolution < 2 {
            return Err(NicheError::Config(format!(
                "grid resolution must be at least 2, got {}",
                resolution
            )));
        }
        let finite: Vec<&[f64; 2]> = scores.iter().filter(|p| p[0].is_finite() && p[1].is_finite()).collect();
        if finite.is_empty() {
            return Err(NicheError::Config("no background scores to span the grid".to_string()));
        }
        let (mut x_min, mut x_max) = (f64::INFINITY, f64::NEG_INFINITY);
        let (mut y_min, mut y_max) = (f64::INFINITY, f64::NEG_INFINITY);
        for p in finite {
            x_min = x_min.min(p[0]);
            x_max = x_max.max(p[0]);
            y_min = y_min.min(p[1]);
            y_max = y_max.max(p[1]);
        }
        if x_max - x_min <= f64::EPSILON {
            x_min -= 0.5;
            x_max += 0.5;
        }
        if y_max - y_min <= f64::EPSILON {
            y_min -= 0.5;
            y_max += 0.5;
        }
        Ok(GridSpec {
            x_min,
            x_max,
            y_min,
            y_max,
            resolution,
        })
    }

    pub fn x_step(&self) -> f64 {
        (self.x_max - self.x_min) / (self.resolution - 1) as f64
    }

    pub fn y_step(&self) -> f64 {
        (self.y_max - self.y_min) / (self.resolution - 1) as f64
    }

    pub fn x_at(&self, i: usize) -> f64 {
        self.x_min + i as f64 * self.x_step()
    }

    pub fn y_at(&self, j: usize) -> f64 {
        self.y_min + j as f64 * self.y_step()
    }

    pub fn n_cells(&self) -> usize {
        self.resolution * self.resolution
    }
}

/// Kernel bandwidth selection rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bandwidth {
    /// Reference bandwidth: sigma * n^(-1/6), sigma = sqrt((var x + var y) / 2).
    Href,
    Scott,
    Silverman,
    Fixed(f64),
}

impl Default for Bandwidth {
    fn default() -> Self {
        Bandwidth::Href
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Bandwidth::Href => write!(f, "href"),
            Bandwidth::Scott => write!(f, "scott"),
            Bandwidth::Silverman => write!(f, "silverman"),
            Bandwidth::Fixed(h) => write!(f, "{}", h),
        }
    }
}

impl FromStr for Bandwidth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "href" => Ok(Bandwidth::Href),
            "scott" => Ok(Bandwidth::Scott),
            "silverman" => Ok(Bandwidth::Silverman),
            other => match other.parse::<f64>() {
                Ok(h) if h > 0.0 && h.is_finite() => Ok(Bandwidth::Fixed(h)),
                _ => Err(format!(
                    "invalid bandwidth '{}': expected href, scott, silverman or a positive number",
                    s
                )),
            },
        }
    }
}

fn variance(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1) as f64
}

fn interquartile_range(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let quantile = |q: f64| {
        let pos = q * (sorted.len() - 1) as f64;
        let lo = pos.floor() as usize;
        let hi = pos.ceil() as usize;
        sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
    };
    quantile(0.75) - quantile(0.25)
}

impl Bandwidth {
    /// Per-axis bandwidth for `points`, floored at one grid step.
    pub fn compute(&self, points: &[[f64; 2]], grid: &GridSpec) -> (f64, f64) {
        let n = points.len().max(1) as f64;
        let xs: Vec<f64> = points.iter().map(|p| p[0]).collect();
        let ys: Vec<f64> = points.iter().map(|p| p[1]).collect();
        let (hx, hy) = match *self {
            Bandwidth::Href => {
                let sigma = (0.5 * (variance(&xs) + variance(&ys))).sqrt();
                let h = sigma * n.powf(-1.0 / 6.0);
                (h, h)
            }
            Bandwidth::Scott => (
                variance(&xs).sqrt() * n.powf(-1.0 / 6.0),
                variance(&ys).sqrt() * n.powf(-1.0 / 6.0),
            ),
            Bandwidth::Silverman => {
                let rule = |v: &[f64]| {
                    let sd = variance(v).sqrt();
                    let iqr = interquartile_range(v) / 1.34;
                    let spread = if iqr > 0.0 { sd.min(iqr) } else { sd };
                    0.9 * spread * n.powf(-0.2)
                };
                (rule(&xs), rule(&ys))
            }
            Bandwidth::Fixed(h) => (h, h),
        };
        (hx.max(grid.x_step()), hy.max(grid.y_step()))
    }
}

/// Tuning of the density estimator.
#[derive(Debug, Clone, Copy)]
pub struct DensityParams {
    pub bandwidth: Bandwidth,
    /// Kernel support in bandwidths; cells further away receive exactly zero.
    pub kernel_cutoff: f64,
    /// Cells with availability / max below this are outside the background support.
    pub support_threshold: f64,
    /// Cells with corrected density / max below this are unoccupied.
    pub occupancy_threshold: f64,
}

impl Default for DensityParams {
    fn default() -> Self {
        DensityParams {
            bandwidth: Bandwidth::Href,
            kernel_cutoff: 4.0,
            support_threshold: 1e-6,
            occupancy_threshold: 1e-6,
        }
    }
}

fn axis_weights(center: f64, origin: f64, step: f64, h: f64, cutoff: f64, resolution: usize) -> Vec<(usize, f64)> {
    let reach = cutoff * h;
    let lo = ((center - reach - origin) / step).ceil().max(0.0);
    let hi = ((center + reach - origin) / step).floor().min((resolution - 1) as f64);
    if hi < lo {
        return Vec::new();
    }
    (lo as usize..=hi as usize)
        .map(|i| {
            let d = (origin + i as f64 * step - center) / h;
            (i, (-0.5 * d * d).exp())
        })
        .collect()
}

/// Unnormalised Gaussian product-kernel density of `points` at every cell.
/// Indexed `[x, y]`.
pub fn kernel_density(grid: &GridSpec, points: &[[f64; 2]], bandwidth: (f64, f64), cutoff: f64) -> Array2<f64> {
    let r = grid.resolution;
    let mut surface = Array2::<f64>::zeros((r, r));
    let (hx, hy) = bandwidth;
    for p in points {
        let wx = axis_weights(p[0], grid.x_min, grid.x_step(), hx, cutoff, r);
        if wx.is_empty() {
            continue;
        }
        let wy = axis_weights(p[1], grid.y_min, grid.y_step(), hy, cutoff, r);
        for &(i, a) in &wx {
            for &(j, b) in &wy {
                surface[[i, j]] += a * b;
            }
        }
    }
    surface
}

/// Scales `surface` to sum 1; `None` when it has no mass.
pub fn normalize(surface: &Array2<f64>) -> Option<Array2<f64>> {
    let total = surface.sum();
    if total > 0.0 && total.is_finite() {
        Some(surface / total)
    } else {
        None
    }
}

fn max_value(surface: &Array2<f64>) -> f64 {
    surface.iter().copied().fold(0.0, f64::max)
}

/// A group's background availability surface and its support mask.
#[derive(Debug, Clone)]
pub struct Availability {
    pub surface: Array2<f64>,
    pub support: Array2<bool>,
    pub n_background: usize,
}

impl Availability {
    pub fn estimate(
        group: &str,
        grid: &GridSpec,
        background: &[[f64; 2]],
        params: &DensityParams,
    ) -> Result<Self, NicheError> {
        if background.is_empty() {
            return Err(NicheError::InsufficientData {
                group: group.to_string(),
                stage: "background density",
            });
        }
        let h = params.bandwidth.compute(background, grid);
        let raw = kernel_density(grid, background, h, params.kernel_cutoff);
        let surface = normalize(&raw).ok_or_else(|| NicheError::InsufficientData {
            group: group.to_string(),
            stage: "background density",
        })?;
        let peak = max_value(&surface);
        let support = surface.mapv(|v| v > 0.0 && v / peak > params.support_threshold);
        Ok(Availability {
            surface,
            support,
            n_background: background.len(),
        })
    }
}

/// Occurrence and availability surfaces for one group over the shared grid.
#[derive(Debug, Clone)]
pub struct DensityGrid {
    pub group: String,
    pub spec: GridSpec,
    pub availability: Array2<f64>,
    pub background_support: Array2<bool>,
    /// Kernel density of occurrences, sum 1, not corrected for availability.
    pub occurrence_raw: Array2<f64>,
    /// Availability-corrected density, zero outside `occupied`, sum 1.
    pub occurrence_density: Array2<f64>,
    pub occupied: Array2<bool>,
    pub n_occurrences: usize,
    pub n_background: usize,
}

impl DensityGrid {
    pub fn occupied_cells(&self) -> usize {
        self.occupied.iter().filter(|o| **o).count()
    }

    /// Sum of occurrence density over occupied cells.
    pub fn occupied_mass(&self) -> f64 {
        Zip::from(&self.occurrence_density)
            .and(&self.occupied)
            .fold(0.0, |acc, d, o| if *o { acc + d } else { acc })
    }
}

/// Corrects the occurrence kernel density by the group's availability.
pub fn estimate_with_availability(
    group: &str,
    grid: &GridSpec,
    availability: &Availability,
    occurrences: &[[f64; 2]],
    params: &DensityParams,
) -> Result<DensityGrid, NicheError> {
    if occurrences.is_empty() {
        return Err(NicheError::InsufficientData {
            group: group.to_string(),
            stage: "occurrence density",
        });
    }
    let empty = || NicheError::EmptyGridOverlap {
        group: group.to_string(),
    };

    let h = params.bandwidth.compute(occurrences, grid);
    let raw = kernel_density(grid, occurrences, h, params.kernel_cutoff);
    let occurrence_raw = normalize(&raw).ok_or_else(empty)?;

    let mut corrected = Array2::<f64>::zeros(occurrence_raw.dim());
    Zip::from(&mut corrected)
        .and(&occurrence_raw)
        .and(&availability.surface)
        .and(&availability.support)
        .for_each(|c, &z, &a, &inside| {
            if inside && a > 0.0 {
                *c = z / a;
            }
        });

    let peak = max_value(&corrected);
    if !(peak > 0.0) {
        return Err(empty());
    }
    let occupied = corrected.mapv(|v| v / peak > params.occupancy_threshold);
    Zip::from(&mut corrected).and(&occupied).for_each(|c, &o| {
        if !o {
            *c = 0.0;
        }
    });
    let occurrence_density = normalize(&corrected).ok_or_else(empty)?;

    Ok(DensityGrid {
        group: group.to_string(),
        spec: *grid,
        availability: availability.surface.clone(),
        background_support: availability.support.clone(),
        occurrence_raw,
        occurrence_density,
        occupied,
        n_occurrences: occurrences.len(),
        n_background: availability.n_background,
    })
}

/// Density grid for one group from its background and occurrence scores.
pub fn estimate(
    group: &str,
    grid: &GridSpec,
    background: &[[f64; 2]],
    occurrences: &[[f64; 2]],
    params: &DensityParams,
) -> Result<DensityGrid, NicheError> {
    let availability = Availability::estimate(group, grid, background, params)?;
    estimate_with_availability(group, grid, &availability, occurrences, params)
}
