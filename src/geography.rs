// geography.rs

use crate::process::NicheError;
use crate::progress::{log, LogLevel};

use geo::{
    Area, BooleanOps, BoundingRect, Buffer, Coord, ConvexHull, Intersects, LineString, MultiPoint,
    MultiPolygon, Point, Rect,
};
use ndarray::Array2;
use rayon::prelude::*;
use std::collections::HashSet;

/// A single deduplicated occurrence record, WGS84 degrees.
#[derive(Debug, Clone, PartialEq)]
pub struct OccurrencePoint {
    pub group: String,
    pub longitude: f64,
    pub latitude: f64,
}

impl OccurrencePoint {
    pub fn new(group: &str, longitude: f64, latitude: f64) -> Self {
        OccurrencePoint {
            group: group.to_string(),
            longitude,
            latitude,
        }
    }

    pub fn point(&self) -> Point<f64> {
        Point::new(self.longitude, self.latitude)
    }
}

/// A stack of co-registered environmental bands on one regular grid.
///
/// Each band is stored as an `nrows x ncols` array, row 0 at the north edge.
/// Missing cells hold NaN.
#[derive(Debug, Clone)]
pub struct EnvStack {
    pub band_names: Vec<String>,
    pub west: f64,
    pub north: f64,
    pub cell_size: f64,
    bands: Vec<Array2<f64>>,
}

impl EnvStack {
    pub fn new(
        band_names: Vec<String>,
        west: f64,
        north: f64,
        cell_size: f64,
        bands: Vec<Array2<f64>>,
    ) -> Result<Self, NicheError> {
        if bands.is_empty() {
            return Err(NicheError::DimensionMismatch(
                "environmental stack has no bands".to_string(),
            ));
        }
        if band_names.len() != bands.len() {
            return Err(NicheError::DimensionMismatch(format!(
                "{} band names for {} bands",
                band_names.len(),
                bands.len()
            )));
        }
        if !(cell_size > 0.0) || !cell_size.is_finite() {
            return Err(NicheError::Config(format!(
                "raster cell size must be positive, got {}",
                cell_size
            )));
        }
        let shape = bands[0].dim();
        for (name, band) in band_names.iter().zip(&bands) {
            if band.dim() != shape {
                return Err(NicheError::DimensionMismatch(format!(
                    "band '{}' has shape {:?}, expected {:?}",
                    name,
                    band.dim(),
                    shape
                )));
            }
        }
        if shape.0 == 0 || shape.1 == 0 {
            return Err(NicheError::DimensionMismatch(format!(
                "environmental bands have no cells (shape {:?})",
                shape
            )));
        }
        Ok(EnvStack {
            band_names,
            west,
            north,
            cell_size,
            bands,
        })
    }

    pub fn n_bands(&self) -> usize {
        self.bands.len()
    }

    pub fn nrows(&self) -> usize {
        self.bands[0].nrows()
    }

    pub fn ncols(&self) -> usize {
        self.bands[0].ncols()
    }

    pub fn east(&self) -> f64 {
        self.west + self.ncols() as f64 * self.cell_size
    }

    pub fn south(&self) -> f64 {
        self.north - self.nrows() as f64 * self.cell_size
    }

    /// Row/column of the cell containing `(x, y)`. The east and south edges
    /// belong to the last column and row.
    pub fn cell_index(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        if !x.is_finite() || !y.is_finite() {
            return None;
        }
        if x < self.west || x > self.east() || y > self.north || y < self.south() {
            return None;
        }
        let col = (((x - self.west) / self.cell_size).floor() as usize).min(self.ncols() - 1);
        let row = (((self.north - y) / self.cell_size).floor() as usize).min(self.nrows() - 1);
        Some((row, col))
    }

    pub fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.west + (col as f64 + 0.5) * self.cell_size,
            self.north - (row as f64 + 0.5) * self.cell_size,
        )
    }

    fn values_at_cell(&self, row: usize, col: usize) -> Option<Vec<f64>> {
        let values: Vec<f64> = self.bands.iter().map(|b| b[[row, col]]).collect();
        if values.iter().all(|v| v.is_finite()) {
            Some(values)
        } else {
            None
        }
    }

    /// Band values at a location; `None` outside the extent or when any band is missing.
    pub fn values_at(&self, x: f64, y: f64) -> Option<Vec<f64>> {
        let (row, col) = self.cell_index(x, y)?;
        self.values_at_cell(row, col)
    }

    /// Cells whose centre lies inside (or on the boundary of) `region`.
    ///
    /// A region too small to cover any centre falls back to every cell it
    /// touches, so a non-empty region inside the extent always yields cells.
    pub fn cells_within(&self, region: &MultiPolygon<f64>) -> Vec<(usize, usize)> {
        let Some(rect) = region.bounding_rect() else {
            return Vec::new();
        };
        let to_col = |x: f64| ((x - self.west) / self.cell_size).floor();
        let to_row = |y: f64| ((self.north - y) / self.cell_size).floor();

        let col_lo = to_col(rect.min().x).max(0.0) as usize;
        let col_hi = (to_col(rect.max().x).max(-1.0) as isize).min(self.ncols() as isize - 1);
        let row_lo = to_row(rect.max().y).max(0.0) as usize;
        let row_hi = (to_row(rect.min().y).max(-1.0) as isize).min(self.nrows() as isize - 1);
        if col_hi < 0 || row_hi < 0 {
            return Vec::new();
        }

        let mut cells = Vec::new();
        for row in row_lo..=row_hi as usize {
            for col in col_lo..=col_hi as usize {
                let (x, y) = self.cell_center(row, col);
                if region.intersects(&Point::new(x, y)) {
                    cells.push((row, col));
                }
            }
        }
        if cells.is_empty() {
            for row in row_lo..=row_hi as usize {
                for col in col_lo..=col_hi as usize {
                    if region.intersects(&self.cell_rect(row, col)) {
                        cells.push((row, col));
                    }
                }
            }
        }
        cells
    }

    fn cell_rect(&self, row: usize, col: usize) -> Rect<f64> {
        let x0 = self.west + col as f64 * self.cell_size;
        let y1 = self.north - row as f64 * self.cell_size;
        Rect::new(
            Coord { x: x0, y: y1 - self.cell_size },
            Coord { x: x0 + self.cell_size, y: y1 },
        )
    }
}

/// Environmental values for a set of locations, one row per location.
#[derive(Debug, Clone)]
pub struct EnvSamples {
    pub variables: Vec<String>,
    pub locations: Vec<(f64, f64)>,
    pub values: Array2<f64>,
}

impl EnvSamples {
    pub fn from_rows(
        variables: Vec<String>,
        locations: Vec<(f64, f64)>,
        rows: Vec<Vec<f64>>,
    ) -> Result<Self, NicheError> {
        let k = variables.len();
        if locations.len() != rows.len() {
            return Err(NicheError::DimensionMismatch(format!(
                "{} locations for {} sample rows",
                locations.len(),
                rows.len()
            )));
        }
        let mut values = Array2::<f64>::zeros((rows.len(), k));
        for (i, row) in rows.iter().enumerate() {
            if row.len() != k {
                return Err(NicheError::DimensionMismatch(format!(
                    "sample row {} has {} values, expected {}",
                    i,
                    row.len(),
                    k
                )));
            }
            for (j, v) in row.iter().enumerate() {
                values[[i, j]] = *v;
            }
        }
        Ok(EnvSamples {
            variables,
            locations,
            values,
        })
    }

    pub fn len(&self) -> usize {
        self.values.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.values.nrows() == 0
    }

    pub fn width(&self) -> usize {
        self.values.ncols()
    }
}

/// The environmental samples a group contributes to the ordination.
#[derive(Debug, Clone)]
pub struct GroupSamples {
    pub name: String,
    pub occurrence: EnvSamples,
    pub background: EnvSamples,
}

/// A species/group with its geography and environmental samples.
#[derive(Debug, Clone)]
pub struct Group {
    pub id: usize,
    pub name: String,
    pub occurrences: Vec<OccurrencePoint>,
    pub background: MultiPolygon<f64>,
    pub samples: GroupSamples,
}

pub enum SamplingTarget<'a> {
    Points(&'a [OccurrencePoint]),
    Region(&'a MultiPolygon<f64>),
}

/// Keeps the points that intersect `mask`. Points on the boundary are kept.
pub fn filter_to_domain(points: &[OccurrencePoint], mask: &MultiPolygon<f64>) -> Vec<OccurrencePoint> {
    points
        .iter()
        .filter(|p| mask.intersects(&p.point()))
        .cloned()
        .collect()
}

/// Minimum convex polygon of the points, buffered, clipped to the land mask.
///
/// One distinct point buffers to a disc, two (or collinear) points buffer
/// to a capsule around the segment.
pub fn build_background(
    group: &str,
    points: &[OccurrencePoint],
    buffer_size: f64,
    land_mask: &MultiPolygon<f64>,
) -> Result<MultiPolygon<f64>, NicheError> {
    if !(buffer_size > 0.0) || !buffer_size.is_finite() {
        return Err(NicheError::Config(format!(
            "buffer size must be positive, got {}",
            buffer_size
        )));
    }

    let mut seen = HashSet::new();
    let distinct: Vec<Point<f64>> = points
        .iter()
        .filter(|p| seen.insert((p.longitude.to_bits(), p.latitude.to_bits())))
        .map(|p| p.point())
        .collect();

    let buffered = match distinct.len() {
        0 => {
            return Err(NicheError::InsufficientData {
                group: group.to_string(),
                stage: "background",
            })
        }
        1 => distinct[0].buffer(buffer_size),
        2 => LineString::new(vec![distinct[0].0, distinct[1].0]).buffer(buffer_size),
        _ => {
            let hull = MultiPoint::new(distinct.clone()).convex_hull();
            if hull.unsigned_area() > f64::EPSILON {
                hull.buffer(buffer_size)
            } else {
                let (lo, hi) = extreme_pair(&distinct);
                LineString::new(vec![lo, hi]).buffer(buffer_size)
            }
        }
    };

    let clipped = buffered.intersection(land_mask);
    if clipped.0.is_empty() || clipped.unsigned_area() <= 0.0 {
        return Err(NicheError::InsufficientData {
            group: group.to_string(),
            stage: "background",
        });
    }
    Ok(clipped)
}

fn extreme_pair(points: &[Point<f64>]) -> (Coord<f64>, Coord<f64>) {
    let key = |p: &&Point<f64>| (p.x(), p.y());
    let cmp = |a: &&Point<f64>, b: &&Point<f64>| {
        key(a).partial_cmp(&key(b)).unwrap_or(std::cmp::Ordering::Equal)
    };
    let lo = points.iter().min_by(cmp).map(|p| p.0).unwrap_or_default();
    let hi = points.iter().max_by(cmp).map(|p| p.0).unwrap_or_default();
    (lo, hi)
}

/// Extracts band values for points or for every cell inside a region.
/// Rows with any missing band are dropped.
pub fn sample_environment(stack: &EnvStack, target: SamplingTarget<'_>) -> EnvSamples {
    let mut locations = Vec::new();
    let mut rows = Vec::new();
    let mut dropped = 0usize;

    match target {
        SamplingTarget::Points(points) => {
            for p in points {
                match stack.values_at(p.longitude, p.latitude) {
                    Some(values) => {
                        locations.push((p.longitude, p.latitude));
                        rows.push(values);
                    }
                    None => dropped += 1,
                }
            }
        }
        SamplingTarget::Region(region) => {
            for (row, col) in stack.cells_within(region) {
                match stack.values_at_cell(row, col) {
                    Some(values) => {
                        locations.push(stack.cell_center(row, col));
                        rows.push(values);
                    }
                    None => dropped += 1,
                }
            }
        }
    }

    if dropped > 0 {
        log(LogLevel::Debug, &format!("Dropped {} locations with missing values", dropped));
    }

    let k = stack.n_bands();
    let mut values = Array2::<f64>::zeros((rows.len(), k));
    for (i, row) in rows.iter().enumerate() {
        for (j, v) in row.iter().enumerate() {
            values[[i, j]] = *v;
        }
    }
    EnvSamples {
        variables: stack.band_names.clone(),
        locations,
        values,
    }
}

fn assemble_group(
    id: usize,
    name: &str,
    points: Vec<OccurrencePoint>,
    land_mask: &MultiPolygon<f64>,
    stack: &EnvStack,
    buffer_size: f64,
) -> Result<Group, NicheError> {
    let total = points.len();
    let in_domain = filter_to_domain(&points, land_mask);
    if in_domain.is_empty() {
        return Err(NicheError::InsufficientData {
            group: name.to_string(),
            stage: "domain",
        });
    }

    let background = build_background(name, &in_domain, buffer_size, land_mask)?;

    let occurrence = sample_environment(stack, SamplingTarget::Points(&in_domain));
    if occurrence.is_empty() {
        return Err(NicheError::InsufficientData {
            group: name.to_string(),
            stage: "occurrence",
        });
    }
    let background_samples = sample_environment(stack, SamplingTarget::Region(&background));
    if background_samples.is_empty() {
        return Err(NicheError::InsufficientData {
            group: name.to_string(),
            stage: "background",
        });
    }

    log(
        LogLevel::Info,
        &format!(
            "Group {}: {}/{} points in domain, {} occurrence samples, {} background cells",
            name,
            in_domain.len(),
            total,
            occurrence.len(),
            background_samples.len()
        ),
    );

    Ok(Group {
        id,
        name: name.to_string(),
        occurrences: in_domain,
        background,
        samples: GroupSamples {
            name: name.to_string(),
            occurrence,
            background: background_samples,
        },
    })
}

/// Partitions occurrences by group and assembles each group in declaration order.
pub fn assemble_groups(
    occurrences: &[OccurrencePoint],
    group_order: &[String],
    land_mask: &MultiPolygon<f64>,
    stack: &EnvStack,
    buffer_size: f64,
) -> Result<Vec<Group>, NicheError> {
    let known: HashSet<&str> = group_order.iter().map(|s| s.as_str()).collect();
    let unassigned = occurrences.iter().filter(|p| !known.contains(p.group.as_str())).count();
    if unassigned > 0 {
        log(
            LogLevel::Warning,
            &format!("{} occurrence records belong to no declared group and are ignored", unassigned),
        );
    }

    group_order
        .par_iter()
        .enumerate()
        .map(|(id, name)| {
            let points: Vec<OccurrencePoint> = occurrences
                .iter()
                .filter(|p| &p.group == name)
                .cloned()
                .collect();
            assemble_group(id, name, points, land_mask, stack, buffer_size)
        })
        .collect()
}
