// pca.rs

use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, ArrayView1};
use std::io::Write;
use std::path::Path;

use crate::geography::GroupSamples;
use crate::process::NicheError;
use crate::progress::{create_spinner, display_status_box, log, set_stage, LogLevel, ProcessingStage, StatusBox};

/// Variables with a weighted variance at or below this are treated as constant.
pub const VARIANCE_TOLERANCE: f64 = 1e-12;

/// Where a pooled row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    Occurrence,
    Background,
}

impl SampleKind {
    pub fn label(self) -> &'static str {
        match self {
            SampleKind::Occurrence => "occurrence",
            SampleKind::Background => "background",
        }
    }
}

/// Provenance of one row of the pooled ordination input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowOrigin {
    pub group: usize,
    pub kind: SampleKind,
    pub index: usize,
}

/// Per-row weights for the pooled fit.
#[derive(Debug, Clone, Copy)]
pub struct RowWeights {
    pub occurrence: f64,
    pub background: f64,
}

impl Default for RowWeights {
    fn default() -> Self {
        RowWeights {
            occurrence: 0.0,
            background: 1.0,
        }
    }
}

impl RowWeights {
    pub fn weight(&self, kind: SampleKind) -> f64 {
        match kind {
            SampleKind::Occurrence => self.occurrence,
            SampleKind::Background => self.background,
        }
    }
}

/// The shared environmental space, fitted once over every group.
#[derive(Debug, Clone)]
pub struct Ordination {
    /// Names of the variables retained after dropping constant ones.
    pub variables: Vec<String>,
    /// Column index of each retained variable in the input samples.
    pub retained: Vec<usize>,
    pub mean: Array1<f64>,
    pub scale: Array1<f64>,
    /// All eigenvalues of the weighted correlation matrix, descending.
    pub eigenvalues: Vec<f64>,
    /// Shape: (retained variables, 2)
    pub loadings: Array2<f64>,
    /// Shape: (pooled rows, 2), in pooled row order.
    pub scores: Array2<f64>,
    pub origins: Vec<RowOrigin>,
}

impl Ordination {
    /// Proportion of total inertia carried by each axis.
    pub fn explained(&self) -> Vec<f64> {
        let total: f64 = self.eigenvalues.iter().filter(|v| **v > 0.0).sum();
        self.eigenvalues
            .iter()
            .map(|v| if total > 0.0 { v.max(0.0) / total } else { 0.0 })
            .collect()
    }

    /// Projects a full-width sample row onto the two retained axes.
    pub fn project(&self, row: ArrayView1<'_, f64>) -> [f64; 2] {
        let mut out = [0.0; 2];
        for (r, &col) in self.retained.iter().enumerate() {
            let z = (row[col] - self.mean[r]) / self.scale[r];
            out[0] += z * self.loadings[[r, 0]];
            out[1] += z * self.loadings[[r, 1]];
        }
        out
    }

    /// Scores of one group's rows of the given kind, in sample order.
    pub fn group_scores(&self, group: usize, kind: SampleKind) -> Vec<[f64; 2]> {
        self.origins
            .iter()
            .enumerate()
            .filter(|(_, o)| o.group == group && o.kind == kind)
            .map(|(row, _)| [self.scores[[row, 0]], self.scores[[row, 1]]])
            .collect()
    }

    /// Scores of every background row, all groups pooled.
    pub fn pooled_background_scores(&self) -> Vec<[f64; 2]> {
        self.origins
            .iter()
            .enumerate()
            .filter(|(_, o)| o.kind == SampleKind::Background)
            .map(|(row, _)| [self.scores[[row, 0]], self.scores[[row, 1]]])
            .collect()
    }
}

/// Stacks every group's occurrence and background rows, group by group,
/// occurrences first.
pub fn pool_samples(groups: &[GroupSamples]) -> Result<(Array2<f64>, Vec<RowOrigin>, Vec<String>), NicheError> {
    let first = groups
        .first()
        .ok_or_else(|| NicheError::Config("no groups to ordinate".to_string()))?;
    let variables = first.occurrence.variables.clone();
    let k = variables.len();

    let mut n_rows = 0;
    for group in groups {
        for (kind, samples) in [
            (SampleKind::Occurrence, &group.occurrence),
            (SampleKind::Background, &group.background),
        ] {
            if samples.width() != k || samples.variables != variables {
                return Err(NicheError::DimensionMismatch(format!(
                    "group '{}' {} samples have {} variables, expected {}",
                    group.name,
                    kind.label(),
                    samples.width(),
                    k
                )));
            }
            n_rows += samples.len();
        }
    }

    let mut pooled = Array2::<f64>::zeros((n_rows, k));
    let mut origins = Vec::with_capacity(n_rows);
    let mut row = 0;
    for (g, group) in groups.iter().enumerate() {
        for (kind, samples) in [
            (SampleKind::Occurrence, &group.occurrence),
            (SampleKind::Background, &group.background),
        ] {
            for (i, sample) in samples.values.rows().into_iter().enumerate() {
                pooled.row_mut(row).assign(&sample);
                origins.push(RowOrigin { group: g, kind, index: i });
                row += 1;
            }
        }
    }
    Ok((pooled, origins, variables))
}

/// Weighted, standardized PCA over the pooled samples, keeping two axes.
///
/// Means and variances use the row weights (population convention), so with
/// the default weights the axes describe background variation only. Every
/// row, whatever its weight, is projected.
pub fn fit_ordination(
    data: &Array2<f64>,
    origins: Vec<RowOrigin>,
    variables: &[String],
    weights: RowWeights,
) -> Result<Ordination, NicheError> {
    let (n, k) = data.dim();
    if origins.len() != n || variables.len() != k {
        return Err(NicheError::DimensionMismatch(format!(
            "ordination input has {} rows/{} columns but {} origins/{} names",
            n,
            k,
            origins.len(),
            variables.len()
        )));
    }

    let w: Vec<f64> = origins.iter().map(|o| weights.weight(o.kind)).collect();
    if w.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(NicheError::Config("row weights must be finite and non-negative".to_string()));
    }
    let total_weight: f64 = w.iter().sum();
    if total_weight <= 0.0 {
        return Err(NicheError::DegenerateOrdination(
            "total row weight is zero; no rows define the axes".to_string(),
        ));
    }

    let mut retained = Vec::new();
    let mut mean = Vec::new();
    let mut scale = Vec::new();
    for j in 0..k {
        let column = data.column(j);
        let m = column.iter().zip(&w).map(|(x, wi)| x * wi).sum::<f64>() / total_weight;
        let var = column
            .iter()
            .zip(&w)
            .map(|(x, wi)| wi * (x - m) * (x - m))
            .sum::<f64>()
            / total_weight;
        if var > VARIANCE_TOLERANCE && var.is_finite() {
            retained.push(j);
            mean.push(m);
            scale.push(var.sqrt());
        } else {
            log(LogLevel::Warning, &format!("Dropping constant variable '{}'", variables[j]));
        }
    }

    if retained.len() < 2 {
        return Err(NicheError::DegenerateOrdination(format!(
            "{} non-constant variables remain, need at least 2",
            retained.len()
        )));
    }

    let p = retained.len();
    let mut standardized = Array2::<f64>::zeros((n, p));
    for (r, &col) in retained.iter().enumerate() {
        for i in 0..n {
            standardized[[i, r]] = (data[[i, col]] - mean[r]) / scale[r];
        }
    }

    // Weighted correlation matrix.
    let mut cor = DMatrix::<f64>::zeros(p, p);
    for a in 0..p {
        for b in a..p {
            let s: f64 = (0..n)
                .map(|i| w[i] * standardized[[i, a]] * standardized[[i, b]])
                .sum::<f64>()
                / total_weight;
            cor[(a, b)] = s;
            cor[(b, a)] = s;
        }
    }

    let eigen = SymmetricEigen::new(cor);
    let mut order: Vec<usize> = (0..p).collect();
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[b]
            .partial_cmp(&eigen.eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let eigenvalues: Vec<f64> = order.iter().map(|&i| eigen.eigenvalues[i]).collect();

    if eigenvalues[1] <= VARIANCE_TOLERANCE {
        return Err(NicheError::DegenerateOrdination(format!(
            "second eigenvalue is {:.3e}; variables are collinear",
            eigenvalues[1]
        )));
    }

    let mut loadings = Array2::<f64>::zeros((p, 2));
    for (axis, &idx) in order.iter().take(2).enumerate() {
        let column = eigen.eigenvectors.column(idx);
        // Fix the sign so the dominant loading is positive.
        let dominant = column
            .iter()
            .copied()
            .fold(0.0_f64, |acc, v| if v.abs() > acc.abs() { v } else { acc });
        let sign = if dominant < 0.0 { -1.0 } else { 1.0 };
        for r in 0..p {
            loadings[[r, axis]] = sign * column[r];
        }
    }

    let scores = standardized.dot(&loadings);

    Ok(Ordination {
        variables: retained.iter().map(|&j| variables[j].clone()).collect(),
        retained,
        mean: Array1::from(mean),
        scale: Array1::from(scale),
        eigenvalues,
        loadings,
        scores,
        origins,
    })
}

/// Builds the shared ordination for all groups.
pub fn build_ordination(groups: &[GroupSamples], weights: RowWeights) -> Result<Ordination, NicheError> {
    set_stage(ProcessingStage::Ordination);
    let spinner = create_spinner("Pooling environmental samples");
    let (pooled, origins, variables) = pool_samples(groups)?;
    spinner.finish_and_clear();

    let n_background = origins.iter().filter(|o| o.kind == SampleKind::Background).count();
    display_status_box(StatusBox {
        title: "Ordination Input".to_string(),
        stats: vec![
            ("Groups".to_string(), groups.len().to_string()),
            ("Variables".to_string(), variables.len().to_string()),
            ("Occurrence rows".to_string(), (origins.len() - n_background).to_string()),
            ("Background rows".to_string(), n_background.to_string()),
            (
                "Weights (occ/bg)".to_string(),
                format!("{}/{}", weights.occurrence, weights.background),
            ),
        ],
    });

    let spinner = create_spinner("Computing weighted PCA");
    let ordination = fit_ordination(&pooled, origins, &variables, weights);
    spinner.finish_and_clear();
    let ordination = ordination?;

    let explained = ordination.explained();
    log(
        LogLevel::Info,
        &format!(
            "Ordination complete: axis 1 explains {:.1}%, axis 2 explains {:.1}%",
            explained[0] * 100.0,
            explained[1] * 100.0
        ),
    );
    Ok(ordination)
}

/// Writes one row per pooled sample: group, kind, index, PC1, PC2.
pub fn write_scores(ordination: &Ordination, group_names: &[String], output_file: &Path) -> Result<(), NicheError> {
    let mut writer = std::io::BufWriter::new(std::fs::File::create(output_file)?);
    writeln!(writer, "group\tkind\tindex\tPC1\tPC2")?;
    for (row, origin) in ordination.origins.iter().enumerate() {
        let name = group_names.get(origin.group).map(String::as_str).unwrap_or("?");
        writeln!(
            writer,
            "{}\t{}\t{}\t{:.6}\t{:.6}",
            name,
            origin.kind.label(),
            origin.index,
            ordination.scores[[row, 0]],
            ordination.scores[[row, 1]]
        )?;
    }
    writer.flush()?;
    log(LogLevel::Info, &format!("PCA scores written to {}", output_file.display()));
    Ok(())
}

pub fn write_loadings(ordination: &Ordination, output_file: &Path) -> Result<(), NicheError> {
    let mut writer = std::io::BufWriter::new(std::fs::File::create(output_file)?);
    writeln!(writer, "variable\tPC1\tPC2")?;
    for (r, name) in ordination.variables.iter().enumerate() {
        writeln!(
            writer,
            "{}\t{:.6}\t{:.6}",
            name,
            ordination.loadings[[r, 0]],
            ordination.loadings[[r, 1]]
        )?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_eigenvalues(ordination: &Ordination, output_file: &Path) -> Result<(), NicheError> {
    let mut writer = std::io::BufWriter::new(std::fs::File::create(output_file)?);
    writeln!(writer, "axis\teigenvalue\texplained")?;
    for (i, (value, share)) in ordination.eigenvalues.iter().zip(ordination.explained()).enumerate() {
        writeln!(writer, "PC{}\t{:.6}\t{:.6}", i + 1, value, share)?;
    }
    writer.flush()?;
    Ok(())
}
