use crate::density::{Bandwidth, DensityGrid, DensityParams, GridSpec, DEFAULT_RESOLUTION};
use crate::geography::{assemble_groups, EnvSamples, EnvStack, GroupSamples, OccurrencePoint};
use crate::pca::{build_ordination, write_eigenvalues, write_loadings, write_scores, Ordination, RowWeights, SampleKind};
use crate::progress::{
    create_spinner, display_status_box, log, set_stage, LogLevel, ProcessingStage, StatusBox,
};
use crate::stats::{compare_all, Alternative, GroupNiche, MetricParams, PairOutcome};

use colored::*;
use geo::MultiPolygon;
use geojson::{Feature, FeatureCollection, GeoJson};
use ndarray::Array2;
use prettytable::{Cell, Row, Table};
use rayon::prelude::*;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NicheError {
    #[error("insufficient data for group '{group}' at stage '{stage}'")]
    InsufficientData { group: String, stage: &'static str },
    #[error("degenerate ordination: {0}")]
    DegenerateOrdination(String),
    #[error("empty occupied grid domain for group '{group}'")]
    EmptyGridOverlap { group: String },
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("GeoJSON error: {0}")]
    GeoJson(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Run configuration. Everything the pipeline depends on is passed in here.
#[derive(Debug, Clone)]
pub struct NicheConfig {
    /// Background buffer around each group's convex hull, in map units.
    pub buffer_size: f64,
    pub resolution: usize,
    /// Randomizations per similarity-test direction.
    pub rep: usize,
    pub seed: u64,
    pub weights: RowWeights,
    pub density: DensityParams,
    pub alternative: Alternative,
}

impl Default for NicheConfig {
    fn default() -> Self {
        NicheConfig {
            buffer_size: 1.0,
            resolution: DEFAULT_RESOLUTION,
            rep: 100,
            seed: 42,
            weights: RowWeights::default(),
            density: DensityParams::default(),
            alternative: Alternative::Greater,
        }
    }
}

impl NicheConfig {
    pub fn validate(&self, n_groups: usize) -> Result<(), NicheError> {
        if n_groups < 2 {
            return Err(NicheError::Config(format!(
                "pairwise niche metrics need at least 2 groups, got {}",
                n_groups
            )));
        }
        if !(self.buffer_size > 0.0) || !self.buffer_size.is_finite() {
            return Err(NicheError::Config(format!(
                "buffer size must be positive, got {}",
                self.buffer_size
            )));
        }
        if self.resolution < 2 {
            return Err(NicheError::Config(format!(
                "grid resolution must be at least 2, got {}",
                self.resolution
            )));
        }
        if self.rep == 0 {
            return Err(NicheError::Config("rep must be at least 1".to_string()));
        }
        if let Bandwidth::Fixed(h) = self.density.bandwidth {
            if !(h > 0.0) {
                return Err(NicheError::Config(format!("fixed bandwidth must be positive, got {}", h)));
            }
        }
        if !(self.density.kernel_cutoff > 0.0) {
            return Err(NicheError::Config("kernel cutoff must be positive".to_string()));
        }
        Ok(())
    }

    pub fn metric_params(&self) -> MetricParams {
        MetricParams {
            rep: self.rep,
            alternative: self.alternative,
            seed: self.seed,
            density: self.density,
        }
    }
}

/// A result cell: the diagonal is undefined by convention, failed pairs
/// are reported as not computed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricCell {
    Diagonal,
    Value(f64),
    NotComputed,
}

impl MetricCell {
    pub fn value(&self) -> Option<f64> {
        match self {
            MetricCell::Value(v) => Some(*v),
            _ => None,
        }
    }

    fn render(&self, precision: usize) -> String {
        match self {
            MetricCell::Diagonal => "NA".to_string(),
            MetricCell::Value(v) => format!("{:.*}", precision, v),
            MetricCell::NotComputed => "not_computed".to_string(),
        }
    }
}

/// An n x n group-by-group matrix in declaration order.
#[derive(Debug, Clone)]
pub struct MetricMatrix {
    pub metric: &'static str,
    pub labels: Vec<String>,
    pub cells: Array2<MetricCell>,
}

impl MetricMatrix {
    pub fn new(metric: &'static str, labels: &[String]) -> Self {
        let n = labels.len();
        let cells = Array2::from_shape_fn((n, n), |(i, j)| {
            if i == j {
                MetricCell::Diagonal
            } else {
                MetricCell::NotComputed
            }
        });
        MetricMatrix {
            metric,
            labels: labels.to_vec(),
            cells,
        }
    }

    pub fn get(&self, i: usize, j: usize) -> MetricCell {
        self.cells[[i, j]]
    }

    pub fn value(&self, i: usize, j: usize) -> Option<f64> {
        self.cells[[i, j]].value()
    }

    /// Value for row group `a` and column group `b`, looked up by name.
    pub fn by_name(&self, a: &str, b: &str) -> Option<f64> {
        let i = self.labels.iter().position(|l| l == a)?;
        let j = self.labels.iter().position(|l| l == b)?;
        self.value(i, j)
    }

    fn set(&mut self, i: usize, j: usize, value: f64) {
        self.cells[[i, j]] = MetricCell::Value(value);
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), NicheError> {
        let mut writer = csv::Writer::from_path(path)?;
        let mut header = vec![String::new()];
        header.extend(self.labels.iter().cloned());
        writer.write_record(&header)?;
        for (i, label) in self.labels.iter().enumerate() {
            let mut record = vec![label.clone()];
            record.extend(self.cells.row(i).iter().map(|c| c.render(6)));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub stage: &'static str,
    pub groups: Vec<String>,
    pub message: String,
}

/// Inputs read by the I/O collaborators.
pub struct PipelineInputs {
    pub occurrences: Vec<OccurrencePoint>,
    pub group_order: Vec<String>,
    pub land_mask: MultiPolygon<f64>,
    pub env: EnvStack,
}

pub struct NicheResults {
    pub names: Vec<String>,
    pub samples: Vec<GroupSamples>,
    /// Background polygons, empty when the run started from samples.
    pub backgrounds: Vec<MultiPolygon<f64>>,
    pub ordination: Ordination,
    pub grid_spec: GridSpec,
    pub grids: Vec<Option<DensityGrid>>,
    pub pairs: Vec<PairOutcome>,
    pub overlap: MetricMatrix,
    /// Cell (i, j) holds the p-value of i randomized against j's fixed niche.
    pub similarity: MetricMatrix,
    pub expansion: MetricMatrix,
    pub stability: MetricMatrix,
    pub unfilling: MetricMatrix,
    pub diagnostics: Vec<Diagnostic>,
}

/// Full run: group assembly, then ordination, grids, and pairwise metrics.
pub fn run_pipeline(inputs: PipelineInputs, config: &NicheConfig) -> Result<NicheResults, NicheError> {
    config.validate(inputs.group_order.len())?;

    set_stage(ProcessingStage::GroupAssembly);
    let spinner = create_spinner("Building background regions");
    let groups = assemble_groups(
        &inputs.occurrences,
        &inputs.group_order,
        &inputs.land_mask,
        &inputs.env,
        config.buffer_size,
    );
    spinner.finish_and_clear();
    let groups = groups?;

    let mut backgrounds = Vec::with_capacity(groups.len());
    let mut samples = Vec::with_capacity(groups.len());
    for group in groups {
        backgrounds.push(group.background);
        samples.push(group.samples);
    }

    let mut results = run_from_samples(samples, config)?;
    results.backgrounds = backgrounds;
    Ok(results)
}

/// Runs ordination, density grids, and pairwise metrics on groups whose
/// environmental samples are already extracted.
pub fn run_from_samples(groups: Vec<GroupSamples>, config: &NicheConfig) -> Result<NicheResults, NicheError> {
    config.validate(groups.len())?;
    let names: Vec<String> = groups.iter().map(|g| g.name.clone()).collect();
    for g in &groups {
        for (stage, samples) in [("occurrence", &g.occurrence), ("background", &g.background)] {
            if samples.is_empty() {
                return Err(NicheError::InsufficientData {
                    group: g.name.clone(),
                    stage,
                });
            }
        }
    }

    // Single shared fit; any failure here is fatal for the whole run.
    let ordination = build_ordination(&groups, config.weights).map_err(|e| {
        log(LogLevel::Error, &format!("Ordination failed: {}", e));
        e
    })?;

    set_stage(ProcessingStage::DensityGrids);
    let grid_spec = GridSpec::from_scores(&ordination.pooled_background_scores(), config.resolution)?;
    log(
        LogLevel::Info,
        &format!(
            "Grid {}x{} over PC1 [{:.3}, {:.3}], PC2 [{:.3}, {:.3}]",
            grid_spec.resolution,
            grid_spec.resolution,
            grid_spec.x_min,
            grid_spec.x_max,
            grid_spec.y_min,
            grid_spec.y_max
        ),
    );

    let niches: Vec<Result<GroupNiche, String>> = names
        .par_iter()
        .enumerate()
        .map(|(g, name)| {
            GroupNiche::build(
                name,
                &grid_spec,
                ordination.group_scores(g, SampleKind::Background),
                ordination.group_scores(g, SampleKind::Occurrence),
                &config.density,
            )
            .map_err(|e| e.to_string())
        })
        .collect();

    let mut diagnostics = Vec::new();
    for (name, niche) in names.iter().zip(&niches) {
        match niche {
            Ok(n) => log(
                LogLevel::Debug,
                &format!("Group {}: {} occupied cells", name, n.grid.occupied_cells()),
            ),
            Err(msg) => {
                log(LogLevel::Warning, &format!("Density grid for {} failed: {}", name, msg));
                diagnostics.push(Diagnostic {
                    stage: "density",
                    groups: vec![name.clone()],
                    message: msg.clone(),
                });
            }
        }
    }

    set_stage(ProcessingStage::NicheMetrics);
    let pairs = compare_all(&names, &niches, &config.metric_params());

    let mut overlap = MetricMatrix::new("overlap_D", &names);
    let mut similarity = MetricMatrix::new("similarity_p", &names);
    let mut expansion = MetricMatrix::new("expansion", &names);
    let mut stability = MetricMatrix::new("stability", &names);
    let mut unfilling = MetricMatrix::new("unfilling", &names);

    for outcome in &pairs {
        let (i, j) = (outcome.i, outcome.j);
        match &outcome.result {
            Ok(m) => {
                overlap.set(i, j, m.overlap);
                overlap.set(j, i, m.overlap);
                similarity.set(i, j, m.similarity_ij.p_value);
                similarity.set(j, i, m.similarity_ji.p_value);
                expansion.set(i, j, m.dynamics_ij.expansion);
                expansion.set(j, i, m.dynamics_ji.expansion);
                stability.set(i, j, m.dynamics_ij.stability);
                stability.set(j, i, m.dynamics_ji.stability);
                unfilling.set(i, j, m.dynamics_ij.unfilling);
                unfilling.set(j, i, m.dynamics_ji.unfilling);
            }
            Err(msg) => diagnostics.push(Diagnostic {
                stage: "pairwise",
                groups: vec![names[i].clone(), names[j].clone()],
                message: msg.clone(),
            }),
        }
    }

    let grids = niches.into_iter().map(|n| n.ok().map(|n| n.grid)).collect();

    Ok(NicheResults {
        names,
        samples: groups,
        backgrounds: Vec::new(),
        ordination,
        grid_spec,
        grids,
        pairs,
        overlap,
        similarity,
        expansion,
        stability,
        unfilling,
        diagnostics,
    })
}

fn sanitize_file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn write_samples(samples: &EnvSamples, path: &Path) -> Result<(), NicheError> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    let mut header = vec!["longitude".to_string(), "latitude".to_string()];
    header.extend(samples.variables.iter().cloned());
    writer.write_record(&header)?;
    for (row, (x, y)) in samples.values.rows().into_iter().zip(&samples.locations) {
        let mut record = vec![x.to_string(), y.to_string()];
        record.extend(row.iter().map(|v| v.to_string()));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_grid(grid: &DensityGrid, path: &Path) -> Result<(), NicheError> {
    let mut writer = BufWriter::new(fs::File::create(path)?);
    writeln!(writer, "PC1\tPC2\tavailability\tbackground_support\toccurrence_density\toccupied")?;
    let r = grid.spec.resolution;
    for i in 0..r {
        for j in 0..r {
            writeln!(
                writer,
                "{:.6}\t{:.6}\t{:.6e}\t{}\t{:.6e}\t{}",
                grid.spec.x_at(i),
                grid.spec.y_at(j),
                grid.availability[[i, j]],
                u8::from(grid.background_support[[i, j]]),
                grid.occurrence_density[[i, j]],
                u8::from(grid.occupied[[i, j]])
            )?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn write_pair_tests(results: &NicheResults, path: &Path) -> Result<(), NicheError> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    writer.write_record([
        "randomized", "fixed", "observed_D", "p_value", "null_mean", "null_sd", "rep",
    ])?;
    for outcome in &results.pairs {
        if let Ok(m) = &outcome.result {
            for (a, b, t) in [
                (outcome.i, outcome.j, &m.similarity_ij),
                (outcome.j, outcome.i, &m.similarity_ji),
            ] {
                writer.write_record([
                    results.names[a].clone(),
                    results.names[b].clone(),
                    format!("{:.6}", t.observed),
                    format!("{:.6}", t.p_value),
                    format!("{:.6}", t.null_mean),
                    format!("{:.6}", t.null_sd),
                    t.rep.to_string(),
                ])?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

fn write_diagnostics(diagnostics: &[Diagnostic], path: &Path) -> Result<(), NicheError> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    writer.write_record(["stage", "groups", "message"])?;
    for d in diagnostics {
        writer.write_record([d.stage.to_string(), d.groups.join(";"), d.message.clone()])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_backgrounds(names: &[String], backgrounds: &[MultiPolygon<f64>], path: &Path) -> Result<(), NicheError> {
    let features: Vec<Feature> = names
        .iter()
        .zip(backgrounds)
        .map(|(name, region)| {
            let mut feature = Feature::from(geojson::Geometry::new(geojson::Value::from(region)));
            feature.set_property("group", name.clone());
            feature
        })
        .collect();
    let collection = FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    };
    fs::write(path, GeoJson::from(collection).to_string())?;
    Ok(())
}

/// Writes every table of a run into `output_dir`.
pub fn write_results(results: &NicheResults, output_dir: &Path) -> Result<(), NicheError> {
    set_stage(ProcessingStage::Reporting);
    fs::create_dir_all(output_dir)?;

    for matrix in [
        &results.overlap,
        &results.similarity,
        &results.expansion,
        &results.stability,
        &results.unfilling,
    ] {
        matrix.write_csv(&output_dir.join(format!("{}.csv", matrix.metric)))?;
    }
    write_pair_tests(results, &output_dir.join("similarity_tests.tsv"))?;
    write_diagnostics(&results.diagnostics, &output_dir.join("diagnostics.tsv"))?;

    write_scores(&results.ordination, &results.names, &output_dir.join("pca_scores.tsv"))?;
    write_loadings(&results.ordination, &output_dir.join("pca_loadings.tsv"))?;
    write_eigenvalues(&results.ordination, &output_dir.join("pca_eigenvalues.tsv"))?;

    for (name, samples) in results.names.iter().zip(&results.samples) {
        let stem = sanitize_file_stem(name);
        write_samples(&samples.occurrence, &output_dir.join(format!("samples_{}_occurrence.tsv", stem)))?;
        write_samples(&samples.background, &output_dir.join(format!("samples_{}_background.tsv", stem)))?;
    }
    for (name, grid) in results.names.iter().zip(&results.grids) {
        if let Some(grid) = grid {
            write_grid(grid, &output_dir.join(format!("grid_{}.tsv", sanitize_file_stem(name))))?;
        }
    }
    if !results.backgrounds.is_empty() {
        write_backgrounds(&results.names, &results.backgrounds, &output_dir.join("backgrounds.geojson"))?;
    }

    log(LogLevel::Info, &format!("Results written to {}", output_dir.display()));
    Ok(())
}

fn matrix_table(matrix: &MetricMatrix) -> Table {
    let mut table = Table::new();
    let mut header = vec![Cell::new(matrix.metric)];
    header.extend(matrix.labels.iter().map(|l| Cell::new(l)));
    table.add_row(Row::new(header));
    for (i, label) in matrix.labels.iter().enumerate() {
        let mut cells = vec![Cell::new(label)];
        cells.extend(matrix.cells.row(i).iter().map(|c| Cell::new(&c.render(3))));
        table.add_row(Row::new(cells));
    }
    table
}

/// Prints the result matrices and any diagnostics to stdout.
pub fn display_results(results: &NicheResults) {
    let explained = results.ordination.explained();
    display_status_box(StatusBox {
        title: "Niche Comparison".to_string(),
        stats: vec![
            ("Groups".to_string(), results.names.join(", ")),
            ("Variables retained".to_string(), results.ordination.variables.len().to_string()),
            ("PC1 / PC2 explained".to_string(), format!("{:.1}% / {:.1}%", explained[0] * 100.0, explained[1] * 100.0)),
            ("Grid resolution".to_string(), results.grid_spec.resolution.to_string()),
            ("Pairs".to_string(), results.pairs.len().to_string()),
            ("Diagnostics".to_string(), results.diagnostics.len().to_string()),
        ],
    });

    for matrix in [
        &results.overlap,
        &results.similarity,
        &results.expansion,
        &results.stability,
        &results.unfilling,
    ] {
        println!("\n{}", matrix.metric.green().bold());
        matrix_table(matrix).printstd();
    }

    if !results.diagnostics.is_empty() {
        println!("\n{}", "Not computed:".yellow().bold());
        for d in &results.diagnostics {
            println!("  [{}] {}: {}", d.stage, d.groups.join(" / "), d.message);
        }
    }
}
