// progress.rs

use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    Loading,
    GroupAssembly,
    Ordination,
    DensityGrids,
    NicheMetrics,
    Reporting,
}

impl ProcessingStage {
    pub fn label(self) -> &'static str {
        match self {
            ProcessingStage::Loading => "loading inputs",
            ProcessingStage::GroupAssembly => "group assembly",
            ProcessingStage::Ordination => "ordination",
            ProcessingStage::DensityGrids => "density grids",
            ProcessingStage::NicheMetrics => "niche metrics",
            ProcessingStage::Reporting => "reporting",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

static CURRENT_STAGE: StageCell = StageCell::new();

pub fn set_stage(stage: ProcessingStage) {
    CURRENT_STAGE.set(stage);
    log::info!("Stage: {}", stage.label());
}

pub fn current_stage() -> Option<ProcessingStage> {
    CURRENT_STAGE.get()
}

/// Forwards to the `log` facade, prefixed with the active stage.
pub fn log(level: LogLevel, message: &str) {
    let prefix = current_stage().map(|s| s.label()).unwrap_or("setup");
    match level {
        LogLevel::Debug => log::debug!("[{}] {}", prefix, message),
        LogLevel::Info => log::info!("[{}] {}", prefix, message),
        LogLevel::Warning => log::warn!("[{}] {}", prefix, message),
        LogLevel::Error => log::error!("[{}] {}", prefix, message),
    }
}

pub fn create_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

pub fn create_bar(len: u64, message: &str) -> ProgressBar {
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
    );
    bar.set_message(message.to_string());
    bar
}

pub struct StatusBox {
    pub title: String,
    pub stats: Vec<(String, String)>,
}

/// Prints a boxed key/value summary to stderr.
pub fn display_status_box(status: StatusBox) {
    let key_width = status.stats.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    let value_width = status.stats.iter().map(|(_, v)| v.len()).max().unwrap_or(0);
    let inner = (key_width + value_width + 3).max(status.title.len() + 2);

    eprintln!("{}", format!("┌{}┐", "─".repeat(inner)).cyan());
    eprintln!(
        "{}{}{}",
        "│ ".cyan(),
        format!("{:<width$}", status.title, width = inner - 1).bold(),
        "│".cyan()
    );
    eprintln!("{}", format!("├{}┤", "─".repeat(inner)).cyan());
    for (key, value) in &status.stats {
        let line = format!("{:<kw$} : {:<vw$}", key, value, kw = key_width, vw = value_width);
        eprintln!("{}{:<width$}{}", "│ ".cyan(), line, "│".cyan(), width = inner - 1);
    }
    eprintln!("{}", format!("└{}┘", "─".repeat(inner)).cyan());
}

/// Lock-free holder for the current stage; 0 means no stage set yet.
struct StageCell(AtomicU8);

impl StageCell {
    const fn new() -> Self {
        StageCell(AtomicU8::new(0))
    }

    fn set(&self, stage: ProcessingStage) {
        self.0.store(stage as u8 + 1, Ordering::Relaxed);
    }

    fn get(&self) -> Option<ProcessingStage> {
        match self.0.load(Ordering::Relaxed) {
            1 => Some(ProcessingStage::Loading),
            2 => Some(ProcessingStage::GroupAssembly),
            3 => Some(ProcessingStage::Ordination),
            4 => Some(ProcessingStage::DensityGrids),
            5 => Some(ProcessingStage::NicheMetrics),
            6 => Some(ProcessingStage::Reporting),
            _ => None,
        }
    }
}
