use crate::geography::{EnvStack, OccurrencePoint};
use crate::process::NicheError;

use colored::Colorize;
use flate2::read::MultiGzDecoder;
use geo::{BooleanOps, Geometry, MultiPolygon, Polygon};
use geojson::GeoJson;
use ndarray::Array2;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

pub fn open_reader(path: &Path) -> Result<Box<dyn BufRead + Send>, NicheError> {
    let file = File::open(path)?;

    if path.extension().and_then(|s| s.to_str()) == Some("gz") {
        let decoder = MultiGzDecoder::new(file);
        Ok(Box::new(BufReader::new(decoder)))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn is_tab_delimited(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    name.ends_with(".tsv") || name.ends_with(".tsv.gz")
}

fn find_column(headers: &csv::StringRecord, aliases: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|h| aliases.iter().any(|a| h.trim().eq_ignore_ascii_case(a)))
}

/// Reads the occurrence table and returns distinct records plus the group
/// names in order of first appearance.
pub fn parse_occurrence_file(path: &Path) -> Result<(Vec<OccurrencePoint>, Vec<String>), NicheError> {
    let delimiter = if is_tab_delimited(path) { b'\t' } else { b',' };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(open_reader(path)?);

    let headers = reader.headers()?.clone();
    let group_col = find_column(&headers, &["group", "species"])
        .ok_or_else(|| NicheError::Parse("missing 'group' column in occurrence table".to_string()))?;
    let lon_col = find_column(&headers, &["longitude", "lon", "x"])
        .ok_or_else(|| NicheError::Parse("missing 'longitude' column in occurrence table".to_string()))?;
    let lat_col = find_column(&headers, &["latitude", "lat", "y"])
        .ok_or_else(|| NicheError::Parse("missing 'latitude' column in occurrence table".to_string()))?;

    let mut points = Vec::new();
    let mut groups = Vec::new();
    let mut seen_groups = HashSet::new();
    let mut seen_rows = HashSet::new();
    let mut skipped = 0usize;
    let mut duplicates = 0usize;

    for (line_num, result) in reader.records().enumerate() {
        let record = result?;
        let group = record.get(group_col).map(str::trim).unwrap_or("");
        let lon = record.get(lon_col).and_then(|v| v.trim().parse::<f64>().ok());
        let lat = record.get(lat_col).and_then(|v| v.trim().parse::<f64>().ok());

        let (lon, lat) = match (lon, lat) {
            (Some(lon), Some(lat)) if !group.is_empty() && lon.is_finite() && lat.is_finite() => (lon, lat),
            _ => {
                log::warn!(
                    "{}",
                    format!("Skipping invalid occurrence on line {}: {:?}", line_num + 2, record).yellow()
                );
                skipped += 1;
                continue;
            }
        };

        if !seen_rows.insert((group.to_string(), lon.to_bits(), lat.to_bits())) {
            duplicates += 1;
            continue;
        }
        if seen_groups.insert(group.to_string()) {
            groups.push(group.to_string());
        }
        points.push(OccurrencePoint::new(group, lon, lat));
    }

    log::info!(
        "Read {} distinct occurrences in {} groups ({} duplicates removed, {} invalid rows skipped)",
        points.len(),
        groups.len(),
        duplicates,
        skipped
    );
    Ok((points, groups))
}

/// Applies a user-supplied comma-separated group order.
pub fn parse_group_order(list: &str, available: &[String]) -> Result<Vec<String>, NicheError> {
    let order: Vec<String> = list
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let mut seen = HashSet::new();
    for name in &order {
        if !available.contains(name) {
            return Err(NicheError::Config(format!(
                "group '{}' not found in occurrence table (available: {})",
                name,
                available.join(", ")
            )));
        }
        if !seen.insert(name.clone()) {
            return Err(NicheError::Config(format!("group '{}' listed twice", name)));
        }
    }
    Ok(order)
}

/// One band read from an ESRI ASCII grid.
#[derive(Debug, Clone)]
pub struct AsciiGrid {
    pub ncols: usize,
    pub nrows: usize,
    pub west: f64,
    pub south: f64,
    pub cell_size: f64,
    pub values: Array2<f64>,
}

impl AsciiGrid {
    pub fn north(&self) -> f64 {
        self.south + self.nrows as f64 * self.cell_size
    }

    fn same_geometry(&self, other: &AsciiGrid) -> bool {
        let tol = self.cell_size * 1e-6;
        self.ncols == other.ncols
            && self.nrows == other.nrows
            && (self.west - other.west).abs() <= tol
            && (self.south - other.south).abs() <= tol
            && (self.cell_size - other.cell_size).abs() <= tol
    }
}

pub fn parse_ascii_grid(path: &Path) -> Result<AsciiGrid, NicheError> {
    let mut content = String::new();
    open_reader(path)?.read_to_string(&mut content)?;
    let mut tokens = content.split_whitespace().peekable();

    let mut ncols = None;
    let mut nrows = None;
    let mut west = None;
    let mut south = None;
    let mut centered = false;
    let mut cell_size = None;
    let mut nodata = None;

    while let Some(&key) = tokens.peek() {
        if key.parse::<f64>().is_ok() {
            break;
        }
        tokens.next();
        let value = tokens
            .next()
            .ok_or_else(|| NicheError::Parse(format!("{}: missing value for '{}'", path.display(), key)))?;
        let number: f64 = value
            .parse()
            .map_err(|_| NicheError::Parse(format!("{}: invalid value '{}' for '{}'", path.display(), value, key)))?;
        match key.to_ascii_lowercase().as_str() {
            "ncols" => ncols = Some(number as usize),
            "nrows" => nrows = Some(number as usize),
            "xllcorner" => west = Some(number),
            "yllcorner" => south = Some(number),
            "xllcenter" => {
                west = Some(number);
                centered = true;
            }
            "yllcenter" => {
                south = Some(number);
                centered = true;
            }
            "cellsize" => cell_size = Some(number),
            "nodata_value" => nodata = Some(number),
            other => {
                return Err(NicheError::Parse(format!(
                    "{}: unknown header key '{}'",
                    path.display(),
                    other
                )))
            }
        }
    }

    let missing = |name: &str| NicheError::Parse(format!("{}: header lacks '{}'", path.display(), name));
    let ncols = ncols.ok_or_else(|| missing("ncols"))?;
    let nrows = nrows.ok_or_else(|| missing("nrows"))?;
    if ncols == 0 || nrows == 0 {
        return Err(NicheError::Parse(format!(
            "{}: grid has {} rows and {} columns",
            path.display(),
            nrows,
            ncols
        )));
    }
    let cell_size = cell_size.ok_or_else(|| missing("cellsize"))?;
    let mut west = west.ok_or_else(|| missing("xllcorner"))?;
    let mut south = south.ok_or_else(|| missing("yllcorner"))?;
    if centered {
        west -= cell_size / 2.0;
        south -= cell_size / 2.0;
    }

    let mut values = Array2::<f64>::from_elem((nrows, ncols), f64::NAN);
    let mut count = 0usize;
    for token in tokens {
        if count >= nrows * ncols {
            return Err(NicheError::Parse(format!(
                "{}: more than {} cell values",
                path.display(),
                nrows * ncols
            )));
        }
        let v: f64 = token
            .parse()
            .map_err(|_| NicheError::Parse(format!("{}: invalid cell value '{}'", path.display(), token)))?;
        let is_nodata = nodata.map_or(false, |nd| v == nd);
        values[[count / ncols, count % ncols]] = if is_nodata { f64::NAN } else { v };
        count += 1;
    }
    if count != nrows * ncols {
        return Err(NicheError::Parse(format!(
            "{}: expected {} cell values, found {}",
            path.display(),
            nrows * ncols,
            count
        )));
    }

    Ok(AsciiGrid {
        ncols,
        nrows,
        west,
        south,
        cell_size,
        values,
    })
}

fn band_name(path: &Path) -> String {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("band");
    name.trim_end_matches(".gz").trim_end_matches(".asc").to_string()
}

/// Sort key that orders `bio2` before `bio10`.
fn natural_key(name: &str) -> (String, u64) {
    let digits: String = name.chars().rev().take_while(|c| c.is_ascii_digit()).collect();
    let prefix = &name[..name.len() - digits.len()];
    let number = digits.chars().rev().collect::<String>().parse().unwrap_or(0);
    (prefix.to_string(), number)
}

fn find_band_files(source: &str) -> Result<Vec<PathBuf>, NicheError> {
    let pattern = if Path::new(source).is_dir() {
        format!("{}/*.asc*", source.trim_end_matches('/'))
    } else {
        source.to_string()
    };
    let entries = glob::glob(&pattern)
        .map_err(|e| NicheError::Config(format!("invalid raster pattern '{}': {}", pattern, e)))?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|p| {
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
            name.ends_with(".asc") || name.ends_with(".asc.gz")
        })
        .collect();
    files.sort_by_key(|p| natural_key(&band_name(p)));

    if files.is_empty() {
        return Err(NicheError::Config(format!("no ASCII grid bands match '{}'", source)));
    }
    Ok(files)
}

/// Loads every band found in a directory or glob into one stack.
pub fn load_env_stack(source: &str) -> Result<EnvStack, NicheError> {
    let files = find_band_files(source)?;
    let mut names = Vec::with_capacity(files.len());
    let mut grids: Vec<AsciiGrid> = Vec::with_capacity(files.len());

    for file in &files {
        let grid = parse_ascii_grid(file)?;
        if let Some(first) = grids.first() {
            if !first.same_geometry(&grid) {
                return Err(NicheError::DimensionMismatch(format!(
                    "band {} is not co-registered with {}",
                    file.display(),
                    files[0].display()
                )));
            }
        }
        log::debug!("Loaded band {} ({}x{})", file.display(), grid.nrows, grid.ncols);
        names.push(band_name(file));
        grids.push(grid);
    }

    let west = grids[0].west;
    let north = grids[0].north();
    let cell_size = grids[0].cell_size;
    log::info!("Loaded {} environmental bands from {}", grids.len(), source);
    EnvStack::new(
        names,
        west,
        north,
        cell_size,
        grids.into_iter().map(|g| g.values).collect(),
    )
}

fn collect_polygons(geometry: Geometry<f64>, out: &mut Vec<Polygon<f64>>) {
    match geometry {
        Geometry::Polygon(p) => out.push(p),
        Geometry::MultiPolygon(mp) => out.extend(mp.0),
        Geometry::GeometryCollection(gc) => {
            for g in gc.0 {
                collect_polygons(g, out);
            }
        }
        _ => {}
    }
}

/// Reads a GeoJSON land mask as one multipolygon.
pub fn parse_mask_str(content: &str) -> Result<MultiPolygon<f64>, NicheError> {
    let geojson: GeoJson = content
        .parse()
        .map_err(|e: geojson::Error| NicheError::GeoJson(e.to_string()))?;
    let collection = geojson::quick_collection::<f64>(&geojson)
        .map_err(|e| NicheError::GeoJson(e.to_string()))?;

    let mut polygons = Vec::new();
    for geometry in collection.0 {
        collect_polygons(geometry, &mut polygons);
    }
    if polygons.is_empty() {
        return Err(NicheError::GeoJson("mask contains no polygons".to_string()));
    }
    // Overlapping members are merged.
    Ok(polygons
        .into_iter()
        .fold(MultiPolygon::new(Vec::new()), |acc, p| acc.union(&p)))
}

pub fn parse_mask_file(path: &Path) -> Result<MultiPolygon<f64>, NicheError> {
    let mut content = String::new();
    open_reader(path)?.read_to_string(&mut content)?;
    parse_mask_str(&content)
}
