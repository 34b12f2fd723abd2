// stats.rs

use itertools::Itertools;
use ndarray::Zip;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::fmt;
use std::str::FromStr;

use crate::density::{estimate_with_availability, Availability, DensityGrid, DensityParams, GridSpec};
use crate::process::NicheError;
use crate::progress::{create_bar, log, LogLevel};

/// Sidedness of the similarity test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Alternative {
    /// Observed overlap is higher than under random placement.
    #[default]
    Greater,
    /// Observed overlap is lower than under random placement.
    Lower,
}

impl fmt::Display for Alternative {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Alternative::Greater => write!(f, "greater"),
            Alternative::Lower => write!(f, "lower"),
        }
    }
}

impl FromStr for Alternative {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "greater" => Ok(Alternative::Greater),
            "lower" => Ok(Alternative::Lower),
            other => Err(format!("invalid alternative '{}': expected greater or lower", other)),
        }
    }
}

/// One group projected into the shared space, ready for comparison.
#[derive(Debug, Clone)]
pub struct GroupNiche {
    pub name: String,
    pub background: Vec<[f64; 2]>,
    pub occurrences: Vec<[f64; 2]>,
    pub availability: Availability,
    pub grid: DensityGrid,
}

impl GroupNiche {
    pub fn build(
        name: &str,
        spec: &GridSpec,
        background: Vec<[f64; 2]>,
        occurrences: Vec<[f64; 2]>,
        params: &DensityParams,
    ) -> Result<Self, NicheError> {
        let availability = Availability::estimate(name, spec, &background, params)?;
        let grid = estimate_with_availability(name, spec, &availability, &occurrences, params)?;
        Ok(GroupNiche {
            name: name.to_string(),
            background,
            occurrences,
            availability,
            grid,
        })
    }
}

fn check_comparable(a: &DensityGrid, b: &DensityGrid) -> Result<(), NicheError> {
    if a.spec != b.spec {
        return Err(NicheError::DimensionMismatch(format!(
            "grids of '{}' and '{}' do not share the same extent/resolution",
            a.group, b.group
        )));
    }
    for g in [a, b] {
        if !g.occupied.iter().any(|o| *o) {
            return Err(NicheError::EmptyGridOverlap { group: g.group.clone() });
        }
    }
    Ok(())
}

fn occupied_total(grid: &DensityGrid) -> f64 {
    Zip::from(&grid.occurrence_density)
        .and(&grid.occupied)
        .fold(0.0, |acc, z, o| if *o { acc + z } else { acc })
}

/// Schoener's D between the occurrence densities of two groups.
pub fn schoener_d(a: &DensityGrid, b: &DensityGrid) -> Result<f64, NicheError> {
    check_comparable(a, b)?;
    let total_a = occupied_total(a);
    let total_b = occupied_total(b);
    if !(total_a > 0.0) {
        return Err(NicheError::EmptyGridOverlap { group: a.group.clone() });
    }
    if !(total_b > 0.0) {
        return Err(NicheError::EmptyGridOverlap { group: b.group.clone() });
    }

    // sum(min(p, q)) equals 1 - sum|p - q| / 2 for unit-mass surfaces and is
    // exactly zero when the occupied cells are disjoint.
    let shared = Zip::from(&a.occurrence_density)
        .and(&a.occupied)
        .and(&b.occurrence_density)
        .and(&b.occupied)
        .fold(0.0, |acc, za, &oa, zb, &ob| {
            let p = if oa { za / total_a } else { 0.0 };
            let q = if ob { zb / total_b } else { 0.0 };
            acc + p.min(q)
        });
    Ok(shared.clamp(0.0, 1.0))
}

/// How the niche of one group sits relative to another's.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DynamicIndex {
    /// Density of i in cells unavailable to j.
    pub expansion: f64,
    /// Density of i in cells also occupied by j.
    pub stability: f64,
    /// Density of j in cells available to i but not occupied by i.
    pub unfilling: f64,
}

/// Dynamic index of `i` relative to `j`. The three values are independent
/// proportions and are not rescaled to sum to one.
pub fn dynamic_index(i: &DensityGrid, j: &DensityGrid) -> Result<DynamicIndex, NicheError> {
    check_comparable(i, j)?;
    let total_i = occupied_total(i);
    let total_j = occupied_total(j);
    if !(total_i > 0.0) {
        return Err(NicheError::EmptyGridOverlap { group: i.group.clone() });
    }
    if !(total_j > 0.0) {
        return Err(NicheError::EmptyGridOverlap { group: j.group.clone() });
    }

    let mut stable = 0.0;
    let mut expanded = 0.0;
    let mut unfilled = 0.0;
    Zip::from(&i.occurrence_density)
        .and(&i.occupied)
        .and(&i.background_support)
        .and(&j.occurrence_density)
        .and(&j.occupied)
        .and(&j.background_support)
        .for_each(|&zi, &oi, &avail_i, &zj, &oj, &avail_j| {
            if oi && oj {
                stable += zi;
            } else if oi && !avail_j {
                expanded += zi;
            }
            if oj && avail_i && !oi {
                unfilled += zj;
            }
        });

    Ok(DynamicIndex {
        expansion: expanded / total_i,
        stability: stable / total_i,
        unfilling: unfilled / total_j,
    })
}

/// Settings shared by every pairwise comparison.
#[derive(Debug, Clone, Copy)]
pub struct MetricParams {
    pub rep: usize,
    pub alternative: Alternative,
    pub seed: u64,
    pub density: DensityParams,
}

/// Outcome of one directional similarity test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTest {
    pub observed: f64,
    pub p_value: f64,
    pub null_mean: f64,
    pub null_sd: f64,
    pub rep: usize,
}

/// Randomizes `randomized` within its own background and compares each
/// synthetic niche against the fixed grid.
///
/// Each replicate draws as many locations as the group has occurrences,
/// with replacement, from its background scores. The p-value is
/// `(hits + 1) / (rep + 1)`.
pub fn similarity_test<R: Rng>(
    randomized: &GroupNiche,
    fixed: &DensityGrid,
    params: &MetricParams,
    rng: &mut R,
) -> Result<SimilarityTest, NicheError> {
    if params.rep == 0 {
        return Err(NicheError::Config("similarity test needs at least one repetition".to_string()));
    }
    if randomized.background.is_empty() {
        return Err(NicheError::InsufficientData {
            group: randomized.name.clone(),
            stage: "similarity test",
        });
    }

    let observed = schoener_d(&randomized.grid, fixed)?;
    let n_draws = randomized.occurrences.len().max(1);
    let spec = randomized.grid.spec;

    let mut null = Vec::with_capacity(params.rep);
    let mut draws = Vec::with_capacity(n_draws);
    for _ in 0..params.rep {
        draws.clear();
        for _ in 0..n_draws {
            let k = rng.gen_range(0..randomized.background.len());
            draws.push(randomized.background[k]);
        }
        let synthetic = estimate_with_availability(
            &randomized.name,
            &spec,
            &randomized.availability,
            &draws,
            &params.density,
        )?;
        null.push(schoener_d(&synthetic, fixed)?);
    }

    let hits = null
        .iter()
        .filter(|&&d| match params.alternative {
            Alternative::Greater => d >= observed,
            Alternative::Lower => d <= observed,
        })
        .count();
    let mean = null.iter().sum::<f64>() / null.len() as f64;
    let sd = if null.len() > 1 {
        (null.iter().map(|d| (d - mean) * (d - mean)).sum::<f64>() / (null.len() - 1) as f64).sqrt()
    } else {
        0.0
    };

    Ok(SimilarityTest {
        observed,
        p_value: (hits + 1) as f64 / (params.rep + 1) as f64,
        null_mean: mean,
        null_sd: sd,
        rep: params.rep,
    })
}

/// SplitMix64 finaliser over the run seed and the ordered pair, so each
/// direction has its own reproducible stream.
pub fn pair_seed(seed: u64, i: usize, j: usize) -> u64 {
    let mut z = seed
        ^ (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (j as u64).wrapping_add(1).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Everything computed for one unordered pair (i < j).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairMetrics {
    pub overlap: f64,
    pub similarity_ij: SimilarityTest,
    pub similarity_ji: SimilarityTest,
    pub dynamics_ij: DynamicIndex,
    pub dynamics_ji: DynamicIndex,
}

#[derive(Debug, Clone)]
pub struct PairOutcome {
    pub i: usize,
    pub j: usize,
    pub result: Result<PairMetrics, String>,
}

/// Computes every metric for the pair. Both directions are computed
/// independently; only D is shared.
pub fn compare_pair(
    i: usize,
    j: usize,
    a: &GroupNiche,
    b: &GroupNiche,
    params: &MetricParams,
) -> Result<PairMetrics, NicheError> {
    let overlap = schoener_d(&a.grid, &b.grid)?;

    let mut rng_ij = StdRng::seed_from_u64(pair_seed(params.seed, i, j));
    let similarity_ij = similarity_test(a, &b.grid, params, &mut rng_ij)?;
    let mut rng_ji = StdRng::seed_from_u64(pair_seed(params.seed, j, i));
    let similarity_ji = similarity_test(b, &a.grid, params, &mut rng_ji)?;

    Ok(PairMetrics {
        overlap,
        similarity_ij,
        similarity_ji,
        dynamics_ij: dynamic_index(&a.grid, &b.grid)?,
        dynamics_ji: dynamic_index(&b.grid, &a.grid)?,
    })
}

/// Compares every unordered pair of groups in parallel. Groups whose niche
/// could not be built make their pairs fail with the group's diagnostic.
pub fn compare_all(
    names: &[String],
    niches: &[Result<GroupNiche, String>],
    params: &MetricParams,
) -> Vec<PairOutcome> {
    let pairs: Vec<(usize, usize)> = (0..niches.len())
        .combinations(2)
        .map(|pair| (pair[0], pair[1]))
        .collect();

    log(
        LogLevel::Info,
        &format!(
            "Comparing {} pairs with {} randomizations per direction",
            pairs.len(),
            params.rep
        ),
    );
    let bar = create_bar(pairs.len() as u64, "Pairwise niche metrics");

    let mut outcomes: Vec<PairOutcome> = pairs
        .into_par_iter()
        .map(|(i, j)| {
            let result = match (&niches[i], &niches[j]) {
                (Ok(a), Ok(b)) => compare_pair(i, j, a, b, params).map_err(|e| e.to_string()),
                (Err(e), _) => Err(format!("group '{}' unavailable: {}", names[i], e)),
                (_, Err(e)) => Err(format!("group '{}' unavailable: {}", names[j], e)),
            };
            if let Err(msg) = &result {
                log(
                    LogLevel::Warning,
                    &format!("Pair {} / {} not computed: {}", names[i], names[j], msg),
                );
            }
            bar.inc(1);
            PairOutcome { i, j, result }
        })
        .collect();
    bar.finish_and_clear();

    outcomes.sort_by_key(|o| (o.i, o.j));
    outcomes
}
