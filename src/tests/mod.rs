mod parse_tests;
mod stats_tests;

/// Regular lattice of points over a rectangle, inclusive of both edges.
pub fn lattice(x0: f64, x1: f64, y0: f64, y1: f64, step: f64) -> Vec<[f64; 2]> {
    let nx = ((x1 - x0) / step).round() as usize;
    let ny = ((y1 - y0) / step).round() as usize;
    let mut points = Vec::with_capacity((nx + 1) * (ny + 1));
    for i in 0..=nx {
        for j in 0..=ny {
            points.push([x0 + i as f64 * step, y0 + j as f64 * step]);
        }
    }
    points
}

/// 5x5 block of points within +/- `spread` of a centre.
pub fn cluster(cx: f64, cy: f64, spread: f64) -> Vec<[f64; 2]> {
    let mut points = Vec::with_capacity(25);
    for a in -2..=2 {
        for b in -2..=2 {
            points.push([cx + spread * a as f64 / 2.0, cy + spread * b as f64 / 2.0]);
        }
    }
    points
}
