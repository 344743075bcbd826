//! ASCII plotting of decays for terminal output.
//!
//! This is intentionally "dumb" (fixed-size grid), optimized for:
//! - quick visual sanity checks in a terminal
//! - deterministic output (helpful for golden tests)
//!
//! Counts are drawn on a log10 axis floored at one photon, channels summed.
//!
//! Plot elements:
//! - observed counts: `o`
//! - fitted curve: `-` line

use crate::domain::{RegionResult, ResultsFile};
use crate::error::{FitError, Result};

/// Render one region of an in-memory fit.
pub fn render_decay_plot(
    timepoints: &[f64],
    n_chan: usize,
    region: &RegionResult,
    width: usize,
    height: usize,
) -> String {
    let observed = sum_channels(&region.observed, n_chan);
    let fitted = sum_channels(&region.fitted, n_chan);
    let mut out = format!("Region {}\n", region.label);
    out.push_str(&render_plot(timepoints, &observed, &fitted, width, height));
    out
}

/// Render region `index` of a saved results file.
pub fn render_results_plot(results: &ResultsFile, index: usize, width: usize, height: usize) -> Result<String> {
    let region = results.linear.regions.get(index).ok_or_else(|| {
        FitError::config(format!(
            "Region index {index} out of range ({} regions in results).",
            results.linear.regions.len()
        ))
    })?;
    Ok(render_decay_plot(&results.timepoints, results.n_chan, region, width, height))
}

fn sum_channels(values: &[f64], n_chan: usize) -> Vec<f64> {
    let n_t = values.len() / n_chan.max(1);
    if n_t == 0 {
        return Vec::new();
    }
    let mut out = vec![0.0; n_t];
    for chan in values.chunks(n_t) {
        for (o, v) in out.iter_mut().zip(chan) {
            *o += v;
        }
    }
    out
}

fn log_counts(v: f64) -> f64 {
    v.max(1.0).log10()
}

fn render_plot(timepoints: &[f64], observed: &[f64], fitted: &[f64], width: usize, height: usize) -> String {
    let width = width.max(10);
    let height = height.max(5);

    let (t_min, t_max) = t_range(timepoints).unwrap_or((0.0, 1.0));
    let observed: Vec<(f64, f64)> = timepoints.iter().zip(observed).map(|(&t, &y)| (t, log_counts(y))).collect();
    let curve: Vec<(f64, f64)> = timepoints.iter().zip(fitted).map(|(&t, &y)| (t, log_counts(y))).collect();

    let y_max = observed
        .iter()
        .chain(&curve)
        .map(|&(_, y)| y)
        .fold(f64::NEG_INFINITY, f64::max);
    let y_max = if y_max.is_finite() && y_max > 0.0 { y_max } else { 1.0 };
    let (y_min, y_max) = pad_range(0.0, y_max, 0.05);

    let mut grid = vec![vec![' '; width]; height];

    // Draw curve first (so points can overlay).
    draw_curve(&mut grid, &curve, t_min, t_max, y_min, y_max);

    for &(t, y) in &observed {
        let x = map_x(t, t_min, t_max, width);
        let row = map_y(y, y_min, y_max, height);
        grid[row][x] = 'o';
    }

    let mut out = String::new();
    out.push_str(&format!(
        "Plot: t=[{t_min:.3}, {t_max:.3}] ns | log10(counts)=[{y_min:.2}, {y_max:.2}]\n"
    ));
    for row in grid {
        out.push_str(row.into_iter().collect::<String>().trim_end());
        out.push('\n');
    }
    out
}

fn t_range(timepoints: &[f64]) -> Option<(f64, f64)> {
    let min_t = timepoints.iter().copied().fold(f64::INFINITY, f64::min);
    let max_t = timepoints.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if min_t.is_finite() && max_t.is_finite() && max_t > min_t {
        Some((min_t, max_t))
    } else {
        None
    }
}

fn pad_range(min: f64, max: f64, frac: f64) -> (f64, f64) {
    let span = (max - min).abs();
    let pad = (span * frac).max(1e-12);
    (min - pad, max + pad)
}

fn map_x(t: f64, t_min: f64, t_max: f64, width: usize) -> usize {
    let width = width.max(2);
    let u = ((t - t_min) / (t_max - t_min)).clamp(0.0, 1.0);
    (u * (width as f64 - 1.0)).round() as usize
}

fn map_y(y: f64, y_min: f64, y_max: f64, height: usize) -> usize {
    let height = height.max(2);
    let u = ((y - y_min) / (y_max - y_min)).clamp(0.0, 1.0);
    // y=top is max -> row 0
    (height as f64 - 1.0 - (u * (height as f64 - 1.0))).round() as usize
}

fn draw_curve(grid: &mut [Vec<char>], curve: &[(f64, f64)], t_min: f64, t_max: f64, y_min: f64, y_max: f64) {
    if curve.len() < 2 {
        return;
    }
    let height = grid.len();
    let width = grid[0].len();

    let mut prev = None;
    for &(t, y) in curve {
        let x = map_x(t, t_min, t_max, width);
        let yy = map_y(y, y_min, y_max, height);
        if let Some((x0, y0)) = prev {
            draw_line(grid, x0, y0, x, yy, '-');
        } else {
            grid[yy][x] = '-';
        }
        prev = Some((x, yy));
    }
}

/// Integer line drawing (Bresenham-ish).
fn draw_line(grid: &mut [Vec<char>], x0: usize, y0: usize, x1: usize, y1: usize, ch: char) {
    let mut x0 = x0 as isize;
    let mut y0 = y0 as isize;
    let x1 = x1 as isize;
    let y1 = y1 as isize;

    let dx = (x1 - x0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let dy = -(y1 - y0).abs();
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        if y0 >= 0
            && (y0 as usize) < grid.len()
            && x0 >= 0
            && (x0 as usize) < grid[0].len()
            && grid[y0 as usize][x0 as usize] == ' '
        {
            grid[y0 as usize][x0 as usize] = ch;
        }

        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}
