//! Circular Hough Gradient Detector
//!
//! Edge pixels vote along their gradient direction into a center accumulator.
//! Gradient directions come from a smoothed copy, and the accumulator is box
//! summed before peak search, so small angular errors on a real rim still
//! pile up on one center. Each candidate gets a radius from the histogram of
//! distances to edge pixels whose gradient points radially.

use image::GrayImage;
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;
use imageproc::gradients::{horizontal_sobel, vertical_sobel};

/// A detected circle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Circle {
    pub x: f32,
    pub y: f32,
    pub radius: f32,
    /// Center accumulator votes.
    pub votes: u32,
}

/// Detector constants. Defaults are tuned for microscope field-of-view photos.
#[derive(Debug, Clone)]
pub struct HoughParams {
    /// Inverse accumulator resolution (1 = same as the image).
    pub dp: u32,
    /// Minimum distance between accepted centers, as a fraction of image height.
    pub min_dist_ratio: f32,
    /// Canny high threshold; the low threshold is half of it.
    pub edge_threshold: f32,
    /// Minimum center votes, and minimum edge pixels supporting the radius.
    pub vote_threshold: u32,
    /// Gaussian sigma applied before measuring gradient directions.
    pub direction_sigma: f32,
    /// Half-width of the box summed over the accumulator (2 = 5x5).
    pub smoothing_radius: u32,
    /// 0 means no bound.
    pub min_radius: u32,
    /// 0 means no bound.
    pub max_radius: u32,
    /// Fraction of the circumference that must be covered by edge pixels.
    pub min_coverage: f32,
    /// Minimum |cos| between an edge gradient and the radial direction.
    pub radial_alignment: f32,
}

impl Default for HoughParams {
    fn default() -> Self {
        Self {
            dp: 1,
            min_dist_ratio: 1.0 / 8.0,
            edge_threshold: 100.0,
            vote_threshold: 30,
            direction_sigma: 2.0,
            smoothing_radius: 2,
            min_radius: 0,
            max_radius: 0,
            min_coverage: 0.4,
            radial_alignment: 0.97,
        }
    }
}

// Below this the distance histogram is dominated by the center's own neighborhood.
const SMALLEST_RADIUS: u32 = 3;

struct EdgePoint {
    x: f32,
    y: f32,
    dx: f32,
    dy: f32,
}

/// Detect circles, strongest center first.
pub fn detect_circles(gray: &GrayImage, params: &HoughParams) -> Vec<Circle> {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return vec![];
    }

    let edges = canny(gray, params.edge_threshold / 2.0, params.edge_threshold);
    let (gx, gy) = if params.direction_sigma > 0.0 {
        let smooth = gaussian_blur_f32(gray, params.direction_sigma);
        (horizontal_sobel(&smooth), vertical_sobel(&smooth))
    } else {
        (horizontal_sobel(gray), vertical_sobel(gray))
    };

    let mut points = Vec::new();
    for (x, y, p) in edges.enumerate_pixels() {
        if p.0[0] == 0 {
            continue;
        }
        let dx = gx.get_pixel(x, y).0[0] as f32;
        let dy = gy.get_pixel(x, y).0[0] as f32;
        let mag = (dx * dx + dy * dy).sqrt();
        if mag == 0.0 {
            continue;
        }
        points.push(EdgePoint {
            x: x as f32,
            y: y as f32,
            dx: dx / mag,
            dy: dy / mag,
        });
    }
    if points.is_empty() {
        return vec![];
    }

    let dp = params.dp.max(1);
    let min_r = params.min_radius.max(SMALLEST_RADIUS);
    let max_r = if params.max_radius == 0 { w.max(h) } else { params.max_radius };
    if min_r > max_r {
        return vec![];
    }

    let (acc, aw, ah) = accumulate(&points, w, h, dp, min_r, max_r);
    let radius = params.smoothing_radius as usize;
    let smoothed = box_sum(&acc, aw, ah, radius);
    let centers = find_centers(&smoothed, aw, ah, params.vote_threshold);

    let min_dist = (h as f32 * params.min_dist_ratio).max(1.0);
    let mut circles: Vec<Circle> = Vec::new();

    for (votes, ax, ay) in centers {
        let (mx, my) = centroid(&acc, aw, ah, ax, ay, radius);
        // Cell `i` collects votes landing in [i, i + 1) * dp.
        let cx = (mx + 0.5) * dp as f32;
        let cy = (my + 0.5) * dp as f32;

        let too_close = circles.iter().any(|c| {
            let (ddx, ddy) = (c.x - cx, c.y - cy);
            (ddx * ddx + ddy * ddy).sqrt() < min_dist
        });
        if too_close {
            continue;
        }

        if let Some(radius) = estimate_radius(&points, cx, cy, min_r, max_r, params) {
            circles.push(Circle { x: cx, y: cy, radius, votes });
        }
    }

    circles
}

fn accumulate(
    points: &[EdgePoint],
    w: u32,
    h: u32,
    dp: u32,
    min_r: u32,
    max_r: u32,
) -> (Vec<u32>, usize, usize) {
    let aw = (w / dp).max(1) as usize;
    let ah = (h / dp).max(1) as usize;
    let mut acc = vec![0u32; aw * ah];

    for p in points {
        for sign in [1.0f32, -1.0] {
            let mut last = usize::MAX;
            for r in min_r..=max_r {
                let vx = p.x + sign * p.dx * r as f32;
                let vy = p.y + sign * p.dy * r as f32;
                if vx < 0.0 || vy < 0.0 {
                    break;
                }
                let ax = (vx / dp as f32) as usize;
                let ay = (vy / dp as f32) as usize;
                if ax >= aw || ay >= ah {
                    break;
                }
                let idx = ay * aw + ax;
                // One vote per cell per ray.
                if idx != last {
                    acc[idx] += 1;
                    last = idx;
                }
            }
        }
    }

    (acc, aw, ah)
}

/// Sum over a `(2r+1)` square window, zero outside the grid.
fn box_sum(acc: &[u32], aw: usize, ah: usize, r: usize) -> Vec<u32> {
    if r == 0 {
        return acc.to_vec();
    }
    let mut rows = vec![0u32; acc.len()];
    for y in 0..ah {
        let row = &acc[y * aw..(y + 1) * aw];
        for x in 0..aw {
            let (lo, hi) = (x.saturating_sub(r), (x + r).min(aw - 1));
            rows[y * aw + x] = row[lo..=hi].iter().sum();
        }
    }
    let mut out = vec![0u32; acc.len()];
    for y in 0..ah {
        let (lo, hi) = (y.saturating_sub(r), (y + r).min(ah - 1));
        for x in 0..aw {
            out[y * aw + x] = (lo..=hi).map(|yy| rows[yy * aw + x]).sum();
        }
    }
    out
}

/// Vote-weighted mean cell position in the window around `(ax, ay)`.
fn centroid(acc: &[u32], aw: usize, ah: usize, ax: usize, ay: usize, r: usize) -> (f32, f32) {
    let (mut weight, mut sx, mut sy) = (0.0f32, 0.0f32, 0.0f32);
    for y in ay.saturating_sub(r)..=(ay + r).min(ah - 1) {
        for x in ax.saturating_sub(r)..=(ax + r).min(aw - 1) {
            let v = acc[y * aw + x] as f32;
            weight += v;
            sx += v * x as f32;
            sy += v * y as f32;
        }
    }
    if weight == 0.0 {
        (ax as f32, ay as f32)
    } else {
        (sx / weight, sy / weight)
    }
}

/// Local maxima above threshold, sorted by votes (descending) then scan order.
fn find_centers(acc: &[u32], aw: usize, ah: usize, threshold: u32) -> Vec<(u32, usize, usize)> {
    let mut centers = Vec::new();
    if aw < 3 || ah < 3 {
        return centers;
    }
    for y in 1..ah - 1 {
        for x in 1..aw - 1 {
            let i = y * aw + x;
            let v = acc[i];
            if v > threshold
                && v > acc[i - 1]
                && v >= acc[i + 1]
                && v > acc[i - aw]
                && v >= acc[i + aw]
            {
                centers.push((v, x, y));
            }
        }
    }
    // Stable sort keeps scan order among equal vote counts.
    centers.sort_by(|a, b| b.0.cmp(&a.0));
    centers
}

fn estimate_radius(
    points: &[EdgePoint],
    cx: f32,
    cy: f32,
    min_r: u32,
    max_r: u32,
    params: &HoughParams,
) -> Option<f32> {
    let mut hist = vec![0u32; max_r as usize + 2];

    for p in points {
        let (vx, vy) = (p.x - cx, p.y - cy);
        let d = (vx * vx + vy * vy).sqrt();
        if d < min_r as f32 - 1.0 || d > max_r as f32 + 1.0 || d == 0.0 {
            continue;
        }
        let cos = (p.dx * vx + p.dy * vy) / d;
        if cos.abs() < params.radial_alignment {
            continue;
        }
        let bin = d.round() as usize;
        if bin < hist.len() {
            hist[bin] += 1;
        }
    }

    let mut best: Option<(f32, u32)> = None;
    for r in min_r..=max_r {
        let i = r as usize;
        let support = hist[i - 1] + hist[i] + hist.get(i + 1).copied().unwrap_or(0);
        if support < params.vote_threshold {
            continue;
        }
        let coverage = support as f32 / (2.0 * std::f32::consts::PI * r as f32);
        if coverage < params.min_coverage {
            continue;
        }
        if best.map_or(true, |(c, _)| coverage > c) {
            best = Some((coverage, r));
        }
    }

    best.map(|(_, r)| refine_radius(&hist, r))
}

/// Vote-weighted mean over the winning bin and its neighbors.
fn refine_radius(hist: &[u32], r: u32) -> f32 {
    let i = r as usize;
    let mut weight = 0.0f32;
    let mut sum = 0.0f32;
    for b in i.saturating_sub(1)..=(i + 1).min(hist.len() - 1) {
        weight += hist[b] as f32;
        sum += hist[b] as f32 * b as f32;
    }
    if weight == 0.0 { r as f32 } else { sum / weight }
}
