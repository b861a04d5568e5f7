use qbt_core::error::Error;
use qbt_indicators::params::ResolvedValue;

const NAN_PENALTY: f64 = -1.0e18;

/// Maximum number of simultaneously-variable parameters a single
/// `ConditionPair` may enumerate (spec.md §4.1/§7 `TooManyVariables`).
pub const MAX_VARIABLE_PARAMS: usize = 2;

pub fn validate_variable_count(count: usize) -> Result<(), Error> {
    if count > MAX_VARIABLE_PARAMS {
        Err(Error::TooManyVariables(format!(
            "found {count} variable parameters, at most {MAX_VARIABLE_PARAMS} are allowed per condition pair"
        )))
    } else {
        Ok(())
    }
}

/// One in-sample metric observation, located on the (up to) two variable
/// parameter axes. `payload` is whatever the caller needs to recover the
/// concrete parameter combination once a grid cell is selected.
#[derive(Debug, Clone)]
pub struct GridPoint<T> {
    pub dim0: ResolvedValue,
    pub dim1: ResolvedValue,
    pub value: f64,
    pub payload: T,
}

fn sorted_unique(values: impl Iterator<Item = ResolvedValue>) -> Vec<ResolvedValue> {
    let mut out: Vec<ResolvedValue> = Vec::new();
    for v in values {
        if !out.iter().any(|existing| *existing == v) {
            out.push(v);
        }
    }
    out.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    out
}

fn prefix_sum(grid: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let rows = grid.len();
    let cols = if rows > 0 { grid[0].len() } else { 0 };
    let mut prefix = vec![vec![0.0f64; cols + 1]; rows + 1];
    for i in 0..rows {
        for j in 0..cols {
            prefix[i + 1][j + 1] = grid[i][j] + prefix[i][j + 1] + prefix[i + 1][j] - prefix[i][j];
        }
    }
    prefix
}

fn region_sum(prefix: &[Vec<f64>], r0: usize, c0: usize, r1: usize, c1: usize) -> f64 {
    // inclusive [r0, r1] x [c0, c1]
    prefix[r1 + 1][c1 + 1] - prefix[r0][c1 + 1] - prefix[r1 + 1][c0] + prefix[r0][c0]
}

/// Select the best cell of a 2-D metric grid. When both dimensions have at
/// least 3 distinct values, this sums every 3x3 neighbourhood via a 2-D
/// prefix sum and returns the center of the highest-scoring region — a
/// small neighbourhood of good parameters is preferred over a single
/// noisy spike. When a dimension has fewer than 3 values, no 3x3 region
/// exists and the single best cell (ignoring neighbours) is used instead.
fn select_best_cell(grid: &[Vec<f64>]) -> Option<(usize, usize)> {
    let rows = grid.len();
    if rows == 0 {
        return None;
    }
    let cols = grid[0].len();
    if cols == 0 {
        return None;
    }

    if rows < 3 || cols < 3 {
        let mut best: Option<(usize, usize, f64)> = None;
        for (i, row) in grid.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                let score = if v.is_finite() { v } else { NAN_PENALTY };
                if best.map(|(_, _, b)| score > b).unwrap_or(true) {
                    best = Some((i, j, score));
                }
            }
        }
        return best.map(|(i, j, _)| (i, j));
    }

    let sanitized: Vec<Vec<f64>> = grid
        .iter()
        .map(|row| row.iter().map(|v| if v.is_finite() { *v } else { NAN_PENALTY }).collect())
        .collect();
    let prefix = prefix_sum(&sanitized);

    let mut best: Option<(usize, usize, f64)> = None;
    for i in 0..=rows - 3 {
        for j in 0..=cols - 3 {
            let sum = region_sum(&prefix, i, j, i + 2, j + 2);
            if best.map(|(_, _, b)| sum > b).unwrap_or(true) {
                best = Some((i + 1, j + 1, sum));
            }
        }
    }
    best.map(|(i, j, _)| (i, j))
}

fn nearest_observed<T: Clone>(
    points: &[GridPoint<T>],
    dim0_axis: &[ResolvedValue],
    dim1_axis: &[ResolvedValue],
    i: usize,
    j: usize,
) -> Option<(ResolvedValue, ResolvedValue, f64, T)> {
    points
        .iter()
        .min_by(|a, b| {
            let da = (dim0_axis.iter().position(|v| *v == a.dim0).unwrap() as isize - i as isize).abs()
                + (dim1_axis.iter().position(|v| *v == a.dim1).unwrap() as isize - j as isize).abs();
            let db = (dim0_axis.iter().position(|v| *v == b.dim0).unwrap() as isize - i as isize).abs()
                + (dim1_axis.iter().position(|v| *v == b.dim1).unwrap() as isize - j as isize).abs();
            da.cmp(&db)
        })
        .map(|p| (p.dim0.clone(), p.dim1.clone(), p.value, p.payload.clone()))
}

/// One cell of a selected `GridRegion`: a concrete `(dim0, dim1)` parameter
/// pair, its in-sample metric, and the caller's payload for it.
#[derive(Debug, Clone)]
pub struct GridCell<T> {
    pub combination_id: usize,
    pub dim0: ResolvedValue,
    pub dim1: ResolvedValue,
    pub is_metric: f64,
    pub payload: T,
}

/// The nine-cell (or, when a dimension has fewer than 3 distinct values,
/// single-cell) neighbourhood selected per spec.md §4.8, ready for
/// out-of-sample re-evaluation of every cell (spec.md §4.9 step 2).
#[derive(Debug, Clone)]
pub struct GridRegion<T> {
    pub cells: Vec<GridCell<T>>,
    pub mean_metric: f64,
}

/// Build the grid from scattered `(dim0, dim1, value)` observations and
/// return the selected 3x3 (or single-cell fallback) region, per spec.md
/// §4.8's grid-region selection rule. Unobserved cells within the region
/// (filtered-out parameter combinations, e.g. MA5-8's short-lt-long rule)
/// are simply omitted rather than synthesized.
pub fn select_grid_region<T: Clone>(points: &[GridPoint<T>]) -> Result<GridRegion<T>, Error> {
    if points.is_empty() {
        return Err(Error::NoSignal("no in-sample parameter points to optimize over".to_string()));
    }

    let dim0_axis = sorted_unique(points.iter().map(|p| p.dim0.clone()));
    let dim1_axis = sorted_unique(points.iter().map(|p| p.dim1.clone()));

    let mut grid = vec![vec![f64::NAN; dim1_axis.len()]; dim0_axis.len()];
    let mut payloads: Vec<Vec<Option<&T>>> = vec![vec![None; dim1_axis.len()]; dim0_axis.len()];

    for point in points {
        let i = dim0_axis.iter().position(|v| *v == point.dim0).unwrap();
        let j = dim1_axis.iter().position(|v| *v == point.dim1).unwrap();
        grid[i][j] = point.value;
        payloads[i][j] = Some(&point.payload);
    }

    let (i, j) = select_best_cell(&grid)
        .ok_or_else(|| Error::NoSignal("empty parameter grid".to_string()))?;

    let rows = dim0_axis.len();
    let cols = dim1_axis.len();

    let mut cells = Vec::new();
    if rows < 3 || cols < 3 {
        // No 3x3 region exists; the single selected cell stands alone as
        // combination 1. It may itself be an unobserved combination, in
        // which case fall back to the nearest observed cell.
        let cell = if let Some(payload) = payloads[i][j] {
            GridCell {
                combination_id: 1,
                dim0: dim0_axis[i].clone(),
                dim1: dim1_axis[j].clone(),
                is_metric: grid[i][j],
                payload: payload.clone(),
            }
        } else {
            let (d0, d1, value, payload) = nearest_observed(points, &dim0_axis, &dim1_axis, i, j)
                .ok_or_else(|| Error::NoSignal("no observed grid cell near selected region".to_string()))?;
            GridCell { combination_id: 1, dim0: d0, dim1: d1, is_metric: value, payload }
        };
        cells.push(cell);
    } else {
        // (i, j) is the center of the winning 3x3 block.
        let mut combination_id = 1usize;
        for ri in (i - 1)..=(i + 1) {
            for rj in (j - 1)..=(j + 1) {
                if let Some(payload) = payloads[ri][rj] {
                    cells.push(GridCell {
                        combination_id,
                        dim0: dim0_axis[ri].clone(),
                        dim1: dim1_axis[rj].clone(),
                        is_metric: grid[ri][rj],
                        payload: payload.clone(),
                    });
                }
                combination_id += 1;
            }
        }
    }

    if cells.is_empty() {
        return Err(Error::NoSignal("selected grid region has no observed cells".to_string()));
    }

    let finite: Vec<f64> = cells.iter().map(|c| c.is_metric).filter(|v| v.is_finite()).collect();
    let mean_metric = if finite.is_empty() {
        f64::NAN
    } else {
        finite.iter().sum::<f64>() / finite.len() as f64
    };

    Ok(GridRegion { cells, mean_metric })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(d0: i64, d1: i64, value: f64, payload: &'static str) -> GridPoint<&'static str> {
        GridPoint {
            dim0: ResolvedValue::Int(d0),
            dim1: ResolvedValue::Int(d1),
            value,
            payload,
        }
    }

    #[test]
    fn rejects_more_than_two_variable_params() {
        assert!(validate_variable_count(3).is_err());
        assert!(validate_variable_count(2).is_ok());
    }

    #[test]
    fn single_dimension_falls_back_to_best_cell() {
        let points = vec![point(1, 0, 0.5, "a"), point(2, 0, 0.9, "b"), point(3, 0, 0.2, "c")];
        let region = select_grid_region(&points).unwrap();
        assert_eq!(region.cells.len(), 1);
        assert_eq!(region.cells[0].combination_id, 1);
        assert_eq!(region.cells[0].payload, "b");
    }

    #[test]
    fn picks_center_of_best_3x3_region_over_isolated_spike() {
        // A uniform 3x3 block of decent values centered at (2,2), versus an
        // isolated spike at (5,5) whose immediate neighbours are NaN
        // (degenerate/overfit combinations). The spike's own 3x3
        // neighbourhood sum is dominated by the NaN penalty even though its
        // own cell is enormous.
        let mut points = Vec::new();
        for i in 0..6i64 {
            for j in 0..6i64 {
                let in_block = (1..=3).contains(&i) && (1..=3).contains(&j);
                let is_spike = i == 5 && j == 5;
                let is_spike_neighbor = (i == 4 && j == 5) || (i == 5 && j == 4) || (i == 4 && j == 4);
                if in_block {
                    points.push(point(i, j, 0.5, "region"));
                } else if is_spike {
                    points.push(point(i, j, 100.0, "spike"));
                } else if is_spike_neighbor {
                    points.push(point(i, j, f64::NAN, "degenerate"));
                } else {
                    points.push(point(i, j, 0.1, "baseline"));
                }
            }
        }
        let region = select_grid_region(&points).unwrap();
        // The full 3x3 block is observed, so all nine combinations survive.
        assert_eq!(region.cells.len(), 9);
        assert!(region.cells.iter().all(|c| c.payload == "region"));
        assert!((region.mean_metric - 0.5).abs() < 1e-9);
        let ids: std::collections::BTreeSet<usize> = region.cells.iter().map(|c| c.combination_id).collect();
        assert_eq!(ids, (1..=9).collect());
    }

    #[test]
    fn drops_unobserved_cells_within_the_region() {
        // A 3x3 block with one filtered-out combination (e.g. a short>=long
        // MA pair) has no payload for that cell; it is omitted rather than
        // synthesized, and the region still reports the other eight.
        let mut points = Vec::new();
        for i in 0..3i64 {
            for j in 0..3i64 {
                if i == 1 && j == 1 {
                    continue;
                }
                points.push(point(i, j, 0.5, "region"));
            }
        }
        let region = select_grid_region(&points).unwrap();
        assert_eq!(region.cells.len(), 8);
    }

    #[test]
    fn empty_grid_is_no_signal() {
        let points: Vec<GridPoint<&str>> = vec![];
        assert!(select_grid_region(&points).is_err());
    }
}
