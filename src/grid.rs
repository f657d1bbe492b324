//! Grid planner: scan area to an ordered zig-zag list of XY points.

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::config_loader::ScanConfig;

/// Absorbs float error in `span / step` so exact multiples don't gain a step.
const STEP_EPSILON: f64 = 1e-9;

/// Largest number of grid points a single plan may hold, also the per-axis cap.
pub const MAX_GRID_POINTS: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GridPoint {
    pub row: usize,
    pub col: usize,
    pub x: f64,
    pub y: f64,
}

/// Per-axis stepping derived from the configured area.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AxisSteps {
    pub start: f64,
    pub steps: usize,
    /// Step with its direction applied
    pub signed_step: f64,
    /// Last coordinate actually visited, may fall short of the configured end
    pub actual_end: f64,
}

impl AxisSteps {
    pub fn new(start: f64, end: f64, step: f64) -> Result<Self> {
        if !step.is_finite() || step == 0.0 {
            return Err(anyhow!("Step size must be non-zero, got {}", step));
        }
        let span = end - start;
        let raw_steps = ((span.abs() / step.abs()) - STEP_EPSILON).ceil().max(1.0);
        if !raw_steps.is_finite() || raw_steps > MAX_GRID_POINTS as f64 {
            return Err(anyhow!("Step size {} over {} mm needs {} steps, limit is {}",
                               step, span.abs(), raw_steps, MAX_GRID_POINTS));
        }
        let steps = raw_steps as usize;
        let direction = if span > 0.0 {
            1.0
        } else if span < 0.0 {
            -1.0
        } else {
            step.signum()
        };
        let signed_step = step.abs() * direction;
        Ok(Self {
            start,
            steps,
            signed_step,
            actual_end: start + (steps - 1) as f64 * signed_step,
        })
    }

    pub fn coord(&self, index: usize) -> f64 {
        self.start + index as f64 * self.signed_step
    }
}

/// Ordered traversal of the scan area.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridPlan {
    pub x: AxisSteps,
    pub y: AxisSteps,
    pub points: Vec<GridPoint>,
}

impl GridPlan {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Plan the grid for `config`: row-major over Y, even rows ascending in X,
/// odd rows descending.
pub fn plan(config: &ScanConfig) -> Result<GridPlan> {
    let x = AxisSteps::new(config.start_x, config.end_x, config.step_size_x)
        .map_err(|e| anyhow!("X axis: {}", e))?;
    let y = AxisSteps::new(config.start_y, config.end_y, config.step_size_y)
        .map_err(|e| anyhow!("Y axis: {}", e))?;

    let total = x.steps
        .checked_mul(y.steps)
        .filter(|n| *n <= MAX_GRID_POINTS)
        .ok_or_else(|| anyhow!("Grid of {} x {} points exceeds the limit of {}", x.steps, y.steps, MAX_GRID_POINTS))?;

    let mut points = Vec::with_capacity(total);
    for row in 0..y.steps {
        let yc = y.coord(row);
        let cols: Box<dyn Iterator<Item = usize>> = if row % 2 == 0 {
            Box::new(0..x.steps)
        } else {
            Box::new((0..x.steps).rev())
        };
        for col in cols {
            points.push(GridPoint { row, col, x: x.coord(col), y: yc });
        }
    }
    Ok(GridPlan { x, y, points })
}

/// Z sweep speed (mm/min) so the sweep lasts `frames / frame_rate` seconds.
///
/// A zero or non-finite duration, or a speed that comes out non-positive
/// (equal start and end), uses `fallback`.
pub fn sweep_speed(start_z: f64, end_z: f64, frames: u32, frame_rate: f64, fallback: f64) -> f64 {
    let duration = frames as f64 / frame_rate;
    if !(duration > 0.0 && duration.is_finite()) {
        return fallback;
    }
    let speed = (end_z - start_z).abs() / duration * 60.0;
    if speed > 0.0 && speed.is_finite() {
        speed
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(start: (f64, f64), end: (f64, f64), step: (f64, f64)) -> ScanConfig {
        ScanConfig {
            start_x: start.0,
            start_y: start.1,
            end_x: end.0,
            end_y: end.1,
            step_size_x: step.0,
            step_size_y: step.1,
            ..Default::default()
        }
    }

    #[test]
    fn test_step_counts() {
        assert_eq!(AxisSteps::new(0.0, 10.0, 5.0).unwrap().steps, 2);
        assert_eq!(AxisSteps::new(0.0, 12.0, 5.0).unwrap().steps, 3);
        assert_eq!(AxisSteps::new(0.0, 1.1, 0.1).unwrap().steps, 11);
        assert_eq!(AxisSteps::new(0.0, 0.3, 0.1).unwrap().steps, 3);
    }

    #[test]
    fn test_actual_end_falls_short() {
        let axis = AxisSteps::new(0.0, 10.0, 5.0).unwrap();
        assert_eq!(axis.actual_end, 5.0);
        let axis = AxisSteps::new(0.0, 12.0, 5.0).unwrap();
        assert_eq!(axis.actual_end, 10.0);
    }

    #[test]
    fn test_direction_from_area_not_step_sign() {
        let axis = AxisSteps::new(10.0, 0.0, 5.0).unwrap();
        assert_eq!(axis.signed_step, -5.0);
        assert_eq!(axis.coord(1), 5.0);
        let axis = AxisSteps::new(0.0, 10.0, -5.0).unwrap();
        assert_eq!(axis.signed_step, 5.0);
    }

    #[test]
    fn test_zero_width_axis_single_point() {
        let axis = AxisSteps::new(3.0, 3.0, -2.0).unwrap();
        assert_eq!(axis.steps, 1);
        assert_eq!(axis.signed_step, -2.0);
        assert_eq!(axis.coord(0), 3.0);
        assert_eq!(axis.actual_end, 3.0);
    }

    #[test]
    fn test_zero_step_fails_fast() {
        assert!(plan(&config((0.0, 0.0), (10.0, 10.0), (0.0, 5.0))).is_err());
        assert!(plan(&config((0.0, 0.0), (10.0, 10.0), (5.0, 0.0))).is_err());
    }

    #[test]
    fn test_tiny_step_is_an_error_not_a_panic() {
        let cfg = ScanConfig { step_size_x: 1e-300, ..Default::default() };
        cfg.validate().unwrap();
        assert!(plan(&cfg).is_err());
        assert!(AxisSteps::new(0.0, 1000.0, 0.0025).is_err());
        assert!(AxisSteps::new(-1e308, 1e308, 1.0).is_err());
    }

    #[test]
    fn test_point_total_is_capped() {
        // 200 x 1000 points, each axis within its own cap
        let err = plan(&config((0.0, 0.0), (1000.0, 1000.0), (5.0, 1.0))).unwrap_err();
        assert!(err.to_string().contains("exceeds the limit"), "{}", err);
        assert_eq!(plan(&config((0.0, 0.0), (100.0, 100.0), (1.0, 1.0))).unwrap().len(), 10_000);
    }

    #[test]
    fn test_two_by_two_zig_zag() {
        let grid = plan(&config((0.0, 0.0), (10.0, 10.0), (5.0, 5.0))).unwrap();
        let coords: Vec<(usize, usize, f64, f64)> =
            grid.points.iter().map(|p| (p.row, p.col, p.x, p.y)).collect();
        assert_eq!(coords, vec![
            (0, 0, 0.0, 0.0),
            (0, 1, 5.0, 0.0),
            (1, 1, 5.0, 5.0),
            (1, 0, 0.0, 5.0),
        ]);
    }

    #[test]
    fn test_rows_alternate_direction() {
        let grid = plan(&config((0.0, 0.0), (12.0, 12.0), (5.0, 4.0))).unwrap();
        assert_eq!(grid.x.steps, 3);
        assert_eq!(grid.y.steps, 3);
        for row in 0..grid.y.steps {
            let cols: Vec<usize> = grid.points.iter().filter(|p| p.row == row).map(|p| p.col).collect();
            if row % 2 == 0 {
                assert_eq!(cols, vec![0, 1, 2]);
            } else {
                assert_eq!(cols, vec![2, 1, 0]);
            }
        }
    }

    #[test]
    fn test_sweep_speed() {
        // 5 mm over 150 frames at 10 fps is 15 s
        assert!((sweep_speed(5.0, 0.0, 150, 10.0, 1000.0) - 20.0).abs() < 1e-9);
        assert!((sweep_speed(0.0, 3.0, 30, 10.0, 1000.0) - 60.0).abs() < 1e-9);
        assert_eq!(sweep_speed(5.0, 0.0, 0, 10.0, 1000.0), 1000.0);
        assert_eq!(sweep_speed(5.0, 0.0, 10, f64::INFINITY, 1000.0), 1000.0);
        assert_eq!(sweep_speed(3.0, 3.0, 150, 10.0, 1000.0), 1000.0);
    }
}
