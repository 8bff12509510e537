/// Horizontal depth slices through an assembled grid
use std::io::Write;
use std::path::Path;
use std::time::SystemTime;

use ndarray::{Array1, Array2, Array3, Axis};
use ndarray_stats::QuantileExt;
use rayon::prelude::*;

use crate::error::{GprError, Result};
use crate::geometry::GridOrigin;
use crate::grid::ParallelGrid;
use crate::{filters, tools};

#[derive(Debug, Clone)]
pub struct Timeslice {
    /// Depth of the top of the window in m
    pub top_m: f64,
    /// Depth of the bottom of the window in m
    pub bottom_m: f64,
    /// Normalised amplitudes of the shape (lines, traces)
    pub data: Array2<f32>,
    /// The grid line of each row in `data`
    pub line_indices: Vec<usize>,
    /// The grid trace of each column in `data`
    pub trace_indices: Vec<usize>,
    pub log: Vec<String>,
}

/// Whether a depth falls in the window (top, bottom]. A window starting at the surface includes it.
fn in_window(depth: f64, top: f64, bottom: f64) -> bool {
    (depth > top || (top <= 0. && depth >= top)) && depth <= bottom
}

/// Sum the absolute amplitudes between two depths, normalised by the maximum sum
///
/// # Arguments
/// - `stack`: The grid volume as (samples, lines, traces), see [`ParallelGrid::timeslice_stack`]
/// - `depths`: The depth of each sample in m
/// - `velocity`: The medium velocity in m/ns that `depths` were derived with
/// - `top`: The top of the window in m
/// - `bottom`: The bottom of the window in m
pub fn depth_window(
    stack: &Array3<f32>,
    depths: &Array1<f64>,
    velocity: f64,
    top: f64,
    bottom: f64,
) -> Result<Timeslice> {
    let start_time = SystemTime::now();
    if bottom <= top {
        return Err(GprError::Step(format!(
            "The bottom of a depth window ({} m) must be below its top ({} m)",
            bottom, top
        )));
    }

    let samples = depths
        .iter()
        .enumerate()
        .filter(|(_, depth)| in_window(**depth, top, bottom))
        .map(|(i, _)| i)
        .collect::<Vec<usize>>();

    let (_, n_lines, n_traces) = stack.dim();
    let mut data = Array2::<f32>::zeros((n_lines, n_traces));
    for sample in &samples {
        data.zip_mut_with(&stack.index_axis(Axis(0), *sample), |sum, value| {
            *sum += value.abs()
        });
    }

    let maxval = *data
        .max()
        .map_err(|e| GprError::Shape(format!("Could not normalise timeslice: {}", e)))?;
    if maxval > 0. {
        data /= maxval;
    }

    let mut slice = Timeslice {
        top_m: top,
        bottom_m: bottom,
        line_indices: (0..n_lines).collect(),
        trace_indices: (0..n_traces).collect(),
        data,
        log: Vec::new(),
    };
    slice.log_event(
        "depth_window",
        &format!(
            "Summed {} samples between {} and {} m (velocity: {} m/ns)",
            samples.len(),
            top,
            bottom,
            velocity
        ),
        start_time,
    );
    Ok(slice)
}

/// Cut consecutive slices of equal thickness from the surface down to the deepest sample
pub fn slices(grid: &ParallelGrid, velocity: f64, thickness: f64) -> Result<Vec<Timeslice>> {
    if thickness <= 0. {
        return Err(GprError::Step(format!(
            "The slice thickness must be positive: {}",
            thickness
        )));
    }
    let depths = grid.depths(velocity);
    let max_depth = depths.iter().fold(0_f64, |acc, d| acc.max(*d));
    let n_slices = ((max_depth / thickness) - 1e-9).ceil().max(1.) as usize;

    let stack = grid.timeslice_stack()?;

    (0..n_slices)
        .into_par_iter()
        .map(|i| {
            depth_window(
                &stack,
                &depths,
                velocity,
                tools::round_to(i as f64 * thickness, 9),
                tools::round_to((i + 1) as f64 * thickness, 9),
            )
        })
        .collect()
}

impl Timeslice {
    /// Run a slice processing step by its name, e.g. "moving_average(5)"
    pub fn process(&mut self, step: &str) -> Result<()> {
        let start_time = SystemTime::now();
        let event = match tools::step_name(step) {
            "clip" => {
                let n_std = tools::parse_optional::<f32>(step, 0)?
                    .unwrap_or(filters::DEFAULT_CLIP_STD);
                filters::clip_std(&mut self.data, n_std);
                format!("Clipped to the mean +- {} standard deviations", n_std)
            }
            "moving_average" => {
                let radius = tools::parse_optional::<usize>(step, 0)?
                    .unwrap_or(filters::DEFAULT_MOVING_AVERAGE_RADIUS);
                self.data = filters::moving_average(&self.data, radius)?;
                format!("Smoothed with a {0}x{0} moving average", radius)
            }
            "high_pass" => {
                self.data = filters::high_pass(&self.data);
                "Applied a 3x3 high-pass filter".to_string()
            }
            "clip_to_border" => {
                let old_shape = self.data.shape().to_vec();
                self.clip_to_border();
                format!(
                    "Removed empty borders: {:?} -> {:?}",
                    old_shape,
                    self.data.shape()
                )
            }
            "zero" => {
                let zero = tools::parse_optional::<f32>(step, 0)?.unwrap_or(0.);
                filters::zero_min(&mut self.data, zero);
                format!("Shifted the minimum to {}", zero)
            }
            _ => {
                return Err(GprError::Step(format!(
                    "Step name not recognized for timeslices: {}",
                    step
                )))
            }
        };
        self.log_event(tools::step_name(step), &event, start_time);
        Ok(())
    }

    fn clip_to_border(&mut self) {
        let (rows, cols) = filters::data_extent(&self.data);

        self.data = self.data.select(Axis(0), &rows).select(Axis(1), &cols);
        self.line_indices = rows.iter().map(|i| self.line_indices[*i]).collect();
        self.trace_indices = cols.iter().map(|i| self.trace_indices[*i]).collect();
    }

    /// The slice on the full (lines, traces) grid, with NaN where rows or columns were removed
    pub fn full_extent(&self, lines: usize, traces: usize) -> Array2<f32> {
        let mut full = Array2::<f32>::from_elem((lines, traces), f32::NAN);

        for (i, line) in self.line_indices.iter().enumerate() {
            for (j, trace) in self.trace_indices.iter().enumerate() {
                full[[*line, *trace]] = self.data[[i, j]];
            }
        }
        full
    }

    /// Write the slice as comma separated x, y and value columns
    pub fn to_xyz(
        &self,
        grid: &ParallelGrid,
        origin: Option<&GridOrigin>,
        filepath: &Path,
    ) -> Result<()> {
        let file = std::fs::File::create(filepath).map_err(|e| GprError::io(filepath, e))?;
        let mut writer = std::io::BufWriter::new(file);
        let distances = grid.distances();

        let mut write = |text: String| {
            writer
                .write_all(text.as_bytes())
                .map_err(|e| GprError::io(filepath, e))
        };
        write("x,y,value\n".to_string())?;

        for (i, line) in self.line_indices.iter().enumerate() {
            for (j, trace) in self.trace_indices.iter().enumerate() {
                let (x, y) = grid.local_xy(grid.transects[*line], distances[*trace]);
                let (x, y) = match origin {
                    Some(o) => o.to_world(x, y),
                    None => (x, y),
                };
                write(format!("{},{},{}\n", x, y, self.data[[i, j]]))?;
            }
        }
        writer.flush().map_err(|e| GprError::io(filepath, e))
    }

    fn log_event(&mut self, step_name: &str, event: &str, start_time: SystemTime) {
        let duration = SystemTime::now()
            .duration_since(start_time)
            .map(|d| d.as_secs_f32())
            .unwrap_or(0.);
        tracing::debug!("{}: {}", step_name, event);
        self.log.push(format!(
            "{} (duration: {:.2}s):\t{}",
            step_name, duration, event
        ));
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::{arr2, Array2};

    use crate::error::Result;
    use crate::grid::tests::{make_grid, segment};
    use crate::grid::ParallelGrid;

    use super::Timeslice;

    // make_grid() has 2 samples at 1000 MHz; at 0.1 m/ns they lie at 0 and 0.05 m depth

    fn window(grid: &ParallelGrid, top: f64, bottom: f64) -> Result<Timeslice> {
        super::depth_window(&grid.timeslice_stack()?, &grid.depths(0.1), 0.1, top, bottom)
    }

    #[test]
    fn test_depth_window() {
        let grid = make_grid();

        let surface = window(&grid, 0., 0.01).unwrap();
        assert_eq!(surface.data.shape(), &[2, 4]);
        assert_relative_eq!(surface.data[[1, 2]], 1.0);
        assert_relative_eq!(surface.data[[0, 0]], 0.1);
        assert_eq!(surface.log.len(), 1);

        let both = window(&grid, 0., 0.05).unwrap();
        // Line 1, trace 2 sums |10| + |12|
        assert_relative_eq!(both.data[[1, 2]], 1.0);
        assert_relative_eq!(both.data[[0, 0]], 5. / 22.);

        // No samples in the window gives zeros
        let empty = window(&grid, 1., 2.).unwrap();
        assert!(empty.data.iter().all(|v| *v == 0.));

        assert!(window(&grid, 1., 1.).is_err());
    }

    #[test]
    fn test_slices() {
        let grid = make_grid();
        let slices = super::slices(&grid, 0.1, 0.03).unwrap();

        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].top_m, 0.);
        assert_relative_eq!(slices[1].bottom_m, 0.06);
        // The second window only holds the second sample
        assert_relative_eq!(slices[1].data[[1, 3]], 11. / 12.);

        assert!(super::slices(&grid, 0.1, 0.).is_err());
    }

    #[test]
    fn test_slices_cover_every_sample() {
        // 7 samples at 1000 MHz and 0.1 m/ns lie at 0, 0.05, .., 0.3 m
        let data = Array2::from_shape_fn((7, 2), |(i, _)| (i + 1) as f32);
        let grid =
            ParallelGrid::assemble(&[segment("a", ["0", "0", "+", "0"], data)], None, None).unwrap();
        let depths = grid.depths(0.1);
        assert_eq!(depths[3], 0.15);
        assert_eq!(depths[6], 0.3);

        let slices = super::slices(&grid, 0.1, 0.1).unwrap();
        assert_eq!(slices.len(), 3);
        for depth in depths.iter() {
            let n = slices
                .iter()
                .filter(|s| super::in_window(*depth, s.top_m, s.bottom_m))
                .count();
            assert_eq!(n, 1, "{} m lies in {} slices", depth, n);
        }
        // The deepest slice holds the samples at 0.25 and 0.3 m
        assert!(slices[2].log[0].contains("Summed 2 samples"));
        assert!(slices[0].log[0].contains("Summed 3 samples"));
    }

    #[test]
    fn test_process_and_full_extent() {
        let grid = make_grid();
        let mut slice = window(&grid, 0., 0.01).unwrap();
        slice.data = arr2(&[[0., 0., 0., 0.], [0., 0.5, 1., 0.]]);

        slice.process("clip_to_border").unwrap();
        assert_eq!(slice.data, arr2(&[[0.5, 1.]]));
        assert_eq!(slice.line_indices, vec![1]);
        assert_eq!(slice.trace_indices, vec![1, 2]);

        let full = slice.full_extent(2, 4);
        assert!(full[[0, 0]].is_nan());
        assert_eq!(full[[1, 2]], 1.);

        slice.process("zero(1)").unwrap();
        assert_eq!(slice.data, arr2(&[[1., 1.5]]));

        slice.process("moving_average(1)").unwrap();
        slice.process("clip(2)").unwrap();
        slice.process("high_pass").unwrap();
        assert_eq!(slice.log.len(), 6);

        assert!(slice.process("dewow").is_err());
    }

    #[test]
    fn test_to_xyz() {
        let dir = tempfile::tempdir().unwrap();
        let grid = make_grid();
        let mut slice = window(&grid, 0., 0.01).unwrap();
        slice.data = arr2(&[[0., 0., 0., 0.], [0., 0.5, 1., 0.]]);
        slice.process("clip_to_border").unwrap();

        let path = dir.path().join("slice.xyz");
        slice.to_xyz(&grid, None, &path).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "x,y,value\n0.5,1,0.5\n1,1,1\n"
        );
    }
}
