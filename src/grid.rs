/// Assembly of parallel line segments into a regular survey grid
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use ndarray::{s, Array1, Array2, Array3, Axis as ArrayAxis};
use rayon::prelude::*;

use crate::error::{GprError, Result};
use crate::geometry::{self, Axis, Direction, GridOrigin, SegmentRecord};
use crate::line::{Line, LineMeta};
use crate::{io, timeslice, tools};

/// A measured line segment and its place in the survey geometry
#[derive(Debug, Clone)]
pub struct Segment {
    pub record: SegmentRecord,
    pub line: Line,
}

impl Segment {
    pub fn load(record: SegmentRecord, data_dir: &Path, medium_velocity: f64) -> Result<Segment> {
        let rad_path = record.rad_path(data_dir);
        tracing::debug!("Loading segment {} from {:?}", record.id, rad_path);
        let line = Line::from_meta(io::load_rad(&rad_path, medium_velocity)?)?;

        Ok(Segment { record, line })
    }
}

/// Start and end of a grid line in grid (or world) coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct LineGeometry {
    pub name: String,
    pub start: (f64, f64),
    pub end: (f64, f64),
}

#[derive(Debug, Clone)]
pub struct ParallelGrid {
    /// The axis that all lines run along
    pub axis: Axis,
    /// Along-axis coordinate of the first trace
    pub datum: f64,
    /// Distance between traces
    pub step: f64,
    pub samples: usize,
    pub frequency: f64,
    pub system_calibration: f64,
    pub medium_velocity: f64,
    /// Distance between neighbouring lines (0 for a single line)
    pub line_spacing: f64,
    /// Across-axis coordinate of each line
    pub transects: Vec<f64>,
    pub traces: usize,
    /// One radargram per transect, all of the shape (samples, traces)
    pub lines: Vec<Line>,
    pub log: Vec<String>,
}

/// Round a fractional trace index to the nearest integer, letting ties go down
fn snap_index(position: f64) -> i64 {
    (tools::round_to(position, 9) - 0.5).ceil() as i64
}

/// The name of a grid line from its transect coordinate, e.g. 2.5 -> "LINE250"
pub fn line_name(transect: f64) -> String {
    format!("LINE{}", tools::round_to(transect * 100., 6).trunc() as i64)
}

impl ParallelGrid {
    /// Place segments on a common grid
    ///
    /// # Arguments
    /// - `segments`: Loaded segments. Later segments overwrite earlier ones where they overlap.
    /// - `datum`: The along-axis coordinate of the first trace. Defaults to the lowest segment start.
    /// - `length`: The along-axis length of the grid. Defaults to the furthest segment end.
    pub fn assemble(
        segments: &[Segment],
        datum: Option<f64>,
        length: Option<f64>,
    ) -> Result<ParallelGrid> {
        let start_time = SystemTime::now();
        let first = segments
            .first()
            .ok_or_else(|| GprError::Geometry("No segments to assemble".into()))?;

        let axis = first.record.axis()?;
        for segment in segments {
            let other = segment.record.axis()?;
            if other != axis {
                return Err(GprError::Geometry(format!(
                    "All segments must be parallel: {} runs along {} but {} runs along {}",
                    first.record.filename, axis, segment.record.filename, other
                )));
            }
        }

        let step = first.line.metadata.step;
        if step <= 0. {
            return Err(GprError::Geometry(format!(
                "The trace step of {} must be positive: {}",
                first.record.filename, step
            )));
        }
        if let Some(segment) = segments
            .iter()
            .find(|s| (s.line.metadata.step - step).abs() > 1e-9)
        {
            return Err(GprError::Geometry(format!(
                "All segments must share one trace step: {} has {} but {} has {}",
                first.record.filename, step, segment.record.filename, segment.line.metadata.step
            )));
        }

        let samples = segments.iter().map(|s| s.line.height()).max().unwrap_or(0);
        let frequency = consensus(segments, "frequency", |m| m.frequency)?;
        let system_calibration =
            consensus(segments, "system calibration", |m| m.system_calibration)?;

        // Across-axis placement
        let segment_transects = segments
            .iter()
            .map(|s| s.record.transect().map(|t| tools::round_to(t, 6)))
            .collect::<Result<Vec<f64>>>()?;
        let mut unique = segment_transects.clone();
        unique.sort_by(|a, b| a.total_cmp(b));
        unique.dedup();

        let line_spacing = unique
            .windows(2)
            .map(|w| tools::round_to(w[1] - w[0], 6))
            .filter(|d| *d > 0.)
            .fold(None, |acc: Option<f64>, d| Some(acc.map_or(d, |a| a.min(d))))
            .unwrap_or(0.);

        let t0 = unique[0];
        let transects = if line_spacing > 0. {
            let n_lines = ((unique[unique.len() - 1] - t0) / line_spacing).round() as usize + 1;
            (0..n_lines)
                .map(|i| tools::round_to(t0 + i as f64 * line_spacing, 6))
                .collect::<Vec<f64>>()
        } else {
            vec![t0]
        };
        let line_indices = segment_transects
            .iter()
            .zip(segments)
            .map(|(t, segment)| {
                if line_spacing == 0. {
                    return Ok(0);
                }
                let index = ((t - t0) / line_spacing).round();
                let lattice = tools::round_to(t0 + index * line_spacing, 6);
                if (lattice - t).abs() > 1e-6 * line_spacing {
                    return Err(GprError::Geometry(format!(
                        "{} at {} is not on the line lattice {} + n * {}",
                        segment.record.filename, t, t0, line_spacing
                    )));
                }
                Ok(index as usize)
            })
            .collect::<Result<Vec<usize>>>()?;

        // Along-axis placement
        let extents = segments
            .iter()
            .map(|s| -> Result<(f64, Direction)> {
                let start = s.record.along_start()?;
                let direction = s.record.direction()?;
                let low = match direction {
                    Direction::Positive => start,
                    Direction::Negative => {
                        start - s.line.width().saturating_sub(1) as f64 * step
                    }
                };
                Ok((low, direction))
            })
            .collect::<Result<Vec<(f64, Direction)>>>()?;

        let datum = tools::round_to(
            datum.unwrap_or_else(|| {
                extents
                    .iter()
                    .map(|(low, _)| *low)
                    .fold(f64::INFINITY, f64::min)
            }),
            6,
        );
        let start_indices = extents
            .iter()
            .map(|(low, _)| snap_index((low - datum) / step))
            .collect::<Vec<i64>>();

        let traces = match length {
            Some(length) => (length / step + 1e-9).floor() as i64 + 1,
            None => start_indices
                .iter()
                .zip(segments)
                .map(|(start, s)| start + s.line.width() as i64)
                .max()
                .unwrap_or(0),
        };
        if traces <= 0 {
            return Err(GprError::Geometry(format!(
                "No traces fall on the grid (datum: {}, length: {:?})",
                datum, length
            )));
        }

        let mut arrays = vec![Array2::<f32>::zeros((samples, traces as usize)); transects.len()];

        for (((segment, (_, direction)), line_index), start) in segments
            .iter()
            .zip(&extents)
            .zip(&line_indices)
            .zip(&start_indices)
        {
            let mut data = segment.line.data.view();
            if *direction == Direction::Negative {
                data.invert_axis(ArrayAxis(1));
            }
            let (height, width) = data.dim();
            if height < samples {
                tracing::warn!(
                    "{} has {} samples; padding with zeros to {}",
                    segment.record.filename,
                    height,
                    samples
                );
            }

            // Source trace range that falls on the grid
            let first_trace = (-start).max(0);
            let last_trace = (traces - start).min(width as i64);
            let kept = (last_trace - first_trace).max(0);
            if kept < width as i64 {
                tracing::warn!(
                    "{}: cropped {} of {} traces outside the grid",
                    segment.record.filename,
                    width as i64 - kept,
                    width
                );
            }
            if kept > 0 {
                arrays[*line_index]
                    .slice_mut(s![
                        ..height,
                        (start + first_trace) as usize..(start + last_trace) as usize
                    ])
                    .assign(&data.slice(s![.., first_trace as usize..last_trace as usize]));
            }
        }

        let antenna = segments.iter().find_map(|s| s.line.metadata.antenna.clone());
        let medium_velocity = first.line.metadata.medium_velocity;
        let lines = arrays
            .into_iter()
            .zip(&transects)
            .map(|(data, transect)| {
                let name = line_name(*transect);
                let metadata = LineMeta {
                    samples: samples as u32,
                    frequency,
                    step,
                    start_position: datum,
                    system_calibration,
                    traces: traces as u32,
                    time_window: samples as f64 * 1000. / frequency,
                    antenna: antenna.clone(),
                    header: Vec::new(),
                    rd3_filepath: PathBuf::from(format!("{}.rd3", name)),
                    medium_velocity,
                };
                Line::from_array(data, metadata)
            })
            .collect::<Vec<Line>>();

        let mut grid = ParallelGrid {
            axis,
            datum,
            step,
            samples,
            frequency,
            system_calibration,
            medium_velocity,
            line_spacing,
            transects,
            traces: traces as usize,
            lines,
            log: Vec::new(),
        };
        grid.log_event(
            "assemble",
            &format!(
                "Assembled {} segments into {} lines of {} traces along {} (datum: {}, spacing: {})",
                segments.len(),
                grid.lines.len(),
                grid.traces,
                grid.axis,
                grid.datum,
                grid.line_spacing
            ),
            start_time,
        );
        Ok(grid)
    }

    /// Along-axis coordinate of each trace
    pub fn distances(&self) -> Array1<f64> {
        Array1::from_iter(
            (0..self.traces).map(|i| tools::round_to(self.datum + i as f64 * self.step, 6)),
        )
    }

    pub fn times(&self) -> Array1<f64> {
        crate::line::sample_times(self.samples, self.frequency)
    }

    /// Depth of each sample in m, rounded so that depths on a slice boundary compare equal to it
    pub fn depths(&self, velocity: f64) -> Array1<f64> {
        self.times()
            .mapv(|t| tools::round_to(tools::two_way_depth_m(t, velocity), 6))
    }

    pub fn line_names(&self) -> Vec<String> {
        self.transects.iter().map(|t| line_name(*t)).collect()
    }

    /// All lines as a volume of the shape (lines, samples, traces)
    pub fn stack(&self) -> Result<Array3<f32>> {
        let views = self.lines.iter().map(|l| l.data.view()).collect::<Vec<_>>();

        ndarray::stack(ArrayAxis(0), &views).map_err(|e| GprError::Shape(e.to_string()))
    }

    /// The volume as (samples, lines, traces), so that the first index is the surface slice
    pub fn timeslice_stack(&self) -> Result<Array3<f32>> {
        Ok(self
            .stack()?
            .permuted_axes([1, 0, 2])
            .as_standard_layout()
            .into_owned())
    }

    /// Run a line processing step on every line
    pub fn process_lines(&mut self, step: &str) -> Result<()> {
        let start_time = SystemTime::now();
        if tools::step_name(step) == "flip" {
            return Err(GprError::Step(
                "'flip' is not available for grid lines since it breaks their alignment".into(),
            ));
        }
        self.lines
            .par_iter_mut()
            .try_for_each(|line| line.process(step))?;

        // Steps like subset change all lines equally
        if let Some(line) = self.lines.first() {
            self.samples = line.height();
            self.traces = line.width();
            self.datum = tools::round_to(line.metadata.start_position, 6);
        }
        self.log_event(
            "process_lines",
            &format!("Applied '{}' to {} lines", step, self.lines.len()),
            start_time,
        );
        Ok(())
    }

    /// Local (x, y) coordinates of a point given by its transect and along-axis coordinates
    pub fn local_xy(&self, transect: f64, along: f64) -> (f64, f64) {
        match self.axis {
            Axis::X => (along, transect),
            Axis::Y => (transect, along),
        }
    }

    /// World easting and northing of every trace, each of the shape (lines, traces)
    pub fn world_coordinates(&self, origin: &GridOrigin) -> (Array2<f64>, Array2<f64>) {
        let distances = self.distances();
        let position = |(i, j): (usize, usize)| {
            let (x, y) = self.local_xy(self.transects[i], distances[j]);
            origin.to_world(x, y)
        };
        let shape = (self.lines.len(), self.traces);

        (
            Array2::from_shape_fn(shape, |ij| position(ij).0),
            Array2::from_shape_fn(shape, |ij| position(ij).1),
        )
    }

    pub fn line_geometry(&self, origin: Option<&GridOrigin>) -> Vec<LineGeometry> {
        let end = self.datum + self.traces.saturating_sub(1) as f64 * self.step;
        let convert = |(x, y): (f64, f64)| match origin {
            Some(o) => o.to_world(x, y),
            None => (x, y),
        };

        self.transects
            .iter()
            .map(|transect| LineGeometry {
                name: line_name(*transect),
                start: convert(self.local_xy(*transect, self.datum)),
                end: convert(self.local_xy(*transect, end)),
            })
            .collect()
    }

    pub fn geometry_to_csv(&self, filepath: &Path, origin: Option<&GridOrigin>) -> Result<()> {
        let mut output = "name,x0,y0,x1,y1\n".to_string();

        for line in self.line_geometry(origin) {
            output += &format!(
                "{},{},{},{},{}\n",
                line.name, line.start.0, line.start.1, line.end.0, line.end.1
            );
        }
        std::fs::write(filepath, output).map_err(|e| GprError::io(filepath, e))
    }

    /// Write each line as a .rd3/.rad pair named after its transect
    ///
    /// Existing files are left untouched. Two lines with the same name are an error.
    ///
    /// # Returns
    /// The number of files that were written.
    pub fn export_lines(&self, directory: &Path) -> Result<usize> {
        let names = self.line_names();
        if let Some(name) = names
            .iter()
            .enumerate()
            .find_map(|(i, name)| names[..i].contains(name).then_some(name))
        {
            return Err(GprError::Geometry(format!(
                "Lines closer than 1 cm share the name {} and cannot be exported as separate files",
                name
            )));
        }
        std::fs::create_dir_all(directory).map_err(|e| GprError::io(directory, e))?;
        let mut written = 0_usize;

        for (name, line) in names.iter().zip(&self.lines) {
            let rd3_path = directory.join(format!("{}.rd3", name));
            if !rd3_path.is_file() {
                io::write_rd3(&line.data, &rd3_path)?;
                written += 1;
            }
            let rad_path = directory.join(format!("{}.rad", name));
            if !rad_path.is_file() {
                io::write_rad(&line.metadata, &rad_path)?;
                written += 1;
            }
        }
        Ok(written)
    }

    fn log_event(&mut self, step_name: &str, event: &str, start_time: SystemTime) {
        let duration = SystemTime::now()
            .duration_since(start_time)
            .map(|d| d.as_secs_f32())
            .unwrap_or(0.);
        tracing::info!("{}: {}", step_name, event);
        self.log.push(format!(
            "{} (duration: {:.2}s):\t{}",
            step_name, duration, event
        ));
    }
}

/// The most common metadata value among segments, warning if they disagree
fn consensus(segments: &[Segment], name: &str, value: fn(&LineMeta) -> f64) -> Result<f64> {
    let values = segments
        .iter()
        .map(|s| value(&s.line.metadata))
        .collect::<Vec<f64>>();

    let (mode, n_distinct) = tools::mode(&values, 1e-9)
        .ok_or_else(|| GprError::Geometry(format!("No {} values to compare", name)))?;
    if n_distinct > 1 {
        tracing::warn!(
            "Segments have {} different values of {}; using the most common: {}",
            n_distinct,
            name,
            mode
        );
    }
    Ok(mode)
}

pub struct GridParams {
    pub geometry_path: PathBuf,
    pub data_dir: PathBuf,
    pub output_path: PathBuf,
    pub datum: Option<f64>,
    pub length: Option<f64>,
    pub medium_velocity: f64,
    pub line_steps: Vec<String>,
    pub slice_thickness: Option<f64>,
    pub slice_steps: Vec<String>,
    pub origin: Option<GridOrigin>,
    pub lines_dir: Option<PathBuf>,
    pub geometry_csv: Option<PathBuf>,
    pub slice_xyz_dir: Option<PathBuf>,
    pub no_export: bool,
}

/// Run the `grid` subcommand
pub fn run(params: GridParams) -> Result<()> {
    let records = geometry::read_geometry(&params.geometry_path)?;
    tracing::info!(
        "Loading {} segments listed in {:?}",
        records.len(),
        params.geometry_path
    );

    // Collecting keeps the input order, which decides what overwrites what
    let segments = records
        .into_par_iter()
        .map(|record| Segment::load(record, &params.data_dir, params.medium_velocity))
        .collect::<Result<Vec<Segment>>>()?;

    let mut grid = ParallelGrid::assemble(&segments, params.datum, params.length)?;
    drop(segments);

    for step in &params.line_steps {
        grid.process_lines(step)?;
    }

    let mut slices = match params.slice_thickness {
        Some(thickness) => timeslice::slices(&grid, params.medium_velocity, thickness)?,
        None => Vec::new(),
    };
    for slice in slices.iter_mut() {
        for step in &params.slice_steps {
            slice.process(step)?;
        }
    }

    if !params.no_export {
        tracing::info!("Exporting to {:?}", params.output_path);
        io::export_grid_netcdf(
            &grid,
            &slices,
            params.medium_velocity,
            params.origin.as_ref(),
            &params.output_path,
        )?;
    }
    if let Some(directory) = &params.lines_dir {
        let written = grid.export_lines(directory)?;
        tracing::info!("Wrote {} line files to {:?}", written, directory);
    }
    if let Some(filepath) = &params.geometry_csv {
        grid.geometry_to_csv(filepath, params.origin.as_ref())?;
    }
    if let Some(directory) = &params.slice_xyz_dir {
        std::fs::create_dir_all(directory).map_err(|e| GprError::io(directory, e))?;
        for (i, slice) in slices.iter().enumerate() {
            slice.to_xyz(
                &grid,
                params.origin.as_ref(),
                &directory.join(format!("slice_{:03}.xyz", i)),
            )?;
        }
    }
    Ok(())
}
