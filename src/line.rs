/// A single GPR line (radargram) and its processing steps
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use ndarray::{Array1, Array2, Axis, Slice};

use crate::error::{GprError, Result};
use crate::{filters, io, tools};

const DEFAULT_DEWOW_WINDOW: u32 = 5;

#[derive(Debug, Clone)]
pub struct LineMeta {
    /// Number of samples per trace (the height of the radargram)
    pub samples: u32,
    /// Sampling frequency in MHz
    pub frequency: f64,
    /// Distance between traces in m
    pub step: f64,
    /// Position of the first trace along the line in m
    pub start_position: f64,
    pub system_calibration: f64,
    /// Number of traces (the width of the radargram)
    pub traces: u32,
    /// Two-way travel time covered by a trace in ns
    pub time_window: f64,
    pub antenna: Option<String>,
    /// All header key/value pairs in file order
    pub header: Vec<(String, String)>,
    pub rd3_filepath: PathBuf,
    /// Velocity of the medium in m/ns
    pub medium_velocity: f64,
}

impl LineMeta {
    /// Time between two samples in ns
    pub fn time_interval_ns(&self) -> f64 {
        1000. / self.frequency
    }

    /// Position of the last trace along the line
    pub fn stop_position(&self) -> f64 {
        self.start_position + self.step * (self.traces.max(1) - 1) as f64
    }

    pub fn header_value(&self, key: &str) -> Option<&str> {
        self.header
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The trace count stated by the `LAST TRACE` header key, if any
    pub fn header_traces(&self) -> Option<u32> {
        self.header_value("LAST TRACE")?.parse().ok()
    }
}

impl std::fmt::Display for LineMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "
GPR Metadata
------------
Filepath:\t\t{:?}
Samples (height):\t{}
Traces (width):\t\t{}
Time window:\t\t{:.3} ns
Max depth:\t\t{:.2} m
Medium velocity:\t{} m/ns
Sampling frequency:\t{} MHz
Trace step:\t\t{} m
Start position:\t\t{} m
Stop position:\t\t{:.3} m
Antenna:\t\t{}
",
            self.rd3_filepath,
            self.samples,
            self.traces,
            self.time_window,
            tools::two_way_depth_m(self.time_window, self.medium_velocity),
            self.medium_velocity,
            self.frequency,
            self.step,
            self.start_position,
            self.stop_position(),
            self.antenna.as_deref().unwrap_or("Unknown"),
        )
    }
}

#[derive(Debug, Clone)]
pub struct Line {
    /// Amplitudes with the shape (samples, traces)
    pub data: Array2<f32>,
    pub metadata: LineMeta,
    pub log: Vec<String>,
}

impl Line {
    /// Load the rd3 data belonging to the metadata
    ///
    /// The trace count is taken from the data; the header value is only trusted for logging.
    pub fn from_meta(metadata: LineMeta) -> Result<Line> {
        let data = io::load_rd3(&metadata.rd3_filepath, metadata.samples)?;
        Ok(Line::from_array(data, metadata))
    }

    pub fn from_array(data: Array2<f32>, metadata: LineMeta) -> Line {
        match metadata.header_traces() {
            Some(traces) if traces as usize != data.shape()[1] => tracing::warn!(
                "{:?}: header says {} traces but the data have {}. Using the data.",
                metadata.rd3_filepath,
                traces,
                data.shape()[1]
            ),
            _ => (),
        }
        let mut line = Line {
            data,
            metadata,
            log: Vec::new(),
        };
        line.update_data_meta();
        line
    }

    pub fn height(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn width(&self) -> usize {
        self.data.shape()[1]
    }

    /// Two-way travel time of each sample in ns, starting at zero
    pub fn times(&self) -> Array1<f64> {
        sample_times(self.height(), self.metadata.frequency)
    }

    /// Position of each trace along the line in m
    pub fn distances(&self) -> Array1<f64> {
        Array1::from_iter(
            (0..self.width()).map(|i| self.metadata.start_position + i as f64 * self.metadata.step),
        )
    }

    /// Depth of each sample in m, assuming the given medium velocity (m/ns)
    pub fn depths(&self, velocity: f64) -> Array1<f64> {
        self.times()
            .mapv(|t| tools::round_to(tools::two_way_depth_m(t, velocity), 6))
    }

    /// Run a processing step by its name, e.g. "dewow(5)"
    pub fn process(&mut self, step: &str) -> Result<()> {
        match tools::step_name(step) {
            "clip" => {
                let n_std = tools::parse_optional::<f32>(step, 0)?
                    .unwrap_or(filters::DEFAULT_CLIP_STD);
                self.clip(n_std);
            }
            "moving_average" => {
                let radius = tools::parse_optional::<usize>(step, 0)?
                    .unwrap_or(filters::DEFAULT_MOVING_AVERAGE_RADIUS);
                self.moving_average(radius)?;
            }
            "high_pass" => self.high_pass(),
            "dewow" => {
                let window =
                    tools::parse_optional::<u32>(step, 0)?.unwrap_or(DEFAULT_DEWOW_WINDOW);
                self.dewow(window)?;
            }
            "gain" => {
                let linear = match tools::parse_option::<f32>(step, 0)? {
                    Some(v) => Ok(v),
                    None => Err(GprError::Step(
                        "The linear gain factor must be specified when applying gain. E.g. gain(0.1)"
                            .to_string(),
                    )),
                }?;
                self.gain(linear);
            }
            "subset" => {
                let min_trace = match tools::parse_option::<usize>(step, 0)? {
                    Some(v) => Ok(v),
                    None => Err(GprError::Step(
                        "Indices must be given when subsetting, e.g. subset(0 -1 0 500)".to_string(),
                    )),
                }?;
                let end_index = |index: usize| -> Result<Option<usize>> {
                    Ok(tools::parse_optional::<isize>(step, index)?
                        .and_then(|v| if v < 0 { None } else { Some(v as usize) }))
                };
                let max_trace = end_index(1)?;
                let min_sample = tools::parse_optional::<usize>(step, 2)?;
                let max_sample = end_index(3)?;
                self.subset(Some(min_trace), max_trace, min_sample, max_sample)?;
            }
            "flip" => self.flip(),
            _ => return Err(GprError::Step(format!("Step name not recognized: {}", step))),
        }
        Ok(())
    }

    pub fn clip(&mut self, n_std: f32) {
        let start_time = SystemTime::now();
        filters::clip_std(&mut self.data, n_std);
        self.log_event(
            "clip",
            &format!("Clipped amplitudes to the mean +- {} standard deviations", n_std),
            start_time,
        );
    }

    pub fn moving_average(&mut self, radius: usize) -> Result<()> {
        let start_time = SystemTime::now();
        self.data = filters::moving_average(&self.data, radius)?;
        self.log_event(
            "moving_average",
            &format!("Smoothed with a {0}x{0} moving average", radius),
            start_time,
        );
        Ok(())
    }

    pub fn high_pass(&mut self) {
        let start_time = SystemTime::now();
        self.data = filters::high_pass(&self.data);
        self.log_event("high_pass", "Applied a 3x3 high-pass filter", start_time);
    }

    /// Subtract the mean of consecutive windows of samples, trace by trace
    pub fn dewow(&mut self, window: u32) -> Result<()> {
        let start_time = SystemTime::now();
        if window == 0 {
            return Err(GprError::Step("The dewow window must be larger than zero".into()));
        }
        let window = window as usize;

        for mut trace in self.data.columns_mut() {
            for start in (0..trace.len()).step_by(window) {
                let end = (start + window).min(trace.len());
                let mut view = trace.slice_axis_mut(Axis(0), Slice::from(start..end));
                if let Some(mean) = view.mean() {
                    view -= mean;
                }
            }
        }
        self.log_event(
            "dewow",
            &format!("Ran dewow with a window size of {}", window),
            start_time,
        );
        Ok(())
    }

    /// Multiply each sample by its zero-based index times `linear`
    pub fn gain(&mut self, linear: f32) {
        let start_time = SystemTime::now();

        for (i, mut row) in self.data.rows_mut().into_iter().enumerate() {
            row *= i as f32 * linear;
        }
        self.log_event(
            "gain",
            &format!("Applied linear gain of *= {} * index", linear),
            start_time,
        );
    }

    /// Reverse the trace order, e.g. for lines measured in the negative direction
    pub fn flip(&mut self) {
        let start_time = SystemTime::now();
        self.data.invert_axis(Axis(1));
        self.data = self.data.as_standard_layout().into_owned();
        self.log_event("flip", "Reversed the trace order", start_time);
    }

    pub fn subset(
        &mut self,
        min_trace: Option<usize>,
        max_trace: Option<usize>,
        min_sample: Option<usize>,
        max_sample: Option<usize>,
    ) -> Result<()> {
        let start_time = SystemTime::now();
        let min_trace = min_trace.unwrap_or(0);
        let max_trace = max_trace.unwrap_or(self.width()).min(self.width());
        let min_sample = min_sample.unwrap_or(0);
        let max_sample = max_sample.unwrap_or(self.height()).min(self.height());

        if (min_trace >= max_trace) | (min_sample >= max_sample) {
            return Err(GprError::Step(format!(
                "Empty subset ({}:{}, {}:{}) of data with shape {:?}",
                min_sample,
                max_sample,
                min_trace,
                max_trace,
                self.data.shape()
            )));
        }
        let old_shape = self.data.shape().to_vec();

        self.data = self
            .data
            .slice(ndarray::s![min_sample..max_sample, min_trace..max_trace])
            .to_owned();
        self.metadata.start_position += min_trace as f64 * self.metadata.step;
        self.update_data_meta();

        self.log_event(
            "subset",
            &format!(
                "Subset data from {:?} to ({}:{}, {}:{})",
                old_shape, min_sample, max_sample, min_trace, max_trace
            ),
            start_time,
        );
        Ok(())
    }

    /// Keep the metadata in sync with the shape of the data
    fn update_data_meta(&mut self) {
        self.metadata.samples = self.height() as u32;
        self.metadata.traces = self.width() as u32;
        self.metadata.time_window = self.height() as f64 * self.metadata.time_interval_ns();
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

/// Two-way travel time of each sample in ns for a given sampling frequency (MHz)
pub fn sample_times(samples: usize, frequency: f64) -> Array1<f64> {
    let interval = 1000. / frequency;
    Array1::from_iter((0..samples).map(|i| tools::round_to(i as f64 * interval, 6)))
}

pub fn all_available_steps() -> Vec<[&'static str; 2]> {
    vec![
        ["clip", "Clip amplitudes to the mean plus/minus a number of standard deviations. NaN values are ignored. The number can be given, e.g. 'clip(0.25)'. Default: 1.0"],
        ["moving_average", "Smooth the data with a square moving average (box) kernel. Edges are reflected. The kernel size can be given, e.g. 'moving_average(5)'. Default: 3"],
        ["high_pass", "Enhance local contrast with a 3x3 high-pass kernel (centre 1, neighbours -0.25). The result is shifted so that its minimum is zero."],
        ["dewow", "Subtract the mean magnitude of consecutive windows for each trace. This reduces low-frequency 'wow' artefacts. The averaging window can be set, e.g. 'dewow(10)'. Default: 5"],
        ["gain", "Linearly multiply the magnitude as a function of depth. Gain is applied by: 'gain * sample_index' where sample_index is the zero-based index of the sample from the top. Example: gain(0.1). No default value."],
        ["subset", "Keep a window of the data: 'subset(min_trace max_trace min_sample max_sample)'. A value of -1 or an omitted value means 'until the end'. Example: subset(0 -1 0 500)."],
        ["flip", "Reverse the trace order of the line."],
    ]
}

/// Steps that only make sense on 2D maps (timeslices) rather than radargrams
pub fn timeslice_steps() -> Vec<[&'static str; 2]> {
    vec![
        ["clip", "See above."],
        ["moving_average", "See above."],
        ["high_pass", "See above."],
        ["clip_to_border", "Remove rows and columns of a timeslice that contain no data."],
        ["zero", "Shift the values so that the minimum equals the given value, e.g. 'zero(1.0)'. Default: 0.0"],
    ]
}

pub fn default_processing_profile() -> Vec<String> {
    vec![format!("dewow({})", DEFAULT_DEWOW_WINDOW)]
}

pub struct LineParams {
    pub filepaths: Vec<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub only_info: bool,
    pub medium_velocity: f64,
    pub steps: Vec<String>,
    pub no_export: bool,
    pub export_rd3: bool,
    pub export_ascii: bool,
}

/// Run the `line` subcommand: load, process and export each line
pub fn run(params: LineParams) -> Result<()> {
    if params.filepaths.is_empty() {
        return Err(GprError::NotFound(PathBuf::from("(no files matched)")));
    }
    let output_is_dir = params
        .output_path
        .as_ref()
        .map(|p| p.is_dir())
        .unwrap_or(false);

    if (params.filepaths.len() > 1) & params.output_path.is_some() & !output_is_dir {
        return Err(GprError::Step(
            "The output path must be a directory when processing multiple files".into(),
        ));
    }

    for filepath in &params.filepaths {
        let metadata = io::load_rad(filepath, params.medium_velocity)?;

        if params.only_info {
            println!("{}", metadata);
            continue;
        }
        tracing::info!("Processing {:?}", filepath);
        let mut line = Line::from_meta(metadata)?;

        for step in &params.steps {
            line.process(step)?;
        }

        let output_nc = output_filepath(filepath, params.output_path.as_deref(), "nc");

        if !params.no_export {
            tracing::info!("Exporting to {:?}", output_nc);
            io::export_line_netcdf(&line, &output_nc)?;
        }
        if params.export_rd3 {
            let rd3_path = output_nc.with_extension("rd3");
            io::write_rd3(&line.data, &rd3_path)?;
            io::write_rad(&line.metadata, &rd3_path.with_extension("rad"))?;
        }
        if params.export_ascii {
            io::export_ascii(&line, &output_nc.with_extension("asc"))?;
        }
    }
    Ok(())
}

/// Derive an output filepath from the input filepath and an optional output file or directory
pub fn output_filepath(input: &Path, output: Option<&Path>, extension: &str) -> PathBuf {
    match output {
        Some(p) if p.is_dir() => {
            p.join(input.file_stem().unwrap_or_default()).with_extension(extension)
        }
        Some(p) => p.with_extension(extension),
        None => input.with_extension(extension),
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use approx::assert_relative_eq;
    use ndarray::{arr2, Array2};
    use tracing_test::traced_test;

    use super::{Line, LineMeta};

    pub fn make_meta(samples: u32, traces: u32) -> LineMeta {
        LineMeta {
            samples,
            frequency: 1000.,
            step: 0.05,
            start_position: 0.,
            system_calibration: 0.,
            traces,
            time_window: samples as f64,
            antenna: None,
            header: Vec::new(),
            rd3_filepath: PathBuf::from("test.rd3"),
            medium_velocity: 0.1,
        }
    }

    fn make_line() -> Line {
        let data = Array2::from_shape_vec(
            (4, 3),
            (0..12).map(|v| v as f32).collect::<Vec<f32>>(),
        )
        .unwrap();
        Line::from_array(data, make_meta(4, 3))
    }

    #[test]
    fn test_axes() {
        let line = make_line();
        assert_eq!(line.times().to_vec(), vec![0., 1., 2., 3.]);
        for (depth, expected) in line.depths(0.1).iter().zip([0., 0.05, 0.1, 0.15]) {
            assert_relative_eq!(*depth, expected, epsilon = 1e-12);
        }
        assert_eq!(line.distances().len(), 3);
        assert!((line.distances()[2] - 0.1).abs() < 1e-12);
        assert!((line.metadata.stop_position() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_gain() {
        let mut line = make_line();
        line.process("gain(2)").unwrap();
        assert_eq!(line.data.row(0).to_vec(), vec![0., 0., 0.]);
        assert_eq!(line.data.row(1).to_vec(), vec![6., 8., 10.]);
        assert_eq!(line.log.len(), 1);
        assert!(line.log[0].starts_with("gain (duration: "));

        assert!(line.process("gain").is_err());
    }

    #[test]
    fn test_dewow() {
        let mut line = make_line();
        line.process("dewow(2)").unwrap();
        // Every window of two samples has its mean removed
        assert_eq!(line.data.column(0).to_vec(), vec![-1.5, 1.5, -1.5, 1.5]);
        assert!(line.process("dewow(0)").is_err());
    }

    #[test]
    fn test_subset_and_flip() {
        let mut line = make_line();
        line.process("subset(1 -1 1 3)").unwrap();
        assert_eq!(line.data, arr2(&[[4., 5.], [7., 8.]]));
        assert_eq!(line.metadata.samples, 2);
        assert_eq!(line.metadata.traces, 2);
        assert!((line.metadata.start_position - 0.05).abs() < 1e-12);
        assert_eq!(line.metadata.time_window, 2.);

        line.process("flip").unwrap();
        assert_eq!(line.data, arr2(&[[5., 4.], [8., 7.]]));

        assert!(line.process("subset").is_err());
        assert!(line.process("subset(5)").is_err());
    }

    #[test]
    fn test_unknown_step() {
        let mut line = make_line();
        let err = line.process("migrate").unwrap_err();
        assert!(err.to_string().contains("Step name not recognized"));
    }

    #[test]
    fn test_filter_steps() {
        let mut line = make_line();
        line.process("clip(0.5)").unwrap();
        line.process("moving_average(2)").unwrap();
        line.process("high_pass").unwrap();
        assert_eq!(line.data.shape(), &[4, 3]);
        assert_eq!(line.log.len(), 3);
        assert!(line.process("moving_average(x)").is_err());
    }

    #[test]
    #[traced_test]
    fn test_trace_count_warning() {
        // No LAST TRACE key: the count comes from the data without a warning
        let line = Line::from_array(Array2::zeros((4, 3)), make_meta(4, 0));
        assert_eq!(line.metadata.traces, 3);
        assert!(!logs_contain("header says"));

        let mut meta = make_meta(4, 7);
        meta.header.push(("LAST TRACE".into(), "7".into()));
        assert_eq!(meta.header_traces(), Some(7));
        let line = Line::from_array(Array2::zeros((4, 3)), meta);
        assert_eq!(line.metadata.traces, 3);
        assert!(logs_contain("header says 7 traces but the data have 3"));
    }

    #[test]
    fn test_run() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join("out");
        std::fs::create_dir(&out_dir).unwrap();

        let rad_path = dir.path().join("DAT_0001.rad");
        std::fs::write(
            &rad_path,
            "SAMPLES:2\r\nFREQUENCY:1000\r\nDISTANCE INTERVAL:0.1\r\nSTART POSITION:1.0\r\n",
        )
        .unwrap();
        crate::io::write_rd3(&arr2(&[[1., 2., 3.], [4., 5., 6.]]), &dir.path().join("DAT_0001.rd3"))
            .unwrap();

        let params = |steps: Vec<String>| super::LineParams {
            filepaths: vec![rad_path.clone()],
            output_path: Some(out_dir.clone()),
            only_info: false,
            medium_velocity: 0.1,
            steps,
            no_export: false,
            export_rd3: true,
            export_ascii: true,
        };
        super::run(params(vec!["gain(2)".into(), "flip".into()])).unwrap();

        let file = netcdf::open(out_dir.join("DAT_0001.nc")).unwrap();
        assert_eq!(file.dimension("x").unwrap().len(), 3);
        assert_eq!(file.dimension("y").unwrap().len(), 2);

        let data = file
            .variable("data")
            .unwrap()
            .values::<f32>(None, None)
            .unwrap()
            .into_dimensionality::<ndarray::Ix2>()
            .unwrap();
        assert_eq!(data, arr2(&[[0., 0., 0.], [12., 10., 8.]]));

        let distance = file
            .variable("distance")
            .unwrap()
            .values::<f64>(None, None)
            .unwrap();
        assert_relative_eq!(distance[[2]], 1.2, epsilon = 1e-9);

        match file.attribute("processing-log").unwrap().value().unwrap() {
            netcdf::AttrValue::Str(log) => {
                assert_eq!(log.lines().count(), 2);
                assert!(log.starts_with("gain (duration: "));
            }
            other => panic!("Unexpected processing log: {:?}", other),
        }

        // The exported rd3/rad pair is a readable line
        let exported = Line::from_meta(crate::io::load_rad(&out_dir.join("DAT_0001.rad"), 0.1).unwrap())
            .unwrap();
        assert_eq!(exported.data, data);
        assert_eq!(exported.metadata.start_position, 1.);
        assert!(out_dir.join("DAT_0001.asc").is_file());

        // An unknown step stops the run
        assert!(super::run(params(vec!["migrate".into()])).is_err());
    }

    #[test]
    fn test_output_filepath() {
        let dir = tempfile::tempdir().unwrap();
        let input = Path::new("/data/DAT_0001.rad");

        assert_eq!(
            super::output_filepath(input, None, "nc"),
            PathBuf::from("/data/DAT_0001.nc")
        );
        assert_eq!(
            super::output_filepath(input, Some(dir.path()), "nc"),
            dir.path().join("DAT_0001.nc")
        );
        assert_eq!(
            super::output_filepath(input, Some(Path::new("out/x.nc")), "rd3"),
            PathBuf::from("out/x.rd3")
        );
    }
}
