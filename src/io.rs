/// Reading and writing of Malå (.rad/.rd3), ASCII and NetCDF files
use std::io::Write;
use std::path::{Path, PathBuf};

use ndarray::Array2;

use crate::error::{GprError, Result};
use crate::geometry::GridOrigin;
use crate::grid::ParallelGrid;
use crate::line::{Line, LineMeta};
use crate::timeslice::Timeslice;

/// Parse the `KEY:value` lines of a .rad header, keeping the file order
pub fn parse_rad_header(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .filter_map(|s| s.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn header_get<'a>(header: &'a [(String, String)], key: &str) -> Option<&'a str> {
    header
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn parse_value<T: std::str::FromStr>(value: &str, key: &str, filepath: &Path) -> Result<T> {
    value.parse::<T>().map_err(|_| GprError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        path: filepath.to_path_buf(),
    })
}

fn required<T: std::str::FromStr>(
    header: &[(String, String)],
    key: &str,
    filepath: &Path,
) -> Result<T> {
    match header_get(header, key) {
        Some(v) => parse_value(v, key, filepath),
        None => Err(GprError::MissingKey {
            key: key.to_string(),
            path: filepath.to_path_buf(),
        }),
    }
}

fn optional<T: std::str::FromStr>(
    header: &[(String, String)],
    key: &str,
    filepath: &Path,
) -> Result<Option<T>> {
    match header_get(header, key) {
        Some("") | None => Ok(None),
        Some(v) => parse_value(v, key, filepath).map(Some),
    }
}

/// Find a file with the same stem and the given extension, ignoring the case of the extension
pub fn find_companion(filepath: &Path, extension: &str) -> Option<PathBuf> {
    let direct = filepath.with_extension(extension);
    if direct.is_file() {
        return Some(direct);
    }
    let stem = filepath.file_stem()?;
    let parent = match filepath.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    std::fs::read_dir(parent)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .find(|path| {
            path.is_file()
                && path.file_stem() == Some(stem)
                && path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.eq_ignore_ascii_case(extension))
                    .unwrap_or(false)
        })
}

/// Load the metadata of a .rad header file
///
/// # Arguments
/// - `filepath`: The path to the .rad file
/// - `medium_velocity`: The velocity of the medium in m/ns
pub fn load_rad(filepath: &Path, medium_velocity: f64) -> Result<LineMeta> {
    let content = std::fs::read_to_string(filepath).map_err(|e| GprError::io(filepath, e))?;
    let header = parse_rad_header(&content);

    let rd3_filepath =
        find_companion(filepath, "rd3").ok_or_else(|| GprError::NotFound(filepath.with_extension("rd3")))?;

    let samples: u32 = required(&header, "SAMPLES", filepath)?;
    let frequency: f64 = required(&header, "FREQUENCY", filepath)?;

    if samples == 0 {
        return Err(GprError::InvalidValue {
            key: "SAMPLES".into(),
            value: "0".into(),
            path: filepath.to_path_buf(),
        });
    }
    if frequency <= 0. {
        return Err(GprError::InvalidValue {
            key: "FREQUENCY".into(),
            value: frequency.to_string(),
            path: filepath.to_path_buf(),
        });
    }

    Ok(LineMeta {
        samples,
        frequency,
        step: required(&header, "DISTANCE INTERVAL", filepath)?,
        start_position: optional(&header, "START POSITION", filepath)?.unwrap_or(0.),
        system_calibration: optional(&header, "SYSTEM CALIBRATION", filepath)?.unwrap_or(0.),
        traces: optional(&header, "LAST TRACE", filepath)?.unwrap_or(0),
        time_window: optional(&header, "TIMEWINDOW", filepath)?
            .unwrap_or(samples as f64 * 1000. / frequency),
        antenna: header_get(&header, "ANTENNAS")
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string()),
        header,
        rd3_filepath,
        medium_velocity,
    })
}

/// Load a .rd3 file of little-endian i16 samples, one trace after the other
///
/// # Returns
/// An array of the shape (samples, traces).
pub fn load_rd3(filepath: &Path, height: u32) -> Result<Array2<f32>> {
    if height == 0 {
        return Err(GprError::Shape(format!(
            "{:?}: the sample count must be larger than zero",
            filepath
        )));
    }
    let bytes = std::fs::read(filepath).map_err(|e| GprError::io(filepath, e))?;

    let trace_bytes = 2 * height as usize;
    let width = bytes.len() / trace_bytes;

    if width == 0 {
        return Err(GprError::Shape(format!(
            "{:?} holds {} bytes; less than one trace of {} samples",
            filepath,
            bytes.len(),
            height
        )));
    }
    if bytes.len() % trace_bytes != 0 {
        tracing::warn!(
            "{:?}: dropping a trailing partial trace of {} bytes",
            filepath,
            bytes.len() % trace_bytes
        );
    }

    let data: Vec<f32> = bytes[..width * trace_bytes]
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32)
        .collect();

    Ok(Array2::from_shape_vec((width, height as usize), data)
        .map_err(|e| GprError::Shape(e.to_string()))?
        .reversed_axes()
        .as_standard_layout()
        .into_owned())
}

/// Write an array of shape (samples, traces) as a .rd3 file
///
/// Values are rounded and saturated to the i16 range.
pub fn write_rd3(data: &Array2<f32>, filepath: &Path) -> Result<()> {
    let mut bytes = Vec::<u8>::with_capacity(data.len() * 2);

    for trace in data.columns() {
        for value in trace.iter() {
            // `as` saturates and maps NaN to 0
            let short = value.round() as i16;
            bytes.extend_from_slice(&short.to_le_bytes());
        }
    }
    std::fs::write(filepath, bytes).map_err(|e| GprError::io(filepath, e))
}

/// Format a Malå header with CRLF line endings
pub fn format_rad(metadata: &LineMeta) -> String {
    let passthrough = |key: &str| metadata.header_value(key).unwrap_or("").to_string();

    let rows: Vec<(&str, String)> = vec![
        ("SAMPLES", metadata.samples.to_string()),
        ("FREQUENCY", metadata.frequency.to_string()),
        ("FREQUENCY STEPS", " 1".into()),
        ("SIGNAL POSITION", " 0".into()),
        ("RAW SIGNAL POSITION", " 0".into()),
        ("DISTANCE FLAG", " 1".into()),
        ("TIME FLAG", " 0".into()),
        ("PROGRAM FLAG", " 0".into()),
        ("EXTERNAL FLAG", " 0".into()),
        ("TIME INTERVAL", " 0".into()),
        ("DISTANCE INTERVAL", format!(" {}", metadata.step)),
        ("OPERATOR", passthrough("OPERATOR")),
        ("CUSTOMER", passthrough("CUSTOMER")),
        ("SITE", passthrough("SITE")),
        ("ANTENNAS", metadata.antenna.clone().unwrap_or_default()),
        ("ANTENNA ORIENTATION", passthrough("ANTENNA ORIENTATION")),
        ("ANTENNA SEPARATION", passthrough("ANTENNA SEPARATION")),
        ("COMMENT", passthrough("COMMENT")),
        ("TIMEWINDOW", format!("{:.4}", metadata.time_window)),
        ("STACKS", " 1".into()),
        ("STACK EXPONENT", " 1".into()),
        ("STACKING TIME", " 0".into()),
        ("LAST TRACE", metadata.traces.to_string()),
        ("STOP POSITION", format!(" {:.6}", metadata.stop_position())),
        ("SYSTEM CALIBRATION", format!("{:.10}", metadata.system_calibration)),
        ("START POSITION", format!("{:.6}", metadata.start_position)),
    ];

    rows.iter()
        .map(|(key, value)| format!("{}:{}\r\n", key, value))
        .collect()
}

pub fn write_rad(metadata: &LineMeta, filepath: &Path) -> Result<()> {
    std::fs::write(filepath, format_rad(metadata)).map_err(|e| GprError::io(filepath, e))
}

/// Export a line as three-column (distance, time, amplitude) ASCII
///
/// The traces are written one after another.
pub fn export_ascii(line: &Line, filepath: &Path) -> Result<()> {
    let file = std::fs::File::create(filepath).map_err(|e| GprError::io(filepath, e))?;
    let mut writer = std::io::BufWriter::new(file);

    let times = line.times();
    for (distance, trace) in line.distances().iter().zip(line.data.columns()) {
        let distance = crate::tools::round_to(*distance, 6);
        for (time, amplitude) in times.iter().zip(trace.iter()) {
            write!(writer, "{:>14.6}{:>15.6}{:>15.6}\r\n", distance, time, amplitude)
                .map_err(|e| GprError::io(filepath, e))?;
        }
    }
    writer.flush().map_err(|e| GprError::io(filepath, e))
}

fn program_version() -> String {
    format!(
        "{} version {}, © {}",
        crate::PROGRAM_NAME,
        crate::PROGRAM_VERSION,
        crate::PROGRAM_AUTHORS
    )
}

/// Export a processed line to NetCDF
pub fn export_line_netcdf(line: &Line, nc_filepath: &Path) -> Result<()> {
    if nc_filepath.is_file() {
        std::fs::remove_file(nc_filepath).map_err(|e| GprError::io(nc_filepath, e))?;
    };
    let mut file = netcdf::create(nc_filepath)?;

    file.add_dimension("x", line.width())?;
    file.add_dimension("y", line.height())?;

    file.add_attribute("processing-datetime", chrono::Local::now().to_rfc3339())?;
    file.add_attribute(
        "antenna",
        line.metadata.antenna.clone().unwrap_or_else(|| "Unknown".into()),
    )?;
    file.add_attribute("vertical-sampling-frequency", line.metadata.frequency)?;
    file.add_attribute("vertical-sampling-frequency-unit", "MHz")?;
    file.add_attribute("system-calibration", line.metadata.system_calibration)?;
    file.add_attribute("processing-log", line.log.join("\n"))?;
    file.add_attribute(
        "original-filename",
        line.metadata
            .rd3_filepath
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_string(),
    )?;
    file.add_attribute("medium-velocity", line.metadata.medium_velocity)?;
    file.add_attribute("medium-velocity-unit", "m / ns")?;
    file.add_attribute("program-version", program_version())?;

    let mut data = file.add_variable::<f32>("data", &["y", "x"])?;
    data.put_values(
        &line.data.iter().copied().collect::<Vec<f32>>(),
        Some(&[0, 0]),
        None,
    )?;
    data.add_attribute("coordinates", "distance return-time")?;

    let mut distance = file.add_variable::<f64>("distance", &["x"])?;
    distance.put_values(&line.distances().to_vec(), Some(&[0]), None)?;
    distance.add_attribute("unit", "m")?;

    let times = line.times();
    let mut return_time = file.add_variable::<f64>("return-time", &["y"])?;
    return_time.put_values(&times.to_vec(), Some(&[0]), None)?;
    return_time.add_attribute("unit", "ns")?;

    let mut depth = file.add_variable::<f64>("depth", &["y"])?;
    depth.put_values(
        &line.depths(line.metadata.medium_velocity).to_vec(),
        Some(&[0]),
        None,
    )?;
    depth.add_attribute("unit", "m")?;

    Ok(())
}

/// Export an assembled grid, its volume and its timeslices to NetCDF
pub fn export_grid_netcdf(
    grid: &ParallelGrid,
    slices: &[Timeslice],
    medium_velocity: f64,
    origin: Option<&GridOrigin>,
    nc_filepath: &Path,
) -> Result<()> {
    if nc_filepath.is_file() {
        std::fs::remove_file(nc_filepath).map_err(|e| GprError::io(nc_filepath, e))?;
    };
    let mut file = netcdf::create(nc_filepath)?;

    file.add_dimension("line", grid.lines.len())?;
    file.add_dimension("sample", grid.samples)?;
    file.add_dimension("trace", grid.traces)?;

    file.add_attribute("processing-datetime", chrono::Local::now().to_rfc3339())?;
    file.add_attribute("axis", grid.axis.to_string())?;
    file.add_attribute("distance-datum", grid.datum)?;
    file.add_attribute("trace-step", grid.step)?;
    file.add_attribute("line-spacing", grid.line_spacing)?;
    file.add_attribute("vertical-sampling-frequency", grid.frequency)?;
    file.add_attribute("vertical-sampling-frequency-unit", "MHz")?;
    file.add_attribute("system-calibration", grid.system_calibration)?;
    file.add_attribute("medium-velocity", medium_velocity)?;
    file.add_attribute("medium-velocity-unit", "m / ns")?;
    file.add_attribute("processing-log", grid.log.join("\n"))?;
    file.add_attribute("program-version", program_version())?;

    let mut data = file.add_variable::<f32>("data", &["line", "sample", "trace"])?;
    data.put_values(
        &grid.stack()?.iter().copied().collect::<Vec<f32>>(),
        Some(&[0, 0, 0]),
        None,
    )?;
    data.add_attribute("coordinates", "transect time distance")?;

    let mut transect = file.add_variable::<f64>("transect", &["line"])?;
    transect.put_values(&grid.transects, Some(&[0]), None)?;
    transect.add_attribute("unit", "m")?;

    let mut distance = file.add_variable::<f64>("distance", &["trace"])?;
    distance.put_values(&grid.distances().to_vec(), Some(&[0]), None)?;
    distance.add_attribute("unit", "m")?;

    let mut time = file.add_variable::<f64>("time", &["sample"])?;
    time.put_values(&grid.times().to_vec(), Some(&[0]), None)?;
    time.add_attribute("unit", "ns")?;

    let mut depth = file.add_variable::<f64>("depth", &["sample"])?;
    depth.put_values(&grid.depths(medium_velocity).to_vec(), Some(&[0]), None)?;
    depth.add_attribute("unit", "m")?;

    // A zero-length dimension would be unlimited
    if !slices.is_empty() {
        file.add_dimension("slice", slices.len())?;
        let mut timeslices = file.add_variable::<f32>("timeslices", &["slice", "line", "trace"])?;
        let values = slices
            .iter()
            .flat_map(|s| s.full_extent(grid.lines.len(), grid.traces).into_iter())
            .collect::<Vec<f32>>();
        timeslices.put_values(&values, Some(&[0, 0, 0]), None)?;
        timeslices.add_attribute("processing-log", slices[0].log.join("\n"))?;

        let mut top = file.add_variable::<f64>("slice_top", &["slice"])?;
        top.put_values(
            &slices.iter().map(|s| s.top_m).collect::<Vec<f64>>(),
            Some(&[0]),
            None,
        )?;
        top.add_attribute("unit", "m")?;

        let mut bottom = file.add_variable::<f64>("slice_bottom", &["slice"])?;
        bottom.put_values(
            &slices.iter().map(|s| s.bottom_m).collect::<Vec<f64>>(),
            Some(&[0]),
            None,
        )?;
        bottom.add_attribute("unit", "m")?;
    }

    if let Some(origin) = origin {
        let (eastings, northings) = grid.world_coordinates(origin);

        let mut easting = file.add_variable::<f64>("easting", &["line", "trace"])?;
        easting.put_values(&eastings.iter().copied().collect::<Vec<f64>>(), Some(&[0, 0]), None)?;
        easting.add_attribute("unit", "m")?;

        let mut northing = file.add_variable::<f64>("northing", &["line", "trace"])?;
        northing.put_values(&northings.iter().copied().collect::<Vec<f64>>(), Some(&[0, 0]), None)?;
        northing.add_attribute("unit", "m")?;
        file.add_attribute("grid-bearing", origin.bearing_deg)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use ndarray::arr2;

    const RAD_TEXT: &str = "SAMPLES:4\r\nFREQUENCY: 1000.000000\r\nFREQUENCY STEPS: 1\r\nDISTANCE INTERVAL: 0.050000\r\nOPERATOR:\r\nANTENNAS:500 MHz shielded\r\nLAST TRACE:7\r\nSTART POSITION:2.500000\r\n";

    fn write_line_files(dir: &std::path::Path, rd3_name: &str) -> PathBuf {
        let rad_path = dir.join("DAT_0001.rad");
        std::fs::write(&rad_path, RAD_TEXT).unwrap();

        let data = arr2(&[[1_f32, -2., 3.], [4., 5., -6.], [7., 8., 9.], [0., 1., 2.]]);
        super::write_rd3(&data, &dir.join(rd3_name)).unwrap();
        rad_path
    }

    #[test]
    fn test_parse_rad_header() {
        let header = super::parse_rad_header(RAD_TEXT);
        assert_eq!(header[0], ("SAMPLES".to_string(), "4".to_string()));
        assert_eq!(header[4], ("OPERATOR".to_string(), "".to_string()));
        assert_eq!(header.len(), 8);
    }

    #[test]
    fn test_load_rad() {
        let dir = tempfile::tempdir().unwrap();
        // The companion file is found even when its extension is upper case
        let rad_path = write_line_files(dir.path(), "DAT_0001.RD3");

        let meta = super::load_rad(&rad_path, 0.1).unwrap();
        assert_eq!(meta.samples, 4);
        assert_eq!(meta.frequency, 1000.);
        assert_eq!(meta.step, 0.05);
        assert_eq!(meta.start_position, 2.5);
        assert_eq!(meta.system_calibration, 0.);
        assert_eq!(meta.traces, 7);
        assert_eq!(meta.time_window, 4.);
        assert_eq!(meta.antenna.as_deref(), Some("500 MHz shielded"));
        assert_eq!(
            meta.rd3_filepath.file_name().unwrap().to_str().unwrap().to_lowercase(),
            "dat_0001.rd3"
        );
    }

    #[test]
    fn test_load_rad_errors() {
        let dir = tempfile::tempdir().unwrap();
        let rad_path = dir.path().join("missing.rad");
        std::fs::write(&rad_path, RAD_TEXT).unwrap();
        assert!(matches!(
            super::load_rad(&rad_path, 0.1),
            Err(crate::error::GprError::NotFound(_))
        ));

        std::fs::write(dir.path().join("missing.rd3"), [0_u8; 8]).unwrap();
        std::fs::write(&rad_path, "FREQUENCY:1000\r\nDISTANCE INTERVAL:0.05\r\n").unwrap();
        let err = super::load_rad(&rad_path, 0.1).unwrap_err();
        assert!(err.to_string().contains("SAMPLES"));

        std::fs::write(&rad_path, "SAMPLES:x\r\nFREQUENCY:1000\r\nDISTANCE INTERVAL:0.05\r\n").unwrap();
        assert!(matches!(
            super::load_rad(&rad_path, 0.1),
            Err(crate::error::GprError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_rd3_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("line.rd3");

        let data = arr2(&[[1.4_f32, -2.6], [40000., f32::NAN]]);
        super::write_rd3(&data, &path).unwrap();

        // Traces are consecutive in the file
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), i16::MAX);

        let loaded = super::load_rd3(&path, 2).unwrap();
        assert_eq!(loaded, arr2(&[[1., -3.], [32767., 0.]]));
    }

    #[test]
    fn test_load_rd3_partial_trace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("line.rd3");
        std::fs::write(&path, [1_u8, 0, 2, 0, 3, 0, 4, 0, 5, 0]).unwrap();

        let loaded = super::load_rd3(&path, 2).unwrap();
        assert_eq!(loaded, arr2(&[[1., 3.], [2., 4.]]));

        assert!(super::load_rd3(&path, 0).is_err());
        assert!(super::load_rd3(&path, 6).is_err());
    }

    #[test]
    fn test_line_from_meta() {
        let dir = tempfile::tempdir().unwrap();
        let rad_path = write_line_files(dir.path(), "DAT_0001.rd3");

        let meta = super::load_rad(&rad_path, 0.1).unwrap();
        let line = crate::line::Line::from_meta(meta).unwrap();

        // The header says 7 traces but the data hold 3
        assert_eq!(line.metadata.traces, 3);
        assert_eq!(line.data.column(1).to_vec(), vec![-2., 5., 8., 1.]);
    }

    #[test]
    fn test_format_rad() {
        let dir = tempfile::tempdir().unwrap();
        let rad_path = write_line_files(dir.path(), "DAT_0001.rd3");
        let mut meta = super::load_rad(&rad_path, 0.1).unwrap();
        meta.traces = 3;

        let text = super::format_rad(&meta);
        assert!(text.starts_with("SAMPLES:4\r\nFREQUENCY:1000\r\nFREQUENCY STEPS: 1\r\n"));
        assert!(text.contains("DISTANCE INTERVAL: 0.05\r\n"));
        assert!(text.contains("LAST TRACE:3\r\n"));
        assert!(text.contains("STOP POSITION: 2.600000\r\n"));
        assert!(text.contains("SYSTEM CALIBRATION:0.0000000000\r\n"));
        assert!(text.ends_with("START POSITION:2.500000\r\n"));

        // A written header can be read back
        let out = dir.path().join("copy.rad");
        super::write_rad(&meta, &out).unwrap();
        std::fs::copy(&meta.rd3_filepath, out.with_extension("rd3")).unwrap();
        let reread = super::load_rad(&out, 0.1).unwrap();
        assert_eq!(reread.samples, meta.samples);
        assert_eq!(reread.step, meta.step);
        assert_eq!(reread.start_position, meta.start_position);
    }

    #[test]
    fn test_export_ascii() {
        let dir = tempfile::tempdir().unwrap();
        let rad_path = write_line_files(dir.path(), "DAT_0001.rd3");
        let line = crate::line::Line::from_meta(super::load_rad(&rad_path, 0.1).unwrap()).unwrap();

        let path = dir.path().join("line.asc");
        super::export_ascii(&line, &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let rows = text.split("\r\n").filter(|r| !r.is_empty()).collect::<Vec<&str>>();

        assert_eq!(rows.len(), 12);
        assert_eq!(rows[0], "      2.500000       0.000000       1.000000");
        assert_eq!(rows[5], "      2.550000       1.000000       5.000000");
    }
}
