/// Survey geometry: where each line segment was measured
use std::path::{Path, PathBuf};

use crate::error::{GprError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Axis::X => write!(f, "x"),
            Axis::Y => write!(f, "y"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Positive,
    Negative,
}

/// The end coordinate of a segment: either a value or only the direction of travel
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EndCoord {
    Value(f64),
    Sign(Direction),
}

impl std::str::FromStr for EndCoord {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "+" => Ok(EndCoord::Sign(Direction::Positive)),
            "-" => Ok(EndCoord::Sign(Direction::Negative)),
            other => other
                .parse::<f64>()
                .map(EndCoord::Value)
                .map_err(|_| format!("Expected a number, '+' or '-': {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRecord {
    pub id: String,
    pub folder: Option<String>,
    pub filename: String,
    pub x0: f64,
    pub y0: f64,
    pub x1: EndCoord,
    pub y1: EndCoord,
    pub note: Option<String>,
}

impl SegmentRecord {
    /// The axis along which the segment was measured
    pub fn axis(&self) -> Result<Axis> {
        let same = |a: f64, b: EndCoord| matches!(b, EndCoord::Value(v) if (v - a).abs() < 1e-9);

        match (self.x1, self.y1) {
            (EndCoord::Value(_), EndCoord::Sign(_)) => Ok(Axis::Y),
            (EndCoord::Sign(_), EndCoord::Value(_)) => Ok(Axis::X),
            _ if same(self.x0, self.x1) && !same(self.y0, self.y1) => Ok(Axis::Y),
            _ if same(self.y0, self.y1) && !same(self.x0, self.x1) => Ok(Axis::X),
            _ => Err(GprError::Geometry(format!(
                "Segment {} ({}) is not parallel to the x or y axis: ({}, {}) -> ({:?}, {:?})",
                self.id, self.filename, self.x0, self.y0, self.x1, self.y1
            ))),
        }
    }

    pub fn direction(&self) -> Result<Direction> {
        let (start, end) = match self.axis()? {
            Axis::X => (self.x0, self.x1),
            Axis::Y => (self.y0, self.y1),
        };
        Ok(match end {
            EndCoord::Sign(direction) => direction,
            EndCoord::Value(v) if v < start => Direction::Negative,
            EndCoord::Value(_) => Direction::Positive,
        })
    }

    /// The fixed coordinate across the lines (y for lines along x, and vice versa)
    pub fn transect(&self) -> Result<f64> {
        Ok(match self.axis()? {
            Axis::X => self.y0,
            Axis::Y => self.x0,
        })
    }

    /// The start coordinate along the axis of the segment
    pub fn along_start(&self) -> Result<f64> {
        Ok(match self.axis()? {
            Axis::X => self.x0,
            Axis::Y => self.y0,
        })
    }

    /// The .rad file of the segment
    pub fn rad_path(&self, data_dir: &Path) -> PathBuf {
        let mut path = data_dir.to_path_buf();
        if let Some(folder) = &self.folder {
            path.push(folder);
        }
        path.push(&self.filename);

        let has_rad = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("rad"))
            .unwrap_or(false);
        if has_rad {
            path
        } else {
            // Not with_extension(): filenames may contain dots
            PathBuf::from(format!("{}.rad", path.to_string_lossy()))
        }
    }
}

/// Split a CSV row, stripping whitespace and surrounding quotes
fn split_row(row: &str) -> Vec<String> {
    row.split(',')
        .map(|s| s.trim().trim_matches('"').trim().to_string())
        .collect()
}

struct CsvTable {
    columns: Vec<String>,
    rows: Vec<(usize, Vec<String>)>,
}

impl CsvTable {
    fn read(filepath: &Path) -> Result<CsvTable> {
        let content = std::fs::read_to_string(filepath).map_err(|e| GprError::io(filepath, e))?;
        let mut lines = content
            .lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty());

        let columns = match lines.next() {
            Some((_, header)) => split_row(header)
                .into_iter()
                .map(|c| c.to_lowercase())
                .collect(),
            None => {
                return Err(GprError::Csv {
                    path: filepath.to_path_buf(),
                    line: 1,
                    message: "The file is empty".into(),
                })
            }
        };
        let rows = lines.map(|(i, l)| (i + 1, split_row(l))).collect();

        Ok(CsvTable { columns, rows })
    }

    fn index(&self, column: &str, filepath: &Path) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| GprError::Csv {
                path: filepath.to_path_buf(),
                line: 1,
                message: format!("Missing column '{}'", column),
            })
    }
}

fn field<T: std::str::FromStr>(
    row: &(usize, Vec<String>),
    index: usize,
    column: &str,
    filepath: &Path,
) -> Result<T> {
    let csv_error = |message: String| GprError::Csv {
        path: filepath.to_path_buf(),
        line: row.0,
        message,
    };
    let value = row
        .1
        .get(index)
        .ok_or_else(|| csv_error(format!("Missing value for '{}'", column)))?;

    value
        .parse::<T>()
        .map_err(|_| csv_error(format!("Invalid value for '{}': {}", column, value)))
}

fn optional_field(row: &(usize, Vec<String>), index: Option<usize>) -> Option<String> {
    index
        .and_then(|i| row.1.get(i))
        .filter(|s| !s.is_empty())
        .cloned()
}

/// Read a geometry CSV with one row per line segment
///
/// Columns are matched by name (case-insensitive): id, folder, filename, x0, y0, x1, y1, note.
/// The folder and note columns are optional.
pub fn read_geometry(filepath: &Path) -> Result<Vec<SegmentRecord>> {
    let table = CsvTable::read(filepath)?;

    let id = table.index("id", filepath)?;
    let filename = table.index("filename", filepath)?;
    let x0 = table.index("x0", filepath)?;
    let y0 = table.index("y0", filepath)?;
    let x1 = table.index("x1", filepath)?;
    let y1 = table.index("y1", filepath)?;
    let folder = table.index("folder", filepath).ok();
    let note = table.index("note", filepath).ok();

    let mut records = Vec::<SegmentRecord>::new();
    for row in &table.rows {
        let record = SegmentRecord {
            id: field(row, id, "id", filepath)?,
            folder: optional_field(row, folder),
            filename: field(row, filename, "filename", filepath)?,
            x0: field(row, x0, "x0", filepath)?,
            y0: field(row, y0, "y0", filepath)?,
            x1: field(row, x1, "x1", filepath)?,
            y1: field(row, y1, "y1", filepath)?,
            note: optional_field(row, note),
        };
        if record.filename.is_empty() {
            return Err(GprError::Csv {
                path: filepath.to_path_buf(),
                line: row.0,
                message: "Empty filename".into(),
            });
        }
        records.push(record);
    }
    Ok(records)
}

/// The world position and orientation of the local survey grid
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridOrigin {
    pub easting: f64,
    pub northing: f64,
    /// Direction of the local x axis in degrees clockwise from north
    pub bearing_deg: f64,
}

impl GridOrigin {
    /// Convert local grid coordinates to world coordinates
    ///
    /// The local y axis points 90 degrees counter-clockwise of the x axis.
    pub fn to_world(&self, local_x: f64, local_y: f64) -> (f64, f64) {
        let (sin, cos) = self.bearing_deg.to_radians().sin_cos();

        (
            self.easting + local_x * sin - local_y * cos,
            self.northing + local_x * cos + local_y * sin,
        )
    }

    /// Read the origin from a CSV with the columns easting0, northing0 and bearing (first row)
    pub fn from_csv(filepath: &Path) -> Result<GridOrigin> {
        let table = CsvTable::read(filepath)?;
        let row = table.rows.first().ok_or_else(|| GprError::Csv {
            path: filepath.to_path_buf(),
            line: 2,
            message: "No grid origin row".into(),
        })?;

        Ok(GridOrigin {
            easting: field(row, table.index("easting0", filepath)?, "easting0", filepath)?,
            northing: field(row, table.index("northing0", filepath)?, "northing0", filepath)?,
            bearing_deg: field(row, table.index("bearing", filepath)?, "bearing", filepath)?,
        })
    }
}

impl std::str::FromStr for GridOrigin {
    type Err = String;

    /// Parse "easting,northing,bearing"
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let values = s
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<std::result::Result<Vec<f64>, _>>()
            .map_err(|e| format!("Could not parse grid origin '{}': {}", s, e))?;

        match values[..] {
            [easting, northing, bearing_deg] => Ok(GridOrigin {
                easting,
                northing,
                bearing_deg,
            }),
            _ => Err(format!(
                "Expected 'easting,northing,bearing' for the grid origin, got '{}'",
                s
            )),
        }
    }
}
