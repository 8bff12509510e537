/// Functions to handle the command line interface (CLI)
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::geometry::GridOrigin;
use crate::{grid, line, psa, tools};

#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    command: Command,

    /// Show debug messages
    #[clap(short, long, global = true)]
    verbose: bool,

    /// Only show warnings and errors
    #[clap(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the metadata of Malå .rad files
    Info {
        /// Filepath of a .rad file or a glob pattern of many files
        filepath: String,

        /// Velocity of the medium in m/ns
        #[clap(long, default_value = "0.1")]
        velocity: f64,
    },
    /// Process one or more lines
    Line(LineArgs),
    /// Assemble parallel line segments into a grid and cut timeslices
    Grid(GridArgs),
    /// Folk & Ward statistics of particle-size distributions
    Psa(PsaArgs),
    /// Show the available processing steps
    Steps {
        /// Only show the default profile
        #[clap(long)]
        show_default: bool,
    },
}

#[derive(Debug, clap::Args)]
#[clap(group(
        clap::ArgGroup::new("step_choice")
        .required(false)
        .args(&["steps", "default"]),
    ))
]
struct LineArgs {
    /// Filepath of a .rad file or a glob pattern of many files
    filepath: String,

    /// Velocity of the medium in m/ns
    #[clap(long, default_value = "0.1")]
    velocity: f64,

    /// Process with the default profile. See "steps --show-default" to list the profile.
    #[clap(long)]
    default: bool,

    /// Processing steps to run, separated by commas. Can be a filepath to a newline separated step file.
    #[clap(long)]
    steps: Option<String>,

    /// Output filename or directory. Defaults to the input filename with a ".nc" extension
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// Don't export a nc file
    #[clap(long)]
    no_export: bool,

    /// Also export the processed line as .rd3/.rad
    #[clap(long)]
    rd3: bool,

    /// Also export the processed line as three-column ASCII
    #[clap(long)]
    ascii: bool,
}

#[derive(Debug, clap::Args)]
struct GridArgs {
    /// CSV with one row per segment (id, folder, filename, x0, y0, x1, y1, note)
    geometry: PathBuf,

    /// Directory that the folder and filename columns are relative to. Defaults to the directory
    /// of the geometry file
    #[clap(short, long)]
    data_dir: Option<PathBuf>,

    /// Output nc filename. Defaults to the geometry filename with a ".nc" extension
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// Velocity of the medium in m/ns
    #[clap(long, default_value = "0.1")]
    velocity: f64,

    /// Along-line coordinate of the first trace. Defaults to the lowest segment start
    #[clap(long, allow_hyphen_values = true)]
    datum: Option<f64>,

    /// Along-line length of the grid. Defaults to the furthest segment end
    #[clap(long)]
    length: Option<f64>,

    /// Processing steps to run on every assembled line, separated by commas (or a step file)
    #[clap(long)]
    steps: Option<String>,

    /// Thickness of timeslices in m. No timeslices are made if not given
    #[clap(long)]
    slice_thickness: Option<f64>,

    /// Processing steps to run on every timeslice, separated by commas (or a step file)
    #[clap(long)]
    slice_steps: Option<String>,

    /// World position of the grid as "easting,northing,bearing" or a CSV with the columns
    /// easting0, northing0 and bearing
    #[clap(long, allow_hyphen_values = true)]
    origin: Option<String>,

    /// Write each assembled line as .rd3/.rad to this directory
    #[clap(long)]
    export_lines: Option<PathBuf>,

    /// Write the start and end coordinates of each line to this CSV
    #[clap(long)]
    line_csv: Option<PathBuf>,

    /// Write each timeslice as an XYZ file to this directory
    #[clap(long)]
    slice_xyz: Option<PathBuf>,

    /// Don't export a nc file
    #[clap(long)]
    no_export: bool,
}

#[derive(Debug, clap::Args)]
struct PsaArgs {
    /// Filepath of a distribution CSV (columns mm and frequency) or a glob pattern of many files
    filepath: String,

    /// Output CSV. Defaults to stdout
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// Add a row with the average distribution
    #[clap(long)]
    average: bool,

    /// Report percentiles in mm instead of phi
    #[clap(long)]
    mm: bool,

    /// Read Malvern Mastersizer 2000 exports, averaging replicates per sample and day
    #[clap(long)]
    mastersizer: bool,
}

enum ParsedArgs {
    Line(Box<line::LineParams>),
    Grid(Box<grid::GridParams>),
    Psa(psa::PsaParams),
    Error(String),
    Done,
}

fn glob_filepaths(pattern: &str) -> Result<Vec<PathBuf>, String> {
    let paths = glob::glob(pattern)
        .map_err(|e| format!("Invalid glob pattern {}: {}", pattern, e))?
        .collect::<Result<Vec<PathBuf>, glob::GlobError>>()
        .map_err(|e| e.to_string())?;

    match paths.is_empty() {
        true => Err(format!("No files found matching: {}", pattern)),
        false => Ok(paths),
    }
}

/// Parse a step list and check that each step is known
fn parse_steps(steps: &Option<String>, allowed: &[[&str; 2]]) -> Result<Vec<String>, String> {
    let steps = match steps {
        Some(s) => tools::parse_step_list(s)?,
        None => return Ok(Vec::new()),
    };
    for step in &steps {
        if !allowed.iter().any(|s| s[0] == tools::step_name(step)) {
            return Err(format!("Unrecognized step: {}", step));
        }
    }
    Ok(steps)
}

impl Args {
    fn parse_command(&self) -> ParsedArgs {
        match self.parse_inner() {
            Ok(parsed) => parsed,
            Err(message) => ParsedArgs::Error(message),
        }
    }

    fn parse_inner(&self) -> Result<ParsedArgs, String> {
        match &self.command {
            Command::Steps { show_default } => {
                if *show_default {
                    for step in line::default_processing_profile() {
                        println!("{}", step);
                    }
                    return Ok(ParsedArgs::Done);
                }
                println!("Line steps\n==========\n");
                for step in line::all_available_steps() {
                    println!("{}\n{}\n{}\n", step[0], "-".repeat(step[0].len()), step[1]);
                }
                println!("Timeslice steps\n===============\n");
                for step in line::timeslice_steps() {
                    println!("{}\n{}\n{}\n", step[0], "-".repeat(step[0].len()), step[1]);
                }
                Ok(ParsedArgs::Done)
            }
            Command::Info { filepath, velocity } => {
                Ok(ParsedArgs::Line(Box::new(line::LineParams {
                    filepaths: glob_filepaths(filepath)?,
                    output_path: None,
                    only_info: true,
                    medium_velocity: *velocity,
                    steps: Vec::new(),
                    no_export: true,
                    export_rd3: false,
                    export_ascii: false,
                })))
            }
            Command::Line(args) => {
                let steps = match args.default {
                    true => line::default_processing_profile(),
                    false => parse_steps(&args.steps, &line::all_available_steps())?,
                };
                if steps.is_empty() {
                    tracing::info!("No processing steps specified. Saving raw data.");
                }
                Ok(ParsedArgs::Line(Box::new(line::LineParams {
                    filepaths: glob_filepaths(&args.filepath)?,
                    output_path: args.output.clone(),
                    only_info: false,
                    medium_velocity: args.velocity,
                    steps,
                    no_export: args.no_export,
                    export_rd3: args.rd3,
                    export_ascii: args.ascii,
                })))
            }
            Command::Grid(args) => {
                let origin = match &args.origin {
                    Some(text) => {
                        let path = PathBuf::from(text);
                        Some(match path.is_file() {
                            true => GridOrigin::from_csv(&path).map_err(|e| e.to_string())?,
                            false => text.parse::<GridOrigin>()?,
                        })
                    }
                    None => None,
                };
                let data_dir = match &args.data_dir {
                    Some(d) => d.clone(),
                    None => args
                        .geometry
                        .parent()
                        .map(|p| p.to_path_buf())
                        .unwrap_or_default(),
                };

                Ok(ParsedArgs::Grid(Box::new(grid::GridParams {
                    output_path: args
                        .output
                        .clone()
                        .unwrap_or_else(|| args.geometry.with_extension("nc")),
                    geometry_path: args.geometry.clone(),
                    data_dir,
                    datum: args.datum,
                    length: args.length,
                    medium_velocity: args.velocity,
                    line_steps: parse_steps(&args.steps, &line::all_available_steps())?,
                    slice_thickness: args.slice_thickness,
                    slice_steps: parse_steps(&args.slice_steps, &line::timeslice_steps())?,
                    origin,
                    lines_dir: args.export_lines.clone(),
                    geometry_csv: args.line_csv.clone(),
                    slice_xyz_dir: args.slice_xyz.clone(),
                    no_export: args.no_export,
                })))
            }
            Command::Psa(args) => Ok(ParsedArgs::Psa(psa::PsaParams {
                filepaths: glob_filepaths(&args.filepath)?,
                output_path: args.output.clone(),
                average: args.average,
                in_mm: args.mm,
                mastersizer: args.mastersizer,
            })),
        }
    }

    /// The diagnostic log filter from the verbosity flags
    pub fn log_filter(&self) -> EnvFilter {
        match (self.verbose, self.quiet) {
            (true, _) => EnvFilter::new("debug"),
            (_, true) => EnvFilter::new("warn"),
            _ => EnvFilter::new("info"),
        }
    }
}

/// Run the main CLI functionality based on the given arguments
///
/// # Arguments
/// - `arguments`: The Args object containing the parsed arguments.
///
/// # Returns
/// The appropriate exit code.
pub fn main(arguments: Args) -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(arguments.log_filter())
        .with_writer(std::io::stderr)
        .init();

    let result = match arguments.parse_command() {
        ParsedArgs::Line(params) => line::run(*params),
        ParsedArgs::Grid(params) => grid::run(*params),
        ParsedArgs::Psa(params) => psa::run(params),
        ParsedArgs::Error(message) => return error(&message, 1),
        ParsedArgs::Done => return 0,
    };
    match result {
        Ok(_) => 0,
        Err(e) => error(&e.to_string(), 1),
    }
}

/// Print an error to /dev/stderr and return an exit code
fn error(message: &str, code: i32) -> i32 {
    eprintln!("{}", message);
    code
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Args, ParsedArgs};

    #[test]
    fn test_parse_line_args() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("DAT_0001.rad"), "").unwrap();
        let pattern = format!("{}/*.rad", dir.path().display());

        let args = Args::parse_from(["gprgrid", "line", &pattern, "--steps", "dewow(3), gain(0.1)"]);
        match args.parse_command() {
            ParsedArgs::Line(params) => {
                assert_eq!(params.filepaths.len(), 1);
                assert_eq!(params.steps, vec!["dewow(3)", "gain(0.1)"]);
                assert_eq!(params.medium_velocity, 0.1);
            }
            _ => panic!("Expected line parameters"),
        }

        let args = Args::parse_from(["gprgrid", "line", &pattern, "--steps", "dewoww"]);
        assert!(matches!(args.parse_command(), ParsedArgs::Error(e) if e.contains("Unrecognized step")));

        let args = Args::parse_from(["gprgrid", "line", "/nonexistent/*.rad"]);
        assert!(matches!(args.parse_command(), ParsedArgs::Error(e) if e.contains("No files found")));
    }

    #[test]
    fn test_parse_grid_args() {
        let args = Args::parse_from([
            "gprgrid",
            "grid",
            "/survey/geometry.csv",
            "--datum",
            "-2.5",
            "--origin",
            "500000,6000000,45",
            "--slice-thickness",
            "0.1",
            "--slice-steps",
            "clip_to_border,zero(1)",
            "-v",
        ]);
        assert_eq!(args.log_filter().to_string(), "debug");

        match args.parse_command() {
            ParsedArgs::Grid(params) => {
                assert_eq!(params.data_dir, std::path::PathBuf::from("/survey"));
                assert_eq!(params.output_path, std::path::PathBuf::from("/survey/geometry.nc"));
                assert_eq!(params.datum, Some(-2.5));
                assert_eq!(params.origin.map(|o| o.bearing_deg), Some(45.));
                assert_eq!(params.slice_steps, vec!["clip_to_border", "zero(1)"]);
            }
            _ => panic!("Expected grid parameters"),
        }

        // Line steps are not valid for timeslices
        let args = Args::parse_from([
            "gprgrid",
            "grid",
            "geometry.csv",
            "--slice-steps",
            "dewow",
        ]);
        assert!(matches!(args.parse_command(), ParsedArgs::Error(_)));
    }

    #[test]
    fn test_parse_psa_args() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ms2000.csv"), "").unwrap();
        let pattern = format!("{}/*.csv", dir.path().display());

        let args = Args::parse_from(["gprgrid", "psa", &pattern, "--mastersizer", "--mm"]);
        match args.parse_command() {
            ParsedArgs::Psa(params) => {
                assert_eq!(params.filepaths.len(), 1);
                assert!(params.mastersizer);
                assert!(params.in_mm);
                assert!(!params.average);
            }
            _ => panic!("Expected psa parameters"),
        }
    }

    #[test]
    fn test_verbosity() {
        let args = Args::parse_from(["gprgrid", "steps", "-q"]);
        assert_eq!(args.log_filter().to_string(), "warn");
        assert!(Args::try_parse_from(["gprgrid", "steps", "-q", "-v"]).is_err());
    }
}
