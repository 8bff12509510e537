/// Miscellaneous functions that are used in other parts of the program
use core::ops::{Add, Div, Mul, Sub};
use std::path::Path;
use std::str::FromStr;

/// Interpolate linearly between two known points
///
/// https://en.wikipedia.org/wiki/Linear_interpolation#Linear_interpolation_between_two_known_points
///
/// # Arguments
/// - `known_xy0`: The first known point as (explanatory, independent)
/// - `known_xy1`: The second known point as (explanatory, independent)
/// - `x`: The explanatory point at which to interpolate the independent variables
///
/// # Returns
/// The interpolated independent (y) value.
pub fn interpolate_between_known<
    T: Add<Output = T> + Sub<Output = T> + Mul<Output = T> + Div<Output = T> + Copy,
>(
    known_xy0: (T, T),
    known_xy1: (T, T),
    x: T,
) -> T {
    (known_xy0.1 * (known_xy1.0 - x) + known_xy1.1 * (x - known_xy0.0))
        / (known_xy1.0 - known_xy0.0)
}

/// Round a value to a fixed number of decimals
///
/// Grid coordinates are compared after rounding so that float noise from repeated step additions
/// does not create phantom lines or traces.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}

/// Return the most common value, treating values within `tolerance` as equal
///
/// Ties resolve to the value that was encountered first.
///
/// # Returns
/// The most common value and the number of distinct values, or None if `values` is empty.
pub fn mode(values: &[f64], tolerance: f64) -> Option<(f64, usize)> {
    let mut counts: Vec<(f64, usize)> = Vec::new();

    for value in values {
        match counts
            .iter_mut()
            .find(|(known, _)| (known - value).abs() <= tolerance)
        {
            Some(entry) => entry.1 += 1,
            None => counts.push((*value, 1)),
        }
    }

    let n_distinct = counts.len();
    let mut best: Option<(f64, usize)> = None;
    for (value, count) in counts {
        if best.map(|(_, c)| count > c).unwrap_or(true) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| (value, n_distinct))
}

/// Reflector depth (m) of a two-way travel time (ns)
pub fn two_way_depth_m(time_ns: f64, velocity: f64) -> f64 {
    0.5 * time_ns * velocity
}

/// Parse the options (arguments) of a user-supplied step
///
/// # Arguments
/// - `string`: The string to parse
/// - `argument_index`: The expected index of the argument
///
/// # Examples
/// ```
/// assert_eq!(parse_option::<u32>("dewow(5)", 0), Ok(Some(5)));
/// assert_eq!(parse_option::<f32>("subset(1 2)", 1), Ok(Some(2.0)));
/// assert_eq!(parse_option::<f32>("high_pass", 1), Ok(None));
/// ```
///
/// # Returns
/// - Ok(Some(x)) where x is the successfully parsed argument
/// - Ok(None) if there is no argument in the string
/// - Err(e) if the argument could not be parsed
pub fn parse_option<T: FromStr>(string: &str, argument_index: usize) -> Result<Option<T>, String> {
    match string.split_once('(') {
        None => Ok(None),
        Some((_, first_part)) => match first_part.split_once(')') {
            Some((within_parentheses, _)) => {
                let arguments = within_parentheses.split_whitespace().collect::<Vec<&str>>();

                match arguments.get(argument_index) {
                    Some(s) => match s.trim().parse::<T>() {
                        Ok(v) => Ok(Some(v)),
                        Err(_) => Err(format!(
                            "Could not parse argument {} as value in string {}: {}",
                            argument_index, string, s
                        )),
                    },
                    None => Err(format!(
                        "Argument {} out of bounds in string: {}",
                        argument_index, string
                    )),
                }
            }
            None => Err(format!(
                "String: {} has opening parenthesis but not closing",
                string
            )),
        },
    }
}

/// Like [`parse_option`] but a missing argument (none given or out of bounds) is `Ok(None)`
pub fn parse_optional<T: FromStr>(string: &str, argument_index: usize) -> Result<Option<T>, String> {
    match parse_option::<T>(string, argument_index) {
        Err(e) if e.contains("out of bounds") => Ok(None),
        other => other,
    }
}

/// The name of a step without its arguments, e.g. "dewow(5)" -> "dewow"
pub fn step_name(step: &str) -> &str {
    step.split('(').next().unwrap_or(step).trim()
}

/// Parse a list of processing steps
///
/// The list is either a comma separated string ("dewow(5), gain(0.1)") or a path to a file with
/// one step per line. Empty lines and lines starting with '#' are skipped.
pub fn parse_step_list(string: &str) -> Result<Vec<String>, String> {
    let path = Path::new(string);

    let text = if path.is_file() {
        std::fs::read_to_string(path)
            .map_err(|e| format!("Could not read step file {:?}: {}", path, e))?
            .lines()
            .filter(|l| !l.trim_start().starts_with('#'))
            .collect::<Vec<&str>>()
            .join(",")
    } else {
        string.to_string()
    };

    let mut steps = Vec::<String>::new();
    let mut depth = 0_i32;
    let mut current = String::new();

    // Commas inside parentheses belong to the step, not to the list
    for c in text.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => (),
        }
        if c == ',' && depth == 0 {
            steps.push(current.trim().to_string());
            current.clear();
        } else {
            current.push(c);
        }
    }
    steps.push(current.trim().to_string());

    if depth != 0 {
        return Err(format!("Unbalanced parentheses in step list: {}", string));
    }

    Ok(steps.into_iter().filter(|s| !s.is_empty()).collect())
}

#[cfg(test)]
mod tests {

    #[test]
    fn test_interpolate_between_known() {
        let known_xy0 = (0_f64, 0_f64);
        let known_xy1 = (5_f64, 10_f64);

        assert_eq!(super::interpolate_between_known(known_xy0, known_xy1, 2.5), 5.0)
    }

    #[test]
    fn test_parse_option() {
        assert_eq!(super::parse_option::<u32>("dewow", 0), Ok(None));
        assert_eq!(super::parse_option::<u32>("dewow(1)", 0), Ok(Some(1_u32)));
        assert_eq!(super::parse_option::<f32>("dewow(1 2.0)", 1), Ok(Some(2_f32)));
        assert_eq!(super::parse_option::<i64>("subset(1   -2)", 1), Ok(Some(-2_i64)));

        assert!(super::parse_option::<f32>("dewow(", 0)
            .unwrap_err()
            .contains("opening parenthesis but not closing"));
        assert!(super::parse_option::<f32>("dewow(1)", 1)
            .unwrap_err()
            .contains("Argument 1 out of bounds"));
        assert!(super::parse_option::<f32>("clip(a)", 0)
            .unwrap_err()
            .contains("Could not parse argument 0"));

        assert_eq!(super::parse_optional::<f32>("clip()", 0), Ok(None));
        assert_eq!(super::parse_optional::<f32>("clip(2)", 1), Ok(None));
    }

    #[test]
    fn test_parse_step_list() {
        assert_eq!(
            super::parse_step_list("clip(1.0), moving_average(3),high_pass").unwrap(),
            vec!["clip(1.0)", "moving_average(3)", "high_pass"]
        );
        assert!(super::parse_step_list("clip(1.0").is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steps.txt");
        std::fs::write(&path, "# Smooth\nclip(2)\n\nmoving_average(5)\n").unwrap();
        assert_eq!(
            super::parse_step_list(path.to_str().unwrap()).unwrap(),
            vec!["clip(2)", "moving_average(5)"]
        );
    }

    #[test]
    fn test_step_name() {
        assert_eq!(super::step_name("dewow(5)"), "dewow");
        assert_eq!(super::step_name("high_pass"), "high_pass");
    }

    #[test]
    fn test_mode() {
        assert_eq!(super::mode(&[], 1e-9), None);
        assert_eq!(
            super::mode(&[500., 500.0000001, 250., 500.], 1e-3),
            Some((500., 2))
        );
        // Ties go to the first value
        assert_eq!(super::mode(&[1., 2.], 1e-9), Some((1., 2)));
    }

    #[test]
    fn test_depth_conversions() {
        assert_eq!(super::two_way_depth_m(20., 0.1), 1.);
        assert_eq!(super::round_to(0.1 + 0.2, 6), 0.3);
    }
}
