/// Particle-size distributions and their Folk & Ward graphical statistics
use std::path::{Path, PathBuf};

use crate::error::{GprError, Result};
use crate::tools;

/// Percentiles reported next to the graphical statistics
pub const REPORTED_PERCENTILES: [f64; 7] = [1., 5., 16., 50., 84., 95., 99.];

pub fn mm_to_phi(mm: f64) -> f64 {
    -mm.log2()
}

pub fn phi_to_mm(phi: f64) -> f64 {
    2_f64.powf(-phi)
}

/// A particle-size distribution sorted from coarse to fine
#[derive(Debug, Clone, PartialEq)]
pub struct Distribution {
    pub name: String,
    /// Size classes in mm, descending
    pub mm: Vec<f64>,
    /// Percentage of mass per class, summing to 100
    pub frequency: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphicalStatistics {
    /// Graphic mean, M_z
    pub mean: f64,
    /// Inclusive graphic standard deviation, sigma_I
    pub sorting: f64,
    /// Inclusive graphic skewness, Sk_I
    pub skewness: f64,
    /// Graphic kurtosis, K_G
    pub kurtosis: f64,
}

impl Distribution {
    /// Validate, sort (coarse to fine) and normalise a distribution
    ///
    /// Frequencies may be given as proportions or percentages.
    pub fn new(name: &str, mm: Vec<f64>, frequency: Vec<f64>) -> Result<Distribution> {
        if mm.len() != frequency.len() {
            return Err(GprError::Psa(format!(
                "{}: {} size classes but {} frequencies",
                name,
                mm.len(),
                frequency.len()
            )));
        }
        if let Some(size) = mm.iter().find(|v| !(v.is_finite() && **v > 0.)) {
            return Err(GprError::Psa(format!(
                "{}: sizes must be positive: {}",
                name, size
            )));
        }
        if let Some(freq) = frequency.iter().find(|v| !(v.is_finite() && **v >= 0.)) {
            return Err(GprError::Psa(format!(
                "{}: frequencies must be zero or positive: {}",
                name, freq
            )));
        }
        let total: f64 = frequency.iter().sum();
        if total <= 0. {
            return Err(GprError::Psa(format!("{}: the distribution is empty", name)));
        }

        let mut pairs = mm.into_iter().zip(frequency).collect::<Vec<(f64, f64)>>();
        pairs.sort_by(|a, b| b.0.total_cmp(&a.0));

        Ok(Distribution {
            name: name.to_string(),
            mm: pairs.iter().map(|(size, _)| *size).collect(),
            frequency: pairs.iter().map(|(_, f)| f * 100. / total).collect(),
        })
    }

    /// Read a distribution from a CSV with the columns "mm" and "frequency"
    pub fn from_csv(filepath: &Path) -> Result<Distribution> {
        let content = std::fs::read_to_string(filepath).map_err(|e| GprError::io(filepath, e))?;
        let mut rows = content
            .lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty());

        let csv_error = |line: usize, message: String| GprError::Csv {
            path: filepath.to_path_buf(),
            line,
            message,
        };
        let header = rows
            .next()
            .map(|(_, l)| {
                l.split(',')
                    .map(|c| c.trim().trim_matches('"').to_lowercase())
                    .collect::<Vec<String>>()
            })
            .ok_or_else(|| csv_error(1, "The file is empty".into()))?;
        let column = |name: &str| {
            header
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| csv_error(1, format!("Missing column '{}'", name)))
        };
        let (mm_col, freq_col) = (column("mm")?, column("frequency")?);

        let mut mm = Vec::<f64>::new();
        let mut frequency = Vec::<f64>::new();
        for (i, row) in rows {
            let values = row.split(',').map(|v| v.trim()).collect::<Vec<&str>>();
            let parse = |index: usize, name: &str| -> Result<f64> {
                let value = values.get(index).copied().unwrap_or("");
                value
                    .parse::<f64>()
                    .map_err(|_| csv_error(i + 1, format!("Invalid value for '{}': {}", name, value)))
            };
            mm.push(parse(mm_col, "mm")?);
            frequency.push(parse(freq_col, "frequency")?);
        }

        let name = filepath
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("distribution");
        Distribution::new(name, mm, frequency)
    }

    pub fn phi(&self) -> Vec<f64> {
        self.mm.iter().map(|mm| mm_to_phi(*mm)).collect()
    }

    /// Cumulative percentage coarser than or equal to each class
    pub fn cumulative(&self) -> Vec<f64> {
        self.frequency
            .iter()
            .scan(0., |sum, f| {
                *sum += f;
                Some(*sum)
            })
            .collect()
    }

    /// Remove leading and trailing empty classes, keeping one on either side
    pub fn trimmed(&self) -> Distribution {
        let first = self.frequency.iter().position(|f| *f > 0.).unwrap_or(0);
        let last = self
            .frequency
            .iter()
            .rposition(|f| *f > 0.)
            .unwrap_or(self.frequency.len().saturating_sub(1));
        let range = first.saturating_sub(1)..(last + 2).min(self.frequency.len());

        Distribution {
            name: self.name.clone(),
            mm: self.mm[range.clone()].to_vec(),
            frequency: self.frequency[range].to_vec(),
        }
    }

    /// The phi size at a cumulative percentage, interpolated linearly between classes
    ///
    /// Percentages outside the cumulative curve give the first or last phi value.
    pub fn percentile(&self, percent: f64) -> Result<f64> {
        if !(0. ..=100.).contains(&percent) {
            return Err(GprError::Psa(format!(
                "Percentiles must be between 0 and 100: {}",
                percent
            )));
        }
        let cumulative = self.cumulative();
        let phi = self.phi();

        let above = match cumulative.iter().position(|c| *c > percent) {
            Some(i) => i,
            None => return Ok(phi[phi.len() - 1]),
        };
        let below = match cumulative.iter().rposition(|c| *c <= percent) {
            Some(i) => i,
            None => return Ok(phi[0]),
        };

        Ok(tools::interpolate_between_known(
            (cumulative[below], phi[below]),
            (cumulative[above], phi[above]),
            percent,
        ))
    }

    pub fn graphical_percentiles(&self, percents: &[f64]) -> Result<Vec<f64>> {
        percents.iter().map(|p| self.percentile(*p)).collect()
    }

    pub fn graphical_statistics(&self) -> Result<GraphicalStatistics> {
        let p = self.graphical_percentiles(&[5., 16., 25., 50., 75., 84., 95.])?;
        let (phi5, phi16, phi25, phi50, phi75, phi84, phi95) =
            (p[0], p[1], p[2], p[3], p[4], p[5], p[6]);

        if (phi84 - phi16) == 0. || (phi95 - phi5) == 0. || (phi75 - phi25) == 0. {
            return Err(GprError::Psa(format!(
                "{}: the distribution is too narrow for graphical statistics",
                self.name
            )));
        }

        Ok(GraphicalStatistics {
            mean: (phi16 + phi50 + phi84) / 3.,
            sorting: (phi84 - phi16) / 4. + (phi95 - phi5) / 6.6,
            skewness: (phi16 + phi84 - 2. * phi50) / (2. * (phi84 - phi16))
                + (phi5 + phi95 - 2. * phi50) / (2. * (phi95 - phi5)),
            kurtosis: (phi95 - phi5) / (2.44 * (phi75 - phi25)),
        })
    }
}

/// Average distributions that share the same size classes
pub fn average(distributions: &[Distribution]) -> Result<Distribution> {
    let first = distributions
        .first()
        .ok_or_else(|| GprError::Psa("No distributions to average".into()))?;

    let mut sum = vec![0_f64; first.frequency.len()];
    for distribution in distributions {
        let same_classes = distribution.mm.len() == first.mm.len()
            && distribution
                .mm
                .iter()
                .zip(&first.mm)
                .all(|(a, b)| (a - b).abs() < 1e-9);
        if !same_classes {
            return Err(GprError::Psa(format!(
                "{} and {} have different size classes",
                first.name, distribution.name
            )));
        }
        for (total, f) in sum.iter_mut().zip(&distribution.frequency) {
            *total += f;
        }
    }
    let n = distributions.len() as f64;

    Distribution::new(
        "average",
        first.mm.clone(),
        sum.into_iter().map(|f| f / n).collect(),
    )
}

/// Read a Malvern Mastersizer 2000 CSV export
///
/// The export has two header rows. Columns whose second header is a number are size classes in
/// µm; the others are metadata. Replicate measurements of the same sample on the same day are
/// averaged and named "<sample name> <day>".
pub fn read_mastersizer(filepath: &Path) -> Result<Vec<Distribution>> {
    let content = std::fs::read_to_string(filepath).map_err(|e| GprError::io(filepath, e))?;
    let split = |line: &str| {
        line.split(',')
            .map(|c| c.trim().trim_matches('"').to_string())
            .collect::<Vec<String>>()
    };
    let mut rows = content
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty());

    let csv_error = |line: usize, message: String| GprError::Csv {
        path: filepath.to_path_buf(),
        line,
        message,
    };
    let (names, classes) = match (rows.next(), rows.next()) {
        (Some((_, first)), Some((_, second))) => (split(first), split(second)),
        _ => return Err(csv_error(1, "Expected two header rows".into())),
    };
    let column = |name: &str| {
        names
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .ok_or_else(|| csv_error(1, format!("Missing column '{}'", name)))
    };
    let (name_col, date_col) = (column("Sample Name")?, column("Measurement date and time")?);

    let size_cols = classes
        .iter()
        .enumerate()
        .filter_map(|(i, c)| c.parse::<f64>().ok().map(|um| (i, um / 1000.)))
        .collect::<Vec<(usize, f64)>>();
    if size_cols.is_empty() {
        return Err(csv_error(2, "No size classes in the second header row".into()));
    }
    let mm = size_cols.iter().map(|(_, mm)| *mm).collect::<Vec<f64>>();

    // Replicates keyed by sample name and day, in the order they first appear
    let mut groups = Vec::<(String, Vec<Distribution>)>::new();
    for (i, row) in rows {
        let values = split(row);
        let cell = |index: usize| values.get(index).map(|v| v.as_str()).unwrap_or("");

        let day = cell(date_col).split_whitespace().next().unwrap_or("");
        let key = format!("{} {}", cell(name_col), day).trim().to_string();

        let frequency = size_cols
            .iter()
            .map(|(index, _)| match cell(*index) {
                "" => Ok(0.),
                v => v
                    .parse::<f64>()
                    .map_err(|_| csv_error(i + 1, format!("Invalid frequency: {}", v))),
            })
            .collect::<Result<Vec<f64>>>()?;
        let distribution = Distribution::new(&key, mm.clone(), frequency)?;

        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, replicates)) => replicates.push(distribution),
            None => groups.push((key, vec![distribution])),
        }
    }

    groups
        .into_iter()
        .map(|(key, replicates)| {
            tracing::debug!("{}: averaging {} measurement(s)", key, replicates.len());
            let mut averaged = average(&replicates)?;
            averaged.name = key;
            Ok(averaged)
        })
        .collect()
}

pub struct PsaParams {
    pub filepaths: Vec<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub average: bool,
    /// Report percentiles in mm instead of phi
    pub in_mm: bool,
    /// Read the inputs as Mastersizer exports with one sample per row
    pub mastersizer: bool,
}

fn to_csv_row(distribution: &Distribution, in_mm: bool) -> Result<String> {
    let trimmed = distribution.trimmed();
    let stats = trimmed.graphical_statistics()?;
    let percentiles = trimmed
        .graphical_percentiles(&REPORTED_PERCENTILES)?
        .into_iter()
        .map(|phi| if in_mm { phi_to_mm(phi) } else { phi })
        .map(|v| format!("{:.4}", v))
        .collect::<Vec<String>>();

    Ok(format!(
        "{},{:.4},{:.4},{:.4},{:.4},{}\n",
        distribution.name,
        stats.mean,
        stats.sorting,
        stats.skewness,
        stats.kurtosis,
        percentiles.join(",")
    ))
}

/// Run the `psa` subcommand
pub fn run(params: PsaParams) -> Result<()> {
    let distributions = match params.mastersizer {
        true => params
            .filepaths
            .iter()
            .map(|p| read_mastersizer(p))
            .collect::<Result<Vec<Vec<Distribution>>>>()?
            .into_iter()
            .flatten()
            .collect::<Vec<Distribution>>(),
        false => params
            .filepaths
            .iter()
            .map(|p| Distribution::from_csv(p))
            .collect::<Result<Vec<Distribution>>>()?,
    };

    let unit = if params.in_mm { "_mm" } else { "" };
    let mut output = format!(
        "name,M_z,sigma_I,Sk_I,K_G,{}\n",
        REPORTED_PERCENTILES
            .iter()
            .map(|p| format!("D{}{}", p, unit))
            .collect::<Vec<String>>()
            .join(",")
    );
    for distribution in &distributions {
        output += &to_csv_row(distribution, params.in_mm)?;
    }
    if params.average {
        output += &to_csv_row(&average(&distributions)?, params.in_mm)?;
    }

    match &params.output_path {
        Some(filepath) => std::fs::write(filepath, output).map_err(|e| GprError::io(filepath, e)),
        None => {
            print!("{}", output);
            Ok(())
        }
    }
}
