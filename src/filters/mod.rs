/// Elementary filters for radargrams and timeslices
///
/// NaN values mark "no data" (e.g. cells outside a surveyed area) and are ignored by all
/// statistics.
use ndarray::{Array, Array2, Axis, Dimension};
use num::Float;

pub mod convolve;

pub const DEFAULT_CLIP_STD: f32 = 1.0;
pub const DEFAULT_MOVING_AVERAGE_RADIUS: usize = 3;
const HIGH_PASS_NEIGHBOUR_WEIGHT: f64 = -0.25;

/// Mean and population standard deviation of all non-NaN values
pub fn nan_mean_std<'a, T: Float + 'a, I: IntoIterator<Item = &'a T>>(values: I) -> Option<(T, T)> {
    let mut sum = T::zero();
    let mut sum_sq = T::zero();
    let mut n = 0_usize;

    for value in values.into_iter().filter(|v| !v.is_nan()) {
        sum = sum + *value;
        sum_sq = sum_sq + *value * *value;
        n += 1;
    }
    if n == 0 {
        return None;
    }
    let count = T::from(n)?;
    let mean = sum / count;
    let variance = (sum_sq / count - mean * mean).max(T::zero());

    Some((mean, variance.sqrt()))
}

/// Minimum of all non-NaN values
pub fn nan_min<'a, T: Float + 'a, I: IntoIterator<Item = &'a T>>(values: I) -> Option<T> {
    values
        .into_iter()
        .filter(|v| !v.is_nan())
        .fold(None, |acc: Option<T>, v| Some(acc.map_or(*v, |a| a.min(*v))))
}

/// Clip values to the mean plus/minus a number of standard deviations
///
/// NaN values are left as NaN and do not contribute to the statistics.
pub fn clip_std<T: Float, D: Dimension>(data: &mut Array<T, D>, n_std: T) {
    if let Some((mean, std)) = nan_mean_std(data.iter()) {
        let low = mean - std * n_std;
        let high = mean + std * n_std;
        data.mapv_inplace(|v| if v.is_nan() { v } else { v.max(low).min(high) });
    }
}

/// Smooth with a `radius` x `radius` box kernel
pub fn moving_average<T: Float + Send + Sync>(
    data: &Array2<T>,
    radius: usize,
) -> Result<Array2<T>, String> {
    if radius == 0 {
        return Err("The moving average radius must be larger than zero".to_string());
    }
    let weight = T::one() / T::from(radius * radius).ok_or("Radius too large")?;
    let kernel = Array2::from_elem((radius, radius), weight);

    Ok(convolve::convolve2d(data, &kernel))
}

/// Enhance local contrast with a 3x3 high-pass kernel
///
/// The result is shifted so that its minimum is zero.
pub fn high_pass<T: Float + Send + Sync>(data: &Array2<T>) -> Array2<T> {
    let neighbour = T::from(HIGH_PASS_NEIGHBOUR_WEIGHT).unwrap_or_else(T::zero);
    let mut kernel = Array2::from_elem((3, 3), neighbour);
    kernel[[1, 1]] = T::one();

    let mut output = convolve::convolve2d(data, &kernel);
    zero_min(&mut output, T::zero());
    output
}

/// Shift the values so that the (NaN-ignoring) minimum equals `zero`
pub fn zero_min<T: Float, D: Dimension>(data: &mut Array<T, D>, zero: T) {
    if let Some(minval) = nan_min(data.iter()) {
        data.mapv_inplace(|v| v - minval + zero);
    }
}

/// Indices of the rows and columns that contain data (their NaN-ignoring sum is not zero)
pub fn data_extent<T: Float>(data: &Array2<T>) -> (Vec<usize>, Vec<usize>) {
    let has_data = |lane: ndarray::ArrayView1<T>| {
        !lane
            .iter()
            .filter(|v| !v.is_nan())
            .fold(T::zero(), |acc, v| acc + *v)
            .is_zero()
    };
    let indices = |axis: usize| {
        data.axis_iter(Axis(axis))
            .enumerate()
            .filter(|(_, lane)| has_data(lane.view()))
            .map(|(i, _)| i)
            .collect::<Vec<usize>>()
    };

    (indices(0), indices(1))
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::{arr1, arr2, Array2};

    #[test]
    fn test_nan_mean_std() {
        let values = [2_f64, 4., 4., 4., 5., 5., 7., 9., f64::NAN];
        let (mean, std) = super::nan_mean_std(values.iter()).unwrap();
        assert_relative_eq!(mean, 5.0);
        assert_relative_eq!(std, 2.0);

        assert!(super::nan_mean_std([f32::NAN].iter()).is_none());
    }

    #[test]
    fn test_clip_std() {
        let mut data = arr1(&[2_f64, 4., 4., 4., 5., 5., 7., 9., f64::NAN]);
        super::clip_std(&mut data, 1.0);

        assert_eq!(data[0], 3.0);
        assert_eq!(data[4], 5.0);
        assert_eq!(data[7], 7.0);
        assert!(data[8].is_nan());
    }

    #[test]
    fn test_moving_average() {
        let mut data = Array2::<f32>::zeros((5, 5));
        data[[2, 2]] = 9.0;

        let smoothed = super::moving_average(&data, 3).unwrap();
        // The impulse is spread evenly over its 3x3 neighbourhood
        assert_relative_eq!(smoothed[[1, 1]], 1.0);
        assert_relative_eq!(smoothed[[3, 3]], 1.0);
        assert_relative_eq!(smoothed[[0, 0]], 0.0);
        assert_relative_eq!(smoothed.sum(), 9.0, epsilon = 1e-5);

        assert!(super::moving_average(&data, 0).is_err());
    }

    #[test]
    fn test_high_pass() {
        let flat = Array2::<f64>::from_elem((4, 4), 2.0);
        // A constant field has no contrast; everything ends up at zero
        for value in super::high_pass(&flat).iter() {
            assert_relative_eq!(*value, 0.0);
        }

        let mut spike = Array2::<f64>::zeros((5, 5));
        spike[[2, 2]] = 4.0;
        let filtered = super::high_pass(&spike);
        assert_relative_eq!(filtered[[2, 2]], 5.0);
        assert_relative_eq!(filtered[[1, 1]], 0.0);
        assert_relative_eq!(filtered[[0, 0]], 1.0);
    }

    #[test]
    fn test_zero_min() {
        let mut data = arr2(&[[f32::NAN, -2.], [0., 3.]]);
        super::zero_min(&mut data, 1.0);
        assert!(data[[0, 0]].is_nan());
        assert_eq!(data[[0, 1]], 1.0);
        assert_eq!(data[[1, 1]], 6.0);
    }

    #[test]
    fn test_data_extent() {
        let data = arr2(&[
            [0_f32, 0., 0., 0.],
            [0., 1., f32::NAN, 0.],
            [0., 2., 3., 0.],
            [f32::NAN, 0., 0., 0.],
        ]);

        assert_eq!(super::data_extent(&data), (vec![1, 2], vec![1, 2]));
        assert_eq!(super::data_extent(&Array2::<f32>::zeros((2, 2))), (vec![], vec![]));
    }
}
