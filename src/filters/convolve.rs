use ndarray::Array2;
use num::Float;
use rayon::prelude::*;

/// Map an out-of-bounds index back into `0..n` by mirroring about the edge
///
/// The edge sample is repeated (d c b a | a b c d | d c b a), which is the "reflect" mode of
/// scipy.ndimage.
pub fn reflect_index(i: isize, n: usize) -> usize {
    let period = 2 * n as isize;
    let m = i.rem_euclid(period);
    if m < n as isize {
        m as usize
    } else {
        (period - 1 - m) as usize
    }
}

/// Convolve a 2D array with a kernel using reflected boundaries
///
/// The kernel origin is its centre (`shape / 2`), and the kernel is flipped as in a true
/// convolution. Rows are computed in parallel.
///
/// # Arguments
/// - `data`: The array to convolve
/// - `kernel`: The convolution weights
///
/// # Returns
/// A new array with the same shape as `data`.
pub fn convolve2d<T: Float + Send + Sync>(data: &Array2<T>, kernel: &Array2<T>) -> Array2<T> {
    let (height, width) = data.dim();
    let (k_height, k_width) = kernel.dim();

    if height == 0 || width == 0 || k_height == 0 || k_width == 0 {
        return data.clone();
    }
    let row_center = (k_height / 2) as isize;
    let col_center = (k_width / 2) as isize;

    let output: Vec<T> = (0..height)
        .into_par_iter()
        .flat_map_iter(|row| {
            (0..width).map(move |col| {
                let mut sum = T::zero();
                for ((k_row, k_col), weight) in kernel.indexed_iter() {
                    let src_row =
                        reflect_index(row as isize + row_center - k_row as isize, height);
                    let src_col =
                        reflect_index(col as isize + col_center - k_col as isize, width);
                    sum = sum + *weight * data[[src_row, src_col]];
                }
                sum
            })
        })
        .collect();

    // The shape is guaranteed by construction
    Array2::from_shape_vec((height, width), output)
        .unwrap_or_else(|_| Array2::from_elem((height, width), T::nan()))
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::{arr2, Array2};

    #[test]
    fn test_reflect_index() {
        let n = 4;
        let mapped = (-4..8)
            .map(|i| super::reflect_index(i, n))
            .collect::<Vec<usize>>();
        assert_eq!(mapped, vec![3, 2, 1, 0, 0, 1, 2, 3, 3, 2, 1, 0]);
    }

    #[test]
    fn test_identity_kernel() {
        let data = arr2(&[[1_f32, 2., 3.], [4., 5., 6.]]);
        let kernel = arr2(&[[0_f32, 0., 0.], [0., 1., 0.], [0., 0., 0.]]);

        assert_eq!(super::convolve2d(&data, &kernel), data);
    }

    #[test]
    fn test_shift_kernel_is_flipped() {
        // A weight right of centre pulls values from the left neighbour in a convolution
        let data = arr2(&[[1_f64, 2., 3., 4.]]);
        let kernel = arr2(&[[0_f64, 0., 1.]]);

        let result = super::convolve2d(&data, &kernel);
        assert_eq!(result, arr2(&[[1., 1., 2., 3.]]));
    }

    #[test]
    fn test_box_kernel_preserves_constant() {
        let data = Array2::<f64>::from_elem((5, 7), 3.5);
        let kernel = Array2::<f64>::from_elem((3, 3), 1. / 9.);

        for value in super::convolve2d(&data, &kernel).iter() {
            assert_relative_eq!(*value, 3.5, epsilon = 1e-12);
        }
    }
}
