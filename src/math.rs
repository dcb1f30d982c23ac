use ndarray::{Array, Array2};
use ndarray_linalg::Scalar;
use num_traits::Float;
use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::Result;

/// Generate the Vandermonde matrix of `degree` for observations `x`
///
/// Each row of the (n x degree + 1) matrix is a geometric progression for an individual
/// observation `x` from power `0` to `degree` inclusive. When `intercept` is false the leading
/// column of ones is dropped, giving a (n x degree) matrix for fits forced through the origin.
///
/// # Errors
///
/// Fails with a shape error if `degree` does not fit in an `i32`.
///
/// # Examples
///
/// ```
/// use isocal::math::vandermonde;
/// use ndarray::arr2;
///
/// let observations: Vec<f64> = vec![2., 3.];
/// let vander = vandermonde(&observations, 2, true).unwrap();
///
/// let expected = arr2(&[[1., 2., 4.], [1., 3., 9.]]);
/// assert_eq!(vander, expected);
/// ```
pub fn vandermonde<T: Copy + Scalar>(x: &[T], degree: usize, intercept: bool) -> Result<Array2<T>> {
    let first = usize::from(!intercept);
    let top = i32::try_from(degree).unwrap_or(i32::MAX);
    let vals = x
        .iter()
        .flat_map(|xi| (i32::from(!intercept)..=top).map(|power| xi.powi(power)));

    Ok(Array::from_iter(vals).into_shape((x.len(), degree + 1 - first))?)
}

/// Stack design rows into a matrix
///
/// # Errors
/// Fails if the rows do not all have `width` entries.
pub fn design_matrix(rows: &[Vec<f64>], width: usize) -> Result<Array2<f64>> {
    let vals = rows.iter().flat_map(|row| row.iter().copied());
    Ok(Array::from_iter(vals).into_shape((rows.len(), width))?)
}

/// Arithmetic mean, `None` for an empty slice
#[must_use]
pub fn mean<T: Float>(values: &[T]) -> Option<T> {
    if values.is_empty() {
        return None;
    }
    let total = values.iter().fold(T::zero(), |acc, &v| acc + v);
    Some(total / T::from(values.len())?)
}

/// Sample standard deviation with `n - 1` in the denominator, `None` for fewer than two values
#[must_use]
pub fn sample_sd<T: Float>(values: &[T]) -> Option<T> {
    if values.len() < 2 {
        return None;
    }
    let mean = mean(values)?;
    let ss = values
        .iter()
        .fold(T::zero(), |acc, &v| acc + (v - mean).powi(2));
    Some((ss / T::from(values.len() - 1)?).sqrt())
}

/// Two-sided p-value of a t statistic with `df` degrees of freedom
#[must_use]
pub fn two_sided_p(t: f64, df: f64) -> Option<f64> {
    if !t.is_finite() || df < 1. {
        return None;
    }
    let distribution = StudentsT::new(0., 1., df).ok()?;
    Some(2. * (1. - distribution.cdf(t.abs())))
}

/// The tricube kernel, zero outside `|u| < 1`
#[must_use]
pub fn tricube<T: Float>(u: T) -> T {
    let u = u.abs();
    if u >= T::one() {
        T::zero()
    } else {
        (T::one() - u.powi(3)).powi(3)
    }
}
