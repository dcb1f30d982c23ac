//! Local linear regression with tricube weights.
//!
//! The smoothed values at the fitting abscissae come from `loess_rs`. What that crate does not
//! expose is the smoother operator itself: the prediction is linear in the observed responses,
//! `ŷ(x0) = Σ lⱼ(x0) yⱼ`, and the operator weights `l` give the fit at new abscissae, the
//! effective number of parameters (trace of the smoother matrix) and the standard error of a
//! prediction, `σ ‖l(x0)‖`. Those are evaluated here with the same kernel and neighbourhood.

use log::debug;
use loess_rs::prelude::{
    Batch, Direct, Linear, Loess as LoessBuilder, NoBoundary, Tricube, UseLocalMean,
};

use crate::fit::FitIssue;
use crate::math::tricube;

/// Below this the local design is treated as a single abscissa and a weighted mean is used
const DEGENERATE_SPREAD: f64 = 1e-12;

/// Parameters of the local line
const LOCAL_PARAMETERS: usize = 2;

/// Tricube kernel at one abscissa and the zeroth to second weighted moments of `x - x0`
struct Neighbourhood {
    kernel: Vec<f64>,
    s0: f64,
    s1: f64,
    s2: f64,
}

impl Neighbourhood {
    fn det(&self) -> f64 {
        self.s0.mul_add(self.s2, -(self.s1 * self.s1))
    }

    fn is_degenerate(&self) -> bool {
        self.det() <= DEGENERATE_SPREAD * self.s0 * self.s0
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Loess {
    x: Vec<f64>,
    y: Vec<f64>,
    span: f64,
    fitted: Vec<f64>,
}

impl Loess {
    /// Smooth `y` against `x` with no robustness iterations.
    ///
    /// Fails with [`FitIssue::Singular`] when some fitting abscissa has a neighbourhood with a
    /// single distinct `x`, which covers every data set with fewer than two distinct values.
    pub(crate) fn fit(x: Vec<f64>, y: Vec<f64>, span: f64) -> Result<Self, FitIssue> {
        debug_assert_eq!(x.len(), y.len());
        let mut loess = Self {
            x,
            y,
            span,
            fitted: vec![],
        };

        let rank = loess
            .x
            .iter()
            .map(|&x0| loess.local_rank(x0))
            .min()
            .unwrap_or(0);
        if rank < LOCAL_PARAMETERS {
            return Err(FitIssue::Singular {
                rank,
                parameters: LOCAL_PARAMETERS,
            });
        }

        let mut order = (0..loess.x.len()).collect::<Vec<_>>();
        order.sort_by(|&a, &b| loess.x[a].total_cmp(&loess.x[b]));
        let sorted_x = order.iter().map(|&ii| loess.x[ii]).collect::<Vec<_>>();
        let sorted_y = order.iter().map(|&ii| loess.y[ii]).collect::<Vec<_>>();

        let model = LoessBuilder::new()
            .fraction(span)
            .iterations(0)
            .degree(Linear)
            .weight_function(Tricube)
            .surface_mode(Direct)
            .boundary_policy(NoBoundary)
            .zero_weight_fallback(UseLocalMean)
            .adapter(Batch)
            .build()
            .map_err(|e| {
                debug!("local regression rejected span {span}: {e:?}");
                FitIssue::SmoothingFailed
            })?;
        let result = model.fit(&sorted_x, &sorted_y).map_err(|e| {
            debug!("local regression failed: {e:?}");
            FitIssue::SmoothingFailed
        })?;
        if result.y.len() != order.len() {
            return Err(FitIssue::SmoothingFailed);
        }

        let mut fitted = vec![f64::NAN; order.len()];
        for (&ii, &value) in order.iter().zip(&result.y) {
            fitted[ii] = value;
        }
        if fitted.iter().any(|v| !v.is_finite()) {
            return Err(FitIssue::NonFinite);
        }
        loess.fitted = fitted;
        Ok(loess)
    }

    /// Smoothed values at the fitting abscissae, in the order they were given
    pub(crate) fn fitted(&self) -> &[f64] {
        &self.fitted
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn neighbourhood_size(&self) -> usize {
        let n = self.x.len();
        ((self.span * n as f64).ceil() as usize).clamp(2.min(n), n)
    }

    fn neighbourhood(&self, x0: f64) -> Option<Neighbourhood> {
        if self.x.is_empty() || !x0.is_finite() {
            return None;
        }
        let q = self.neighbourhood_size();

        let mut distances = self.x.iter().map(|x| (x - x0).abs()).collect::<Vec<_>>();
        let mut sorted = distances.clone();
        sorted.sort_by(f64::total_cmp);
        let bandwidth = sorted[q - 1].max(f64::MIN_POSITIVE) * (1. + 1e-10);

        for distance in &mut distances {
            *distance = tricube(*distance / bandwidth);
        }
        let kernel = distances;

        let (s0, s1, s2) = kernel
            .iter()
            .zip(&self.x)
            .fold((0., 0., 0.), |(s0, s1, s2), (w, x)| {
                let dx = x - x0;
                (s0 + w, s1 + w * dx, s2 + w * dx * dx)
            });
        (s0 > 0.).then_some(Neighbourhood { kernel, s0, s1, s2 })
    }

    /// Rank of the local weighted design at `x0`: 0 with no weight, 1 for a single abscissa
    pub(crate) fn local_rank(&self, x0: f64) -> usize {
        match self.neighbourhood(x0) {
            None => 0,
            Some(local) if local.is_degenerate() => 1,
            Some(_) => LOCAL_PARAMETERS,
        }
    }

    /// Operator weights `l(x0)`, `None` when there is no data to smooth
    pub(crate) fn weights_at(&self, x0: f64) -> Option<Vec<f64>> {
        let local = self.neighbourhood(x0)?;
        if local.is_degenerate() {
            return Some(local.kernel.iter().map(|w| w / local.s0).collect());
        }
        let det = local.det();
        Some(
            local
                .kernel
                .iter()
                .zip(&self.x)
                .map(|(w, x)| w * local.s1.mul_add(-(x - x0), local.s2) / det)
                .collect(),
        )
    }

    pub(crate) fn predict(&self, x0: f64) -> Option<f64> {
        self.weights_at(x0)
            .map(|weights| weights.iter().zip(&self.y).map(|(l, y)| l * y).sum())
    }

    /// Trace of the smoother matrix, the effective number of parameters
    pub(crate) fn trace(&self) -> f64 {
        self.x
            .iter()
            .enumerate()
            .filter_map(|(ii, &x)| self.weights_at(x).map(|weights| weights[ii]))
            .sum()
    }

    /// Norm of the operator weights at `x0`, multiply by the residual SD for a standard error
    pub(crate) fn leverage_norm(&self, x0: f64) -> Option<f64> {
        self.weights_at(x0)
            .map(|weights| weights.iter().map(|l| l * l).sum::<f64>().sqrt())
    }
}
