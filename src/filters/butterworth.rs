//! Butterworth low-pass design and zero-phase (forward-backward) filtering.
//!
//! Design goes analog prototype → frequency pre-warp → bilinear transform, so
//! the coefficients match the usual digital `butter(order, cutoff/nyquist)`.
//! `filtfilt` pads both ends with an odd reflection and starts each pass from
//! the steady-state initial conditions, which keeps the edges free of
//! start-up transients.

use crate::error::{PlateError, PlateResult};
use nalgebra::{Complex, DMatrix, DVector};
use std::f64::consts::PI;

#[derive(Debug, Clone)]
pub struct ButterworthFilter {
    b: Vec<f64>,
    a: Vec<f64>,
    /// Steady-state initial conditions for a unit step input
    zi: Vec<f64>,
}

impl ButterworthFilter {
    /// Low-pass of `order` with -3 dB at `cutoff_hz`
    pub fn lowpass(order: usize, cutoff_hz: f64, sample_rate_hz: f64) -> PlateResult<Self> {
        if order == 0 {
            return Err(PlateError::InvalidParameters("filter order must be >= 1".into()));
        }
        let wn = cutoff_hz / (sample_rate_hz / 2.0);
        if !(wn > 0.0 && wn < 1.0) {
            return Err(PlateError::InvalidParameters(format!(
                "normalized cutoff {:.4} outside (0, 1)",
                wn
            )));
        }

        let (b, a) = design_lowpass(order, wn);
        let zi = steady_state_zi(&b, &a)?;
        Ok(ButterworthFilter { b, a, zi })
    }

    pub fn coefficients(&self) -> (&[f64], &[f64]) {
        (&self.b, &self.a)
    }

    /// Default edge padding: three times the filter length
    pub fn default_padlen(&self) -> usize {
        3 * self.a.len().max(self.b.len())
    }

    /// Causal filtering (direct form II transposed) from the given state
    pub fn lfilter(&self, x: &[f64], zi: &[f64]) -> Vec<f64> {
        let n = self.a.len() - 1;
        let mut z = zi.to_vec();
        z.resize(n, 0.0);

        x.iter()
            .map(|&xn| {
                let yn = self.b[0] * xn + z.first().copied().unwrap_or(0.0);
                for i in 0..n {
                    let next = if i + 1 < n { z[i + 1] } else { 0.0 };
                    z[i] = self.b[i + 1] * xn + next - self.a[i + 1] * yn;
                }
                yn
            })
            .collect()
    }

    /// Zero-phase filtering: forward pass, then backward pass over the result
    pub fn filtfilt(&self, x: &[f64]) -> Vec<f64> {
        if x.len() < 2 {
            return x.to_vec();
        }
        let pad = self.default_padlen().min(x.len() - 1);
        let ext = odd_extend(x, pad);

        let x0 = ext[0];
        let zi: Vec<f64> = self.zi.iter().map(|z| z * x0).collect();
        let mut y = self.lfilter(&ext, &zi);

        y.reverse();
        let y0 = y[0];
        let zi: Vec<f64> = self.zi.iter().map(|z| z * y0).collect();
        let mut y = self.lfilter(&y, &zi);
        y.reverse();

        y[pad..y.len() - pad].to_vec()
    }
}

fn design_lowpass(order: usize, wn: f64) -> (Vec<f64>, Vec<f64>) {
    // bilinear transform at fs = 2, pre-warped cutoff
    let fs2 = 4.0;
    let warped = fs2 * (PI * wn / 2.0).tan();

    // analog prototype poles on the left half of the unit circle
    let analog: Vec<Complex<f64>> = (0..order)
        .map(|k| {
            let m = -(order as f64) + 1.0 + 2.0 * k as f64;
            let theta = PI * m / (2.0 * order as f64);
            -Complex::new(theta.cos(), theta.sin()) * warped
        })
        .collect();

    let gain_analog = warped.powi(order as i32);
    let fs2c = Complex::new(fs2, 0.0);
    let digital: Vec<Complex<f64>> = analog.iter().map(|&p| (fs2c + p) / (fs2c - p)).collect();
    let denom = analog.iter().fold(Complex::new(1.0, 0.0), |acc, &p| acc * (fs2c - p));
    let gain = gain_analog / denom.re;

    // all zeros sit at z = -1
    let b: Vec<f64> = poly(&vec![Complex::new(-1.0, 0.0); order])
        .into_iter()
        .map(|c| c.re * gain)
        .collect();
    let a: Vec<f64> = poly(&digital).into_iter().map(|c| c.re).collect();
    (b, a)
}

/// Monic polynomial coefficients (highest power first) from its roots
fn poly(roots: &[Complex<f64>]) -> Vec<Complex<f64>> {
    let mut coeffs = vec![Complex::new(1.0, 0.0)];
    for &r in roots {
        let mut next = coeffs.clone();
        next.push(Complex::new(0.0, 0.0));
        for (i, &c) in coeffs.iter().enumerate() {
            next[i + 1] -= c * r;
        }
        coeffs = next;
    }
    coeffs
}

/// Solves (I - Aᵀ) zi = b[1:] - a[1:]·b[0] where A is the companion matrix of `a`
fn steady_state_zi(b: &[f64], a: &[f64]) -> PlateResult<Vec<f64>> {
    let n = a.len() - 1;
    if n == 0 {
        return Ok(Vec::new());
    }

    // companion(a)ᵀ: first column -a[1:], ones on the superdiagonal
    let mut m = DMatrix::<f64>::identity(n, n);
    for i in 0..n {
        m[(i, 0)] += a[i + 1];
        if i + 1 < n {
            m[(i, i + 1)] -= 1.0;
        }
    }
    let rhs = DVector::from_iterator(n, (0..n).map(|i| b[i + 1] - a[i + 1] * b[0]));

    m.lu()
        .solve(&rhs)
        .map(|v| v.iter().copied().collect())
        .ok_or_else(|| PlateError::InvalidParameters("singular filter state matrix".into()))
}

/// Point-reflect `pad` samples about each end
fn odd_extend(x: &[f64], pad: usize) -> Vec<f64> {
    let n = x.len();
    let first = x[0];
    let last = x[n - 1];

    let mut ext = Vec::with_capacity(n + 2 * pad);
    ext.extend((1..=pad).rev().map(|i| 2.0 * first - x[i]));
    ext.extend_from_slice(x);
    ext.extend((1..=pad).map(|i| 2.0 * last - x[n - 1 - i]));
    ext
}
