//! Scalar numerics shared by the models, sampler and LOO code.
//!
//! Everything works in log space where it matters: link functions expose
//! log-probabilities and their derivatives so Bernoulli and Binomial
//! likelihoods stay finite for extreme linear predictors.

use std::f64::consts::{LN_2, PI};

pub const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

/// Logistic function.
pub fn inv_logit(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

pub fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

/// `ln(1 + exp(x))` without overflow.
pub fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

/// `ln(inv_logit(x))`
pub fn log_inv_logit(x: f64) -> f64 {
    -softplus(-x)
}

/// `ln(1 - inv_logit(x))`
pub fn log1m_inv_logit(x: f64) -> f64 {
    -softplus(x)
}

/// Natural log of the complementary error function.
///
/// Chebyshev fit from Numerical Recipes (`erfcc`), fractional error below
/// 1.2e-7 everywhere. Evaluated in log space for positive arguments so that
/// `log_erfc(30.0)` is finite.
pub fn log_erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -z * z - 1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98
                                + t * (1.488_515_87 + t * (-0.822_152_23 + t * 0.170_872_77))))))));
    let log_tail = t.ln() + poly;
    if x >= 0.0 {
        log_tail
    } else {
        (2.0 - log_tail.exp()).ln()
    }
}

pub fn erfc(x: f64) -> f64 {
    log_erfc(x).exp()
}

/// Standard normal density.
pub fn std_normal_pdf(x: f64) -> f64 {
    std_normal_log_pdf(x).exp()
}

pub fn std_normal_log_pdf(x: f64) -> f64 {
    -0.5 * x * x - LN_SQRT_2PI
}

/// Standard normal CDF, `Phi(x)`.
pub fn std_normal_cdf(x: f64) -> f64 {
    std_normal_log_cdf(x).exp()
}

/// Inverse standard normal CDF (Acklam's rational approximation, relative
/// error below 1.2e-9). Returns the infinities at 0 and 1.
pub fn std_normal_quantile(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969683028665376e1,
        2.209460984245205e2,
        -2.759285104469687e2,
        1.383577518672690e2,
        -3.066479806614716e1,
        2.506628277459239,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e1,
        1.615858368580409e2,
        -1.556989798598866e2,
        6.680131188771972e1,
        -1.328068155288572e1,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-3,
        -3.223964580411365e-1,
        -2.400758277161838,
        -2.549732539343734,
        4.374664141464968,
        2.938163982698783,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-3,
        3.224671290700398e-1,
        2.445134137142996,
        3.754408661907416,
    ];
    const P_LOW: f64 = 0.02425;

    if p.is_nan() || !(0.0..=1.0).contains(&p) {
        return f64::NAN;
    }
    if p == 0.0 {
        return f64::NEG_INFINITY;
    }
    if p == 1.0 {
        return f64::INFINITY;
    }
    let tail = |q: f64| {
        let r = (-2.0 * q.ln()).sqrt();
        (((((C[0] * r + C[1]) * r + C[2]) * r + C[3]) * r + C[4]) * r + C[5])
            / ((((D[0] * r + D[1]) * r + D[2]) * r + D[3]) * r + 1.0)
    };
    if p < P_LOW {
        tail(p)
    } else if p > 1.0 - P_LOW {
        -tail(1.0 - p)
    } else {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    }
}

/// `ln Phi(x)`, finite far into the lower tail.
pub fn std_normal_log_cdf(x: f64) -> f64 {
    -LN_2 + log_erfc(-x / std::f64::consts::SQRT_2)
}

/// Inverse Mills ratio `phi(x) / Phi(x)`, the derivative of `ln Phi(x)`.
pub fn inv_mills(x: f64) -> f64 {
    (std_normal_log_pdf(x) - std_normal_log_cdf(x)).exp()
}

/// Log density of `Normal(mean, sd)` at `x`.
pub fn normal_lpdf(x: f64, mean: f64, sd: f64) -> f64 {
    let z = (x - mean) / sd;
    -0.5 * z * z - sd.ln() - LN_SQRT_2PI
}

/// Lanczos approximation (g = 7, n = 9) of `ln Gamma(x)` for `x > 0`.
pub fn ln_gamma(x: f64) -> f64 {
    const COEF: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if x < 0.5 {
        // reflection
        return (PI / (PI * x).sin()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut acc = COEF[0];
    for (i, c) in COEF.iter().enumerate().skip(1) {
        acc += c / (x + i as f64);
    }
    let t = x + 7.5;
    LN_SQRT_2PI + (x + 0.5) * t.ln() - t + acc.ln()
}

/// `ln C(n, k)`
pub fn ln_choose(n: u32, k: u32) -> f64 {
    ln_gamma(n as f64 + 1.0) - ln_gamma(k as f64 + 1.0) - ln_gamma((n - k) as f64 + 1.0)
}

/// Binomial log mass with a logit-scale success probability.
pub fn binomial_logit_lpmf(successes: u32, trials: u32, eta: f64) -> f64 {
    ln_choose(trials, successes)
        + successes as f64 * log_inv_logit(eta)
        + (trials - successes) as f64 * log1m_inv_logit(eta)
}

pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample variance (n - 1 denominator).
pub fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}

pub fn sd(values: &[f64]) -> f64 {
    variance(values).sqrt()
}

/// Quantile with linear interpolation between order statistics
/// (R's default "type 7"). `sorted` must be ascending.
pub fn quantile_sorted(sorted: &[f64], prob: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let h = (n - 1) as f64 * prob.clamp(0.0, 1.0);
            let lo = h.floor() as usize;
            let hi = (lo + 1).min(n - 1);
            sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
        }
    }
}

pub fn sorted_copy(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normal_cdf_reference_values() {
        assert!((std_normal_cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((std_normal_cdf(1.959_963_985) - 0.975).abs() < 1e-6);
        assert!((std_normal_cdf(-1.0) - 0.158_655_254).abs() < 1e-6);
    }

    #[test]
    fn test_normal_quantile_inverts_cdf() {
        assert_eq!(std_normal_quantile(0.5), 0.0);
        assert!((std_normal_quantile(0.975) - 1.959_963_985).abs() < 1e-7);
        assert!((std_normal_quantile(0.001) + 3.090_232_306).abs() < 1e-7);
        for &x in &[-4.0, -2.5, -0.3, 0.7, 2.0, 3.5] {
            assert!((std_normal_quantile(std_normal_cdf(x)) - x).abs() < 1e-4, "x = {}", x);
        }
        assert_eq!(std_normal_quantile(0.0), f64::NEG_INFINITY);
        assert!(std_normal_quantile(1.5).is_nan());
    }

    #[test]
    fn test_log_cdf_deep_tail_is_finite() {
        let lp = std_normal_log_cdf(-30.0);
        assert!(lp.is_finite());
        // ln Phi(-30) ~ -454.32
        assert!((lp + 454.32).abs() < 0.05, "got {}", lp);
    }

    #[test]
    fn test_ln_gamma_factorials() {
        assert!(ln_gamma(1.0).abs() < 1e-12);
        assert!((ln_gamma(5.0) - 24f64.ln()).abs() < 1e-10);
        assert!((ln_choose(10, 3) - 120f64.ln()).abs() < 1e-9);
    }

    #[test]
    fn test_quantile_interpolates() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile_sorted(&xs, 0.0), 1.0);
        assert_eq!(quantile_sorted(&xs, 1.0), 4.0);
        assert!((quantile_sorted(&xs, 0.5) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_log_sum_exp_large_values() {
        let v = log_sum_exp(&[1000.0, 1000.0]);
        assert!((v - (1000.0 + 2f64.ln())).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn prop_inv_logit_logs_agree(x in -40.0f64..40.0) {
            let p = inv_logit(x);
            prop_assert!((log_inv_logit(x).exp() - p).abs() < 1e-12);
            prop_assert!((log1m_inv_logit(x).exp() - (1.0 - p)).abs() < 1e-12);
        }

        #[test]
        fn prop_normal_cdf_symmetric(x in -6.0f64..6.0) {
            let s = std_normal_cdf(x) + std_normal_cdf(-x);
            prop_assert!((s - 1.0).abs() < 1e-6);
        }
    }
}
