//! Log-domain arithmetic.
//!
//! Probabilities are carried as natural logarithms. Impossible events use the
//! finite sentinel [`LOG_ZERO`] rather than `-inf`, so sums of several
//! impossible terms stay finite and comparable. Anything below
//! [`LOG_SMALL`] is treated as unreachable.

/// Sentinel for `ln(0)`.
pub const LOG_ZERO: f64 = -1.0e10;

/// Values below this are treated as `LOG_ZERO`.
pub const LOG_SMALL: f64 = -0.5e10;

/// Smallest argument for which `exp` does not underflow to zero.
pub const MIN_EXP_ARG: f64 = -708.3;

/// Smallest natural-domain probability whose logarithm is kept.
pub const MIN_LOG_ARG: f64 = 2.45e-308;

/// `ln(exp(x) + exp(y))` without overflow.
///
/// `LOG_ZERO` is the additive identity: `log_add(x, LOG_ZERO) == x` exactly.
pub fn log_add(x: f64, y: f64) -> f64 {
    let (hi, lo) = if x >= y { (x, y) } else { (y, x) };
    if is_negligible(hi) {
        return LOG_ZERO;
    }
    if is_negligible(lo) {
        return hi;
    }
    let diff = lo - hi;
    if diff < MIN_EXP_ARG {
        return hi;
    }
    hi + diff.exp().ln_1p()
}

/// Log-sum over any number of terms.
pub fn log_sum<I>(values: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    values.into_iter().fold(LOG_ZERO, log_add)
}

/// True when `x` is too small to contribute.
///
/// The cutoff sits far below any probability a real pattern can produce, so
/// skipping on it never drops mass that would show up in an occupancy sum.
#[inline]
pub fn is_negligible(x: f64) -> bool {
    x < LOG_SMALL
}

/// `exp(x)`, returning exactly zero once the result would underflow.
#[inline]
pub fn safe_exp(x: f64) -> f64 {
    if x < MIN_EXP_ARG {
        0.0
    } else {
        x.exp()
    }
}

/// `ln(x)`, clamped to `LOG_ZERO` at or below [`MIN_LOG_ARG`].
#[inline]
pub fn safe_ln(x: f64) -> f64 {
    if x <= MIN_LOG_ARG {
        LOG_ZERO
    } else {
        x.ln()
    }
}

/// Clamp a computed log value back to the sentinel once it is negligible.
#[inline]
pub(crate) fn clamp_log(x: f64) -> f64 {
    if is_negligible(x) {
        LOG_ZERO
    } else {
        x
    }
}
