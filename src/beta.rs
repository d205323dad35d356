use chrono::NaiveDate;
use itertools::Itertools;
use statrs::statistics::Statistics;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::RegressionError;

/// Two price series cut down to their common dates, ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedSeriesPair {
    pub dates: Vec<NaiveDate>,
    pub benchmark: Vec<f64>,
    pub asset: Vec<f64>,
}

/// One row of the return table; the first aligned date has no row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReturnRow {
    pub date: NaiveDate,
    pub benchmark_price: f64,
    pub asset_price: f64,
    pub benchmark_return: f64,
    pub asset_return: f64,
}

/// Simple OLS fit of asset returns on benchmark returns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Regression {
    pub slope: f64,
    pub intercept: f64,
    pub r: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BetaComputation {
    pub aligned: AlignedSeriesPair,
    pub returns: Vec<ReturnRow>,
    pub regression: Regression,
}

impl BetaComputation {
    pub fn beta(&self) -> f64 {
        self.regression.slope
    }
}

/// Intersect the date keys of both series. `None` when nothing overlaps.
pub fn align(
    benchmark: &BTreeMap<NaiveDate, f64>,
    asset: &BTreeMap<NaiveDate, f64>,
) -> Option<AlignedSeriesPair> {
    let b: BTreeSet<NaiveDate> = benchmark.keys().copied().collect();
    let a: BTreeSet<NaiveDate> = asset.keys().copied().collect();
    let dates: Vec<NaiveDate> = b.intersection(&a).copied().collect();
    if dates.is_empty() {
        return None;
    }
    Some(AlignedSeriesPair {
        benchmark: dates.iter().map(|d| benchmark[d]).collect(),
        asset: dates.iter().map(|d| asset[d]).collect(),
        dates,
    })
}

/// `p[i] / p[i-1] - 1` for `i >= 1`; one element shorter than `prices`.
pub fn simple_returns(prices: &[f64]) -> Vec<f64> {
    prices
        .iter()
        .tuple_windows()
        .map(|(prev, next)| next / prev - 1.0)
        .collect()
}

/// Ordinary least squares of `y` on `x`.
///
/// # Errors
/// `TooFewReturns` below two observations, `NonFinite` when any input or the
/// fit is NaN or infinite, `ZeroVariance` when `x` is constant.
pub fn linear_regression(x: &[f64], y: &[f64]) -> Result<Regression, RegressionError> {
    let n = x.len().min(y.len());
    if n < 2 {
        return Err(RegressionError::TooFewReturns(n));
    }
    let (x, y) = (&x[..n], &y[..n]);
    if x.iter().chain(y).any(|v| !v.is_finite()) {
        return Err(RegressionError::NonFinite);
    }
    let var_x = x.variance();
    if var_x == 0.0 {
        return Err(RegressionError::ZeroVariance);
    }
    let cov = x.covariance(y);
    let slope = cov / var_x;
    let intercept = y.mean() - slope * x.mean();
    if !slope.is_finite() || !intercept.is_finite() {
        return Err(RegressionError::NonFinite);
    }
    let var_y = y.variance();
    let r = if var_y > 0.0 {
        cov / (var_x.sqrt() * var_y.sqrt())
    } else {
        0.0
    };
    Ok(Regression {
        slope,
        intercept,
        r,
    })
}

/// Align, compute daily returns and regress asset on benchmark.
///
/// `Ok(None)` means the series share no dates.
pub fn compute_beta(
    benchmark: &BTreeMap<NaiveDate, f64>,
    asset: &BTreeMap<NaiveDate, f64>,
) -> Result<Option<BetaComputation>, RegressionError> {
    let Some(aligned) = align(benchmark, asset) else {
        return Ok(None);
    };
    let bench_ret = simple_returns(&aligned.benchmark);
    let asset_ret = simple_returns(&aligned.asset);
    let regression = linear_regression(&bench_ret, &asset_ret)?;

    let returns = (1..aligned.dates.len())
        .map(|i| ReturnRow {
            date: aligned.dates[i],
            benchmark_price: aligned.benchmark[i],
            asset_price: aligned.asset[i],
            benchmark_return: bench_ret[i - 1],
            asset_return: asset_ret[i - 1],
        })
        .collect();

    Ok(Some(BetaComputation {
        aligned,
        returns,
        regression,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(start: &str, prices: &[f64]) -> BTreeMap<NaiveDate, f64> {
        let d0 = NaiveDate::parse_from_str(start, "%Y-%m-%d").unwrap();
        prices
            .iter()
            .enumerate()
            .map(|(i, p)| (d0 + chrono::Duration::days(i as i64), *p))
            .collect()
    }

    #[test]
    fn identical_series_have_unit_beta() {
        let s = series("2024-01-01", &[100.0, 103.0, 99.5, 104.2, 101.0, 108.7]);
        let c = compute_beta(&s, &s).unwrap().unwrap();
        assert!((c.beta() - 1.0).abs() < 1e-12);
        assert!((c.regression.r - 1.0).abs() < 1e-12);
    }

    #[test]
    fn beta_matches_reference_value() {
        let bench = series("2024-01-01", &[100.0, 104.0, 101.0, 107.0, 105.0]);
        let asset = series("2024-01-01", &[50.0, 53.0, 50.5, 55.0, 53.9]);
        let c = compute_beta(&bench, &asset).unwrap().unwrap();
        assert!((c.beta() - 1.483_796_130_489_752_2).abs() < 1e-12);
        assert!((c.regression.intercept - 0.001_244_317_034_392_004_9).abs() < 1e-12);
        assert_eq!(c.returns.len(), 4);
    }

    #[test]
    fn first_row_is_dropped_not_zero_filled() {
        let bench = series("2024-01-01", &[100.0, 110.0, 121.0]);
        let asset = series("2024-01-01", &[50.0, 60.0, 66.0]);
        let aligned = align(&bench, &asset).unwrap();
        let b = simple_returns(&aligned.benchmark);
        let a = simple_returns(&aligned.asset);
        assert_eq!(b.len(), 2);
        assert!((b[0] - 0.10).abs() < 1e-12 && (b[1] - 0.10).abs() < 1e-12);
        assert!((a[0] - 0.20).abs() < 1e-12 && (a[1] - 0.10).abs() < 1e-12);
    }

    #[test]
    fn constant_benchmark_returns_are_a_regression_failure() {
        // 100 -> 110 -> 121 is +10% twice: no variance in the regressor.
        let bench = series("2024-01-01", &[100.0, 110.0, 121.0]);
        let asset = series("2024-01-01", &[50.0, 60.0, 66.0]);
        assert_eq!(compute_beta(&bench, &asset), Err(RegressionError::ZeroVariance));

        let flat = series("2024-01-01", &[100.0; 6]);
        let moving = series("2024-01-01", &[1.0, 2.0, 3.0, 2.0, 1.0, 5.0]);
        assert_eq!(compute_beta(&flat, &moving), Err(RegressionError::ZeroVariance));
    }

    #[test]
    fn zero_asset_price_is_not_a_valid_beta() {
        let bench = series("2024-01-01", &[100.0, 104.0, 101.0, 107.0, 105.0]);
        let asset = series("2024-01-01", &[1.0, 0.0, 2.0, 3.0, 2.5]);
        assert_eq!(compute_beta(&bench, &asset), Err(RegressionError::NonFinite));
    }

    #[test]
    fn zero_benchmark_price_is_non_finite_not_zero_variance() {
        let bench = series("2024-01-01", &[100.0, 0.0, 101.0, 107.0, 105.0]);
        let asset = series("2024-01-01", &[50.0, 53.0, 50.5, 55.0, 53.9]);
        assert_eq!(compute_beta(&bench, &asset), Err(RegressionError::NonFinite));
    }

    #[test]
    fn disjoint_dates_yield_none() {
        let bench = series("2024-01-01", &[1.0, 2.0, 3.0]);
        let asset = series("2024-02-01", &[1.0, 2.0, 3.0]);
        assert_eq!(compute_beta(&bench, &asset), Ok(None));
    }

    #[test]
    fn alignment_uses_only_common_dates() {
        let bench = series("2024-01-01", &[1.0, 2.0, 3.0, 4.0]);
        let asset = series("2024-01-03", &[10.0, 20.0, 30.0]);
        let aligned = align(&bench, &asset).unwrap();
        assert_eq!(aligned.dates.len(), 2);
        assert_eq!(aligned.benchmark, vec![3.0, 4.0]);
        assert_eq!(aligned.asset, vec![10.0, 20.0]);
    }

    #[test]
    fn single_return_is_too_few() {
        let bench = series("2024-01-01", &[1.0, 2.0]);
        assert_eq!(
            compute_beta(&bench, &bench),
            Err(RegressionError::TooFewReturns(1))
        );
    }
}
