//! Scan math: locate features in acquired x/y data.
//!
//! These helpers back the scan's convenience methods (`peak`, `trough`,
//! `com`, `cen`, `fwhm`): given the positions of an axis and the values of
//! a counter, find the position of the maximum or minimum, the center of
//! mass, or the center and width at half maximum.

use crate::error::{ScanError, ScanResult};

fn check_input(x: &[f64], y: &[f64]) -> ScanResult<()> {
    if x.is_empty() || y.is_empty() {
        return Err(ScanError::Acquisition("no data to analyze".into()));
    }
    if x.len() != y.len() {
        return Err(ScanError::Acquisition(format!(
            "axis and counter lengths differ ({} vs {})",
            x.len(),
            y.len()
        )));
    }
    Ok(())
}

/// Axis position of the maximum counter value.
pub fn peak(x: &[f64], y: &[f64]) -> ScanResult<f64> {
    check_input(x, y)?;
    let mut best = 0;
    for (i, value) in y.iter().enumerate() {
        if *value > y[best] {
            best = i;
        }
    }
    Ok(x[best])
}

/// Axis position of the minimum counter value.
pub fn trough(x: &[f64], y: &[f64]) -> ScanResult<f64> {
    check_input(x, y)?;
    let mut worst = 0;
    for (i, value) in y.iter().enumerate() {
        if *value < y[worst] {
            worst = i;
        }
    }
    Ok(x[worst])
}

/// Center of mass of the counter values along the axis.
pub fn com(x: &[f64], y: &[f64]) -> ScanResult<f64> {
    check_input(x, y)?;
    let weight: f64 = y.iter().sum();
    if weight == 0.0 {
        return Err(ScanError::Acquisition(
            "center of mass undefined for all-zero data".into(),
        ));
    }
    Ok(x.iter().zip(y).map(|(xi, yi)| xi * yi).sum::<f64>() / weight)
}

/// Center and full width at half maximum, from the half-maximum crossings
/// around the peak (linear interpolation between samples).
pub fn cen(x: &[f64], y: &[f64]) -> ScanResult<(f64, f64)> {
    check_input(x, y)?;
    let mut peak_idx = 0;
    let mut min = y[0];
    for (i, value) in y.iter().enumerate() {
        if *value > y[peak_idx] {
            peak_idx = i;
        }
        if *value < min {
            min = *value;
        }
    }
    let half = min + (y[peak_idx] - min) / 2.0;

    let crossing = |a: usize, b: usize| -> f64 {
        let (xa, xb, ya, yb) = (x[a], x[b], y[a], y[b]);
        if (yb - ya).abs() < f64::EPSILON {
            xa
        } else {
            xa + (half - ya) * (xb - xa) / (yb - ya)
        }
    };

    let mut left = x[0];
    for i in (1..=peak_idx).rev() {
        if y[i - 1] <= half && y[i] >= half {
            left = crossing(i - 1, i);
            break;
        }
    }
    let mut right = x[x.len() - 1];
    for i in peak_idx..x.len() - 1 {
        if y[i] >= half && y[i + 1] <= half {
            right = crossing(i + 1, i);
            break;
        }
    }

    Ok(((left + right) / 2.0, (right - left).abs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> (Vec<f64>, Vec<f64>) {
        // Peak of 4 at x=2, symmetric.
        (
            vec![0.0, 1.0, 2.0, 3.0, 4.0],
            vec![0.0, 2.0, 4.0, 2.0, 0.0],
        )
    }

    #[test]
    fn test_peak_and_trough() {
        let (x, y) = triangle();
        assert_eq!(peak(&x, &y).expect("peak"), 2.0);
        assert_eq!(trough(&x, &y).expect("trough"), 0.0);
    }

    #[test]
    fn test_com_symmetric() {
        let (x, y) = triangle();
        assert!((com(&x, &y).expect("com") - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_cen_symmetric_triangle() {
        let (x, y) = triangle();
        let (center, fwhm) = cen(&x, &y).expect("cen");
        assert!((center - 2.0).abs() < 1e-12);
        assert!((fwhm - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_mismatched_lengths_rejected() {
        assert!(peak(&[0.0, 1.0], &[1.0]).is_err());
        assert!(com(&[], &[]).is_err());
    }

    #[test]
    fn test_com_all_zero_is_undefined() {
        assert!(com(&[0.0, 1.0], &[0.0, 0.0]).is_err());
    }
}
