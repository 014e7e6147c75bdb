//! Peak detection on fitted diffusion spectra.
//!
//! A peak is a strict local maximum over the bin axis; plateaus of equal
//! values count once, at the plateau midpoint. The first and last bin can
//! never be peaks. Widths are measured at half the peak height with linear
//! interpolation between bins, in bin-index units.

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Peak {
    pub index: usize,
    pub height: f64,
}

/// All local maxima with height >= `min_height`, in ascending bin order.
pub fn find_peaks(y: &[f64], min_height: f64) -> Vec<Peak> {
    let mut peaks = vec![];
    let n = y.len();
    let mut i = 1;
    while n >= 3 && i < n - 1 {
        if y[i] <= y[i - 1] { i += 1; continue }
        // Climb across any plateau
        let mut ahead = i + 1;
        while ahead < n - 1 && y[ahead] == y[i] { ahead += 1 }
        if y[ahead] < y[i] {
            let index = (i + ahead - 1) / 2;
            if y[index] >= min_height {
                peaks.push(Peak { index, height: y[index] });
            }
        }
        i = ahead;
    }
    peaks
}

/// Full width at half maximum of the peak at `peak.index`, in bins.
///
/// Crossings are linearly interpolated; a flank that never drops below half
/// height is clamped at the array edge (boundary peaks get truncated widths).
pub fn width_half_max(y: &[f64], peak: Peak) -> f64 {
    let half = peak.height / 2.0;
    let n = y.len();

    let mut left = 0.0;
    let mut j = peak.index;
    while j > 0 {
        if y[j - 1] < half {
            left = (j - 1) as f64 + (half - y[j - 1]) / (y[j] - y[j - 1]);
            break;
        }
        j -= 1;
    }

    let mut right = (n - 1) as f64;
    let mut j = peak.index;
    while j < n - 1 {
        if y[j + 1] < half {
            right = j as f64 + (y[j] - half) / (y[j] - y[j + 1]);
            break;
        }
        j += 1;
    }

    right - left
}
