//! Signal-to-noise ratio from the CCD equation.

/// SNR of an aperture measurement in electrons.
///
/// ```text
/// S / sqrt(max(S, 0) + n_pix * (sigma_bkg * gain)^2 + n_pix * read_noise^2)
/// ```
///
/// where `S = flux * gain`. `flux` and `background_noise` are in counts,
/// `read_noise` in electrons.
pub fn snr_electrons(
    flux: f64,
    n_pix: f64,
    background_noise: f64,
    gain: f64,
    read_noise: f64,
) -> f64 {
    let signal = flux * gain;
    let variance = signal.max(0.0)
        + n_pix * (background_noise * gain).powi(2)
        + n_pix * read_noise.powi(2);
    if variance > 0.0 {
        signal / variance.sqrt()
    } else if signal > 0.0 {
        f64::INFINITY
    } else {
        0.0
    }
}
