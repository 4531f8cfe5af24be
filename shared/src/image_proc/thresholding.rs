//! Threshold masks for excluding sources from background statistics.

use ndarray::{Array2, ArrayView2};

/// Apply threshold to an image
///
/// # Returns
/// * Boolean mask, `true` where the pixel is at or above `threshold`
pub fn apply_threshold(image: &ArrayView2<f64>, threshold: f64) -> Array2<bool> {
    image.mapv(|pixel| pixel >= threshold)
}

/// Grow every `true` region of a mask by a circular footprint of `radius` pixels.
pub fn dilate_mask(mask: &Array2<bool>, radius: f64) -> Array2<bool> {
    let (height, width) = mask.dim();
    let reach = radius.max(0.0).ceil() as isize;
    let r2 = radius * radius;

    let offsets: Vec<(isize, isize)> = (-reach..=reach)
        .flat_map(|dy| (-reach..=reach).map(move |dx| (dy, dx)))
        .filter(|&(dy, dx)| ((dy * dy + dx * dx) as f64) <= r2)
        .collect();

    let mut grown = mask.clone();
    for ((y, x), _) in mask.indexed_iter().filter(|(_, &set)| set) {
        for &(dy, dx) in &offsets {
            let (ny, nx) = (y as isize + dy, x as isize + dx);
            if ny >= 0 && nx >= 0 && (ny as usize) < height && (nx as usize) < width {
                grown[[ny as usize, nx as usize]] = true;
            }
        }
    }
    grown
}

/// Mask that is `true` within `radius` of `(x, y)`.
pub fn disc_mask(shape: (usize, usize), x: f64, y: f64, radius: f64) -> Array2<bool> {
    Array2::from_shape_fn(shape, |(row, col)| {
        let dx = col as f64 - x;
        let dy = row as f64 - y;
        dx * dx + dy * dy <= radius * radius
    })
}

/// Mask of pixels belonging to sources `nsigma` above `level`, grown by `grow_radius`.
pub fn source_mask(
    image: &ArrayView2<f64>,
    level: f64,
    noise: f64,
    nsigma: f64,
    grow_radius: f64,
) -> Array2<bool> {
    let detected = apply_threshold(image, level + nsigma * noise);
    dilate_mask(&detected, grow_radius)
}
