//! Synthetic detector data.
//!
//! Spectra are a Gaussian peak drifting across the channel range; images are
//! a checkerboard background with a hotspot orbiting the centre. Both carry
//! per-sample noise derived from the frame number, so consecutive frames
//! differ but a given frame is reproducible.

/// glibc LCG, reproducible across platforms.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fffffff
}

/// Noise in `[-amplitude, amplitude)` for sample `idx` of frame `frame_num`.
fn noise(frame_num: u64, idx: usize, amplitude: f64) -> f64 {
    let seed = prng(frame_num.wrapping_mul(2654435761) ^ idx as u64);
    ((seed & 0xFFF) as f64 / 2048.0 - 1.0) * amplitude
}

/// One spectrum of `len` channels.
///
/// The peak centre walks one channel per frame and wraps; its height is 1000
/// counts over a background of 50.
pub fn spectrum(len: usize, frame_num: u64) -> Vec<f64> {
    if len == 0 {
        return Vec::new();
    }
    let centre = (frame_num % len as u64) as f64;
    let sigma = (len as f64 / 20.0).max(1.0);
    (0..len)
        .map(|i| {
            let d = i as f64 - centre;
            let peak = 1000.0 * (-d * d / (2.0 * sigma * sigma)).exp();
            (50.0 + peak + noise(frame_num, i, 5.0)).max(0.0)
        })
        .collect()
}

/// One row-major `width * height` image.
pub fn image(width: usize, height: usize, frame_num: u64) -> Vec<f64> {
    let mut buffer = vec![0.0; width * height];
    if width == 0 || height == 0 {
        return buffer;
    }

    let checker = (width.min(height) / 8).max(1);
    let cx = width as f64 / 2.0;
    let cy = height as f64 / 2.0;
    let orbit = width.min(height) as f64 / 4.0;
    let angle = (frame_num as f64 * 0.05) % (2.0 * std::f64::consts::PI);
    let hx = cx + orbit * angle.cos();
    let hy = cy + orbit * angle.sin();
    let sigma = (width.min(height) as f64 / 10.0).max(1.0);

    for y in 0..height {
        for x in 0..width {
            let idx = y * width + x;
            let base = if ((x / checker) + (y / checker)) % 2 == 0 {
                100.0
            } else {
                120.0
            };
            let dx = x as f64 - hx;
            let dy = y as f64 - hy;
            let hotspot = 2000.0 * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
            buffer[idx] = (base + hotspot + noise(frame_num, idx, 8.0)).max(0.0);
        }
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(spectrum(128, 0).len(), 128);
        assert_eq!(image(16, 8, 0).len(), 128);
        assert!(spectrum(0, 3).is_empty());
    }

    #[test]
    fn test_spectrum_peak_moves() {
        let argmax = |v: &[f64]| {
            v.iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
        };
        assert_eq!(argmax(&spectrum(64, 10)), Some(10));
        assert_eq!(argmax(&spectrum(64, 70)), Some(6));
    }

    #[test]
    fn test_frames_differ_but_replay() {
        assert_ne!(image(32, 32, 0), image(32, 32, 1));
        assert_eq!(image(32, 32, 5), image(32, 32, 5));
    }
}
