//! Channel combination and RGB fusion.

use crate::image::filter::rescale_unit;
use crate::image::Image;

/// Rule used to merge rescaled channels into one image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Blend {
    /// White-ink compositing: each channel `v` is drawn over the running
    /// result with alpha `v`, so `out = v + (1 - v) · out`. Two half-bright
    /// channels give 0.75.
    #[default]
    Overlay,
    /// Sum of rescaled channels.
    Sum,
    /// Per-sample maximum of rescaled channels.
    Max,
}

/// Rescales every channel to `[0, 1]` and merges them.
///
/// All channels must share one geometry.
pub(crate) fn combine(channels: &[Image], mode: Blend) -> Image {
    let geometry = channels[0].geometry().clone();
    let n = geometry.num_samples();
    let mut out = vec![0.0f32; n];
    for channel in channels {
        let scaled = rescale_unit(channel.data());
        for (acc, &v) in out.iter_mut().zip(scaled.iter()) {
            *acc = match mode {
                Blend::Overlay => v + (1.0 - v) * *acc,
                Blend::Sum => *acc + v,
                Blend::Max => acc.max(v),
            };
        }
    }
    Image::from_parts(out, geometry)
}

/// RGB planes `[first, second, (first + second) / 2]` in `[0, 255]`.
///
/// Each side is the per-sample maximum over its channels.
pub(crate) fn fuse(first: &[Image], second: &[Image]) -> [Image; 3] {
    let geometry = first[0].geometry().clone();
    let red = scaled_max(first);
    let green = scaled_max(second);
    let blue: Vec<f32> = red
        .iter()
        .zip(green.iter())
        .map(|(r, g)| 0.5 * (r + g))
        .collect();
    [
        Image::from_parts(red, geometry.clone()),
        Image::from_parts(green, geometry.clone()),
        Image::from_parts(blue, geometry),
    ]
}

fn scaled_max(channels: &[Image]) -> Vec<f32> {
    let n = channels[0].data().len();
    let mut acc = vec![f32::NEG_INFINITY; n];
    for channel in channels {
        for (a, &v) in acc.iter_mut().zip(channel.data().iter()) {
            *a = a.max(v);
        }
    }
    rescale_unit(&acc).into_iter().map(|v| v * 255.0).collect()
}

#[cfg(test)]
mod tests {
    use super::{combine, Blend};
    use crate::image::{Geometry, Image};

    #[test]
    fn blend_modes() {
        let geom = Geometry::unit(&[3, 1]).unwrap();
        let a = Image::new(vec![0.0, 1.0, 2.0], geom.clone()).unwrap();
        let b = Image::new(vec![2.0, 0.0, 1.0], geom).unwrap();
        let channels = [a, b];
        assert_eq!(combine(&channels, Blend::Sum).data(), &[1.0, 0.5, 1.5]);
        assert_eq!(combine(&channels, Blend::Max).data(), &[1.0, 0.5, 1.0]);
        let over = combine(&channels, Blend::Overlay);
        assert_eq!(over.data()[0], 1.0);
        assert_eq!(over.data()[1], 0.5);
        assert!((over.data()[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn overlay_composites_half_intensities_to_three_quarters() {
        let geom = Geometry::unit(&[3, 1]).unwrap();
        let ramp = Image::new(vec![0.0, 1.0, 2.0], geom).unwrap();
        let over = combine(&[ramp.clone(), ramp], Blend::Overlay);
        assert_eq!(over.data(), &[0.0, 0.75, 1.0]);
    }
}
