//! Application of registration transforms to channel sets.
//!
//! Output samples are pulled: for every point `p` of the target grid the
//! moving image is interpolated at `T(p)`, so the transform maps target
//! (fixed) space into the space of the images being resampled.

use crate::image::filter::{bin_shrink, project, shrink_geometry, ProjectionReduction};
use crate::image::interp::{sample_nearest, LinearStencil};
use crate::image::{ChannelSet, Geometry, Image};
use crate::trace::{trace_event, trace_span};
use crate::transform::Transform;
use crate::util::par::for_each_row;
use crate::util::{PanelRegError, PanelRegResult};
use nalgebra::Vector3;

mod blend;

pub use blend::Blend;

/// Sample interpolation kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Interpolation {
    /// Linear (bi- or trilinear) interpolation.
    #[default]
    Linear,
    /// Nearest sample.
    Nearest,
}

/// Projection of resampled volumes to 2D.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Projection {
    /// Axis to collapse; `None` picks the axis of smallest physical extent.
    pub axis: Option<usize>,
    /// Reduction along the collapsed axis.
    pub reduction: ProjectionReduction,
}

/// How resampled channels are returned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum OutputMode {
    /// One image per channel, in input order.
    #[default]
    Separate,
    /// All channels blended into one image.
    Combine(Blend),
    /// RGB preview of the first and last channel sets.
    Fusion,
}

/// Resampling parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ResampleConfig {
    /// Interpolation kernel.
    pub interpolation: Interpolation,
    /// Apply the inverse transform.
    pub invert: bool,
    /// In-plane bin factor applied to the target grid and inputs.
    pub bin: usize,
    /// Optional projection to 2D after transformation.
    pub projection: Option<Projection>,
    /// Output arrangement.
    pub output: OutputMode,
    /// Value for target samples mapping outside the input.
    pub default_value: f32,
}

impl Default for ResampleConfig {
    fn default() -> Self {
        Self {
            interpolation: Interpolation::Linear,
            invert: false,
            bin: 1,
            projection: None,
            output: OutputMode::Separate,
            default_value: 0.0,
        }
    }
}

impl ResampleConfig {
    /// Checks parameter ranges.
    pub fn validate(&self) -> PanelRegResult<()> {
        if self.bin == 0 {
            return Err(PanelRegError::InvalidConfig {
                reason: "resample bin must be >= 1",
            });
        }
        if let Some(Projection { axis: Some(axis), .. }) = self.projection {
            if axis > 2 {
                return Err(PanelRegError::InvalidConfig {
                    reason: "projection axis must be 0, 1 or 2",
                });
            }
        }
        if !self.default_value.is_finite() {
            return Err(PanelRegError::InvalidConfig {
                reason: "default value must be finite",
            });
        }
        Ok(())
    }
}

/// Result of a resampling call.
#[derive(Clone, Debug, PartialEq)]
pub enum Resampled {
    /// One image per input channel.
    Separate(Vec<Image>),
    /// Single blended image.
    Combined(Image),
    /// Red, green and blue planes in `[0, 255]`.
    Fusion([Image; 3]),
}

impl Resampled {
    /// Returns every output image in order.
    pub fn images(&self) -> Vec<&Image> {
        match self {
            Resampled::Separate(images) => images.iter().collect(),
            Resampled::Combined(image) => vec![image],
            Resampled::Fusion(planes) => planes.iter().collect(),
        }
    }
}

/// Applies transforms to channel sets.
#[derive(Clone, Debug, Default)]
pub struct Resampler {
    config: ResampleConfig,
}

impl Resampler {
    /// Creates a resampler.
    pub fn new(config: ResampleConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ResampleConfig {
        &self.config
    }

    /// Resamples every channel of `sets` onto `target`.
    ///
    /// In `Fusion` mode the first set is the reference and is resampled with
    /// the identity; every other set uses the transform.
    pub fn resample(
        &self,
        transform: &Transform,
        target: &Geometry,
        sets: &[&ChannelSet],
    ) -> PanelRegResult<Resampled> {
        let _span = trace_span!("resample", sets = sets.len()).entered();
        self.config.validate()?;
        if sets.is_empty() {
            return Err(PanelRegError::EmptyChannelSet);
        }
        if transform.dim() != target.dim() {
            return Err(PanelRegError::ResampleGeometryMismatch {
                transform_dim: transform.dim(),
                grid_dim: target.dim(),
            });
        }
        for set in sets {
            if set.geometry().dim() != target.dim() {
                return Err(PanelRegError::ResampleGeometryMismatch {
                    transform_dim: set.geometry().dim(),
                    grid_dim: target.dim(),
                });
            }
        }

        let transform = if self.config.invert {
            transform.inverse()?
        } else {
            transform.clone()
        };
        let identity = Transform::identity(transform.family(), transform.dim());
        let bin = [self.config.bin, self.config.bin, 1];
        let (grid, _) = shrink_geometry(target, bin);
        let interpolation = self.config.interpolation;
        let default_value = self.config.default_value;

        let mut per_set: Vec<Vec<Image>> = Vec::with_capacity(sets.len());
        for (set_idx, set) in sets.iter().enumerate() {
            let t = if set_idx == 0 && self.config.output == OutputMode::Fusion {
                &identity
            } else {
                &transform
            };
            let mut warped = Vec::with_capacity(set.len());
            for channel in set.channels() {
                let binned = bin_shrink(channel, bin);
                let mut out = warp_image(&binned, &grid, t, interpolation, default_value);
                if let Some(projection) = self.config.projection {
                    out = project_if_volume(&out, projection)?;
                }
                warped.push(out);
            }
            per_set.push(warped);
        }
        trace_event!(
            "resampled",
            channels = per_set.iter().map(Vec::len).sum::<usize>()
        );

        match self.config.output {
            OutputMode::Separate => Ok(Resampled::Separate(
                per_set.into_iter().flatten().collect(),
            )),
            OutputMode::Combine(mode) => {
                let channels: Vec<Image> = per_set.into_iter().flatten().collect();
                Ok(Resampled::Combined(blend::combine(&channels, mode)))
            }
            OutputMode::Fusion => {
                let first = per_set.first().ok_or(PanelRegError::EmptyChannelSet)?;
                let last = per_set.last().ok_or(PanelRegError::EmptyChannelSet)?;
                Ok(Resampled::Fusion(blend::fuse(first, last)))
            }
        }
    }
}

fn project_if_volume(image: &Image, projection: Projection) -> PanelRegResult<Image> {
    let geometry = image.geometry();
    if geometry.dim() != 3 {
        return Ok(image.clone());
    }
    let axis = projection
        .axis
        .unwrap_or_else(|| smallest_extent_axis(geometry));
    project(image, axis, projection.reduction)
}

/// Axis with the smallest physical extent (lowest index on ties).
pub fn smallest_extent_axis(geometry: &Geometry) -> usize {
    (0..geometry.dim())
        .min_by(|&a, &b| geometry.extent(a).total_cmp(&geometry.extent(b)))
        .unwrap_or(0)
}

/// Resamples `image` onto `target` by sampling `image` at `transform(p)`.
pub fn warp_image(
    image: &Image,
    target: &Geometry,
    transform: &Transform,
    interpolation: Interpolation,
    default_value: f32,
) -> Image {
    let source = image.geometry();
    let src = image.data();
    let (m, o) = transform.homogeneous();
    let [nx, ny, _] = target.size3();
    let mut data = vec![default_value; target.num_samples()];
    for_each_row(&mut data, nx, |row, dst| {
        let y = row % ny;
        let z = row / ny;
        for (x, value) in dst.iter_mut().enumerate() {
            let p = target.index_to_physical(&Vector3::new(x as f64, y as f64, z as f64));
            let q = m * p + o;
            let idx = source.physical_to_index(&q);
            let sample = match interpolation {
                Interpolation::Linear => LinearStencil::at(source, &idx).map(|s| s.apply(src)),
                Interpolation::Nearest => sample_nearest(source, src, &idx),
            };
            if let Some(v) = sample {
                *value = v;
            }
        }
    });
    Image::from_parts(data, target.clone())
}

#[cfg(test)]
mod tests {
    use super::{
        smallest_extent_axis, warp_image, Interpolation, OutputMode, Projection, ResampleConfig,
        Resampled, Resampler,
    };
    use crate::image::{ChannelSet, Encoding, Geometry, Image};
    use crate::transform::Transform;
    use crate::util::PanelRegError;

    #[test]
    fn translation_shifts_content() {
        let geom = Geometry::unit(&[8, 8]).unwrap();
        let img = Image::from_fn(geom.clone(), |x, y, _| (x + 10 * y) as f32);
        let t = Transform::translation(&[2.0, 1.0]).unwrap();
        let out = warp_image(&img, &geom, &t, Interpolation::Linear, -1.0);
        assert_eq!(out.get(0, 0, 0), Some(12.0));
        assert_eq!(out.get(7, 0, 0), Some(-1.0));
    }

    #[test]
    fn dimension_mismatch_is_reported() {
        let geom = Geometry::unit(&[8, 8]).unwrap();
        let set = ChannelSet::single(Image::filled(geom.clone(), 1.0));
        let t = Transform::translation(&[0.0, 0.0, 0.0]).unwrap();
        let err = Resampler::default().resample(&t, &geom, &[&set]).unwrap_err();
        assert_eq!(
            err,
            PanelRegError::ResampleGeometryMismatch {
                transform_dim: 3,
                grid_dim: 2
            }
        );
    }

    #[test]
    fn projection_defaults_to_thinnest_axis() {
        let geom = Geometry::unit(&[16, 12, 4]).unwrap();
        assert_eq!(smallest_extent_axis(&geom), 2);
        let set = ChannelSet::new(
            vec![
                Image::from_fn(geom.clone(), |x, _, z| (x + z) as f32),
                Image::filled(geom.clone(), 2.0),
            ],
            Encoding::Float,
        )
        .unwrap();
        let resampler = Resampler::new(ResampleConfig {
            projection: Some(Projection::default()),
            ..ResampleConfig::default()
        });
        let t = Transform::translation(&[0.0, 0.0, 0.0]).unwrap();
        match resampler.resample(&t, &geom, &[&set]).unwrap() {
            Resampled::Separate(images) => {
                assert_eq!(images.len(), 2);
                assert_eq!(images[0].geometry().size(), &[16, 12]);
                assert_eq!(images[0].get(5, 3, 0), Some(8.0));
            }
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn binning_shrinks_target_in_plane() {
        let geom = Geometry::unit(&[16, 16, 6]).unwrap();
        let set = ChannelSet::single(Image::filled(geom.clone(), 1.0));
        let resampler = Resampler::new(ResampleConfig {
            bin: 4,
            ..ResampleConfig::default()
        });
        let t = Transform::translation(&[0.0, 0.0, 0.0]).unwrap();
        let out = resampler.resample(&t, &geom, &[&set]).unwrap();
        assert_eq!(out.images()[0].geometry().size(), &[4, 4, 6]);
        assert!(Resampler::new(ResampleConfig {
            bin: 0,
            ..ResampleConfig::default()
        })
        .resample(&t, &geom, &[&set])
        .is_err());
    }

    #[test]
    fn fusion_keeps_reference_unmoved() {
        let geom = Geometry::unit(&[8, 8]).unwrap();
        let fixed = ChannelSet::single(Image::from_fn(geom.clone(), |x, _, _| x as f32));
        let moving = ChannelSet::single(Image::from_fn(geom.clone(), |x, _, _| x as f32));
        let resampler = Resampler::new(ResampleConfig {
            output: OutputMode::Fusion,
            ..ResampleConfig::default()
        });
        let t = Transform::translation(&[1.0, 0.0]).unwrap();
        match resampler.resample(&t, &geom, &[&fixed, &moving]).unwrap() {
            Resampled::Fusion([r, g, b]) => {
                assert!((r.get(7, 0, 0).unwrap() - 255.0).abs() < 1e-3);
                assert!(r.get(0, 0, 0).unwrap().abs() < 1e-3);
                assert!(g.get(6, 0, 0).unwrap() > r.get(6, 0, 0).unwrap());
                let expected = 0.5 * (r.get(3, 2, 0).unwrap() + g.get(3, 2, 0).unwrap());
                assert!((b.get(3, 2, 0).unwrap() - expected).abs() < 1e-3);
            }
            other => panic!("unexpected output {other:?}"),
        }
    }
}
