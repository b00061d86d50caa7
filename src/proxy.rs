//! Reduction of a channel set to a single registration proxy image.

use crate::image::filter::bin_shrink;
use crate::image::{ChannelSet, Image};
use crate::util::{PanelRegError, PanelRegResult};

/// Per-sample reduction across channels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Reduction {
    /// Brightest channel wins.
    #[default]
    Max,
    /// Sum of channels.
    Sum,
    /// Mean of channels.
    Mean,
    /// Median of channels (mean of the two middle values for even counts).
    Median,
}

/// Proxy construction parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ProxyConfig {
    /// Channel reduction.
    pub reduction: Reduction,
    /// In-plane bin factor; 1 keeps full resolution.
    pub shrink: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            reduction: Reduction::Max,
            shrink: 1,
        }
    }
}

impl ProxyConfig {
    /// Checks parameter ranges.
    pub fn validate(&self) -> PanelRegResult<()> {
        if self.shrink == 0 {
            return Err(PanelRegError::InvalidConfig {
                reason: "proxy shrink must be >= 1",
            });
        }
        Ok(())
    }
}

/// Builds a scalar proxy normalized to the encoding's range.
pub fn build_proxy(channels: &ChannelSet, config: &ProxyConfig) -> PanelRegResult<Image> {
    config.validate()?;
    let first = channels
        .channels()
        .first()
        .ok_or(PanelRegError::EmptyChannelSet)?;
    let scale = 1.0 / channels.encoding().max_value();
    let n = first.data().len();
    let count = channels.len();

    let mut scratch = Vec::with_capacity(count);
    let mut data = Vec::with_capacity(n);
    for i in 0..n {
        scratch.clear();
        scratch.extend(channels.channels().iter().map(|c| c.data()[i] * scale));
        data.push(reduce(&mut scratch, config.reduction));
    }
    let proxy = Image::new(data, first.geometry().clone())?;
    if config.shrink > 1 {
        Ok(bin_shrink(&proxy, [config.shrink, config.shrink, 1]))
    } else {
        Ok(proxy)
    }
}

fn reduce(values: &mut [f32], reduction: Reduction) -> f32 {
    match reduction {
        Reduction::Max => values.iter().copied().fold(f32::NEG_INFINITY, f32::max),
        Reduction::Sum => values.iter().sum(),
        Reduction::Mean => values.iter().sum::<f32>() / values.len() as f32,
        Reduction::Median => {
            values.sort_by(|a, b| a.total_cmp(b));
            let mid = values.len() / 2;
            if values.len() % 2 == 0 {
                0.5 * (values[mid - 1] + values[mid])
            } else {
                values[mid]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{build_proxy, ProxyConfig, Reduction};
    use crate::image::{ChannelSet, Encoding, Geometry, Image};

    fn set() -> ChannelSet {
        let geom = Geometry::unit(&[4, 4]).unwrap();
        let a = Image::filled(geom.clone(), 51.0);
        let b = Image::filled(geom.clone(), 255.0);
        let c = Image::filled(geom, 102.0);
        ChannelSet::new(vec![a, b, c], Encoding::U8).unwrap()
    }

    #[test]
    fn reductions_normalize_by_encoding() {
        let check = |reduction: Reduction, expected: f32| {
            let cfg = ProxyConfig {
                reduction,
                shrink: 1,
            };
            let proxy = build_proxy(&set(), &cfg).unwrap();
            assert!((proxy.data()[0] - expected).abs() < 1e-5, "{reduction:?}");
        };
        check(Reduction::Max, 1.0);
        check(Reduction::Sum, 1.6);
        check(Reduction::Mean, 1.6 / 3.0);
        check(Reduction::Median, 0.4);
    }

    #[test]
    fn shrink_bins_in_plane() {
        let cfg = ProxyConfig {
            reduction: Reduction::Max,
            shrink: 2,
        };
        let proxy = build_proxy(&set(), &cfg).unwrap();
        assert_eq!(proxy.geometry().size(), &[2, 2]);
        assert_eq!(proxy.geometry().spacing(), &[2.0, 2.0]);
        assert!(build_proxy(&set(), &ProxyConfig { shrink: 0, ..cfg }).is_err());
    }
}
