//! Convenience helpers for loading and saving channels via the `image` crate.
//!
//! Available when the `image-io` feature is enabled. Files carry no physical
//! metadata, so loaded images get unit spacing unless the caller overrides it.

use crate::image::{ChannelSet, Encoding, Geometry, Image};
use crate::util::{PanelRegError, PanelRegResult};
use std::path::Path;

fn io_error(err: impl std::fmt::Display) -> PanelRegError {
    PanelRegError::ImageIo {
        reason: err.to_string(),
    }
}

/// Converts a decoded image into a 2D channel, keeping its bit depth.
pub fn image_from_dynamic(img: &image::DynamicImage) -> PanelRegResult<(Image, Encoding)> {
    let width = img.width() as usize;
    let height = img.height() as usize;
    let geometry = Geometry::unit(&[width, height])?;
    let (data, encoding) = match img {
        image::DynamicImage::ImageLuma8(gray) => (
            gray.as_raw().iter().map(|&v| v as f32).collect(),
            Encoding::U8,
        ),
        image::DynamicImage::ImageLuma16(_) | image::DynamicImage::ImageRgb16(_) => (
            img.to_luma16().as_raw().iter().map(|&v| v as f32).collect(),
            Encoding::U16,
        ),
        image::DynamicImage::ImageRgb32F(_) => (
            img.to_luma32f().into_raw(),
            Encoding::Float,
        ),
        _ => (
            img.to_luma8().as_raw().iter().map(|&v| v as f32).collect(),
            Encoding::U8,
        ),
    };
    Ok((Image::new(data, geometry)?, encoding))
}

/// Loads a single 2D channel from disk.
pub fn load_gray_image<P: AsRef<Path>>(path: P) -> PanelRegResult<(Image, Encoding)> {
    let img = image::open(path).map_err(io_error)?;
    image_from_dynamic(&img)
}

/// Loads one file per channel into a validated channel set.
///
/// The encoding is taken from the first file.
pub fn load_channel_set<P: AsRef<Path>>(paths: &[P]) -> PanelRegResult<ChannelSet> {
    let mut channels = Vec::with_capacity(paths.len());
    let mut encoding = None;
    for path in paths {
        let (image, enc) = load_gray_image(path)?;
        encoding.get_or_insert(enc);
        channels.push(image);
    }
    ChannelSet::new(channels, encoding.unwrap_or_default())
}

/// Loads equally sized 2D slices and stacks them along z.
pub fn load_stack<P: AsRef<Path>>(paths: &[P]) -> PanelRegResult<(Image, Encoding)> {
    let first = paths.first().ok_or(PanelRegError::EmptyChannelSet)?;
    let (base, encoding) = load_gray_image(first)?;
    if paths.len() == 1 {
        return Ok((base, encoding));
    }
    let size = base.geometry().size().to_vec();
    let mut data = base.into_data();
    for (index, path) in paths.iter().enumerate().skip(1) {
        let (slice, _) = load_gray_image(path)?;
        if slice.geometry().size() != size.as_slice() {
            return Err(PanelRegError::ChannelMismatch {
                index,
                reason: "stack slice shape differs",
            });
        }
        data.extend_from_slice(slice.data());
    }
    let geometry = Geometry::unit(&[size[0], size[1], paths.len()])?;
    Ok((Image::new(data, geometry)?, encoding))
}

/// Saves a 2D image as 8-bit grayscale, clamping to `[0, 255]`.
pub fn save_gray_u8<P: AsRef<Path>>(image: &Image, path: P) -> PanelRegResult<()> {
    let (width, height) = plane_size(image)?;
    let raw: Vec<u8> = image
        .data()
        .iter()
        .map(|&v| v.round().clamp(0.0, 255.0) as u8)
        .collect();
    let buf = image::GrayImage::from_raw(width, height, raw)
        .ok_or_else(|| io_error("buffer does not fit image size"))?;
    buf.save(path).map_err(io_error)
}

fn plane_size(image: &Image) -> PanelRegResult<(u32, u32)> {
    let geometry = image.geometry();
    if geometry.dim() != 2 {
        return Err(PanelRegError::InvalidDimension {
            dim: geometry.dim(),
        });
    }
    Ok((geometry.size()[0] as u32, geometry.size()[1] as u32))
}

/// Saves three planes as an interleaved 8-bit RGB image.
pub fn save_rgb_u8<P: AsRef<Path>>(planes: [&Image; 3], path: P) -> PanelRegResult<()> {
    let (width, height) = plane_size(planes[0])?;
    let n = planes[0].geometry().num_samples();
    let mut raw = Vec::with_capacity(n * 3);
    for i in 0..n {
        for plane in planes.iter() {
            let v = plane.data().get(i).copied().unwrap_or(0.0);
            raw.push(v.round().clamp(0.0, 255.0) as u8);
        }
    }
    let buf = image::RgbImage::from_raw(width, height, raw)
        .ok_or_else(|| io_error("buffer does not fit image size"))?;
    buf.save(path).map_err(io_error)
}
