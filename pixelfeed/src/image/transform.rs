//! Image transformations: channel conversion, resizing, center cropping

use fast_image_resize as fr;
use fr::images::Image as FrImage;

use super::{ChannelOrder, DecodedImage};
use crate::error::{Error, Result};
use crate::params::ImageParams;

/// Bring a decoded image to the configured channel count and geometry.
///
/// Channels are converted first so the resizer only touches the channels
/// that end up in the tensor.
pub fn transform(img: DecodedImage, params: &ImageParams) -> Result<DecodedImage> {
    let img = convert_channels(img, params.channels(), params.to_rgb)?;

    match params.resize {
        Some(edge) => resize_and_crop(img, edge, params.height(), params.width()),
        None => {
            if img.height != params.height() || img.width != params.width() {
                let (height, width) = (img.height, img.width);
                return Err(shape_mismatch(&img, params.height(), params.width(), height, width));
            }
            Ok(img)
        }
    }
}

/// Convert the channel layout.
///
/// Without `to_rgb` the channel count must already match. With it, any
/// layout converts to gray (1), RGB (3) or RGBA (4).
pub fn convert_channels(img: DecodedImage, target: u32, to_rgb: bool) -> Result<DecodedImage> {
    let mismatch = |img: &DecodedImage| Error::ChannelMismatch {
        origin: img.origin.clone(),
        expected: target,
        actual: img.channels(),
    };

    if !to_rgb {
        if img.channels() == target {
            return Ok(img);
        }
        return Err(mismatch(&img));
    }

    let order = match target {
        1 => ChannelOrder::Gray,
        3 => ChannelOrder::Rgb,
        4 => ChannelOrder::Rgba,
        _ => return Err(mismatch(&img)),
    };
    if img.order == order {
        return Ok(img);
    }

    let src_channels = img.channels() as usize;
    let pixels = img.width as usize * img.height as usize;
    let mut data = Vec::with_capacity(pixels * target as usize);

    for px in img.data.chunks_exact(src_channels) {
        let [r, g, b, a] = to_rgba(img.order, px);
        match order {
            ChannelOrder::Gray => data.push(luma(r, g, b)),
            ChannelOrder::Rgb => data.extend_from_slice(&[r, g, b]),
            _ => data.extend_from_slice(&[r, g, b, a]),
        }
    }

    Ok(DecodedImage {
        data,
        order,
        ..img
    })
}

#[inline(always)]
fn to_rgba(order: ChannelOrder, px: &[u8]) -> [u8; 4] {
    match order {
        ChannelOrder::Gray => [px[0], px[0], px[0], 255],
        ChannelOrder::GrayAlpha => [px[0], px[0], px[0], px[1]],
        ChannelOrder::Bgr => [px[2], px[1], px[0], 255],
        ChannelOrder::Bgra => [px[2], px[1], px[0], px[3]],
        ChannelOrder::Rgb => [px[0], px[1], px[2], 255],
        ChannelOrder::Rgba => [px[0], px[1], px[2], px[3]],
    }
}

/// ITU-R BT.601 luma in integer arithmetic.
#[inline(always)]
fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((299 * r as u32 + 587 * g as u32 + 114 * b as u32 + 500) / 1000) as u8
}

/// Scale so the shorter edge equals `edge`, keeping the aspect ratio, then
/// cut the centered `height x width` window out of the result.
pub fn resize_and_crop(
    img: DecodedImage,
    edge: u32,
    height: u32,
    width: u32,
) -> Result<DecodedImage> {
    let (new_width, new_height) = scaled_dimensions(img.width, img.height, edge);

    if new_width < width || new_height < height {
        return Err(shape_mismatch(&img, height, width, new_height, new_width));
    }

    let img = if (new_width, new_height) == (img.width, img.height) {
        img
    } else {
        resize_image(img, new_width, new_height)?
    };

    Ok(center_crop(img, height, width))
}

fn scaled_dimensions(width: u32, height: u32, edge: u32) -> (u32, u32) {
    let scale = |long: u32, short: u32| -> u32 {
        let scaled = (long as f64 * edge as f64 / short as f64).round() as u32;
        scaled.max(1)
    };

    if width <= height {
        (edge, scale(height, width))
    } else {
        (scale(width, height), edge)
    }
}

fn pixel_type(order: ChannelOrder) -> fr::PixelType {
    match order.channels() {
        1 => fr::PixelType::U8,
        2 => fr::PixelType::U8x2,
        3 => fr::PixelType::U8x3,
        _ => fr::PixelType::U8x4,
    }
}

/// Bilinear resize. Alpha is treated as an ordinary channel so results only
/// depend on the input bytes.
fn resize_image(img: DecodedImage, new_width: u32, new_height: u32) -> Result<DecodedImage> {
    let pixel_type = pixel_type(img.order);
    let channels = img.channels() as usize;
    let origin = img.origin;

    let src_image = FrImage::from_vec_u8(img.width, img.height, img.data, pixel_type)
        .map_err(|e| Error::decode(&origin, format!("invalid pixel buffer: {e}")))?;

    let mut dst_buffer = vec![0u8; new_width as usize * new_height as usize * channels];
    let mut dst_image = FrImage::from_slice_u8(new_width, new_height, &mut dst_buffer, pixel_type)
        .map_err(|e| Error::decode(&origin, format!("invalid pixel buffer: {e}")))?;

    let options = fr::ResizeOptions::new()
        .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear))
        .use_alpha(false);

    let mut resizer = fr::Resizer::new();
    resizer
        .resize(&src_image, &mut dst_image, Some(&options))
        .map_err(|e| Error::decode(&origin, format!("resize failed: {e}")))?;
    drop(dst_image);

    Ok(DecodedImage {
        data: dst_buffer,
        width: new_width,
        height: new_height,
        order: img.order,
        origin,
    })
}

fn center_crop(img: DecodedImage, height: u32, width: u32) -> DecodedImage {
    if img.width == width && img.height == height {
        return img;
    }

    let channels = img.channels() as usize;
    let x0 = ((img.width - width) / 2) as usize;
    let y0 = ((img.height - height) / 2) as usize;
    let src_row = img.width as usize * channels;
    let dst_row = width as usize * channels;

    let mut data = Vec::with_capacity(dst_row * height as usize);
    for row in img.data.chunks_exact(src_row).skip(y0).take(height as usize) {
        let start = x0 * channels;
        data.extend_from_slice(&row[start..start + dst_row]);
    }

    DecodedImage {
        data,
        width,
        height,
        ..img
    }
}

fn shape_mismatch(
    img: &DecodedImage,
    expected_height: u32,
    expected_width: u32,
    actual_height: u32,
    actual_width: u32,
) -> Error {
    Error::ShapeMismatch {
        origin: img.origin.clone(),
        expected_height,
        expected_width,
        actual_height,
        actual_width,
    }
}
