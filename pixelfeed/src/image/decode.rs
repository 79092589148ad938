//! Image decoding

use super::{DecodedImage, EncodedImage, ImageFormat};
use crate::error::{Error, Result};

/// Decode an encoded image into 8-bit pixels.
///
/// The format comes from the magic bytes, never from the file name. Color
/// images come out in BGR(A) order; [`super::transform`] swaps them to RGB on
/// request.
pub fn decode(encoded: &EncodedImage) -> Result<DecodedImage> {
    let format = ImageFormat::detect(&encoded.data);

    if format == ImageFormat::Jpeg {
        check_jpeg_frame(encoded)?;
    }

    match format {
        ImageFormat::Jpeg | ImageFormat::Png => decode_pixels(encoded, format),
        ImageFormat::Unknown => Err(Error::decode(
            &encoded.origin,
            "unrecognized image signature",
        )),
    }
}

#[cfg(feature = "image-reader")]
fn decode_pixels(encoded: &EncodedImage, format: ImageFormat) -> Result<DecodedImage> {
    use imageproc::image::{self, DynamicImage};

    use super::ChannelOrder;

    let image_format = match format {
        ImageFormat::Jpeg => image::ImageFormat::Jpeg,
        _ => image::ImageFormat::Png,
    };

    let img = image::load_from_memory_with_format(&encoded.data, image_format)
        .map_err(|e| Error::decode(&encoded.origin, e))?;

    let (width, height) = (img.width(), img.height());
    let (data, order) = match img {
        DynamicImage::ImageLuma8(buf) => (buf.into_raw(), ChannelOrder::Gray),
        DynamicImage::ImageLumaA8(buf) => (buf.into_raw(), ChannelOrder::GrayAlpha),
        DynamicImage::ImageRgb8(buf) => {
            let mut data = buf.into_raw();
            swap_red_blue(&mut data, 3);
            (data, ChannelOrder::Bgr)
        }
        DynamicImage::ImageRgba8(buf) => {
            let mut data = buf.into_raw();
            swap_red_blue(&mut data, 4);
            (data, ChannelOrder::Bgra)
        }
        other => {
            return Err(Error::decode(
                &encoded.origin,
                format!("unsupported channel depth {:?}", other.color()),
            ))
        }
    };

    log::trace!(
        "Decoded {} ({format}): {width}x{height} {order}",
        encoded.origin
    );

    Ok(DecodedImage {
        data,
        width,
        height,
        order,
        origin: encoded.origin.clone(),
    })
}

#[cfg(not(feature = "image-reader"))]
fn decode_pixels(_encoded: &EncodedImage, _format: ImageFormat) -> Result<DecodedImage> {
    Err(Error::UnsupportedFeature("image reader"))
}

#[cfg(feature = "image-reader")]
fn swap_red_blue(data: &mut [u8], channels: usize) {
    for px in data.chunks_exact_mut(channels) {
        px.swap(0, 2);
    }
}

/// Frame parameters of a baseline or progressive JPEG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct JpegFrame {
    precision: u8,
    components: u8,
}

/// Reject JPEGs the pipeline cannot represent as 8-bit gray or color.
fn check_jpeg_frame(encoded: &EncodedImage) -> Result<()> {
    let Some(frame) = read_jpeg_frame(&encoded.data) else {
        // no frame header found, the decoder reports the exact problem
        return Ok(());
    };

    if frame.precision != 8 {
        return Err(Error::decode(
            &encoded.origin,
            format!("unsupported JPEG sample precision {}", frame.precision),
        ));
    }
    if frame.components != 1 && frame.components != 3 {
        return Err(Error::decode(
            &encoded.origin,
            format!(
                "unsupported JPEG color model with {} components (CMYK/YCCK)",
                frame.components
            ),
        ));
    }
    Ok(())
}

/// Walk the marker segments up to the first start-of-frame.
fn read_jpeg_frame(data: &[u8]) -> Option<JpegFrame> {
    let mut pos = 2;

    loop {
        // markers may be preceded by any number of 0xFF fill bytes
        while *data.get(pos)? != 0xFF {
            pos += 1;
        }
        while *data.get(pos)? == 0xFF {
            pos += 1;
        }
        let marker = *data.get(pos)?;
        pos += 1;

        match marker {
            // standalone markers without a length
            0x01 | 0xD0..=0xD8 => continue,
            // end of image or start of scan before any frame header
            0xD9 | 0xDA => return None,
            _ => {}
        }

        let len = u16::from_be_bytes([*data.get(pos)?, *data.get(pos + 1)?]) as usize;
        if len < 2 {
            return None;
        }

        let is_sof = matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_sof {
            let precision = *data.get(pos + 2)?;
            let components = *data.get(pos + 7)?;
            return Some(JpegFrame {
                precision,
                components,
            });
        }

        pos += len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sof_jpeg(components: u8) -> Vec<u8> {
        let mut data = vec![0xFF, 0xD8];
        // APP0 with a short payload
        data.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x04, 0xAA, 0xBB]);
        // SOF0: length, precision, height, width, components
        data.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x0B, 0x08, 0x00, 0x10, 0x00, 0x10]);
        data.push(components);
        data.extend_from_slice(&[0x01, 0x11, 0x00]);
        data
    }

    #[test]
    fn reads_frame_header_after_app_segment() {
        assert_eq!(
            read_jpeg_frame(&sof_jpeg(3)),
            Some(JpegFrame {
                precision: 8,
                components: 3
            })
        );
    }

    #[test]
    fn rejects_cmyk_jpeg() {
        let encoded = EncodedImage::new(sof_jpeg(4), "cmyk.jpg");
        let err = decode(&encoded).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }), "{err}");
        assert!(err.to_string().contains("CMYK"));
    }

    #[test]
    fn rejects_unknown_signature() {
        let encoded = EncodedImage::new(b"BM not a bitmap".to_vec(), "x.bmp");
        assert!(matches!(decode(&encoded), Err(Error::Decode { .. })));
    }

    #[cfg(feature = "image-reader")]
    #[test]
    fn truncated_png_is_a_decode_error() {
        let encoded = EncodedImage::new(super::super::PNG_MAGIC.to_vec(), "short.png");
        assert!(matches!(decode(&encoded), Err(Error::Decode { .. })));
    }
}
