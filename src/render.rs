//! Frame annotation and JPEG encoding.
//!
use std::io::Cursor;

use anyhow::Result;
use bytes::Bytes;
use image::{codecs::jpeg::JpegEncoder, Rgb, RgbImage};
use imageproc::{
    drawing::{draw_hollow_rect, draw_text},
    rect::Rect,
};
use lazy_static::lazy_static;

use crate::nn::Detection;

/// JPEG quality for streamed frames and annotated results.
const JPEG_QUALITY: u8 = 70;

lazy_static! {
    /// Label font, loaded at first use. Without the font file, boxes are
    /// drawn without text labels.
    static ref LABEL_FONT: Option<rusttype::Font<'static>> = {
        match std::fs::read("resources/DejaVuSansMono.ttf") {
            Ok(font_data) => rusttype::Font::try_from_vec(font_data),
            Err(_) => {
                log::warn!("resources/DejaVuSansMono.ttf not found, drawing boxes without labels");
                None
            }
        }
    };
}

/// Draw bounding boxes with class labels and confidence scores on the frame.
pub fn draw_detections(mut frame: RgbImage, detections: &[Detection]) -> RgbImage {
    let (width, height) = frame.dimensions();
    let (width, height) = (width as f32, height as f32);

    let color = Rgb::from([0, 255, 0]);

    for detection in detections.iter() {
        // Coordinates of top-left and bottom-right points
        // Coordinate frame basis is on the top left corner
        let (x_tl, y_tl) = (detection.bbox[0] * width, detection.bbox[1] * height);
        let (x_br, y_br) = (detection.bbox[2] * width, detection.bbox[3] * height);
        let rect_width = (x_br - x_tl).max(1.0);
        let rect_height = (y_br - y_tl).max(1.0);

        let rect =
            Rect::at(x_tl as i32, y_tl as i32).of_size(rect_width as u32, rect_height as u32);

        frame = draw_hollow_rect(&frame, rect, color);
        if let Some(font) = LABEL_FONT.as_ref() {
            frame = draw_text(
                &frame,
                color,
                x_tl as i32,
                y_tl as i32,
                rusttype::Scale { x: 16.0, y: 16.0 },
                font,
                &format!(
                    "{} {:.0}%",
                    detection.label(),
                    detection.confidence * 100.0
                ),
            );
        }
    }

    frame
}

/// Encode an RGB frame as JPEG.
pub fn encode_jpeg(frame: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());

    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY).encode(
        frame.as_raw(),
        frame.width(),
        frame.height(),
        image::ColorType::Rgb8,
    )?;

    Ok(buf.into_inner())
}

/// Wrap a JPEG payload in the multipart boundary frame consumed by browsers
/// as one element of a `multipart/x-mixed-replace` feed.
pub fn as_jpeg_stream_item(data: &[u8]) -> Bytes {
    Bytes::from(
        [
            "--frame\r\nContent-Type: image/jpeg\r\n\r\n".as_bytes(),
            data,
            "\r\n".as_bytes(),
        ]
        .concat(),
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nn::Detection;

    #[test]
    fn encoded_frame_is_valid_jpeg() {
        let frame = RgbImage::from_pixel(32, 24, Rgb([120, 10, 200]));

        let jpeg = encode_jpeg(&frame).unwrap();

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.to_rgb8().dimensions(), (32, 24));
    }

    #[test]
    fn stream_item_is_boundary_framed() {
        let item = as_jpeg_stream_item(&[0xAA, 0xBB]);

        assert!(item.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(item.ends_with(b"\xAA\xBB\r\n"));
    }

    #[test]
    fn drawing_keeps_frame_dimensions() {
        let frame = RgbImage::from_pixel(64, 48, Rgb([0, 0, 0]));
        let detections = vec![Detection {
            bbox: [0.25, 0.25, 0.75, 0.75],
            class_id: 0,
            confidence: 0.9,
        }];

        let annotated = draw_detections(frame, &detections);

        assert_eq!(annotated.dimensions(), (64, 48));
        // The hollow rect must have touched at least one pixel
        assert!(annotated.pixels().any(|p| *p == Rgb([0, 255, 0])));
    }
}
