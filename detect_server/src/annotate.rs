//! Drawing detections onto frames.
//!
use std::path::Path;

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_hollow_rect_mut, draw_text_mut},
    rect::Rect,
};
use rusttype::{Font, Scale};

use crate::nn::Detection;

const BOX_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_THICKNESS: u32 = 2;
const TEXT_SCALE: f32 = 28.0;

/// Load a TrueType font to write on frames.
pub fn load_font(path: impl AsRef<Path>) -> Result<Font<'static>> {
    let path = path.as_ref();
    let font_data = std::fs::read(path)
        .with_context(|| format!("failed to read font {}", path.display()))?;
    Font::try_from_vec(font_data).with_context(|| format!("invalid font {}", path.display()))
}

/// Draw all detections of `target_class` and write their count on the frame.
///
/// Boxes are normalized and get scaled to the frame size. Without a font only the boxes are drawn.
/// Returns the number of detections of `target_class`.
pub fn count_and_draw(
    frame: &mut RgbImage,
    detections: &[Detection],
    target_class: usize,
    label: &str,
    font: Option<&Font>,
) -> usize {
    let (width, height) = frame.dimensions();

    let mut count = 0;
    for detection in detections.iter().filter(|d| d.class_id == target_class) {
        count += 1;
        if let Some(rect) = to_rect(&detection.bbox, width, height) {
            draw_thick_rect(frame, rect, BOX_THICKNESS, BOX_COLOR);
        }
    }

    if let Some(font) = font {
        draw_text_mut(
            frame,
            TEXT_COLOR,
            10,
            10,
            Scale::uniform(TEXT_SCALE),
            font,
            &format!("{label}: {count}"),
        );
    }

    count
}

/// Scale a normalized bounding box to a pixel rectangle inside a `width`×`height` frame.
fn to_rect(bbox: &[f32; 4], width: u32, height: u32) -> Option<Rect> {
    let (width, height) = (width as f32, height as f32);

    // Coordinate frame basis is on the top left corner
    let (x_tl, y_tl) = (bbox[0] * width, bbox[1] * height);
    let (x_br, y_br) = (
        (bbox[2] * width).min(width),
        (bbox[3] * height).min(height),
    );
    let rect_width = (x_br - x_tl).round();
    let rect_height = (y_br - y_tl).round();
    if rect_width < 1.0 || rect_height < 1.0 {
        return None;
    }

    Some(Rect::at(x_tl as i32, y_tl as i32).of_size(rect_width as u32, rect_height as u32))
}

/// Draw a hollow rectangle with borders growing inwards.
fn draw_thick_rect(frame: &mut RgbImage, rect: Rect, thickness: u32, color: Rgb<u8>) {
    for offset in 0..thickness {
        if rect.width() <= 2 * offset || rect.height() <= 2 * offset {
            break;
        }
        let inner = Rect::at(rect.left() + offset as i32, rect.top() + offset as i32)
            .of_size(rect.width() - 2 * offset, rect.height() - 2 * offset);
        draw_hollow_rect_mut(frame, inner, color);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

    fn detection(bbox: [f32; 4], class_id: usize) -> Detection {
        Detection {
            bbox,
            confidence: 0.9,
            class_id,
        }
    }

    #[test]
    fn only_target_class_is_counted_and_drawn() {
        let mut frame = RgbImage::new(100, 100);
        let detections = vec![
            detection([0.2, 0.2, 0.6, 0.6], 0),
            detection([0.7, 0.7, 0.9, 0.9], 2),
        ];

        let count = count_and_draw(&mut frame, &detections, 0, "People Count", None);

        assert_eq!(count, 1);
        assert_eq!(frame[(20, 20)], BOX_COLOR);
        assert_eq!(frame[(21, 21)], BOX_COLOR);
        assert_eq!(frame[(59, 40)], BOX_COLOR);
        assert_eq!(frame[(22, 22)], BLACK);
        assert_eq!(frame[(40, 40)], BLACK);
        assert_eq!(frame[(70, 70)], BLACK);
    }

    #[test]
    fn boxes_scale_with_frame_size() {
        let mut frame = RgbImage::new(200, 100);
        count_and_draw(
            &mut frame,
            &[detection([0.5, 0.5, 1.0, 1.0], 0)],
            0,
            "People Count",
            None,
        );

        assert_eq!(frame[(100, 50)], BOX_COLOR);
        assert_eq!(frame[(199, 99)], BOX_COLOR);
        assert_eq!(frame[(99, 49)], BLACK);
    }

    #[test]
    fn degenerate_boxes_are_counted_but_not_drawn() {
        let mut frame = RgbImage::new(50, 50);
        let count = count_and_draw(
            &mut frame,
            &[detection([0.5, 0.5, 0.5, 0.5], 0)],
            0,
            "People Count",
            None,
        );

        assert_eq!(count, 1);
        assert!(frame.pixels().all(|p| *p == BLACK));
    }

    #[test]
    fn invalid_font_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.ttf");
        std::fs::write(&path, b"not a font").unwrap();

        assert!(load_font(&path).is_err());
        assert!(load_font(dir.path().join("missing.ttf")).is_err());
    }
}
