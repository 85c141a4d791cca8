//! Annotated copies of captured images.
//!
//! Boxes are drawn with imageproc; labels use a built-in 5x7 bitmap font so
//! no font file has to ship with the daemon.

use anyhow::{anyhow, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::detect::Detection;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const LABEL_BG: Rgb<u8> = Rgb([0, 0, 0]);
const LABEL_FG: Rgb<u8> = Rgb([0, 255, 0]);
const GLYPH_ADVANCE: i32 = 6;
const LABEL_HEIGHT: i32 = 9;

/// Render detections onto a copy of `source` and encode it as JPEG.
pub fn render_annotated(source: &RgbImage, detections: &[Detection], quality: u8) -> Result<Vec<u8>> {
    let mut canvas = source.clone();
    draw_detections(&mut canvas, detections);

    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(&canvas)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

pub fn draw_detections(canvas: &mut RgbImage, detections: &[Detection]) {
    if canvas.width() == 0 || canvas.height() == 0 {
        return;
    }
    let max_x = (canvas.width() - 1) as f32;
    let max_y = (canvas.height() - 1) as f32;

    for det in detections {
        let left = det.bbox.x_min.clamp(0.0, max_x).round() as i32;
        let top = det.bbox.y_min.clamp(0.0, max_y).round() as i32;
        let right = det.bbox.x_max.clamp(0.0, max_x).round() as i32;
        let bottom = det.bbox.y_max.clamp(0.0, max_y).round() as i32;
        let w = (right - left + 1).max(1) as u32;
        let h = (bottom - top + 1).max(1) as u32;
        draw_hollow_rect_mut(canvas, Rect::at(left, top).of_size(w, h), BOX_COLOR);
    }

    // Labels go on after every box so a box never covers a label.
    for det in detections {
        let left = det.bbox.x_min.clamp(0.0, max_x).round() as i32;
        let top = det.bbox.y_min.clamp(0.0, max_y).round() as i32;
        let text = label_text(det);
        let text_width = text.chars().count() as i32 * GLYPH_ADVANCE + 1;
        let label_y = if top >= LABEL_HEIGHT { top - LABEL_HEIGHT } else { top };
        draw_filled_rect_mut(
            canvas,
            Rect::at(left, label_y).of_size(text_width as u32, LABEL_HEIGHT as u32),
            LABEL_BG,
        );
        draw_text(canvas, left + 1, label_y + 1, &text, LABEL_FG);
    }
}

pub fn label_text(det: &Detection) -> String {
    format!("{} {:.0}%", det.label.to_uppercase(), det.confidence * 100.0)
}

fn draw_text(canvas: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let (width, height) = (canvas.width() as i32, canvas.height() as i32);
    for ch in text.chars() {
        let glyph = glyph_bits(ch).unwrap_or(UNKNOWN_GLYPH);
        for (row, pattern) in glyph.iter().enumerate() {
            let py = y + row as i32;
            if py < 0 || py >= height {
                continue;
            }
            for col in 0..5 {
                let px = x + col;
                if (pattern >> (4 - col)) & 1 == 1 && px >= 0 && px < width {
                    canvas.put_pixel(px as u32, py as u32, color);
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

const UNKNOWN_GLYPH: [u8; 7] = [0x0E, 0x11, 0x01, 0x02, 0x04, 0x00, 0x04];

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1E],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1E, 0x01, 0x01, 0x0E, 0x01, 0x01, 0x1E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        '%' => [0x11, 0x12, 0x04, 0x08, 0x12, 0x11, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x06, 0x06],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        ' ' => [0x00; 7],
        _ => return None,
    };
    Some(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    #[test]
    fn label_uses_percent_confidence() {
        let det = Detection::new("mosquito", 0.873, BoundingBox::new(0.0, 0.0, 1.0, 1.0));
        assert_eq!(label_text(&det), "MOSQUITO 87%");
    }

    #[test]
    fn boxes_are_drawn_on_a_copy() {
        let source = RgbImage::new(64, 48);
        let det = Detection::new("cat", 0.9, BoundingBox::new(10.0, 20.0, 40.0, 40.0));
        let mut canvas = source.clone();
        draw_detections(&mut canvas, &[det.clone()]);
        assert_eq!(*canvas.get_pixel(25, 40), BOX_COLOR);
        assert_eq!(*canvas.get_pixel(30, 30), Rgb([0, 0, 0]));

        let jpeg = render_annotated(&source, &[det], 90).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        // Source stays untouched.
        assert!(source.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }

    #[test]
    fn boxes_outside_the_image_are_clamped() {
        let mut canvas = RgbImage::new(16, 16);
        let det = Detection::new("cat", 0.5, BoundingBox::new(-50.0, -50.0, 500.0, 500.0));
        draw_detections(&mut canvas, &[det]);
        assert_eq!(*canvas.get_pixel(15, 15), BOX_COLOR);
    }

    #[test]
    fn unknown_characters_fall_back() {
        assert!(glyph_bits('~').is_none());
        let mut canvas = RgbImage::new(8, 8);
        draw_text(&mut canvas, 0, 0, "~", LABEL_FG);
        assert_eq!(*canvas.get_pixel(2, 6), LABEL_FG);
    }
}
