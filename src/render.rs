//! Overlay drawing on top of the live frame.
//!
//! The renderer takes one overlay snapshot per capture iteration and draws it onto the
//! current frame: a hollow rectangle per detection and a dark panel behind the frame
//! rate readout. Text rasterisation belongs to the display; the renderer hands back
//! the strings with their anchor points.

use crate::detect::DetectionBox;
use crate::frame::Frame;
use crate::overlay::OverlaySnapshot;

pub const BOX_COLOUR: [u8; 3] = [0, 255, 0];
pub const PANEL_COLOUR: [u8; 3] = [0, 0, 0];

/// Frame-rate panel, `(left, top, right, bottom)`.
const RATE_PANEL: (i64, i64, i64, i64) = (10, 15, 100, 35);
const RATE_ANCHOR: (i32, i32) = (20, 30);

/// A string to draw and where its baseline starts.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayText {
    pub text: String,
    pub x: i32,
    pub y: i32,
}

#[derive(Clone, Debug)]
pub struct OverlayRenderer {
    thickness: u32,
}

impl Default for OverlayRenderer {
    fn default() -> Self {
        Self { thickness: 2 }
    }
}

impl OverlayRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thickness(thickness: u32) -> Self {
        Self {
            thickness: thickness.max(1),
        }
    }

    /// Draw `snapshot` onto `frame`. Box labels come first (detection order), the
    /// frame-rate readout last.
    pub fn render(&self, frame: &mut Frame, snapshot: &OverlaySnapshot) -> Vec<OverlayText> {
        let mut texts = Vec::with_capacity(snapshot.result.boxes.len() + 1);
        for detection in &snapshot.result.boxes {
            let (x0, y0, x1, y1) = detection.clamped(frame.width(), frame.height());
            self.stroke_rect(frame, x0 as i64, y0 as i64, x1 as i64, y1 as i64);
            texts.push(OverlayText {
                text: box_label(detection),
                x: detection.left.max(0),
                y: (detection.top - 5).max(0),
            });
        }

        let (left, top, right, bottom) = RATE_PANEL;
        fill_rect(frame, left, top, right, bottom, PANEL_COLOUR);
        texts.push(OverlayText {
            text: rate_label(snapshot.frame_rate),
            x: RATE_ANCHOR.0,
            y: RATE_ANCHOR.1,
        });
        texts
    }

    fn stroke_rect(&self, frame: &mut Frame, x0: i64, y0: i64, x1: i64, y1: i64) {
        let t = self.thickness as i64;
        fill_rect(frame, x0, y0, x1, y0 + t - 1, BOX_COLOUR);
        fill_rect(frame, x0, y1 - t + 1, x1, y1, BOX_COLOUR);
        fill_rect(frame, x0, y0, x0 + t - 1, y1, BOX_COLOUR);
        fill_rect(frame, x1 - t + 1, y0, x1, y1, BOX_COLOUR);
    }
}

/// `"<label> <confidence to 2 decimals>"`.
pub fn box_label(detection: &DetectionBox) -> String {
    format!("{} {:.2}", detection.label, detection.confidence)
}

pub fn rate_label(frame_rate: f64) -> String {
    format!("{:.2} fps", frame_rate)
}

/// Inclusive fill; pixels outside the frame are skipped.
fn fill_rect(frame: &mut Frame, x0: i64, y0: i64, x1: i64, y1: i64, rgb: [u8; 3]) {
    let x_end = x1.min(frame.width() as i64 - 1);
    let y_end = y1.min(frame.height() as i64 - 1);
    for y in y0.max(0)..=y_end {
        for x in x0.max(0)..=x_end {
            frame.put_pixel(x, y, rgb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{DetectionResult, Timings};

    const WHITE: [u8; 3] = [255, 255, 255];

    fn snapshot_with(boxes: Vec<DetectionBox>, frame_rate: f64) -> OverlaySnapshot {
        OverlaySnapshot::new(DetectionResult::new(boxes, Timings::default()), frame_rate, 0)
    }

    #[test]
    fn empty_overlay_draws_only_rate_panel() {
        let mut frame = Frame::filled(160, 120, WHITE);
        let texts = OverlayRenderer::new().render(&mut frame, &OverlaySnapshot::default());

        assert_eq!(
            texts,
            vec![OverlayText {
                text: "0.00 fps".into(),
                x: 20,
                y: 30
            }]
        );
        assert_eq!(frame.pixel(50, 25), Some(PANEL_COLOUR));
        assert_eq!(frame.pixel(150, 100), Some(WHITE));
    }

    #[test]
    fn boxes_are_hollow_and_labelled() {
        let mut frame = Frame::filled(160, 120, WHITE);
        let snapshot = snapshot_with(vec![DetectionBox::new("dog", 0.8261, 110, 50, 150, 100)], 3.33);
        let texts = OverlayRenderer::new().render(&mut frame, &snapshot);

        assert_eq!(texts[0].text, "dog 0.83");
        assert_eq!((texts[0].x, texts[0].y), (110, 45));
        assert_eq!(texts[1].text, "3.33 fps");
        assert_eq!(frame.pixel(110, 50), Some(BOX_COLOUR));
        assert_eq!(frame.pixel(150, 100), Some(BOX_COLOUR));
        assert_eq!(frame.pixel(130, 75), Some(WHITE));
    }

    #[test]
    fn out_of_frame_boxes_are_clamped() {
        let mut frame = Frame::filled(64, 48, WHITE);
        let snapshot = snapshot_with(vec![DetectionBox::new("car", 0.5, -20, -20, 500, 500)], 1.0);
        let texts = OverlayRenderer::with_thickness(1).render(&mut frame, &snapshot);

        assert_eq!((texts[0].x, texts[0].y), (0, 0));
        assert_eq!(frame.pixel(0, 47), Some(BOX_COLOUR));
        assert_eq!(frame.pixel(63, 0), Some(BOX_COLOUR));
        assert_eq!(frame.pixel(63, 47), Some(BOX_COLOUR));
    }
}
