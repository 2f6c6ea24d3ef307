//! Live heatmap window for a report stream.

use crate::error::{Result, TouchError};
use crate::report::{FrameStats, ReportFrame, ReportKind};
use crate::worker::Consumer;
use egui::{Align2, Color32, FontId, Painter, Pos2, Rect, Stroke, StrokeKind, Vec2};

pub const MAGENTA: Color32 = Color32::from_rgb(255, 0, 182);
pub const TEAL: Color32 = Color32::from_rgb(0, 213, 255);
pub const ORANGE: Color32 = Color32::from_rgb(255, 101, 0);

const MARGIN: f32 = 12.0;
const STATUS_HEIGHT: f32 = 24.0;

fn lerp(a: Color32, b: Color32, t: f32) -> Color32 {
    let t = t.clamp(0.0, 1.0);
    let mix = |x: u8, y: u8| (x as f32 + (y as f32 - x as f32) * t) as u8;
    Color32::from_rgb(mix(a.r(), b.r()), mix(a.g(), b.g()), mix(a.b(), b.b()))
}

/// Delta images diverge around zero (teal below, magenta above); raw
/// images run black to white across the frame's range.
pub fn cell_color(kind: ReportKind, value: i32, lo: i32, hi: i32) -> Color32 {
    match kind {
        ReportKind::Delta => {
            let span = lo.abs().max(hi.abs()).max(1) as f32;
            if value >= 0 {
                lerp(Color32::WHITE, MAGENTA, value as f32 / span)
            } else {
                lerp(Color32::WHITE, TEAL, -value as f32 / span)
            }
        }
        ReportKind::Raw => {
            let span = (hi - lo).max(1) as f32;
            lerp(Color32::BLACK, Color32::WHITE, (value - lo) as f32 / span)
        }
    }
}

pub fn draw_frame(painter: &Painter, area: Rect, frame: &ReportFrame) {
    let Some((lo, hi)) = frame.range() else {
        return;
    };
    if frame.rows == 0 || frame.cols == 0 {
        return;
    }
    let cell = (area.width() / frame.cols as f32).min(area.height() / frame.rows as f32);
    let size = Vec2::new(cell * frame.cols as f32, cell * frame.rows as f32);
    let corner = area.center() - size / 2.0;

    for row in 0..frame.rows {
        for col in 0..frame.cols {
            let Some(value) = frame.get(row, col) else {
                continue;
            };
            let min = Pos2::new(corner.x + col as f32 * cell, corner.y + row as f32 * cell);
            painter.rect_filled(
                Rect::from_min_size(min, Vec2::splat(cell)),
                0.0,
                cell_color(frame.kind, value, lo, hi),
            );
        }
    }
    painter.rect_stroke(
        Rect::from_min_size(corner, size),
        0.0,
        Stroke::new(1.0, ORANGE),
        StrokeKind::Outside,
    );
}

pub struct HeatmapApp {
    frames: Consumer<ReportFrame>,
    current: Option<ReportFrame>,
    stats: FrameStats,
}

impl HeatmapApp {
    pub fn new(frames: Consumer<ReportFrame>) -> Self {
        Self {
            frames,
            current: None,
            stats: FrameStats::default(),
        }
    }
}

impl eframe::App for HeatmapApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        // Dropping the ticket lets the worker fetch the next frame.
        if let Some(ticket) = self.frames.latest() {
            self.stats.update(&ticket);
            self.current = Some((*ticket).clone());
        }

        egui::CentralPanel::default()
            .frame(egui::Frame::NONE.fill(Color32::from_gray(32)))
            .show(ctx, |ui| {
                let painter = ui.painter();
                let full = ui.max_rect();
                let area = Rect::from_min_max(
                    full.min + Vec2::splat(MARGIN),
                    full.max - Vec2::new(MARGIN, MARGIN + STATUS_HEIGHT),
                );

                let status = match &self.current {
                    Some(frame) => {
                        draw_frame(painter, area, frame);
                        let (lo, hi) = frame.range().unwrap_or((0, 0));
                        format!(
                            "{:?} frame {}  {}x{}  min {} max {}  p2p {}",
                            frame.kind,
                            frame.index,
                            frame.rows,
                            frame.cols,
                            lo,
                            hi,
                            self.stats.peak_to_peak()
                        )
                    }
                    None => "waiting for frames".to_string(),
                };
                painter.text(
                    Pos2::new(full.center().x, full.max.y - MARGIN),
                    Align2::CENTER_BOTTOM,
                    status,
                    FontId::monospace(14.0),
                    Color32::LIGHT_GRAY,
                );
            });

        ctx.request_repaint();
    }
}

/// Block on the window until it is closed. The consumer is dropped with the
/// window, which releases a synchronous producer.
pub fn run_viewer(frames: Consumer<ReportFrame>, title: &str) -> Result<()> {
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([720.0, 480.0])
            .with_min_inner_size([320.0, 240.0])
            .with_title(title),
        ..Default::default()
    };
    eframe::run_native(
        "touchtest",
        options,
        Box::new(move |_cc| Ok(Box::new(HeatmapApp::new(frames)))),
    )
    .map_err(|e| TouchError::InvalidState(format!("viewer: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_colors_diverge() {
        assert_eq!(cell_color(ReportKind::Delta, 0, -10, 10), Color32::WHITE);
        assert_eq!(cell_color(ReportKind::Delta, 10, -10, 10), MAGENTA);
        assert_eq!(cell_color(ReportKind::Delta, -10, -10, 10), TEAL);
    }

    #[test]
    fn raw_colors_span_range() {
        assert_eq!(cell_color(ReportKind::Raw, 100, 100, 200), Color32::BLACK);
        assert_eq!(cell_color(ReportKind::Raw, 200, 100, 200), Color32::WHITE);
        // flat frame does not divide by zero
        assert_eq!(cell_color(ReportKind::Raw, 5, 5, 5), Color32::BLACK);
    }
}
