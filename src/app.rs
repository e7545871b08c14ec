use crate::board::{Board, Card};
use crate::config::Config;
use crate::data::{DeviceSnapshot, LoadLevel, TemperatureLevel};
use crate::monitor::MonitorError;
use crate::sampler::{SamplerHandle, SamplerPhase, SnapshotSink};
use crate::schedule::{Deferred, Periodic};
use crate::self_memory::SelfMemoryReporter;
use crossbeam_channel::{Receiver, Sender};
use egui::{Color32, RichText, Stroke};
use egui_plot::{Line, Plot, PlotPoints};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

const GREEN: Color32 = Color32::from_rgb(0x2e, 0xcc, 0x71);
const ORANGE: Color32 = Color32::from_rgb(0xf3, 0x9c, 0x12);
const RED: Color32 = Color32::from_rgb(0xe7, 0x4c, 0x3c);
const RISING: Color32 = Color32::from_rgb(0x34, 0x98, 0xdb);

/// Forwards snapshot lists to the UI and wakes it up.
///
/// The egui context only exists once the window is open, so it is filled in
/// later through a shared slot.
pub struct RepaintSink {
    sender: Sender<Vec<DeviceSnapshot>>,
    ctx: Arc<OnceLock<egui::Context>>,
}

impl RepaintSink {
    pub fn new(sender: Sender<Vec<DeviceSnapshot>>, ctx: Arc<OnceLock<egui::Context>>) -> Self {
        Self { sender, ctx }
    }
}

impl SnapshotSink for RepaintSink {
    fn publish(&mut self, snapshots: Vec<DeviceSnapshot>) -> Result<(), MonitorError> {
        self.sender.publish(snapshots)?;
        if let Some(ctx) = self.ctx.get() {
            ctx.request_repaint();
        }
        Ok(())
    }
}

pub struct OverlayApp {
    receiver: Receiver<Vec<DeviceSnapshot>>,
    sampler: SamplerHandle,
    board: Board,
    self_memory: SelfMemoryReporter,
    memory_timer: Periodic,
    app_memory_mb: f64,
    title_bar: Deferred,
}

impl OverlayApp {
    pub fn new(
        cc: &eframe::CreationContext<'_>,
        config: &Config,
        receiver: Receiver<Vec<DeviceSnapshot>>,
        sampler: SamplerHandle,
        ctx_slot: Arc<OnceLock<egui::Context>>,
    ) -> Self {
        let _ = ctx_slot.set(cc.egui_ctx.clone());

        let mut style = (*cc.egui_ctx.style()).clone();
        style.visuals.dark_mode = true;
        cc.egui_ctx.set_style(style);

        let self_memory = SelfMemoryReporter::detect();
        if !self_memory.is_available() {
            log::info!("App memory will not be shown");
        }

        Self {
            receiver,
            sampler,
            board: Board::new(),
            self_memory,
            memory_timer: Periodic::new(config.self_memory_interval),
            app_memory_mb: 0.0,
            title_bar: Deferred::new(Instant::now(), config.title_bar_delay),
        }
    }

    fn drain_snapshots(&mut self) {
        while let Ok(snapshots) = self.receiver.try_recv() {
            self.board.apply(snapshots, chrono::Local::now());
        }
    }

    fn run_timers(&mut self, ctx: &egui::Context, now: Instant) {
        if self.memory_timer.due(now) {
            self.app_memory_mb = self.self_memory.resident_mb();
        }
        if self.title_bar.fire(now) {
            log::debug!("Hiding window decorations");
            ctx.send_viewport_cmd(egui::ViewportCommand::Decorations(false));
        }

        let mut next = self.memory_timer.remaining(now);
        if let Some(title) = self.title_bar.remaining(now) {
            next = next.min(title);
        }
        ctx.request_repaint_after(next.max(Duration::from_millis(50)));
    }
}

fn load_color(percent: f64) -> Color32 {
    match LoadLevel::from_percent(percent) {
        LoadLevel::Low => GREEN,
        LoadLevel::Medium => ORANGE,
        LoadLevel::High => RED,
    }
}

fn temperature_color(level: TemperatureLevel) -> Color32 {
    match level {
        TemperatureLevel::Normal => GREEN,
        TemperatureLevel::Warm => ORANGE,
        TemperatureLevel::Hot => RED,
    }
}

fn bar(ui: &mut egui::Ui, percent: f64, text: String, color: Color32) {
    let fraction = (percent / 100.0).clamp(0.0, 1.0) as f32;
    ui.add(
        egui::ProgressBar::new(fraction)
            .desired_width(110.0)
            .text(text)
            .fill(color),
    );
}

fn card_tooltip(card: &Card) -> String {
    let snap = &card.snapshot;
    let mut lines = vec![
        format!(
            "GPU: {}% | Memory bandwidth: {}%",
            snap.utilization_compute, snap.utilization_memory_bandwidth
        ),
        format!(
            "VRAM: {} / {} MB ({:.1}%)",
            snap.memory_used_mb,
            snap.memory_total_mb,
            snap.memory_percent()
        ),
    ];
    if snap.power_limit_w > 0.0 {
        lines.push(format!(
            "Power: {:.1}W / {:.1}W",
            snap.power_usage_w, snap.power_limit_w
        ));
    }
    lines.extend(snap.fan_label());
    lines.push(format!("Processes: {}", snap.processes.len()));
    if let (true, Some(baseline)) = (card.rising, card.baseline_c) {
        lines.push(format!("Heating up since {baseline}°C"));
    }
    lines.join("\n")
}

fn temperature_sparkline(ui: &mut egui::Ui, index: u32, history: &[u32], color: Color32) {
    let points: PlotPoints = history
        .iter()
        .enumerate()
        .map(|(i, t)| [i as f64, f64::from(*t)])
        .collect();
    Plot::new(("temperature_history", index))
        .width(80.0)
        .height(25.0)
        .show_axes(false)
        .show_x(false)
        .show_y(false)
        .allow_drag(false)
        .allow_zoom(false)
        .allow_scroll(false)
        .show(ui, |plot_ui| {
            plot_ui.line(Line::new("Temperature (°C)", points).color(color));
        });
}

fn draw_card(ui: &mut egui::Ui, card: &Card, history: &[u32]) {
    let snap = &card.snapshot;
    let mut frame = egui::Frame::group(ui.style());
    if card.rising {
        frame = frame.stroke(Stroke::new(2.0, RISING));
    }

    let response = frame
        .show(ui, |ui| {
            ui.horizontal(|ui| {
                ui.label(
                    RichText::new(format!("GPU {}: {}", snap.index, snap.name))
                        .size(14.0)
                        .strong(),
                );

                let util = f64::from(snap.utilization_compute);
                bar(ui, util, format!("GPU: {util:.0}%"), load_color(util));

                let mem = snap.memory_percent();
                bar(ui, mem, snap.memory_label(), load_color(mem));

                let temp_color = temperature_color(snap.temperature_level());
                bar(
                    ui,
                    f64::from(snap.temperature_c.min(100)),
                    format!("{}°C", snap.temperature_c),
                    temp_color,
                );

                let power = snap.power_percent();
                let power_text = if snap.power_limit_w > 0.0 {
                    format!("{:.0}W", snap.power_usage_w)
                } else {
                    "N/A".to_string()
                };
                bar(ui, power, power_text, load_color(power));

                if history.len() >= 2 {
                    temperature_sparkline(ui, snap.index, history, temp_color);
                }
            });
        })
        .response;
    response.on_hover_text(card_tooltip(card));
}

impl eframe::App for OverlayApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.drain_snapshots();
        self.run_timers(ctx, Instant::now());

        egui::CentralPanel::default().show(ctx, |ui| {
            if self.board.has_data() && self.board.cards().is_empty() {
                ui.label("No GPU detected");
            }
            for card in self.board.cards() {
                let history = self.board.temperature_history(card.snapshot.index);
                draw_card(ui, card, &history);
            }

            let stopped = self.sampler.phase() == SamplerPhase::Stopped;
            ui.add_space(4.0);
            ui.label(
                RichText::new(self.board.status_line(self.app_memory_mb, stopped))
                    .size(10.0)
                    .color(Color32::GRAY),
            );
        });
    }
}
