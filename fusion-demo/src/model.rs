//! Panel state refreshed from runtime snapshots.

use std::collections::VecDeque;

use fusion_runtime::{HealthRating, LoadState, RuntimeSnapshot, Severity};
use ratatui::style::Color;

const HISTORY_LEN: usize = 60;
const ACTIVITY_LEN: usize = 12;

/// Status colors for the panel. `Contrast` avoids red/green pairs.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Palette {
    #[default]
    Standard,
    Contrast,
}

impl Palette {
    pub fn toggle(self) -> Self {
        match self {
            Palette::Standard => Palette::Contrast,
            Palette::Contrast => Palette::Standard,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Palette::Standard => "standard",
            Palette::Contrast => "contrast",
        }
    }

    /// Borders, header and key hints.
    pub fn accent(self) -> Color {
        match self {
            Palette::Standard => Color::Cyan,
            Palette::Contrast => Color::White,
        }
    }

    pub fn rating(self, rating: HealthRating) -> Color {
        match rating {
            HealthRating::Healthy => self.good(),
            HealthRating::Degraded => Color::Yellow,
            HealthRating::Critical => self.bad(),
        }
    }

    pub fn severity(self, severity: Severity) -> Color {
        match (self, severity) {
            (_, Severity::Critical) => self.bad(),
            (Palette::Standard, Severity::High) => Color::LightRed,
            (Palette::Contrast, Severity::High) => Color::LightMagenta,
            (_, Severity::Medium) => Color::Yellow,
            (_, Severity::Low) => Color::DarkGray,
        }
    }

    pub fn load_state(self, state: LoadState) -> Color {
        match state {
            LoadState::Loaded => self.good(),
            LoadState::Loading => Color::Yellow,
            LoadState::Failed => self.bad(),
            LoadState::Unloaded => Color::DarkGray,
        }
    }

    fn good(self) -> Color {
        match self {
            Palette::Standard => Color::Green,
            Palette::Contrast => Color::Blue,
        }
    }

    fn bad(self) -> Color {
        match self {
            Palette::Standard => Color::Red,
            Palette::Contrast => Color::Magenta,
        }
    }
}

/// Everything the panel draws. Written by the poll task and the key handler.
#[derive(Clone, Default)]
pub struct PanelState {
    pub palette: Palette,
    pub snapshot: Option<RuntimeSnapshot>,
    pub memory_history: Vec<u64>,
    pub event_rate: Vec<u64>,
    pub activity: VecDeque<String>,
    pub bus_log: VecDeque<String>,
    pub paused: bool,
    pub pressure: bool,
    last_emitted: u64,
}

impl PanelState {
    pub fn apply_snapshot(&mut self, snapshot: RuntimeSnapshot) {
        push_capped(&mut self.memory_history, snapshot.registry.memory_percent.round() as u64);
        let emitted = snapshot.bus.events_emitted;
        push_capped(&mut self.event_rate, emitted.saturating_sub(self.last_emitted));
        self.last_emitted = emitted;
        self.snapshot = Some(snapshot);
    }

    pub fn note_activity(&mut self, line: impl Into<String>) {
        push_front_capped(&mut self.activity, line.into());
    }

    pub fn note_bus_event(&mut self, line: impl Into<String>) {
        push_front_capped(&mut self.bus_log, line.into());
    }
}

fn push_capped(history: &mut Vec<u64>, value: u64) {
    history.push(value);
    if history.len() > HISTORY_LEN {
        history.remove(0);
    }
}

fn push_front_capped(log: &mut VecDeque<String>, line: String) {
    log.push_front(line);
    log.truncate(ACTIVITY_LEN);
}
