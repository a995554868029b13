//! Debug panel rendering.

use fusion_runtime::RuntimeSnapshot;
use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, BorderType, Borders, Cell, List, ListItem, Paragraph, Row, Sparkline, Table},
    Frame,
};

use crate::model::{PanelState, Palette};

pub fn render(frame: &mut Frame, state: &PanelState) {
    let palette = state.palette;
    let accent = palette.accent();
    let main_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(0),
            Constraint::Length(3),
        ])
        .split(frame.area());

    render_header(frame, main_layout[0], state, accent);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(main_layout[1]);

    let left = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(9),
            Constraint::Length(5),
            Constraint::Length(9),
        ])
        .split(body[0]);
    let right = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(8),
            Constraint::Length(7),
            Constraint::Min(0),
        ])
        .split(body[1]);

    match &state.snapshot {
        Some(snapshot) => {
            render_registry(frame, left[0], snapshot, palette);
            render_health(frame, right[0], snapshot, palette);
            render_error_stats(frame, right[1], snapshot, accent);
            render_recent_errors(frame, right[2], snapshot, palette);
        }
        None => {
            let waiting = Paragraph::new("Waiting for first snapshot...")
                .alignment(Alignment::Center)
                .block(bordered(" Registry ", accent));
            frame.render_widget(waiting, body[0]);
        }
    }
    render_sparklines(frame, left[1], state, accent);
    render_logs(frame, left[2], state, accent);
    render_footer(frame, main_layout[2], state, accent);
}

fn bordered(title: &str, color: Color) -> Block<'_> {
    Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(Style::default().fg(color))
}

fn render_header(frame: &mut Frame, area: Rect, state: &PanelState, color: Color) {
    let path = state
        .snapshot
        .as_ref()
        .map(|s| s.current_path.as_str())
        .unwrap_or("/");
    let mut spans = vec![
        Span::styled(" FUSION RUNTIME ", Style::default().fg(Color::Black).bg(color).add_modifier(Modifier::BOLD)),
        Span::raw("  route "),
        Span::styled(path.to_string(), Style::default().fg(color)),
    ];
    if state.paused {
        spans.push(Span::styled("  [paused]", Style::default().fg(Color::Yellow)));
    }
    if state.pressure {
        spans.push(Span::styled("  [memory pressure]", Style::default().fg(Color::Red)));
    }
    let header = Paragraph::new(Line::from(spans)).block(
        Block::default()
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(Style::default().fg(color)),
    );
    frame.render_widget(header, area);
}

fn render_registry(frame: &mut Frame, area: Rect, snapshot: &RuntimeSnapshot, palette: Palette) {
    let color = palette.accent();
    let rows = snapshot.entries.iter().map(|entry| {
        Row::new(vec![
            Cell::from(entry.id.clone()),
            Cell::from(entry.priority.as_str()).style(Style::default().fg(Color::DarkGray)),
            Cell::from(entry.state.as_str()).style(Style::default().fg(palette.load_state(entry.state))),
            Cell::from(format!("{}/{}", entry.retry_count, entry.max_retries)),
            Cell::from(entry.load_count.to_string()),
            Cell::from(entry.eviction_count.to_string()),
            Cell::from(format!("{}s", entry.idle_for.as_secs())),
        ])
    });
    let metrics = &snapshot.registry;
    let title = format!(
        " Registry  loaded {}/{}  queued {}  evictions {} ",
        metrics.loaded, metrics.registered, metrics.queued, metrics.evictions
    );
    let table = Table::new(
        rows,
        [
            Constraint::Min(14),
            Constraint::Length(11),
            Constraint::Length(9),
            Constraint::Length(7),
            Constraint::Length(6),
            Constraint::Length(6),
            Constraint::Length(6),
        ],
    )
    .header(
        Row::new(vec!["Component", "Priority", "State", "Retry", "Loads", "Evict", "Idle"])
            .style(Style::default().fg(color).add_modifier(Modifier::BOLD)),
    )
    .block(bordered(&title, color));
    frame.render_widget(table, area);
}

fn render_sparklines(frame: &mut Frame, area: Rect, state: &PanelState, color: Color) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    let memory = Sparkline::default()
        .block(bordered(" Memory % ", color))
        .data(&state.memory_history)
        .max(100)
        .style(Style::default().fg(Color::Magenta));
    frame.render_widget(memory, chunks[0]);

    let events = Sparkline::default()
        .block(bordered(" Bus events / tick ", color))
        .data(&state.event_rate)
        .style(Style::default().fg(Color::Cyan));
    frame.render_widget(events, chunks[1]);
}

fn render_logs(frame: &mut Frame, area: Rect, state: &PanelState, color: Color) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    let activity: Vec<ListItem> = state.activity.iter().map(|line| ListItem::new(line.as_str())).collect();
    frame.render_widget(List::new(activity).block(bordered(" Activity ", color)), chunks[0]);

    let bus: Vec<ListItem> = state.bus_log.iter().map(|line| ListItem::new(line.as_str())).collect();
    frame.render_widget(List::new(bus).block(bordered(" Bus listener ", color)), chunks[1]);
}

fn render_health(frame: &mut Frame, area: Rect, snapshot: &RuntimeSnapshot, palette: Palette) {
    let color = palette.accent();
    let lines = match &snapshot.errors.health {
        Some(report) => {
            let mut lines = vec![Line::from(vec![
                Span::raw("overall  "),
                Span::styled(
                    report.overall.as_str(),
                    Style::default().fg(palette.rating(report.overall)).add_modifier(Modifier::BOLD),
                ),
                Span::styled(
                    format!("  at {}", report.checked_at.format("%H:%M:%S")),
                    Style::default().fg(Color::DarkGray),
                ),
            ])];
            for (name, subsystem) in report.subsystems() {
                lines.push(Line::from(vec![
                    Span::raw(format!("{name:<8} ")),
                    Span::styled(subsystem.rating.as_str(), Style::default().fg(palette.rating(subsystem.rating))),
                    Span::styled(format!("  {}", subsystem.detail), Style::default().fg(Color::DarkGray)),
                ]));
            }
            lines
        }
        None => vec![Line::from("no health check yet (press h)")],
    };
    frame.render_widget(Paragraph::new(lines).block(bordered(" Health ", color)), area);
}

fn render_error_stats(frame: &mut Frame, area: Rect, snapshot: &RuntimeSnapshot, color: Color) {
    let stats = &snapshot.errors;
    let by_category = stats
        .errors_by_category
        .iter()
        .map(|(category, count)| format!("{category}:{count}"))
        .collect::<Vec<_>>()
        .join(" ");
    let lines = vec![
        Line::from(format!(
            "total {}  critical {}  recent {}",
            stats.total_errors, stats.critical_errors, stats.recent_errors
        )),
        Line::from(format!(
            "recoveries {}/{}  rate {:.0}%",
            stats.successful_recoveries,
            stats.recovery_attempts,
            stats.recovery_rate * 100.0
        )),
        Line::from(format!(
            "bus: listeners {}  dropped {}  errors {}  timeouts {}",
            snapshot.bus.listeners,
            snapshot.bus.events_dropped,
            snapshot.bus.listener_errors,
            snapshot.bus.listener_timeouts
        )),
        Line::from(Span::styled(by_category, Style::default().fg(Color::DarkGray))),
    ];
    frame.render_widget(Paragraph::new(lines).block(bordered(" Errors ", color)), area);
}

fn render_recent_errors(frame: &mut Frame, area: Rect, snapshot: &RuntimeSnapshot, palette: Palette) {
    let color = palette.accent();
    let items: Vec<ListItem> = snapshot
        .recent_errors
        .iter()
        .map(|err| {
            let recovery = err
                .recovery
                .as_ref()
                .and_then(|outcome| serde_json::to_value(outcome).ok())
                .and_then(|value| value.get("status").and_then(|s| s.as_str()).map(str::to_string))
                .unwrap_or_default();
            ListItem::new(Line::from(vec![
                Span::styled(format!("{:<8} ", err.severity.as_str()), Style::default().fg(palette.severity(err.severity))),
                Span::raw(format!("{} ", err.category)),
                Span::styled(err.message.clone(), Style::default().fg(Color::Gray)),
                Span::styled(format!(" {recovery}"), Style::default().fg(Color::DarkGray)),
            ]))
        })
        .collect();
    frame.render_widget(List::new(items).block(bordered(" Recent errors ", color)), area);
}

fn render_footer(frame: &mut Frame, area: Rect, state: &PanelState, color: Color) {
    let line = Line::from(vec![
        Span::styled(" q ", Style::default().fg(Color::Black).bg(color)),
        Span::raw(" quit "),
        Span::styled(" n ", Style::default().fg(Color::Black).bg(color)),
        Span::raw(" navigate "),
        Span::styled(" b ", Style::default().fg(Color::Black).bg(color)),
        Span::raw(" back "),
        Span::styled(" e ", Style::default().fg(Color::Black).bg(color)),
        Span::raw(" error "),
        Span::styled(" m ", Style::default().fg(Color::Black).bg(color)),
        Span::raw(" memory "),
        Span::styled(" h ", Style::default().fg(Color::Black).bg(color)),
        Span::raw(" health "),
        Span::styled(" x ", Style::default().fg(Color::Black).bg(color)),
        Span::raw(" evict "),
        Span::styled(" c ", Style::default().fg(Color::Black).bg(color)),
        Span::raw(" clear "),
        Span::styled(" space ", Style::default().fg(Color::Black).bg(color)),
        Span::raw(" pause "),
        Span::styled(" t ", Style::default().fg(Color::Black).bg(color)),
        Span::raw(format!(" palette ({})", state.palette.name())),
    ]);
    frame.render_widget(Paragraph::new(line).block(bordered("", color)), area);
}
