use ratatui::{
    Frame,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph, Wrap},
};
use throbber_widgets_tui::{BRAILLE_SIX, Throbber, WhichUse};

use crate::app::{App, Preset};
use crate::model::AppScreen;
use crate::timer::Phase;

/// Draw router
pub fn draw_ui(f: &mut Frame<'_>, app: &mut App) {
    match app.screen {
        AppScreen::Welcome => draw_welcome_screen(f),
        AppScreen::Login => draw_login_screen(f, app),
        AppScreen::Timer => draw_timer_screen(f, app),
    }
}

/// Welcome ASCII art screen (centered)
fn draw_welcome_screen(f: &mut Frame<'_>) {
    let area = f.area();
    let art = r#"
 _                        _
| |_ ___  _ __ ___   __ _| |_ _   _ _ __   ___
| __/ _ \| '_ ` _ \ / _` | __| | | | '_ \ / _ \
| || (_) | | | | | | (_| | |_| |_| | | | |  __/
 \__\___/|_| |_| |_|\__,_|\__|\__,_|_| |_|\___|
"#;

    let block = Block::default()
        .borders(Borders::ALL)
        .title("Pomodoro + Spotify")
        .title_alignment(Alignment::Center);

    let paragraph = Paragraph::new(art)
        .alignment(Alignment::Center)
        .style(Style::default().fg(Color::Red).add_modifier(Modifier::BOLD))
        .block(block);

    f.render_widget(paragraph, area);
}

fn draw_login_screen(f: &mut Frame<'_>, app: &mut App) {
    let area = f.area();
    let block = Block::default()
        .borders(Borders::ALL)
        .title("Log in")
        .title_alignment(Alignment::Center);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([Constraint::Min(4), Constraint::Length(1), Constraint::Length(3)])
        .split(inner);

    let mut lines = vec![
        Line::from("Connect your Spotify account to pause music during breaks."),
        Line::from(""),
        Line::from(Span::styled(
            "[l: log in in browser] [q: quit]",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        )),
    ];
    if let Some(url) = &app.login_url {
        lines.push(Line::from(""));
        lines.push(Line::from("If no browser opened, visit:"));
        lines.push(Line::from(Span::styled(url.clone(), Style::default().fg(Color::Yellow))));
    }
    let body = Paragraph::new(lines).wrap(Wrap { trim: false });
    f.render_widget(body, chunks[0]);

    if app.loading {
        let throbber = Throbber::default()
            .label(" Waiting for the browser...")
            .style(Style::default().fg(Color::Yellow))
            .throbber_set(BRAILLE_SIX)
            .use_type(WhichUse::Spin);
        f.render_stateful_widget(throbber, chunks[1], &mut app.throbber_state);
    }

    draw_message(f, app, chunks[2]);
}

fn draw_timer_screen(f: &mut Frame<'_>, app: &mut App) {
    let area = f.area();
    let outer_block = Block::default().borders(Borders::ALL).title(Span::styled(
        "tomatune",
        Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
    ));
    let inner = outer_block.inner(area);
    f.render_widget(outer_block, area);

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(5),
            Constraint::Length(3),
            Constraint::Length(4),
            Constraint::Length(3),
        ])
        .split(inner);

    let account = app
        .profile
        .as_ref()
        .map(|p| match &p.product {
            Some(product) => format!("{} ({})", p.label(), product),
            None => p.label().to_string(),
        })
        .unwrap_or_else(|| "loading profile...".into());
    let header = Paragraph::new(format!(
        "{} [space: start/pause] [r: reset] [1-3: preset] [w/W b/B c/C: adjust] [o: logout] [q: quit]",
        account
    ))
    .style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
    .block(Block::default().borders(Borders::ALL).title("Account"));
    f.render_widget(header, chunks[0]);

    draw_clock(f, app, chunks[1]);

    let color = phase_color(app.timer.phase());
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Progress"))
        .gauge_style(Style::default().fg(color))
        .ratio(app.timer.progress().clamp(0.0, 1.0));
    f.render_widget(gauge, chunks[2]);

    draw_playback(f, app, chunks[3]);
    draw_message(f, app, chunks[4]);
}

fn draw_clock(f: &mut Frame<'_>, app: &App, area: Rect) {
    let timer = &app.timer;
    let settings = timer.settings();
    let status = if timer.is_complete() {
        "Complete"
    } else if timer.is_running() {
        "Running"
    } else {
        "Paused"
    };
    let preset = Preset::ALL
        .iter()
        .find(|p| p.settings() == settings)
        .map(|p| p.name())
        .unwrap_or("Custom");

    let lines = vec![
        Line::from(Span::styled(
            format!("{} - {}", timer.phase().label(), status),
            Style::default().fg(phase_color(timer.phase())).add_modifier(Modifier::BOLD),
        )),
        Line::from(Span::styled(
            format_clock(timer.remaining_seconds()),
            Style::default().add_modifier(Modifier::BOLD),
        )),
        Line::from(format!(
            "Cycle {}/{}",
            timer.cycle_index() + 1,
            settings.total_cycles
        )),
        Line::from(Span::styled(
            format!(
                "{}: {}m work / {}m break x {}",
                preset, settings.work_minutes, settings.break_minutes, settings.total_cycles
            ),
            Style::default().fg(Color::Gray),
        )),
    ];
    let clock = Paragraph::new(lines)
        .alignment(Alignment::Center)
        .block(Block::default().borders(Borders::ALL).title("Timer"));
    f.render_widget(clock, area);
}

fn draw_playback(f: &mut Frame<'_>, app: &mut App, area: Rect) {
    let block = Block::default().borders(Borders::ALL).title("Playback");
    let inner = block.inner(area);

    let lines = match &app.playback {
        Some(snapshot) => {
            let device = snapshot
                .device
                .as_ref()
                .map(|d| match d.volume_percent {
                    Some(v) => format!("{} ({}, {}%)", d.name, d.kind, v),
                    None => format!("{} ({})", d.name, d.kind),
                })
                .unwrap_or_default();
            let state = if snapshot.is_playing { "Playing" } else { "Paused" };
            let position = snapshot
                .position_label()
                .map(|p| format!(" [{}]", p))
                .unwrap_or_default();
            vec![
                Line::from(format!(
                    "{}: {}{}",
                    state,
                    snapshot.track_label().unwrap_or_else(|| "-".into()),
                    position
                )),
                Line::from(Span::styled(device, Style::default().fg(Color::Gray))),
            ]
        }
        None => vec![Line::from(Span::styled(
            "No active device. Start playback in any Spotify app.",
            Style::default().fg(Color::DarkGray),
        ))],
    };
    f.render_widget(Paragraph::new(lines).block(block), area);

    if app.loading && inner.width > 2 {
        let throbber = Throbber::default()
            .label(" Syncing...")
            .style(Style::default().fg(Color::Yellow))
            .throbber_set(BRAILLE_SIX)
            .use_type(WhichUse::Spin);
        let spinner_area = Rect {
            x: inner.right().saturating_sub(14),
            y: inner.y,
            width: 14.min(inner.width),
            height: 1,
        };
        f.render_stateful_widget(throbber, spinner_area, &mut app.throbber_state);
    }
}

fn draw_message(f: &mut Frame<'_>, app: &App, area: Rect) {
    let footer = Paragraph::new(app.message.clone().unwrap_or_default())
        .style(Style::default().fg(Color::Cyan))
        .block(Block::default().borders(Borders::ALL).title("Message"));
    f.render_widget(footer, area);
}

fn phase_color(phase: Phase) -> Color {
    match phase {
        Phase::Work => Color::Red,
        Phase::Break => Color::Green,
    }
}

/// `mm:ss`, with minutes growing past 99 if they have to.
pub fn format_clock(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}
