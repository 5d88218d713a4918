/// coopmat-bench live dashboard: attach to a running benchmark at any time.
///
/// Run in a separate terminal while `coopmat-bench --live` is running:
///   cargo run --bin viz [snapshot-path]
///
/// Polls the live snapshot every 200ms and renders:
///
///     ┌ header: device / current variant / phase ─────────────────┐
///     │ results table (one row per variant) │ progress + counters │
///     │ q/esc: quit  …footer…                                     │
///
/// Press q or Esc to quit. The benchmark keeps running unaffected.
use std::path::{Path, PathBuf};
use std::{io, time::Duration};

use coopmat_bench::metrics::{read_metrics, LiveMetrics, Phase, LIVE_PATH};
use coopmat_bench::variant::component_name;
use crossterm::{
    event::{self, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Gauge, Paragraph, Row, Table},
    Frame, Terminal,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(LIVE_PATH));

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run(&mut terminal, &path);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

fn run(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        let metrics = read_metrics(path);
        terminal.draw(|f| render(f, metrics.as_ref(), path))?;

        if event::poll(Duration::from_millis(200))? {
            if let Event::Key(key) = event::read()? {
                if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn render(f: &mut Frame, metrics: Option<&LiveMetrics>, path: &Path) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // header
            Constraint::Min(0),    // results + progress
            Constraint::Length(1), // footer
        ])
        .split(f.area());

    render_header(f, rows[0], metrics);

    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(70), Constraint::Percentage(30)])
        .split(rows[1]);

    render_results(f, cols[0], metrics);
    render_progress(f, cols[1], metrics);
    render_footer(f, rows[2], path);
}

fn phase_color(phase: Phase) -> Color {
    match phase {
        Phase::Running => Color::Green,
        Phase::Compiling => Color::Yellow,
        Phase::Complete => Color::Cyan,
        Phase::Failed => Color::Red,
        Phase::Idle => Color::DarkGray,
    }
}

fn render_header(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default()
        .title(Span::styled(
            " coopmat-bench live ",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ))
        .borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let (device, variant, phase) = metrics
        .map(|m| {
            let device = if m.device.is_empty() {
                "-".to_string()
            } else {
                format!("{} {}", m.device, m.device_name)
            };
            (device, m.current_variant.clone(), m.phase)
        })
        .unwrap_or_else(|| ("-".to_string(), String::new(), Phase::Idle));

    let label = Style::default().fg(Color::DarkGray);
    let spans = vec![
        Span::styled("  device: ", label),
        Span::styled(device, Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
        Span::styled("   variant: ", label),
        Span::styled(
            if variant.is_empty() { "-".to_string() } else { variant },
            Style::default().fg(Color::Cyan),
        ),
        Span::styled("   phase: ", label),
        Span::styled(
            phase.to_string().to_uppercase(),
            Style::default().fg(phase_color(phase)).add_modifier(Modifier::BOLD),
        ),
    ];
    f.render_widget(Paragraph::new(Line::from(spans)), inner);
}

fn render_results(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default().title(" Results ").borders(Borders::ALL);

    let Some(m) = metrics.filter(|m| !m.results.is_empty()) else {
        let inner = block.inner(area);
        f.render_widget(block, area);
        let msg = if metrics.is_some() {
            "  Waiting for the first variant to finish."
        } else {
            "  No benchmark running. Start coopmat-bench --live."
        };
        f.render_widget(
            Paragraph::new(vec![
                Line::raw(""),
                Line::from(Span::styled(msg, Style::default().fg(Color::DarkGray))),
            ]),
            inner,
        );
        return;
    };

    // Highlight the fastest variant of the run.
    let best = m
        .results
        .iter()
        .map(|r| r.result.peak_for_ranking())
        .fold(0.0f64, f64::max);

    let header = Row::new(["dev", "M x N x K", "A", "B", "C", "min ns", "peak", "avg"])
        .style(Style::default().fg(Color::DarkGray).add_modifier(Modifier::BOLD));
    let rows: Vec<Row> = m
        .results
        .iter()
        .map(|r| {
            let d = &r.descriptor;
            let style = if r.result.peak_for_ranking() >= best {
                Style::default().fg(Color::Green).add_modifier(Modifier::BOLD)
            } else {
                Style::default()
            };
            Row::new(vec![
                Cell::from(r.device.to_string()),
                Cell::from(d.tile.to_string()),
                Cell::from(component_name(d.a_type)),
                Cell::from(component_name(d.b_type)),
                Cell::from(component_name(d.c_type)),
                Cell::from(format!("{:.0}", r.result.min_ns)),
                Cell::from(r.result.throughput_string()),
                Cell::from(r.result.mean_throughput_string()),
            ])
            .style(style)
        })
        .collect();

    let widths = [
        Constraint::Length(5),
        Constraint::Length(14),
        Constraint::Length(4),
        Constraint::Length(4),
        Constraint::Length(4),
        Constraint::Length(10),
        Constraint::Min(14),
        Constraint::Min(14),
    ];
    f.render_widget(Table::new(rows, widths).header(header).block(block), area);
}

fn render_progress(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default().title(" Progress ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let Some(m) = metrics else {
        return;
    };

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2), // variants gauge
            Constraint::Length(1), // spacer
            Constraint::Min(0),    // counters
        ])
        .split(inner);

    let pct = (m.progress() * 100.0).round() as u16;
    let gauge = Gauge::default()
        .block(Block::default().title("Variants"))
        .gauge_style(Style::default().fg(phase_color(m.phase)))
        .percent(pct)
        .label(format!("{} / {}", m.variants_done, m.variants_total));
    f.render_widget(gauge, rows[0]);

    let label = Style::default().fg(Color::DarkGray);
    let mut text = vec![
        Line::from(vec![
            Span::styled("Skipped:   ", label),
            Span::raw(m.variants_skipped.to_string()),
        ]),
        Line::from(vec![
            Span::styled("Kernels:   ", label),
            Span::raw(m.kernels_compiled.to_string()),
        ]),
        Line::raw(""),
        Line::from(vec![
            Span::styled("Groups:    ", label),
            Span::raw(m.num_groups.to_string()),
        ]),
        Line::from(vec![
            Span::styled("Inner:     ", label),
            Span::raw(m.inner_iterations.to_string()),
        ]),
        Line::from(vec![
            Span::styled("Outer:     ", label),
            Span::raw(m.outer_iterations.to_string()),
        ]),
    ];
    if let Some(err) = &m.last_error {
        text.push(Line::raw(""));
        text.push(Line::from(Span::styled(
            err.clone(),
            Style::default().fg(Color::Red),
        )));
    }
    f.render_widget(Paragraph::new(text), rows[2]);
}

fn render_footer(f: &mut Frame, area: Rect, path: &Path) {
    let text = Paragraph::new(Span::styled(
        format!(
            "  q / esc: quit    auto-refreshes every 200ms    reads {}",
            path.display()
        ),
        Style::default().fg(Color::DarkGray),
    ));
    f.render_widget(text, area);
}
