//! Terminal User Interface (TUI) rendering and management.
//!
//! This module handles initializing the terminal in raw mode, restoring it on exit,
//! and drawing the application state using `ratatui`.

use std::io::{self, Stdout};

use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen, SetTitle,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, BorderType, Borders, Clear, List, ListItem, ListState, Paragraph};
use ratatui::{Frame, Terminal};

use crate::app::{App, InputMode, Row, ScriptStatus, StatusLevel};
use crate::output::{sanitize_text, LineKind};

/// Type alias for the specific terminal backend used.
pub type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

/// Initializes the terminal for TUI mode.
///
/// Enables raw mode, enters the alternate screen, and creates a `ratatui` Terminal instance.
pub fn init_terminal() -> io::Result<TuiTerminal> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

/// Restores the terminal to its original state.
pub fn restore_terminal(mut terminal: TuiTerminal) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

/// Draws the current application state to the terminal.
pub fn draw(app: &mut App, terminal: &mut TuiTerminal) -> io::Result<()> {
    execute!(terminal.backend_mut(), SetTitle(window_title(app)))?;
    terminal.draw(|frame| render(frame, app))?;
    Ok(())
}

fn render(frame: &mut Frame, app: &mut App) {
    let area = frame.size();
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(1), Constraint::Length(4)])
        .split(area);
    let main = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(28), Constraint::Percentage(72)])
        .split(vertical[0]);
    let border_style = Style::default().fg(Color::DarkGray);

    let rows = app.rows();
    let items: Vec<ListItem> = rows
        .iter()
        .enumerate()
        .map(|(index, row)| script_item(app, row, index == app.selected))
        .collect();
    let list = List::new(items).block(
        Block::default()
            .title("Scripts")
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(border_style),
    );
    let mut state = ListState::default();
    state.select(Some(app.selected.min(rows.len().saturating_sub(1))));
    frame.render_stateful_widget(list, main[0], &mut state);

    let console_block = Block::default()
        .title(console_title(app))
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(if app.input_mode == InputMode::Input {
            Style::default().fg(Color::Green)
        } else {
            border_style
        });
    let console_area = console_block.inner(main[1]);
    app.set_log_view_height(console_area.height as usize);
    let lines = console_lines(app, console_area.height as usize, console_area.width as usize);
    let empty = lines.is_empty();
    frame.render_widget(Paragraph::new(Text::from(lines)).block(console_block), main[1]);
    if empty {
        let hint = Paragraph::new("No output yet").style(Style::default().fg(Color::DarkGray));
        frame.render_widget(hint, console_area);
    }

    let (help_line, help_style) = footer_line(app);
    let status = Paragraph::new(Text::from(vec![
        Line::from(Span::raw(app.status_line())),
        Line::from(Span::styled(help_line, help_style)),
    ]))
    .block(
        Block::default()
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(border_style),
    );
    frame.render_widget(status, vertical[1]);

    if app.show_help {
        let popup_area = centered_rect(60, 60, area);
        let help_block = Paragraph::new(HELP_TEXT.join("\n"))
            .block(
                Block::default()
                    .title("Help")
                    .borders(Borders::ALL)
                    .border_type(BorderType::Rounded),
            )
            .style(Style::default().bg(Color::DarkGray).fg(Color::White));
        frame.render_widget(Clear, popup_area);
        frame.render_widget(help_block, popup_area);
    }
}

const HELP_TEXT: &[&str] = &[
    "Navigation:",
    "  Up/Down    Select script",
    "  Tab        Cycle selection",
    "  PageUp/Dn  Scroll console",
    "  Home/End   Scroll to top/bottom",
    "",
    "Actions:",
    "  Space      Start/stop selected",
    "  s          Start/stop the python shell",
    "  i          Type into the shell or last started script",
    "  p          pip install into python/imports",
    "  r          Rescan the scripts directory",
    "  f          Toggle auto-follow",
    "",
    "Scripts marked ext were started outside pyrack",
    "and cannot be stopped from here.",
    "",
    "  ?          This help (any key closes)",
    "  q          Quit (stops everything)",
];

fn script_item(app: &App, row: &Row, selected: bool) -> ListItem<'static> {
    let (name, status) = match row {
        Row::Shell => ("python shell".to_string(), app.shell_status()),
        Row::Script(id) => (id.file_name(), app.status_of(id)),
    };
    let marker = if selected {
        if app.use_symbols {
            "▶ "
        } else {
            "> "
        }
    } else {
        "  "
    };
    let name_style = match (row, selected) {
        (Row::Shell, _) => Style::default().fg(Color::Cyan),
        (_, true) => Style::default().add_modifier(Modifier::BOLD),
        (_, false) => Style::default().fg(Color::Gray),
    };
    ListItem::new(Line::from(vec![
        Span::styled(marker, Style::default().fg(Color::Cyan)),
        Span::styled(
            format!("[{}] ", status_label(status, app.use_symbols)),
            status_style(status),
        ),
        Span::styled(name, name_style),
    ]))
}

fn status_label(status: ScriptStatus, use_symbols: bool) -> &'static str {
    match (status, use_symbols) {
        (ScriptStatus::Off, true) => "·",
        (ScriptStatus::Off, false) => "off",
        (ScriptStatus::Running { .. }, true) => "▲",
        (ScriptStatus::Running { .. }, false) => "on",
        (ScriptStatus::Stopping, true) => "↻",
        (ScriptStatus::Stopping, false) => "..",
        (ScriptStatus::External { .. }, _) => "ext",
    }
}

fn status_style(status: ScriptStatus) -> Style {
    match status {
        ScriptStatus::Off => Style::default().fg(Color::DarkGray),
        ScriptStatus::Running { .. } => Style::default().fg(Color::Green),
        ScriptStatus::Stopping => Style::default().fg(Color::Yellow),
        ScriptStatus::External { .. } => Style::default().fg(Color::Magenta),
    }
}

fn line_style(kind: LineKind) -> Style {
    match kind {
        LineKind::Out => Style::default(),
        LineKind::Err => Style::default().fg(Color::Red),
        LineKind::Warn => Style::default().fg(Color::Yellow),
        LineKind::Info => Style::default().fg(Color::Cyan),
    }
}

fn console_lines(app: &App, height: usize, width: usize) -> Vec<Line<'static>> {
    if height == 0 {
        return Vec::new();
    }
    app.console
        .iter()
        .skip(app.scroll)
        .take(height)
        .map(|line| {
            let text = truncate(&sanitize_text(&line.text), width.saturating_sub(1));
            Line::from(Span::styled(text, line_style(line.kind)))
        })
        .collect()
}

fn console_title(app: &App) -> String {
    match app.selected_row() {
        Some(Row::Script(id)) => match app.status_of(&id) {
            ScriptStatus::Running { pid } => format!("Console - {} (PID={pid})", id.file_name()),
            ScriptStatus::External { pid } => {
                format!("Console - {} (external PID={pid})", id.file_name())
            }
            ScriptStatus::Stopping => format!("Console - {} (stopping)", id.file_name()),
            ScriptStatus::Off => format!("Console - {}", id.file_name()),
        },
        _ => "Console".to_string(),
    }
}

fn footer_line(app: &App) -> (String, Style) {
    let cursor = if app.use_symbols { "▌" } else { "|" };
    match app.input_mode {
        InputMode::Input => {
            let target = app
                .input_target()
                .map(|id| {
                    if id.is_shell_slot() {
                        "shell".to_string()
                    } else {
                        id.file_name()
                    }
                })
                .unwrap_or_default();
            (
                format!(
                    "Input to {target}: {}{cursor} (Enter to send, Esc to exit)",
                    app.input_line()
                ),
                Style::default().fg(Color::Green),
            )
        }
        InputMode::Install => (
            format!(
                "pip install: {}{cursor} (<spec> [args] or -r <file>; Esc to cancel)",
                app.input_line()
            ),
            Style::default().fg(Color::Green),
        ),
        InputMode::Normal => match app.status_message() {
            Some((text, StatusLevel::Warning)) => {
                (text.to_string(), Style::default().fg(Color::Yellow))
            }
            Some((text, StatusLevel::Info)) => {
                (text.to_string(), Style::default().fg(Color::DarkGray))
            }
            None => {
                let default_help = if app.use_symbols {
                    "↑/↓ select | Space start/stop | s shell | i input | p pip | r rescan | f follow | q quit | ? help"
                } else {
                    "Up/Down select | Space start/stop | s shell | i input | p pip | r rescan | f follow | q quit | ? help"
                };
                (default_help.to_string(), Style::default().fg(Color::DarkGray))
            }
        },
    }
}

fn window_title(app: &App) -> String {
    let (owned, external) = app.running_counts();
    if owned + external == 0 {
        "pyrack".to_string()
    } else {
        format!("pyrack · {} running", owned + external)
    }
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn truncate(text: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out = text.chars().take(max.saturating_sub(1)).collect::<String>();
    out.push('~');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ScriptId;
    use ratatui::backend::TestBackend;

    fn screen(app: &mut App) -> String {
        let mut terminal = Terminal::new(TestBackend::new(100, 20)).unwrap();
        terminal.draw(|frame| render(frame, app)).unwrap();
        let buffer = terminal.backend().buffer();
        (0..buffer.area.height)
            .map(|y| {
                (0..buffer.area.width)
                    .map(|x| buffer.get(x, y).symbol().to_string())
                    .collect::<String>()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn renders_scripts_with_state_markers() {
        let mut app = App::new(ScriptId::shell_slot(std::path::Path::new("/s")), 100, false);
        let a = ScriptId::new("/s/alpha.py");
        let b = ScriptId::new("/s/beta.py");
        let c = ScriptId::new("/s/gamma.py");
        app.on_scripts_changed(vec![a.clone(), b.clone(), c]);
        app.on_owned_started(a, 10);
        app.on_observed(&b, true, Some(20));
        app.on_output("[out] \u{1b}[32mhello\u{1b}[0m".to_string());

        let text = screen(&mut app);
        assert!(text.contains("[off] python shell"));
        assert!(text.contains("[on] alpha.py"));
        assert!(text.contains("[ext] beta.py"));
        assert!(text.contains("[off] gamma.py"));
        assert!(text.contains("[out] hello"));
        assert!(text.contains("running: 1 | external: 1"));
    }

    #[test]
    fn empty_console_shows_hint_and_prompt() {
        let mut app = App::new(ScriptId::shell_slot(std::path::Path::new("/s")), 100, false);
        app.input_mode = InputMode::Install;
        app.input = "requests".to_string();
        let text = screen(&mut app);
        assert!(text.contains("No output yet"));
        assert!(text.contains("pip install: requests|"));
    }

    #[test]
    fn truncate_marks_cut_lines() {
        assert_eq!(truncate("abcdef", 4), "abc~");
        assert_eq!(truncate("abc", 4), "abc");
        assert_eq!(truncate("abc", 0), "");
    }
}
