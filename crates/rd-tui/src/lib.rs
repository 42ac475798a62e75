use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use std::io::{self, Stdout};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use rd_core::{Action, Desk, DeskRepository, Outcome, ProbeReport};
use rd_fs::{FsStore, Settings};
use rd_launch::{ConnectionLauncher, ProcessLauncher};
use rd_probe::{StatusPoller, TcpProber};
use rd_utils::format_last_used;

const TICK_RATE: Duration = Duration::from_millis(200);
const SHARE_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Focus {
    Machines,
    Categories,
    Tags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputMode {
    None,
    AddMachines,
    Description,
    AddCategory,
    RenameCategory,
    AddTag,
    ConfirmDelete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingDelete {
    Machine(String),
    Category(String),
    Tag(String),
}

#[derive(Debug, Default, Clone)]
struct TextInput {
    content: String,
    cursor: usize,
}

impl TextInput {
    fn from(content: String) -> Self {
        let cursor = content.chars().count();
        Self { content, cursor }
    }

    fn byte_index(&self) -> usize {
        self.content
            .char_indices()
            .nth(self.cursor)
            .map_or(self.content.len(), |(index, _)| index)
    }

    fn insert(&mut self, c: char) {
        let index = self.byte_index();
        self.content.insert(index, c);
        self.cursor += 1;
    }

    fn delete_back(&mut self) {
        if self.cursor > 0 {
            self.cursor -= 1;
            let index = self.byte_index();
            self.content.remove(index);
        }
    }

    fn move_left(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    fn move_right(&mut self) {
        if self.cursor < self.content.chars().count() {
            self.cursor += 1;
        }
    }

    fn move_home(&mut self) {
        self.cursor = 0;
    }

    fn move_end(&mut self) {
        self.cursor = self.content.chars().count();
    }

    fn reset(&mut self) {
        self.content.clear();
        self.cursor = 0;
    }
}

struct App<R> {
    desk: Desk<R>,
    launcher: ConnectionLauncher<ProcessLauncher>,
    share_dir: PathBuf,
    focus: Focus,
    machine_state: ListState,
    category_state: ListState,
    tag_state: ListState,
    input_mode: InputMode,
    input: TextInput,
    pending_delete: Option<PendingDelete>,
    status: Option<String>,
    show_help: bool,
    refresh_requested: bool,
}

impl<R: DeskRepository> App<R> {
    fn new(desk: Desk<R>, launcher: ConnectionLauncher<ProcessLauncher>, share_dir: PathBuf) -> Self {
        let mut app = Self {
            desk,
            launcher,
            share_dir,
            focus: Focus::Machines,
            machine_state: ListState::default(),
            category_state: ListState::default(),
            tag_state: ListState::default(),
            input_mode: InputMode::None,
            input: TextInput::default(),
            pending_delete: None,
            status: None,
            show_help: false,
            refresh_requested: false,
        };
        app.clamp_selections();
        app
    }

    fn selected_machine(&self) -> Option<String> {
        let index = self.machine_state.selected()?;
        self.desk.view().get(index).cloned()
    }

    fn selected_category(&self) -> Option<String> {
        let index = self.category_state.selected()?;
        self.desk
            .categories()
            .categories()
            .get(index)
            .map(|category| category.name.clone())
    }

    fn selected_tag(&self) -> Option<String> {
        let index = self.tag_state.selected()?;
        self.desk.tags().tags().get(index).cloned()
    }

    fn focused_len(&self) -> usize {
        match self.focus {
            Focus::Machines => self.desk.view().len(),
            Focus::Categories => self.desk.categories().categories().len(),
            Focus::Tags => self.desk.tags().tags().len(),
        }
    }

    fn focused_state(&mut self) -> &mut ListState {
        match self.focus {
            Focus::Machines => &mut self.machine_state,
            Focus::Categories => &mut self.category_state,
            Focus::Tags => &mut self.tag_state,
        }
    }

    fn clamp_selections(&mut self) {
        clamp(&mut self.machine_state, self.desk.view().len());
        clamp(
            &mut self.category_state,
            self.desk.categories().categories().len(),
        );
        clamp(&mut self.tag_state, self.desk.tags().tags().len());
    }

    fn select_machine(&mut self, name: &str) {
        if let Some(index) = self.desk.view().iter().position(|machine| machine == name) {
            self.machine_state.select(Some(index));
        }
    }

    fn next_focus(&mut self) {
        self.focus = match self.focus {
            Focus::Machines => Focus::Categories,
            Focus::Categories => Focus::Tags,
            Focus::Tags => Focus::Machines,
        };
    }

    fn prev_focus(&mut self) {
        self.focus = match self.focus {
            Focus::Machines => Focus::Tags,
            Focus::Categories => Focus::Machines,
            Focus::Tags => Focus::Categories,
        };
    }

    fn dispatch(&mut self, action: Action) -> Result<Outcome> {
        let outcome = self.desk.dispatch(action)?;
        self.clamp_selections();
        Ok(outcome)
    }

    /// Dispatch and put a message in the status line either way.
    fn dispatch_reporting(&mut self, action: Action, applied: &str, rejected: &str) -> Result<()> {
        let message = if self.dispatch(action)?.is_applied() {
            applied
        } else {
            rejected
        };
        self.status = Some(message.to_string());
        Ok(())
    }
}

fn clamp(state: &mut ListState, len: usize) {
    match state.selected() {
        _ if len == 0 => state.select(None),
        Some(index) if index >= len => state.select(Some(len - 1)),
        None => state.select(Some(0)),
        Some(_) => {}
    }
}

fn select_next(state: &mut ListState, len: usize) {
    if len == 0 {
        return;
    }
    let next = match state.selected() {
        Some(index) if index + 1 < len => index + 1,
        _ => 0,
    };
    state.select(Some(next));
}

fn select_prev(state: &mut ListState, len: usize) {
    if len == 0 {
        return;
    }
    let prev = match state.selected() {
        Some(0) | None => len - 1,
        Some(index) => index - 1,
    };
    state.select(Some(prev));
}

/// Run the terminal interface on the given data directory.
pub fn run(data_dir: PathBuf) -> Result<()> {
    let store = FsStore::new(data_dir.clone());
    store.init().context("failed to create data directory")?;
    let settings = Settings::load(&data_dir).context("failed to read settings")?;
    match store.cleanup_shares(SHARE_MAX_AGE) {
        Ok(0) => {}
        Ok(removed) => info!(removed, "removed stale share files"),
        Err(err) => warn!(error = %err, "share cleanup failed"),
    }
    let share_dir = store.share_dir();
    let desk = Desk::open(store).context("failed to load machines")?;
    let launcher = ConnectionLauncher::new(
        ProcessLauncher::new(settings.client.clone()),
        settings.rdp_path.clone(),
    );
    let mut app = App::new(desk, launcher, share_dir);

    let prober = TcpProber::new(settings.probe_port, settings.probe_timeout);
    let poller = StatusPoller::spawn(Arc::new(prober)).context("failed to start status poller")?;

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = ratatui::backend::CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = event_loop(&mut terminal, &mut app, &poller, settings.refresh_interval);
    restore_terminal(terminal)?;
    result
}

fn event_loop<R: DeskRepository>(
    terminal: &mut Terminal<ratatui::backend::CrosstermBackend<Stdout>>,
    app: &mut App<R>,
    poller: &StatusPoller,
    refresh_interval: Duration,
) -> Result<()> {
    poller.submit(app.desk.begin_refresh());
    let mut last_refresh = Instant::now();
    let mut last_tick = Instant::now();

    loop {
        terminal.draw(|frame| render_app(frame, app))?;

        let timeout = TICK_RATE.saturating_sub(last_tick.elapsed());
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press && on_key(app, key) {
                    return Ok(());
                }
            }
        }

        if last_tick.elapsed() >= TICK_RATE {
            apply_reports(app, poller.drain());
            if app.refresh_requested || last_refresh.elapsed() >= refresh_interval {
                if !poller.submit(app.desk.begin_refresh()) {
                    app.status = Some("Status poller stopped".into());
                }
                app.refresh_requested = false;
                last_refresh = Instant::now();
            }
            last_tick = Instant::now();
        }
    }
}

fn apply_reports<R: DeskRepository>(app: &mut App<R>, reports: Vec<ProbeReport>) {
    for report in reports {
        if let Err(err) = app.dispatch(Action::ApplyProbe(report)) {
            warn!(error = %err, "failed to apply probe report");
            app.status = Some(format!("Error: {err}"));
        }
    }
}

/// Handle a key and report failures in the status line. Returns true to quit.
fn on_key<R: DeskRepository>(app: &mut App<R>, key: KeyEvent) -> bool {
    match handle_key(app, key) {
        Ok(quit) => quit,
        Err(err) => {
            warn!(error = %err, "action failed");
            app.status = Some(format!("Error: {err}"));
            false
        }
    }
}

fn handle_key<R: DeskRepository>(app: &mut App<R>, key: KeyEvent) -> Result<bool> {
    match app.input_mode {
        InputMode::None => {}
        InputMode::ConfirmDelete => return handle_confirm_input(app, key),
        _ => return handle_text_input(app, key),
    }
    if app.show_help {
        if matches!(key.code, KeyCode::Char('?') | KeyCode::Esc | KeyCode::Char('q')) {
            app.show_help = false;
        }
        return Ok(false);
    }
    app.status = None;

    match key.code {
        KeyCode::Char('q') => return Ok(true),
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => return Ok(true),
        KeyCode::Char('?') => app.show_help = true,
        KeyCode::Tab => app.next_focus(),
        KeyCode::BackTab => app.prev_focus(),
        KeyCode::Char('j') | KeyCode::Down => {
            let len = app.focused_len();
            select_next(app.focused_state(), len);
        }
        KeyCode::Char('k') | KeyCode::Up => {
            let len = app.focused_len();
            select_prev(app.focused_state(), len);
        }
        KeyCode::Char('g') | KeyCode::Home => app.focused_state().select(Some(0)),
        KeyCode::Char('G') | KeyCode::End => {
            let len = app.focused_len();
            if len > 0 {
                app.focused_state().select(Some(len - 1));
            }
        }
        KeyCode::Enter | KeyCode::Char(' ') => handle_activate(app)?,
        KeyCode::Esc => {
            app.dispatch(Action::ClearFilters)?;
            app.status = Some("Filters cleared".into());
        }
        KeyCode::Char('a') => open_add_input(app),
        KeyCode::Char('x') => open_delete_confirm(app),
        KeyCode::Char('e') => {
            if let Some(machine) = app.selected_machine() {
                let current = app
                    .desk
                    .records()
                    .get(&machine)
                    .and_then(|record| record.description.clone())
                    .unwrap_or_default();
                app.input = TextInput::from(current);
                app.input_mode = InputMode::Description;
            }
        }
        KeyCode::Char('R') if app.focus == Focus::Categories => {
            if let Some(category) = app.selected_category() {
                app.input = TextInput::from(category);
                app.input_mode = InputMode::RenameCategory;
            }
        }
        KeyCode::Char('c') => {
            if let (Some(machine), Some(category)) = (app.selected_machine(), app.selected_category()) {
                app.dispatch_reporting(
                    Action::AssignCategory { machine, category },
                    "Category assigned",
                    "Category not assigned",
                )?;
            }
        }
        KeyCode::Char('C') => {
            if let Some(machine) = app.selected_machine() {
                app.dispatch_reporting(
                    Action::ClearCategory(machine),
                    "Category cleared",
                    "Category not cleared",
                )?;
            }
        }
        KeyCode::Char('t') => {
            if let (Some(machine), Some(tag)) = (app.selected_machine(), app.selected_tag()) {
                app.dispatch_reporting(
                    Action::ToggleTag { machine, tag },
                    "Tag toggled",
                    "Tag not toggled",
                )?;
            }
        }
        KeyCode::Char('T') => {
            app.dispatch(Action::ClearTagFilter)?;
            app.status = Some("Tag filter cleared".into());
        }
        KeyCode::Char('K') => move_selected(app, -1)?,
        KeyCode::Char('J') => move_selected(app, 1)?,
        KeyCode::Char('A') => {
            if let Some(machine) = app.selected_machine() {
                app.dispatch_reporting(
                    Action::AcceptAddress(machine),
                    "New address accepted",
                    "No address change to accept",
                )?;
            }
        }
        KeyCode::Char('r') => {
            app.refresh_requested = true;
            app.status = Some("Refreshing status".into());
        }
        KeyCode::Char('s') => {
            if let Some(machine) = app.selected_machine() {
                let shared = app
                    .launcher
                    .prepare_shareable(&app.desk, &machine, &app.share_dir)?;
                app.status = Some(format!("Share file written to {}", shared.path.display()));
            }
        }
        _ => {}
    }
    Ok(false)
}

fn handle_activate<R: DeskRepository>(app: &mut App<R>) -> Result<()> {
    match app.focus {
        Focus::Machines => {
            if let Some(machine) = app.selected_machine() {
                let template = app.launcher.connect(&mut app.desk, &machine)?;
                app.clamp_selections();
                app.status = Some(format!("Connecting to {machine} with {}", template.display()));
            }
        }
        Focus::Categories => {
            if let Some(category) = app.selected_category() {
                app.dispatch(Action::ToggleCategoryFilter(category))?;
            }
        }
        Focus::Tags => {
            if let Some(tag) = app.selected_tag() {
                app.dispatch(Action::ToggleTagFilter(tag))?;
            }
        }
    }
    Ok(())
}

fn move_selected<R: DeskRepository>(app: &mut App<R>, step: isize) -> Result<()> {
    let Some(index) = app.machine_state.selected() else {
        return Ok(());
    };
    let view = app.desk.view();
    let Some(neighbour) = index.checked_add_signed(step).and_then(|i| view.get(i)) else {
        return Ok(());
    };
    let machine = view[index].clone();
    let Some(target) = app.desk.records().list().iter().position(|name| name == neighbour) else {
        return Ok(());
    };
    app.dispatch(Action::MoveMachine {
        machine: machine.clone(),
        index: target,
    })?;
    app.select_machine(&machine);
    Ok(())
}

fn open_add_input<R>(app: &mut App<R>) {
    app.input.reset();
    app.input_mode = match app.focus {
        Focus::Machines => InputMode::AddMachines,
        Focus::Categories => InputMode::AddCategory,
        Focus::Tags => InputMode::AddTag,
    };
}

fn open_delete_confirm<R: DeskRepository>(app: &mut App<R>) {
    let pending = match app.focus {
        Focus::Machines => app.selected_machine().map(PendingDelete::Machine),
        Focus::Categories => app.selected_category().map(PendingDelete::Category),
        Focus::Tags => app.selected_tag().map(PendingDelete::Tag),
    };
    if pending.is_some() {
        app.pending_delete = pending;
        app.input_mode = InputMode::ConfirmDelete;
    }
}

fn handle_confirm_input<R: DeskRepository>(app: &mut App<R>, key: KeyEvent) -> Result<bool> {
    match key.code {
        KeyCode::Char('y') | KeyCode::Char('Y') => {
            app.input_mode = InputMode::None;
            let (action, label) = match app.pending_delete.take() {
                Some(PendingDelete::Machine(name)) => (Action::DeleteMachine(name), "machine"),
                Some(PendingDelete::Category(name)) => (Action::DeleteCategory(name), "category"),
                Some(PendingDelete::Tag(name)) => (Action::DeleteTag(name), "tag"),
                None => return Ok(false),
            };
            let outcome = app.dispatch(action)?;
            app.status = Some(if outcome.is_applied() {
                format!("Deleted {label}")
            } else {
                format!("Cannot delete this {label}")
            });
        }
        KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
            app.pending_delete = None;
            app.input_mode = InputMode::None;
            app.status = Some("Cancelled".into());
        }
        _ => {}
    }
    Ok(false)
}

fn handle_text_input<R: DeskRepository>(app: &mut App<R>, key: KeyEvent) -> Result<bool> {
    match key.code {
        KeyCode::Esc => {
            app.input_mode = InputMode::None;
            app.input.reset();
        }
        KeyCode::Enter => {
            let mode = app.input_mode;
            let text = app.input.content.clone();
            app.input_mode = InputMode::None;
            app.input.reset();
            submit_input(app, mode, text)?;
        }
        KeyCode::Char('a') if key.modifiers.contains(KeyModifiers::CONTROL) => app.input.move_home(),
        KeyCode::Char('e') if key.modifiers.contains(KeyModifiers::CONTROL) => app.input.move_end(),
        KeyCode::Char(c) => app.input.insert(c),
        KeyCode::Backspace => app.input.delete_back(),
        KeyCode::Left => app.input.move_left(),
        KeyCode::Right => app.input.move_right(),
        KeyCode::Home => app.input.move_home(),
        KeyCode::End => app.input.move_end(),
        _ => {}
    }
    Ok(false)
}

fn submit_input<R: DeskRepository>(app: &mut App<R>, mode: InputMode, text: String) -> Result<()> {
    match mode {
        InputMode::AddMachines => {
            if let Outcome::Added(names) = app.dispatch(Action::AddMachines(text))? {
                app.status = Some(format!("Added {} machine(s)", names.len()));
                if let Some(last) = names.last() {
                    app.select_machine(last);
                }
            }
        }
        InputMode::Description => {
            if let Some(machine) = app.selected_machine() {
                app.dispatch_reporting(
                    Action::SetDescription { machine, text },
                    "Description saved",
                    "Description not saved",
                )?;
            }
        }
        InputMode::AddCategory => {
            let (name, color) = split_color(&text)?;
            app.dispatch_reporting(
                Action::AddCategory { name, color },
                "Category added",
                "Category name is empty, reserved or taken",
            )?;
        }
        InputMode::RenameCategory => {
            if let Some(from) = app.selected_category() {
                app.dispatch_reporting(
                    Action::RenameCategory { from, to: text },
                    "Category renamed",
                    "Category cannot be renamed to that",
                )?;
            }
        }
        InputMode::AddTag => {
            app.dispatch_reporting(
                Action::AddTag(text),
                "Tag added",
                "Tag name is empty, invalid or taken",
            )?;
        }
        InputMode::None | InputMode::ConfirmDelete => {}
    }
    Ok(())
}

/// `Lab #336699` names a category with a color; a plain name has none.
fn split_color(text: &str) -> Result<(String, Option<rd_core::Color>)> {
    let text = text.trim();
    match text.rsplit_once(' ') {
        Some((name, color)) if color.starts_with('#') => {
            Ok((name.trim().to_string(), Some(rd_core::Color::parse(color)?)))
        }
        _ => Ok((text.to_string(), None)),
    }
}

fn swatch(color: &rd_core::Color) -> Color {
    let hex = color.as_str().trim_start_matches('#');
    let channel = |range: std::ops::Range<usize>| {
        hex.get(range)
            .and_then(|part| u8::from_str_radix(part, 16).ok())
            .unwrap_or(0)
    };
    Color::Rgb(channel(0..2), channel(2..4), channel(4..6))
}

fn render_app<R: DeskRepository>(frame: &mut Frame, app: &App<R>) {
    let size = frame.size();
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(3)].as_ref())
        .split(size);

    render_header(frame, chunks[0], app);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(30), Constraint::Percentage(70)].as_ref())
        .split(chunks[1]);
    let sidebar = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)].as_ref())
        .split(body[0]);
    render_categories(frame, sidebar[0], app);
    render_tags(frame, sidebar[1], app);

    let main = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(3), Constraint::Length(8)].as_ref())
        .split(body[1]);
    render_machines(frame, main[0], app);
    render_detail(frame, main[1], app);

    render_guide_bar(frame, chunks[2], app);

    match app.input_mode {
        InputMode::None => {}
        InputMode::ConfirmDelete => render_confirm_popup(frame, size, app),
        mode => render_input_popup(frame, size, input_title(mode), &app.input),
    }
    if app.show_help {
        render_help_popup(frame, size);
    }
}

fn pane_block(title: String, focused: bool) -> Block<'static> {
    let style = if focused {
        Style::default().fg(Color::Cyan)
    } else {
        Style::default()
    };
    Block::default().borders(Borders::ALL).title(title).border_style(style)
}

fn render_header<R: DeskRepository>(frame: &mut Frame, area: Rect, app: &App<R>) {
    let filter = app.desk.filter();
    let mut parts = Vec::new();
    if let Some(category) = filter.selected_category() {
        parts.push(format!("category: {category}"));
    }
    if !filter.selected_tags().is_empty() {
        let tags: Vec<&str> = filter.selected_tags().iter().map(String::as_str).collect();
        parts.push(format!("tags: {}", tags.join(" + ")));
    }
    let filters = if parts.is_empty() {
        "all machines".to_string()
    } else {
        parts.join("  ")
    };
    let line = Line::from(vec![
        Span::styled(
            format!(" {} shown ", app.desk.view().len()),
            Style::default().add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!("of {}  |  {filters}  |  ", app.desk.records().len())),
        Span::styled(
            format!("{} online", app.desk.status().reachable_count()),
            Style::default().fg(Color::Green),
        ),
    ]);
    let header = Paragraph::new(line).block(Block::default().borders(Borders::ALL).title("rdeck"));
    frame.render_widget(header, area);
}

fn render_categories<R: DeskRepository>(frame: &mut Frame, area: Rect, app: &App<R>) {
    let selected = app.desk.filter().selected_category();
    let items: Vec<ListItem> = app
        .desk
        .categories()
        .categories()
        .iter()
        .map(|category| {
            let marker = if selected == Some(category.name.as_str()) { "*" } else { " " };
            let count = app
                .desk
                .categories()
                .machines_in(&category.name, app.desk.records())
                .len();
            let style = category
                .color
                .as_ref()
                .map_or_else(Style::default, |color| Style::default().fg(swatch(color)));
            ListItem::new(Line::from(vec![
                Span::raw(format!("{marker} ")),
                Span::styled(category.name.clone(), style),
                Span::raw(format!(" ({count})")),
            ]))
        })
        .collect();
    let list = List::new(items)
        .block(pane_block("Categories".into(), app.focus == Focus::Categories))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED));
    let mut state = app.category_state.clone();
    frame.render_stateful_widget(list, area, &mut state);
}

fn render_tags<R: DeskRepository>(frame: &mut Frame, area: Rect, app: &App<R>) {
    let selected = app.desk.filter().selected_tags();
    let items: Vec<ListItem> = app
        .desk
        .tags()
        .tags()
        .iter()
        .map(|tag| {
            let mark = if selected.contains(tag) { "[x]" } else { "[ ]" };
            ListItem::new(format!("{mark} {tag}"))
        })
        .collect();
    let list = List::new(items)
        .block(pane_block("Tags".into(), app.focus == Focus::Tags))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED));
    let mut state = app.tag_state.clone();
    frame.render_stateful_widget(list, area, &mut state);
}

fn render_machines<R: DeskRepository>(frame: &mut Frame, area: Rect, app: &App<R>) {
    let status = app.desk.status();
    let items: Vec<ListItem> = app
        .desk
        .view()
        .iter()
        .map(|machine| {
            let (marker, color) = match status.get(machine) {
                Some(entry) if entry.reachable => ("●", Color::Green),
                Some(_) => ("○", Color::Red),
                None => ("·", Color::DarkGray),
            };
            let mut spans = vec![
                Span::styled(format!("{marker} "), Style::default().fg(color)),
                Span::raw(machine.clone()),
            ];
            if status.address_change(machine).is_some() {
                spans.push(Span::styled(
                    "  address changed",
                    Style::default().fg(Color::Yellow),
                ));
            }
            let tags = app.desk.tags().tags_of(machine);
            if !tags.is_empty() {
                spans.push(Span::styled(
                    format!("  #{}", tags.join(" #")),
                    Style::default().fg(Color::DarkGray),
                ));
            }
            ListItem::new(Line::from(spans))
        })
        .collect();
    let title = format!("Machines ({})", app.desk.view().len());
    let list = List::new(items)
        .block(pane_block(title, app.focus == Focus::Machines))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED));
    let mut state = app.machine_state.clone();
    frame.render_stateful_widget(list, area, &mut state);
}

fn render_detail<R: DeskRepository>(frame: &mut Frame, area: Rect, app: &App<R>) {
    let block = Block::default().borders(Borders::ALL).title("Details");
    let Some(machine) = app.selected_machine() else {
        frame.render_widget(Paragraph::new("No machine selected").block(block), area);
        return;
    };
    let Some(record) = app.desk.records().get(&machine) else {
        frame.render_widget(block, area);
        return;
    };
    let address = match app.desk.status().address_change(&machine) {
        Some(change) => format!("{} -> {} (A to accept)", change.previous, change.current),
        None => record
            .last_known_address
            .map_or_else(|| "unknown".to_string(), |address| address.to_string()),
    };
    let template = record
        .connection_path
        .as_ref()
        .map_or_else(|| "default".to_string(), |path| path.display().to_string());
    let tags = app.desk.tags().tags_of(&machine);
    let lines = vec![
        Line::from(Span::styled(machine.clone(), Style::default().add_modifier(Modifier::BOLD))),
        Line::from(format!("Category: {}", app.desk.categories().category_of(&machine))),
        Line::from(format!("Tags: {}", if tags.is_empty() { "-".to_string() } else { tags.join(", ") })),
        Line::from(format!("Description: {}", record.description.as_deref().unwrap_or("-"))),
        Line::from(format!("Last used: {}  Template: {template}", format_last_used(record.last_used))),
        Line::from(format!("Address: {address}")),
    ];
    let detail = Paragraph::new(lines).block(block).wrap(Wrap { trim: true });
    frame.render_widget(detail, area);
}

fn render_guide_bar<R: DeskRepository>(frame: &mut Frame, area: Rect, app: &App<R>) {
    if let Some(status) = &app.status {
        let guide = Paragraph::new(status.as_str())
            .block(Block::default().borders(Borders::ALL).title("Status"));
        frame.render_widget(guide, area);
        return;
    }
    let spans: Vec<Span> = get_key_hints(app)
        .iter()
        .flat_map(|(key, desc)| {
            vec![
                Span::styled(format!(" [{key}] "), Style::default().add_modifier(Modifier::BOLD).fg(Color::Cyan)),
                Span::raw(format!("{desc}  ")),
            ]
        })
        .collect();
    let guide = Paragraph::new(Line::from(spans))
        .block(Block::default().borders(Borders::ALL).title("Guide"));
    frame.render_widget(guide, area);
}

fn get_key_hints<R>(app: &App<R>) -> Vec<(&'static str, &'static str)> {
    match app.input_mode {
        InputMode::None => {}
        InputMode::ConfirmDelete => return vec![("y", "Delete"), ("n", "Cancel")],
        _ => return vec![("Enter", "Save"), ("Esc", "Cancel")],
    }
    let mut hints = vec![("q", "Quit"), ("?", "Help"), ("Tab", "Pane")];
    match app.focus {
        Focus::Machines => hints.extend([("Enter", "Connect"), ("a", "Add"), ("e", "Describe"), ("x", "Delete")]),
        Focus::Categories => hints.extend([("Enter", "Filter"), ("c", "Assign"), ("a", "Add"), ("R", "Rename")]),
        Focus::Tags => hints.extend([("Enter", "Filter"), ("t", "Toggle"), ("a", "Add"), ("x", "Delete")]),
    }
    hints.push(("Esc", "Clear filters"));
    hints
}

fn input_title(mode: InputMode) -> &'static str {
    match mode {
        InputMode::AddMachines => "Add machines (space separated)",
        InputMode::Description => "Description",
        InputMode::AddCategory => "New category (optional #rrggbb)",
        InputMode::RenameCategory => "Rename category",
        InputMode::AddTag => "New tag",
        InputMode::None | InputMode::ConfirmDelete => "",
    }
}

fn render_input_popup(frame: &mut Frame, area: Rect, title: &str, input: &TextInput) {
    let popup_area = centered_rect(60, 20, area);
    frame.render_widget(Clear, popup_area);
    let block = Block::default()
        .borders(Borders::ALL)
        .title(title.to_string())
        .style(Style::default().fg(Color::Yellow));
    frame.render_widget(Paragraph::new(input.content.as_str()).block(block), popup_area);
    let offset = u16::try_from(input.cursor).unwrap_or(u16::MAX);
    let cx = popup_area.x + 1 + offset.min(popup_area.width.saturating_sub(3));
    frame.set_cursor(cx, popup_area.y + 1);
}

fn render_confirm_popup<R>(frame: &mut Frame, area: Rect, app: &App<R>) {
    let popup_area = centered_rect(50, 20, area);
    frame.render_widget(Clear, popup_area);
    let target = match &app.pending_delete {
        Some(PendingDelete::Machine(name)) => format!("machine {name}"),
        Some(PendingDelete::Category(name)) => format!("category {name}"),
        Some(PendingDelete::Tag(name)) => format!("tag {name}"),
        None => String::new(),
    };
    let text = format!("Delete {target}? (y/n)");
    let popup = Paragraph::new(text)
        .block(Block::default().borders(Borders::ALL).title("Confirm"))
        .wrap(Wrap { trim: true });
    frame.render_widget(popup, popup_area);
}

fn render_help_popup(frame: &mut Frame, area: Rect) {
    let popup_area = centered_rect(70, 70, area);
    frame.render_widget(Clear, popup_area);
    let help = Paragraph::new(help_text())
        .block(Block::default().borders(Borders::ALL).title("Help"))
        .wrap(Wrap { trim: false });
    frame.render_widget(help, popup_area);
}

fn help_text() -> String {
    [
        "Tab / Shift+Tab  switch pane",
        "j k / arrows     move",
        "Enter / Space    connect, or toggle category / tag filter",
        "a                add machine, category or tag",
        "x                delete selected item",
        "e                edit description",
        "c / C            assign selected category / clear category",
        "t / T            toggle selected tag on machine / clear tag filter",
        "R                rename category",
        "J / K            move machine down / up",
        "A                accept changed address",
        "s                write shareable template",
        "r                refresh status now",
        "Esc              clear all filters",
        "q                quit",
    ]
    .join("\n")
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Percentage((100 - percent_y) / 2),
                Constraint::Percentage(percent_y),
                Constraint::Percentage((100 - percent_y) / 2),
            ]
            .as_ref(),
        )
        .split(r);
    Layout::default()
        .direction(Direction::Horizontal)
        .constraints(
            [
                Constraint::Percentage((100 - percent_x) / 2),
                Constraint::Percentage(percent_x),
                Constraint::Percentage((100 - percent_x) / 2),
            ]
            .as_ref(),
        )
        .split(popup_layout[1])[1]
}

fn restore_terminal(mut terminal: Terminal<ratatui::backend::CrosstermBackend<Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratatui::backend::TestBackend;
    use rd_core::{MemoryRepository, ProbeOutcome};

    fn app_with(names: &str) -> App<MemoryRepository> {
        let mut desk = Desk::open(MemoryRepository::default()).expect("desk");
        desk.dispatch(Action::AddMachines(names.into())).expect("add");
        App::new(
            desk,
            ConnectionLauncher::new(ProcessLauncher::new("true"), None),
            PathBuf::from("/tmp/rdeck-share"),
        )
    }

    fn press(app: &mut App<MemoryRepository>, code: KeyCode) -> bool {
        on_key(app, KeyEvent::new(code, KeyModifiers::NONE))
    }

    fn type_text(app: &mut App<MemoryRepository>, text: &str) {
        for c in text.chars() {
            press(app, KeyCode::Char(c));
        }
    }

    fn render(app: &App<MemoryRepository>) -> String {
        let backend = TestBackend::new(100, 24);
        let mut terminal = Terminal::new(backend).expect("terminal");
        terminal
            .draw(|frame| render_app(frame, app))
            .expect("render");
        buffer_to_string(terminal.backend().buffer())
    }

    fn buffer_to_string(buffer: &ratatui::buffer::Buffer) -> String {
        let mut lines = Vec::new();
        for y in 0..buffer.area.height {
            let mut line = String::new();
            for x in 0..buffer.area.width {
                let cell = buffer.get(x, y);
                line.push_str(cell.symbol());
            }
            lines.push(line.trim_end().to_string());
        }
        lines.join("\n")
    }

    #[test]
    fn renders_panes_and_status_markers() {
        let mut app = app_with("Alpha Beta");
        let tick = app.desk.begin_refresh();
        apply_reports(
            &mut app,
            vec![ProbeReport {
                machine: "Alpha".into(),
                tick: tick.tick,
                outcome: ProbeOutcome {
                    reachable: true,
                    address: None,
                },
            }],
        );

        let screen = render(&app);
        assert!(screen.contains("Categories"));
        assert!(screen.contains("Default (2)"));
        assert!(screen.contains("● Alpha"));
        assert!(screen.contains("· Beta"));
        assert!(screen.contains("1 online"));
    }

    #[test]
    fn add_machines_through_popup() {
        let mut app = app_with("");
        press(&mut app, KeyCode::Char('a'));
        assert_eq!(app.input_mode, InputMode::AddMachines);
        type_text(&mut app, "web-01 web-02");
        press(&mut app, KeyCode::Enter);

        assert_eq!(app.desk.view(), ["web-01", "web-02"]);
        assert_eq!(app.selected_machine().as_deref(), Some("web-02"));
        assert_eq!(app.status.as_deref(), Some("Added 2 machine(s)"));
    }

    #[test]
    fn category_pane_filters_and_assigns() {
        let mut app = app_with("Alpha Beta");
        app.desk
            .dispatch(Action::AddCategory {
                name: "Lab".into(),
                color: None,
            })
            .unwrap();
        app.clamp_selections();

        press(&mut app, KeyCode::Down);
        press(&mut app, KeyCode::Tab);
        assert_eq!(app.focus, Focus::Categories);
        press(&mut app, KeyCode::Down);
        assert_eq!(app.selected_category().as_deref(), Some("Lab"));
        press(&mut app, KeyCode::Char('c'));
        assert_eq!(app.desk.categories().category_of("Beta"), "Lab");

        press(&mut app, KeyCode::Enter);
        assert_eq!(app.desk.view(), ["Beta"]);
        press(&mut app, KeyCode::Esc);
        assert_eq!(app.desk.view(), ["Alpha", "Beta"]);
    }

    #[test]
    fn delete_requires_confirmation() {
        let mut app = app_with("Alpha Beta");
        press(&mut app, KeyCode::Char('x'));
        assert_eq!(app.input_mode, InputMode::ConfirmDelete);
        press(&mut app, KeyCode::Char('n'));
        assert_eq!(app.desk.view().len(), 2);

        press(&mut app, KeyCode::Char('x'));
        press(&mut app, KeyCode::Char('y'));
        assert_eq!(app.desk.view(), ["Beta"]);
        assert_eq!(app.selected_machine().as_deref(), Some("Beta"));
    }

    #[test]
    fn connect_failure_is_reported_not_fatal() {
        let mut app = app_with("Alpha");
        assert!(!press(&mut app, KeyCode::Enter));
        let status = app.status.clone().unwrap_or_default();
        assert!(status.starts_with("Error:"), "{status}");
        assert!(app.desk.records().get("Alpha").unwrap().last_used.is_none());
        assert!(render(&app).contains("Error:"));
    }

    #[test]
    fn move_keys_follow_selected_machine() {
        let mut app = app_with("Alpha Beta Gamma");
        press(&mut app, KeyCode::Char('J'));
        assert_eq!(app.desk.view(), ["Beta", "Alpha", "Gamma"]);
        assert_eq!(app.selected_machine().as_deref(), Some("Alpha"));
        press(&mut app, KeyCode::Char('K'));
        assert_eq!(app.desk.view(), ["Alpha", "Beta", "Gamma"]);
    }

    #[test]
    fn category_colors_parse_from_input() {
        let (name, color) = split_color("Lab #336699").unwrap();
        assert_eq!(name, "Lab");
        assert_eq!(swatch(&color.unwrap()), Color::Rgb(0x33, 0x66, 0x99));
        assert!(split_color("Lab #zz").is_err());
        assert_eq!(split_color("Build Farm").unwrap(), ("Build Farm".into(), None));
    }

    #[test]
    fn text_input_handles_multibyte_characters() {
        let mut input = TextInput::from("café".into());
        input.delete_back();
        input.insert('e');
        input.move_home();
        input.insert('>');
        assert_eq!(input.content, ">cafe");
    }

    #[test]
    fn quit_key_exits() {
        let mut app = app_with("Alpha");
        assert!(press(&mut app, KeyCode::Char('q')));
    }
}
