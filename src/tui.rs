use crate::config::LauncherConfig;
use crate::events::{Event, EventReceiver, OperationKind};
use crate::launch;
use crate::monitor;
use crate::process::{ProcessSnapshot, RECONCILE_INTERVAL, RunState, ToggleError, ToggleOutcome};
use crate::session::{self, Session};
use crate::update::{CheckoutError, CommitEntry, DEFAULT_HISTORY, HeadState};
use crate::versions::{Dimension, FactState, Scope, VersionFact};
use color_eyre::eyre::Context;
use crossterm::event::{self, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use crossterm::{cursor, execute};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table, TableState};
use ratatui::{Frame, Terminal};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

const TICK_RATE: Duration = Duration::from_millis(1000);
const INPUT_POLL: Duration = Duration::from_millis(100);
const ACTIVITY_LINES: usize = 6;

pub async fn run(
    session: &Session,
    events: &mut EventReceiver,
    state: &mut LauncherConfig,
) -> color_eyre::Result<()> {
    let _guard = TerminalGuard::new()?;
    let backend = CrosstermBackend::new(io::stdout());
    let mut terminal = Terminal::new(backend).context("failed to initialize terminal")?;
    terminal.clear().context("failed to clear terminal")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler =
        monitor::spawn_reconciler(session.supervisor.clone(), RECONCILE_INTERVAL, shutdown_rx);
    let (history_tx, mut history_rx) = mpsc::unbounded_channel();

    let mut app = App::new(session.supervisor.port());
    app.snapshot = Some(session.supervisor.snapshot().await);
    session.versions.refresh(Scope::All);
    load_history(session, history_tx.clone());
    let mut last_tick = Instant::now();

    loop {
        terminal.draw(|f| ui(f, &mut app))?;

        while let Ok(event) = events.try_recv() {
            session::record_state(state, &event);
            if app.apply(&event) {
                load_history(session, history_tx.clone());
                session.versions.refresh(Scope::Only(Dimension::Kernel));
            }
        }
        while let Ok(loaded) = history_rx.try_recv() {
            app.set_history(loaded);
        }

        let timeout = INPUT_POLL.min(TICK_RATE.saturating_sub(last_tick.elapsed()));
        let key = tokio::task::block_in_place(|| -> io::Result<Option<event::KeyEvent>> {
            if event::poll(timeout)?
                && let event::Event::Key(key) = event::read()?
                && key.kind == KeyEventKind::Press
            {
                return Ok(Some(key));
            }
            Ok(None)
        })
        .context("failed to read terminal events")?;

        if let Some(key) = key {
            match app.handle_key(key.code, key.modifiers) {
                Action::Quit => break,
                Action::Toggle => spawn_toggle(session),
                Action::RefreshVersions => {
                    session.versions.refresh(Scope::All);
                }
                Action::RefreshHistory => load_history(session, history_tx.clone()),
                Action::Update => {
                    let updates = session.updates.clone();
                    tokio::spawn(async move { updates.update_to_latest(true).await });
                }
                Action::UpdateAll => spawn_update_all(session),
                Action::Checkout(hash) => {
                    let updates = session.updates.clone();
                    tokio::spawn(async move { updates.checkout_commit(&hash).await });
                }
                Action::None => {}
            }
        }

        if last_tick.elapsed() >= TICK_RATE {
            app.snapshot = Some(session.supervisor.snapshot().await);
            last_tick = Instant::now();
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = reconciler.await;
    terminal.show_cursor().ok();
    Ok(())
}

type HistoryLoad = Result<(Vec<CommitEntry>, HeadState), String>;

fn load_history(session: &Session, tx: mpsc::UnboundedSender<HistoryLoad>) {
    let updates = session.updates.clone();
    tokio::spawn(async move {
        let loaded = async {
            let commits = updates.history(DEFAULT_HISTORY).await?;
            let head = updates.head_state().await?;
            Ok::<_, CheckoutError>((commits, head))
        }
        .await
        .map_err(|e| e.to_string());
        let _ = tx.send(loaded);
    });
}

const BATCH_PACKAGES: [Dimension; 2] = [Dimension::Frontend, Dimension::Templates];

/// Core update plus the frontend and templates packages. Each step reports
/// through its own operation event.
fn spawn_update_all(session: &Session) {
    let updates = session.updates.clone();
    let python = session.python();
    let index = session.config.mirrors.pip_index.clone();
    let dispatcher = session.dispatcher.clone();
    let versions = session.versions.clone();
    tokio::spawn(async move {
        let batch = session::update_all(
            &updates,
            &python,
            index.as_deref(),
            &BATCH_PACKAGES,
            &dispatcher,
        )
        .await;
        versions.refresh(batch.refresh_scope());
    });
}

fn spawn_toggle(session: &Session) {
    let supervisor = session.supervisor.clone();
    let resolver = session.resolver.clone();
    let config = session.config.clone();
    let dispatcher = session.dispatcher.clone();
    tokio::spawn(async move {
        let binding = resolver.resolve().await;
        let result = supervisor
            .toggle(|| launch::build(&config, &binding))
            .await;
        let kind = match &result {
            Ok(ToggleOutcome::Start(_)) | Err(ToggleError::Start(_)) => OperationKind::Start,
            Ok(ToggleOutcome::Stop(_)) | Err(ToggleError::Stop(_)) => OperationKind::Stop,
        };
        dispatcher.emit(Event::operation(kind, &result));
    });
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    None,
    Quit,
    Toggle,
    RefreshVersions,
    RefreshHistory,
    Update,
    UpdateAll,
    Checkout(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pending {
    Update,
    UpdateAll,
    Checkout(String),
}

struct App {
    port: u16,
    snapshot: Option<ProcessSnapshot>,
    facts: BTreeMap<Dimension, VersionFact>,
    commits: Vec<CommitEntry>,
    head: Option<HeadState>,
    table_state: TableState,
    pending: Option<Pending>,
    busy: bool,
    activity: VecDeque<(bool, String)>,
}

impl App {
    fn new(port: u16) -> Self {
        Self {
            port,
            snapshot: None,
            facts: BTreeMap::new(),
            commits: Vec::new(),
            head: None,
            table_state: TableState::default(),
            pending: None,
            busy: false,
            activity: VecDeque::new(),
        }
    }

    fn run_state(&self) -> RunState {
        self.snapshot.as_ref().map(|s| s.state).unwrap_or(RunState::Idle)
    }

    fn log(&mut self, ok: bool, message: String) {
        if self.activity.len() == ACTIVITY_LINES {
            self.activity.pop_front();
        }
        self.activity.push_back((ok, message));
    }

    /// Fold a dispatched event into the view. Returns true when the
    /// repository moved and history should be reloaded.
    fn apply(&mut self, event: &Event) -> bool {
        match event {
            Event::RunState { state, pid } => {
                let snapshot = self.snapshot.get_or_insert(ProcessSnapshot {
                    state: *state,
                    pid: None,
                    owned: false,
                    uptime: None,
                    command: None,
                });
                snapshot.state = *state;
                if pid.is_some() {
                    snapshot.pid = *pid;
                }
                false
            }
            Event::Version { fact } => {
                self.facts.insert(fact.dimension, fact.clone());
                false
            }
            Event::Operation {
                kind,
                success,
                message,
            } => {
                self.busy = false;
                self.log(*success, format!("{kind}: {message}"));
                *success && matches!(kind, OperationKind::Update | OperationKind::Checkout)
            }
            Event::SafeDirectoryMarked { root } => {
                self.log(true, format!("marked {} as safe.directory", root.display()));
                false
            }
            Event::ManagerGitApplied { path } => {
                self.log(true, format!("manager git set to {}", path.display()));
                false
            }
        }
    }

    fn set_history(&mut self, loaded: HistoryLoad) {
        match loaded {
            Ok((commits, head)) => {
                let selected = self.selected_commit().map(|c| c.hash.clone());
                self.commits = commits;
                self.head = Some(head);
                let idx = selected
                    .and_then(|h| self.commits.iter().position(|c| c.hash == h))
                    .or_else(|| self.commits.iter().position(|c| c.current))
                    .or((!self.commits.is_empty()).then_some(0));
                self.table_state.select(idx);
            }
            Err(e) => self.log(false, format!("history: {e}")),
        }
    }

    fn selected_commit(&self) -> Option<&CommitEntry> {
        self.table_state
            .selected()
            .and_then(|idx| self.commits.get(idx))
    }

    fn handle_key(&mut self, code: KeyCode, modifiers: KeyModifiers) -> Action {
        if let Some(pending) = self.pending.take() {
            return match code {
                KeyCode::Char('y') | KeyCode::Char('Y') => {
                    self.busy = true;
                    match pending {
                        Pending::Update => Action::Update,
                        Pending::UpdateAll => Action::UpdateAll,
                        Pending::Checkout(hash) => Action::Checkout(hash),
                    }
                }
                _ => {
                    self.log(false, "cancelled".to_string());
                    Action::None
                }
            };
        }

        match code {
            KeyCode::Char('q') | KeyCode::Esc => return Action::Quit,
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => return Action::Quit,
            KeyCode::Down | KeyCode::Char('j') => self.next(),
            KeyCode::Up | KeyCode::Char('k') => self.previous(),
            KeyCode::Char('s') if !self.busy => {
                self.busy = true;
                return Action::Toggle;
            }
            KeyCode::Char('r') => return Action::RefreshVersions,
            KeyCode::Char('h') => return Action::RefreshHistory,
            KeyCode::Char('u') if !self.busy => self.pending = Some(Pending::Update),
            KeyCode::Char('U') if !self.busy => self.pending = Some(Pending::UpdateAll),
            KeyCode::Char('c') | KeyCode::Enter if !self.busy => {
                if let Some(commit) = self.selected_commit() {
                    self.pending = Some(Pending::Checkout(commit.hash.clone()));
                }
            }
            _ => {}
        }
        Action::None
    }

    fn prompt(&self) -> Option<String> {
        match self.pending.as_ref()? {
            Pending::Update if self.run_state() == RunState::Running => Some(
                "update to latest? server is running, restart it afterwards (y/n)".to_string(),
            ),
            Pending::Update => Some("update to latest commit? (y/n)".to_string()),
            Pending::UpdateAll => Some(
                "update to latest commit and upgrade frontend and templates? (y/n)".to_string(),
            ),
            Pending::Checkout(hash) => Some(format!(
                "check out {}? uncommitted changes may be lost (y/n)",
                &hash[..hash.len().min(8)]
            )),
        }
    }

    fn next(&mut self) {
        let len = self.commits.len();
        if len == 0 {
            return;
        }
        let next = match self.table_state.selected() {
            Some(i) if i + 1 < len => i + 1,
            _ => 0,
        };
        self.table_state.select(Some(next));
    }

    fn previous(&mut self) {
        let len = self.commits.len();
        if len == 0 {
            return;
        }
        let prev = match self.table_state.selected() {
            Some(0) | None => len - 1,
            Some(i) => i - 1,
        };
        self.table_state.select(Some(prev));
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn ui(f: &mut Frame, app: &mut App) {
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Length(9),
            Constraint::Min(6),
            Constraint::Length(ACTIVITY_LINES as u16 + 2),
            Constraint::Length(2),
        ])
        .split(f.area());

    f.render_widget(banner_widget(app), layout[0]);

    let top = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Length(40), Constraint::Min(30)])
        .split(layout[1]);
    f.render_widget(server_widget(app), top[0]);
    f.render_widget(versions_widget(app), top[1]);

    let header = Row::new(vec![
        Cell::from("commit"),
        Cell::from("date"),
        Cell::from("author"),
        Cell::from("message"),
    ])
    .style(
        Style::default()
            .fg(Color::White)
            .bg(Color::DarkGray)
            .add_modifier(Modifier::BOLD),
    );
    let rows = app.commits.iter().enumerate().map(|(idx, c)| {
        let row_style = if idx % 2 == 0 {
            Style::default()
        } else {
            Style::default().bg(Color::Rgb(18, 18, 18))
        };
        let (hash_style, message) = if c.current {
            (
                Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
                format!("{}  *current", c.message),
            )
        } else {
            (Style::default().fg(Color::Cyan), c.message.clone())
        };
        Row::new(vec![
            Cell::from(c.short.clone()).style(hash_style),
            Cell::from(c.date.clone()),
            Cell::from(c.author.clone()),
            Cell::from(message),
        ])
        .style(row_style)
    });
    let widths = [
        Constraint::Length(10),
        Constraint::Length(11),
        Constraint::Length(16),
        Constraint::Min(20),
    ];
    let title = match &app.head {
        Some(head) => format!("History ({head})"),
        None => "History".to_string(),
    };
    let table = Table::new(rows, widths)
        .header(header)
        .block(
            Block::default()
                .title(title)
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::DarkGray)),
        )
        .row_highlight_style(
            Style::default()
                .bg(Color::LightBlue)
                .fg(Color::Black)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("> ");
    f.render_stateful_widget(table, layout[2], &mut app.table_state);

    f.render_widget(activity_widget(app), layout[3]);

    let footer = match app.prompt() {
        Some(prompt) => Paragraph::new(prompt).style(Style::default().fg(Color::Yellow)),
        None => Paragraph::new(
            "s start/stop | r versions | h history | u update | U update all | c checkout | ↑/↓ move | q quit",
        )
        .style(Style::default().fg(Color::DarkGray)),
    };
    f.render_widget(footer.block(Block::default().borders(Borders::TOP)), layout[4]);
}

fn banner_widget(app: &App) -> Paragraph<'static> {
    let bar_style = Style::default().bg(Color::DarkGray).fg(Color::White);
    let state = app.run_state();
    let line = Line::from(vec![
        Span::styled(" ComfyUI launcher ", bar_style.add_modifier(Modifier::BOLD)),
        Span::styled(" | ", bar_style),
        Span::styled("server: ", bar_style),
        Span::styled(
            state.to_string(),
            state_style(state).bg(Color::DarkGray).add_modifier(Modifier::BOLD),
        ),
        Span::styled(format!(" | port {} ", app.port), bar_style),
        Span::styled(if app.busy { "| working… " } else { "" }, bar_style),
    ]);
    Paragraph::new(Text::from(line)).style(bar_style)
}

fn server_widget(app: &App) -> Paragraph<'static> {
    let label_style = Style::default().fg(Color::Gray);
    let state = app.run_state();
    let snapshot = app.snapshot.as_ref();
    let pid = snapshot
        .and_then(|s| s.pid)
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());
    let owner = match snapshot {
        Some(s) if s.owned => "launcher",
        Some(_) if state == RunState::Running => "external",
        _ => "-",
    };
    let lines = vec![
        Line::from(vec![
            Span::styled("state   ", label_style),
            Span::styled(state.to_string(), state_style(state).add_modifier(Modifier::BOLD)),
        ]),
        Line::from(vec![Span::styled("pid     ", label_style), Span::raw(pid)]),
        Line::from(vec![Span::styled("owner   ", label_style), Span::raw(owner)]),
        Line::from(vec![
            Span::styled("uptime  ", label_style),
            Span::raw(format_uptime(snapshot.and_then(|s| s.uptime))),
        ]),
        Line::from(vec![
            Span::styled("url     ", label_style),
            Span::raw(format!("http://127.0.0.1:{}", app.port)),
        ]),
    ];
    Paragraph::new(Text::from(lines)).block(
        Block::default()
            .title("Server")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::DarkGray)),
    )
}

fn versions_widget(app: &App) -> Paragraph<'static> {
    let label_style = Style::default().fg(Color::Gray);
    let lines: Vec<Line> = Dimension::ALL
        .iter()
        .map(|d| {
            let (value, style) = match app.facts.get(d) {
                Some(f) if f.state == FactState::Pending => {
                    ("checking…".to_string(), fact_style(f.state))
                }
                Some(f) => (f.value.clone(), fact_style(f.state)),
                None => ("-".to_string(), label_style),
            };
            Line::from(vec![
                Span::styled(format!("{:<10}", d.to_string()), label_style),
                Span::styled(value, style),
            ])
        })
        .collect();
    Paragraph::new(Text::from(lines)).block(
        Block::default()
            .title("Versions")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::DarkGray)),
    )
}

fn activity_widget(app: &App) -> Paragraph<'static> {
    let lines: Vec<Line> = app
        .activity
        .iter()
        .map(|(ok, message)| {
            let style = if *ok {
                Style::default().fg(Color::Green)
            } else {
                Style::default().fg(Color::Red)
            };
            Line::from(Span::styled(message.clone(), style))
        })
        .collect();
    Paragraph::new(Text::from(lines)).block(
        Block::default()
            .title("Activity")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::DarkGray)),
    )
}

fn state_style(state: RunState) -> Style {
    match state {
        RunState::Running => Style::default().fg(Color::Green),
        RunState::Starting | RunState::Stopping => Style::default().fg(Color::Yellow),
        RunState::Idle => Style::default().fg(Color::Gray),
        RunState::Failed => Style::default().fg(Color::Red),
    }
}

fn fact_style(state: FactState) -> Style {
    match state {
        FactState::Resolved => Style::default().fg(Color::White),
        FactState::Pending => Style::default().fg(Color::Yellow),
        FactState::Failed => Style::default().fg(Color::Red),
    }
}

fn format_uptime(seconds: Option<u64>) -> String {
    match seconds {
        None => "-".to_string(),
        Some(s) if s < 60 => format!("{s}s"),
        Some(s) if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        Some(s) if s < 86400 => format!("{}h {}m", s / 3600, (s % 3600) / 60),
        Some(s) => format!("{}d {}h", s / 86400, (s % 86400) / 3600),
    }
}

struct TerminalGuard;

impl TerminalGuard {
    fn new() -> color_eyre::Result<Self> {
        enable_raw_mode().context("failed to enable raw mode")?;
        execute!(io::stdout(), EnterAlternateScreen, cursor::Hide)
            .context("failed to enter alternate screen")?;
        Ok(Self)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen, cursor::Show);
    }
}
