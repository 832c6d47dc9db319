use clap::{CommandFactory, Parser};
use color_eyre::eyre::{Context, bail};
use comfy_launcher::cli::{Cli, Command, ConfigAction};
use comfy_launcher::config::{self, LauncherConfig};
use comfy_launcher::events::{Event, EventReceiver, OperationKind};
use comfy_launcher::paths::Paths;
use comfy_launcher::process::{ObservedState, RunState, StartOutcome};
use comfy_launcher::session::{self, BatchUpdate, Session};
use comfy_launcher::update::{UpdateError, UpdateReport};
use comfy_launcher::versions::{Dimension, FactState, Scope, VersionFact};
use comfy_launcher::{monitor, pip, probe, sys, tui};
use comfy_table::{Attribute, Cell, Color, Table, presets::UTF8_FULL_CONDENSED};
use owo_colors::OwoColorize;
use serde::Serialize;
use std::io::IsTerminal;
use std::path::Path;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let paths = Paths::new()?;
    let _log_guard = comfy_launcher::logging::init(&paths, cli.verbose)?;
    let config_path = paths.config_file();
    let config = config::load_config(&config_path)
        .wrap_err_with(|| format!("failed to load {}", config_path.display()))?;

    if let Command::Config { action } = command {
        return config_command(action, &config_path, config, cli.json);
    }

    let mut state = config.clone();
    let (session, mut events) = Session::new(paths, config);
    let result = dispatch(command, &session, &mut events, &mut state, cli.json).await;

    session::drain_state(&mut state, &mut events);
    if state != session.config {
        config::save_config(&config_path, &state).wrap_err("failed to persist launcher state")?;
    }
    result
}

/// `state` collects persisted-state events seen while the command runs.
async fn dispatch(
    command: Command,
    session: &Session,
    events: &mut EventReceiver,
    state: &mut LauncherConfig,
    json: bool,
) -> color_eyre::Result<()> {
    match command {
        Command::Run => run_foreground(session, events, state, json).await,
        Command::Start => {
            let spec = session.launch_spec().await?;
            let outcome = session.supervisor.start(spec).await?;
            if json {
                print_json(&outcome)?;
            } else {
                print_start(&outcome, session.supervisor.port());
            }
            Ok(())
        }
        Command::Stop => {
            let outcome = session.supervisor.stop().await?;
            if json {
                print_json(&outcome)?;
            } else {
                println!("{}", outcome.to_string().green());
            }
            Ok(())
        }
        Command::Toggle => {
            let binding = session.git_binding().await;
            let outcome = session
                .supervisor
                .toggle(|| comfy_launcher::launch::build(&session.config, &binding))
                .await?;
            if json {
                print_json(&outcome)?;
            } else {
                println!("{}", outcome.to_string().green());
            }
            Ok(())
        }
        Command::Status => status(session, json).await,
        Command::Versions { only } => {
            let scope = match only.len() {
                0 => Scope::All,
                1 => Scope::Only(only[0]),
                _ => Scope::Selected(only),
            };
            session.versions.refresh(scope).await?;
            let facts = session.versions.facts();
            if json {
                print_json(&facts)?;
            } else {
                print_facts(&facts);
            }
            Ok(())
        }
        Command::Update {
            yes,
            frontend,
            templates,
        } => {
            let packages: Vec<Dimension> = [
                (frontend, Dimension::Frontend),
                (templates, Dimension::Templates),
            ]
            .into_iter()
            .filter_map(|(selected, d)| selected.then_some(d))
            .collect();
            update(session, yes, &packages, json).await
        }
        Command::Checkout { hash, yes } => checkout(session, &hash, yes, json).await,
        Command::History { limit } => {
            let commits = session.updates.history(limit).await?;
            if json {
                print_json(&commits)?;
                return Ok(());
            }
            if let Ok(head) = session.updates.head_state().await {
                println!("{} {}", "HEAD:".dimmed(), head.to_string().cyan());
            }
            let mut table = Table::new();
            table.load_preset(UTF8_FULL_CONDENSED);
            table.set_header(header(&["commit", "date", "author", "message"]));
            for c in &commits {
                let message = if c.current {
                    format!("{}  *current", c.message)
                } else {
                    c.message.clone()
                };
                let hash = Cell::new(&c.short);
                table.add_row(vec![
                    if c.current { hash.fg(Color::Green) } else { hash.fg(Color::Cyan) },
                    Cell::new(&c.date),
                    Cell::new(&c.author),
                    Cell::new(message),
                ]);
            }
            println!("{table}");
            Ok(())
        }
        Command::Git { refresh } => {
            let binding = if refresh {
                session.resolver.refresh().await
            } else {
                session.git_binding().await
            };
            if json {
                print_json(&binding)?;
            } else {
                match &binding.path {
                    Some(path) => println!(
                        "{} {} ({})",
                        "git:".dimmed(),
                        path.display(),
                        binding.provenance.to_string().cyan()
                    ),
                    None => println!("{}", "git unavailable".red()),
                }
            }
            Ok(())
        }
        Command::Upgrade { package, index } => {
            let index = index.or_else(|| session.config.mirrors.pip_index.clone());
            let python = session.python();
            let result = pip::install_or_update(&python, &package, index.as_deref(), true).await;
            session.dispatcher.emit(Event::Operation {
                kind: OperationKind::Install,
                success: result.success,
                message: format!("{package}: {result}"),
            });
            if json {
                print_json(&result)?;
                return Ok(());
            }
            if !result.success {
                bail!("{package}: {result}");
            }
            println!("{} {}", package.cyan().bold(), result.to_string().green());
            session.versions.refresh(Scope::python_related()).await?;
            print_facts(&session.versions.facts());
            Ok(())
        }
        Command::Dashboard => tui::run(session, events, state).await,
        Command::Config { .. } => bail!("config is handled before the session starts"),
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

async fn run_foreground(
    session: &Session,
    events: &mut EventReceiver,
    state: &mut LauncherConfig,
    json: bool,
) -> color_eyre::Result<()> {
    let spec = session.launch_spec().await?;
    let outcome = session.supervisor.start(spec).await?;
    if json {
        print_json(&outcome)?;
    } else {
        print_start(&outcome, session.supervisor.port());
    }
    if matches!(outcome, StartOutcome::AlreadyRunning { .. }) {
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let reconciler = monitor::spawn_reconciler(
        session.supervisor.clone(),
        comfy_launcher::process::RECONCILE_INTERVAL,
        shutdown_rx,
    );

    let interrupted = sys::signal_shutdown();
    tokio::pin!(interrupted);
    let exited = loop {
        tokio::select! {
            _ = &mut interrupted => break false,
            event = events.recv() => {
                let Some(event) = event else { break false };
                session::record_state(state, &event);
                if let Event::RunState { state: run_state, .. } = event {
                    if !json {
                        println!("{} {}", "state:".dimmed(), state_label(run_state));
                    }
                    if run_state == RunState::Idle {
                        break true;
                    }
                }
            }
        }
    };
    let _ = shutdown_tx.send(true);
    let _ = reconciler.await;

    if exited {
        bail!("server exited");
    }
    if session.supervisor.reconcile().await == ObservedState::Running {
        let outcome = session.supervisor.stop().await?;
        if json {
            print_json(&outcome)?;
        } else {
            println!("{}", outcome.to_string().green());
        }
    }
    Ok(())
}

async fn status(session: &Session, json: bool) -> color_eyre::Result<()> {
    #[derive(Serialize)]
    struct Status {
        #[serde(flatten)]
        process: comfy_launcher::process::ProcessSnapshot,
        port: u16,
        http_ready: bool,
    }

    session.supervisor.reconcile().await;
    let port = session.supervisor.port();
    let status = Status {
        process: session.supervisor.snapshot().await,
        port,
        http_ready: probe::is_http_ready(port).await,
    };
    if json {
        return print_json(&status);
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(header(&["state", "port", "pid", "http", "owner"]));
    let pid = status
        .process
        .pid
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());
    let http = if status.http_ready { "ready" } else { "-" };
    let owner = if status.process.owned { "launcher" } else { "external" };
    table.add_row(vec![
        Cell::new(status.process.state.to_string()).fg(state_color(status.process.state)),
        Cell::new(port.to_string()),
        Cell::new(pid),
        Cell::new(http),
        Cell::new(if status.process.state == RunState::Running { owner } else { "-" }),
    ]);
    println!("{table}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

fn confirm(message: &str) -> color_eyre::Result<bool> {
    if !std::io::stdin().is_terminal() {
        bail!("confirmation required; pass --yes to proceed");
    }
    Ok(cliclack::confirm(message).initial_value(false).interact()?)
}

async fn update(
    session: &Session,
    yes: bool,
    packages: &[Dimension],
    json: bool,
) -> color_eyre::Result<()> {
    if !yes {
        match session.updates.update_to_latest(false).await {
            Err(UpdateError::ConfirmationRequired { instance_running }) => {
                let mut message = String::from("Update ComfyUI to the latest commit");
                let names: Vec<&str> = packages.iter().filter_map(|d| d.package()).collect();
                if !names.is_empty() {
                    message.push_str(&format!(" and upgrade {}", names.join(", ")));
                }
                message.push('?');
                if instance_running {
                    message.push_str(" The server is running and should be restarted afterwards.");
                }
                if !confirm(&message)? {
                    bail!("update cancelled");
                }
            }
            other => return print_update(other, json),
        }
    }
    if packages.is_empty() {
        print_update(session.updates.update_to_latest(true).await, json)?;
        return refresh_and_print(session, Scope::Only(Dimension::Kernel), json).await;
    }

    let batch = session.update_all(packages).await;
    if json {
        print_json(&batch)?;
    } else {
        print_batch(&batch);
    }
    refresh_and_print(session, batch.refresh_scope(), json).await?;
    if !batch.success() {
        bail!("update finished with errors");
    }
    Ok(())
}

fn print_batch(batch: &BatchUpdate) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(header(&["component", "result"]));
    let core = match (&batch.core, &batch.core_error) {
        (Some(report), _) => Cell::new(report.to_string()).fg(Color::Green),
        (None, error) => Cell::new(error.as_deref().unwrap_or("update failed")).fg(Color::Red),
    };
    table.add_row(vec![Cell::new("ComfyUI").fg(Color::Cyan), core]);
    for p in &batch.packages {
        let color = if p.result.success { Color::Green } else { Color::Red };
        table.add_row(vec![
            Cell::new(&p.package).fg(Color::Cyan),
            Cell::new(p.result.to_string()).fg(color),
        ]);
    }
    println!("{table}");
}

/// Re-query `scope` after a change and show the new values.
async fn refresh_and_print(session: &Session, scope: Scope, json: bool) -> color_eyre::Result<()> {
    let dims = scope.dimensions();
    session.versions.refresh(scope).await?;
    if !json {
        let facts: Vec<VersionFact> = dims
            .into_iter()
            .filter_map(|d| session.versions.fact(d))
            .collect();
        print_facts(&facts);
    }
    Ok(())
}

fn print_update(result: Result<UpdateReport, UpdateError>, json: bool) -> color_eyre::Result<()> {
    let report = result?;
    if json {
        print_json(&report)?;
    } else {
        if report.reattached {
            println!("{} {}", "switched to".yellow(), report.branch.cyan());
        }
        println!("{}", report.to_string().green());
    }
    Ok(())
}

async fn checkout(session: &Session, hash: &str, yes: bool, json: bool) -> color_eyre::Result<()> {
    if !yes {
        let changes = session.updates.pending_changes().await.unwrap_or_default();
        let message = if changes.is_empty() {
            format!("Check out {hash}? HEAD will be detached.")
        } else {
            format!(
                "Check out {hash}? {} uncommitted change(s) may be lost.",
                changes.len()
            )
        };
        if !confirm(&message)? {
            bail!("checkout cancelled");
        }
    }
    let head = session.updates.checkout_commit(hash).await?;
    if json {
        print_json(&head)?;
    } else {
        println!("{} {}", "checked out".green(), head.to_string().cyan());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn config_command(
    action: ConfigAction,
    config_path: &Path,
    config: LauncherConfig,
    json: bool,
) -> color_eyre::Result<()> {
    match action {
        ConfigAction::Path => println!("{}", config_path.display()),
        ConfigAction::Show => {
            if json {
                print_json(&config)?;
            } else {
                print!("{}", toml::to_string_pretty(&config)?);
            }
        }
        ConfigAction::Set { key, value } => {
            let updated = config::set_value(&config, &key, &value)?;
            config::save_config(config_path, &updated)?;
            if json {
                print_json(&updated)?;
            } else {
                println!("{} {} = {}", "set".green(), key.cyan(), value);
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_json<T: Serialize>(value: &T) -> color_eyre::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn header(names: &[&str]) -> Vec<Cell> {
    names
        .iter()
        .map(|n| Cell::new(n).add_attribute(Attribute::Bold))
        .collect()
}

fn print_start(outcome: &StartOutcome, port: u16) {
    match outcome {
        StartOutcome::Started { pid } => {
            println!(
                "{} pid {} on port {}",
                "started".green(),
                pid.to_string().cyan(),
                port
            );
        }
        StartOutcome::AlreadyRunning { .. } => {
            println!("{} {}", "already running:".yellow(), outcome);
        }
    }
}

fn state_color(state: RunState) -> Color {
    match state {
        RunState::Running => Color::Green,
        RunState::Starting | RunState::Stopping => Color::Yellow,
        RunState::Idle => Color::Reset,
        RunState::Failed => Color::Red,
    }
}

fn state_label(state: RunState) -> String {
    let s = state.to_string();
    match state {
        RunState::Running => s.green().to_string(),
        RunState::Starting | RunState::Stopping => s.yellow().to_string(),
        RunState::Idle => s,
        RunState::Failed => s.red().to_string(),
    }
}

fn fact_color(state: FactState) -> Color {
    match state {
        FactState::Resolved => Color::Green,
        FactState::Pending => Color::Yellow,
        FactState::Failed => Color::Red,
    }
}

fn print_facts(facts: &[VersionFact]) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(header(&["component", "version", "checked"]));
    for fact in facts {
        table.add_row(vec![
            Cell::new(fact.dimension.to_string()).fg(Color::Cyan),
            Cell::new(&fact.value).fg(fact_color(fact.state)),
            Cell::new(fact.fetched_at.format("%H:%M:%S").to_string()),
        ]);
    }
    println!("{table}");
}
