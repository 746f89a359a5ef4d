use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{info, warn};

use secrecy::SecretString;
use veritas_core::{Session, SessionFamily, SessionId, SessionPhase, StreamEvent};
use veritas_sessions::{BackgroundPersister, ProjectionConfig, SessionRegistry};
use veritas_settings::VeritasSettings;
use veritas_store::{migrate_document, Database, PersistenceMigrator, SlotRepo, SlotStore};
use veritas_stream::{
    DeepResearchRequest, DeepResearchSource, EventSource, EventStreamClient, HttpEventSource,
};
use veritas_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "veritas", version, about = "Local session store for the research backend")]
struct Cli {
    /// Session collection to operate on.
    #[arg(long, value_enum, default_value_t = Family::Research, global = true)]
    family: Family,

    /// Settings file (defaults to ~/.veritas/settings.json).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Family {
    Ask,
    Research,
}

impl From<Family> for SessionFamily {
    fn from(f: Family) -> Self {
        match f {
            Family::Ask => SessionFamily::Ask,
            Family::Research => SessionFamily::Research,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Inspect and edit the session collection.
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
    /// Follow a session's event stream until it finishes.
    Watch {
        /// Session id; the active session when omitted.
        session: Option<String>,
    },
    /// Run the research pipeline on a session's plan and follow its
    /// progress. Confirms the plan first when it is still pending. The API
    /// key is read from VERITAS_API_KEY.
    Research {
        /// Session id; the active session when omitted.
        session: Option<String>,
    },
    /// Rewrite both collections in the current format.
    Migrate {
        /// Report what would change without writing.
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum SessionsAction {
    List,
    /// Create a session, optionally submitting its first question.
    New { question: Option<String> },
    Delete { session: String },
    Activate { session: String },
    Rename { session: String, title: String },
    /// Print a session as JSON.
    Show { session: Option<String> },
    /// Delete every session in the collection.
    Reset,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => veritas_settings::load_settings_from_path(path),
        None => veritas_settings::load_settings(),
    }
    .context("failed to load settings")?;

    init_telemetry(&TelemetryConfig::from_level_name(
        &settings.logging.level,
        settings.logging.json,
    ));

    let db = Database::open(&settings.storage.db_path).with_context(|| {
        format!("failed to open {}", settings.storage.db_path.display())
    })?;
    let store: Arc<dyn SlotStore> = Arc::new(SlotRepo::new(db));
    let family = SessionFamily::from(cli.family);
    let migrator = PersistenceMigrator::new(Arc::clone(&store), family);

    match cli.command {
        Command::Sessions { action } => {
            let mut registry =
                SessionRegistry::open(migrator).with_projection(projection_config(&settings));
            run_sessions(&mut registry, action)
        }
        Command::Watch { session } => watch(&settings, migrator, session).await,
        Command::Research { session } => research(&settings, migrator, session).await,
        Command::Migrate { dry_run } => run_migrate(&store, dry_run),
    }
}

fn projection_config(settings: &VeritasSettings) -> ProjectionConfig {
    ProjectionConfig {
        answer_stage: settings.projection.answer_stage.clone(),
        verification_stage: settings.projection.verification_stage.clone(),
        title_max_chars: settings.projection.title_max_chars,
    }
}

/// An explicit id must name a member; no id means the active session.
fn resolve(registry: &SessionRegistry, raw: Option<&str>) -> anyhow::Result<SessionId> {
    let id = match raw {
        Some(raw) => SessionId::from_raw(raw),
        None => match registry.active_id() {
            Some(id) => id.clone(),
            None => bail!("no active {} session", registry.family()),
        },
    };
    if registry.get(&id).is_none() {
        bail!("unknown {} session {id}", registry.family());
    }
    Ok(id)
}

fn run_sessions(registry: &mut SessionRegistry, action: SessionsAction) -> anyhow::Result<()> {
    match action {
        SessionsAction::List => {
            let active = registry.active_id().cloned();
            for session in registry.sessions() {
                let marker = if Some(&session.id) == active.as_ref() { '*' } else { ' ' };
                println!(
                    "{marker} {}  {:<11} {:>4}  {}",
                    session.id,
                    session.phase.as_str(),
                    session.messages.len(),
                    session.title
                );
            }
        }
        SessionsAction::New { question } => {
            let id = registry.create_session(question.as_deref()).id.clone();
            if let Some(question) = question {
                registry.submit_question(&id, &question)?;
            }
            println!("{id}");
        }
        SessionsAction::Delete { session } => {
            let id = resolve(registry, Some(&session))?;
            let removed = registry.delete_session(&id)?;
            println!("deleted {} ({})", removed.id, removed.title);
        }
        SessionsAction::Activate { session } => {
            let id = resolve(registry, Some(&session))?;
            registry.set_active(&id)?;
        }
        SessionsAction::Rename { session, title } => {
            let id = resolve(registry, Some(&session))?;
            registry.rename(&id, &title)?;
        }
        SessionsAction::Show { session } => {
            let id = resolve(registry, session.as_deref())?;
            if let Some(session) = registry.get(&id) {
                println!("{}", serde_json::to_string_pretty(session)?);
            }
        }
        SessionsAction::Reset => registry.reset(),
    }
    Ok(())
}

fn live_registry(
    settings: &VeritasSettings,
    migrator: PersistenceMigrator,
) -> (SessionRegistry, Arc<BackgroundPersister>) {
    let persister = Arc::new(BackgroundPersister::spawn(migrator.clone()));
    let registry = SessionRegistry::new(migrator.family(), migrator.load(), persister.clone())
        .with_projection(projection_config(settings));
    (registry, persister)
}

async fn watch(
    settings: &VeritasSettings,
    migrator: PersistenceMigrator,
    session: Option<String>,
) -> anyhow::Result<()> {
    let family = migrator.family();
    let (registry, persister) = live_registry(settings, migrator);
    let id = resolve(&registry, session.as_deref())?;

    let source = HttpEventSource::new(
        &settings.backend.base_url,
        family,
        settings.backend.connect_timeout(),
        settings.backend.idle_timeout(),
    )?;
    info!(url = %source.events_url(&id), "watching session");
    follow(source, registry, persister, id).await
}

async fn research(
    settings: &VeritasSettings,
    migrator: PersistenceMigrator,
    session: Option<String>,
) -> anyhow::Result<()> {
    if migrator.family() != SessionFamily::Research {
        bail!("the research pipeline runs on research sessions only");
    }
    let api_key = match std::env::var("VERITAS_API_KEY") {
        Ok(key) if !key.trim().is_empty() => SecretString::from(key),
        _ => bail!("VERITAS_API_KEY is not set"),
    };

    let (mut registry, persister) = live_registry(settings, migrator);
    let id = resolve(&registry, session.as_deref())?;
    let phase = registry.get(&id).map(|s| s.phase);
    if phase == Some(SessionPhase::Planning) {
        registry.confirm_plan(&id)?;
    }
    let Some(context_state) = registry.get(&id).and_then(|s| s.context_state.clone()) else {
        bail!("session {id} has no research plan");
    };
    if !context_state.has_plan() {
        bail!("session {id} has no research plan");
    }

    let cfg = &settings.research;
    let request = DeepResearchRequest {
        context_state,
        api_key,
        provider: cfg.provider.clone(),
        work_model: cfg.work_model.clone(),
        final_model: cfg.final_model.clone(),
        language: cfg.language.clone(),
        llm_base_url: cfg.llm_base_url.clone(),
    };
    let source = DeepResearchSource::new(
        &settings.backend.base_url,
        request,
        settings.backend.connect_timeout(),
        cfg.idle_timeout(),
    )?;
    info!(url = %source.url(), mode = ?source.mode(), "starting research");
    follow(source, registry, persister, id).await
}

/// Connect the stream client for one session and fold every event into the
/// registry until a terminal event arrives or the user interrupts.
async fn follow<S: EventSource>(
    source: S,
    registry: SessionRegistry,
    persister: Arc<BackgroundPersister>,
    id: SessionId,
) -> anyhow::Result<()> {
    let registry = Arc::new(Mutex::new(registry));
    let client = EventStreamClient::new(source);

    let (finished_tx, finished_rx) = oneshot::channel();
    let mut finished_tx = Some(finished_tx);
    let handler_registry = Arc::clone(&registry);
    let handler_id = id.clone();
    client.connect(id, move |event| {
        let terminal = event.is_terminal();
        let mut registry = handler_registry.lock();
        let before = tail_signature(registry.get(&handler_id));
        if let Err(err) = registry.apply_event(&handler_id, &event) {
            warn!(kind = event.kind(), error = %err, "event not applied");
        }
        if let Some(session) = registry.get(&handler_id) {
            if tail_signature(Some(session)) != before {
                print_tail(session);
            }
        }
        if terminal {
            if let Some(tx) = finished_tx.take() {
                let _ = tx.send(event);
            }
        }
    });

    let outcome = tokio::select! {
        event = finished_rx => event.ok(),
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl+c")?;
            info!("interrupted");
            None
        }
    };
    client.disconnect();
    persister.flush().await;

    if let Some(StreamEvent::Error { message, .. }) = outcome {
        bail!("stream ended with an error: {message}");
    }
    Ok(())
}

fn tail_signature(session: Option<&Session>) -> Option<(usize, String)> {
    let session = session?;
    let tail = session.messages.last()?;
    Some((session.messages.len(), tail.content.clone()))
}

fn print_tail(session: &Session) {
    if let Some(message) = session.messages.last() {
        println!("[{} | {}] {}", session.phase, message.kind(), message.content);
    }
}

fn run_migrate(store: &Arc<dyn SlotStore>, dry_run: bool) -> anyhow::Result<()> {
    for family in [SessionFamily::Ask, SessionFamily::Research] {
        let Some(raw) = store.read(family.slot())? else {
            println!("{family}: empty");
            continue;
        };
        let (state, report) = migrate_document(&raw);
        println!(
            "{family}: {} sessions, {} dropped, {} ids assigned, {} phases inferred, {} messages repaired, {} messages dropped{}",
            report.sessions,
            report.sessions_dropped,
            report.ids_assigned,
            report.phases_inferred,
            report.messages_repaired,
            report.messages_dropped,
            if report.active_repaired { ", active pointer repaired" } else { "" },
        );
        if !dry_run {
            PersistenceMigrator::new(Arc::clone(store), family)
                .try_save(&state)
                .with_context(|| format!("failed to write {family} sessions"))?;
        }
    }
    Ok(())
}
