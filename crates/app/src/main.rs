mod auth;
mod bot;
mod directory;
mod dispatch;
mod handlers;
mod store;

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result, anyhow, bail};
use axum::{
    Extension, Json, Router,
    extract::{Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher, recommended_watcher};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::{net::TcpListener, signal, sync::mpsc, task::JoinSet, time::sleep};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::{AuthConfig, TokenChecker};
use crate::bot::{Bot, BuildOptions, BuildOutcome};
use crate::directory::StaticDirectory;
use crate::dispatch::{
    Action, ActionDispatcher, DispatchError, GroupDirectory, HandlerRegistry, Recipient,
};
use crate::handlers::{DeliveryRecord, HandlerKind, Outbox, SharedOutbox, build_registry};
use crate::store::{
    BuildRecord, BuildResultStore, FileBuildResultStore, InMemoryBuildResultStore,
};

static APP_NAME: &str = "bot-gateway";
static DEFAULT_CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::default);

#[derive(Parser, Debug)]
#[command(name = "bot-gateway", version, about = "Scenario bot gateway CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway HTTP server
    Serve(ServeArgs),
    /// Bot scenario utilities
    Bots {
        #[command(subcommand)]
        command: BotsCommand,
    },
    /// Action dispatch utilities
    Action {
        #[command(subcommand)]
        command: ActionCommand,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Path to the configuration file (defaults to config/dev.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<Utf8PathBuf>,
    /// Enable scenario hot-reload (dev only)
    #[arg(long)]
    watch: bool,
}

#[derive(Subcommand, Debug)]
enum BotsCommand {
    /// List configured bots and their scenario files
    List,
    /// Build one bot's scenario locally
    Build(BotsBuildArgs),
    /// Rebuild scenarios locally or via HTTP
    Reload(BotsReloadArgs),
}

#[derive(Args, Debug)]
struct BotsBuildArgs {
    #[arg(long)]
    name: String,
    /// Rebuild even when the scenario file is unchanged
    #[arg(long)]
    force: bool,
    /// Skip existence checks for dialog image attachments
    #[arg(long)]
    skip_image: bool,
}

#[derive(Args, Debug, Default)]
struct BotsReloadArgs {
    /// When provided, issue POST {server}/bots/reload instead of local rebuild
    #[arg(long)]
    server: Option<String>,
}

#[derive(Subcommand, Debug)]
enum ActionCommand {
    /// Send an action to a recipient through a running gateway
    Send(ActionSendArgs),
}

#[derive(Args, Debug)]
struct ActionSendArgs {
    #[arg(long)]
    bot: String,
    /// Recipient string, e.g. slack:U123 or group:team-a
    #[arg(long)]
    user: String,
    /// Action string, e.g. weather?city=tokyo
    #[arg(long)]
    action: String,
    #[arg(long)]
    token: Option<String>,
    #[arg(long, default_value = "http://localhost:8080")]
    server: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AppConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    scenarios: ScenarioConfig,
    #[serde(default)]
    bots: Vec<BotConfig>,
    #[serde(default)]
    directory: DirectoryConfig,
    #[serde(default)]
    auth: AuthConfig,
    #[serde(default)]
    stores: StoresConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScenarioConfig {
    #[serde(default = "default_scenarios_root")]
    root: Utf8PathBuf,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            root: default_scenarios_root(),
        }
    }
}

fn default_scenarios_root() -> Utf8PathBuf {
    Utf8PathBuf::from("scenarios")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BotConfig {
    name: String,
    /// Scenario YAML path, resolved against the workspace root when relative.
    scenario: Utf8PathBuf,
    #[serde(default)]
    services: HashMap<String, HandlerKind>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DirectoryConfig {
    #[serde(default)]
    groups: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoresConfig {
    #[serde(default = "StoreConfig::memory")]
    build: StoreConfig,
}

impl Default for StoresConfig {
    fn default() -> Self {
        Self {
            build: StoreConfig::memory(),
        }
    }
}

fn default_build_store_path() -> Utf8PathBuf {
    Utf8PathBuf::from(".data/builds.json")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreConfig {
    #[serde(default)]
    backend: StoreBackend,
    redis_url: Option<String>,
    #[serde(default)]
    file_path: Option<Utf8PathBuf>,
}

impl StoreConfig {
    fn memory() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: None,
            file_path: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::memory()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
enum StoreBackend {
    #[default]
    Memory,
    File,
    Redis,
}

type SharedBuildStore = Arc<dyn BuildResultStore>;
type BotsMap = HashMap<String, BotRuntime>;

/// One configured bot with its per-service dispatcher.
#[derive(Clone)]
struct BotRuntime {
    bot: Arc<Bot>,
    dispatcher: Arc<ActionDispatcher>,
}

#[derive(Clone)]
#[allow(dead_code)]
struct AppState {
    config: AppConfig,
    bots: Arc<BotsMap>,
    store: SharedBuildStore,
    outbox: SharedOutbox,
    build_queue: BuildQueue,
    tokens: Arc<TokenChecker>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ActionParams {
    user: Option<String>,
    action: Option<String>,
    token: Option<String>,
}

impl ActionParams {
    fn merge_with(self, other: Option<ActionParams>) -> Self {
        let mut merged = self;
        if let Some(override_input) = other {
            if override_input.user.is_some() {
                merged.user = override_input.user;
            }
            if override_input.action.is_some() {
                merged.action = override_input.action;
            }
            if override_input.token.is_some() {
                merged.token = override_input.token;
            }
        }
        merged
    }
}

#[derive(Debug, Serialize)]
struct ActionResponse {
    ok: bool,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    ok: bool,
    error: String,
}

#[derive(Debug, Serialize)]
struct BuildResponse {
    ok: bool,
    message: String,
}

#[derive(Debug, Serialize)]
struct BuildQueuedResponse {
    ok: bool,
    job_id: Uuid,
}

#[derive(Debug, Serialize)]
struct BotListResponse {
    count: usize,
    bots: Vec<BotInfo>,
}

#[derive(Debug, Serialize)]
struct BotInfo {
    name: String,
    scenario: String,
    built: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dialogs: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ReloadResponse {
    count: usize,
    bots: Vec<BotReloadOutcome>,
}

#[derive(Debug, Serialize)]
struct BotReloadOutcome {
    name: String,
    ok: bool,
    changed: bool,
    detail: String,
}

#[derive(Debug)]
struct BuildJob {
    job_id: Uuid,
    bot: String,
    options: BuildOptions,
}

#[derive(Clone)]
struct BuildQueue {
    tx: mpsc::UnboundedSender<BuildJob>,
}

impl BuildQueue {
    fn new(tx: mpsc::UnboundedSender<BuildJob>) -> Self {
        Self { tx }
    }

    fn submit(&self, job: BuildJob) {
        if let Err(err) = self.tx.send(job) {
            error!(?err, "failed to enqueue build job");
        }
    }
}

/// Scenario reload failed before the dispatcher ran, or the dispatch itself
/// failed; the two map to different responses.
enum ActionFailure {
    Reload(crate::bot::BuildError),
    Dispatch(DispatchError),
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await?,
        Command::Bots { command } => handle_bots(command)?,
        Command::Action { command } => handle_action(command)?,
    }

    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = load_config(args.config.as_ref())?;
    let directory = StaticDirectory::from_config(&config.directory.groups)?;
    let outbox = Outbox::new();
    let store = build_result_store(&config.stores.build)?;
    let bots = Arc::new(build_bot_runtimes(&config, &directory, &outbox)?);
    let tokens = Arc::new(TokenChecker::new(&config.auth));
    let (build_tx, build_rx) = mpsc::unbounded_channel();
    let build_queue = BuildQueue::new(build_tx);
    tokio::spawn(build_worker_loop(build_rx, bots.clone(), store.clone()));
    let state = AppState {
        config: config.clone(),
        bots,
        store,
        outbox,
        build_queue,
        tokens,
    };

    info!(
        backend = ?config.stores.build.backend,
        file_path = ?config.stores.build.file_path,
        "build result store configured"
    );
    info!(
        bots = state.bots.len(),
        groups = directory.group_count(),
        auth = state.tokens.enabled(),
        watch = args.watch,
        "starting gateway"
    );

    for outcome in reload_all_bots(&state) {
        if outcome.ok {
            info!(bot = %outcome.name, detail = %outcome.detail, "scenario warmed");
        } else {
            warn!(bot = %outcome.name, detail = %outcome.detail, "scenario warmup failed");
        }
    }

    let addr: SocketAddr = config
        .server
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.server.listen_addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening for HTTP traffic");

    let mut tasks = JoinSet::new();
    if args.watch {
        let watch_state = state.clone();
        let root = workspace_root().join(&config.scenarios.root);
        tasks.spawn(async move {
            if let Err(err) = watch_scenarios(root, watch_state).await {
                warn!(?err, "scenario watch failed");
            }
        });
    }

    let server_task = tokio::spawn(async move {
        axum::serve(listener, build_router(state).into_make_service())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("server exited with an error")
    });

    if let Err(err) = server_task.await.expect("server task panicked") {
        error!(?err, "server task failed");
    }

    while let Some(res) = tasks.join_next().await {
        if let Err(err) = res {
            warn!(?err, "watch task ended unexpectedly");
        }
    }

    info!("server shut down cleanly");

    Ok(())
}

fn handle_bots(cmd: BotsCommand) -> Result<()> {
    match cmd {
        BotsCommand::List => list_bots_cli()?,
        BotsCommand::Build(args) => build_bot_cli(args)?,
        BotsCommand::Reload(args) => reload_bots_cli(args)?,
    }

    Ok(())
}

fn handle_action(cmd: ActionCommand) -> Result<()> {
    match cmd {
        ActionCommand::Send(args) => action_send_cli(args)?,
    }

    Ok(())
}

fn list_bots_cli() -> Result<()> {
    let config = load_config(None)?;
    if config.bots.is_empty() {
        println!("No bots configured.");
        return Ok(());
    }

    println!("Configured {} bot(s):", config.bots.len());
    for bot in &config.bots {
        let path = resolve_scenario_path(&bot.scenario);
        let status = if path.exists() { "present" } else { "missing" };
        let mut services: Vec<&str> = bot.services.keys().map(String::as_str).collect();
        services.sort_unstable();
        println!(
            "- {} @ {path} [scenario {status}] services: {}",
            bot.name,
            services.join(", ")
        );
    }
    Ok(())
}

fn build_bot_cli(args: BotsBuildArgs) -> Result<()> {
    let config = load_config(None)?;
    let bot_config = config
        .bots
        .iter()
        .find(|b| b.name == args.name)
        .ok_or_else(|| anyhow!("bot {:?} is not configured", args.name))?;
    let bot = Bot::new(&bot_config.name, resolve_scenario_path(&bot_config.scenario));
    let options = BuildOptions {
        force: args.force,
        skip_image: args.skip_image,
    };

    match bot.build(&options) {
        Ok(BuildOutcome::Built(summary)) => println!("Built {}: {summary}", bot.name()),
        Ok(BuildOutcome::Unchanged) => {
            println!("Scenario for {} unchanged; nothing to do.", bot.name())
        }
        Err(err) => bail!("build failed for {}: {err}", args.name),
    }
    Ok(())
}

fn reload_bots_cli(args: BotsReloadArgs) -> Result<()> {
    if let Some(server) = args.server {
        let url = format!("{}/bots/reload", server.trim_end_matches('/'));
        let resp = ureq::post(&url)
            .send_empty()
            .map_err(|err| anyhow!("HTTP reload failed: {err}"))?;
        let body: Value = resp
            .into_body()
            .read_json()
            .map_err(|err| anyhow!("failed to parse /bots/reload response: {err}"))?;
        println!("Server reload succeeded: {body}");
        return Ok(());
    }

    let config = load_config(None)?;
    if config.bots.is_empty() {
        println!("No bots configured.");
        return Ok(());
    }
    for bot_config in &config.bots {
        let bot = Bot::new(&bot_config.name, resolve_scenario_path(&bot_config.scenario));
        match bot.check_reload() {
            Ok(BuildOutcome::Built(summary)) => println!("- {}: {summary}", bot.name()),
            Ok(BuildOutcome::Unchanged) => println!("- {}: unchanged", bot.name()),
            Err(err) => println!("- {}: FAILED ({err})", bot.name()),
        }
    }
    Ok(())
}

fn action_send_cli(args: ActionSendArgs) -> Result<()> {
    let url = format!(
        "{}/bots/{}/action",
        args.server.trim_end_matches('/'),
        args.bot
    );
    let mut body = serde_json::Map::new();
    body.insert("user".into(), Value::String(args.user));
    body.insert("action".into(), Value::String(args.action));
    if let Some(token) = args.token {
        body.insert("token".into(), Value::String(token));
    }

    let resp = ureq::post(&url)
        .send_json(Value::Object(body))
        .map_err(|err| anyhow!("failed to POST {url}: {err}"))?;
    let outcome: Value = resp
        .into_body()
        .read_json()
        .map_err(|err| anyhow!("invalid action response: {err}"))?;
    if outcome.get("ok").and_then(Value::as_bool).unwrap_or(false) {
        let message = outcome
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        println!("{message}");
    } else {
        let error = outcome
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        bail!("action failed: {error}");
    }
    Ok(())
}

fn build_result_store(config: &StoreConfig) -> Result<SharedBuildStore> {
    match config.backend {
        StoreBackend::Memory => Ok(InMemoryBuildResultStore::new()),
        StoreBackend::File => {
            let path = config
                .file_path
                .clone()
                .unwrap_or_else(default_build_store_path);
            let store = FileBuildResultStore::new(path)?;
            Ok(store as SharedBuildStore)
        }
        StoreBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .ok_or_else(|| anyhow!("redis backend requires redis_url"))?;
            bail!("Redis backend not supported yet (url: {url})");
        }
    }
}

fn build_bot_runtimes(
    config: &AppConfig,
    directory: &Arc<StaticDirectory>,
    outbox: &SharedOutbox,
) -> Result<BotsMap> {
    let mut bots = BotsMap::new();
    for bot_config in &config.bots {
        if bot_config.name.trim().is_empty() {
            bail!("configured bot has an empty name");
        }
        let bot = Arc::new(Bot::new(
            &bot_config.name,
            resolve_scenario_path(&bot_config.scenario),
        ));
        let registry = build_registry(&bot, &bot_config.services, outbox)?;
        let dispatcher = Arc::new(ActionDispatcher::new(
            directory.clone() as Arc<dyn GroupDirectory>,
            registry as Arc<dyn HandlerRegistry>,
        ));
        if bots
            .insert(bot_config.name.clone(), BotRuntime { bot, dispatcher })
            .is_some()
        {
            bail!("duplicate bot name {:?} in configuration", bot_config.name);
        }
    }
    Ok(bots)
}

fn resolve_scenario_path(path: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        workspace_root().join(path)
    }
}

/// `check_reload` every bot in name order, recording builds and failures in
/// the result store. Unchanged scenarios are not recorded.
fn reload_all_bots(state: &AppState) -> Vec<BotReloadOutcome> {
    let mut names: Vec<&String> = state.bots.keys().collect();
    names.sort_unstable();

    let mut outcomes = Vec::with_capacity(names.len());
    for name in names {
        let runtime = &state.bots[name];
        let (ok, changed, detail) = match runtime.bot.check_reload() {
            Ok(BuildOutcome::Built(summary)) => (true, true, summary.to_string()),
            Ok(BuildOutcome::Unchanged) => (true, false, "scenario unchanged".to_string()),
            Err(err) => (false, false, err.to_string()),
        };
        if changed || !ok {
            if let Err(err) = state.store.record(BuildRecord::new(name, ok, detail.clone())) {
                error!(?err, bot = %name, "failed to record reload outcome");
            }
        }
        outcomes.push(BotReloadOutcome {
            name: name.clone(),
            ok,
            changed,
            detail,
        });
    }
    outcomes
}

async fn build_worker_loop(
    mut rx: mpsc::UnboundedReceiver<BuildJob>,
    bots: Arc<BotsMap>,
    store: SharedBuildStore,
) {
    while let Some(job) = rx.recv().await {
        let Some(runtime) = bots.get(&job.bot) else {
            warn!(job_id = %job.job_id, bot = %job.bot, "build job for unknown bot");
            continue;
        };
        let (ok, message) = match runtime.bot.build(&job.options) {
            Ok(BuildOutcome::Built(summary)) => (true, summary.to_string()),
            Ok(BuildOutcome::Unchanged) => (true, "scenario unchanged; build skipped".to_string()),
            Err(err) => (false, err.to_string()),
        };
        info!(job_id = %job.job_id, bot = %job.bot, ok, %message, "async build finished");
        if let Err(err) = store.record(BuildRecord::new(&job.bot, ok, message)) {
            error!(?err, job_id = %job.job_id, bot = %job.bot, "failed to record build result");
        }
    }
    warn!("build worker loop exited");
}

async fn watch_scenarios(root: Utf8PathBuf, state: AppState) -> Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut watcher: RecommendedWatcher =
        recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(err) => warn!(?err, "scenario watcher error"),
        })
        .context("failed to initialize scenario watcher")?;

    watcher
        .watch(root.as_std_path(), RecursiveMode::Recursive)
        .with_context(|| format!("failed to watch {root}"))?;
    info!(%root, "watching scenarios for changes");

    let mut last_reload: Option<std::time::Instant> = None;
    while let Some(_event) = rx.recv().await {
        if last_reload.is_some_and(|at| at.elapsed() < Duration::from_secs(1)) {
            continue;
        }
        last_reload = Some(std::time::Instant::now());
        for outcome in reload_all_bots(&state) {
            if !outcome.ok {
                warn!(bot = %outcome.name, detail = %outcome.detail, "hot reload failed");
            } else if outcome.changed {
                info!(bot = %outcome.name, detail = %outcome.detail, "scenario hot reloaded");
            }
        }
        sleep(Duration::from_millis(500)).await;
    }

    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/bots", get(list_bots_http))
        .route("/bots/reload", post(reload_bots_http))
        .route("/bots/{name}/build", post(build_bot_http))
        .route("/bots/{name}/build/async", post(enqueue_build_http))
        .route("/bots/{name}/build/last", get(last_build_http))
        .route("/bots/{name}/action", get(run_action).post(run_action))
        .route("/outbox", get(list_outbox).delete(clear_outbox))
        .layer(Extension(state))
}

async fn healthz(Extension(_state): Extension<AppState>) -> StatusCode {
    StatusCode::OK
}

async fn list_bots_http(Extension(state): Extension<AppState>) -> Json<BotListResponse> {
    let mut names: Vec<&String> = state.bots.keys().collect();
    names.sort_unstable();

    let bots: Vec<BotInfo> = names
        .into_iter()
        .map(|name| {
            let runtime = &state.bots[name];
            let summary = runtime.bot.summary();
            BotInfo {
                name: name.clone(),
                scenario: runtime.bot.scenario_path().to_string(),
                built: summary.is_some(),
                id: summary.as_ref().map(|s| s.id.clone()),
                version: summary.as_ref().map(|s| s.version.to_string()),
                dialogs: summary.as_ref().map(|s| s.dialog_count),
            }
        })
        .collect();
    Json(BotListResponse {
        count: bots.len(),
        bots,
    })
}

async fn reload_bots_http(
    Extension(state): Extension<AppState>,
) -> Result<Json<ReloadResponse>, StatusCode> {
    let outcomes = tokio::task::spawn_blocking(move || reload_all_bots(&state))
        .await
        .map_err(|err| {
            error!(?err, "reload task panicked");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(ReloadResponse {
        count: outcomes.len(),
        bots: outcomes,
    }))
}

async fn build_bot_http(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
    body: Option<Json<BuildOptions>>,
) -> Result<Json<BuildResponse>, StatusCode> {
    let runtime = state.bots.get(&name).ok_or(StatusCode::NOT_FOUND)?.clone();
    let options = body.map(|Json(inner)| inner).unwrap_or_default();

    let outcome = tokio::task::spawn_blocking(move || runtime.bot.build(&options))
        .await
        .map_err(|err| {
            error!(?err, "build task panicked");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    let (ok, message) = match outcome {
        Ok(BuildOutcome::Built(summary)) => (true, summary.to_string()),
        Ok(BuildOutcome::Unchanged) => (true, "scenario unchanged; build skipped".to_string()),
        Err(err) => (false, err.to_string()),
    };
    state
        .store
        .record(BuildRecord::new(&name, ok, message.clone()))
        .map_err(|err| {
            error!(?err, bot = %name, "failed to record build result");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(BuildResponse { ok, message }))
}

async fn enqueue_build_http(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
    body: Option<Json<BuildOptions>>,
) -> Result<Json<BuildQueuedResponse>, StatusCode> {
    if !state.bots.contains_key(&name) {
        return Err(StatusCode::NOT_FOUND);
    }
    let job_id = Uuid::new_v4();
    state.build_queue.submit(BuildJob {
        job_id,
        bot: name,
        options: body.map(|Json(inner)| inner).unwrap_or_default(),
    });
    Ok(Json(BuildQueuedResponse { ok: true, job_id }))
}

async fn last_build_http(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
) -> Result<Response, StatusCode> {
    if !state.bots.contains_key(&name) {
        return Err(StatusCode::NOT_FOUND);
    }
    let text = state
        .store
        .last(&name)
        .map_err(|err| {
            error!(?err, bot = %name, "failed to read build result");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map(|record| record.as_text())
        .unwrap_or_else(|| "\tNot Found".to_string());
    Ok(text.into_response())
}

async fn run_action(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
    Query(query): Query<ActionParams>,
    body: Option<Json<ActionParams>>,
) -> Result<Response, StatusCode> {
    let runtime = state.bots.get(&name).ok_or(StatusCode::NOT_FOUND)?.clone();
    let params = query.merge_with(body.map(|Json(inner)| inner));

    if !state.tokens.check(params.token.as_deref()) {
        warn!(bot = %name, "rejected action request with invalid token");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let Some(user) = sanitize_optional(params.user) else {
        return Err(StatusCode::BAD_REQUEST);
    };
    let Some(raw_action) = sanitize_optional(params.action) else {
        return Err(StatusCode::BAD_REQUEST);
    };
    let recipient = Recipient::parse(&user).map_err(|err| {
        warn!(%err, "bad recipient parameter");
        StatusCode::BAD_REQUEST
    })?;
    let action = Action::parse(&raw_action).map_err(|err| {
        warn!(%err, "bad action parameter");
        StatusCode::BAD_REQUEST
    })?;

    let result = tokio::task::spawn_blocking(move || {
        runtime.bot.check_reload().map_err(ActionFailure::Reload)?;
        runtime
            .dispatcher
            .dispatch(&recipient, &action)
            .map_err(ActionFailure::Dispatch)
    })
    .await
    .map_err(|err| {
        error!(?err, "action task panicked");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(match result {
        Ok(results) => Json(ActionResponse {
            ok: true,
            message: results.join("\n"),
        })
        .into_response(),
        Err(ActionFailure::Reload(err)) => Json(ErrorResponse {
            ok: false,
            error: format!("scenario build failed: {err}"),
        })
        .into_response(),
        Err(ActionFailure::Dispatch(err)) => dispatch_error_response(err),
    })
}

fn dispatch_error_response(err: DispatchError) -> Response {
    let status = match &err {
        DispatchError::RecursionTooDeep => StatusCode::BAD_REQUEST,
        DispatchError::GroupNotFound(_) | DispatchError::UnsupportedService(_) => {
            StatusCode::NOT_FOUND
        }
        DispatchError::Handler(_) | DispatchError::Cancelled => StatusCode::OK,
    };
    (
        status,
        Json(ErrorResponse {
            ok: false,
            error: err.to_string(),
        }),
    )
        .into_response()
}

async fn list_outbox(Extension(state): Extension<AppState>) -> Json<Vec<DeliveryRecord>> {
    Json(state.outbox.entries())
}

async fn clear_outbox(Extension(state): Extension<AppState>) -> StatusCode {
    state.outbox.clear();
    StatusCode::NO_CONTENT
}

fn sanitize_optional(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_owned()).filter(|v| !v.is_empty())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(?err, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}

fn load_config(explicit_path: Option<&Utf8PathBuf>) -> Result<AppConfig> {
    let mut figment = Figment::from(Serialized::defaults(DEFAULT_CONFIG.clone()));

    if let Some(path) = explicit_path {
        figment = figment.merge(Toml::file(path));
    } else if let Some(path) = resolve_default_config_path() {
        figment = figment.merge(Toml::file(path));
    } else {
        warn!("no config file found; relying on defaults + env overrides");
    }

    figment = figment.merge(Env::prefixed("BOT_GATEWAY_").split("__"));

    figment
        .extract()
        .context("failed to load bot-gateway configuration")
}

fn workspace_root() -> &'static Utf8Path {
    static ROOT: Lazy<Utf8PathBuf> = Lazy::new(|| {
        let manifest_dir = Utf8PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        manifest_dir
            .parent()
            .and_then(|p| p.parent())
            .map(Utf8PathBuf::from)
            .unwrap_or(manifest_dir)
    });
    ROOT.as_path()
}

fn resolve_default_config_path() -> Option<Utf8PathBuf> {
    let repo_relative = workspace_root().join("config/dev.toml");
    if repo_relative.exists() {
        return Some(repo_relative);
    }

    if let Some(dirs) = ProjectDirs::from("dev", "bot-gateway", APP_NAME)
        && let Ok(path) = Utf8PathBuf::from_path_buf(dirs.config_dir().join("config.toml"))
        && path.exists()
    {
        return Some(path);
    }

    None
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
