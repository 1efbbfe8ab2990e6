use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use offerdeck::{
    demo::{AudioClip, HttpAudioSource, PrefetchProgress},
    stream::{
        AgentComplete, AgentSkip, AgentStart, PipelineComplete, PlannerComplete, SolverComplete,
        StreamFailure, WorkerStep,
    },
    AudioLibrary, BackendClient, ConsoleConfig, ConsoleError, DashboardState, DemoAction,
    DemoController, DemoHost, DemoPlayer, DemoScript, DemoStep, EvaluationHandler,
    EvaluationSession, FinalDecision, PolicyWatcher,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "offerdeck")]
#[command(about = "Presenter console for the tailored offers agent")]
struct Args {
    /// Backend base URL (overrides config and OFFERDECK_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// YAML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List reservations known to the backend
    Pnrs,
    /// Show one reservation's enriched record
    Show { pnr: String },
    /// Run the offer agent on a reservation and follow its progress
    Evaluate {
        pnr: String,
        /// Hold offer decisions for human review
        #[arg(long)]
        review: bool,
    },
    /// List pending approval requests
    Approvals,
    /// Approve a pending offer
    Approve {
        id: String,
        #[arg(long, default_value = "console")]
        reviewer: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Deny a pending offer
    Deny {
        id: String,
        #[arg(long, default_value = "console")]
        reviewer: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Resume a pipeline parked on an approval request
    Resume { id: String },
    /// Show or change business policies
    Policies {
        /// Keep polling and print every change
        #[arg(long)]
        watch: bool,
        #[command(subcommand)]
        action: Option<PolicyAction>,
    },
    /// Show or change an agent's prompt
    Prompt {
        agent: String,
        #[arg(long, conflicts_with = "reset")]
        set: Option<String>,
        #[arg(long)]
        reset: bool,
    },
    /// Send a free-text instruction to the agents
    Instruct { text: String },
    /// Play the guided demo (p = pause, r = resume, s = stop)
    Demo {
        /// YAML script to play instead of the built-in one
        #[arg(long)]
        script: Option<PathBuf>,
        #[arg(long)]
        no_audio: bool,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Set a policy value (JSON, or a plain string)
    Set { key: String, value: String },
    /// Restore a policy's default
    Reset { key: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            eprintln!("failed to load .env: {err}");
        }
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn,offerdeck=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ConsoleConfig::load(path)?,
        None => ConsoleConfig::from_env()?,
    };
    if let Some(base_url) = args.base_url {
        config = config.with_base_url(base_url)?;
    }

    let backend = BackendClient::from_config(&config)?;

    match args.command {
        Command::Pnrs => list_pnrs(&backend).await?,
        Command::Show { pnr } => {
            let detail = backend.get_pnr(&pnr).await?;
            println!("{}", header(&format!("PNR {}", detail.pnr)));
            println!("{}", serde_json::to_string_pretty(&detail)?);
        }
        Command::Evaluate { pnr, review } => {
            evaluate(config.request_human_review(review), &pnr).await?;
        }
        Command::Approvals => list_approvals(&backend).await?,
        Command::Approve { id, reviewer, notes } => {
            let decision = offerdeck::ReviewerDecision { reviewer, notes };
            backend.approve(&id, &decision).await?;
            println!("{} approved {id}", "✓".green());
        }
        Command::Deny { id, reviewer, notes } => {
            let decision = offerdeck::ReviewerDecision { reviewer, notes };
            backend.deny(&id, &decision).await?;
            println!("{} denied {id}", "✗".red());
        }
        Command::Resume { id } => {
            let response = backend.resume(&id).await?;
            println!("{} resumed {id} {}", "✓".green(), response.to_string().dimmed());
        }
        Command::Policies { watch, action } => {
            match action {
                Some(PolicyAction::Set { key, value }) => {
                    let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
                    let policy = backend.update_policy(&key, &value).await?;
                    println!("{} {} = {}", "✓".green(), policy.key, policy.value);
                }
                Some(PolicyAction::Reset { key }) => {
                    let policy = backend.reset_policy(&key).await?;
                    println!("{} {} reset to {}", "✓".green(), policy.key, policy.value);
                }
                None if !watch => print_policies(&backend.list_policies().await?),
                None => {}
            }
            if watch {
                watch_policies(backend, config.policy_poll_interval).await;
            }
        }
        Command::Prompt { agent, set, reset } => {
            let prompt = match (set, reset) {
                (Some(text), _) => backend.update_prompt(&agent, &text).await?,
                (None, true) => backend.reset_prompt(&agent).await?,
                (None, false) => backend.get_prompt(&agent).await?,
            };
            let marker = if prompt.is_custom { "custom" } else { "default" };
            println!("{} ({})", header(&prompt.agent), marker.dimmed());
            println!("{}", prompt.prompt);
        }
        Command::Instruct { text } => {
            let response = backend.send_instruction(&text).await?;
            println!("{} {}", "✓".green(), response.status);
            if let Some(message) = response.message {
                println!("  {message}");
            }
            for update in response.prompt_updates {
                println!("\n{}", header(&update.agent));
                println!("{}", update.prompt);
            }
        }
        Command::Demo { script, no_audio } => {
            let script = match script {
                Some(path) => DemoScript::load(path)?,
                None => DemoScript::default_script(),
            };
            let config = if no_audio { config.without_audio() } else { config };
            demo(config, script).await?;
        }
    }

    Ok(())
}

fn header(text: &str) -> String {
    format!("{}", text.bold().cyan())
}

fn separator() -> String {
    "━".repeat(50).dimmed().to_string()
}

async fn list_pnrs(backend: &BackendClient) -> Result<(), ConsoleError> {
    let pnrs = backend.list_pnrs().await?;
    println!("{}", header("Reservations"));
    println!("{}", separator());
    for pnr in pnrs {
        println!(
            "{:<8} {:<18} {:<9} {:<8} {}",
            pnr.pnr.bold(),
            pnr.customer_name.unwrap_or_default(),
            pnr.loyalty_tier.unwrap_or_default(),
            pnr.route.unwrap_or_default(),
            pnr.scenario.unwrap_or_default().dimmed()
        );
    }
    Ok(())
}

async fn list_approvals(backend: &BackendClient) -> Result<(), ConsoleError> {
    let approvals = backend.pending_approvals().await?;
    if approvals.is_empty() {
        println!("{}", "No pending approvals".dimmed());
        return Ok(());
    }

    let now = Utc::now();
    println!("{}", header("Pending approvals"));
    println!("{}", separator());
    for request in approvals {
        let remaining = request
            .time_remaining(now)
            .map(|left| format!("{}m{:02}s left", left.num_minutes(), left.num_seconds() % 60))
            .unwrap_or_default();
        let offer = request
            .proposed_decision
            .as_ref()
            .and_then(|decision| decision.offer_type.clone())
            .unwrap_or_default();
        println!(
            "{:<10} {:<8} {:<20} {}",
            request.id.bold(),
            request.pnr,
            offer,
            remaining.dimmed()
        );
    }
    Ok(())
}

fn print_policies(policies: &[offerdeck::PolicyValue]) {
    println!("{}", header("Policies"));
    println!("{}", separator());
    for policy in policies {
        let value = if policy.is_overridden() {
            policy.value.to_string().yellow().to_string()
        } else {
            policy.value.to_string()
        };
        println!(
            "{:<24} {:<10} {}",
            policy.key,
            value,
            policy.description.as_deref().unwrap_or_default().dimmed()
        );
    }
}

async fn watch_policies(backend: BackendClient, interval: Duration) {
    let (mut policies, handle) = PolicyWatcher::spawn(backend, interval);
    loop {
        tokio::select! {
            changed = policies.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = policies.borrow_and_update().clone();
                print_policies(&current);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    drop(policies);
    handle.abort();
}

/// Prints each pipeline event as it arrives.
struct EventPrinter;

impl EvaluationHandler for EventPrinter {
    fn on_agent_start(&mut self, event: &AgentStart) {
        let name = event.agent_name.as_deref().unwrap_or(&event.agent_id);
        println!("{} {}", "▶".blue(), name);
    }

    fn on_agent_complete(&mut self, event: &AgentComplete) {
        let name = event.agent_name.as_deref().unwrap_or(&event.agent_id);
        let summary = event.summary.as_deref().unwrap_or_default();
        println!("{} {} {}", "✓".green(), name, summary.dimmed());
    }

    fn on_agent_skip(&mut self, event: &AgentSkip) {
        let name = event.agent_name.as_deref().unwrap_or(&event.agent_id);
        println!("{} {} {}", "-".dimmed(), name.dimmed(), "skipped".dimmed());
    }

    fn on_planner_complete(&mut self, event: &PlannerComplete) {
        println!("{}", header("Plan"));
        for step in &event.plan {
            println!("  {} [{}] {}", step.step_id, step.evaluation_type, step.description);
        }
    }

    fn on_worker_step(&mut self, event: &WorkerStep) {
        let recommendation = event.recommendation.as_deref().unwrap_or("done");
        println!("  {} {} {}", "→".cyan(), event.step_id, recommendation);
    }

    fn on_solver_complete(&mut self, event: &SolverComplete) {
        println!("{}", header("Solver"));
        println!("  {}", event.text());
    }

    fn on_pipeline_complete(&mut self, event: &PipelineComplete) {
        if let Some(ms) = event.duration_ms {
            println!("{}", format!("pipeline finished in {ms} ms").dimmed());
        }
    }

    fn on_error(&mut self, event: &StreamFailure) {
        println!("{} {}", "✗".red(), event.text().red());
    }
}

fn print_decision(decision: &FinalDecision) {
    println!("{}", header("Decision"));
    if decision.is_offer() {
        println!(
            "  {} at ${:.2} ({:.0}% off) via {}",
            decision.offer_name.bold(),
            decision.price,
            decision.discount * 100.0,
            decision.channel
        );
        println!(
            "  expected value ${:.2}, confidence {}",
            decision.expected_value,
            decision.confidence.label()
        );
    } else {
        println!("  {}", decision.offer_name.bold());
    }
    if !decision.reasoning.is_empty() {
        println!("  {}", decision.reasoning.dimmed());
    }
}

fn print_outcome(state: &DashboardState) {
    if let Some(error) = &state.error {
        println!("{} {}", "✗".red(), error.red());
    }
    if let Some(decision) = &state.final_decision {
        print_decision(decision);
    }
    if let Some(pending) = &state.pending_approval {
        println!("{}", header("Awaiting human approval"));
        print_decision(&pending.proposed);
        if let Some(id) = &pending.request_id {
            println!(
                "  {}",
                format!("offerdeck approve {id}  |  offerdeck deny {id}").dimmed()
            );
        }
    }
}

async fn evaluate(config: ConsoleConfig, pnr: &str) -> Result<(), ConsoleError> {
    let session = EvaluationSession::from_config(&config)?.with_event_callback(|event, _state| {
        offerdeck::dispatch(event, &mut EventPrinter);
    });

    session.select_pnr(pnr);
    println!("{}", header(&format!("Evaluating {pnr}")));
    let state = session.run(pnr).await;
    print_outcome(&state);
    Ok(())
}

/// Runs the guided demo against a live session, narrating in the terminal.
struct TerminalHost {
    session: Arc<EvaluationSession>,
}

impl TerminalHost {
    fn show_panel(&self, target: &str) {
        let state = self.session.snapshot();
        match target {
            "planner-panel" => {
                for step in &state.steps {
                    println!("    {} [{}] {}", step.step_id, step.evaluation_type, step.description);
                }
            }
            "worker-panel" => {
                for step in &state.steps {
                    let recommendation = step.recommendation.as_deref().unwrap_or("-");
                    println!("    {} {}", step.step_id, recommendation);
                }
            }
            "decision-card" | "approval-card" => print_outcome(&state),
            _ => {}
        }
    }
}

#[async_trait]
impl DemoHost for TerminalHost {
    async fn highlight(&self, target: &str) {
        println!("{} {}", "◆".magenta(), target.magenta());
        self.show_panel(target);
    }

    async fn perform(&self, action: &DemoAction) -> Result<(), ConsoleError> {
        match action {
            DemoAction::SelectPnr { pnr } => self.session.select_pnr(pnr),
            DemoAction::SetHumanReview { enabled } => self.session.review().set(*enabled),
            DemoAction::RunEvaluation => {
                let pnr = self
                    .session
                    .snapshot()
                    .selected_pnr
                    .ok_or_else(|| ConsoleError::InvalidConfig("no reservation selected".into()))?;
                drop(self.session.spawn_run(&pnr));
            }
        }
        Ok(())
    }

    async fn show_caption(&self, step: &DemoStep) {
        println!("\n{}", step.narration.italic());
    }

    async fn play_audio(&self, clip: Arc<AudioClip>) -> Result<(), ConsoleError> {
        // No decoder here; hold for roughly the clip length at 128 kbps.
        let seconds = clip.bytes.len() as f64 / 16_000.0;
        tokio::time::sleep(Duration::from_secs_f64(seconds.max(1.0))).await;
        Ok(())
    }

    async fn notice(&self, message: &str) {
        println!("{} {}", "!".yellow(), message.yellow());
    }
}

fn spawn_key_controls(controller: DemoController) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Ok(Some(line)) = line else { break };
                    match line.trim() {
                        "p" => { controller.pause(); }
                        "r" => { controller.resume(); }
                        "s" | "q" => {
                            controller.stop();
                            break;
                        }
                        _ => {}
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    controller.stop();
                    break;
                }
            }
        }
    })
}

async fn demo(config: ConsoleConfig, script: DemoScript) -> Result<(), ConsoleError> {
    let session = Arc::new(EvaluationSession::from_config(&config)?);
    let audio = Arc::new(AudioLibrary::new());
    let mut player = DemoPlayer::new(script, audio, session.subscribe_finished());

    println!("{}", header("Guided demo"));
    if config.audio.enabled {
        let source = HttpAudioSource::from_config(&config)?;
        let reporter = spawn_prefetch_reporter(player.audio_progress());
        let loaded = tokio::select! {
            loaded = player.prefetch_audio(&source, config.audio.batch_size) => loaded,
            _ = tokio::signal::ctrl_c() => {
                reporter.abort();
                println!("\n{}", "demo cancelled".dimmed());
                return Ok(());
            }
        };
        reporter.abort();
        println!(
            "\r{} narration audio: {} ready, {} unavailable",
            "✓".green(),
            loaded.loaded,
            loaded.failed
        );
    }

    let controls = spawn_key_controls(player.controller());
    let host = TerminalHost {
        session: Arc::clone(&session),
    };

    println!("{}", "p = pause, r = resume, s = stop".dimmed());
    let outcome = player.play(&host).await;

    controls.abort();
    println!("\n{}", format!("demo {outcome:?}").to_lowercase().dimmed());
    Ok(())
}

fn spawn_prefetch_reporter(
    mut progress: tokio::sync::watch::Receiver<PrefetchProgress>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let current = *progress.borrow_and_update();
            print!(
                "\r{} loading narration audio {}/{} ({:.0}%)",
                "…".dimmed(),
                current.loaded + current.failed,
                current.total,
                current.fraction() * 100.0
            );
            let _ = std::io::Write::flush(&mut std::io::stdout());
            if progress.changed().await.is_err() {
                break;
            }
        }
    })
}
