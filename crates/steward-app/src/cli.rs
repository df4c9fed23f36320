use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use repair_guard::{
    ActionGate, CheckId, CheckStatus, Criticality, DiagnosticReport, RepairResult,
    create_repair_plan,
};
use steward_store::{ConsentId, ProviderKind, SettingsStore};
use tokio::sync::watch;

use crate::controller::{Controller, ControllerState};
use crate::diagnostics::DiagnosisOptions;
use crate::orchestrator::Orchestrator;
use crate::providers::{Availability, default_catalog, display_name};
use crate::server::{bind, parse_addr, serve};

#[derive(Debug, Parser)]
#[command(name = "steward", about = "Service health checks and consent-gated self-repair")]
pub struct Cli {
    #[arg(long, global = true, env = "STEWARD_HOME")]
    home: Option<PathBuf>,
    #[arg(long, global = true, env = "STEWARD_BACKEND_URL")]
    backend_url: Option<String>,
    #[command(subcommand)]
    command: TopCommand,
}

#[derive(Debug, Subcommand)]
enum TopCommand {
    Doctor(DoctorCmd),
    Repair(RepairCmd),
    Setup(SetupCmd),
    Status(StatusCmd),
    Consent {
        #[command(subcommand)]
        command: ConsentCommand,
    },
    Provider {
        #[command(subcommand)]
        command: ProviderCommand,
    },
    Monitor(MonitorCmd),
    Serve(ServeCmd),
}

#[derive(Debug, Subcommand)]
enum ConsentCommand {
    List,
    Grant(ConsentCmd),
    Revoke(ConsentCmd),
}

#[derive(Debug, Subcommand)]
enum ProviderCommand {
    Detect(DetectCmd),
    Configure,
    SetKey(SetKeyCmd),
}

#[derive(Debug, Args)]
struct DoctorCmd {
    /// Optional check to leave out (knowledge_store, cloud_keys).
    #[arg(long = "skip")]
    skip: Vec<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct RepairCmd {
    /// Execute without asking for confirmation.
    #[arg(long)]
    yes: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct SetupCmd {
    #[arg(long)]
    non_interactive: bool,
    #[arg(long = "grant")]
    grant: Vec<String>,
    #[arg(long = "decline")]
    decline: Vec<String>,
    #[arg(long)]
    skip_provider: bool,
}

#[derive(Debug, Args)]
struct StatusCmd {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ConsentCmd {
    id: String,
}

#[derive(Debug, Args)]
struct DetectCmd {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct SetKeyCmd {
    provider: String,
    #[arg(long, env = "STEWARD_PROVIDER_KEY", hide_env_values = true)]
    key: Option<String>,
}

#[derive(Debug, Args)]
struct MonitorCmd {
    #[arg(long)]
    interval_secs: Option<u64>,
    /// Overrides the stored auto-recovery setting for this run.
    #[arg(long)]
    auto_recovery: Option<bool>,
}

#[derive(Debug, Args)]
struct ServeCmd {
    #[arg(long, env = "STEWARD_ADDR", default_value = "127.0.0.1:8235")]
    addr: String,
    /// Also run the health monitor alongside the API.
    #[arg(long)]
    monitor: bool,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let store = SettingsStore::new(cli.home.clone()).context("failed to open steward home")?;
    let orchestrator = Orchestrator::with_backend_override(store, cli.backend_url.clone())?;

    match cli.command {
        TopCommand::Doctor(command) => handle_doctor(&orchestrator, command).await,
        TopCommand::Repair(command) => handle_repair(&orchestrator, command).await,
        TopCommand::Setup(command) => handle_setup(&orchestrator, command).await,
        TopCommand::Status(command) => handle_status(&orchestrator, command).await,
        TopCommand::Consent { command } => handle_consent(&orchestrator, command).await,
        TopCommand::Provider { command } => handle_provider(&orchestrator, command).await,
        TopCommand::Monitor(command) => handle_monitor(&orchestrator, command).await,
        TopCommand::Serve(command) => handle_serve(&orchestrator, command).await,
    }
}

async fn handle_doctor(orchestrator: &Orchestrator, cmd: DoctorCmd) -> Result<()> {
    let options = parse_skip(&cmd.skip)?;
    let report = orchestrator.engine().run_diagnosis(&options).await;
    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
        for descriptor in orchestrator.engine().descriptors() {
            let failing = report
                .check(descriptor.id())
                .is_some_and(|c| c.status.is_failing());
            if failing {
                println!("  {} target: {}", descriptor.id().as_str(), descriptor.target());
            }
        }
        let mode = repair_guard::derive_mode(&orchestrator.engine().services().await);
        println!("mode={}", mode.as_str());
    }
    if report.issues_found() {
        bail!(
            "doctor found {} failing check(s)",
            report.count(CheckStatus::Error)
        );
    }
    Ok(())
}

async fn handle_repair(orchestrator: &Orchestrator, cmd: RepairCmd) -> Result<()> {
    let controller = booted_controller(orchestrator).await?;
    let report = orchestrator
        .engine()
        .run_diagnosis(&DiagnosisOptions::default())
        .await;
    let plan = create_repair_plan(report);
    let preview = plan.clone().approve(controller.consent());

    println!("{}", plan.explanation());
    for (action, gate) in preview.steps() {
        let gate = match gate {
            ActionGate::Approved => "ready".to_string(),
            ActionGate::Withheld(id) => format!("needs consent {}", id.as_str()),
        };
        println!(
            "  - {} [risk={}] ({})",
            action.description,
            action.risk.as_str(),
            gate
        );
    }
    if plan.is_empty() {
        return Ok(());
    }

    let confirmed = cmd.yes
        || (is_interactive(false)
            && prompt_yes_no(
                &format!("Execute {} action(s)?", plan.actions().len()),
                false,
            )?);
    if !confirmed {
        println!("Nothing executed. Re-run with --yes to apply this plan.");
        return Ok(());
    }

    let result = orchestrator
        .executor()
        .execute_repair_plan(plan.approve(controller.consent()))
        .await;
    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_repair_result(&result);
    }
    if !result.success() {
        bail!("repair did not resolve every error; see the checks above");
    }
    Ok(())
}

async fn handle_setup(orchestrator: &Orchestrator, cmd: SetupCmd) -> Result<()> {
    let mut controller = orchestrator.controller();
    if let ControllerState::Configured(mode) = controller.boot().await? {
        println!("Already configured (mode={}).", mode.as_str());
        println!("Use `steward consent grant|revoke` to change consent.");
        return Ok(());
    }
    let grants = parse_consent_ids(&cmd.grant)?;
    let declines = parse_consent_ids(&cmd.decline)?;
    if let Some(id) = grants.iter().find(|id| declines.contains(id)) {
        bail!("consent '{}' is both granted and declined", id.as_str());
    }
    let interactive = is_interactive(cmd.non_interactive);

    controller.begin_first_run()?;
    let report = controller.scan(&DiagnosisOptions::default()).await?;
    print_report(&report);

    for id in controller.pending_consents().to_vec() {
        let granted = if grants.contains(&id) {
            true
        } else if declines.contains(&id) || !interactive {
            false
        } else {
            prompt_yes_no(id.prompt(), false)?
        };
        controller.record_consent(id, granted)?;
        println!("consent {}={}", id.as_str(), granted);
    }
    if matches!(controller.state().await, ControllerState::AwaitingConsent) {
        controller.commit_configuration()?;
    }

    if !cmd.skip_provider {
        match orchestrator.selector().self_configure().await? {
            Some(provider) => println!(
                "provider={} ({})",
                provider.kind.as_str(),
                provider.url.as_deref().unwrap_or("no endpoint")
            ),
            None => println!("provider=<none> (no AI provider reachable)"),
        }
    }

    println!("Setup complete: mode={}", controller.mode().await.as_str());
    Ok(())
}

async fn handle_status(orchestrator: &Orchestrator, cmd: StatusCmd) -> Result<()> {
    let mut controller = booted_controller(orchestrator).await?;
    let report = if matches!(controller.state().await, ControllerState::Configured(_)) {
        controller.scan(&DiagnosisOptions::default()).await?
    } else {
        orchestrator
            .engine()
            .run_diagnosis(&DiagnosisOptions::default())
            .await
    };
    let system = controller.system_state().await;
    let ai = orchestrator.store().load()?.ai;
    if cmd.json {
        let state = controller.state().await;
        let view = serde_json::json!({
            "state": state,
            "system": system,
            "report": report,
            "ai": ai,
        });
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }
    println!(
        "first_run={} mode={}",
        system.first_run,
        system.mode.as_str()
    );
    for (id, service) in &system.services {
        println!(
            "{} running={} ready={} error={}",
            id.as_str(),
            service.running,
            service.ready,
            service.error.as_deref().unwrap_or("-")
        );
    }
    for id in ConsentId::ALL {
        println!("consent {}={}", id.as_str(), consent_label(&controller, id));
    }
    println!(
        "provider={} model={} self_configured={}",
        ai.provider.map(ProviderKind::as_str).unwrap_or("<none>"),
        ai.model.as_deref().unwrap_or("<none>"),
        ai.self_configured
    );
    println!("health={}", report.summary());
    Ok(())
}

async fn handle_consent(orchestrator: &Orchestrator, cmd: ConsentCommand) -> Result<()> {
    let mut controller = booted_controller(orchestrator).await?;
    match cmd {
        ConsentCommand::List => {
            for id in ConsentId::ALL {
                println!("{} {}", id.as_str(), consent_label(&controller, id));
                println!("    {}", id.prompt());
            }
        }
        ConsentCommand::Grant(c) => set_consent(&mut controller, &c.id, true)?,
        ConsentCommand::Revoke(c) => set_consent(&mut controller, &c.id, false)?,
    }
    Ok(())
}

async fn handle_provider(orchestrator: &Orchestrator, cmd: ProviderCommand) -> Result<()> {
    match cmd {
        ProviderCommand::Detect(c) => {
            let providers = orchestrator.selector().probe_all().await;
            if c.json {
                println!("{}", serde_json::to_string_pretty(&providers)?);
            } else {
                for provider in &providers {
                    let marker = if provider.available { "+" } else { " " };
                    println!(
                        "{} {} {} priority={} {}",
                        marker,
                        provider.kind.as_str(),
                        provider.name,
                        provider.priority,
                        provider.detail
                    );
                }
            }
        }
        ProviderCommand::Configure => match orchestrator.selector().self_configure().await? {
            Some(provider) => {
                let ai = orchestrator.store().load()?.ai;
                println!(
                    "Configured {} model={} context_window={} temperature={}",
                    provider.name,
                    ai.model.as_deref().unwrap_or("<none>"),
                    ai.context_window.unwrap_or_default(),
                    ai.temperature.unwrap_or_default()
                );
            }
            None => println!("No AI provider available; stored selection cleared."),
        },
        ProviderCommand::SetKey(c) => {
            let kind = ProviderKind::parse(&c.provider)
                .with_context(|| format!("unknown provider '{}'", c.provider))?;
            let accepts_key = default_catalog()
                .iter()
                .any(|s| s.kind == kind && matches!(s.availability, Availability::ApiKey { .. }));
            if !accepts_key {
                bail!("{} does not use an API key", display_name(kind));
            }
            let key = match c.key {
                Some(key) => key,
                None if is_interactive(false) => prompt_line(&format!("{} API key", display_name(kind)))?,
                None => bail!("pass --key or set STEWARD_PROVIDER_KEY"),
            };
            if key.trim().is_empty() {
                bail!("API key must not be empty");
            }
            orchestrator.store().put_secret(&kind.secret_ref(), key.trim())?;
            println!("Stored API key for {}", display_name(kind));
        }
    }
    Ok(())
}

async fn handle_monitor(orchestrator: &Orchestrator, cmd: MonitorCmd) -> Result<()> {
    let mut monitor = orchestrator.monitor();
    if let Some(enabled) = cmd.auto_recovery {
        monitor = monitor.with_auto_recovery(enabled);
    }
    let interval = cmd
        .interval_secs
        .map(|s| Duration::from_secs(s.max(1)))
        .unwrap_or_else(|| orchestrator.monitor_interval());
    monitor.run(interval, wait_for_shutdown(shutdown_signal())).await;
    Ok(())
}

/// Binds before anything else starts so an occupied port fails the command
/// straight away. With `--monitor`, the server ending (error or shutdown)
/// ends the command; the monitor only stops early on shutdown.
async fn handle_serve(orchestrator: &Orchestrator, cmd: ServeCmd) -> Result<()> {
    let listener = bind(parse_addr(&cmd.addr)?).await?;
    let shutdown = shutdown_signal();
    if !cmd.monitor {
        return serve(orchestrator, listener, wait_for_shutdown(shutdown)).await;
    }
    let monitor = orchestrator.monitor();
    let served = serve(orchestrator, listener, wait_for_shutdown(shutdown.clone()));
    let monitored = monitor.run(orchestrator.monitor_interval(), wait_for_shutdown(shutdown));
    tokio::pin!(served, monitored);
    tokio::select! {
        result = &mut served => result,
        () = &mut monitored => served.await,
    }
}

fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = tx.send(true);
    });
    rx
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn booted_controller(orchestrator: &Orchestrator) -> Result<Controller> {
    let mut controller = orchestrator.controller();
    controller.boot().await?;
    Ok(controller)
}

fn set_consent(controller: &mut Controller, raw: &str, granted: bool) -> Result<()> {
    let id = ConsentId::parse(raw)
        .with_context(|| format!("unknown consent '{raw}'; expected one of: {}", consent_choices()))?;
    controller
        .set_consent(id, granted)
        .with_context(|| format!("failed to update consent {}", id.as_str()))?;
    println!("consent {}={}", id.as_str(), granted);
    Ok(())
}

fn consent_label(controller: &Controller, id: ConsentId) -> &'static str {
    match controller.consent().decision(id) {
        Some(d) if d.granted => "granted",
        Some(_) => "declined",
        None => "undecided",
    }
}

fn consent_choices() -> String {
    ConsentId::ALL
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_consent_ids(values: &[String]) -> Result<Vec<ConsentId>> {
    values
        .iter()
        .map(|v| {
            ConsentId::parse(v).with_context(|| {
                format!("unknown consent '{v}'; expected one of: {}", consent_choices())
            })
        })
        .collect()
}

fn parse_skip(values: &[String]) -> Result<DiagnosisOptions> {
    let mut skip = Vec::new();
    for value in values {
        let Some(id) = CheckId::parse(value) else {
            bail!("unknown check '{}'", value);
        };
        if id.criticality() == Criticality::Critical {
            bail!("check '{}' is critical and cannot be skipped", id.as_str());
        }
        skip.push(id);
    }
    Ok(DiagnosisOptions::skipping(skip))
}

fn print_report(report: &DiagnosticReport) {
    for check in report.checks() {
        let tag = match check.status {
            CheckStatus::Ok => "[OK]  ",
            CheckStatus::Warning => "[WARN]",
            CheckStatus::Error => "[FAIL]",
            CheckStatus::Pending => "[..]  ",
        };
        println!("{} {} {}", tag, check.id.as_str(), check.message);
    }
    println!("summary: {}", report.summary());
    if let Some(hint) = report.recommendation() {
        println!("hint: {hint}");
    }
}

fn print_repair_result(result: &RepairResult) {
    for record in result.actions_taken() {
        let tag = match (record.success, record.skipped) {
            (true, _) => "[OK]  ",
            (false, true) => "[SKIP]",
            (false, false) => "[FAIL]",
        };
        println!(
            "{} {} {}",
            tag,
            record.description,
            record.error.as_deref().unwrap_or("")
        );
    }
    println!("verification:");
    print_report(result.verification());
}

fn is_interactive(non_interactive: bool) -> bool {
    !non_interactive && atty::is(atty::Stream::Stdin) && atty::is(atty::Stream::Stdout)
}

fn prompt_line(label: &str) -> Result<String> {
    print!("{label}: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn prompt_yes_no(label: &str, default: bool) -> Result<bool> {
    let hint = if default { "Y/n" } else { "y/N" };
    let answer = prompt_line(&format!("{label} [{hint}]"))?;
    Ok(match answer.to_ascii_lowercase().as_str() {
        "" => default,
        "y" | "yes" => true,
        _ => false,
    })
}
