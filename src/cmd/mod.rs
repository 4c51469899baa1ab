//! CLI command implementations.
//!
//! Every command maps onto a state-machine transition or a store/resolver
//! query; `run` additionally renders a live progress follower from a hub
//! subscription.

use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use uuid::Uuid;

use conductor::agent::ProcessAgent;
use conductor::config::Config;
use conductor::server::{self, SharedState};
use conductor::session::store::SessionFilter;
use conductor::session::{Session, SessionStatus};

fn process_agent(config: &Config) -> Arc<ProcessAgent> {
    Arc::new(
        ProcessAgent::new(config.agent.command.clone())
            .with_args(config.agent.args.clone())
            .with_workdir(config.project_dir.clone()),
    )
}

fn state_for(config: &Config) -> Result<SharedState> {
    server::build_state(config, process_agent(config))
}

fn styled_status(status: SessionStatus) -> console::StyledObject<&'static str> {
    let text = status.as_str();
    match status {
        SessionStatus::Completed => style(text).green(),
        SessionStatus::Error => style(text).red(),
        SessionStatus::Stopped => style(text).yellow(),
        SessionStatus::Active => style(text).cyan(),
        _ => style(text).dim(),
    }
}

fn print_session_line(session: &Session) {
    println!(
        "{}  {:>9}  {}/{}  {}",
        session.id,
        styled_status(session.status),
        session.completed_features(),
        session.total_features(),
        style(&session.spec).dim(),
    );
}

pub async fn cmd_serve(config: Config) -> Result<()> {
    let agent = process_agent(&config);
    server::serve(config, agent).await
}

pub async fn cmd_create(
    config: Config,
    spec: String,
    features: Vec<String>,
    work_item: Option<String>,
    branch: Option<String>,
) -> Result<()> {
    anyhow::ensure!(!spec.trim().is_empty(), "spec must not be empty");
    let state = state_for(&config)?;
    let features = features
        .into_iter()
        .map(conductor::session::Feature::pending)
        .collect();
    let session = state
        .machine
        .create(spec, features, work_item, branch)
        .await?;
    println!(
        "{} session {} with {} feature(s)",
        style("Created").green().bold(),
        session.id,
        session.total_features()
    );
    Ok(())
}

pub async fn cmd_list(config: Config, status: Option<String>) -> Result<()> {
    let state = state_for(&config)?;
    let filter = match status.as_deref() {
        None => SessionFilter::all(),
        Some(raw) => {
            let status = raw
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            SessionFilter::with_status(status)
        }
    };
    let sessions = state.store.list(filter).await?;
    if sessions.is_empty() {
        println!("{}", style("No sessions").dim());
        return Ok(());
    }
    for session in &sessions {
        print_session_line(session);
    }
    Ok(())
}

pub async fn cmd_status(config: Config, id: Uuid) -> Result<()> {
    let state = state_for(&config)?;
    let session = state.store.get(id).await?;

    println!("{} {}", style("Session").bold(), session.id);
    println!("  spec:     {}", session.spec);
    println!("  status:   {}", styled_status(session.status));
    println!(
        "  progress: {}/{}",
        session.completed_features(),
        session.total_features()
    );
    if let Some(cause) = &session.error {
        println!("  error:    {}", style(cause).red());
    }
    if let Some(work_item) = &session.work_item {
        println!("  work item: {}", work_item);
    }
    if let Some(branch) = &session.branch {
        println!("  branch:   {}", branch);
    }
    println!("  features:");
    for feature in &session.features {
        let mark = if feature.passes {
            style("✓").green()
        } else {
            style("·").dim()
        };
        println!("    {} {}", mark, feature.description);
        if let Some(failure) = &feature.failure {
            println!("      {}", style(failure).red().dim());
        }
    }
    Ok(())
}

pub async fn cmd_run(config: Config, id: Uuid) -> Result<()> {
    let state = state_for(&config)?;
    let session = state.store.get(id).await?;

    let bar = ProgressBar::new(session.total_features() as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░"),
    );
    bar.set_prefix("Features");

    // Render hub events while the runner drives the session.
    let mut subscription = state.hub.subscribe(id);
    let render_bar = bar.clone();
    let render = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            render_bar.set_length(event.total_features as u64);
            render_bar.set_position(event.completed_features as u64);
            render_bar.set_message(event.status.to_string());
        }
    });

    let final_state = match state.runner.drive(id).await {
        Ok(final_state) => final_state,
        Err(err) => {
            // No terminal event will arrive; tear the renderer down.
            render.abort();
            bar.finish_and_clear();
            return Err(err.into());
        }
    };
    render.await.context("progress renderer failed")?;
    bar.finish_and_clear();

    println!(
        "{} {} ({}/{} features)",
        style("Finished:").bold(),
        styled_status(final_state.status),
        final_state.completed_features(),
        final_state.total_features()
    );
    if let Some(cause) = &final_state.error {
        println!("  {}", style(cause).red());
    }
    Ok(())
}

pub async fn cmd_pause(config: Config, id: Uuid) -> Result<()> {
    let state = state_for(&config)?;
    state.machine.request_pause(id).await?;
    println!(
        "{} pause requested; it takes effect at the next checkpoint",
        style("OK").green().bold()
    );
    Ok(())
}

pub async fn cmd_resume(config: Config, id: Uuid) -> Result<()> {
    let state = state_for(&config)?;
    let session = state.machine.resume(id).await?;
    println!(
        "{} session is {}",
        style("OK").green().bold(),
        styled_status(session.status)
    );
    Ok(())
}

pub async fn cmd_stop(config: Config, id: Uuid) -> Result<()> {
    let state = state_for(&config)?;
    let session = state.machine.request_stop(id).await?;
    match session.status {
        SessionStatus::Stopped => println!("{} session stopped", style("OK").green().bold()),
        _ => println!(
            "{} stop requested; in-flight work will be applied first",
            style("OK").green().bold()
        ),
    }
    Ok(())
}

pub async fn cmd_knowledge(config: Config, name: Option<String>, annotated: bool) -> Result<()> {
    let state = state_for(&config)?;

    if let Some(name) = name {
        let snippet = state
            .resolver
            .lookup(&name)?
            .with_context(|| format!("Snippet '{}' not found in any tier", name))?;
        println!(
            "{} {} [{}]",
            style("Snippet").bold(),
            snippet.name,
            snippet.tier
        );
        println!("{}", snippet.body.trim());
        return Ok(());
    }

    if annotated {
        let layers = state.resolver.resolve_annotated()?;
        for (name, stack) in &layers {
            let tiers: Vec<String> = stack.iter().map(|s| s.tier.to_string()).collect();
            println!("{}  {}", name, style(tiers.join(" > ")).dim());
        }
    } else {
        let resolved = state.resolver.resolve()?;
        for (name, snippet) in &resolved {
            println!("{}  {}", name, style(snippet.tier.to_string()).dim());
        }
    }
    Ok(())
}
