use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::level_filters::LevelFilter;

use scantree::backend::{ChatBackend, HttpChatBackend, resolve_api_key};
use scantree::cli::{Cli, Commands, ProfileCommands};
use scantree::codegen;
use scantree::config::{ProfilesFile, RuntimeConfig, load_profiles, resolve_runtime_config};
use scantree::doctor::run_doctor;
use scantree::error::{categorize_error, format_cli_error};
use scantree::orchestrator::{DEFAULT_TASK_PROMPT, Orchestrator, PlanExtract};
use scantree::rag::{RagConfig, RagService};
use scantree::refine::{RefineOutcome, refine_plan};
use scantree::telemetry::TelemetrySink;
use scantree::tool_agent::ToolAgent;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err));
        tracing::error!(category = %categorize_error(&err).code(), error = %err, "command failed");
        std::process::exit(1);
    }

    Ok(())
}

async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    let profiles = load_profiles(&cli.config_path)?;
    let cfg = resolve_runtime_config(&cli, &profiles)?;

    match cli.command {
        Commands::Plan {
            prompt,
            prompt_file,
            requirements,
            requirements_file,
            plan_file,
        } => {
            run_plan(
                &cfg,
                prompt,
                prompt_file,
                requirements,
                requirements_file,
                plan_file,
            )
            .await
        }
        Commands::Retrieve { query, top_k } => run_retrieve(&cfg, &query.join(" "), top_k),
        Commands::Outline { doc_extract, out } => {
            run_outline(&cfg, &doc_extract, out.as_deref()).await
        }
        Commands::Codegen {
            outline,
            example,
            out,
        } => run_codegen(&cfg, &outline, &example, out.as_deref()).await,
        Commands::Refine { plan, loss, out } => {
            run_refine(&cfg, &plan, &loss, out.as_deref()).await
        }
        Commands::Doctor => run_doctor(&cfg),
        Commands::Profiles { command } => match command {
            ProfileCommands::List => run_profiles_list(&profiles, &cfg),
            ProfileCommands::Show => run_profiles_show(&cfg),
        },
    }
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let level = log_filter
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(log_filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}

fn build_backend(cfg: &RuntimeConfig) -> Result<Arc<dyn ChatBackend>> {
    let api_key = resolve_api_key()?;
    Ok(Arc::new(HttpChatBackend::new(
        &cfg.backend_url,
        api_key,
        "scantree",
    )?))
}

fn read_input_file(path: &str, what: &str) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("failed to read input {what} file '{path}'"))
}

fn write_output_file(path: &str, content: &str, what: &str) -> Result<()> {
    if let Some(parent) = Path::new(path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("failed to create directory for {what} file '{path}'")
        })?;
    }
    std::fs::write(path, content).with_context(|| format!("failed to write {what} file '{path}'"))
}

async fn run_plan(
    cfg: &RuntimeConfig,
    prompt: Vec<String>,
    prompt_file: Option<String>,
    requirements: Option<String>,
    requirements_file: Option<String>,
    plan_file: Option<String>,
) -> Result<()> {
    let telemetry = TelemetrySink::new(cfg, "plan".to_string());

    let task_prompt = match prompt_file {
        Some(path) => read_input_file(&path, "prompt")?,
        None if !prompt.is_empty() => prompt.join(" "),
        None => DEFAULT_TASK_PROMPT.to_string(),
    };
    let requirements = match requirements_file {
        Some(path) => Some(read_input_file(&path, "requirements")?),
        None => requirements,
    };

    let backend = build_backend(cfg)?;
    let model = cfg.require_model()?.to_string();
    tracing::info!(model = %model, backend = %cfg.backend_url, "running planner");

    let agent = ToolAgent::initialize(backend.clone(), cfg, telemetry.clone()).await?;
    let orchestrator = Orchestrator::new(backend, model, cfg.temperature, telemetry.clone());

    let result = orchestrator
        .run(
            &agent,
            &task_prompt,
            cfg.service.as_deref(),
            requirements.as_deref(),
            cfg.max_plan_iterations,
        )
        .await;

    // Subprocesses are released on the success and the failure path alike.
    agent.shutdown().await;
    let run = result?;

    match run.plan {
        PlanExtract::Plan(plan) => {
            if let Some(path) = plan_file {
                write_output_file(&path, &plan, "plan")?;
                tracing::info!(path = %path, "plan written");
            }
            println!("{plan}");
        }
        PlanExtract::Absent => {
            println!(
                "(planner returned no closed plan block after {} round(s))",
                run.rounds_used
            );
        }
    }

    Ok(())
}

fn run_retrieve(cfg: &RuntimeConfig, query: &str, top_k: Option<i64>) -> Result<()> {
    if cfg.docs.is_empty() {
        return Err(anyhow::anyhow!(
            "retrieve requires document paths. Pass --doc <path> or set profile.docs."
        ));
    }

    let rag_cfg = RagConfig {
        docs: cfg.docs.clone(),
        embed_model: cfg.embed_model.clone(),
        embed_device: cfg.embed_device,
        chunk_size: cfg.chunk_size,
        chunk_overlap: cfg.chunk_overlap,
        default_top_k: cfg.default_top_k,
        persist_dir: cfg.persist_dir.clone(),
    };
    let service = RagService::initialize(&rag_cfg)?;
    let chunks = service.retrieve(query, top_k);

    if chunks.is_empty() {
        println!("No matching chunks.");
        return Ok(());
    }

    for (index, chunk) in chunks.iter().enumerate() {
        println!("[{}] score={:.4}", index + 1, chunk.score);
        println!("{}", chunk.text);
        println!();
    }

    Ok(())
}

fn require_service(cfg: &RuntimeConfig) -> Result<&str> {
    cfg.service.as_deref().ok_or_else(|| {
        anyhow::anyhow!("a service name is required. Set --service or profile.service.")
    })
}

async fn run_outline(cfg: &RuntimeConfig, doc_extract: &str, out: Option<&str>) -> Result<()> {
    let service = require_service(cfg)?;
    let extract = read_input_file(doc_extract, "documentation extract")?;
    let backend = build_backend(cfg)?;
    let model = cfg.require_model()?;

    let outline =
        codegen::generate_outline(&backend, model, cfg.temperature, service, &extract).await?;

    if let Some(path) = out {
        write_output_file(path, &outline, "outline")?;
    }
    println!("{outline}");
    Ok(())
}

async fn run_codegen(
    cfg: &RuntimeConfig,
    outline: &str,
    example: &str,
    out: Option<&str>,
) -> Result<()> {
    let service = require_service(cfg)?;
    let outline = read_input_file(outline, "outline")?;
    let example = read_input_file(example, "example plugin")?;
    let backend = build_backend(cfg)?;
    let model = cfg.require_model()?;

    let code = codegen::generate_plugin(
        &backend,
        model,
        cfg.temperature,
        service,
        &example,
        &outline,
    )
    .await?;

    if let Some(path) = out {
        write_output_file(path, &code, "plugin code")?;
    }
    println!("{code}");
    Ok(())
}

async fn run_refine(cfg: &RuntimeConfig, plan: &str, loss: &str, out: Option<&str>) -> Result<()> {
    let plan_text = read_input_file(plan, "plan")?;
    let loss_text = read_input_file(loss, "loss description")?;
    let backend = build_backend(cfg)?;
    let model = cfg.require_model()?;

    match refine_plan(&backend, model, cfg.temperature, &plan_text, &loss_text).await? {
        RefineOutcome::Updated(updated) => {
            if let Some(path) = out {
                write_output_file(path, &updated, "refined plan")?;
            }
            println!("{updated}");
        }
        RefineOutcome::Unchanged => {
            println!("Plan unchanged: gradient was zero or absent.");
        }
    }

    Ok(())
}

fn run_profiles_list(profiles: &ProfilesFile, cfg: &RuntimeConfig) -> Result<()> {
    let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
    if !names.iter().any(|name| name == "default") {
        names.push("default".to_string());
    }
    names.sort();

    println!("Configured profiles (active='{}'):", cfg.profile);
    for name in names {
        let marker = if name == cfg.profile { "*" } else { " " };
        let source = if profiles.profiles.contains_key(&name) {
            "configured"
        } else {
            "implicit"
        };
        println!("{marker} {name} ({source})");
    }

    Ok(())
}

fn run_profiles_show(cfg: &RuntimeConfig) -> Result<()> {
    println!("Active profile: {}", cfg.profile);
    println!("Config path: {}", cfg.config_path);
    println!("Backend URL: {}", cfg.backend_url);
    println!("Model: {}", cfg.model.as_deref().unwrap_or("<not configured>"));
    println!(
        "Service: {}",
        cfg.service.as_deref().unwrap_or("<not configured>")
    );
    println!("Documents: {}", cfg.docs.len());
    println!("Temperature: {}", cfg.temperature);
    println!(
        "Budgets: plan_iterations={} tool_iterations={}",
        cfg.max_plan_iterations, cfg.max_tool_iterations
    );
    println!(
        "Index: embed_model={} device={} chunk_size={} chunk_overlap={} top_k={} persist_dir={}",
        cfg.embed_model,
        cfg.embed_device.as_str(),
        cfg.chunk_size,
        cfg.chunk_overlap,
        cfg.default_top_k,
        cfg.persist_dir
    );
    println!(
        "Telemetry: enabled={} path={}",
        cfg.telemetry_enabled, cfg.telemetry_path
    );
    println!("Tool servers: {}", cfg.tool_servers.len());
    for server in &cfg.tool_servers {
        println!(
            "- {} enabled={} docs={} persist_dir={}",
            server.id,
            server.enabled,
            server.docs.len(),
            server.persist_dir
        );
    }
    Ok(())
}
