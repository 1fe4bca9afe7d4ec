use std::path::Path;

use anyhow::Result;

use crate::config::RuntimeConfig;

pub fn env_present(key: &str) -> bool {
    std::env::var(key)
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false)
}

pub fn run_doctor(cfg: &RuntimeConfig) -> Result<()> {
    println!(
        "Active profile: '{}' (config: {})",
        cfg.profile, cfg.config_path
    );

    println!("Backend environment check:");
    for key in ["SCANTREE_API_KEY", "OPENAI_API_KEY"] {
        let status = if env_present(key) { "set" } else { "missing" };
        println!("- {key}: {status}");
    }
    if !env_present("SCANTREE_API_KEY") && !env_present("OPENAI_API_KEY") {
        println!("Tip: export SCANTREE_API_KEY (or OPENAI_API_KEY) before running plan/outline/codegen/refine.");
    }

    println!("Backend URL: {}", cfg.backend_url);
    println!("Model: {}", cfg.model.as_deref().unwrap_or("<not configured>"));
    println!(
        "Service: {}",
        cfg.service.as_deref().unwrap_or("<not configured>")
    );

    if cfg.docs.is_empty() {
        println!("Documents: none configured");
    } else {
        println!("Documents:");
        for doc in &cfg.docs {
            let status = if Path::new(doc).exists() {
                "ok"
            } else {
                "missing"
            };
            println!("- {doc}: {status}");
        }
    }

    if cfg.tool_servers.is_empty() {
        println!("Tool servers: none (clarifications will be answered text-only)");
    } else {
        println!("Tool servers:");
        for server in &cfg.tool_servers {
            let command = match server.resolve_command() {
                Ok(path) => {
                    let status = if path.exists() { "ok" } else { "missing" };
                    format!("{} ({status})", path.display())
                }
                Err(err) => format!("<unresolved: {err}>"),
            };
            let enabled = if server.enabled { "enabled" } else { "disabled" };
            println!(
                "- {} [{}] command={} docs={} persist_dir={}",
                server.id,
                enabled,
                command,
                server.docs.len(),
                server.persist_dir
            );
        }
    }

    println!(
        "Index persist dir: {} ({})",
        cfg.persist_dir,
        if Path::new(&cfg.persist_dir).exists() {
            "present"
        } else {
            "will be created on first build"
        }
    );
    println!(
        "Budgets: plan_iterations={} tool_iterations={} top_k={}",
        cfg.max_plan_iterations, cfg.max_tool_iterations, cfg.default_top_k
    );

    Ok(())
}
