//! ai-gateway CLI — 配置校验、模型解析、格式画像查询与对话调试的命令行工具
//!
//! Usage:
//!   ai-gateway validate [--config <path>]                 Validate a gateway config
//!   ai-gateway resolve <model> [--config <path>]          Providers that can serve a model
//!   ai-gateway profile <family> <model> [--config <path>] Resolved format profile
//!   ai-gateway pick <role> [--times <n>] [--config <path>] Selector picks for a role
//!   ai-gateway chat <prompt> [--role <role>] [--no-stream] [--config <path>]

use ai_gateway::catalog::ProviderFamily;
use ai_gateway::{CanonicalRequest, Gateway, GatewayConfig, GatewayEvent, ModelRole};
use anyhow::{anyhow, bail, Context};
use futures::StreamExt;
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    init_logging();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let result = match args[1].as_str() {
        "validate" => cmd_validate(&args[2..]),
        "resolve" => cmd_resolve(&args[2..]),
        "profile" => cmd_profile(&args[2..]),
        "pick" => cmd_pick(&args[2..]),
        "chat" => cmd_chat(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("ai-gateway {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = std::env::var("AI_GATEWAY_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_usage() {
    println!(
        r#"ai-gateway — LLM provider gateway 命令行工具

USAGE:
    ai-gateway <COMMAND> [OPTIONS]

COMMANDS:
    validate                     Validate the gateway config
    resolve <model>              List providers that can serve a model, best first
    profile <family> <model>     Show the resolved format profile of a model
    pick <role> [--times <n>]    Show which models the selector picks for a role
    chat <prompt>                Run one conversation and stream the answer
        --role <role>            Role of the first model call (default planning)
        --no-stream              Print text once per model call
    version                      Show version information
    help                         Show this help message

OPTIONS:
    --config <path>              Gateway config (YAML or JSON)

ENVIRONMENT:
    AI_GATEWAY_CONFIG            Config path when --config is not given (default gateway.yaml)
    AI_GATEWAY_LOG, RUST_LOG     Log filter (default warn)"#
    );
}

fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// Positional arguments, skipping flags and their values.
fn positionals(args: &[String]) -> Vec<&str> {
    const VALUED: [&str; 3] = ["--config", "--role", "--times"];
    let mut out = Vec::new();
    let mut skip = false;
    for arg in args {
        if skip {
            skip = false;
            continue;
        }
        if VALUED.contains(&arg.as_str()) {
            skip = true;
        } else if !arg.starts_with("--") {
            out.push(arg.as_str());
        }
    }
    out
}

fn config_path(args: &[String]) -> PathBuf {
    flag_value(args, "--config")
        .map(PathBuf::from)
        .or_else(|| std::env::var("AI_GATEWAY_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("gateway.yaml"))
}

fn load_config(args: &[String]) -> anyhow::Result<GatewayConfig> {
    let path = config_path(args);
    GatewayConfig::from_path(&path).with_context(|| format!("loading {}", path.display()))
}

fn load_gateway(args: &[String]) -> anyhow::Result<Gateway> {
    Ok(Gateway::from_config(load_config(args)?)?)
}

fn cmd_validate(args: &[String]) -> anyhow::Result<()> {
    let gateway = load_gateway(args)?;
    println!("Providers:");
    for entry in gateway.registry().entries() {
        let status = if entry.is_usable() { "ok" } else { "NO CREDENTIAL" };
        let models = if entry.allowed_models.is_empty() {
            "any model".to_string()
        } else {
            let mut models: Vec<&str> = entry.allowed_models.iter().map(String::as_str).collect();
            models.sort_unstable();
            models.join(", ")
        };
        println!(
            "  {:<16} {:<10} {:<14} tpm={:<8} {}",
            entry.id, entry.family, status, entry.declared_tpm, models
        );
    }

    let pools = gateway.pools(&gateway.scope())?;
    println!("\nRoles:");
    for role in ModelRole::ALL {
        match pools.for_role(role) {
            Some(pool) => {
                let names: Vec<String> = pool
                    .iter()
                    .map(|c| format!("{}@{}", c.model_id, c.provider_id))
                    .collect();
                println!("  {:<14} {}", role, names.join(", "));
            }
            None => println!("  {:<14} (no pool)", role),
        }
    }
    println!("\nConfig is valid.");
    Ok(())
}

fn cmd_resolve(args: &[String]) -> anyhow::Result<()> {
    let model = positionals(args)
        .first()
        .copied()
        .ok_or_else(|| anyhow!("usage: ai-gateway resolve <model>"))?;
    let gateway = load_gateway(args)?;
    let resolution = gateway.registry().resolve(model)?;
    if resolution.used_fallback {
        println!("'{}' is not servable; using fallback '{}'", model, resolution.model);
    }
    for (rank, entry) in resolution.providers.iter().enumerate() {
        println!(
            "{}. {} ({}, priority {}) {}",
            rank + 1,
            entry.id,
            entry.family,
            entry.priority,
            entry.endpoint
        );
    }
    Ok(())
}

fn cmd_profile(args: &[String]) -> anyhow::Result<()> {
    let pos = positionals(args);
    let (family, model) = match pos.as_slice() {
        [family, model, ..] => (family.parse::<ProviderFamily>()?, *model),
        _ => bail!("usage: ai-gateway profile <family> <model>"),
    };
    let catalog = if flag_value(args, "--config").is_some() || config_path(args).exists() {
        load_config(args)?.build_catalog()
    } else {
        ai_gateway::catalog::ProviderCatalog::builtin()
    };
    let profile = catalog.profile_for(family, model);
    println!("{}", serde_json::to_string_pretty(&profile)?);
    Ok(())
}

fn cmd_pick(args: &[String]) -> anyhow::Result<()> {
    let role: ModelRole = positionals(args)
        .first()
        .ok_or_else(|| anyhow!("usage: ai-gateway pick <role> [--times <n>]"))?
        .parse()
        .map_err(|e: String| anyhow!(e))?;
    let times: usize = flag_value(args, "--times")
        .map(str::parse)
        .transpose()
        .context("--times expects a number")?
        .unwrap_or(4);

    let gateway = load_gateway(args)?;
    let pools = gateway.pools(&gateway.scope())?;
    let pool = pools
        .for_role(role)
        .ok_or_else(|| anyhow!("no pool for role '{}'", role))?;
    let selector = gateway.dispatcher().selector();
    for i in 0..times {
        let candidate = selector.pick(role, pool)?;
        println!("{:>3}. {}@{}", i + 1, candidate.model_id, candidate.provider_id);
    }
    Ok(())
}

async fn cmd_chat(args: &[String]) -> anyhow::Result<()> {
    let prompt = positionals(args).join(" ");
    if prompt.trim().is_empty() {
        bail!("usage: ai-gateway chat <prompt>");
    }
    let role: ModelRole = match flag_value(args, "--role") {
        Some(r) => r.parse().map_err(|e: String| anyhow!(e))?,
        None => ModelRole::Planning,
    };

    let mut config = load_config(args)?;
    if args.iter().any(|a| a == "--no-stream") {
        config.orchestrator.stream = false;
    }
    let gateway = Gateway::from_config(config)?;
    let request = CanonicalRequest::from_prompt(prompt).with_role(role);
    let mut conversation = gateway.chat(request)?;

    let mut stdout = std::io::stdout();
    let mut failed = None;
    while let Some(event) = conversation.next().await {
        match event {
            GatewayEvent::Token { text } => {
                print!("{}", text);
                stdout.flush()?;
            }
            GatewayEvent::ToolStart { name, arguments, .. } => eprintln!("\n[tool] {} {}", name, arguments),
            GatewayEvent::ToolEnd {
                name,
                summary,
                is_error,
                took_ms,
                ..
            } => eprintln!(
                "[tool] {} {} in {}ms: {}",
                name,
                if is_error { "failed" } else { "done" },
                took_ms,
                summary
            ),
            GatewayEvent::Usage {
                model_id,
                input_tokens,
                output_tokens,
                cost_estimate,
                ..
            } => {
                let cost = cost_estimate.map(|c| format!(" ~${:.6}", c)).unwrap_or_default();
                eprintln!("\n[usage] {} in={} out={}{}", model_id, input_tokens, output_tokens, cost);
            }
            GatewayEvent::Done { finish_reason } => eprintln!("\n[done] {}", finish_reason),
            GatewayEvent::Error { kind, message } => failed = Some(format!("{}: {}", kind, message)),
        }
    }
    println!();
    match failed {
        Some(message) => bail!(message),
        None => Ok(()),
    }
}
