//! Regex Forge CLI
//!
//! Synthesizes a regular expression for the request in a JSON file.

use std::sync::Arc;

use regex_forge::config::EngineConfig;
use regex_forge::{
    ProcessBackend, RegexRequest, SandboxLifecycleManager, SynthesisLoop, SynthesisOptions,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <request.json>", args[0]);
        eprintln!("\nSynthesizes a regular expression for the request and prints the result as JSON.");
        eprintln!("\nEnvironment variables:");
        eprintln!("  REGEX_FORGE_CONFIG=<path>  TOML configuration file");
        eprintln!("  RUST_LOG=<filter>          Log filter (default: info)");
        std::process::exit(1);
    }

    if let Err(e) = run(&args[1]).await {
        eprintln!("regex-forge failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(request_path: &str) -> regex_forge::Result<()> {
    let config = EngineConfig::from_env()?;

    let request: RegexRequest = serde_json::from_slice(&tokio::fs::read(request_path).await?)?;

    let mut backend = ProcessBackend::new();
    if let Some(prefix) = &config.sandbox.isolation {
        backend = backend.with_isolation(prefix.clone());
    }
    let sandboxes = Arc::new(
        SandboxLifecycleManager::new(Arc::new(backend))
            .with_auto_stop_minutes(config.sandbox.auto_stop_minutes),
    );
    let service = config.generation.service()?;
    tracing::info!(provider = %service.name(), runtime = %config.synthesis.runtime, "starting synthesis");

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, aborting");
            ctrl_c.cancel();
        }
    });

    let options = SynthesisOptions::new(config.synthesis.runtime)
        .with_max_iterations(config.synthesis.max_iterations)
        .with_history_window(config.synthesis.history_window)
        .with_execution_timeout(config.sandbox.execution_timeout())
        .with_cancel(cancel);

    let synthesis = SynthesisLoop::new(service, sandboxes.clone());
    let result = synthesis.run(&request, &options).await?;

    if let Some(id) = &result.sandbox_id {
        sandboxes.release(id).await?;
    }

    println!("{}", serde_json::to_string_pretty(&result)?);

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
