use financial_research_agent::{
    AlphaVantageProvider, Controller, OpenRouterClient, ProviderRouter, ResearchConfig,
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let json = args.first().is_some_and(|a| a == "--json");
    if json {
        args.remove(0);
    }
    let query = args.join(" ");
    if query.trim().is_empty() {
        eprintln!("Usage: researcher [--json] <question>");
        eprintln!("  e.g. researcher \"What was AAPL's revenue last year?\"");
        return ExitCode::from(2);
    }

    info!("Financial research agent starting");

    let controller = match build_controller() {
        Ok(controller) => controller,
        Err(e) => {
            error!(error = %e, "Startup failed");
            eprintln!("{}", e);
            if let Some(suggestion) = &e.detail().suggestion {
                eprintln!("Suggestion: {}", suggestion);
            }
            return ExitCode::FAILURE;
        }
    };

    let run = controller.run(&query).await;
    let report = run.report();

    if json {
        match report.to_json() {
            Ok(out) => println!("{}", out),
            Err(e) => {
                eprintln!("Could not serialize report: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        println!("\n=== RESEARCH RESULT ===");
        println!("Run ID: {}", report.run_id);
        println!();
        print!("{}", report.render());
        println!("\nTrace:");
        for (i, step) in run.trace.iter().enumerate() {
            println!("  {}: {}", i + 1, step);
        }
    }

    if run.is_completed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn build_controller() -> financial_research_agent::Result<Controller> {
    let config = ResearchConfig::from_env()?;

    let reasoning = Arc::new(OpenRouterClient::new(&config)?);

    let alpha_vantage =
        AlphaVantageProvider::new(config.data_api_key_or_demo(), config.provider_timeout)?;
    let mut router = ProviderRouter::new(config.provider_timeout);
    router.register_all(Arc::new(alpha_vantage));

    Controller::new(config, reasoning, Arc::new(router))
}
