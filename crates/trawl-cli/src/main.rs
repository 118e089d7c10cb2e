use std::io::Write;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use trawl_client::{HttpFetcher, WebExtractor};
use trawl_core::{
    Broadcaster, ExtractorRegistry, MemoryCache, MemoryContentStore, Orchestrator,
    OrchestratorConfig, Platform, ProgressEvent, StartJobRequest,
};

#[derive(Parser)]
#[command(name = "trawl", version, about = "Concurrent scraping jobs with live progress")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scrape job and print its events as JSON lines
    Scrape {
        /// Source platform (only `web` ships with an extractor)
        #[arg(short, long, default_value = "web")]
        platform: Platform,

        /// URL, handle or id to harvest
        #[arg(short, long)]
        target: String,

        /// Maximum number of items (1-100)
        #[arg(short, long, default_value_t = 10)]
        limit: u32,

        /// Extra query parameter, repeatable (`key=value`)
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Allow fetching loopback and private network addresses
        #[arg(long, default_value_t = false)]
        allow_private: bool,
    },

    /// Show platforms with their rate limits and cache TTLs
    Platforms,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Events go to stdout; logs stay on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("trawl=warn".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = OrchestratorConfig::from_env().context("Invalid TRAWL_* configuration")?;

    match cli.command {
        Commands::Scrape {
            platform,
            target,
            limit,
            params,
            allow_private,
        } => {
            let mut request = StartJobRequest::new(platform, target, limit);
            for (key, value) in params {
                request = request.with_param(key, serde_json::Value::String(value));
            }
            cmd_scrape(config, request, allow_private).await?;
        }
        Commands::Platforms => cmd_platforms(&config)?,
    }

    Ok(())
}

async fn cmd_scrape(
    config: OrchestratorConfig,
    request: StartJobRequest,
    allow_private: bool,
) -> Result<()> {
    let fetcher = if allow_private {
        HttpFetcher::new()?.allow_private_urls()
    } else {
        HttpFetcher::new()?
    };
    let extractors = ExtractorRegistry::new().register(Platform::Web, WebExtractor::new(fetcher));
    let cache = MemoryCache::new(config.cache_max_entries, config.cache_ttls.clone());
    let broadcaster = Broadcaster::new(config.subscriber_buffer);
    let orchestrator = Orchestrator::new(
        config,
        extractors,
        cache,
        MemoryContentStore::new(),
        broadcaster,
    )?;

    let mut events = orchestrator.broadcaster().subscribe(None);
    let job_id = orchestrator.start_job(request)?;
    let mut stdout = std::io::stdout().lock();

    let last = loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    bail!("event stream closed before job {job_id} finished");
                };
                writeln!(stdout, "{}", serde_json::to_string(&event)?)?;
                stdout.flush()?;
                if event.is_terminal() {
                    break event;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!(%job_id, "Interrupted, cancelling job");
                orchestrator.cancel_job(job_id);
            }
        }
    };

    match last {
        ProgressEvent::Error { message, .. } => bail!("job {job_id} failed: {message}"),
        ProgressEvent::Cancelled { .. } => bail!("job {job_id} cancelled"),
        _ => Ok(()),
    }
}

fn cmd_platforms(config: &OrchestratorConfig) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    for platform in Platform::ALL {
        let line = serde_json::json!({
            "platform": platform,
            "extractor": platform == Platform::Web,
            "rate_limit": config.rate_limits.get(&platform).map(|l| serde_json::json!({
                "capacity": l.capacity,
                "period_secs": l.period.as_secs(),
            })),
            "cache_ttl_secs": config.cache_ttls.ttl_for(platform).as_secs(),
        });
        writeln!(stdout, "{line}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_split_on_first_equals() {
        assert_eq!(
            parse_param("q=a=b").unwrap(),
            ("q".to_string(), "a=b".to_string())
        );
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }

    #[test]
    fn scrape_args_parse() {
        let cli = Cli::try_parse_from([
            "trawl", "scrape", "--platform", "Web", "--target", "https://example.com", "--limit",
            "5", "--param", "lang=en",
        ])
        .unwrap();
        match cli.command {
            Commands::Scrape {
                platform,
                limit,
                params,
                ..
            } => {
                assert_eq!(platform, Platform::Web);
                assert_eq!(limit, 5);
                assert_eq!(params, vec![("lang".to_string(), "en".to_string())]);
            }
            Commands::Platforms => panic!("expected scrape"),
        }
    }
}
