use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;

use pixelgate::clock::system_clock;
use pixelgate::config::{load_config, ConfigError};
use pixelgate::security::{SignedUrlRequest, SignedUrlService};

#[derive(Parser)]
#[command(name = "pixelgate-cli")]
#[command(about = "Operator CLI for the pixelgate gateway", long_about = None)]
struct Cli {
    /// Gateway base URL for the remote commands.
    #[arg(short, long, default_value = "http://localhost:8080", global = true)]
    url: String,

    /// Configuration file holding the signing key.
    #[arg(short, long, default_value = "pixelgate.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Issue a signed URL for a path
    Sign {
        path: String,
        #[arg(short, long, default_value = "GET")]
        method: String,
        /// Lifetime in seconds; the configured default when omitted
        #[arg(short, long)]
        expires_in: Option<u64>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        ip: Option<String>,
    },
    /// Check a signed URL
    Verify {
        url: String,
        #[arg(long)]
        ip: Option<String>,
        #[arg(long)]
        user_agent: Option<String>,
        #[arg(long)]
        referer: Option<String>,
    },
    /// Load and validate a configuration file
    CheckConfig {
        path: Option<PathBuf>,
    },
    /// Query gateway health
    Status,
    /// Show a user's quota usage
    Quota {
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Sign {
            path,
            method,
            expires_in,
            user,
            ip,
        } => {
            let service = signer(&cli.config)?;
            let mut request = SignedUrlRequest::new(path).method(method);
            if let Some(secs) = expires_in {
                request = request.expires_in(Duration::from_secs(secs));
            }
            if let Some(user) = user {
                request = request.user(user);
            }
            if let Some(ip) = ip {
                request = request.bind_ip(ip);
            }
            let signed = service.generate_signed_url(&request)?;
            println!("{}", serde_json::to_string_pretty(&signed)?);
        }
        Commands::Verify {
            url,
            ip,
            user_agent,
            referer,
        } => {
            let service = signer(&cli.config)?;
            match service.validate_signed_url(&url, ip.as_deref(), user_agent.as_deref(), referer.as_deref()) {
                Ok(validated) => {
                    println!("valid: {} {} (expires {})", validated.method, validated.path, validated.expires_at);
                    if let Some(user) = validated.user_id {
                        println!("user: {user}");
                    }
                }
                Err(failure) => {
                    eprintln!("invalid: {failure}");
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Commands::CheckConfig { path } => {
            let path = path.unwrap_or(cli.config);
            match load_config(&path) {
                Ok(config) => println!(
                    "{}: ok ({} plans, {} protected prefixes)",
                    path.display(),
                    config.quota.plans.len(),
                    config.routes.protected_prefixes.len()
                ),
                Err(ConfigError::Validation(errors)) => {
                    eprintln!("{}: {} problem(s)", path.display(), errors.len());
                    for error in errors {
                        eprintln!("  - {error}");
                    }
                    return Ok(ExitCode::FAILURE);
                }
                Err(e) => {
                    eprintln!("{}: {e}", path.display());
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Commands::Status => {
            let res = reqwest::Client::new()
                .get(format!("{}/health", cli.url))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Quota { user } => {
            let mut headers = HeaderMap::new();
            headers.insert("x-user-id", HeaderValue::from_str(&user)?);
            let res = reqwest::Client::new()
                .get(format!("{}/v1/quota", cli.url))
                .headers(headers)
                .send()
                .await?;
            print_response(res).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn signer(config: &Path) -> Result<SignedUrlService, Box<dyn std::error::Error>> {
    let config = load_config(config)?;
    Ok(SignedUrlService::new(config.signed_urls, system_clock())?)
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: gateway returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
