use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use clap::{Parser, Subcommand};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "burnlink", about = "burnlink: secrets that burn after reading", version)]
struct Cli {
    /// burnlink server URL
    #[arg(long, env = "BURNLINK_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Base URL printed in share links (defaults to --server)
    #[arg(long, env = "BURNLINK_PUBLIC_URL")]
    public_url: Option<String>,

    /// Admin bearer token for `audit` and `sweep`
    #[arg(long, env = "BURNLINK_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the burnlink HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, env = "BURNLINK_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind
        #[arg(long, env = "BURNLINK_HOST", default_value = "0.0.0.0")]
        host: String,
        /// Data directory (default: platform data dir)
        #[arg(long, env = "BURNLINK_DATA_DIR")]
        data_dir: Option<PathBuf>,
    },
    /// Create a secret from TEXT, --file, or stdin and print its share link
    Create {
        /// Secret text; read from stdin when omitted and no --file is given
        text: Option<String>,
        /// Share a file instead of text
        #[arg(long, conflicts_with = "text")]
        file: Option<PathBuf>,
        /// Time to live, e.g. 10m, 1h, 7d
        #[arg(long, default_value = "24h")]
        ttl: String,
        /// Number of views before the secret burns
        #[arg(long, default_value_t = 1)]
        views: u32,
    },
    /// Reveal a secret. Accepts a full share link or a bare short ID plus --key
    View {
        /// Share link (`.../s/<id>#<key>`) or short ID
        link: String,
        /// Key, when not embedded in the link
        #[arg(long)]
        key: Option<String>,
        /// Where to write file secrets (default: the original file name)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Show access log entries (admin)
    Audit {
        /// Only entries for this short ID
        #[arg(long)]
        short_id: Option<String>,
        /// Only entries newer than this duration, e.g. 1h
        #[arg(long)]
        since: Option<String>,
        /// Only entries with this outcome (revealed, already_burned, expired, not_found, authentication_failed)
        #[arg(long)]
        outcome: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Delete expired secrets immediately (admin)
    Sweep,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("BURNLINK_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Serve {
            port,
            host,
            data_dir,
        } => cmd_serve(host, port, data_dir).await,

        Commands::Create {
            text,
            file,
            ttl,
            views,
        } => {
            let base = cli.public_url.as_deref().unwrap_or(&cli.server);
            cmd_create(&cli.server, base, text, file, &ttl, views).await
        }

        Commands::View { link, key, out } => {
            cmd_view(&cli.server, &link, key.as_deref(), out).await
        }

        Commands::Audit {
            short_id,
            since,
            outcome,
            limit,
        } => {
            let token = require_admin_token(&cli.admin_token)?;
            cmd_audit(&cli.server, &token, short_id, since.as_deref(), outcome, limit).await
        }

        Commands::Sweep => {
            let token = require_admin_token(&cli.admin_token)?;
            cmd_sweep(&cli.server, &token).await
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16, data_dir: Option<PathBuf>) -> Result<()> {
    let cfg = burnlink_server::ServerConfig {
        host,
        port,
        data_dir,
        admin_token: burnlink_server::server::resolve_admin_token()?,
        ..Default::default()
    };

    burnlink_server::run(cfg).await
}

async fn cmd_create(
    server: &str,
    public_base: &str,
    text: Option<String>,
    file: Option<PathBuf>,
    ttl: &str,
    views: u32,
) -> Result<()> {
    let ttl_seconds = parse_duration(ttl)?;

    let mut body = json!({
        "ttl_seconds": ttl_seconds,
        "max_views": views,
    });
    match (text, file) {
        (_, Some(path)) => {
            let data = std::fs::read(&path)
                .with_context(|| format!("read {}", path.display()))?;
            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .context("file name is not valid UTF-8")?;
            body["file"] = json!({
                "filename": filename,
                "data": STANDARD.encode(&data),
            });
        }
        (Some(text), None) => body["text"] = json!(text),
        (None, None) => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("read secret from stdin")?;
            body["text"] = json!(text.trim_end_matches('\n'));
        }
    }

    let resp = Client::new()
        .post(format!("{}/secrets", server.trim_end_matches('/')))
        .json(&body)
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;
    if !status.is_success() {
        anyhow::bail!(
            "server returned {status}: {}",
            json["error"].as_str().unwrap_or("")
        );
    }

    let short_id = json["short_id"].as_str().context("missing short_id")?;
    let key = json["key"].as_str().context("missing key")?;
    println!(
        "{}/s/{}#{}",
        public_base.trim_end_matches('/'),
        short_id,
        key
    );
    Ok(())
}

async fn cmd_view(
    server: &str,
    link: &str,
    key: Option<&str>,
    out: Option<PathBuf>,
) -> Result<()> {
    let (short_id, key) = split_link(link, key)?;

    let resp = Client::new()
        .post(format!(
            "{}/secrets/{}/view",
            server.trim_end_matches('/'),
            short_id
        ))
        .json(&json!({ "key": key }))
        .send()
        .await
        .context("HTTP request failed")?;

    if resp.status() == StatusCode::NOT_FOUND {
        anyhow::bail!("secret is unavailable");
    }
    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;
    if !status.is_success() {
        anyhow::bail!(
            "server returned {status}: {}",
            json["error"].as_str().unwrap_or("")
        );
    }

    match json["kind"].as_str() {
        Some("text") => println!("{}", json["text"].as_str().unwrap_or("")),
        Some("file") => {
            let data = STANDARD
                .decode(json["data"].as_str().unwrap_or(""))
                .context("decode file data")?;
            let path = match out {
                Some(p) => p,
                None => {
                    // Never trust a path from the payload beyond its final component.
                    let name = json["filename"].as_str().unwrap_or("secret.bin");
                    PathBuf::from(
                        std::path::Path::new(name)
                            .file_name()
                            .unwrap_or_else(|| std::ffi::OsStr::new("secret.bin")),
                    )
                }
            };
            std::fs::write(&path, &data)
                .with_context(|| format!("write {}", path.display()))?;
            println!("wrote {} bytes to {}", data.len(), path.display());
        }
        other => anyhow::bail!("unexpected response kind: {other:?}"),
    }
    if let Some(n) = json["views_remaining"].as_u64() {
        if n > 0 {
            eprintln!("({n} view(s) remaining)");
        }
    }
    Ok(())
}

async fn cmd_audit(
    server: &str,
    token: &str,
    short_id: Option<String>,
    since: Option<&str>,
    outcome: Option<String>,
    limit: usize,
) -> Result<()> {
    let mut query: Vec<(&str, String)> = vec![("limit", limit.to_string())];
    if let Some(id) = short_id {
        query.push(("short_id", id));
    }
    if let Some(since) = since {
        let cutoff = unix_now() - parse_duration(since)? as i64;
        query.push(("since", cutoff.to_string()));
    }
    if let Some(outcome) = outcome {
        query.push(("outcome", outcome));
    }

    let resp = Client::new()
        .get(format!("{}/audit", server.trim_end_matches('/')))
        .query(&query)
        .bearer_auth(token)
        .send()
        .await
        .context("HTTP request failed")?;

    if !resp.status().is_success() {
        let status = resp.status();
        anyhow::bail!("server returned {status}");
    }

    let json: Value = resp.json().await?;
    let entries = json["entries"].as_array().cloned().unwrap_or_default();
    if entries.is_empty() {
        println!("(no access log entries)");
        return Ok(());
    }
    for e in &entries {
        println!(
            "  #{:<6} {}  {:<26}  {:<22}  {}",
            e["id"].as_u64().unwrap_or(0),
            format_timestamp(e["timestamp"].as_i64().unwrap_or(0)),
            e["short_id"].as_str().unwrap_or(""),
            e["outcome"].as_str().unwrap_or(""),
            e["actor_hint"].as_str().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn cmd_sweep(server: &str, token: &str) -> Result<()> {
    let resp = Client::new()
        .post(format!("{}/sweep", server.trim_end_matches('/')))
        .bearer_auth(token)
        .send()
        .await
        .context("HTTP request failed")?;

    if resp.status().is_success() {
        let json: Value = resp.json().await?;
        let n = json["swept"].as_u64().unwrap_or(0);
        println!("swept {n} expired secret(s)");
    } else {
        let status = resp.status();
        anyhow::bail!("server returned {status}");
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn require_admin_token(token: &Option<String>) -> Result<String> {
    token
        .clone()
        .context("--admin-token / BURNLINK_ADMIN_TOKEN is required for this command")
}

/// Split `.../s/<id>#<key>` into its parts. A bare ID needs `--key`.
fn split_link(link: &str, key: Option<&str>) -> Result<(String, String)> {
    let (before, fragment) = match link.split_once('#') {
        Some((before, fragment)) => (before, Some(fragment)),
        None => (link, None),
    };
    let short_id = before
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .context("link has no short id")?;
    let key = key
        .or(fragment)
        .filter(|k| !k.is_empty())
        .context("no key: pass a full link or --key")?;
    Ok((short_id.to_owned(), key.to_owned()))
}

/// Parse human duration strings like "1h", "30m", "7d", "5s" into seconds.
fn parse_duration(s: &str) -> Result<u64> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    Ok(d.as_secs())
}

fn format_timestamp(ts: i64) -> String {
    let t = std::time::UNIX_EPOCH + std::time::Duration::from_secs(ts.max(0) as u64);
    humantime::format_rfc3339_seconds(t).to_string()
}

fn unix_now() -> i64 {
    burnlink_server::unix_now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_full_link() {
        let (id, key) = split_link("https://burn.example/s/abc234#KEYKEY", None).unwrap();
        assert_eq!(id, "abc234");
        assert_eq!(key, "KEYKEY");
    }

    #[test]
    fn explicit_key_wins_over_fragment() {
        let (id, key) = split_link("abc234#frag", Some("flag")).unwrap();
        assert_eq!(id, "abc234");
        assert_eq!(key, "flag");
    }

    #[test]
    fn bare_id_without_key_is_an_error() {
        assert!(split_link("abc234", None).is_err());
        assert!(split_link("https://burn.example/s/abc234#", None).is_err());
    }

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("1h").unwrap(), 3600);
        assert_eq!(parse_duration("7d").unwrap(), 7 * 86400);
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn timestamps_render_as_rfc3339() {
        assert_eq!(format_timestamp(0), "1970-01-01T00:00:00Z");
    }
}
