//! gqlsocket CLI - run GraphQL queries and subscriptions over a resilient
//! WebSocket.
//!
//! This is the main binary entry point. See the `gqlsocket` library for the
//! core functionality.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use gqlsocket::protocol::Variables;
use gqlsocket::{ClientConfig, GraphQLSocket, RequestOptions, Response};
use mimalloc::MiMalloc;

/// How long to wait for the close handshake before exiting.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "gqlsocket")]
#[command(version)]
#[command(about = "Run GraphQL operations over a reconnecting WebSocket", long_about = None)]
struct Cli {
    /// Socket URL (overrides config and GQLSOCKET_URL).
    #[arg(long, global = true)]
    url: Option<String>,

    /// Host for the default `ws://{host}/graphql` address when no URL is set.
    #[arg(long, global = true)]
    host: Option<String>,

    /// Milliseconds between reconnect attempts.
    #[arg(long, global = true)]
    retry_delay_ms: Option<u64>,

    /// Reconnect attempts before giving up (0 = never, negative = forever).
    #[arg(long, global = true, allow_hyphen_values = true)]
    max_attempts: Option<i64>,

    /// Do not reconnect after a disconnect.
    #[arg(long, global = true)]
    no_reconnect: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a query and print its result.
    Query(OperationArgs),
    /// Subscribe and print each result until Ctrl-C or server completion.
    Subscribe(OperationArgs),
}

#[derive(Args, Debug)]
struct OperationArgs {
    /// Operation text.
    #[arg(required_unless_present = "name", conflicts_with = "name")]
    body: Option<String>,

    /// Persisted operation name instead of operation text.
    #[arg(long)]
    name: Option<String>,

    /// Operation name to execute.
    #[arg(long)]
    op: Option<String>,

    /// Variables as a JSON object.
    #[arg(long)]
    vars: Option<String>,
}

impl OperationArgs {
    fn request(&self) -> Result<RequestOptions> {
        let vars = self
            .vars
            .as_deref()
            .map(serde_json::from_str::<Variables>)
            .transpose()
            .context("--vars must be a JSON object")?;

        Ok(RequestOptions {
            query: self.body.clone(),
            id: self.name.clone(),
            op: self.op.clone(),
            vars,
        })
    }
}

impl Cli {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(url) = &self.url {
            config.url = Some(url.clone());
        }
        if let Some(ms) = self.retry_delay_ms {
            config.retry_delay_ms = ms;
        }
        if let Some(max) = self.max_attempts {
            config.max_attempts = max;
        }
        if self.no_reconnect {
            config.auto_reconnect = false;
        }
    }
}

fn print_response(response: &Response) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(())
}

async fn run_query(client: &GraphQLSocket, args: &OperationArgs) -> Result<()> {
    let response = client.query_async(args.request()?).await?;
    print_response(&response)
}

async fn run_subscribe(client: &GraphQLSocket, args: &OperationArgs) -> Result<()> {
    let (id, mut responses) = client.subscribe_channel(args.request()?)?;
    log::info!("Subscribed (id {})", id);

    loop {
        tokio::select! {
            response = responses.recv() => match response {
                Some(response) => print_response(&response)?,
                None => {
                    log::info!("Subscription {} ended", id);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, cancelling subscription {}", id);
                client.unsubscribe(id);
                break;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = ClientConfig::load()?;
    cli.apply(&mut config);

    let client = GraphQLSocket::from_config(&config, || cli.host.clone())?;
    client
        .wait_open()
        .await
        .context("Connection closed before it opened")?;

    let result = match &cli.command {
        Command::Query(args) => run_query(&client, args).await,
        Command::Subscribe(args) => run_subscribe(&client, args).await,
    };

    client.close();
    if tokio::time::timeout(CLOSE_TIMEOUT, client.wait_closed())
        .await
        .is_err()
    {
        log::warn!("Close handshake did not finish within {:?}", CLOSE_TIMEOUT);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_by_body() {
        let cli = Cli::try_parse_from(["gqlsocket", "query", "{ viewer { id } }"]).unwrap();
        let Command::Query(args) = &cli.command else {
            panic!("expected query");
        };
        let request = args.request().unwrap();
        assert_eq!(request.query.as_deref(), Some("{ viewer { id } }"));
        assert_eq!(request.id, None);
    }

    #[test]
    fn test_subscribe_by_name_with_vars() {
        let cli = Cli::try_parse_from([
            "gqlsocket",
            "subscribe",
            "--name",
            "Ticks",
            "--op",
            "Main",
            "--vars",
            r#"{"every": 5}"#,
        ])
        .unwrap();
        let Command::Subscribe(args) = &cli.command else {
            panic!("expected subscribe");
        };
        let request = args.request().unwrap();
        assert_eq!(request.id.as_deref(), Some("Ticks"));
        assert_eq!(request.op.as_deref(), Some("Main"));
        assert_eq!(request.vars.unwrap()["every"], 5);
    }

    #[test]
    fn test_body_and_name_conflict() {
        assert!(Cli::try_parse_from(["gqlsocket", "query", "{ a }", "--name", "A"]).is_err());
        assert!(Cli::try_parse_from(["gqlsocket", "query"]).is_err());
    }

    #[test]
    fn test_invalid_vars_rejected() {
        let cli =
            Cli::try_parse_from(["gqlsocket", "query", "{ a }", "--vars", "[1, 2]"]).unwrap();
        let Command::Query(args) = &cli.command else {
            panic!("expected query");
        };
        assert!(args.request().is_err());
    }

    #[test]
    fn test_global_flags_override_config() {
        let cli = Cli::try_parse_from([
            "gqlsocket",
            "query",
            "{ a }",
            "--url",
            "ws://localhost:4000/graphql",
            "--max-attempts",
            "-1",
            "--no-reconnect",
        ])
        .unwrap();
        let mut config = ClientConfig::default();
        cli.apply(&mut config);

        assert_eq!(config.url.as_deref(), Some("ws://localhost:4000/graphql"));
        assert_eq!(config.max_attempts, -1);
        assert!(!config.auto_reconnect);
    }
}
