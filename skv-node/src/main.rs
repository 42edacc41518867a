use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use skv_node::{server, Store, DEFAULT_DATABASES};

struct Args {
    bind: String,
    password: Option<String>,
    databases: usize,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        bind: "127.0.0.1:6379".to_string(),
        password: None,
        databases: DEFAULT_DATABASES,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(flag) = iter.next() {
        let mut value = || iter.next().with_context(|| format!("missing value for {flag}"));
        match flag.as_str() {
            "--bind" => args.bind = value()?,
            "--password" => args.password = Some(value()?),
            "--databases" => {
                args.databases = value()?.parse().context("--databases must be a number")?;
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).compact().init();

    let args = parse_args()?;
    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(
        bind = %args.bind,
        databases = args.databases,
        auth = args.password.is_some(),
        "skv-node listening"
    );

    let store = Arc::new(Store::new(args.databases, args.password));
    server::serve(listener, store).await?;
    Ok(())
}
