//! Pool with a per-worker initializer
//!
//! Every invocation re-runs the initializer, so each call sees the globals it
//! sets. Runs on the localhost backend unless `NIMBUS_BACKEND` says otherwise.
//!
//! ```sh
//! RUST_LOG=nimbus=debug cargo run -p nimbus-pool --example pool_initializer
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use nimbus_pool::{CallError, Config, FunctionRegistry, Globals, Pool};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nimbus=info")),
        )
        .init();

    let mut registry = FunctionRegistry::new();
    let initializer = registry
        .register_initializer("initializer", |globals: &mut Globals, (arg1, arg2): (String, i64)| {
            globals.set("param1", arg1)?;
            globals.set("param2", arg2)
        })
        .context("register initializer")?;
    let work = registry
        .register_function("work", |globals: &Globals, _num: i64| -> Result<(String, i64), CallError> {
            Ok((globals.get("param1")?, globals.get("param2")?))
        })
        .context("register work")?;

    let config = Config::from_env().context("load configuration")?;
    let pool = Pool::builder(config)
        .registry(Arc::new(registry))
        .initializer(&initializer, ("important global arg".to_string(), 123456))
        .build()?;

    let results = pool
        .scope(|pool| async move { pool.map(&work, vec![0, 0, 0]).await })
        .await??;

    for result in results {
        match result {
            Ok((param1, param2)) => println!("({param1:?}, {param2})"),
            Err(error) => eprintln!("call failed: {error}"),
        }
    }

    Ok(())
}
