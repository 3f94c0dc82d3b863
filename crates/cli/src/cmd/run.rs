//! Run command implementation.
//!
//! Installs every configured bucket fail-fast before the script starts. If any
//! bucket cannot be bound, the script is never executed.

use std::path::Path;

use anyhow::{Context, Result};
use kvbridge_lib::{BridgeConfig, start_context};
use tracing::info;

pub fn cmd_run(script: &Path, config_path: &Path) -> Result<()> {
  let config = BridgeConfig::from_path(config_path)?;
  let ctx = start_context(&config).context("startup failed, script was not run")?;

  info!(script = %script.display(), buckets = ?ctx.aliases(), "running script");
  let result = ctx.exec_file(script);
  ctx.close();

  result.with_context(|| format!("script '{}' failed", script.display()))
}
