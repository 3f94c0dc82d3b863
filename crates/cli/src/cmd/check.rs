//! Check command implementation.
//!
//! Binds each configured bucket into a scratch context and reports the outcome per
//! bucket. Unlike `run`, every bucket is attempted even after a failure.

use std::path::Path;
use std::time::Instant;

use anyhow::{Result, bail};
use kvbridge_lib::{BridgeConfig, ScriptContext, StoreClient};

use crate::output::{format_duration, print_error, print_success, print_warning, symbols};

pub fn cmd_check(config_path: &Path) -> Result<()> {
  let config = BridgeConfig::from_path(config_path)?;
  if config.buckets.is_empty() {
    print_warning(&format!("No buckets configured in {}", config_path.display()));
    return Ok(());
  }

  let client = StoreClient::new(config.settings.clone())?;
  let ctx = ScriptContext::new();
  let mut failed = 0;

  for bucket in &config.buckets {
    let started = Instant::now();
    match ctx.bind_bucket(&client, bucket) {
      Ok(_) => print_success(&format!(
        "{} {} {}/{} ({})",
        bucket.alias,
        symbols::ARROW,
        bucket.endpoint,
        bucket.store_name,
        format_duration(started.elapsed())
      )),
      Err(e) => {
        failed += 1;
        print_error(&format!("{} [{}]: {}", bucket.alias, e.kind(), e));
      }
    }
  }
  ctx.close();

  if failed > 0 {
    bail!("{} of {} buckets failed", failed, config.buckets.len());
  }
  Ok(())
}
