//! Multi-bucket installation at context startup.

use std::rc::Rc;

use thiserror::Error;
use tracing::{error, info};

use crate::bucket::BucketBinding;
use crate::config::{BridgeConfig, BucketConfig};
use crate::context::ScriptContext;
use crate::error::BridgeError;
use crate::store::StoreClient;

/// Why a context could not be started.
#[derive(Debug, Error)]
pub enum InstallError {
  /// The store client itself could not be created.
  #[error("failed to start store client: {0}")]
  Client(#[source] BridgeError),

  /// A bucket failed to bind; nothing remains installed.
  #[error("bucket #{index} ('{alias}') failed to bind: {source}")]
  Binding {
    alias: String,
    index: usize,
    #[source]
    source: BridgeError,
  },
}

impl InstallError {
  /// The underlying bridge error.
  pub fn bridge_error(&self) -> &BridgeError {
    match self {
      InstallError::Client(source) | InstallError::Binding { source, .. } => source,
    }
  }
}

/// Bind `buckets` into `ctx` in declaration order.
///
/// Fail-fast: the first failure stops installation, and bindings made earlier in the
/// same call are torn down again before the error is returned.
pub fn install_buckets(
  ctx: &ScriptContext,
  client: &StoreClient,
  buckets: &[BucketConfig],
) -> Result<Vec<Rc<BucketBinding>>, InstallError> {
  let mut installed: Vec<Rc<BucketBinding>> = Vec::with_capacity(buckets.len());

  for (index, bucket) in buckets.iter().enumerate() {
    match ctx.bind_bucket(client, bucket) {
      Ok(binding) => installed.push(binding),
      Err(source) => {
        error!(
          alias = %bucket.alias,
          index,
          rolled_back = installed.len(),
          error = %source,
          "bucket installation failed"
        );
        for binding in installed.iter().rev() {
          ctx.unbind(binding.alias());
        }
        return Err(InstallError::Binding {
          alias: bucket.alias.clone(),
          index,
          source,
        });
      }
    }
  }

  info!(buckets = installed.len(), "installed buckets");
  Ok(installed)
}

/// Create a context with every configured bucket bound, ready to run scripts.
pub fn start_context(config: &BridgeConfig) -> Result<ScriptContext, InstallError> {
  let client = StoreClient::new(config.settings.clone()).map_err(InstallError::Client)?;
  let ctx = ScriptContext::new();
  install_buckets(&ctx, &client, &config.buckets)?;
  Ok(ctx)
}
