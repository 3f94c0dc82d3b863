//! Serve command implementation.

use anyhow::{Context, Result};
use kvbridge_lib::{ServerOptions, StoreServer};
use tokio::runtime::Builder;

use crate::output::{print_info, print_success};

pub fn cmd_serve(listen: &str, stores: Vec<String>, token: Option<String>) -> Result<()> {
  let runtime = Builder::new_multi_thread()
    .thread_name("kvbridge-serve")
    .enable_all()
    .build()
    .context("failed to start runtime")?;

  runtime.block_on(async {
    let names = stores.join(", ");
    let options = ServerOptions { stores, token };
    let server = StoreServer::bind(listen, options)
      .await
      .with_context(|| format!("failed to listen on {}", listen))?;

    print_success(&format!("Serving {} on {}", names, server.local_addr()?));
    print_info("Press Ctrl-C to stop");

    server
      .serve(async {
        let _ = tokio::signal::ctrl_c().await;
      })
      .await?;
    Ok::<_, anyhow::Error>(())
  })
}
