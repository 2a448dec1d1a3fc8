//! Forest router daemon.
//!
//! ```text
//! forest-router mode=local myAdr=1.1 firstLeafAdr=1.16 lastLeafAdr=1.48 \
//!     ifTbl=ift lnkTbl=lt comtTbl=ctt rteTbl=rt statSpec=stats finTime=60
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use forest_router::config::Mode;
use forest_router::{Router, RouterConfig};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = match RouterConfig::parse_args(std::env::args().skip(1)) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("forest-router: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("forest-router: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cfg: RouterConfig) -> anyhow::Result<()> {
    let local = cfg.mode == Mode::Local;
    let rtr = Arc::new(Router::new(cfg));

    if local {
        rtr.read_tables()?;
        rtr.setup()?;
    }
    tracing::info!(
        my_adr = %rtr.my_adr(),
        mode = if local { "local" } else { "remote" },
        "forest router starting"
    );
    rtr.run()
}
