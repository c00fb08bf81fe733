// Copyright PingCAP Inc. 2025.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; version 2 of the License.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use filetracker::config::Config;
use filetracker::fallback::{FallbackStrategy, RedirectFallback};
use filetracker::http::{router, AppState};
use filetracker::observability::tracing_setup;
use filetracker::storage::FileStorage;

#[derive(Parser, Debug)]
#[command(name = "filetracker-server")]
#[command(about = "Content-addressed file storage server with versioned paths", long_about = None)]
struct Args {
    /// Listen on specified address
    #[arg(short = 'l', long = "listen-on")]
    listen_on: Option<String>,

    /// Listen on specified port number
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Storage root directory (taken from FILETRACKER_DIR if not present)
    #[arg(short = 'd', long, env = "FILETRACKER_DIR")]
    dir: Option<String>,

    /// Log file location (stderr by default)
    #[arg(short = 'L', long)]
    log: Option<String>,

    /// Do not daemonize, stay in foreground
    #[arg(short = 'D', long = "no-daemon")]
    no_daemon: bool,

    /// Turns on migration mode and redirects requests for nonexistent
    /// files to the remote
    #[arg(long)]
    fallback_url: Option<String>,

    /// Path to configuration file
    #[arg(short = 'c', long)]
    config: Option<String>,

    /// Delete unreferenced blobs before serving
    #[arg(long)]
    sweep: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };

    // Command line args override config file
    if let Some(listen_on) = args.listen_on {
        cfg.listen_on = listen_on;
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(dir) = args.dir {
        cfg.dir = Some(dir);
    }
    if let Some(log) = args.log {
        cfg.log = Some(log);
    }
    if args.no_daemon {
        cfg.daemonize = false;
    }
    if let Some(url) = args.fallback_url {
        cfg.fallback_url = Some(url);
    }
    if args.sweep {
        cfg.sweep_on_startup = true;
    }

    let dir = cfg
        .dir
        .clone()
        .ok_or("storage directory not set; use --dir or FILETRACKER_DIR")?;

    tracing_setup::init_tracing_from_env(cfg.log.as_deref().map(Path::new))?;

    if cfg.daemonize {
        // Fork before the runtime exists; tokio worker threads do not
        // survive one.
        daemonize::Daemonize::new().start()?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(cfg, dir))
}

async fn serve(cfg: Config, dir: String) -> Result<(), Box<dyn std::error::Error>> {
    let storage = Arc::new(FileStorage::open(Path::new(&dir))?);

    if cfg.sweep_on_startup {
        let removed = storage.sweep_orphans()?;
        tracing::info!(removed, "orphan sweep finished");
    }

    let fallback = cfg.fallback_url.as_ref().map(|url| {
        tracing::info!(origin = %url, "migration mode: redirecting misses to legacy origin");
        Arc::new(RedirectFallback::new(url.clone())) as Arc<dyn FallbackStrategy>
    });

    let app = router(AppState { storage, fallback });

    let addr: SocketAddr = format!("{}:{}", cfg.listen_on, cfg.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("filetracker server listening on {}", addr);

    tokio::select! {
        r = axum::serve(listener, app) => {
            if let Err(e) = r {
                tracing::error!("server exited with error: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("ctrl-c received, shutting down");
        }
    }

    Ok(())
}
