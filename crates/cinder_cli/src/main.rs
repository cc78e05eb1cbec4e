//
//  Daemon --> Torrent <--> Peers
//                |
//               \/
//             Tracker
//
use std::{path::Path, process::ExitCode, time::Duration};

use clap::Parser;
use cinder::{
    config::{Config, TrackerConfig},
    daemon::Daemon,
    metainfo::{rewrite_announce, MetaInfo},
    torrent::{TorrentHandle, TorrentState, TorrentStatus},
    tracker_server::TrackerServer,
    utils::{to_human_rate, to_human_readable},
};
use tokio::{net::TcpListener, select, signal, spawn, time::interval};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{
    args::{Args, Command, PeerArgs},
    error::Error,
};

mod args;
mod error;

/// How often a running download logs its progress.
const REPORT_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() { ExitCode::from(1) } else { ExitCode::SUCCESS };
        }
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("cinder: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(args: Args) -> Result<(), Error> {
    let config = args.config.as_deref();
    let log_level = args.log_level.as_deref();

    match args.command {
        Command::Download { peer, quit_after_complete } => {
            swarm(peer, config, log_level, false, quit_after_complete).await
        }
        Command::Seed { peer } => swarm(peer, config, log_level, true, false).await,
        Command::Track { listen, dfile } => {
            let mut config = match config {
                Some(path) => TrackerConfig::load_from(path)?,
                None => TrackerConfig::load()?,
            };
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if dfile.is_some() {
                config.dfile = dfile;
            }
            let _guard = init_logging(log_level, config.log_file.as_deref())?;
            track(config).await
        }
        Command::Reannounce { metafile, url } => {
            let _guard = init_logging(log_level, None)?;
            reannounce(&metafile, &url)
        }
    }
}

/// Install the fmt subscriber on stderr, plus a daily rolling file when
/// `log_file` is set. The guard flushes the file writer when dropped.
fn init_logging(level: Option<&str>, log_file: Option<&Path>) -> Result<Option<WorkerGuard>, Error> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).map_err(|e| Error::Logging(e.to_string()))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| Error::Logging(format!("`{}` is not a file", path.display())))?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))?;
    Ok(guard)
}

/// Download or seed one torrent until interrupted.
async fn swarm(
    args: PeerArgs,
    config: Option<&Path>,
    log_level: Option<&str>,
    seed_only: bool,
    quit_after_complete: bool,
) -> Result<(), Error> {
    let mut config = match config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(dir) = args.download_dir {
        config.download_dir = dir;
    }
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    let _guard = init_logging(log_level, config.log_file.as_deref())?;

    let meta = MetaInfo::read(&args.metafile)?;
    let daemon = Daemon::bind(config).await?;
    let handle = daemon.handle();
    let daemon_task = spawn(daemon.run());

    let torrent = handle.add_torrent(meta, seed_only).await?;
    select! {
        _ = signal::ctrl_c() => info!("interrupted, shutting down"),
        _ = watch(torrent, quit_after_complete) => {}
    }

    // the first error a torrent stopped with decides the exit code
    let quit = handle.quit().await;
    if let Err(e) = daemon_task.await {
        warn!("daemon task failed: {e}");
    }
    quit?;
    Ok(())
}

/// Log progress until the torrent stops, or completes when
/// `quit_after_complete`.
async fn watch(mut torrent: TorrentHandle, quit_after_complete: bool) {
    let reporter = torrent.clone();
    let mut report = interval(REPORT_INTERVAL);
    let done = |s: &TorrentState| {
        matches!(s.status, TorrentStatus::Stopped | TorrentStatus::Error(_))
            || (quit_after_complete && s.status == TorrentStatus::Seeding)
    };

    loop {
        select! {
            _ = report.tick() => log_state(&reporter.state()),
            r = torrent.wait_for(done) => {
                if let Ok(state) = r {
                    log_state(&state);
                }
                return;
            }
        }
    }
}

fn log_state(s: &TorrentState) {
    let status: &str = (&s.status).into();
    info!(
        "{} {status}: {} of {}, down {} up {}, {} peers ({} seeds), {:.2} copies",
        s.name,
        to_human_readable((s.size - s.left) as f64),
        to_human_readable(s.size as f64),
        to_human_rate(s.download_rate),
        to_human_rate(s.upload_rate),
        s.peers,
        s.seeds,
        s.distributed_copies,
    );
}

async fn track(config: TrackerConfig) -> Result<(), Error> {
    let server = TrackerServer::new(config.clone()).await?;
    let listener = TcpListener::bind(config.listen).await.map_err(cinder::error::Error::from)?;
    let handle = server.handle();
    let mut task = spawn(server.run(listener));

    let finished = select! {
        _ = signal::ctrl_c() => None,
        r = &mut task => Some(r),
    };
    let r = match finished {
        Some(r) => {
            warn!("tracker stopped on its own");
            r
        }
        None => {
            info!("interrupted, shutting down");
            handle.quit().await?;
            task.await
        }
    };
    r.map_err(cinder::error::Error::from)??;
    Ok(())
}

fn reannounce(metafile: &Path, url: &str) -> Result<(), Error> {
    let buf = std::fs::read(metafile)
        .map_err(|_| cinder::error::Error::FileOpenError(metafile.display().to_string()))?;
    let rewritten = rewrite_announce(&buf, url)?;
    std::fs::write(metafile, rewritten).map_err(|e| Error::Write(metafile.to_path_buf(), e))?;
    info!("{} now announces to {url}", metafile.display());
    Ok(())
}
