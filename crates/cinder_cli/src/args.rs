use std::{net::SocketAddr, path::PathBuf};

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[clap(name = "cinder")]
#[command(author, version, about, long_about = None)]
pub(crate) struct Args {
    /// Read this config file instead of the one in the user's config
    /// folder.
    #[clap(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter, like `info` or `cinder=debug`. Defaults to RUST_LOG,
    /// then `info`.
    #[clap(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Download a torrent, then keep seeding it until interrupted.
    Download {
        #[command(flatten)]
        peer: PeerArgs,

        /// Quit as soon as every piece is downloaded.
        #[clap(short, long)]
        quit_after_complete: bool,
    },

    /// Seed a torrent whose data is already complete on disk.
    Seed {
        #[command(flatten)]
        peer: PeerArgs,
    },

    /// Run the HTTP tracker.
    Track {
        /// The tracker will accept HTTP requests on this address.
        #[clap(short, long)]
        listen: Option<SocketAddr>,

        /// File the tracker keeps its swarms in across restarts.
        #[clap(long)]
        dfile: Option<PathBuf>,
    },

    /// Point a metafile at another tracker. The info hash does not change.
    Reannounce {
        metafile: PathBuf,
        url: String,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct PeerArgs {
    /// The `.torrent` file.
    pub metafile: PathBuf,

    /// The directory in which the torrent's files are stored.
    #[clap(short, long)]
    pub download_dir: Option<PathBuf>,

    /// Accept peer connections on this address.
    #[clap(short, long)]
    pub listen: Option<SocketAddr>,
}
