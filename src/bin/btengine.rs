use clap::Parser;
use std::path::PathBuf;
use torrent_engine::config::EngineConfig;
use torrent_engine::runner::Runner;
use torrent_engine::torrent::{self, Metainfo};
use tracing_subscriber::EnvFilter;

/// Downloads a single torrent, identified by a `.torrent` file or a
/// magnet URI, to an output directory.
#[derive(Parser, Debug)]
#[command(name = "btengine")]
struct Cli {
    /// Path to a `.torrent` file, or a `magnet:` URI.
    source: String,

    /// Directory to write the downloaded file(s) into.
    #[arg(short, long, default_value = ".")]
    out: PathBuf,

    /// Preferred inbound listen port (falls back to an ephemeral port).
    #[arg(short, long, default_value_t = 6881)]
    port: u16,

    /// Maximum simultaneous peer connections.
    #[arg(long, default_value_t = 128)]
    max_peers: usize,

    /// Disable the DHT.
    #[arg(long)]
    no_dht: bool,

    /// Disable Local Service Discovery.
    #[arg(long)]
    no_lsd: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let metainfo = load_metainfo(&cli.source)?;

    let mut config = EngineConfig::default();
    config.max_peers = cli.max_peers;

    std::fs::create_dir_all(&cli.out)?;
    let runner = Runner::new(&metainfo, &cli.out, config, None, !cli.no_dht, !cli.no_lsd).await?;

    tracing::info!(name = %metainfo.info.name, pieces = metainfo.info.num_pieces(), "starting download");
    runner.run(cli.port).await?;

    Ok(())
}

fn load_metainfo(source: &str) -> anyhow::Result<Metainfo> {
    if source.starts_with("magnet:") {
        let magnet = torrent::parse_magnet(source)?;
        anyhow::bail!(
            "magnet URI given ({}); metadata exchange is not implemented, pass a .torrent file instead",
            magnet.display_name.unwrap_or_default()
        );
    }
    let bytes = std::fs::read(source)?;
    Ok(torrent::parse_torrent(&bytes)?)
}
