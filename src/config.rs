use std::path::PathBuf;

use clap::Parser;

/// CLI surface for the single `bit-swarm` binary (spec §6). Exactly one
/// of `seed`/`get` selects seeder/leecher role; with neither set the
/// process runs as a pure DHT node and parks.
#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Minimal BitTorrent-style peer-to-peer file sharing node")]
pub struct Config {
    /// Path to a payload file to seed.
    #[arg(long)]
    pub seed: Option<PathBuf>,

    /// Path to a `.bit` metadata sidecar to download.
    #[arg(long)]
    pub get: Option<PathBuf>,

    /// TCP listen address ("HOST:PORT"; a bare ":PORT" binds all interfaces).
    #[arg(long, default_value = ":6881")]
    pub addr: String,

    /// Comma-separated static TCP peer contacts.
    #[arg(long, default_value = "")]
    pub peer: String,

    /// Directory the leecher writes the reconstructed file into.
    #[arg(long, default_value = ".")]
    pub dest: PathBuf,

    /// UDP bind address for the DHT node; empty disables it.
    #[arg(long = "dht-listen", default_value = ":0")]
    pub dht_listen: String,

    /// Comma-separated UDP contacts to ping at startup.
    #[arg(long, default_value = "")]
    pub bootstrap: String,

    /// Seconds to keep seeding after a leecher download completes.
    #[arg(long, default_value_t = 0)]
    pub keep: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::parse_from(["bit-swarm"]);
        assert_eq!(cfg.addr, ":6881");
        assert_eq!(cfg.dht_listen, ":0");
        assert_eq!(cfg.keep, 0);
        assert!(cfg.seed.is_none());
        assert!(cfg.get.is_none());
    }

    #[test]
    fn seed_flag_parses_path() {
        let cfg = Config::parse_from(["bit-swarm", "--seed", "payload.bin"]);
        assert_eq!(cfg.seed, Some(PathBuf::from("payload.bin")));
    }
}
