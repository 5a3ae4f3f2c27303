use crate::client::{ClientConfig, SwarmClient};
use crate::error::{Result, SwarmError};
use crate::peer::MessageId;
use crate::piece::{PieceLayout, StrategyKind};
use crate::storage::PieceHash;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use url::Url;

#[derive(Parser)]
#[command(name = "bittorrent-swarm")]
#[command(about = "Swarm piece leasing and peer-wire framing for BitTorrent downloads", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download content from one or more HTTP web seeds
    Fetch {
        /// Web seed URL; a URL ending in '/' gets the file path appended
        #[arg(short, long = "url", required = true)]
        urls: Vec<Url>,

        /// Piece length in bytes
        #[arg(short, long)]
        piece_length: u64,

        /// A file of the download as NAME:LENGTH, in order; nested paths use '/'
        #[arg(short, long = "file", required = true, value_parser = parse_file)]
        files: Vec<(Vec<String>, u64)>,

        /// Expected SHA1 of each piece, hex encoded, in piece order
        #[arg(long = "piece-hash", value_parser = parse_hash)]
        piece_hashes: Vec<PieceHash>,

        /// Download directory
        #[arg(short, long, default_value = "./downloads")]
        output: String,

        /// How leases are picked
        #[arg(short, long, value_enum, default_value_t = StrategyKind::Sequential)]
        strategy: StrategyKind,

        /// Largest block written to disk at once
        #[arg(long, default_value_t = crate::piece::DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,

        /// Most bytes leased to one seed at a time (default: one piece)
        #[arg(long)]
        lease_size: Option<u64>,
    },

    /// Parse a captured peer-wire stream (after the handshake) and summarize it
    Replay {
        /// File holding the raw bytes
        #[arg(short, long)]
        input: PathBuf,

        /// Piece length, to check piece messages against
        #[arg(short, long, requires = "length")]
        piece_length: Option<u64>,

        /// Total download length, to check piece messages against
        #[arg(short, long, requires = "piece_length")]
        length: Option<u64>,

        /// Receive buffer size in bytes
        #[arg(long, default_value_t = 64 * 1024)]
        buffer_size: usize,
    },
}

fn parse_file(s: &str) -> std::result::Result<(Vec<String>, u64), String> {
    let (name, length) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("expected NAME:LENGTH, got '{}'", s))?;
    let length = length
        .parse()
        .map_err(|e| format!("invalid length in '{}': {}", s, e))?;
    let path: Vec<String> = name.split('/').filter(|c| !c.is_empty()).map(String::from).collect();
    if path.is_empty() {
        return Err(format!("empty file name in '{}'", s));
    }
    Ok((path, length))
}

fn parse_hash(s: &str) -> std::result::Result<PieceHash, String> {
    let bytes = hex::decode(s).map_err(|e| format!("invalid hex '{}': {}", s, e))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("piece hash must be 20 bytes, got {}", b.len()))
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Fetch {
                urls,
                piece_length,
                files,
                piece_hashes,
                output,
                strategy,
                chunk_size,
                lease_size,
            } => {
                let layout = PieceLayout::from_files(*piece_length, files.clone())?;
                let hashes = (!piece_hashes.is_empty()).then(|| piece_hashes.clone());

                let config = ClientConfig {
                    download_dir: output.clone(),
                    write_chunk_size: *chunk_size,
                    lease_size: *lease_size,
                    strategy: *strategy,
                    ..Default::default()
                };

                let client = SwarmClient::new(config)?;
                let summary = client.fetch(urls, layout, hashes).await?;

                println!("Downloaded {} bytes", summary.downloaded);
                println!("Verified:   {} bytes", summary.verified);
                println!("Lost:       {} bytes", summary.lost);
            }

            Commands::Replay {
                input,
                piece_length,
                length,
                buffer_size,
            } => {
                let layout = match (piece_length, length) {
                    (Some(piece_length), Some(length)) => {
                        Some(PieceLayout::single_file("replay", *piece_length, *length)?)
                    }
                    (None, None) => None,
                    _ => {
                        return Err(SwarmError::ConfigError(
                            "--piece-length and --length go together".to_string(),
                        ))
                    }
                };

                let config = ClientConfig {
                    receive_buffer_size: *buffer_size,
                    ..Default::default()
                };
                let client = SwarmClient::new(config)?;
                let summary = client.replay(input, layout).await?;

                println!("Replay of {}", input.display());
                println!("==================");
                println!("Bytes parsed: {}", summary.bytes_consumed);
                println!("Pieces: {} ({} bytes)", summary.pieces, summary.piece_bytes);
                if let Some(count) = summary.pieces_announced {
                    println!("Pieces announced by peer: {}", count);
                }
                if summary.keep_alive_only {
                    println!("Only keep-alives seen");
                }
                println!("\nMessages:");
                for (id, count) in &summary.messages {
                    println!("  {:?}: {}", MessageId::from(*id), count);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file() {
        assert_eq!(parse_file("a.bin:10"), Ok((vec!["a.bin".to_string()], 10)));
        assert_eq!(
            parse_file("dir/b.bin:7"),
            Ok((vec!["dir".to_string(), "b.bin".to_string()], 7))
        );
        assert!(parse_file("nolength").is_err());
        assert!(parse_file(":5").is_err());
    }

    #[test]
    fn test_parse_hash() {
        let hex = "0123456789abcdef0123456789abcdef01234567";
        assert_eq!(parse_hash(hex).unwrap()[..2], [0x01, 0x23]);
        assert!(parse_hash("abcd").is_err());
        assert!(parse_hash("zz").is_err());
    }

    #[test]
    fn test_cli_parses_fetch() {
        let cli = Cli::try_parse_from([
            "bittorrent-swarm",
            "fetch",
            "--url",
            "http://seed.example/files/",
            "--piece-length",
            "16384",
            "--file",
            "a.bin:100",
            "--file",
            "b.bin:200",
            "--strategy",
            "largest-gap",
        ])
        .unwrap();

        match cli.command {
            Commands::Fetch {
                urls, files, strategy, ..
            } => {
                assert_eq!(urls.len(), 1);
                assert_eq!(files.len(), 2);
                assert_eq!(strategy, StrategyKind::LargestGap);
            }
            _ => panic!("expected fetch"),
        }
    }
}
