use crate::error::{Result, SwarmError};
use crate::peer::{
    FramerDriver, Message, MessageFramer, MessageId, MessageReceiver, ReadInterest, MAX_MESSAGE_LENGTH,
    MIN_RECEIVE_BUFFER,
};
use crate::piece::{Bitfield, PieceInterval, PieceLayout, StrategyKind, SwarmCoordinator, DEFAULT_CHUNK_SIZE};
use crate::storage::{DiskBackend, FileBackend, PieceHash};
use crate::webseed::WebSeed;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use url::Url;

/// Configuration for the swarm client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub download_dir: String,
    /// Capacity of each connection's receive buffer
    pub receive_buffer_size: usize,
    /// Largest block handed to the disk at once
    pub write_chunk_size: usize,
    pub max_message_length: u32,
    /// Most bytes leased to one source at a time; one piece if unset
    pub lease_size: Option<u64>,
    pub strategy: StrategyKind,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            download_dir: "./downloads".to_string(),
            receive_buffer_size: 64 * 1024,
            write_chunk_size: DEFAULT_CHUNK_SIZE,
            max_message_length: MAX_MESSAGE_LENGTH,
            lease_size: None,
            strategy: StrategyKind::default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.receive_buffer_size < MIN_RECEIVE_BUFFER {
            return Err(SwarmError::ConfigError(format!(
                "receive buffer of {} bytes is below the minimum of {}",
                self.receive_buffer_size, MIN_RECEIVE_BUFFER
            )));
        }
        if self.write_chunk_size == 0 {
            return Err(SwarmError::ConfigError("write chunk size must be positive".to_string()));
        }
        if self.max_message_length > MAX_MESSAGE_LENGTH || self.max_message_length < 10 {
            return Err(SwarmError::ConfigError(format!(
                "max message length must be between 10 and {}",
                MAX_MESSAGE_LENGTH
            )));
        }
        if self.lease_size == Some(0) {
            return Err(SwarmError::ConfigError("lease size must be positive".to_string()));
        }
        Ok(())
    }
}

/// Result of a web seed download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchSummary {
    pub downloaded: u64,
    pub verified: u64,
    pub lost: u64,
    pub complete: bool,
}

/// What a captured peer-wire stream contained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Messages per type ID, piece slices not counted
    pub messages: BTreeMap<u8, u64>,
    pub pieces: u64,
    pub piece_bytes: u64,
    pub keep_alive_only: bool,
    /// Pieces the peer announced in its bitfield and HAVEs
    pub pieces_announced: Option<usize>,
    pub bytes_consumed: u64,
}

/// Accepts every piece and only counts.
struct Inspector {
    summary: ReplaySummary,
    announced: Option<Bitfield>,
    num_pieces: Option<usize>,
}

impl MessageReceiver for Inspector {
    fn is_wanted(&mut self, _interval: &PieceInterval) -> bool {
        true
    }

    fn piece_complete(&mut self, _interval: &PieceInterval) {
        self.summary.pieces += 1;
    }

    fn receive(&mut self, message: Message) -> Result<()> {
        match &message {
            Message::Piece(_, data) => {
                self.summary.piece_bytes += data.len() as u64;
                return Ok(());
            }
            Message::Bitfield(bits) => {
                let count = self.num_pieces.unwrap_or(bits.len() * 8);
                self.announced = Some(Bitfield::from_bytes(bits, count));
            }
            Message::Generic(MessageId::Have, _) => {
                if let (Some(index), Some(announced)) = (message.as_have(), self.announced.as_mut()) {
                    announced.set_piece(index as usize);
                }
            }
            Message::Generic(..) => {}
        }

        *self.summary.messages.entry(message.id().as_u8()).or_default() += 1;
        Ok(())
    }
}

/// Main swarm client
pub struct SwarmClient {
    config: ClientConfig,
}

impl SwarmClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        info!("Client initialized with strategy {:?}", config.strategy);
        Ok(Self { config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// A coordinator set up the way this client is configured.
    pub fn coordinator(&self, layout: PieceLayout, backend: Arc<dyn DiskBackend>) -> SwarmCoordinator {
        let mut builder = SwarmCoordinator::builder(layout, backend)
            .strategy(self.config.strategy.build())
            .chunk_size(self.config.write_chunk_size);
        if let Some(lease_size) = self.config.lease_size {
            builder = builder.lease_size(lease_size);
        }
        builder.build()
    }

    /// Downloads `layout` from the given web seeds into the download
    /// directory, all seeds sharing one coordinator.
    pub async fn fetch(
        &self,
        seeds: &[Url],
        layout: PieceLayout,
        hashes: Option<Vec<PieceHash>>,
    ) -> Result<FetchSummary> {
        if seeds.is_empty() {
            return Err(SwarmError::ConfigError("no web seed given".to_string()));
        }

        info!("Starting download of {} bytes from {} seeds", layout.total_length(), seeds.len());
        let backend = Arc::new(FileBackend::new(&self.config.download_dir, layout.clone(), hashes).await?);
        let coordinator = self.coordinator(layout, backend);

        let handles: Vec<_> = seeds
            .iter()
            .map(|url| {
                let seed = WebSeed::new(coordinator.clone(), url.clone());
                tokio::spawn(async move { seed.download().await })
            })
            .collect();

        let mut downloaded = 0;
        for (url, handle) in seeds.iter().zip(handles) {
            match handle.await {
                Ok(Ok(bytes)) => downloaded += bytes,
                Ok(Err(e)) => warn!("Web seed {} failed: {}", url, e),
                Err(e) => error!("Web seed task for {} panicked: {}", url, e),
            }
        }

        let summary = FetchSummary {
            downloaded,
            verified: coordinator.amount_verified(),
            lost: coordinator.amount_lost(),
            complete: coordinator.is_complete(),
        };
        if !summary.complete {
            return Err(SwarmError::WebSeedError(format!(
                "download incomplete: {} of {} bytes verified",
                summary.verified,
                coordinator.layout().total_length()
            )));
        }

        info!("Download complete: {} bytes", summary.verified);
        Ok(summary)
    }

    /// Runs a captured post-handshake byte stream through the framer and
    /// reports what it held. With a layout, piece headers are checked
    /// against it.
    pub async fn replay(&self, input: &Path, layout: Option<PieceLayout>) -> Result<ReplaySummary> {
        let mut file = tokio::fs::File::open(input).await?;

        let mut framer = MessageFramer::new().with_max_length(self.config.max_message_length);
        let num_pieces = layout.as_ref().map(|l| l.num_pieces());
        if let Some(layout) = layout {
            framer = framer.with_layout(layout);
        }

        let inspector = Inspector {
            summary: ReplaySummary::default(),
            announced: None,
            num_pieces,
        };
        let driver = FramerDriver::new(framer, inspector, self.config.receive_buffer_size, ReadInterest::new())?;
        driver.run(&mut file).await?;

        let bytes_consumed = driver.bytes_consumed();
        Ok(driver.with_receiver(|inspector| {
            let mut summary = inspector.summary.clone();
            summary.bytes_consumed = bytes_consumed;
            summary.keep_alive_only = bytes_consumed > 0 && summary.messages.is_empty();
            summary.pieces_announced = inspector.announced.as_ref().map(|b| b.count());
            summary
        }))
    }
}
