//! HTTP web seeds: plain web servers holding a copy of the download,
//! fetched with ranged `GET`s.

use crate::error::{Result, SwarmError};
use crate::peer::ReadInterest;
use crate::piece::{Bitfield, ByteRange, SwarmCoordinator};
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// One ranged request: the lease it fills and the bytes of one file it
/// asks the server for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRequest {
    pub lease: ByteRange,
    pub file_index: usize,
    pub url: Url,
    /// Inclusive range within the file
    pub file_range: ByteRange,
}

impl RangeRequest {
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.file_range.low, self.file_range.high)
    }
}

/// Downloads leases from a single web seed until nothing is left to lease.
///
/// A URL ending in `/` names a directory and the file path is appended to
/// it; any other URL is used as is for every file.
#[derive(Clone)]
pub struct WebSeed {
    client: Client,
    base: Url,
    coordinator: SwarmCoordinator,
}

impl WebSeed {
    pub fn new(coordinator: SwarmCoordinator, base: Url) -> Self {
        Self::with_client(Client::new(), coordinator, base)
    }

    pub fn with_client(client: Client, coordinator: SwarmCoordinator, base: Url) -> Self {
        Self {
            client,
            base,
            coordinator,
        }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Turns a held lease into a request. A lease running past the end of
    /// its first file is shrunk to end with that file.
    pub fn plan_request(&self, lease: ByteRange) -> Result<RangeRequest> {
        let layout = self.coordinator.layout();
        let file_index = layout
            .file_at(lease.low)
            .ok_or_else(|| SwarmError::InvalidRange(format!("{} is outside every file", lease)))?;
        let file = &layout.files()[file_index];
        let file_end = file.offset + file.length - 1;

        let lease = if lease.high > file_end {
            self.coordinator
                .renew_lease(lease, ByteRange::new(lease.low, file_end))?
        } else {
            lease
        };

        let url = if self.base.path().ends_with('/') {
            let mut url = self.base.clone();
            url.path_segments_mut()
                .map_err(|_| SwarmError::WebSeedError(format!("{} cannot be a base", self.base)))?
                .pop_if_empty()
                .extend(&file.path);
            url
        } else {
            self.base.clone()
        };

        Ok(RangeRequest {
            lease,
            file_index,
            url,
            file_range: ByteRange::new(lease.low - file.offset, lease.high - file.offset),
        })
    }

    /// Downloads everything the coordinator still lets it lease. Returns
    /// the number of bytes written.
    pub async fn download(&self) -> Result<u64> {
        let everything = Bitfield::full(self.coordinator.layout().num_pieces());
        let mut total = 0;

        while let Some(lease) = self.coordinator.lease_available(&everything) {
            total += self.fetch(lease).await?;
        }

        info!("Web seed {} done after {} bytes", self.base, total);
        Ok(total)
    }

    /// Fills one held lease. On failure whatever is still leased goes back
    /// to the coordinator.
    pub async fn fetch(&self, lease: ByteRange) -> Result<u64> {
        let request = match self.plan_request(lease) {
            Ok(request) => request,
            Err(e) => {
                self.coordinator.unlease(lease);
                return Err(e);
            }
        };

        let result = self.transfer(&request).await;
        if let Err(e) = &result {
            warn!("Request for {} from {} failed: {}", request.lease, request.url, e);
            self.coordinator.unlease(request.lease);
        }
        result
    }

    async fn transfer(&self, request: &RangeRequest) -> Result<u64> {
        let control = Arc::new(ReadInterest::new());
        let mut job = self.coordinator.create_write_job(request.lease, control)?;

        debug!("GET {} {}", request.url, request.range_header());
        let mut response = self
            .client
            .get(request.url.clone())
            .header(RANGE, request.range_header())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SwarmError::WebSeedError(format!(
                "{} answered {}",
                request.url, status
            )));
        }
        // A full response only lines up with the lease if it starts at 0.
        if status != StatusCode::PARTIAL_CONTENT && request.file_range.low != 0 {
            return Err(SwarmError::WebSeedError(format!(
                "{} ignored the range request",
                request.url
            )));
        }

        // Flushes and piece checks hit the disk, so they leave the runtime.
        while let Some(chunk) = response.chunk().await? {
            let (returned, written) = tokio::task::spawn_blocking(move || {
                let mut chunk = chunk;
                let written = job.write(&mut chunk);
                (job, written)
            })
            .await
            .map_err(|e| SwarmError::BackendFailure(format!("write task failed: {}", e)))?;
            job = returned;
            written?;

            if job.is_done() {
                break;
            }
        }

        job.finish()?;
        Ok(request.lease.len())
    }
}
