//! The core service.
//!
//! One `UkaiCore` runs per node. It keeps the open-image bookkeeping
//! (metadata + data engine per image, open counts, writer exclusion,
//! handle ids), dispatches the filesystem verbs coming from the VFS
//! frontend, serves the proxy verbs for peer data engines, and the
//! control verbs for the administrative client. All three verb families
//! share one RPC server.

use crate::directory::MetadataDirectory;
use crate::node_error::{NodeErrorEntry, NodeErrorStateSet};
use crate::rpc::{
    FileStat, HexPayload, RpcClient, StatFs, UkaiApiClient, UkaiApiServer, flags_want_write,
};
use crate::stats::{BlockIoStats, StatisticsSet};
use crate::storage::metadata::{ImageMetadata, MetadataContent, SyncStatus};
use crate::storage::{UkaiData, block_store};
use crate::types::{UkaiConfig, UkaiError};
use crate::utils::NodeAddressCache;
use async_trait::async_trait;
use jsonrpsee::core::RpcResult;
use jsonrpsee::server::{ServerBuilder, ServerHandle};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

/// The shared collaborators threaded into every metadata and data
/// operation: configuration, the directory client, the failure cache,
/// the statistics counters, and the local-address cache. Lifetime is
/// bounded by the core service owning it.
pub struct CoreContext {
    pub config: UkaiConfig,
    pub directory: Arc<dyn MetadataDirectory>,
    pub node_errors: NodeErrorStateSet,
    pub stats: StatisticsSet,
    pub addrs: NodeAddressCache,
}

impl CoreContext {
    pub fn new(config: UkaiConfig, directory: Arc<dyn MetadataDirectory>) -> Self {
        let addrs = NodeAddressCache::new(&config);
        Self {
            config,
            directory,
            node_errors: NodeErrorStateSet::new(),
            stats: StatisticsSet::new(),
            addrs,
        }
    }
}

struct ImageEntry {
    metadata: Arc<ImageMetadata>,
    data: Arc<UkaiData>,
    open_count: u32,
}

#[derive(Default)]
struct CoreState {
    images: HashMap<String, ImageEntry>,
    /// Image name to the handle id holding it write-open. At most one
    /// write-open per image.
    writers: HashMap<String, u64>,
    next_fh: u64,
}

pub struct UkaiCore {
    ctx: Arc<CoreContext>,
    state: Mutex<CoreState>,
}

impl UkaiCore {
    pub fn new(config: UkaiConfig, directory: Arc<dyn MetadataDirectory>) -> Arc<Self> {
        Arc::new(Self {
            ctx: Arc::new(CoreContext::new(config, directory)),
            state: Mutex::new(CoreState::default()),
        })
    }

    pub fn context(&self) -> &Arc<CoreContext> {
        &self.ctx
    }

    fn image_name(path: &str) -> Result<&str, UkaiError> {
        let name = path
            .strip_prefix('/')
            .ok_or_else(|| UkaiError::Invalid(format!("path {} is not absolute", path)))?;
        if name.is_empty() || name.contains('/') {
            return Err(UkaiError::NotFound(path.to_string()));
        }
        Ok(name)
    }

    fn live_image(&self, name: &str) -> Option<(Arc<ImageMetadata>, Arc<UkaiData>)> {
        let state = self.state.lock();
        state
            .images
            .get(name)
            .map(|entry| (entry.metadata.clone(), entry.data.clone()))
    }

    /// Load canonical metadata into a detached metadata + data pair, used
    /// by control verbs when the image is not open here.
    async fn load_offline(&self, name: &str) -> Result<(Arc<ImageMetadata>, Arc<UkaiData>), UkaiError> {
        let value = self
            .ctx
            .directory
            .get_metadata(name)
            .await?
            .ok_or_else(|| UkaiError::NotFound(name.to_string()))?;
        let metadata = Arc::new(ImageMetadata::new(MetadataContent::from_value(value)?)?);
        let data = Arc::new(UkaiData::new(metadata.clone(), self.ctx.clone()));
        Ok((metadata, data))
    }

    async fn unlock_quietly(&self, name: &str) {
        if let Err(e) = self.ctx.directory.unlock_image(name).await {
            log::warn!("releasing directory lock of {} failed: {}", name, e);
        }
    }

    /// Materialise the image in the runtime maps if it is not there yet.
    async fn ensure_image(&self, name: &str) -> Result<(), UkaiError> {
        if self.state.lock().images.contains_key(name) {
            return Ok(());
        }
        let (metadata, data) = self.load_offline(name).await?;
        let mut state = self.state.lock();
        state.images.entry(name.to_string()).or_insert(ImageEntry {
            metadata,
            data,
            open_count: 0,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Filesystem verbs.

    pub async fn getattr(&self, path: &str) -> Result<FileStat, UkaiError> {
        if path == "/" {
            return Ok(FileStat::directory());
        }
        let name = Self::image_name(path)?;
        let value = self
            .ctx
            .directory
            .get_metadata(name)
            .await?
            .ok_or_else(|| UkaiError::NotFound(name.to_string()))?;
        let content = MetadataContent::from_value(value)?;
        Ok(FileStat::regular(content.used_size))
    }

    pub async fn open(&self, path: &str, flags: u32) -> Result<u64, UkaiError> {
        let name = Self::image_name(path)?.to_string();
        let wants_write = flags_want_write(flags);
        self.ensure_image(&name).await?;

        let (fh, first_open) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if wants_write && state.writers.contains_key(&name) {
                return Err(UkaiError::Busy(name));
            }
            let entry = state
                .images
                .get_mut(&name)
                .ok_or_else(|| UkaiError::NotFound(name.clone()))?;
            entry.open_count += 1;
            state.next_fh += 1;
            let fh = state.next_fh;
            if wants_write {
                state.writers.insert(name.clone(), fh);
            }
            (fh, entry.open_count == 1)
        };

        if first_open {
            if let Err(e) = self
                .ctx
                .directory
                .join_reader(&name, self.ctx.config.node_id())
                .await
            {
                log::warn!("joining reader set of {} failed: {}", name, e);
            }
        }
        log::debug!("opened {} as fh {} (write: {})", name, fh, wants_write);
        Ok(fh)
    }

    pub async fn release(&self, path: &str, fh: u64) -> Result<(), UkaiError> {
        let name = Self::image_name(path)?.to_string();
        let evicted = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            // Only the owning handle clears a writer mark.
            if state.writers.get(&name) == Some(&fh) {
                state.writers.remove(&name);
            }
            let last_release = match state.images.get_mut(&name) {
                None => false,
                Some(entry) => {
                    entry.open_count = entry.open_count.saturating_sub(1);
                    entry.open_count == 0
                }
            };
            if last_release {
                state.images.remove(&name);
                state.writers.remove(&name);
            }
            last_release
        };

        if evicted {
            self.ctx.stats.remove(&name);
            if let Err(e) = self
                .ctx
                .directory
                .leave_reader(&name, self.ctx.config.node_id())
                .await
            {
                log::warn!("leaving reader set of {} failed: {}", name, e);
            }
            log::debug!("evicted {} after last release", name);
        }
        Ok(())
    }

    pub async fn read(&self, path: &str, size: u64, offset: u64) -> Result<Vec<u8>, UkaiError> {
        let name = Self::image_name(path)?;
        let (_, data) = self
            .live_image(name)
            .ok_or_else(|| UkaiError::NotFound(name.to_string()))?;
        data.read(size, offset).await
    }

    pub async fn write(&self, path: &str, data: &[u8], offset: u64) -> Result<u64, UkaiError> {
        let name = Self::image_name(path)?;
        let (_, engine) = self
            .live_image(name)
            .ok_or_else(|| UkaiError::NotFound(name.to_string()))?;
        engine.write(data, offset).await
    }

    pub async fn truncate(&self, path: &str, length: u64) -> Result<(), UkaiError> {
        let name = Self::image_name(path)?;
        match self.live_image(name) {
            Some((metadata, _)) => metadata.set_used_size(&self.ctx, length).await,
            None => {
                self.ctx.directory.lock_image(name).await?;
                let result = async {
                    let (metadata, _) = self.load_offline(name).await?;
                    metadata.set_used_size(&self.ctx, length).await
                }
                .await;
                self.unlock_quietly(name).await;
                result
            }
        }
    }

    pub fn readdir(&self, _path: &str) -> Vec<String> {
        let mut names = vec![".".to_string(), "..".to_string()];
        let mut images: Vec<String> = self.state.lock().images.keys().cloned().collect();
        images.sort();
        names.extend(images);
        names
    }

    pub fn statfs(&self) -> StatFs {
        StatFs::default()
    }

    // ------------------------------------------------------------------
    // Proxy verbs, serving peer data engines against the local store.

    pub fn proxy_read(
        &self,
        name: &str,
        block_size: u64,
        block_index: u64,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, UkaiError> {
        block_store::read(&self.ctx.config, name, block_size, block_index, offset, size)
    }

    pub fn proxy_write(
        &self,
        name: &str,
        block_size: u64,
        block_index: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<u64, UkaiError> {
        block_store::write(&self.ctx.config, name, block_size, block_index, offset, data)
    }

    pub fn proxy_allocate_dataspace(
        &self,
        name: &str,
        block_size: u64,
        block_index: u64,
    ) -> Result<(), UkaiError> {
        block_store::allocate(&self.ctx.config, name, block_size, block_index)
    }

    pub fn proxy_deallocate_dataspace(&self, name: &str, block_index: u64) -> Result<(), UkaiError> {
        block_store::deallocate(&self.ctx.config, name, block_index)
    }

    pub fn proxy_destroy_image(&self, name: &str) -> Result<(), UkaiError> {
        block_store::destroy_image(&self.ctx.config, name)
    }

    /// Accept a metadata push from a peer hypervisor: persist it to the
    /// directory and update or create the runtime pair. Existing runtime
    /// state is updated in place, never evicted.
    pub async fn proxy_update_metadata(&self, name: &str, value: Value) -> Result<(), UkaiError> {
        let content = MetadataContent::from_value(value.clone())?;
        if content.name != name {
            return Err(UkaiError::Invalid(format!(
                "metadata push for {} carries record of {}",
                name, content.name
            )));
        }
        self.ctx.directory.put_metadata(name, value).await?;

        let existing = self
            .state
            .lock()
            .images
            .get(name)
            .map(|entry| entry.metadata.clone());
        match existing {
            Some(metadata) => metadata.replace_content(content)?,
            None => {
                let metadata = Arc::new(ImageMetadata::new(content)?);
                let data = Arc::new(UkaiData::new(metadata.clone(), self.ctx.clone()));
                self.state
                    .lock()
                    .images
                    .entry(name.to_string())
                    .or_insert(ImageEntry {
                        metadata,
                        data,
                        open_count: 0,
                    });
            }
        }
        log::debug!("accepted metadata push of {}", name);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Control verbs.

    pub async fn ctl_create_image(
        &self,
        name: &str,
        size: u64,
        block_size: Option<u64>,
        location: Option<String>,
    ) -> Result<(), UkaiError> {
        if name.is_empty() || name.contains('/') {
            return Err(UkaiError::Invalid(format!("bad image name {:?}", name)));
        }
        let block_size = block_size.unwrap_or(self.ctx.config.create_default.block_size);
        if block_size == 0 {
            return Err(UkaiError::Invalid("block_size must be positive".to_string()));
        }
        if size <= block_size {
            return Err(UkaiError::Invalid(format!(
                "size {} must exceed block_size {}",
                size, block_size
            )));
        }
        if size % block_size != 0 {
            return Err(UkaiError::Invalid(format!(
                "size {} is not a multiple of block_size {}",
                size, block_size
            )));
        }
        let location = location.unwrap_or_else(|| self.ctx.config.core_server.clone());

        self.ctx.directory.lock_image(name).await?;
        let result = async {
            if self.ctx.directory.get_metadata(name).await?.is_some() {
                return Err(UkaiError::Exists(name.to_string()));
            }
            let content = MetadataContent::new_image(name, size, block_size, &location);
            self.ctx.directory.put_metadata(name, content.to_value()?).await
        }
        .await;
        self.unlock_quietly(name).await;
        result?;
        log::info!(
            "created image {}: {} bytes in {} blocks on {}",
            name,
            size,
            size / block_size,
            location
        );
        Ok(())
    }

    pub async fn ctl_destroy_image(&self, name: &str) -> Result<(), UkaiError> {
        let value = self
            .ctx
            .directory
            .get_metadata(name)
            .await?
            .ok_or_else(|| UkaiError::NotFound(name.to_string()))?;
        let content = MetadataContent::from_value(value)?;

        let mut locations = BTreeSet::new();
        for block in &content.blocks {
            for location in block.keys() {
                locations.insert(location.clone());
            }
        }
        for location in locations {
            let result = if self.ctx.addrs.is_local(&location) {
                block_store::destroy_image(&self.ctx.config, name)
            } else {
                match RpcClient::for_peer(&self.ctx.config, &location).connect() {
                    Ok(client) => client
                        .proxy_destroy_image(name.to_string())
                        .await
                        .map_err(|e| UkaiError::from_client_error(&location, e)),
                    Err(e) => Err(e),
                }
            };
            if let Err(e) = result {
                log::warn!("destroying data of {} on {} failed: {}", name, location, e);
            }
        }

        self.ctx.directory.delete_metadata(name).await?;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.images.remove(name);
            state.writers.remove(name);
        }
        self.ctx.stats.remove(name);
        log::info!("destroyed image {}", name);
        Ok(())
    }

    pub async fn ctl_get_metadata(&self, name: &str) -> Result<Value, UkaiError> {
        self.ctx
            .directory
            .get_metadata(name)
            .await?
            .ok_or_else(|| UkaiError::NotFound(name.to_string()))
    }

    pub async fn ctl_add_location(
        &self,
        name: &str,
        location: &str,
        start: Option<u64>,
        end: Option<u64>,
        status: SyncStatus,
    ) -> Result<(), UkaiError> {
        let start = start.unwrap_or(0);
        match self.live_image(name) {
            Some((metadata, _)) => {
                metadata
                    .add_location(&self.ctx, location, start, end, status)
                    .await
            }
            None => {
                self.ctx.directory.lock_image(name).await?;
                let result = async {
                    let (metadata, _) = self.load_offline(name).await?;
                    metadata
                        .add_location(&self.ctx, location, start, end, status)
                        .await
                }
                .await;
                self.unlock_quietly(name).await;
                result
            }
        }
    }

    pub async fn ctl_remove_location(
        &self,
        name: &str,
        location: &str,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<(), UkaiError> {
        let start = start.unwrap_or(0);
        let (removed, skipped) = match self.live_image(name) {
            Some((metadata, _)) => {
                metadata
                    .remove_location(&self.ctx, location, start, end)
                    .await?
            }
            None => {
                self.ctx.directory.lock_image(name).await?;
                let result = async {
                    let (metadata, _) = self.load_offline(name).await?;
                    metadata
                        .remove_location(&self.ctx, location, start, end)
                        .await
                }
                .await;
                self.unlock_quietly(name).await;
                result?
            }
        };
        if skipped > 0 {
            log::warn!(
                "remove_location of {} from {} skipped {} blocks holding the last in-sync replica",
                location,
                name,
                skipped
            );
        }
        self.deallocate_blocks(name, location, &removed).await;
        Ok(())
    }

    /// Drop the block files a replica no longer holds. Failures are
    /// logged; the metadata is already flushed and a leftover file is
    /// only wasted space.
    async fn deallocate_blocks(&self, name: &str, location: &str, blocks: &[u64]) {
        if blocks.is_empty() {
            return;
        }
        if self.ctx.addrs.is_local(location) {
            for block_index in blocks {
                if let Err(e) = block_store::deallocate(&self.ctx.config, name, *block_index) {
                    log::warn!(
                        "deallocating block {} of {} failed: {}",
                        block_index,
                        name,
                        e
                    );
                }
            }
            return;
        }
        let client = match RpcClient::for_peer(&self.ctx.config, location).connect() {
            Ok(client) => client,
            Err(e) => {
                log::warn!("cannot reach {} to deallocate blocks of {}: {}", location, name, e);
                return;
            }
        };
        for block_index in blocks {
            if let Err(e) = client
                .proxy_deallocate_dataspace(name.to_string(), *block_index)
                .await
            {
                log::warn!(
                    "deallocating block {} of {} on {} failed: {}",
                    block_index,
                    name,
                    location,
                    UkaiError::from_client_error(location, e)
                );
            }
        }
    }

    pub async fn ctl_add_hypervisor(&self, name: &str, hypervisor: &str) -> Result<(), UkaiError> {
        match self.live_image(name) {
            Some((metadata, _)) => metadata.add_hypervisor(&self.ctx, hypervisor).await,
            None => {
                self.ctx.directory.lock_image(name).await?;
                let result = async {
                    let (metadata, _) = self.load_offline(name).await?;
                    metadata.add_hypervisor(&self.ctx, hypervisor).await
                }
                .await;
                self.unlock_quietly(name).await;
                result
            }
        }
    }

    pub async fn ctl_remove_hypervisor(
        &self,
        name: &str,
        hypervisor: &str,
    ) -> Result<(), UkaiError> {
        match self.live_image(name) {
            Some((metadata, _)) => metadata.remove_hypervisor(&self.ctx, hypervisor).await,
            None => {
                self.ctx.directory.lock_image(name).await?;
                let result = async {
                    let (metadata, _) = self.load_offline(name).await?;
                    metadata.remove_hypervisor(&self.ctx, hypervisor).await
                }
                .await;
                self.unlock_quietly(name).await;
                result
            }
        }
    }

    pub async fn ctl_synchronize(
        &self,
        name: &str,
        start: Option<u64>,
        end: Option<u64>,
        verbose: bool,
    ) -> Result<(), UkaiError> {
        match self.live_image(name) {
            Some((metadata, data)) => {
                self.synchronize_range(&metadata, &data, start, end, verbose)
                    .await
            }
            None => {
                self.ctx.directory.lock_image(name).await?;
                let result = async {
                    let (metadata, data) = self.load_offline(name).await?;
                    self.synchronize_range(&metadata, &data, start, end, verbose)
                        .await
                }
                .await;
                self.unlock_quietly(name).await;
                result
            }
        }
    }

    async fn synchronize_range(
        &self,
        metadata: &Arc<ImageMetadata>,
        data: &Arc<UkaiData>,
        start: Option<u64>,
        end: Option<u64>,
        verbose: bool,
    ) -> Result<(), UkaiError> {
        let last = metadata.block_count() - 1;
        let start = start.unwrap_or(0);
        let end = end.unwrap_or(last);
        if start > end || end > last {
            return Err(UkaiError::Invalid(format!(
                "image {}: block range {}..={} outside 0..={}",
                metadata.name(),
                start,
                end,
                last
            )));
        }
        for block_index in start..=end {
            if verbose {
                log::info!(
                    "syncing block {} ({}..{}) of {}",
                    block_index,
                    start,
                    end,
                    metadata.name()
                );
            }
            if data.synchronize_block(block_index).await? {
                metadata.flush(&self.ctx).await?;
            }
        }
        Ok(())
    }

    pub fn ctl_get_node_error_state_set(&self) -> Vec<NodeErrorEntry> {
        self.ctx.node_errors.snapshot()
    }

    pub async fn ctl_get_image_names(&self) -> Result<Vec<String>, UkaiError> {
        self.ctx.directory.list_images().await
    }

    pub fn ctl_get_statistics(&self, name: &str) -> Vec<BlockIoStats> {
        self.ctx.stats.snapshot(name)
    }
}

/// RPC front of the core, doing the payload armouring and compression at
/// the wire boundary.
struct CoreRpc {
    core: Arc<UkaiCore>,
}

#[async_trait]
impl UkaiApiServer for CoreRpc {
    async fn getattr(&self, path: String) -> RpcResult<FileStat> {
        Ok(self.core.getattr(&path).await?)
    }

    async fn open(&self, path: String, flags: u32) -> RpcResult<u64> {
        Ok(self.core.open(&path, flags).await?)
    }

    async fn release(&self, path: String, fh: u64) -> RpcResult<()> {
        Ok(self.core.release(&path, fh).await?)
    }

    async fn read(&self, path: String, size: u64, offset: u64) -> RpcResult<HexPayload> {
        let data = self.core.read(&path, size, offset).await?;
        Ok(HexPayload::from_bytes(&data))
    }

    async fn write(&self, path: String, data: HexPayload, offset: u64) -> RpcResult<u64> {
        let bytes = data.to_bytes()?;
        Ok(self.core.write(&path, &bytes, offset).await?)
    }

    async fn truncate(&self, path: String, length: u64) -> RpcResult<()> {
        Ok(self.core.truncate(&path, length).await?)
    }

    async fn readdir(&self, path: String) -> RpcResult<Vec<String>> {
        Ok(self.core.readdir(&path))
    }

    async fn statfs(&self, _path: String) -> RpcResult<StatFs> {
        Ok(self.core.statfs())
    }

    async fn proxy_read(
        &self,
        image_name: String,
        block_size: u64,
        block_index: u64,
        offset: u64,
        size: u64,
    ) -> RpcResult<HexPayload> {
        let data = self
            .core
            .proxy_read(&image_name, block_size, block_index, offset, size)?;
        Ok(HexPayload::from_compressed(&data)?)
    }

    async fn proxy_write(
        &self,
        image_name: String,
        block_size: u64,
        block_index: u64,
        offset: u64,
        data: HexPayload,
    ) -> RpcResult<u64> {
        let bytes = data.decompressed()?;
        Ok(self
            .core
            .proxy_write(&image_name, block_size, block_index, offset, &bytes)?)
    }

    async fn proxy_allocate_dataspace(
        &self,
        image_name: String,
        block_size: u64,
        block_index: u64,
    ) -> RpcResult<()> {
        Ok(self
            .core
            .proxy_allocate_dataspace(&image_name, block_size, block_index)?)
    }

    async fn proxy_deallocate_dataspace(
        &self,
        image_name: String,
        block_index: u64,
    ) -> RpcResult<()> {
        Ok(self.core.proxy_deallocate_dataspace(&image_name, block_index)?)
    }

    async fn proxy_destroy_image(&self, image_name: String) -> RpcResult<()> {
        Ok(self.core.proxy_destroy_image(&image_name)?)
    }

    async fn proxy_update_metadata(
        &self,
        image_name: String,
        metadata: HexPayload,
    ) -> RpcResult<()> {
        let raw = metadata.decompressed()?;
        let value: Value = serde_json::from_slice(&raw)
            .map_err(|e| UkaiError::Metadata(format!("malformed metadata push: {}", e)))?;
        Ok(self.core.proxy_update_metadata(&image_name, value).await?)
    }

    async fn ctl_create_image(
        &self,
        image_name: String,
        size: u64,
        block_size: Option<u64>,
        location: Option<String>,
    ) -> RpcResult<()> {
        Ok(self
            .core
            .ctl_create_image(&image_name, size, block_size, location)
            .await?)
    }

    async fn ctl_destroy_image(&self, image_name: String) -> RpcResult<()> {
        Ok(self.core.ctl_destroy_image(&image_name).await?)
    }

    async fn ctl_get_metadata(&self, image_name: String) -> RpcResult<Value> {
        Ok(self.core.ctl_get_metadata(&image_name).await?)
    }

    async fn ctl_add_location(
        &self,
        image_name: String,
        location: String,
        start_index: Option<u64>,
        end_index: Option<u64>,
        sync_status: Option<u8>,
    ) -> RpcResult<()> {
        let status = match sync_status {
            None => SyncStatus::OutOfSync,
            Some(value) => SyncStatus::try_from(value).map_err(UkaiError::Invalid)?,
        };
        Ok(self
            .core
            .ctl_add_location(&image_name, &location, start_index, end_index, status)
            .await?)
    }

    async fn ctl_remove_location(
        &self,
        image_name: String,
        location: String,
        start_index: Option<u64>,
        end_index: Option<u64>,
    ) -> RpcResult<()> {
        Ok(self
            .core
            .ctl_remove_location(&image_name, &location, start_index, end_index)
            .await?)
    }

    async fn ctl_add_hypervisor(&self, image_name: String, hypervisor: String) -> RpcResult<()> {
        Ok(self.core.ctl_add_hypervisor(&image_name, &hypervisor).await?)
    }

    async fn ctl_remove_hypervisor(
        &self,
        image_name: String,
        hypervisor: String,
    ) -> RpcResult<()> {
        Ok(self
            .core
            .ctl_remove_hypervisor(&image_name, &hypervisor)
            .await?)
    }

    async fn ctl_synchronize(
        &self,
        image_name: String,
        start_index: Option<u64>,
        end_index: Option<u64>,
        verbose: bool,
    ) -> RpcResult<()> {
        Ok(self
            .core
            .ctl_synchronize(&image_name, start_index, end_index, verbose)
            .await?)
    }

    async fn ctl_get_node_error_state_set(&self) -> RpcResult<Vec<NodeErrorEntry>> {
        Ok(self.core.ctl_get_node_error_state_set())
    }

    async fn ctl_get_image_names(&self) -> RpcResult<Vec<String>> {
        Ok(self.core.ctl_get_image_names().await?)
    }

    async fn ctl_get_statistics(&self, image_name: String) -> RpcResult<Vec<BlockIoStats>> {
        Ok(self.core.ctl_get_statistics(&image_name))
    }
}

/// A running core RPC server.
pub struct CoreServer {
    handle: ServerHandle,
    addr: SocketAddr,
}

impl CoreServer {
    /// Bind `core_server:core_port` and serve the full verb set.
    pub async fn start(core: Arc<UkaiCore>) -> Result<Self, UkaiError> {
        let config = &core.ctx.config;
        let bind = format!("{}:{}", config.core_server, config.core_port);
        let server = ServerBuilder::default().build(bind.as_str()).await?;
        let addr = server.local_addr()?;
        let handle = server.start(UkaiApiServer::into_rpc(CoreRpc { core: core.clone() }));
        log::info!("core service listening on {}", addr);
        Ok(Self { handle, addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and wait for in-flight calls to drain.
    pub async fn stop(self) {
        let _ = self.handle.stop();
        self.handle.stopped().await;
    }
}
