//! Per-worker connection state: endpoint, lifecycle position, streaming
//! frame reassembly, batched writes, and the typed send helpers the
//! lifecycle drives.

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;

use crate::config::RenderSettings;
use crate::error::ProtocolError;
use crate::image::Image;
use crate::library::SlotTable;
use crate::protocol::{wire, FrameReader, Message, MessageKind, WriteBuffer};
use crate::scene::{Camera, Material, Mesh, Shader, Texture};
use crate::stats::StatsHistory;
use crate::wbvh::WorkerBvh;

pub const DEFAULT_WORKER_PORT: u16 = 19400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    None,
    Connected,
    Initializing,
    Configuring,
    SyncingAssets,
    SyncingCamera,
    SyncingEmissive,
    BuildingBvh,
    SyncingWbvh,
    Ready,
    Rendering,
    Paused,
    SyncingImages,
    Done,
}

pub struct WorkerNode {
    pub id: u32,
    pub ip: String,
    pub port: u16,
    pub state: WorkerState,
    pub stats: StatsHistory,
    reader: FrameReader,
    wbuf: WriteBuffer,
    writer: Option<OwnedWriteHalf>,
}

impl WorkerNode {
    /// `endpoint` is `host` or `host:port`; the port defaults to 19400.
    pub fn new(id: u32, endpoint: &str) -> Self {
        let (ip, port) = match endpoint.split_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse().unwrap_or(DEFAULT_WORKER_PORT),
            ),
            None => (endpoint.to_string(), DEFAULT_WORKER_PORT),
        };
        Self {
            id,
            ip,
            port,
            state: WorkerState::None,
            stats: StatsHistory::new(),
            reader: FrameReader::new(),
            wbuf: WriteBuffer::new(),
            writer: None,
        }
    }

    pub fn attach(&mut self, writer: OwnedWriteHalf) {
        self.writer = Some(writer);
        self.state = WorkerState::Connected;
    }

    /// Buffered bytes not yet on the socket.
    pub fn pending_bytes(&self) -> usize {
        self.wbuf.len()
    }

    pub fn flushed_this_tick(&self) -> bool {
        self.wbuf.flushed
    }

    pub fn clear_flush_tick(&mut self) {
        self.wbuf.flushed = false;
    }

    /// Enqueue a frame for batched transmission. Only spills that overflow
    /// the send buffer touch the socket here; the rest waits for the flush
    /// monitor or an explicit [`flush`](Self::flush).
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        let mut spill: Vec<Vec<u8>> = Vec::new();
        self.wbuf.append(msg, &mut |chunk| spill.push(chunk.to_vec()));
        if !spill.is_empty() {
            let writer = self
                .writer
                .as_mut()
                .with_context(|| format!("[{}] not connected", self.ip))?;
            for chunk in &spill {
                writer
                    .write_all(chunk)
                    .await
                    .with_context(|| format!("[{}] write failed", self.ip))?;
            }
        }
        Ok(())
    }

    /// Immediately dispatch the send buffer to the socket.
    pub async fn flush(&mut self) -> Result<()> {
        if self.wbuf.is_empty() {
            return Ok(());
        }
        let writer = self
            .writer
            .as_mut()
            .with_context(|| format!("[{}] not connected", self.ip))?;
        writer
            .write_all(self.wbuf.pending())
            .await
            .with_context(|| format!("[{}] write failed", self.ip))?;
        self.wbuf.clear();
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.flush().await?;
        if let Some(mut writer) = self.writer.take() {
            writer
                .shutdown()
                .await
                .with_context(|| format!("[{}] shutdown failed", self.ip))?;
        }
        Ok(())
    }

    /// Feed raw bytes off the socket; completed frames come back in order.
    pub fn receive(&mut self, chunk: &[u8]) -> Result<Vec<Message>, ProtocolError> {
        self.reader.feed(chunk)
    }

    pub async fn send_empty(&mut self, kind: MessageKind) -> Result<()> {
        self.send(&Message::new(kind)).await
    }

    pub async fn send_u32(&mut self, kind: MessageKind, value: u32) -> Result<()> {
        self.send(&Message::with_body(kind, wire::encode_u32(value))).await
    }

    /// The CONFIGURING batch: settings, then every shader, texture, and
    /// material. The settings carry the counts, so the worker knows when
    /// the batch ends and answers with a single OK.
    pub async fn send_config(
        &mut self,
        settings: &RenderSettings,
        shaders: &SlotTable<Shader>,
        textures: &SlotTable<Texture>,
        materials: &SlotTable<Material>,
    ) -> Result<()> {
        let body = wire::encode_asset("render settings", settings)?;
        self.send(&Message::with_body(MessageKind::SyncConfig, body)).await?;

        for (_, shader) in shaders.iter() {
            let body = wire::encode_asset("shader", shader)?;
            self.send(&Message::with_body(MessageKind::SyncShader, body)).await?;
        }
        for (_, texture) in textures.iter() {
            let body = wire::encode_asset("texture", texture)?;
            self.send(&Message::with_body(MessageKind::SyncTexture, body)).await?;
        }
        for (_, material) in materials.iter() {
            let body = wire::encode_asset("material", material)?;
            self.send(&Message::with_body(MessageKind::SyncMaterial, body)).await?;
        }
        Ok(())
    }

    pub async fn send_camera(&mut self, camera: &Camera) -> Result<()> {
        let body = wire::encode_asset("camera", camera)?;
        self.send(&Message::with_body(MessageKind::SyncCamera, body)).await
    }

    /// Worker ids that host at least one emissive mesh.
    pub async fn send_light_list(&mut self, worker_ids: &[u32]) -> Result<()> {
        let body = wire::encode_worker_ids(worker_ids);
        self.send(&Message::with_body(MessageKind::SyncEmissive, body)).await
    }

    pub async fn send_mesh(&mut self, mesh: &Mesh) -> Result<()> {
        let body = wire::encode_asset("mesh", mesh)?;
        self.send(&Message::with_body(MessageKind::SyncMesh, body)).await
    }

    pub async fn send_wbvh(&mut self, wbvh: &WorkerBvh) -> Result<()> {
        let body = wire::encode_asset("worker BVH", wbvh)?;
        self.send(&Message::with_body(MessageKind::SyncWbvh, body)).await
    }

    /// Parse a statistics frame into the rolling window.
    pub fn receive_render_stats(&mut self, body: &Bytes) -> Result<(), ProtocolError> {
        let stats = wire::decode_render_stats(body)?;
        self.stats.push(stats);
        Ok(())
    }

    /// Parse an image frame into a freshly-owned tile.
    pub fn receive_image(&self, body: &Bytes) -> Result<Image, ProtocolError> {
        wire::decode_asset("image tile", body)
    }

    pub fn progress(&self) -> f32 {
        self.stats.progress()
    }

    pub fn is_interesting(&self, intervals: u32) -> bool {
        self.stats.is_interesting(intervals)
    }

    pub fn rays_produced(&self, intervals: u32) -> u64 {
        self.stats.rays_produced(intervals)
    }

    pub fn rays_killed(&self, intervals: u32) -> u64 {
        self.stats.rays_killed(intervals)
    }

    pub fn rays_queued(&self, intervals: u32) -> u64 {
        self.stats.rays_queued(intervals)
    }
}
