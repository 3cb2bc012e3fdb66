//! The coordinator engine: one reactor thread owning every connection,
//! the OK-driven lifecycle with its cross-worker fences, the asset
//! streaming pump, the monitors, and the final image merge.

pub mod node;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use crossbeam::channel::{Receiver, TryRecvError};
use futures::future::try_join_all;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::{interval_at, Instant as TickInstant, Interval, MissedTickBehavior};

use crate::config::{EngineConfig, RenderSettings, FLUSH_TIMEOUT_MS};
use crate::image::Image;
use crate::library::Library;
use crate::protocol::{wire, Message, MessageKind};
use crate::scene::{Mesh, ResolvedMesh, SceneFile, SceneStreamer};
use crate::spatial::BoundingBox;
use crate::utils::{load_cfg, try_pin_core, CancelToken};
use crate::wbvh::WorkerBvh;

use node::{WorkerNode, WorkerState};

const READ_CHUNK: usize = 64 * 1024;
const SYNC_POLL_MS: u64 = 1;

/// What a read pump hands the reactor.
#[derive(Debug)]
enum NetEvent {
    Data { id: u32, bytes: Vec<u8> },
    Eof { id: u32 },
    Failed { id: u32, error: std::io::Error },
}

/// Flow-control verdict for one worker against the slowest peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceAction {
    Pause,
    Resume,
    Hold,
}

/// A worker strictly more than `margin` ahead of the slowest gets paused;
/// a paused worker resumes once it is at or below the slowest. The
/// asymmetry (`>` vs `<=`) keeps the boundary from thrashing.
pub fn pace_action(progress: f32, slowest: f32, margin: f32, paused: bool) -> PaceAction {
    if progress > slowest + margin {
        if paused {
            PaceAction::Hold
        } else {
            PaceAction::Pause
        }
    } else if progress <= slowest && paused {
        PaceAction::Resume
    } else {
        PaceAction::Hold
    }
}

/// Per-worker image slab: `(offset, chunk)` columns out of `width`. The
/// last worker absorbs the division remainder.
pub fn slab_partition(width: u32, workers: u32, id: u32) -> (u16, u16) {
    let base = width / workers;
    let offset = (id - 1) * base;
    let chunk = if id == workers {
        width - (workers - 1) * base
    } else {
        base
    };
    (offset as u16, chunk as u16)
}

pub struct Engine {
    cfg: EngineConfig,
    lib: Library,
    max_intervals: u32,
    linear_scan: bool,

    /// Meshes waiting for the producer thread, resolved at init.
    pending_meshes: Option<Vec<ResolvedMesh>>,
    mesh_rx: Option<Receiver<Mesh>>,
    streamer: Option<SceneStreamer>,
    /// Mesh currently in flight to its worker; 0 when none.
    current_mesh: u32,

    /// Worker ids that received at least one emissive mesh.
    emissive_workers: BTreeSet<u32>,
    worker_bounds: Vec<(u32, BoundingBox)>,

    // Cross-worker fences.
    num_syncing: usize,
    num_built: usize,
    num_ready: usize,
    num_complete: usize,

    // Phase flags driving the reactor's timers.
    streaming: bool,
    rendering: bool,
    complete: bool,

    sync_start: Option<Instant>,
    sync_stop: Option<Instant>,
    build_start: Option<Instant>,
    build_stop: Option<Instant>,
    render_start: Option<Instant>,
    render_stop: Option<Instant>,

    cancel: CancelToken,
}

impl Engine {
    /// Load and validate the config and scene, register every asset and
    /// worker handle, and return an engine ready to run.
    pub fn init(
        config_path: &Path,
        scene_path: &Path,
        max_intervals: u32,
        linear_scan: bool,
    ) -> Result<Self> {
        tracing::info!("Loading config from {}.", config_path.display());
        let cfg: EngineConfig = load_cfg(config_path)?;
        cfg.validate()?;
        tracing::info!("Config loaded.");

        tracing::info!("Loading scene from {}.", scene_path.display());
        let scene = SceneFile::load(scene_path)?;

        let mut lib = Library::new();
        for mut shader in scene.shaders {
            let id = lib.shaders.next_id();
            shader.id = id;
            lib.shaders.store(id, Some(shader));
        }
        for mut texture in scene.textures {
            let id = lib.textures.next_id();
            texture.id = id;
            lib.textures.store(id, Some(texture));
        }
        for mut material in scene.materials {
            let id = lib.materials.next_id();
            material.id = id;
            lib.store_material(id, material);
        }
        lib.camera = Some(scene.camera);

        let mut pending = Vec::with_capacity(scene.meshes.len());
        for (index, decl) in scene.meshes.into_iter().enumerate() {
            let material = lib.material_id(&decl.material).with_context(|| {
                format!("mesh {} references unknown material {:?}", index, decl.material)
            })?;
            pending.push(ResolvedMesh {
                material,
                vertices: decl.vertices,
                faces: decl.faces,
            });
        }

        for (index, endpoint) in cfg.workers.iter().enumerate() {
            let id = index as u32 + 1;
            lib.workers.store(id, Some(WorkerNode::new(id, endpoint)));
        }

        Ok(Self {
            cfg,
            lib,
            max_intervals: max_intervals.max(1),
            linear_scan,
            pending_meshes: Some(pending),
            mesh_rx: None,
            streamer: None,
            current_mesh: 0,
            emissive_workers: BTreeSet::new(),
            worker_bounds: Vec::new(),
            num_syncing: 0,
            num_built: 0,
            num_ready: 0,
            num_complete: 0,
            streaming: false,
            rendering: false,
            complete: false,
            sync_start: None,
            sync_stop: None,
            build_start: None,
            build_stop: None,
            render_start: None,
            render_stop: None,
            cancel: CancelToken::new_root(),
        })
    }

    /// Drive the render to completion on the calling thread.
    pub fn run(mut self) -> Result<()> {
        let term = Arc::new(AtomicBool::new(false));
        for sig in TERM_SIGNALS {
            flag::register(*sig, Arc::clone(&term)).context("cannot install signal handler")?;
        }

        if let Some(core_id) = self.cfg.core_id {
            let pinned = try_pin_core(core_id)?;
            tracing::info!("[Engine] pinned to core {}", pinned);
        }

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .context("cannot build reactor runtime")?;

        let result = rt.block_on(self.drive(term));

        self.cancel.cancel();
        // Drop the rendezvous first so a producer parked in `send` gets a
        // disconnect instead of blocking the join below.
        self.mesh_rx = None;
        if let Some(streamer) = self.streamer.as_mut() {
            streamer.join();
        }
        result
    }

    fn n_workers(&self) -> usize {
        self.cfg.workers.len()
    }

    fn worker_ids(&self) -> Vec<u32> {
        self.lib.workers.ids()
    }

    fn node_mut(&mut self, id: u32) -> Result<&mut WorkerNode> {
        self.lib
            .workers
            .get_mut(id)
            .with_context(|| format!("no worker with id {id}"))
    }

    async fn drive(&mut self, term: Arc<AtomicBool>) -> Result<()> {
        let mut net_rx = self.connect_all().await?;

        let flush_period = Duration::from_millis(FLUSH_TIMEOUT_MS);
        let mut flush_tick = interval_at(TickInstant::now() + flush_period, flush_period);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut sync_tick: Option<Interval> = None;
        let mut interesting_tick: Option<Interval> = None;
        let mut runaway_tick: Option<Interval> = None;

        loop {
            if term.load(Ordering::Relaxed) {
                bail!("termination signal received, aborting render");
            }

            tokio::select! {
                event = net_rx.recv() => match event {
                    Some(event) => self.on_net_event(event).await?,
                    None => bail!("all worker connections are gone"),
                },
                _ = flush_tick.tick() => self.on_flush_tick().await?,
                _ = tick_opt(&mut sync_tick) => self.pump_mesh().await?,
                _ = tick_opt(&mut interesting_tick) => self.on_interesting_tick().await?,
                _ = tick_opt(&mut runaway_tick) => self.on_runaway_tick().await?,
            }

            if self.complete {
                break;
            }

            // Reconcile the phase timers with where the state machine is.
            if self.streaming {
                if sync_tick.is_none() {
                    let period = Duration::from_millis(SYNC_POLL_MS);
                    sync_tick = Some(interval_at(TickInstant::now() + period, period));
                }
            } else {
                sync_tick = None;
            }
            if self.rendering {
                if runaway_tick.is_none() {
                    let stats = Duration::from_millis(self.cfg.stats_timeout_ms);
                    let quiet = stats * self.max_intervals;
                    let mut t = interval_at(TickInstant::now() + stats, stats);
                    t.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    runaway_tick = Some(t);
                    let mut t = interval_at(TickInstant::now() + quiet, quiet);
                    t.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    interesting_tick = Some(t);
                }
            } else {
                runaway_tick = None;
                interesting_tick = None;
            }
        }

        self.cancel.cancel();
        Ok(())
    }

    async fn connect_all(&mut self) -> Result<UnboundedReceiver<NetEvent>> {
        tracing::info!("Connecting to {} workers...", self.n_workers());

        let mut pending = Vec::with_capacity(self.n_workers());
        for id in self.worker_ids() {
            let node = self.node_mut(id)?;
            let addr = format!("{}:{}", node.ip, node.port);
            pending.push(async move {
                let stream = TcpStream::connect(&addr)
                    .await
                    .map_err(|e| anyhow!("Failed connecting to {addr}: {e}"))?;
                Ok::<_, anyhow::Error>((id, stream))
            });
        }
        let streams = try_join_all(pending).await?;

        let (tx, rx) = unbounded_channel();
        for (id, stream) in streams {
            stream
                .set_nodelay(true)
                .context("cannot set TCP_NODELAY")?;
            let (rd, wr) = stream.into_split();
            let node = self.node_mut(id)?;
            node.attach(wr);
            tracing::info!("[{}] Connected on port {}.", node.ip, node.port);
            tokio::spawn(pump_reads(id, rd, tx.clone(), self.cancel.new_child()));
        }

        // Everyone is connected: hand out ids and start the lifecycle.
        self.sync_start = Some(Instant::now());
        for id in self.worker_ids() {
            let node = self.node_mut(id)?;
            node.state = WorkerState::Initializing;
            node.send_u32(MessageKind::Init, id).await?;
        }

        Ok(rx)
    }

    async fn on_net_event(&mut self, event: NetEvent) -> Result<()> {
        match event {
            NetEvent::Data { id, bytes } => {
                let node = self.node_mut(id)?;
                let ip = node.ip.clone();
                let messages = node
                    .receive(&bytes)
                    .map_err(|e| anyhow!("[{ip}] {e}"))?;
                for msg in messages {
                    self.on_message(id, msg).await?;
                }
                Ok(())
            }
            NetEvent::Eof { id } => {
                let node = self.node_mut(id)?;
                tracing::info!("[{}] Disconnected.", node.ip);
                Ok(())
            }
            NetEvent::Failed { id, error } => {
                let node = self.node_mut(id)?;
                bail!("[{}] read failed: {error}", node.ip);
            }
        }
    }

    async fn on_message(&mut self, id: u32, msg: Message) -> Result<()> {
        match msg.kind {
            MessageKind::Ok => self.on_ok(id, &msg).await,
            MessageKind::RenderStats => {
                let node = self.node_mut(id)?;
                if let Err(e) = node.receive_render_stats(&msg.body) {
                    tracing::error!("[{}] {e}", node.ip);
                }
                Ok(())
            }
            MessageKind::SyncImage => self.on_sync_image(id, &msg).await,
            other => {
                tracing::error!("Received unexpected message of kind {:?}.", other);
                Ok(())
            }
        }
    }

    async fn on_ok(&mut self, id: u32, msg: &Message) -> Result<()> {
        let state = self.node_mut(id)?.state;
        match state {
            WorkerState::Initializing => {
                let settings = self.render_settings();
                let node = self.lib.workers.get_mut(id).context("worker vanished")?;
                node.state = WorkerState::Configuring;
                tracing::info!("[{}] Configuring worker.", node.ip);
                node.send_config(
                    &settings,
                    &self.lib.shaders,
                    &self.lib.textures,
                    &self.lib.materials,
                )
                .await
            }
            WorkerState::Configuring => {
                let node = self.node_mut(id)?;
                node.state = WorkerState::SyncingAssets;
                tracing::info!("[{}] Ready to sync.", node.ip);
                self.num_syncing += 1;
                if self.num_syncing == self.n_workers() {
                    self.start_sync()?;
                }
                Ok(())
            }
            WorkerState::SyncingAssets => {
                // The in-flight mesh is acknowledged: its slot is done on
                // this side, and the producer may publish the next one.
                if self.current_mesh != 0 {
                    self.lib.release_mesh(self.current_mesh);
                    self.current_mesh = 0;
                }
                self.pump_mesh().await
            }
            WorkerState::SyncingCamera => {
                let lights: Vec<u32> = self.emissive_workers.iter().copied().collect();
                let node = self.node_mut(id)?;
                node.state = WorkerState::SyncingEmissive;
                tracing::info!("[{}] Syncing list of emissive workers.", node.ip);
                node.send_light_list(&lights).await
            }
            WorkerState::SyncingEmissive => {
                let node = self.node_mut(id)?;
                node.state = WorkerState::BuildingBvh;
                tracing::info!("[{}] Building local BVH.", node.ip);
                node.send_empty(MessageKind::BuildBvh).await
            }
            WorkerState::BuildingBvh => {
                let bounds = match wire::decode_bounding_box(&msg.body) {
                    Ok(bounds) => bounds,
                    Err(e) => {
                        tracing::error!("[worker {id}] {e}");
                        return Ok(());
                    }
                };
                self.worker_bounds.push((id, bounds));
                self.num_built += 1;
                {
                    let node = self.node_mut(id)?;
                    tracing::info!("[{}] Local BVH ready.", node.ip);
                }
                if self.linear_scan {
                    // No worker BVH to distribute; jump straight to ready.
                    self.node_mut(id)?.state = WorkerState::SyncingWbvh;
                    self.mark_ready(id).await
                } else if self.num_built == self.n_workers() {
                    self.build_wbvh().await
                } else {
                    Ok(())
                }
            }
            WorkerState::SyncingWbvh => self.mark_ready(id).await,
            other => {
                tracing::error!("[worker {id}] Received OK in unexpected state {other:?}.");
                Ok(())
            }
        }
    }

    fn render_settings(&self) -> RenderSettings {
        RenderSettings {
            width: self.cfg.width,
            height: self.cfg.height,
            buffers: self.cfg.buffers.clone(),
            min: self.cfg.min,
            max: self.cfg.max,
            samples: self.cfg.samples,
            max_bounces: self.cfg.max_bounces,
            n_shaders: self.lib.shaders.count() as u32,
            n_textures: self.lib.textures.count() as u32,
            n_materials: self.lib.materials.count() as u32,
        }
    }

    /// FENCE: every worker finished configuring. Build the routing table,
    /// create the accumulator image, and hand the scene to the producer.
    fn start_sync(&mut self) -> Result<()> {
        self.lib.build_spatial_index();

        let mut image = Image::new(self.cfg.width, self.cfg.height);
        for buffer in &self.cfg.buffers {
            image.add_buffer(buffer, 0.0);
        }
        self.lib.image = Some(image);

        let meshes = self
            .pending_meshes
            .take()
            .context("asset streaming started twice")?;
        let (streamer, rx) = SceneStreamer::spawn(meshes, self.cancel.new_child());
        self.streamer = Some(streamer);
        self.mesh_rx = Some(rx);
        self.streaming = true;
        Ok(())
    }

    /// One step of the asset stream: if no mesh is awaiting its ACK, try
    /// to take the producer's next publication and route it.
    async fn pump_mesh(&mut self) -> Result<()> {
        if !self.streaming || self.current_mesh != 0 {
            return Ok(());
        }
        let taken = match self.mesh_rx.as_ref() {
            Some(rx) => rx.try_recv(),
            None => return Ok(()),
        };
        match taken {
            Ok(mut mesh) => {
                let id = self.lib.meshes.next_id();
                mesh.id = id;
                let centroid = mesh.centroid;
                let emissive = self
                    .lib
                    .materials
                    .lookup(mesh.material)
                    .map(|m| m.emissive)
                    .unwrap_or(false);
                self.lib.store_mesh(id, mesh);

                let target = self.lib.route(centroid, self.cfg.min, self.cfg.max)?;
                if emissive {
                    self.emissive_workers.insert(target);
                }
                self.current_mesh = id;

                let mesh = self
                    .lib
                    .meshes
                    .lookup(id)
                    .context("mesh vanished before send")?;
                let node = self
                    .lib
                    .workers
                    .get_mut(target)
                    .with_context(|| format!("no worker with id {target}"))?;
                tracing::debug!("[{}] Sending mesh {} to worker {}.", node.ip, id, target);
                node.send_mesh(mesh).await
            }
            Err(TryRecvError::Empty) => Ok(()),
            Err(TryRecvError::Disconnected) => self.finish_sync().await,
        }
    }

    /// FENCE: the producer signalled end-of-assets. Move every worker on
    /// to the camera.
    async fn finish_sync(&mut self) -> Result<()> {
        self.streaming = false;
        self.mesh_rx = None;

        let camera = self.lib.camera.clone().context("scene has no camera")?;
        for id in self.worker_ids() {
            let node = self.node_mut(id)?;
            node.state = WorkerState::SyncingCamera;
            tracing::info!("[{}] Syncing camera.", node.ip);
            node.send_camera(&camera).await?;
        }
        self.build_start = Some(Instant::now());
        Ok(())
    }

    /// FENCE: all local BVH bounds are in. Build the worker BVH, ship it,
    /// and drop it.
    async fn build_wbvh(&mut self) -> Result<()> {
        tracing::info!("Building WBVH.");
        let wbvh = WorkerBvh::build(&self.worker_bounds);
        tracing::info!("Worker BVH size: {} bytes", wbvh.size_in_bytes());

        for id in self.worker_ids() {
            let node = self.node_mut(id)?;
            node.state = WorkerState::SyncingWbvh;
            tracing::info!("[{}] Syncing WBVH.", node.ip);
            node.send_wbvh(&wbvh).await?;
        }
        self.build_stop = Some(Instant::now());
        Ok(())
    }

    async fn mark_ready(&mut self, id: u32) -> Result<()> {
        let node = self.node_mut(id)?;
        node.state = WorkerState::Ready;
        tracing::info!("[{}] Ready to render.", node.ip);
        self.num_ready += 1;
        if self.num_ready == self.n_workers() {
            self.start_render().await?;
        }
        Ok(())
    }

    /// FENCE: every worker is ready. Hand out the image slabs.
    async fn start_render(&mut self) -> Result<()> {
        self.sync_stop = Some(Instant::now());
        self.render_start = Some(Instant::now());

        let width = self.cfg.width;
        let workers = self.n_workers() as u32;
        for id in self.worker_ids() {
            let (offset, chunk) = slab_partition(width, workers, id);
            let node = self.node_mut(id)?;
            node.send(&Message::with_body(
                MessageKind::RenderStart,
                wire::encode_render_start(offset, chunk),
            ))
            .await?;
            node.state = WorkerState::Rendering;
            tracing::info!("[{}] Starting render.", node.ip);
        }

        self.rendering = true;
        tracing::info!("Rendering has started.");
        Ok(())
    }

    async fn on_flush_tick(&mut self) -> Result<()> {
        for id in self.worker_ids() {
            let node = self.node_mut(id)?;
            if !node.flushed_this_tick() && node.pending_bytes() > 0 {
                node.flush().await?;
            }
            node.clear_flush_tick();
        }
        Ok(())
    }

    async fn on_interesting_tick(&mut self) -> Result<()> {
        if !self.rendering {
            return Ok(());
        }

        let done = self
            .lib
            .workers
            .iter()
            .all(|(_, node)| !node.is_interesting(self.max_intervals));
        if done {
            tracing::info!("Workers are no longer interesting.");
            return self.stop_render().await;
        }

        let mut produced = 0u64;
        let mut killed = 0u64;
        let mut queued = 0u64;
        for (_, node) in self.lib.workers.iter() {
            produced += node.rays_produced(self.max_intervals);
            killed += node.rays_killed(self.max_intervals);
            queued += node.rays_queued(self.max_intervals);
        }
        tracing::info!("RAYS:  +{} -{} ~{}", produced, killed, queued);
        Ok(())
    }

    /// Quiescence reached: stop the monitors and ask for the images.
    async fn stop_render(&mut self) -> Result<()> {
        self.render_stop = Some(Instant::now());
        self.rendering = false;

        for id in self.worker_ids() {
            let node = self.node_mut(id)?;
            node.send_empty(MessageKind::RenderStop).await?;
            node.state = WorkerState::SyncingImages;
            tracing::info!("[{}] Stopping render.", node.ip);
        }
        tracing::info!("Rendering has stopped, syncing images.");
        Ok(())
    }

    async fn on_runaway_tick(&mut self) -> Result<()> {
        if !self.rendering {
            return Ok(());
        }

        let mut slowest = f32::INFINITY;
        for (_, node) in self.lib.workers.iter() {
            slowest = slowest.min(node.progress());
        }
        let margin = self.cfg.runaway_margin();

        for id in self.worker_ids() {
            let node = self.node_mut(id)?;
            if node.state != WorkerState::Rendering && node.state != WorkerState::Paused {
                continue;
            }
            let paused = node.state == WorkerState::Paused;
            match pace_action(node.progress(), slowest, margin, paused) {
                PaceAction::Pause => {
                    tracing::info!("[{}] Runaway detected. Pausing work generation.", node.ip);
                    node.state = WorkerState::Paused;
                    node.send_empty(MessageKind::RenderPause).await?;
                }
                PaceAction::Resume => {
                    tracing::info!("[{}] Runaway eliminated. Resuming work generation.", node.ip);
                    node.state = WorkerState::Rendering;
                    node.send_empty(MessageKind::RenderResume).await?;
                }
                PaceAction::Hold => {}
            }
        }
        Ok(())
    }

    async fn on_sync_image(&mut self, id: u32, msg: &Message) -> Result<()> {
        let node = self.node_mut(id)?;
        let ip = node.ip.clone();
        let port = node.port;

        let tile = match node.receive_image(&msg.body) {
            Ok(tile) => tile,
            Err(e) => {
                tracing::error!("[{ip}] {e}");
                return Ok(());
            }
        };

        let component = format!("{}-{}_{}", self.cfg.name, ip, port);
        tracing::info!("Writing image to {component}.exr...");
        tile.to_exr_file(&PathBuf::from(format!("{component}.exr")))?;

        self.lib
            .image
            .as_mut()
            .context("accumulator image missing")?
            .merge(&tile)?;
        tracing::info!("[{ip}] Merged image.");

        tracing::info!("Writing stats to {component}.csv...");
        let node = self.node_mut(id)?;
        node.stats.to_csv_file(&PathBuf::from(format!("{component}.csv")))?;
        node.state = WorkerState::Done;

        self.num_complete += 1;
        if self.num_complete < self.n_workers() {
            return Ok(());
        }

        let final_path = PathBuf::from(format!("{}.exr", self.cfg.name));
        self.lib
            .image
            .as_ref()
            .context("accumulator image missing")?
            .to_exr_file(&final_path)?;
        tracing::info!("Wrote {}.exr.", self.cfg.name);

        self.log_durations();

        for id in self.worker_ids() {
            let node = self.node_mut(id)?;
            if let Err(e) = node.shutdown().await {
                tracing::warn!("{e:#}");
            }
        }
        self.cancel.cancel();
        self.complete = true;
        Ok(())
    }

    fn log_durations(&self) {
        if let (Some(start), Some(stop)) = (self.sync_start, self.sync_stop) {
            tracing::info!("Time spent syncing: {} seconds.", (stop - start).as_secs());
        }
        if !self.linear_scan {
            if let (Some(start), Some(stop)) = (self.build_start, self.build_stop) {
                tracing::info!("Time spent building: {} seconds.", (stop - start).as_secs());
            }
        }
        if let (Some(start), Some(stop)) = (self.render_start, self.render_stop) {
            tracing::info!("Time spent rendering: {} seconds.", (stop - start).as_secs());
        }
    }
}

/// Await the next tick of a phase timer, or forever while the phase is off.
async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}

async fn wait_for_cancel(cancel: &CancelToken) {
    while !cancel.is_cancelled() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Read pump for one connection: chunks go to the reactor untouched, EOF
/// and errors are reported and end the pump.
async fn pump_reads(
    id: u32,
    mut rd: OwnedReadHalf,
    tx: UnboundedSender<NetEvent>,
    cancel: CancelToken,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            res = rd.read(&mut buf) => match res {
                Ok(0) => {
                    let _ = tx.send(NetEvent::Eof { id });
                    break;
                }
                Ok(n) => {
                    if tx.send(NetEvent::Data { id, bytes: buf[..n].to_vec() }).is_err() {
                        break;
                    }
                }
                Err(error) => {
                    let _ = tx.send(NetEvent::Failed { id, error });
                    break;
                }
            },
            _ = wait_for_cancel(&cancel) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_tiles_the_width_exactly() {
        for width in [1u32, 2, 7, 640, 641, 1920, 65535] {
            for workers in 1..=8u32.min(width) {
                let mut covered = 0u32;
                for id in 1..=workers {
                    let (offset, chunk) = slab_partition(width, workers, id);
                    assert_eq!(offset as u32, covered, "width={width} workers={workers} id={id}");
                    covered += chunk as u32;
                }
                assert_eq!(covered, width, "width={width} workers={workers}");
            }
        }
    }

    #[test]
    fn partition_last_worker_absorbs_the_remainder() {
        let (offset, chunk) = slab_partition(641, 3, 3);
        assert_eq!(offset, 426);
        assert_eq!(chunk, 215);
    }

    #[test]
    fn render_start_payloads_for_two_workers() {
        let (o1, c1) = slab_partition(640, 2, 1);
        let (o2, c2) = slab_partition(640, 2, 2);
        assert_eq!(((o1 as u32) << 16) | c1 as u32, 320);
        assert_eq!(((o2 as u32) << 16) | c2 as u32, (320 << 16) | 320);
    }

    #[test]
    fn render_start_payloads_for_three_workers() {
        let payloads: Vec<u32> = (1..=3)
            .map(|id| {
                let (offset, chunk) = slab_partition(641, 3, id);
                ((offset as u32) << 16) | chunk as u32
            })
            .collect();
        assert_eq!(payloads, vec![213, (213 << 16) | 213, (426 << 16) | 215]);
    }
}
