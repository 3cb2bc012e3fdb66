#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use bytes::Bytes;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::engine::{pace_action, Engine, PaceAction};
    use crate::image::Image;
    use crate::protocol::{wire, FrameReader, Message, MessageKind, WriteBuffer};
    use crate::spatial::BoundingBox;
    use crate::stats::RenderStats;

    // ---- framing: property 1 under adversarial fragmentation

    #[test]
    fn framing_fuzz_survives_one_byte_writes_and_seven_byte_reads() {
        let kinds = [
            MessageKind::Ok,
            MessageKind::Init,
            MessageKind::SyncMesh,
            MessageKind::SyncCamera,
            MessageKind::RenderStats,
            MessageKind::SyncImage,
            MessageKind::RenderStop,
        ];
        let mut rng = StdRng::seed_from_u64(0x5EED);

        for round in 0..20 {
            let msgs: Vec<Message> = (0..rng.gen_range(1..40))
                .map(|_| {
                    let kind = kinds[rng.gen_range(0..kinds.len())];
                    let len = rng.gen_range(0..600);
                    let body: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                    Message::with_body(kind, Bytes::from(body))
                })
                .collect();

            // The sender batches through the write buffer, spilling in
            // 1-byte fragments to the "socket".
            let mut wbuf = WriteBuffer::with_capacity(256);
            let mut wire_bytes: Vec<u8> = Vec::new();
            for msg in &msgs {
                wbuf.append(msg, &mut |chunk| {
                    for b in chunk {
                        wire_bytes.push(*b);
                    }
                });
            }
            wire_bytes.extend_from_slice(wbuf.pending());
            wbuf.clear();

            // The receiver reads in 7-byte chunks.
            let mut reader = FrameReader::new();
            let mut got = Vec::new();
            for chunk in wire_bytes.chunks(7) {
                got.extend(reader.feed(chunk).unwrap());
            }
            assert_eq!(got, msgs, "round {round}");
        }
    }

    // ---- runaway boundary semantics

    #[test]
    fn runaway_pauses_only_the_worker_past_the_margin() {
        // progresses (0.10, 0.20), margin 0.05
        assert_eq!(pace_action(0.10, 0.10, 0.05, false), PaceAction::Hold);
        assert_eq!(pace_action(0.20, 0.10, 0.05, false), PaceAction::Pause);
    }

    #[test]
    fn paused_worker_waits_for_the_slowest_to_catch_up() {
        // (0.15, 0.20): within the margin again, but not yet caught up.
        assert_eq!(pace_action(0.20, 0.15, 0.05, true), PaceAction::Hold);
        // Caught up exactly: resume uses <=.
        assert_eq!(pace_action(0.20, 0.20, 0.05, true), PaceAction::Resume);
    }

    #[test]
    fn pause_boundary_is_strict() {
        // Exactly margin ahead is not a runaway: > rather than >=.
        assert_eq!(pace_action(0.20, 0.15, 0.05, false), PaceAction::Hold);
        assert_eq!(
            pace_action(0.20000002, 0.15, 0.05, false),
            PaceAction::Pause
        );
    }

    // ---- the whole lifecycle against fake workers over loopback TCP

    #[derive(Default)]
    struct WorkerRecord {
        meshes: usize,
        cameras: usize,
        render_stops: usize,
        pauses: usize,
        render_start_payload: Option<u32>,
        emissive_body: Vec<u8>,
    }

    fn reply(sock: &mut TcpStream, msg: &Message) {
        sock.write_all(&msg.to_wire()).unwrap();
    }

    fn reply_stats(sock: &mut TcpStream, stats: &RenderStats) {
        reply(
            sock,
            &Message::with_body(MessageKind::RenderStats, wire::encode_render_stats(stats)),
        );
    }

    /// A minimal worker: follows the coordinator's lifecycle, reports a
    /// burst of ray activity and then silence, and ships one flat tile.
    fn run_fake_worker(
        listener: TcpListener,
        record: Arc<Mutex<WorkerRecord>>,
        config_frames: usize,
        tile: Image,
    ) {
        let (mut sock, _) = listener.accept().unwrap();
        sock.set_read_timeout(Some(Duration::from_millis(10))).unwrap();
        sock.set_nodelay(true).unwrap();

        let mut reader = FrameReader::new();
        let mut buf = [0u8; 65536];
        let mut config_remaining = 0usize;
        let mut rendering = false;
        let mut stopped = false;

        loop {
            let chunk = match sock.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => &buf[..n],
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if rendering && !stopped {
                        // Idle: no ray activity, progress holding steady.
                        reply_stats(
                            &mut sock,
                            &RenderStats {
                                progress: 0.5,
                                ..Default::default()
                            },
                        );
                    }
                    continue;
                }
                Err(e) => panic!("worker read: {e}"),
            };

            for msg in reader.feed(chunk).unwrap() {
                match msg.kind {
                    MessageKind::Init => reply(&mut sock, &Message::new(MessageKind::Ok)),
                    MessageKind::SyncConfig => {
                        config_remaining = config_frames;
                        if config_remaining == 0 {
                            reply(&mut sock, &Message::new(MessageKind::Ok));
                        }
                    }
                    MessageKind::SyncShader
                    | MessageKind::SyncTexture
                    | MessageKind::SyncMaterial => {
                        config_remaining -= 1;
                        if config_remaining == 0 {
                            reply(&mut sock, &Message::new(MessageKind::Ok));
                        }
                    }
                    MessageKind::SyncMesh => {
                        record.lock().unwrap().meshes += 1;
                        reply(&mut sock, &Message::new(MessageKind::Ok));
                    }
                    MessageKind::SyncCamera => {
                        record.lock().unwrap().cameras += 1;
                        reply(&mut sock, &Message::new(MessageKind::Ok));
                    }
                    MessageKind::SyncEmissive => {
                        record.lock().unwrap().emissive_body = msg.body.to_vec();
                        reply(&mut sock, &Message::new(MessageKind::Ok));
                    }
                    MessageKind::BuildBvh => {
                        let bounds = BoundingBox {
                            min: [-1.0, -1.0, -1.0],
                            max: [1.0, 1.0, 1.0],
                        };
                        reply(
                            &mut sock,
                            &Message::with_body(
                                MessageKind::Ok,
                                wire::encode_bounding_box(&bounds),
                            ),
                        );
                    }
                    MessageKind::SyncWbvh => reply(&mut sock, &Message::new(MessageKind::Ok)),
                    MessageKind::RenderStart => {
                        record.lock().unwrap().render_start_payload =
                            Some(wire::decode_u32(&msg.body).unwrap());
                        rendering = true;
                        reply_stats(
                            &mut sock,
                            &RenderStats {
                                rays_produced: 10,
                                rays_killed: 2,
                                rays_queued: 3,
                                progress: 0.5,
                            },
                        );
                    }
                    MessageKind::RenderPause => record.lock().unwrap().pauses += 1,
                    MessageKind::RenderResume => {}
                    MessageKind::RenderStop => {
                        record.lock().unwrap().render_stops += 1;
                        stopped = true;
                        let body = wire::encode_asset("image tile", &tile).unwrap();
                        reply(&mut sock, &Message::with_body(MessageKind::SyncImage, body));
                    }
                    other => panic!("worker got unexpected {other:?}"),
                }
            }
        }
    }

    fn flat_tile(width: u32, height: u32, value: f32) -> Image {
        let mut tile = Image::new(width, height);
        tile.add_buffer("r", value);
        tile.add_buffer("g", value);
        tile.add_buffer("b", value);
        tile
    }

    #[test]
    fn full_render_lifecycle_against_two_workers() {
        let dir = tempfile::tempdir().unwrap();

        let listeners: Vec<TcpListener> = (0..2)
            .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        let ports: Vec<u16> = listeners
            .iter()
            .map(|l| l.local_addr().unwrap().port())
            .collect();

        let out_base = dir.path().join("out");
        let config_path = dir.path().join("render.toml");
        std::fs::write(
            &config_path,
            format!(
                r#"
workers = ["127.0.0.1:{}", "127.0.0.1:{}"]
runaway = 100.0
name = "{}"
width = 640
height = 16
buffers = ["r", "g", "b"]
min = [-10.0, -10.0, -10.0]
max = [10.0, 10.0, 10.0]
stats_timeout_ms = 25
"#,
                ports[0],
                ports[1],
                out_base.display()
            ),
        )
        .unwrap();

        // Meshes 1 and 2 sit low on every axis (worker 1's half of the
        // Morton curve); mesh 3 sits high (worker 2). Mesh 3's material
        // is emissive, so worker 2 is the only emissive host.
        let scene_path = dir.path().join("scene.json");
        std::fs::write(
            &scene_path,
            r#"{
                "camera": { "eye": [0, 2, 20], "look": [0, 0, 0] },
                "materials": [
                    { "name": "paint" },
                    { "name": "lamp", "emissive": true }
                ],
                "meshes": [
                    {
                        "material": "paint",
                        "vertices": [[-9.5, -9.0, -9.0], [-8.5, -9.0, -9.0], [-9.0, -9.5, -8.5]],
                        "faces": [[0, 1, 2]]
                    },
                    {
                        "material": "paint",
                        "vertices": [[-5.5, -5.0, -5.0], [-4.5, -5.0, -5.0], [-5.0, -5.5, -4.5]],
                        "faces": [[0, 1, 2]]
                    },
                    {
                        "material": "lamp",
                        "vertices": [[8.5, 9.0, 9.0], [9.5, 9.0, 9.0], [9.0, 8.5, 9.5]],
                        "faces": [[0, 1, 2]]
                    }
                ]
            }"#,
        )
        .unwrap();

        let records: Vec<Arc<Mutex<WorkerRecord>>> = (0..2)
            .map(|_| Arc::new(Mutex::new(WorkerRecord::default())))
            .collect();

        let mut worker_threads = Vec::new();
        for (listener, record) in listeners.into_iter().zip(records.iter()) {
            let record = Arc::clone(record);
            let tile = flat_tile(640, 16, 0.25);
            // Two materials travel in the CONFIGURING batch.
            worker_threads.push(thread::spawn(move || {
                run_fake_worker(listener, record, 2, tile)
            }));
        }

        let engine = Engine::init(&config_path, &scene_path, 2, false).unwrap();
        engine.run().unwrap();

        for handle in worker_threads {
            handle.join().unwrap();
        }

        let first = records[0].lock().unwrap();
        let second = records[1].lock().unwrap();

        // Spatial routing: low meshes on worker 1, the high one on worker 2.
        assert_eq!(first.meshes, 2);
        assert_eq!(second.meshes, 1);

        // One camera and exactly one stop each.
        assert_eq!(first.cameras, 1);
        assert_eq!(second.cameras, 1);
        assert_eq!(first.render_stops, 1);
        assert_eq!(second.render_stops, 1);

        // Wide margin and equal progress: nobody ran away.
        assert_eq!(first.pauses, 0);
        assert_eq!(second.pauses, 0);

        // Worker 2 hosts the lamp; both get told so.
        assert_eq!(first.emissive_body, 2u32.to_le_bytes().to_vec());
        assert_eq!(second.emissive_body, 2u32.to_le_bytes().to_vec());

        // Slab payloads for W=640, n=2.
        assert_eq!(first.render_start_payload, Some(320));
        assert_eq!(second.render_start_payload, Some((320 << 16) | 320));

        // Per-worker and merged outputs exist; the merge doubled the tile.
        for port in &ports {
            let base = format!("{}-127.0.0.1_{}", out_base.display(), port);
            assert!(std::path::Path::new(&format!("{base}.exr")).exists());
            assert!(std::path::Path::new(&format!("{base}.csv")).exists());
        }
        let merged_path = format!("{}.exr", out_base.display());
        assert!(std::path::Path::new(&merged_path).exists());
        let merged = image::open(&merged_path).unwrap().to_rgba32f();
        let pixel = merged.get_pixel(0, 0);
        assert!((pixel[0] - 0.5).abs() < 1e-6, "merged r = {}", pixel[0]);
    }
}
