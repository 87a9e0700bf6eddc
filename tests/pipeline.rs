//! End-to-end pipeline tests: scripted byte chunks in, planned broker
//! publications and merged device updates out. Broker and serial port are
//! replaced by in-process fakes; the TCP transport is exercised against a
//! real listener.

use anyhow::Context;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jkbridge::{
    Bridge, BridgeConfig, ChunkSource, Driver, FRAME_MARKER, FrameDecoder, FrameKind, LinkState,
    MessageSink, MqttConfig, Publication, SerialConfig, SerialSource, TcpConfig, TcpSource,
    TransportConfig,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Build a structurally valid frame with a correct trailing checksum.
fn make_frame(kind: FrameKind, device_id: u32) -> Vec<u8> {
    let len = kind.frame_len();
    let mut frame = vec![0u8; len];
    frame[..4].copy_from_slice(&FRAME_MARKER);
    match kind {
        FrameKind::Settings => {
            frame[4] = 0x01;
            // Device address register, absolute offset 276.
            frame[276..280].copy_from_slice(&device_id.to_le_bytes());
            // cell_count at register offset 108 -> absolute 114.
            frame[114..118].copy_from_slice(&16u32.to_le_bytes());
        }
        FrameKind::Telemetry => {
            frame[4] = 0x02;
            // soc_percent at register offset 167 -> absolute 173.
            frame[173] = 87;
        }
    }
    let sum: u32 = frame[..len - 1].iter().map(|&b| b as u32).sum();
    frame[len - 1] = (sum & 0xFF) as u8;
    frame
}

enum Step {
    Chunk(Vec<u8>),
    Wait(Duration),
    WaitUntil(Instant),
}

/// Chunk source replaying a fixed script, then pending forever.
///
/// The pipeline polls `next_chunk` inside a `select!`, so the future may be
/// dropped mid-wait; waits are therefore anchored to an absolute deadline
/// that survives cancellation instead of being consumed on pop.
struct ScriptedSource {
    steps: VecDeque<Step>,
}

impl ScriptedSource {
    fn new(steps: Vec<Step>) -> Self {
        Self { steps: steps.into() }
    }
}

#[async_trait::async_trait]
impl ChunkSource for ScriptedSource {
    async fn next_chunk(&mut self) -> jkbridge::Result<Vec<u8>> {
        loop {
            let Some(step) = self.steps.pop_front() else {
                futures::future::pending::<()>().await;
                unreachable!();
            };
            match step {
                Step::Chunk(chunk) => return Ok(chunk),
                Step::Wait(duration) => {
                    self.steps.push_front(Step::WaitUntil(Instant::now() + duration));
                }
                Step::WaitUntil(deadline) => {
                    if Instant::now() < deadline {
                        self.steps.push_front(Step::WaitUntil(deadline));
                        tokio::time::sleep_until(deadline).await;
                        // Loop pops the deadline again; it has now passed.
                    }
                }
            }
        }
    }
}

/// Sink capturing every planned publication.
#[derive(Default)]
struct RecordingSink {
    publications: Mutex<Vec<Publication>>,
}

impl RecordingSink {
    fn topics(&self) -> Vec<String> {
        self.publications.lock().unwrap().iter().map(|p| p.topic.clone()).collect()
    }

    fn count_matching(&self, suffix: &str) -> usize {
        self.publications.lock().unwrap().iter().filter(|p| p.topic.ends_with(suffix)).count()
    }
}

#[async_trait::async_trait]
impl MessageSink for RecordingSink {
    async fn publish(&self, publication: Publication) {
        self.publications.lock().unwrap().push(publication);
    }

    fn is_connected(&self) -> bool {
        true
    }
}

fn test_config(packet_expire_secs: f64, settings_publish_interval_secs: u64) -> BridgeConfig {
    BridgeConfig {
        transport: TransportConfig::Serial(SerialConfig {
            device: "/dev/ttyUSB0".to_string(),
            baudrate: 115_200,
            timeout_secs: 1.0,
            reconnect_delay_secs: 0.05,
        }),
        mqtt: MqttConfig {
            host: "core-mosquitto".to_string(),
            port: 1883,
            username: None,
            password: None,
            discovery_prefix: "homeassistant".to_string(),
            topic_prefix: "Jikong_BMS".to_string(),
            client_id: "jk_bms_monitor".to_string(),
        },
        packet_expire_secs,
        settings_publish_interval_secs,
        strict_checksum: false,
    }
}

fn spawn_pipeline(
    steps: Vec<Step>,
    config: &BridgeConfig,
) -> (Arc<RecordingSink>, jkbridge::BridgeChannels) {
    let sink = Arc::new(RecordingSink::default());
    let (_link_tx, link_rx) = watch::channel(LinkState::Connected);
    let channels = Driver::spawn(
        ScriptedSource::new(steps),
        Arc::clone(&sink) as Arc<dyn MessageSink>,
        config,
        link_rx,
        CancellationToken::new(),
    );
    (sink, channels)
}

async fn next_update(
    updates: &mut watch::Receiver<Option<Arc<jkbridge::DeviceUpdate>>>,
) -> Arc<jkbridge::DeviceUpdate> {
    tokio::time::timeout(Duration::from_secs(30), updates.changed())
        .await
        .expect("pipeline produced no update in time")
        .expect("pipeline ended unexpectedly");
    updates.borrow_and_update().clone().expect("update present after change")
}

#[tokio::test(start_paused = true)]
async fn telemetry_inside_window_is_merged_and_published() {
    let config = test_config(0.4, 60);
    let steps = vec![
        Step::Chunk(make_frame(FrameKind::Telemetry, 0)),
        Step::Wait(Duration::from_millis(50)),
        Step::Chunk(make_frame(FrameKind::Settings, 3)),
    ];
    let (sink, channels) = spawn_pipeline(steps, &config);
    let mut updates = channels.updates.clone();

    let update = next_update(&mut updates).await;
    assert_eq!(update.device_id, 3);
    assert_eq!(update.settings["cell_count"], serde_json::Value::from(16));
    let telemetry = update.telemetry.as_ref().expect("telemetry merged inside window");
    assert_eq!(telemetry["soc_percent"], serde_json::Value::from(87));

    // Discovery config messages precede both state publishes.
    let topics = sink.topics();
    let first_state = topics.iter().position(|t| !t.ends_with("/config")).expect("state publish");
    assert!(topics[..first_state].iter().all(|t| t.starts_with("homeassistant/")));
    assert!(topics.contains(&"Jikong_BMS/3/settings".to_string()));
    assert!(topics.contains(&"Jikong_BMS/3/realtime".to_string()));

    let publications = sink.publications.lock().unwrap();
    let settings = publications.iter().find(|p| p.topic == "Jikong_BMS/3/settings").unwrap();
    assert!(settings.retain);
    let realtime = publications.iter().find(|p| p.topic == "Jikong_BMS/3/realtime").unwrap();
    assert!(!realtime.retain);
}

#[tokio::test(start_paused = true)]
async fn stale_telemetry_is_dropped_not_merged() {
    let config = test_config(0.4, 60);
    let steps = vec![
        Step::Chunk(make_frame(FrameKind::Telemetry, 0)),
        Step::Wait(Duration::from_millis(600)),
        Step::Chunk(make_frame(FrameKind::Settings, 0)),
    ];
    let (sink, channels) = spawn_pipeline(steps, &config);
    let mut updates = channels.updates.clone();

    let update = next_update(&mut updates).await;
    assert_eq!(update.device_id, 0);
    assert!(update.telemetry.is_none(), "snapshot outside the window must not merge");

    assert_eq!(sink.count_matching("/settings"), 1);
    assert_eq!(sink.count_matching("/realtime"), 0);
}

#[tokio::test(start_paused = true)]
async fn settings_rate_limited_across_rounds() {
    let config = test_config(0.4, 60);
    let mut steps = Vec::new();
    for _ in 0..3 {
        steps.push(Step::Chunk(make_frame(FrameKind::Telemetry, 0)));
        steps.push(Step::Wait(Duration::from_millis(50)));
        steps.push(Step::Chunk(make_frame(FrameKind::Settings, 0)));
        steps.push(Step::Wait(Duration::from_secs(2)));
    }
    let (sink, channels) = spawn_pipeline(steps, &config);
    let mut updates = channels.updates.clone();

    for _ in 0..3 {
        next_update(&mut updates).await;
    }

    // Telemetry goes out every round; settings and discovery only once
    // inside the publish interval.
    assert_eq!(sink.count_matching("/realtime"), 3);
    assert_eq!(sink.count_matching("/settings"), 1);
    assert!(sink.count_matching("/config") > 0);

    // All discovery happens up front; later rounds are state-only.
    let state_publishes = {
        let publications = sink.publications.lock().unwrap();
        let tail: Vec<_> =
            publications.iter().skip_while(|p| p.topic.ends_with("/config")).collect();
        assert!(tail.iter().all(|p| !p.topic.ends_with("/config")));
        tail.len()
    };
    assert_eq!(state_publishes, 4, "3 realtime + 1 settings state publishes");
}

#[tokio::test(start_paused = true)]
async fn each_device_identity_is_discovered_separately() {
    let config = test_config(0.4, 60);
    let steps = vec![
        Step::Chunk(make_frame(FrameKind::Telemetry, 0)),
        Step::Chunk(make_frame(FrameKind::Settings, 0)),
        Step::Wait(Duration::from_millis(100)),
        Step::Chunk(make_frame(FrameKind::Telemetry, 0)),
        Step::Chunk(make_frame(FrameKind::Settings, 2)),
    ];
    let (sink, channels) = spawn_pipeline(steps, &config);
    let mut updates = channels.updates.clone();

    let first = next_update(&mut updates).await;
    let second = next_update(&mut updates).await;
    assert_eq!(first.device_id, 0);
    assert_eq!(second.device_id, 2);

    let topics = sink.topics();
    assert!(topics.iter().any(|t| t.contains("jk_bms_0") && t.ends_with("/config")));
    assert!(topics.iter().any(|t| t.contains("jk_bms_2") && t.ends_with("/config")));
    assert!(topics.contains(&"Jikong_BMS/0/realtime".to_string()));
    assert!(topics.contains(&"Jikong_BMS/2/realtime".to_string()));
}

#[tokio::test(start_paused = true)]
async fn frames_split_across_chunks_still_decode() {
    let config = test_config(0.4, 60);
    let telemetry = make_frame(FrameKind::Telemetry, 0);
    let settings = make_frame(FrameKind::Settings, 1);

    // One byte stream cut at arbitrary points, with garbage in between.
    let mut stream = telemetry;
    stream.extend([0xDE, 0xAD, 0xBE, 0xEF]);
    stream.extend(settings);
    let cut_a = 100;
    let cut_b = 400;
    let steps = vec![
        Step::Chunk(stream[..cut_a].to_vec()),
        Step::Chunk(stream[cut_a..cut_b].to_vec()),
        Step::Chunk(stream[cut_b..].to_vec()),
    ];
    let (_sink, channels) = spawn_pipeline(steps, &config);
    let mut updates = channels.updates.clone();

    let update = next_update(&mut updates).await;
    assert_eq!(update.device_id, 1);
    assert!(update.telemetry.is_some());
}

#[tokio::test]
async fn start_rejects_fatal_misconfiguration() {
    let mut config = test_config(0.4, 60);
    config.mqtt.host = String::new();

    match Bridge::start(config) {
        Ok(_) => panic!("empty broker host must be fatal"),
        Err(err) => assert!(!err.is_retryable()),
    }
}

#[tokio::test]
async fn shutdown_terminates_background_tasks() -> anyhow::Result<()> {
    let handle = Bridge::start(test_config(0.4, 60))?;
    assert_eq!(handle.link_state(), LinkState::Disconnected);

    tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
        .await
        .context("shutdown completes promptly")?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn tcp_source_reconnects_and_resumes_mid_frame() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.context("bind test listener")?;
    let addr = listener.local_addr()?;

    let frame = make_frame(FrameKind::Telemetry, 0);
    let (first_half, second_half) = frame.split_at(150);
    let (first_half, second_half) = (first_half.to_vec(), second_half.to_vec());

    let accepts = Arc::new(AtomicUsize::new(0));
    let server_accepts = Arc::clone(&accepts);
    tokio::spawn(async move {
        // First connection delivers half a frame, then drops.
        let (mut conn, _) = listener.accept().await.expect("first accept");
        server_accepts.fetch_add(1, Ordering::SeqCst);
        conn.write_all(&first_half).await.expect("first write");
        drop(conn);

        // The reconnected client gets the rest.
        let (mut conn, _) = listener.accept().await.expect("second accept");
        server_accepts.fetch_add(1, Ordering::SeqCst);
        conn.write_all(&second_half).await.expect("second write");
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let (link_tx, link_rx) = watch::channel(LinkState::Disconnected);
    let mut source = TcpSource::new(
        TcpConfig {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
            timeout_secs: 2.0,
            buffer_size: 4096,
            reconnect_delay_secs: 0.05,
        },
        link_tx,
    )?;

    let decoded = tokio::time::timeout(Duration::from_secs(10), async {
        let mut decoder = FrameDecoder::new(false);
        loop {
            let chunk = source.next_chunk().await.expect("tcp source never fails permanently");
            let mut frames = decoder.push(&chunk, Instant::now());
            if let Some(frame) = frames.pop() {
                return frame;
            }
        }
    })
    .await
    .context("frame decoded before deadline")?;

    assert_eq!(decoded.kind, FrameKind::Telemetry);
    assert_eq!(decoded.payload, frame);
    assert_eq!(accepts.load(Ordering::SeqCst), 2, "source reconnected once");
    assert_eq!(*link_rx.borrow(), LinkState::Connected);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnect_backoff_survives_sweep_cancellation() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    // Every accepted connection is dropped immediately, forcing a
    // reconnect cycle on the client for as long as the test runs.
    let accepts = Arc::new(AtomicUsize::new(0));
    let server_accepts = Arc::clone(&accepts);
    tokio::spawn(async move {
        loop {
            let Ok((conn, _)) = listener.accept().await else { break };
            server_accepts.fetch_add(1, Ordering::SeqCst);
            drop(conn);
        }
    });

    // A 50 ms correlation window makes the pipeline's sweep timer cancel
    // and recreate the in-flight read many times per backoff interval.
    let config = test_config(0.05, 60);
    let (link_tx, link_rx) = watch::channel(LinkState::Disconnected);
    let source = TcpSource::new(
        TcpConfig {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
            timeout_secs: 10.0,
            buffer_size: 4096,
            reconnect_delay_secs: 0.3,
        },
        link_tx,
    )?;
    let channels = Driver::spawn(
        source,
        Arc::new(RecordingSink::default()) as Arc<dyn MessageSink>,
        &config,
        link_rx,
        CancellationToken::new(),
    );

    tokio::time::sleep(Duration::from_secs(1)).await;
    channels.cancel.cancel();

    let attempts = accepts.load(Ordering::SeqCst);
    assert!(attempts >= 2, "source stopped retrying: {attempts} attempts");
    assert!(attempts <= 5, "more than one connect attempt per backoff interval: {attempts}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_gateway_hits_read_timeout_despite_sweep_cancellation() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    // The gateway accepts and then never sends a byte; connections are
    // held open so only the read timeout can end them.
    let accepts = Arc::new(AtomicUsize::new(0));
    let server_accepts = Arc::clone(&accepts);
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let Ok((conn, _)) = listener.accept().await else { break };
            server_accepts.fetch_add(1, Ordering::SeqCst);
            held.push(conn);
        }
    });

    let config = test_config(0.05, 60);
    let (link_tx, link_rx) = watch::channel(LinkState::Disconnected);
    let source = TcpSource::new(
        TcpConfig {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
            timeout_secs: 0.4,
            buffer_size: 4096,
            reconnect_delay_secs: 0.05,
        },
        link_tx,
    )?;
    let channels = Driver::spawn(
        source,
        Arc::new(RecordingSink::default()) as Arc<dyn MessageSink>,
        &config,
        link_rx,
        CancellationToken::new(),
    );

    tokio::time::sleep(Duration::from_secs(2)).await;
    channels.cancel.cancel();

    // The sweep period (50 ms) is far below the read timeout (400 ms);
    // a second accept proves the timeout still elapsed and tore the dead
    // connection down.
    let attempts = accepts.load(Ordering::SeqCst);
    assert!(attempts >= 2, "silent gateway never detected as dead: {attempts} accepts");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn serial_end_of_stream_reopens_port() -> anyhow::Result<()> {
    use tokio_serial::SerialPort;

    let _ = tracing_subscriber::fmt::try_init();
    let (master, slave) = tokio_serial::SerialStream::pair().context("pseudo-terminal pair")?;
    let device = slave.name().context("slave side has a device path")?;
    drop(slave);

    let (link_tx, link_rx) = watch::channel(LinkState::Disconnected);
    let mut source = SerialSource::new(
        SerialConfig {
            device,
            baudrate: 115_200,
            timeout_secs: 0.1,
            // Long enough that the torn-down state is observable.
            reconnect_delay_secs: 5.0,
        },
        link_tx,
    )?;
    tokio::spawn(async move {
        while source.next_chunk().await.is_ok() {}
    });

    let mut link = link_rx.clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while *link.borrow_and_update() != LinkState::Connected {
            link.changed().await.expect("link channel open");
        }
    })
    .await
    .context("port opened")?;

    // Dropping the master end makes every slave read report end of
    // stream; the source must tear the port down instead of spinning on
    // a dead descriptor.
    drop(master);
    tokio::time::timeout(Duration::from_secs(5), async {
        while *link.borrow_and_update() != LinkState::Disconnected {
            link.changed().await.expect("link channel open");
        }
    })
    .await
    .context("dead port torn down")?;
    Ok(())
}
