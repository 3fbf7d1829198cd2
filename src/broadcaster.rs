//! Supervises a single external transcoder process, parses its fragmented-MP4
//! output into an init segment plus media chunks, and fans both out through
//! the [`ConnectionManager`].

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{SourceKind, VideoConfig};
use crate::connection::ConnectionManager;
use crate::init_parser::{find_init_boundary, BoundaryResult};

/// Chunk size for the media-phase read loop.
const READ_CHUNK_SIZE: usize = 16 * 1024;
const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const HEALTHY_CYCLE_THRESHOLD: Duration = Duration::from_secs(10);
const CHILD_EXIT_WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcasterState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl BroadcasterState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => BroadcasterState::Stopped,
            1 => BroadcasterState::Starting,
            2 => BroadcasterState::Running,
            3 => BroadcasterState::Stopping,
            _ => BroadcasterState::Error,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            BroadcasterState::Stopped => 0,
            BroadcasterState::Starting => 1,
            BroadcasterState::Running => 2,
            BroadcasterState::Stopping => 3,
            BroadcasterState::Error => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BroadcasterState::Stopped => "stopped",
            BroadcasterState::Starting => "starting",
            BroadcasterState::Running => "running",
            BroadcasterState::Stopping => "stopping",
            BroadcasterState::Error => "error",
        }
    }
}

struct AtomicState(AtomicU8);

impl AtomicState {
    fn new(initial: BroadcasterState) -> Self {
        AtomicState(AtomicU8::new(initial.as_u8()))
    }

    fn load(&self) -> BroadcasterState {
        BroadcasterState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: BroadcasterState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatsSnapshot {
    pub elapsed_seconds: f64,
    pub chunks_sent: u64,
    pub bytes_sent: u64,
}

struct StreamStats {
    cycle_start: AtomicU64, // epoch millis
    chunks_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl StreamStats {
    fn new() -> Self {
        StreamStats {
            cycle_start: AtomicU64::new(now_epoch_millis()),
            chunks_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    fn reset_cycle(&self) {
        self.cycle_start.store(now_epoch_millis(), Ordering::Relaxed);
        self.chunks_sent.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
    }

    fn record_chunk(&self, len: usize) {
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StreamStatsSnapshot {
        let started = self.cycle_start.load(Ordering::Relaxed);
        let elapsed_ms = now_epoch_millis().saturating_sub(started);
        StreamStatsSnapshot {
            elapsed_seconds: elapsed_ms as f64 / 1000.0,
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

fn now_epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct BroadcasterStats {
    pub state: BroadcasterState,
    pub running: bool,
    pub stream: StreamStatsSnapshot,
}

/// Builds the transcoder CLI arguments for a given video config and effective
/// source kind, per the argument-synthesis rules in the design.
pub fn build_args(video: &VideoConfig) -> Vec<String> {
    let source_kind = video.source_kind();
    let path = video.file_path.as_str();
    let mut args = Vec::new();

    // Pacing: anything that isn't already real-time needs -re, and so does
    // a remote HTTP file even though it's classed as LIVE_STREAM.
    if !source_kind.is_live() || SourceKind::is_http(path) {
        args.push("-re".to_string());
    }

    // Looping: local files only. (GROWING_FILE must never loop — it would
    // rewind past data that hasn't been written yet.)
    if source_kind.can_loop() {
        args.push("-stream_loop".to_string());
        args.push("-1".to_string());
    }

    let mut input_path = path.to_string();

    if source_kind == SourceKind::Device {
        if let Some(spec) = path.strip_prefix("avfoundation:") {
            args.push("-f".to_string());
            args.push("avfoundation".to_string());
            input_path = spec.to_string();
        } else if path.starts_with("/dev/video") {
            args.push("-f".to_string());
            args.push("v4l2".to_string());
            args.push("-framerate".to_string());
            args.push(video.fps.to_string());
        } else if let Some(spec) = path.strip_prefix("dshow:") {
            args.push("-f".to_string());
            args.push("dshow".to_string());
            input_path = spec.to_string();
        }
    }

    if source_kind == SourceKind::LiveStream && SourceKind::is_rtsp(path) {
        args.push("-rtsp_transport".to_string());
        args.push("tcp".to_string());
    }

    if source_kind == SourceKind::LiveStream && SourceKind::is_http(path) {
        args.push("-user_agent".to_string());
        args.push(
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
                .to_string(),
        );
        args.push("-reconnect".to_string());
        args.push("1".to_string());
        args.push("-reconnect_streamed".to_string());
        args.push("1".to_string());
        args.push("-reconnect_delay_max".to_string());
        args.push("5".to_string());
    }

    args.push("-i".to_string());
    args.push(input_path);

    let crf = video.quality_knobs.effective_crf();
    let scale = video.quality_knobs.effective_scale();

    if let Some(scale) = scale {
        if scale < 1.0 {
            args.push("-vf".to_string());
            args.push(format!(
                "scale=trunc(iw*{scale:.4}/2)*2:trunc(ih*{scale:.4}/2)*2"
            ));
        }
    } else if let Some(res) = &video.resolution {
        match res.to_ascii_lowercase().split_once('x') {
            Some((w, h)) => {
                args.push("-vf".to_string());
                args.push(format!("scale={w}:{h}"));
            }
            None => warn!("invalid VIDEO_RESOLUTION '{}', using original", res),
        }
    }

    args.extend(
        [
            "-c:v",
            "libx264",
            "-profile:v",
            "baseline",
            "-level",
            "3.1",
            "-pix_fmt",
            "yuv420p",
            "-preset",
            "ultrafast",
            "-tune",
            "zerolatency",
        ]
        .map(String::from),
    );
    args.push("-crf".to_string());
    args.push(crf.to_string());
    args.push("-g".to_string());
    args.push(video.fps.to_string());
    args.push("-r".to_string());
    args.push(video.fps.to_string());

    args.extend(
        [
            "-c:a", "aac", "-ac", "2", "-ar", "44100",
        ]
        .map(String::from),
    );
    args.push("-b:a".to_string());
    args.push(video.audio_bitrate.clone());

    args.extend(
        [
            "-f",
            "mp4",
            "-movflags",
            "frag_keyframe+empty_moov+default_base_moof",
        ]
        .map(String::from),
    );
    args.push("-frag_duration".to_string());
    args.push("500000".to_string());
    args.push("pipe:1".to_string());

    args
}

#[cfg(unix)]
mod child_death {
    use std::io;
    use std::os::unix::process::CommandExt;
    use tokio::process::Command;

    /// Ensures the spawned child is SIGKILLed by the kernel if this process
    /// dies first, via `prctl(PR_SET_PDEATHSIG, SIGKILL)` in the child after
    /// fork but before exec.
    pub fn die_with_parent(cmd: &mut Command) {
        unsafe {
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
}

#[cfg(not(unix))]
mod child_death {
    use tokio::process::Command;

    pub fn die_with_parent(_cmd: &mut Command) {
        // No kernel-level parent-death signal outside Linux. `kill_on_drop`
        // on the `Command` plus the `Broadcaster`'s own `stop()` path cover
        // orderly shutdown; an unclean process exit may leave the child
        // running, same as the original Python implementation on non-Linux.
    }

    pub fn track_pid(_pid: u32) {}

    pub fn untrack_pid(_pid: u32) {}
}

fn classify_stderr_line(line: &str) {
    let lower = line.to_ascii_lowercase();
    if ["error", "fatal", "failed", "invalid"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        error!("transcoder: {}", line);
    } else if lower.contains("warning") {
        warn!("transcoder: {}", line);
    } else {
        debug!("transcoder: {}", line);
    }
}

pub struct Broadcaster {
    state: AtomicState,
    stats: StreamStats,
    stop_tx: watch::Sender<bool>,
    connection_manager: Arc<ConnectionManager>,
    video: VideoConfig,
    transcoder_bin: String,
}

impl Broadcaster {
    pub fn new(
        connection_manager: Arc<ConnectionManager>,
        video: VideoConfig,
        transcoder_bin: String,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Broadcaster {
            state: AtomicState::new(BroadcasterState::Stopped),
            stats: StreamStats::new(),
            stop_tx,
            connection_manager,
            video,
            transcoder_bin,
        })
    }

    pub fn state(&self) -> BroadcasterState {
        self.state.load()
    }

    pub fn is_running(&self) -> bool {
        self.state() == BroadcasterState::Running
    }

    pub fn stats(&self) -> BroadcasterStats {
        BroadcasterStats {
            state: self.state(),
            running: self.is_running(),
            stream: self.stats.snapshot(),
        }
    }

    pub fn video_config(&self) -> &VideoConfig {
        &self.video
    }

    /// Idempotent: spawns the supervision loop if not already
    /// starting/running.
    pub fn start(self: &Arc<Self>) -> bool {
        match self.state() {
            BroadcasterState::Running | BroadcasterState::Starting => return true,
            _ => {}
        }

        self.state.store(BroadcasterState::Starting);
        let mut stop_rx = self.stop_tx.subscribe();
        let this = Arc::clone(self);

        tokio::spawn(async move {
            this.state.store(BroadcasterState::Running);
            info!(
                "broadcaster started: source={} kind={:?}",
                this.video.file_path,
                this.video.source_kind()
            );

            let mut backoff = MIN_BACKOFF;

            loop {
                if *stop_rx.borrow() {
                    break;
                }

                let cycle_start = Instant::now();
                this.stats.reset_cycle();

                match this.run_cycle(&mut stop_rx).await {
                    Ok(()) => {}
                    Err(e) => warn!("broadcast cycle error: {}", e),
                }

                if *stop_rx.borrow() {
                    break;
                }

                let cycle_duration = cycle_start.elapsed();
                if cycle_duration >= HEALTHY_CYCLE_THRESHOLD {
                    backoff = MIN_BACKOFF;
                } else {
                    warn!(
                        "transcoder exited after {:.1}s, restarting in {:.0}s",
                        cycle_duration.as_secs_f64(),
                        backoff.as_secs_f64()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = stop_rx.changed() => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }

            this.state.store(BroadcasterState::Stopped);
            info!("broadcaster stopped");
        });

        true
    }

    /// Cooperative shutdown: signals the supervisor, kills the child if one
    /// is alive, and waits for the supervision task to observe the signal.
    pub async fn stop(&self) {
        if self.state() == BroadcasterState::Stopped {
            return;
        }
        self.state.store(BroadcasterState::Stopping);
        let _ = self.stop_tx.send(true);

        // Give the supervision loop a moment to notice and tear the child
        // down; it owns the child handle so we can't kill it directly here.
        let mut waited = Duration::ZERO;
        let step = Duration::from_millis(50);
        while self.state() != BroadcasterState::Stopped && waited < Duration::from_secs(5) {
            tokio::time::sleep(step).await;
            waited += step;
        }
    }

    async fn run_cycle(&self, stop_rx: &mut watch::Receiver<bool>) -> anyhow::Result<()> {
        let args = build_args(&self.video);
        let mut cmd = Command::new(&self.transcoder_bin);
        cmd.args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        child_death::die_with_parent(&mut cmd);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        if let Some(pid) = pid {
            info!("transcoder spawned: pid={}", pid);
            #[cfg(not(unix))]
            child_death::track_pid(pid);
        }

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let stderr_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => classify_stderr_line(line.trim_end()),
                }
            }
        });

        let read_result = self.read_and_broadcast(stdout, stop_rx).await;

        let _ = child.kill().await;
        let wait_result = tokio::time::timeout(CHILD_EXIT_WAIT, child.wait()).await;
        match wait_result {
            Ok(Ok(status)) => debug!("transcoder exited: {}", status),
            Ok(Err(e)) => warn!("transcoder wait() failed: {}", e),
            Err(_) => warn!("transcoder did not exit within {:?}", CHILD_EXIT_WAIT),
        }

        if let Some(pid) = pid {
            #[cfg(not(unix))]
            child_death::untrack_pid(pid);
            let _ = pid;
        }

        stderr_task.abort();
        read_result
    }

    async fn read_and_broadcast(
        &self,
        mut stdout: impl tokio::io::AsyncRead + Unpin,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut init_buf = BytesMut::new();
        let mut init_captured = false;
        let mut read_buf = vec![0u8; READ_CHUNK_SIZE];

        loop {
            let n = tokio::select! {
                _ = stop_rx.changed() => return Ok(()),
                result = stdout.read(&mut read_buf) => result?,
            };

            if n == 0 {
                return Ok(());
            }

            if !init_captured {
                init_buf.extend_from_slice(&read_buf[..n]);
                match find_init_boundary(&init_buf) {
                    BoundaryResult::NeedMoreData => continue,
                    BoundaryResult::Fatal => {
                        anyhow::bail!("fatal parse error in init phase");
                    }
                    BoundaryResult::Found(boundary) => {
                        let candidate = init_buf.split_to(boundary).freeze();
                        info!("init segment captured ({} bytes)", candidate.len());
                        self.connection_manager.publish_init(candidate).await;
                        init_captured = true;

                        let leftover = init_buf.split().freeze();
                        if !leftover.is_empty() {
                            self.stats.record_chunk(leftover.len());
                            self.connection_manager.broadcast(leftover).await;
                        }
                    }
                }
                continue;
            }

            let chunk = Bytes::copy_from_slice(&read_buf[..n]);
            self.stats.record_chunk(chunk.len());
            self.connection_manager.broadcast(chunk).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QualityKnobs;

    fn video(file_path: &str) -> VideoConfig {
        VideoConfig {
            file_path: file_path.to_string(),
            fps: 30,
            audio_bitrate: "128k".to_string(),
            resolution: None,
            chunk_buffer_size: 64,
            quality_knobs: QualityKnobs { crf: 23, quality: None },
            growing_file_hint: false,
        }
    }

    #[test]
    fn file_source_gets_pacing_and_loop_flags() {
        let args = build_args(&video("video.mp4"));
        assert!(args.windows(1).any(|w| w[0] == "-re"));
        assert!(args
            .windows(2)
            .any(|w| w[0] == "-stream_loop" && w[1] == "-1"));
    }

    #[test]
    fn live_rtsp_source_skips_pacing_and_loop_but_forces_tcp() {
        let args = build_args(&video("rtsp://host/stream"));
        assert!(!args.iter().any(|a| a == "-re"));
        assert!(!args.iter().any(|a| a == "-stream_loop"));
        assert!(args
            .windows(2)
            .any(|w| w[0] == "-rtsp_transport" && w[1] == "tcp"));
    }

    #[test]
    fn remote_http_source_gets_pacing_but_not_loop() {
        let args = build_args(&video("http://host/video.mp4"));
        assert!(args.iter().any(|a| a == "-re"));
        assert!(!args.iter().any(|a| a == "-stream_loop"));
        assert!(args.iter().any(|a| a == "-user_agent"));
        assert!(args.iter().any(|a| a == "-reconnect"));
    }

    #[test]
    fn linux_device_gets_v4l2_format_and_framerate() {
        let args = build_args(&video("/dev/video0"));
        assert!(args.windows(2).any(|w| w[0] == "-f" && w[1] == "v4l2"));
        assert!(args.iter().any(|a| a == "-framerate"));
        assert!(args.iter().any(|a| a == "/dev/video0"));
    }

    #[test]
    fn avfoundation_device_strips_prefix_from_input_path() {
        let args = build_args(&video("avfoundation:0:0"));
        assert!(args
            .windows(2)
            .any(|w| w[0] == "-f" && w[1] == "avfoundation"));
        let i_pos = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i_pos + 1], "0:0");
    }

    #[test]
    fn output_args_are_fixed_baseline_h264_aac() {
        let args = build_args(&video("video.mp4"));
        assert!(args.windows(2).any(|w| w[0] == "-profile:v" && w[1] == "baseline"));
        assert!(args.windows(2).any(|w| w[0] == "-level" && w[1] == "3.1"));
        assert!(args.windows(2).any(|w| w[0] == "-pix_fmt" && w[1] == "yuv420p"));
        assert!(args.windows(2).any(|w| w[0] == "-c:a" && w[1] == "aac"));
        assert!(args
            .windows(2)
            .any(|w| w[0] == "-movflags" && w[1].contains("empty_moov")));
    }

    #[test]
    fn quality_scalar_overrides_explicit_crf_and_inserts_scale_filter() {
        let mut v = video("video.mp4");
        v.quality_knobs = QualityKnobs { crf: 23, quality: Some(0.0) };
        let args = build_args(&v);
        let crf_pos = args.iter().position(|a| a == "-crf").unwrap();
        assert_eq!(args[crf_pos + 1], "40");
        assert!(args.iter().any(|a| a == "-vf" || a.starts_with("scale=")));
    }

    #[test]
    fn full_scale_quality_omits_scale_filter() {
        let mut v = video("video.mp4");
        v.quality_knobs = QualityKnobs { crf: 23, quality: Some(1.0) };
        let args = build_args(&v);
        assert!(!args.iter().any(|a| a == "-vf"));
    }

    #[test]
    fn explicit_resolution_used_when_quality_unset() {
        let mut v = video("video.mp4");
        v.resolution = Some("1280x720".to_string());
        let args = build_args(&v);
        assert!(args.iter().any(|a| a == "scale=1280:720"));
    }

    #[tokio::test]
    async fn broadcaster_stop_on_never_started_is_a_noop() {
        let mgr = ConnectionManager::new(4);
        let broadcaster = Broadcaster::new(mgr, video("video.mp4"), "ffmpeg".to_string());
        broadcaster.stop().await;
        assert_eq!(broadcaster.state(), BroadcasterState::Stopped);
    }
}
