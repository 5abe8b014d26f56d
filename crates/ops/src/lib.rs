//! Skiff ops: imperative pod operations behind a resolved service target.
//! Log streaming and port-forward tunnels, plus a session table tracking what is open.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{api::{Api, LogParams}, Client};
use metrics::counter;
use serde::{Deserialize, Serialize};
use skiff_core::{PortMapping, Target};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub mod session;

pub use session::{SessionError, SessionId, SessionInfo, SessionKind, SessionState, SessionTable};

/// A single chunk of log output (line oriented for now).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogChunk {
    pub line: String,
}

/// Options for `logs` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogOptions {
    /// Follow the stream (default: true)
    pub follow: bool,
    /// Tail last n lines (server-side), if supported
    pub tail_lines: Option<i64>,
    /// Only return logs newer than X seconds
    pub since_seconds: Option<i64>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self { follow: true, tail_lines: None, since_seconds: None }
    }
}

/// Cancellation handle for an in-flight operation.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub(crate) fn pair() -> (CancelHandle, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel::<()>();
        (CancelHandle { tx: Some(tx) }, rx)
    }

    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() { let _ = tx.send(()); }
    }
}

/// Result of starting a streaming operation.
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

/// Tunnel lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardEvent {
    /// Listener bound; carries the local address.
    Ready(String),
    /// A client connected; carries the peer address.
    Connected(String),
    Closed,
    Error(String),
}

/// Pod operations a resolved target needs.
#[async_trait::async_trait]
pub trait PodOps: Send + Sync {
    /// Stream logs from a pod/container.
    async fn logs(&self, namespace: &str, pod: &str, container: Option<&str>, opts: LogOptions) -> Result<StreamHandle<LogChunk>>;

    /// Listen on `ports.local` and tunnel each connection to `ports.remote` on the pod.
    async fn port_forward(&self, namespace: &str, pod: &str, ports: PortMapping) -> Result<StreamHandle<ForwardEvent>>;

    async fn target_logs(&self, target: &Target, container: Option<&str>, opts: LogOptions) -> Result<StreamHandle<LogChunk>> {
        self.logs(target.namespace(), &target.pod_name(), container, opts).await
    }

    async fn target_port_forward(&self, target: &Target, ports: PortMapping) -> Result<StreamHandle<ForwardEvent>> {
        self.port_forward(target.namespace(), &target.pod_name(), ports).await
    }
}

/// Default implementation using kube-rs client APIs.
#[derive(Debug, Default)]
pub struct KubeOps;

impl KubeOps {
    pub fn new() -> Self { Self }
}

#[async_trait::async_trait]
impl PodOps for KubeOps {
    async fn logs(&self, namespace: &str, pod: &str, container: Option<&str>, opts: LogOptions) -> Result<StreamHandle<LogChunk>> {
        let client = Client::try_default().await?;
        let api: Api<Pod> = Api::namespaced(client, namespace);

        let mut lp = LogParams::default();
        lp.follow = opts.follow;
        lp.tail_lines = opts.tail_lines;
        lp.since_seconds = opts.since_seconds;
        if let Some(c) = container { lp.container = Some(c.to_string()); }

        let (tx, rx) = mpsc::channel::<LogChunk>(queue_cap(std::env::var("SKIFF_OPS_QUEUE_CAP").ok().as_deref()));
        let (cancel, cancel_rx) = CancelHandle::pair();

        let pod_name = pod.to_string();
        let container_label = container.map(|s| s.to_string());
        tokio::spawn(async move {
            use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};
            info!(pod = %pod_name, container = ?container_label, follow = lp.follow, tail = ?lp.tail_lines, since = ?lp.since_seconds, "logs stream starting");
            let reader = match api.log_stream(&pod_name, &lp).await {
                Ok(r) => r,
                Err(e) => { warn!(pod = %pod_name, error = %e, "log_stream failed to open"); return; }
            };
            // futures::io::AsyncRead -> tokio::io::AsyncRead -> Stream<Bytes>
            let stream = ReaderStream::new(reader.compat());
            let dropped = pump_bytes_to_lines(stream, tx, cancel_rx, Some(&pod_name)).await;
            if dropped > 0 {
                warn!(pod = %pod_name, dropped, "log lines dropped; consumer fell behind");
            }
        });

        Ok(StreamHandle { rx, cancel })
    }

    async fn port_forward(&self, namespace: &str, pod: &str, ports: PortMapping) -> Result<StreamHandle<ForwardEvent>> {
        KubeOps::pf_internal(namespace, pod, ports).await
    }
}

const DEFAULT_QUEUE_CAP: usize = 1024;

/// Log channel capacity from `SKIFF_OPS_QUEUE_CAP`. Zero or garbage falls back to the default.
fn queue_cap(raw: Option<&str>) -> usize {
    raw.and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|cap| *cap > 0)
        .unwrap_or(DEFAULT_QUEUE_CAP)
}

impl KubeOps {
    async fn pf_internal(namespace: &str, pod: &str, ports: PortMapping) -> Result<StreamHandle<ForwardEvent>> {
        let client = Client::try_default().await?;
        let api: Api<Pod> = Api::namespaced(client, namespace);
        api.get(pod).await.with_context(|| format!("looking up pod {}/{}", namespace, pod))?;

        let bind_addr = std::env::var("SKIFF_PF_BIND").unwrap_or_else(|_| "127.0.0.1".to_string());
        let listener = TcpListener::bind((bind_addr.as_str(), ports.local))
            .await
            .with_context(|| format!("binding {}:{}", bind_addr, ports.local))?;
        let actual = listener.local_addr()?;

        let (tx, rx) = mpsc::channel::<ForwardEvent>(16);
        let (cancel, mut cancel_rx) = CancelHandle::pair();
        let _ = tx.send(ForwardEvent::Ready(actual.to_string())).await;
        info!(pod = %pod, ns = %namespace, local = %actual, remote = ports.remote, "port-forward listening");

        let pod = pod.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => { let _ = tx.send(ForwardEvent::Closed).await; break; }
                    accept_res = listener.accept() => {
                        match accept_res {
                            Ok((inbound, peer)) => {
                                counter!("ops_pf_connections_total", 1);
                                let _ = tx.send(ForwardEvent::Connected(peer.to_string())).await;
                                let api = api.clone();
                                let pod = pod.clone();
                                let tx = tx.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = forward_connection(&api, &pod, ports.remote, inbound).await {
                                        warn!(pod = %pod, peer = %peer, error = %e, "port-forward connection failed");
                                        let _ = tx.send(ForwardEvent::Error(format!("{}: {:#}", peer, e))).await;
                                    }
                                });
                            }
                            Err(e) => { let _ = tx.send(ForwardEvent::Error(format!("accept error: {}", e))).await; break; }
                        }
                    }
                }
            }
            info!(pod = %pod, "port-forward listener closed");
        });
        Ok(StreamHandle { rx, cancel })
    }
}

/// One forwarder per connection: a kube port-forward hands out each port stream only once.
async fn forward_connection(api: &Api<Pod>, pod: &str, remote: u16, mut inbound: TcpStream) -> Result<()> {
    let mut pf = api.portforward(pod, &[remote]).await.context("opening port-forward")?;
    let mut upstream = pf
        .take_stream(remote)
        .ok_or_else(|| anyhow!("port {} missing from forwarder", remote))?;
    let (up, down) = tokio::io::copy_bidirectional(&mut inbound, &mut upstream).await?;
    debug!(pod = %pod, bytes_up = up, bytes_down = down, "port-forward connection finished");
    drop(upstream);
    pf.join().await.context("closing port-forward")?;
    Ok(())
}

/// Split a byte stream into lines and push them into the bounded channel.
/// Lines that do not fit are dropped and counted; the count is returned.
/// The last partial line is flushed when the stream ends.
async fn pump_bytes_to_lines<S, E>(stream: S, tx: mpsc::Sender<LogChunk>, mut cancel_rx: oneshot::Receiver<()>, ctx: Option<&str>) -> u64
where
    S: futures::Stream<Item = Result<bytes::Bytes, E>>,
    E: std::fmt::Display,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = bytes::BytesMut::new();
    let mut dropped = 0u64;
    loop {
        tokio::select! {
            _ = &mut cancel_rx => { if let Some(c) = ctx { info!(ctx = %c, "log pump cancelled"); } break; }
            next = stream.next() => {
                match next {
                    Some(Ok(chunk)) => {
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                            let line = buf.split_to(pos);
                            let _ = buf.split_to(1); // drop '\n'
                            if !send_line(&tx, &line) { dropped += 1; }
                        }
                    }
                    Some(Err(e)) => { warn!(ctx = ?ctx, error = %e, "log stream error"); break; }
                    None => break,
                }
            }
        }
    }
    if !buf.is_empty() && !send_line(&tx, &buf) {
        dropped += 1;
    }
    info!(ctx = ?ctx, dropped, "log pump ended");
    dropped
}

/// `false` when the line was dropped.
fn send_line(tx: &mpsc::Sender<LogChunk>, raw: &[u8]) -> bool {
    let line = String::from_utf8_lossy(raw);
    let line = line.strip_suffix('\r').unwrap_or(&line);
    if tx.try_send(LogChunk { line: line.to_string() }).is_err() {
        counter!("ops_log_lines_dropped_total", 1);
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn crlf_split_across_chunks_yields_clean_lines() {
        let (tx, mut rx) = mpsc::channel::<LogChunk>(16);
        let (_cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let chunks = ["GET /he", "alth 200\r", "\n\nready"]
            .into_iter()
            .map(|c| Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from(c)));
        let dropped = pump_bytes_to_lines(stream::iter(chunks), tx, cancel_rx, Some("crlf")).await;
        assert_eq!(dropped, 0);
        let mut out = Vec::new();
        while let Some(c) = rx.recv().await { out.push(c.line); }
        assert_eq!(out, vec!["GET /health 200", "", "ready"]);
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced_not_dropped() {
        let (tx, mut rx) = mpsc::channel::<LogChunk>(4);
        let (_cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let chunks = vec![Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from_static(b"ok \xff\n"))];
        pump_bytes_to_lines(stream::iter(chunks), tx, cancel_rx, None).await;
        let line = rx.recv().await.expect("line").line;
        assert!(line.starts_with("ok "));
        assert!(line.contains('\u{FFFD}'));
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts_overflow() {
        let (tx, mut rx) = mpsc::channel::<LogChunk>(1);
        let (_cancel_tx, cancel_rx) = oneshot::channel::<()>();
        // One chunk: nothing drains the queue while the pump runs.
        let chunks = vec![Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from_static(b"a\nb\nc"))];
        let dropped = pump_bytes_to_lines(stream::iter(chunks), tx, cancel_rx, Some("overflow")).await;
        assert_eq!(dropped, 2);
        assert_eq!(rx.recv().await.map(|c| c.line), Some("a".to_string()));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn nothing_dropped_when_queue_keeps_up() {
        let (tx, mut rx) = mpsc::channel::<LogChunk>(8);
        let (_cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let chunks = vec![Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from_static(b"x\ny\n"))];
        assert_eq!(pump_bytes_to_lines(stream::iter(chunks), tx, cancel_rx, None).await, 0);
        assert_eq!(rx.recv().await.map(|c| c.line), Some("x".to_string()));
    }

    #[test]
    fn queue_cap_rejects_zero_and_garbage() {
        assert_eq!(queue_cap(None), DEFAULT_QUEUE_CAP);
        assert_eq!(queue_cap(Some("0")), DEFAULT_QUEUE_CAP);
        assert_eq!(queue_cap(Some("-4")), DEFAULT_QUEUE_CAP);
        assert_eq!(queue_cap(Some("lots")), DEFAULT_QUEUE_CAP);
        assert_eq!(queue_cap(Some(" 64 ")), 64);
        // The chosen capacity must be usable by the channel constructor.
        let (_tx, _rx) = mpsc::channel::<LogChunk>(queue_cap(Some("0")));
    }

    #[tokio::test]
    async fn stream_error_ends_pump_and_keeps_earlier_lines() {
        let (tx, mut rx) = mpsc::channel::<LogChunk>(8);
        let (_cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let items = vec![
            Ok(bytes::Bytes::from_static(b"first\n")),
            Err(std::io::Error::new(std::io::ErrorKind::Other, "reset")),
            Ok(bytes::Bytes::from_static(b"never\n")),
        ];
        pump_bytes_to_lines(stream::iter(items), tx, cancel_rx, Some("err-test")).await;
        let mut out = Vec::new();
        while let Some(c) = rx.recv().await { out.push(c.line); }
        assert_eq!(out, vec!["first"]);
    }

    #[tokio::test]
    async fn cancel_ends_an_endless_stream_and_closes_the_channel() {
        use std::time::Duration;
        let (tx, mut rx) = mpsc::channel::<LogChunk>(16);
        let (cancel, cancel_rx) = CancelHandle::pair();
        let endless = async_stream::stream! {
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                yield Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from_static(b"tick\n"));
            }
        };
        let pump = tokio::spawn(async move { pump_bytes_to_lines(endless, tx, cancel_rx, Some("cancel")).await });
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        let dropped = tokio::time::timeout(Duration::from_secs(1), pump)
            .await
            .expect("pump still running after cancel")
            .expect("pump task panicked");
        assert_eq!(dropped, 0);

        // The sender went away with the pump, so the receiver drains and then sees the end.
        let mut seen = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
                Ok(Some(c)) => seen.push(c.line),
                Ok(None) => break,
                Err(_) => panic!("channel still open after cancel"),
            }
        }
        assert_eq!(seen, vec!["tick"]);
    }

    #[test]
    fn log_options_follow_by_default() {
        let o = LogOptions::default();
        assert!(o.follow);
        assert_eq!(o.tail_lines, None);
        assert_eq!(o.since_seconds, None);
    }
}
