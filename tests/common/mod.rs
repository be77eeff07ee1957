//! In-process WebSocket stub shared by the speech-to-speech tests.
//!
//! Accepts a single connection, parses every framed text message the
//! client sends into JSON for the test to inspect, and lets the test
//! push frames back down the wire. `kill()` drops the TCP stream with
//! no close handshake to simulate transport death.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

pub struct WsStub {
    pub url: String,
    frames: mpsc::UnboundedReceiver<serde_json::Value>,
    outbound: mpsc::UnboundedSender<String>,
    kill: mpsc::UnboundedSender<()>,
    headers: Arc<Mutex<HashMap<String, String>>>,
}

impl WsStub {
    /// Next client frame, parsed. Panics after five quiet seconds.
    pub async fn next_frame(&mut self) -> serde_json::Value {
        tokio::time::timeout(Duration::from_secs(5), self.frames.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("stub connection ended")
    }

    /// True if no further client frame arrives within the window.
    pub async fn assert_no_frame(&mut self, window: Duration) {
        let got = tokio::time::timeout(window, self.frames.recv()).await;
        assert!(
            matches!(got, Err(_) | Ok(None)),
            "unexpected client frame: {got:?}"
        );
    }

    /// Push a frame to the client.
    pub fn send(&self, frame: serde_json::Value) {
        self.outbound
            .send(frame.to_string())
            .expect("stub task gone");
    }

    /// Drop the connection without a close handshake.
    pub fn kill(&self) {
        let _ = self.kill.send(());
    }

    /// Handshake header by (lower-case) name.
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers.lock().unwrap().get(name).cloned()
    }
}

pub async fn start_ws_stub() -> WsStub {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (frame_tx, frames) = mpsc::unbounded_channel();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let (kill, mut kill_rx) = mpsc::unbounded_channel::<()>();
    let headers = Arc::new(Mutex::new(HashMap::new()));

    let header_sink = headers.clone();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let capture = header_sink.clone();
        let mut ws = tokio_tungstenite::accept_hdr_async(
            stream,
            move |req: &Request, resp: Response| {
                let mut map = capture.lock().unwrap();
                for (name, value) in req.headers() {
                    map.insert(
                        name.as_str().to_string(),
                        value.to_str().unwrap_or_default().to_string(),
                    );
                }
                Ok(resp)
            },
        )
        .await
        .unwrap();

        let mut outbound_open = true;
        loop {
            tokio::select! {
                _ = kill_rx.recv() => return,
                msg = ws.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
                            let _ = frame_tx.send(value);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => return,
                },
                out = outbound_rx.recv(), if outbound_open => match out {
                    Some(text) => {
                        if ws.send(Message::Text(text.into())).await.is_err() {
                            return;
                        }
                    }
                    None => outbound_open = false,
                },
            }
        }
    });

    WsStub {
        url: format!("ws://{addr}"),
        frames,
        outbound,
        kill,
        headers,
    }
}

/// Receive with a generous timeout; `None` means the channel closed.
pub async fn recv_timeout<T>(rx: &mut mpsc::Receiver<T>) -> Option<T> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting on channel")
}

/// Wait for the channel to close, discarding queued items.
pub async fn wait_closed<T>(rx: &mut mpsc::Receiver<T>) {
    while recv_timeout(rx).await.is_some() {}
}
