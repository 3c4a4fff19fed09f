//! rosbridge-style WebSocket bridge.
//!
//! [`WsBridge`] connects the in-process [`EventBus`] to external clients:
//!
//! 1. **Ingest** – a client frame
//!    `{"op":"publish","topic":"point_cloud","msg":{...}}` is decoded into a
//!    [`PointCloud<PointXyz>`] and published on the input topic.
//! 2. **Serve** – a client frame `{"op":"subscribe","topic":"point_cloud_with_normals"}`
//!    attaches a bus subscriber for that client; every augmented cloud is
//!    then pushed back as `{"op":"publish","topic":...,"msg":{...}}`.
//!    `{"op":"unsubscribe",...}` detaches it again.
//!
//! A connected but unsubscribed client does not count as demand for the
//! output topic.  Frames with unknown ops, unknown topics or malformed JSON
//! are ignored.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use normalcast_types::{NormalsError, PointCloud, PointNormal, PointXyz};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, Publisher, Subscriber};
use crate::names;

/// Queue depth of the per-client output subscription.
const CLIENT_QUEUE_DEPTH: usize = 10;

/// Queue depth used if the bridge is the first to touch the input topic.
const INGEST_QUEUE_DEPTH: usize = 100;

/// Client → bridge frame.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ClientFrame {
    Publish {
        topic: String,
        msg: serde_json::Value,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
}

/// Bridge → client frame.
#[derive(Debug, Serialize)]
struct OutgoingFrame<'a, T> {
    op: &'static str,
    topic: &'a str,
    msg: &'a T,
}

/// Bridge between WebSocket clients and the internal [`EventBus`].
#[derive(Clone)]
pub struct WsBridge {
    bus: EventBus,
    namespace: String,
    input: Publisher<PointCloud<PointXyz>>,
    output_topic: String,
}

impl WsBridge {
    /// Create a bridge that publishes client clouds on `input_topic` and
    /// serves `output_topic`.  Both names resolve under `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`NormalsError::Channel`] if either topic already carries a
    /// different message type.
    pub fn new(
        bus: EventBus,
        namespace: &str,
        input_topic: &str,
        output_topic: &str,
    ) -> Result<Self, NormalsError> {
        let input_topic = names::resolve(namespace, input_topic);
        let output_topic = names::resolve(namespace, output_topic);
        let input = bus.advertise(&input_topic, INGEST_QUEUE_DEPTH, false)?;
        // Register the output type up front so a mismatch surfaces here.
        drop(bus.subscribe::<PointCloud<PointNormal>>(&output_topic, CLIENT_QUEUE_DEPTH)?);
        Ok(Self {
            bus,
            namespace: names::resolve("/", namespace),
            input,
            output_topic,
        })
    }

    pub fn input_topic(&self) -> &str {
        self.input.topic()
    }

    pub fn output_topic(&self) -> &str {
        &self.output_topic
    }

    // -----------------------------------------------------------------------
    // WebSocket server
    // -----------------------------------------------------------------------

    /// Accept WebSocket clients on `addr` until the listener fails to bind.
    ///
    /// # Errors
    ///
    /// Returns [`NormalsError::Channel`] if the TCP listener cannot be bound.
    pub async fn run(self, addr: SocketAddr) -> Result<(), NormalsError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NormalsError::Channel(format!("ws bind error on {addr}: {e}")))?;
        info!(%addr, input = %self.input_topic(), output = %self.output_topic, "ws bridge listening");
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), NormalsError> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let bridge = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = bridge.handle_ws_client(stream, peer).await {
                            error!(peer = %peer, error = %e, "ws client error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "ws accept error");
                }
            }
        }
    }

    async fn handle_ws_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), NormalsError> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| NormalsError::Channel(format!("ws handshake from {peer}: {e}")))?;
        debug!(peer = %peer, "ws client connected");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let mut subscription: Option<Subscriber<PointCloud<PointNormal>>> = None;

        loop {
            tokio::select! {
                // Forward augmented clouds to the client.
                cloud = next_cloud(&mut subscription) => {
                    let Some(cloud) = cloud else { break };
                    let json = serde_json::to_string(&OutgoingFrame {
                        op: "publish",
                        topic: &self.output_topic,
                        msg: cloud.as_ref(),
                    })
                    .map_err(|e| NormalsError::Serialization(e.to_string()))?;
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                // Handle incoming WebSocket frames.
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(_)) => break,
                        Some(Ok(Message::Text(text))) => {
                            self.handle_incoming_ws_message(text.as_str(), &mut subscription);
                        }
                        _ => {}
                    }
                }
            }
        }

        debug!(peer = %peer, "ws client disconnected");
        Ok(())
    }

    /// Apply one client text frame.
    fn handle_incoming_ws_message(
        &self,
        text: &str,
        subscription: &mut Option<Subscriber<PointCloud<PointNormal>>>,
    ) {
        let frame = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "ignoring malformed ws frame");
                return;
            }
        };

        match frame {
            ClientFrame::Publish { topic, msg } => {
                if names::resolve(&self.namespace, &topic) != self.input_topic() {
                    debug!(%topic, "ignoring publish on unbridged topic");
                    return;
                }
                match serde_json::from_value::<PointCloud<PointXyz>>(msg) {
                    Ok(cloud) => {
                        self.input.publish(cloud);
                    }
                    Err(e) => warn!(%topic, error = %e, "rejecting malformed point cloud"),
                }
            }
            ClientFrame::Subscribe { topic } => {
                if names::resolve(&self.namespace, &topic) != self.output_topic {
                    debug!(%topic, "ignoring subscribe on unbridged topic");
                    return;
                }
                if subscription.is_none() {
                    match self.bus.subscribe(&self.output_topic, CLIENT_QUEUE_DEPTH) {
                        Ok(sub) => {
                            *subscription = Some(sub);
                            debug!(
                                %topic,
                                subscribers = self.bus.subscriber_count(&self.output_topic),
                                "ws client subscribed"
                            );
                        }
                        Err(e) => error!(%topic, error = %e, "ws subscribe failed"),
                    }
                }
            }
            ClientFrame::Unsubscribe { topic } => {
                if names::resolve(&self.namespace, &topic) == self.output_topic {
                    *subscription = None;
                }
            }
        }
    }
}

/// Next cloud for a subscribed client; never resolves while unsubscribed.
async fn next_cloud(
    subscription: &mut Option<Subscriber<PointCloud<PointNormal>>>,
) -> Option<Arc<PointCloud<PointNormal>>> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}
