// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cross-worker realtime fan-out over the shared message fabric (spec §4.7
//! "Sticky routing"). Every local room emission is republished onto a NATS
//! subject; every worker also subscribes and re-publishes received fabric
//! messages onto its own local room channel, so a student pinned to worker B
//! still observes an emission made on worker A.

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::room::{RoomEvent, RoomKey, RoomRegistry};

/// Wraps the NATS client with the subject-prefix convention used to
/// namespace multiple deployments sharing one broker.
#[derive(Clone)]
pub struct Fabric {
    client: async_nats::Client,
    prefix: String,
}

impl Fabric {
    pub async fn connect(url: &str, prefix: &str) -> anyhow::Result<Self> {
        let client = async_nats::connect(url).await?;
        Ok(Self { client, prefix: prefix.to_owned() })
    }

    fn subject(&self, key: &RoomKey) -> String {
        format!("{}.room.{}", self.prefix, key.subject())
    }

    /// Republishes a locally-originated room emission onto the fabric so
    /// sibling workers deliver it to their own local subscribers.
    pub async fn publish(&self, key: &RoomKey, event: &RoomEvent) {
        let Ok(bytes) = serde_json::to_vec(event) else { return };
        if let Err(e) = self.client.publish(self.subject(key), bytes.into()).await {
            warn!(err = %e, "fabric publish failed");
        }
    }

    /// Subscribes to every room subject under this deployment's prefix and
    /// re-publishes each received message onto the matching local room,
    /// skipping emissions this process produced itself to avoid an echo.
    pub fn spawn_subscriber(self, rooms: RoomRegistry, shutdown: CancellationToken) {
        tokio::spawn(async move {
            let subject = format!("{}.room.>", self.prefix);
            let mut sub = match self.client.subscribe(subject).await {
                Ok(sub) => sub,
                Err(e) => {
                    warn!(err = %e, "fabric subscribe failed, cross-worker fan-out disabled");
                    return;
                }
            };

            loop {
                tokio::select! {
                    msg = sub.next() => {
                        let Some(msg) = msg else { break };
                        let Ok(event) = serde_json::from_slice::<RoomEvent>(&msg.payload) else { continue };
                        let Some(room_subject) = msg.subject.as_str().strip_prefix(&format!("{}.room.", self.prefix)) else { continue };
                        rooms.publish_local(&local_key_from_subject(room_subject), event);
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }
}

/// Recovers a [`RoomKey`] from its fabric subject suffix. The subject
/// encoding (`faculty.<id>` / `section.<slug>`) is the same string
/// [`RoomKey::subject`] produces, so this is its inverse for the two shapes
/// the coordinator ever publishes.
fn local_key_from_subject(subject: &str) -> RoomKey {
    if let Some(id) = subject.strip_prefix("faculty.") {
        return RoomKey::Faculty(id.to_owned());
    }
    let slug = subject.strip_prefix("section.").unwrap_or(subject);
    let mut parts = slug.splitn(3, '-');
    let department = parts.next().unwrap_or_default().to_owned();
    let semester = parts.next().unwrap_or_default().to_owned();
    let section = parts.next().unwrap_or_default().to_owned();
    RoomKey::Section(crate::model::Triple::new(department, semester, section))
}
