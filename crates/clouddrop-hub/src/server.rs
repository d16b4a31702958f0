//! HTTP surface of the hub: the `/ws` upgrade and the room API.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use warp::{Filter, Rejection, Reply};

use clouddrop_core::protocol::IceServerEntry;

use crate::room::{RoomRegistry, SetPasswordOutcome};
use crate::session::{run_session, WsQuery};

/// The signaling hub server.
pub struct Hub {
    registry: Arc<RoomRegistry>,
    ice_servers: Arc<Vec<IceServerEntry>>,
}

#[derive(Debug, Deserialize)]
struct RoomQuery {
    room: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckPasswordResponse {
    has_password: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetPasswordBody {
    password_hash: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetPasswordResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IceServersResponse {
    ice_servers: Vec<IceServerEntry>,
}

impl Hub {
    pub fn new(ice_servers: Vec<IceServerEntry>) -> Self {
        Hub {
            registry: Arc::new(RoomRegistry::new()),
            ice_servers: Arc::new(ice_servers),
        }
    }

    /// Built-in STUN defaults, used when no server list is configured.
    pub fn default_ice_servers() -> Vec<IceServerEntry> {
        vec![IceServerEntry {
            urls: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
            ],
            username: None,
            credential: None,
        }]
    }

    /// The complete route tree.
    pub fn routes(&self) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
        let registry = self.registry.clone();
        let ws = warp::path("ws")
            .and(warp::ws())
            .and(warp::query::<WsQuery>())
            .and(warp::addr::remote())
            .map(move |ws: warp::ws::Ws, query: WsQuery, addr: Option<SocketAddr>| {
                let registry = registry.clone();
                ws.on_upgrade(move |socket| run_session(socket, query, addr, registry))
            });

        let ice_servers = self.ice_servers.clone();
        let ice = warp::path!("api" / "ice-servers")
            .and(warp::get())
            .map(move || {
                warp::reply::json(&IceServersResponse {
                    ice_servers: ice_servers.as_ref().clone(),
                })
            });

        let registry = self.registry.clone();
        let check_password = warp::path!("api" / "room" / "check-password")
            .and(warp::get())
            .and(warp::query::<RoomQuery>())
            .and_then(move |query: RoomQuery| {
                let registry = registry.clone();
                async move {
                    let has_password = registry.has_password(&normalize(&query.room)).await;
                    Ok::<_, Rejection>(warp::reply::json(&CheckPasswordResponse { has_password }))
                }
            });

        let registry = self.registry.clone();
        let set_password = warp::path!("api" / "room" / "set-password")
            .and(warp::post())
            .and(warp::query::<RoomQuery>())
            .and(warp::body::json::<SetPasswordBody>())
            .and_then(move |query: RoomQuery, body: SetPasswordBody| {
                let registry = registry.clone();
                async move {
                    let reply = set_room_password(&registry, &query.room, body).await;
                    Ok::<_, Rejection>(warp::reply::json(&reply))
                }
            });

        ws.or(ice).or(check_password).or(set_password)
    }

    /// Bind to an ephemeral or fixed port; returns the bound address and the
    /// serve future. Integration tests embed the hub this way.
    pub fn bind(
        &self,
        addr: impl Into<SocketAddr>,
    ) -> (SocketAddr, impl std::future::Future<Output = ()>) {
        warp::serve(self.routes()).bind_ephemeral(addr)
    }

    /// Serve forever on `addr`.
    pub async fn run(&self, addr: SocketAddr) {
        info!(%addr, "hub listening");
        warp::serve(self.routes()).run(addr).await
    }
}

fn normalize(room: &str) -> String {
    room.trim().to_ascii_uppercase()
}

async fn set_room_password(
    registry: &RoomRegistry,
    room: &str,
    body: SetPasswordBody,
) -> SetPasswordResponse {
    let room = normalize(room);
    if room.len() != 6 || !room.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return SetPasswordResponse {
            success: false,
            error: Some("invalid room code".into()),
        };
    }
    let hash = body.password_hash.to_ascii_lowercase();
    if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return SetPasswordResponse {
            success: false,
            error: Some("password hash must be 64 hex characters".into()),
        };
    }
    match registry.set_password(&room, hash).await {
        SetPasswordOutcome::Set => SetPasswordResponse {
            success: true,
            error: None,
        },
        SetPasswordOutcome::AlreadySet => SetPasswordResponse {
            success: false,
            error: Some("a password is already set for this room".into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(fill: char) -> String {
        std::iter::repeat(fill).take(64).collect()
    }

    #[tokio::test]
    async fn set_password_validates_inputs() {
        let registry = RoomRegistry::new();

        let bad_room = set_room_password(
            &registry,
            "nope",
            SetPasswordBody {
                password_hash: hash('a'),
            },
        )
        .await;
        assert!(!bad_room.success);

        let bad_hash = set_room_password(
            &registry,
            "ABC234",
            SetPasswordBody {
                password_hash: "xyz".into(),
            },
        )
        .await;
        assert!(!bad_hash.success);
    }

    #[tokio::test]
    async fn set_password_is_first_writer_wins() {
        let registry = RoomRegistry::new();
        let first = set_room_password(
            &registry,
            "SECUR3",
            SetPasswordBody {
                password_hash: hash('a'),
            },
        )
        .await;
        assert!(first.success);

        let second = set_room_password(
            &registry,
            "secur3",
            SetPasswordBody {
                password_hash: hash('b'),
            },
        )
        .await;
        assert!(!second.success);
        assert_eq!(registry.password_hash("SECUR3").await, Some(hash('a')));
    }
}
