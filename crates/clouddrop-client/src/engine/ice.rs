//! ICE server selection: fetch, health-check, rank, cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::Deserialize;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::peer_connection::configuration::RTCConfiguration;

use clouddrop_core::constants::{ICE_CACHE_TTL, STUN_PROBE_TIMEOUT};
use clouddrop_core::protocol::IceServerEntry;
use clouddrop_core::{Error, Result};

use super::rtc;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IceServersResponse {
    ice_servers: Vec<IceServerEntry>,
}

struct RankedList {
    servers: Vec<IceServerEntry>,
    ranked_at: Instant,
}

/// Fetches the hub's ICE server list, probes the STUN servers, and caches
/// the latency-ranked result.
///
/// TURN servers are never probed (allocation requires auth and costs the
/// operator); they are prepended as-is. A hard-coded fallback list covers an
/// unreachable endpoint.
pub struct IceProvider {
    http: reqwest::Client,
    api_base: String,
    cache: Mutex<Option<RankedList>>,
}

impl IceProvider {
    pub fn new(api_base: String) -> Self {
        IceProvider {
            http: reqwest::Client::new(),
            api_base,
            cache: Mutex::new(None),
        }
    }

    /// The ranked server list, refreshed when the cache has expired.
    pub async fn ranked_servers(&self) -> Vec<IceServerEntry> {
        let mut cache = self.cache.lock().await;
        if let Some(ranked) = cache.as_ref() {
            if ranked.ranked_at.elapsed() < ICE_CACHE_TTL {
                return ranked.servers.clone();
            }
        }

        let fetched = match self.fetch().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("ICE server fetch failed, using fallback list: {e}");
                Self::fallback_servers()
            }
        };
        let ranked = rank_by_latency(fetched).await;
        *cache = Some(RankedList {
            servers: ranked.clone(),
            ranked_at: Instant::now(),
        });
        ranked
    }

    async fn fetch(&self) -> Result<Vec<IceServerEntry>> {
        let url = format!("{}/api/ice-servers", self.api_base);
        let response: IceServersResponse = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::transport(format!("GET {url}: {e}")))?
            .json()
            .await
            .map_err(|e| Error::transport(format!("ICE server response: {e}")))?;
        Ok(response.ice_servers)
    }

    /// Used when `/api/ice-servers` is unreachable.
    pub fn fallback_servers() -> Vec<IceServerEntry> {
        vec![IceServerEntry {
            urls: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
            ],
            username: None,
            credential: None,
        }]
    }
}

/// Probe every STUN entry in parallel and sort the responders ascending by
/// round-trip latency; TURN entries are prepended unprobed. Servers that
/// never produce an srflx candidate within the cap are dropped.
async fn rank_by_latency(entries: Vec<IceServerEntry>) -> Vec<IceServerEntry> {
    let (turn, stun): (Vec<_>, Vec<_>) = entries.into_iter().partition(rtc::is_turn_entry);

    let probes = stun.into_iter().map(|entry| async move {
        let latency = probe_stun(&entry).await;
        (entry, latency)
    });
    let mut probed: Vec<(IceServerEntry, Duration)> = join_all(probes)
        .await
        .into_iter()
        .filter_map(|(entry, latency)| latency.map(|l| (entry, l)))
        .collect();
    probed.sort_by_key(|(_, latency)| *latency);

    let mut ranked = turn;
    ranked.extend(probed.into_iter().map(|(entry, latency)| {
        debug!(urls = ?entry.urls, ?latency, "STUN server ranked");
        entry
    }));
    ranked
}

/// Open a probe connection against a single STUN server and wait for the
/// first server-reflexive candidate, measuring the round trip.
async fn probe_stun(entry: &IceServerEntry) -> Option<Duration> {
    let started = Instant::now();
    let api = rtc::build_api().ok()?;
    let pc = api
        .new_peer_connection(RTCConfiguration {
            ice_servers: rtc::to_rtc_ice_servers(std::slice::from_ref(entry)),
            ..Default::default()
        })
        .await
        .ok()?;
    let pc = Arc::new(pc);

    let (tx, rx) = oneshot::channel();
    let tx = Arc::new(std::sync::Mutex::new(Some(tx)));
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            if let Some(candidate) = candidate {
                if candidate.typ == RTCIceCandidateType::Srflx {
                    if let Some(tx) = tx.lock().ok().and_then(|mut guard| guard.take()) {
                        let _ = tx.send(());
                    }
                }
            }
        })
    }));

    // Gathering only starts once a local description exists.
    let _probe_channel = pc.create_data_channel("probe", None).await.ok()?;
    let offer = pc.create_offer(None).await.ok()?;
    pc.set_local_description(offer).await.ok()?;

    let outcome = timeout(STUN_PROBE_TIMEOUT, rx).await;
    let latency = started.elapsed();
    let _ = pc.close().await;

    match outcome {
        Ok(Ok(())) => Some(latency),
        _ => None,
    }
}
