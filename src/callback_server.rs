/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{lifecycle::LifecycleStore, stats::StatsLine};
use anyhow::Context;
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use http::StatusCode;
use std::sync::Arc;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

type Store = Arc<LifecycleStore>;

const OK: &str = "ok.\n";

// Transition failures are benign races (late, duplicated or stray callbacks). The store logs
// them and workers always get a 200.
async fn hello(State(store): State<Store>, Path(id): Path<String>) -> &'static str {
    if let Ok(delay) = store.mark_running(&id) {
        let counts = store.counts();
        debug!(
            "marked unit as running: {} [{}] {:.3}s",
            id,
            counts.running,
            delay.as_secs_f64()
        );
    }
    OK
}

async fn alive(State(store): State<Store>, Path(id): Path<String>) -> (StatusCode, &'static str) {
    if store.is_stopping(&id) {
        (StatusCode::INTERNAL_SERVER_ERROR, "stopping.\n")
    } else {
        (StatusCode::OK, OK)
    }
}

async fn bye(State(store): State<Store>, Path(id): Path<String>) -> &'static str {
    if let Ok(delay) = store.mark_stopped(&id) {
        let counts = store.counts();
        debug!(
            "marked unit as stopped: {} [{}] {:.3}s",
            id,
            counts.stopped,
            delay.as_secs_f64()
        );
    }
    OK
}

async fn stats(State(store): State<Store>, Path(label): Path<String>, body: Bytes) -> &'static str {
    let body = String::from_utf8_lossy(&body);
    match body.parse::<StatsLine>() {
        Ok(line) => store.record_process_stats(&label, line),
        Err(err) => warn!("don't know how to parse stats line for {}: {:#}", label, err),
    }
    OK
}

pub fn create_app(store: Store) -> Router {
    Router::new()
        .route("/hello/:id", get(hello))
        .route("/alive/:id", get(alive))
        .route("/bye/:id", get(bye))
        .route("/stats/:label", post(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

/// Serves callbacks on an already bound listener until `token` is cancelled.
pub async fn serve(
    listener: TcpListener,
    store: Store,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let app = create_app(store);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .context("Error serving callbacks")
}

/// Binds `addr` and serves the callback endpoints in the background. Bind failures are returned
/// before anything is spawned, so a benchmark never starts without its callback service.
pub async fn start(
    addr: &str,
    store: Store,
    token: CancellationToken,
) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
    let listener = TcpListener::bind(addr)
        .await
        .context(format!("Unable to bind callback server to {}", addr))?;

    info!("listening for worker callbacks on {}", addr);
    Ok(tokio::spawn(serve(listener, store, token)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        lifecycle::{Phase, WorkerId},
        stats::Counts,
    };
    use std::net::SocketAddr;

    async fn spawn_server(store: Store) -> anyhow::Result<(SocketAddr, CancellationToken)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let token = CancellationToken::new();
        tokio::spawn(serve(listener, store, token.clone()));
        Ok((addr, token))
    }

    #[tokio::test]
    async fn hello_and_bye_drive_transitions() -> anyhow::Result<()> {
        let store = Arc::new(LifecycleStore::new());
        let (addr, token) = spawn_server(store.clone()).await?;
        let id = WorkerId::generate();
        store.request_start(id.clone())?;

        let resp = reqwest::get(format!("http://{}/hello/{}", addr, id)).await?;
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(resp.text().await?, "ok.\n");
        assert_eq!(store.phase_of(id.as_str()), Some(Phase::Running));

        let resp = reqwest::get(format!("http://{}/alive/{}", addr, id)).await?;
        assert_eq!(resp.status(), reqwest::StatusCode::OK);

        store.request_stop(id.as_str())?;
        let resp = reqwest::get(format!("http://{}/alive/{}", addr, id)).await?;
        assert_eq!(resp.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);

        let resp = reqwest::get(format!("http://{}/bye/{}", addr, id)).await?;
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(store.phase_of(id.as_str()), Some(Phase::Stopped));

        token.cancel();
        Ok(())
    }

    #[tokio::test]
    async fn start_reports_a_taken_address() -> anyhow::Result<()> {
        let taken = TcpListener::bind("127.0.0.1:0").await?;
        let addr = taken.local_addr()?.to_string();
        let store = Arc::new(LifecycleStore::new());

        let res = start(&addr, store.clone(), CancellationToken::new()).await;
        let err = res.err().expect("binding a taken address should fail");
        assert!(format!("{:#}", err).contains(&addr));

        let token = CancellationToken::new();
        let server = start("127.0.0.1:0", store, token.clone()).await?;
        token.cancel();
        server.await??;
        Ok(())
    }

    #[tokio::test]
    async fn stray_callbacks_still_succeed() -> anyhow::Result<()> {
        let store = Arc::new(LifecycleStore::new());
        let (addr, token) = spawn_server(store.clone()).await?;

        for path in ["hello", "alive", "bye"] {
            let resp = reqwest::get(format!("http://{}/{}/unknown", addr, path)).await?;
            assert_eq!(resp.status(), reqwest::StatusCode::OK);
        }
        assert_eq!(store.counts(), Counts::default());

        token.cancel();
        Ok(())
    }

    #[tokio::test]
    async fn stats_are_recorded_and_garbage_is_dropped() -> anyhow::Result<()> {
        let store = Arc::new(LifecycleStore::new());
        let (addr, token) = spawn_server(store.clone()).await?;
        let client = reqwest::Client::new();

        for body in ["node-1 3.5 1024\n", "complete garbage", "node-2 0.5 2048"] {
            let resp = client
                .post(format!("http://{}/stats/systemd", addr))
                .body(body)
                .send()
                .await?;
            assert_eq!(resp.status(), reqwest::StatusCode::OK);
        }

        let stats = store.stats();
        assert_eq!(stats.machine_stats.len(), 2);
        let sample = &stats.machine_stats["node-1"][0];
        assert_eq!(sample.process, "systemd");
        assert_eq!(sample.cpu_usage, 3.5);
        assert_eq!(sample.rss, 1024);

        token.cancel();
        Ok(())
    }
}
