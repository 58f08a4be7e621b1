/*!
 * @file health.rs
 * @brief Debug HTTP endpoint: liveness, readiness and metrics
 */

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::broadcast;
use tracing::{info, warn};
use warp::Filter;

/// Serves `/debug/livez`, `/debug/readyz` and `/debug/metrics` on the debug
/// address. Runs until the shutdown broadcast fires.
pub fn spawn(
    addr: SocketAddr,
    prometheus: PrometheusHandle,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    let livez = warp::path!("debug" / "livez").map(|| "ok");
    let readyz = warp::path!("debug" / "readyz").map(|| "ok");
    let metrics_route = warp::path!("debug" / "metrics").map(move || prometheus.render());
    let routes = livez.or(readyz).or(metrics_route);

    tokio::spawn(async move {
        match warp::serve(routes).try_bind_with_graceful_shutdown(addr, async move {
            let _ = shutdown.recv().await;
        }) {
            Ok((bound, server)) => {
                info!(addr = %bound, "debug endpoint listening");
                server.await;
            }
            Err(e) => {
                warn!(addr = %addr, error = %e, "failed to bind debug endpoint");
            }
        }
    })
}
