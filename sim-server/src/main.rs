use std::{net::SocketAddr, path::PathBuf, process, sync::Arc};

use anyhow::Result;
use clap::Parser;
use sim_core::{
    config::{RawConfig, SimConfiguration},
    metrics::SimulationResponse,
    sim::Simulation,
};
use tokio::sync::{oneshot, Mutex};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};
use warp::{http::StatusCode, Filter, Rejection, Reply};

#[derive(Parser)]
struct Args {
    /// Port to listen on.
    #[clap(short, long, default_value_t = 8080)]
    port: u16,
    /// Where the text report is written after each run.
    #[clap(long, default_value = "simulation_report.txt")]
    report: PathBuf,
}

struct ServerState {
    /// One simulation at a time; concurrent requests queue here.
    simulation_lock: Mutex<()>,
    report_path: PathBuf,
}

#[derive(Debug)]
struct InvalidConfig(String);
impl warp::reject::Reject for InvalidConfig {}

#[derive(Debug)]
struct SimulationFailed(String);
impl warp::reject::Reject for SimulationFailed {}

fn routes(
    state: Arc<ServerState>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let with_state = warp::any().map(move || state.clone());

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| warp::reply::json(&"simulation server is running"));

    let simulate = warp::path("simulate")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state.clone())
        .and_then(|state: Arc<ServerState>| async move {
            info!("running simulation with the default configuration");
            run_simulation(SimConfiguration::default(), state)
                .await
                .map(|response| warp::reply::json(&response))
                .map_err(|e| warp::reject::custom(SimulationFailed(format!("{e:#}"))))
        });

    let simulate_with_config = warp::path("simulate-with-config")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state)
        .and_then(|raw: RawConfig, state: Arc<ServerState>| async move {
            let config = SimConfiguration::build(raw)
                .map_err(|e| warp::reject::custom(InvalidConfig(format!("{e:#}"))))?;
            info!("running simulation with a custom configuration");
            run_simulation(config, state)
                .await
                .map(|response| warp::reply::json(&response))
                .map_err(|e| warp::reject::custom(SimulationFailed(format!("{e:#}"))))
        });

    let cors = warp::cors()
        .allow_origin("http://localhost:3000")
        .allow_methods(vec!["GET", "POST", "OPTIONS"])
        .allow_headers(vec!["Content-Type"]);

    health
        .or(simulate)
        .or(simulate_with_config)
        .recover(handle_rejection)
        .with(cors)
        .with(warp::log("sim_server"))
}

async fn run_simulation(
    config: SimConfiguration,
    state: Arc<ServerState>,
) -> Result<SimulationResponse> {
    let _guard = state.simulation_lock.lock().await;
    let report_path = state.report_path.clone();
    let response = tokio::task::spawn_blocking(move || -> Result<SimulationResponse> {
        let mut simulation = Simulation::new(config.clone());
        simulation.run()?;
        let metrics = simulation.metrics();
        // a failed report write is logged, not surfaced; the caller still
        // gets the structured response
        match metrics.write_report(&config, &report_path) {
            Ok(()) => info!("report written to {}", report_path.display()),
            Err(e) => warn!("failed to write report: {e:#}"),
        }
        Ok(metrics.response(&config))
    })
    .await??;
    Ok(response)
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, std::convert::Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if let Some(InvalidConfig(reason)) = err.find() {
        (
            StatusCode::BAD_REQUEST,
            format!("invalid configuration: {reason}"),
        )
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (
            StatusCode::BAD_REQUEST,
            format!("failed to parse configuration: {e}"),
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed".to_string(),
        )
    } else if let Some(SimulationFailed(reason)) = err.find() {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("simulation failed: {reason}"),
        )
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal server error".to_string(),
        )
    };
    Ok(warp::reply::with_status(message, status))
}

#[tokio::main]
async fn main() -> Result<()> {
    let fmt_layer = tracing_subscriber::fmt::layer().compact().without_time();
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .init();

    let args = Args::parse();
    let state = Arc::new(ServerState {
        simulation_lock: Mutex::new(()),
        report_path: args.report,
    });

    // Handle ctrl+c (SIGINT) at an application level, so in-flight runs can
    // finish reporting before the listener goes away.
    let (shutdown_sink, shutdown_source) = oneshot::channel();
    let mut shutdown_sink = Some(shutdown_sink);
    ctrlc::set_handler(move || {
        if let Some(sink) = shutdown_sink.take() {
            let _ = sink.send(());
        } else {
            warn!("force quitting");
            process::exit(0);
        }
    })?;

    let addr: SocketAddr = ([0, 0, 0, 0], args.port).into();
    let (addr, server) = warp::serve(routes(state)).bind_with_graceful_shutdown(addr, async {
        let _ = shutdown_source.await;
    });
    info!("server listening on {addr}");
    server.await;
    info!("server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_state() -> Arc<ServerState> {
        Arc::new(ServerState {
            simulation_lock: Mutex::new(()),
            report_path: std::env::temp_dir().join("sim_server_test_report.txt"),
        })
    }

    fn small_config() -> serde_json::Value {
        json!({
            "numNodes": 10, "numShards": 2, "numOperators": 2,
            "simulationTime": 6, "timeStep": 1,
            "maliciousNodeRatio": 0.1, "lotteryWinProbability": 0.2,
            "maliciousNodeMultiplier": 5, "blockProductionInterval": 3,
            "transactionsPerBlock": 100, "blockSize": 100000,
            "blockHeaderSize": 512, "erHeaderSize": 256, "erBodySize": 1024,
            "networkBandwidth": 100,
            "minNetworkDelayMean": 10.0, "maxNetworkDelayMean": 20.0,
            "minNetworkDelayStd": 1.0, "maxNetworkDelayStd": 2.0,
            "minGossipFanout": 2, "maxGossipFanout": 3,
            "maxP2PConnections": 3, "timeOut": 100,
            "numBlocksToDownload": 3,
            "attackStartTime": 2, "attackEndTime": 4
        })
    }

    #[tokio::test]
    async fn should_reply_to_health_checks() {
        let response = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&routes(test_state()))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn should_answer_cors_preflight() {
        let response = warp::test::request()
            .method("OPTIONS")
            .path("/simulate-with-config")
            .header("origin", "http://localhost:3000")
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "content-type")
            .reply(&routes(test_state()))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "http://localhost:3000"
        );
    }

    #[tokio::test]
    async fn should_reject_the_wrong_method() {
        let response = warp::test::request()
            .method("GET")
            .path("/simulate-with-config")
            .reply(&routes(test_state()))
            .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn should_reject_malformed_bodies() {
        let response = warp::test::request()
            .method("POST")
            .path("/simulate-with-config")
            .header("content-type", "application/json")
            .body(r#"{"numNodes": "many"}"#)
            .reply(&routes(test_state()))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn should_reject_invalid_configurations() {
        let mut config = small_config();
        config["minGossipFanout"] = json!(1);
        let response = warp::test::request()
            .method("POST")
            .path("/simulate-with-config")
            .json(&config)
            .reply(&routes(test_state()))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn should_run_a_small_simulation() {
        let response = warp::test::request()
            .method("POST")
            .path("/simulate-with-config")
            .json(&small_config())
            .reply(&routes(test_state()))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["transactions_per_block"], 100);
        assert!(body["block_production"]["0"]["total_blocks"].is_u64());
        assert!(body["block_production"]["1"]["total_blocks"].is_u64());
        assert!(body["network_metrics"]["block_header_delay_ms"].is_number());
        assert!(body["performance"]["transactions_per_second"].is_number());
    }
}
