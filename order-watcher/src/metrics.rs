use std::net::SocketAddr;

use anyhow::{Context as _, Result as AnyResult};
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server,
};
use prometheus::{Encoder, TextEncoder};
use structopt::StructOpt;
use tracing::info;

#[derive(Clone, Debug, PartialEq, StructOpt)]
pub struct Options {
    /// Address to serve Prometheus metrics on.
    #[structopt(long, env = "METRICS", default_value = "127.0.0.1:9090")]
    pub metrics: SocketAddr,
}

async fn serve_metrics(_request: Request<Body>) -> Result<Response<Body>, hyper::Error> {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    Ok(Response::new(Body::from(buffer)))
}

/// Run the Prometheus metrics HTTP server until cancelled.
pub async fn main(options: Options) -> AnyResult<()> {
    let service = make_service_fn(|_connection| async {
        Ok::<_, hyper::Error>(service_fn(serve_metrics))
    });
    let server = Server::try_bind(&options.metrics)
        .with_context(|| format!("error binding {} for metrics server", options.metrics))?
        .serve(service);
    info!("Serving metrics on http://{}/metrics", options.metrics);
    server.await.context("error in metrics server")?;
    Ok(())
}
