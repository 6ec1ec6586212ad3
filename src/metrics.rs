//! Prometheus metrics.
//!
//! All collectors live in one [`Metrics`] value registered against a
//! caller-supplied [`Registry`], so every server (and every test) owns its own
//! set.

use std::time::Duration;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use tokio::time::Instant;

use crate::errors::Error;
use crate::grpc::split_method;

pub const ROUTING_STATUS_SUCCESS: &str = "success";
pub const ROUTING_STATUS_ABORTED: &str = "aborted";

#[derive(Clone)]
pub struct Metrics {
    pub routing_duration: HistogramVec,
    pub routing_timeout: IntCounter,
    pub token_limit_exceeded: IntCounter,
    pub grpc_handled: IntCounterVec,
    pub grpc_handling_seconds: HistogramVec,
    pub tunnel_registrations: IntGauge,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Result<Self, Error> {
        let routing_duration = HistogramVec::new(
            HistogramOpts::new(
                "routing_duration_seconds",
                "Time it takes tunnel router to find a suitable tunnel in seconds",
            )
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 20.0]),
            &["status"],
        )?;
        let routing_timeout = IntCounter::with_opts(Opts::new(
            "routing_timeout_total",
            "Total number of requests for which a tunnel was not found in time",
        ))?;
        let token_limit_exceeded = IntCounter::with_opts(Opts::new(
            "token_limit_exceeded_total",
            "Total number of requests rejected by the per-token rate limit",
        ))?;
        let grpc_handled = IntCounterVec::new(
            Opts::new(
                "grpc_server_handled_total",
                "Total number of RPCs completed on the server, regardless of success or failure",
            ),
            &["grpc_service", "grpc_method", "grpc_code"],
        )?;
        let grpc_handling_seconds = HistogramVec::new(
            HistogramOpts::new(
                "grpc_server_handling_seconds",
                "Histogram of response latency of RPCs handled by the server",
            ),
            &["grpc_service", "grpc_method"],
        )?;
        let tunnel_registrations = IntGauge::with_opts(Opts::new(
            "tunnel_registrations",
            "Number of agent tunnels waiting in the registry",
        ))?;

        registry.register(Box::new(routing_duration.clone()))?;
        registry.register(Box::new(routing_timeout.clone()))?;
        registry.register(Box::new(token_limit_exceeded.clone()))?;
        registry.register(Box::new(grpc_handled.clone()))?;
        registry.register(Box::new(grpc_handling_seconds.clone()))?;
        registry.register(Box::new(tunnel_registrations.clone()))?;

        Ok(Self {
            routing_duration,
            routing_timeout,
            token_limit_exceeded,
            grpc_handled,
            grpc_handling_seconds,
            tunnel_registrations,
        })
    }

    pub fn routing_duration(&self, status: &str) -> Histogram {
        self.routing_duration.with_label_values(&[status])
    }

    pub fn observe_rpc(&self, full_method: &str, code: tonic::Code, elapsed: Duration) {
        let (service, method) = split_method(full_method);
        self.grpc_handled
            .with_label_values(&[service, method, &format!("{code:?}")])
            .inc();
        self.grpc_handling_seconds
            .with_label_values(&[service, method])
            .observe(elapsed.as_secs_f64());
    }
}

/// Outermost layer of every gRPC router: counts and times each call.
///
/// The code is read from `grpc-status` on the response head. Streams that end
/// with trailers report their code there instead; those count as `Ok` here.
pub async fn observe(State(metrics): State<Metrics>, request: Request, next: Next) -> Response {
    let method = request.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(request).await;
    let code = response
        .headers()
        .get("grpc-status")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i32>().ok())
        .map_or(tonic::Code::Ok, tonic::Code::from_i32);
    metrics.observe_rpc(&method, code, start.elapsed());
    response
}

/// Prometheus text exposition of `registry`.
pub fn render(registry: &Registry) -> Result<String, Error> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buf)?;
    String::from_utf8(buf).map_err(|e| Error::config(format!("metrics are not UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_render() {
        let registry = Registry::new();
        let m = Metrics::new(&registry).unwrap();
        m.routing_timeout.inc();
        m.routing_duration(ROUTING_STATUS_SUCCESS).observe(0.2);
        m.observe_rpc("/svc.S/M", tonic::Code::NotFound, Duration::from_millis(3));
        let text = render(&registry).unwrap();
        assert!(text.contains("routing_timeout_total 1"));
        assert!(text.contains("routing_duration_seconds_count{status=\"success\"} 1"));
        assert!(text.contains("grpc_code=\"NotFound\""));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        Metrics::new(&registry).unwrap();
        assert!(Metrics::new(&registry).is_err());
    }
}
