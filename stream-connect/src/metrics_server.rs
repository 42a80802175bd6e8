//! Prometheus endpoint for the connector.
//!
//! Histograms are bucketed per unit: stage timings are recorded in
//! milliseconds, batch shapes in records or ratios, and HTTP handling in
//! seconds. Every series carries the pipeline as a global label.

use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{
    BuildError, Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder,
};

use crate::kafka::metrics_consts::{BATCH_CONSUMER_BATCH_FILL_RATIO, BATCH_CONSUMER_BATCH_SIZE};
use crate::metrics_consts::{HTTP_REQUESTS_DURATION_SECONDS, HTTP_REQUESTS_TOTAL};

pub const METRICS_PATH: &str = "/metrics";

const MILLIS_SUFFIX: &str = "_duration_ms";
const MILLIS_BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
    60000.0,
];
const SECONDS_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];
const BATCH_SIZE_BUCKETS: &[f64] = &[
    1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];
const RATIO_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 0.75, 0.9, 1.0];

pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Mount the scrape endpoint and request tracking on `router`. Routes added
/// afterwards are not tracked.
pub fn setup_metrics_routes(router: Router, pipeline: &str) -> Result<Router, BuildError> {
    let recorder_handle = metrics_builder(pipeline)?.install_recorder()?;
    Ok(with_metrics_routes(router, recorder_handle))
}

fn with_metrics_routes(router: Router, handle: PrometheusHandle) -> Router {
    router
        .route(
            METRICS_PATH,
            get(move || std::future::ready(handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

pub fn metrics_builder(pipeline: &str) -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .add_global_label("pipeline", pipeline)
        .set_buckets_for_metric(Matcher::Suffix(MILLIS_SUFFIX.to_string()), MILLIS_BUCKETS)?
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUESTS_DURATION_SECONDS.to_string()),
            SECONDS_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Full(BATCH_CONSUMER_BATCH_SIZE.to_string()),
            BATCH_SIZE_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Full(BATCH_CONSUMER_BATCH_FILL_RATIO.to_string()),
            RATIO_BUCKETS,
        )
}

/// Recorder that is not installed globally, for rendering in-process.
pub fn local_recorder(pipeline: &str) -> Result<PrometheusRecorder, BuildError> {
    Ok(metrics_builder(pipeline)?.build_recorder())
}

/// Scrapes are not counted.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let path = match req.extensions().get::<MatchedPath>() {
        Some(matched) => matched.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };
    if path == METRICS_PATH {
        return next.run(req).await;
    }

    let start = Instant::now();
    let method = req.method().to_string();
    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!(HTTP_REQUESTS_TOTAL, &labels).increment(1);
    metrics::histogram!(HTTP_REQUESTS_DURATION_SECONDS, &labels)
        .record(start.elapsed().as_secs_f64());

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics_consts::{ACKNOWLEDGE_DURATION_MS, BATCH_DISPATCH_DURATION_MS};

    fn render(record: impl FnOnce()) -> String {
        let recorder = local_recorder("default").unwrap();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, record);
        handle.render()
    }

    #[test]
    fn test_millisecond_histograms_use_millisecond_buckets() {
        let rendered = render(|| {
            metrics::histogram!(BATCH_DISPATCH_DURATION_MS).record(180.0);
            metrics::histogram!(ACKNOWLEDGE_DURATION_MS, "kind" => "commit").record(40.0);
        });

        assert!(rendered.contains(r#"batch_dispatch_duration_ms_bucket{pipeline="default",le="250"} 1"#));
        assert!(rendered.contains(r#"batch_dispatch_duration_ms_bucket{pipeline="default",le="100"} 0"#));
        assert!(rendered
            .lines()
            .filter(|l| l.starts_with("acknowledge_duration_ms_bucket"))
            .any(|l| l.contains(r#"kind="commit""#) && l.ends_with(r#"le="50"} 1"#)));
    }

    #[test]
    fn test_http_latency_is_bucketed_in_seconds() {
        let rendered = render(|| {
            metrics::histogram!(HTTP_REQUESTS_DURATION_SECONDS, "path" => "/_liveness")
                .record(0.02);
        });

        let buckets: Vec<&str> = rendered
            .lines()
            .filter(|l| l.starts_with("connect_http_request_duration_seconds_bucket"))
            .collect();
        assert!(buckets.iter().any(|l| l.contains(r#"le="0.025"} 1"#)));
        assert!(buckets.iter().any(|l| l.contains(r#"le="0.01"} 0"#)));
        assert!(!buckets.iter().any(|l| l.contains(r#"le="60000""#)));
    }

    #[test]
    fn test_batch_shape_histograms_have_their_own_buckets() {
        let rendered = render(|| {
            metrics::histogram!(BATCH_CONSUMER_BATCH_SIZE).record(300.0);
            metrics::histogram!(BATCH_CONSUMER_BATCH_FILL_RATIO).record(0.3);
        });

        assert!(rendered.contains(r#"batch_consumer_batch_size_bucket{pipeline="default",le="500"} 1"#));
        assert!(rendered.contains(r#"batch_consumer_batch_fill_ratio_bucket{pipeline="default",le="0.5"} 1"#));
        assert!(rendered.contains(r#"batch_consumer_batch_fill_ratio_bucket{pipeline="default",le="0.25"} 0"#));
    }
}
