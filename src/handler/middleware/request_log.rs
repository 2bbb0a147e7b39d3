use super::clientaddr::ClientAddr;
use axum::{
    body::Body,
    extract::State,
    http::{header::USER_AGENT, Request},
    middleware::Next,
    response::Response,
};
use std::{sync::Arc, time::Instant};
use tracing::field::{Field, Visit};
use tracing::info;
use tracing::Subscriber;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::{FormatTime, SystemTime};
use tracing_subscriber::fmt::{format, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

pub const ACCESS_TARGET: &str = "http.access";

/// Renders `http.access` events as one pipe-separated line; everything else
/// falls through to the default formatter.
#[derive(Clone, Default)]
pub struct AccessLogEventFormat<T = SystemTime> {
    timer: T,
}

impl<T> AccessLogEventFormat<T>
where
    T: FormatTime,
{
    pub fn new(timer: T) -> Self {
        Self { timer }
    }
}

#[derive(Default)]
struct AccessLine {
    client_ip: Option<String>,
    method: Option<String>,
    uri: Option<String>,
    status: Option<u64>,
    cost_ms: Option<f64>,
    user_agent: Option<String>,
}

impl AccessLine {
    fn set(&mut self, name: &str, value: String) {
        match name {
            "client_ip" => self.client_ip = Some(value),
            "method" => self.method = Some(value),
            "uri" => self.uri = Some(value),
            "user_agent" => self.user_agent = Some(value),
            _ => {}
        }
    }

    fn render(&self) -> String {
        format!(
            "{} | {} {} | {} | {} | {}",
            self.client_ip.as_deref().unwrap_or("-"),
            self.method.as_deref().unwrap_or("-"),
            self.uri.as_deref().unwrap_or("-"),
            self.status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.cost_ms
                .map(|ms| format!("{ms:.3}ms"))
                .unwrap_or_else(|| "-".to_string()),
            self.user_agent.as_deref().unwrap_or("-"),
        )
    }
}

impl Visit for AccessLine {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.set(field.name(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.set(field.name(), format!("{value:?}").trim_matches('"').to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "status" {
            self.status = Some(value);
        }
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if field.name() == "cost_ms" {
            self.cost_ms = Some(value);
        }
    }
}

impl<S, N, T> FormatEvent<S, N> for AccessLogEventFormat<T>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'writer> FormatFields<'writer> + 'static,
    T: FormatTime + Clone,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        if metadata.target() != ACCESS_TARGET {
            return format::Format::default()
                .with_timer(self.timer.clone())
                .with_target(true)
                .format_event(ctx, writer, event);
        }
        let mut line = AccessLine::default();
        event.record(&mut line);
        self.timer.format_time(&mut writer)?;
        writeln!(writer, " {} {} {}", metadata.level(), ACCESS_TARGET, line.render())
    }
}

/// Exact paths, or prefixes when the pattern ends in `*`.
pub fn should_skip_logging(path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => path == pattern,
    })
}

pub async fn log_requests(
    State(skip_paths): State<Arc<Vec<String>>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let started_at = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().to_string();
    let skip = should_skip_logging(req.uri().path(), skip_paths.as_slice());
    let connect_info = req
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|info| info.0);
    let client_ip = ClientAddr::from_http_parts(req.headers(), connect_info)
        .ip()
        .to_string();
    let user_agent = req
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let response = next.run(req).await;

    if !skip {
        info!(
            target: "http.access",
            client_ip = client_ip.as_str(),
            method = method.as_str(),
            uri = uri.as_str(),
            status = response.status().as_u16() as u64,
            cost_ms = started_at.elapsed().as_secs_f64() * 1_000.0,
            user_agent = user_agent.as_str(),
        );
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_patterns() {
        let patterns = vec!["/api/health".to_string(), "/static/*".to_string()];
        assert!(should_skip_logging("/api/health", &patterns));
        assert!(should_skip_logging("/static/app.js", &patterns));
        assert!(!should_skip_logging("/api/health/extra", &patterns));
        assert!(!should_skip_logging("/api/call/start", &patterns));
    }

    #[test]
    fn test_access_line_render() {
        let mut line = AccessLine::default();
        line.set("client_ip", "203.0.113.7".to_string());
        line.set("method", "POST".to_string());
        line.set("uri", "/api/call/start".to_string());
        line.status = Some(404);
        line.cost_ms = Some(1.5);
        assert_eq!(
            line.render(),
            "203.0.113.7 | POST /api/call/start | 404 | 1.500ms | -"
        );
    }
}
