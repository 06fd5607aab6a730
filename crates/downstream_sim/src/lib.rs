//! A downstream service with adjustable latency and failure rate.
//!
//! Serves `GET /{service}` after a base delay (by role) plus uniform jitter,
//! plus a penalty while degraded. Two control endpoints flip it at runtime:
//!
//! - `POST /control/degrade/{on|off}`
//! - `POST /control/error/{percent}`

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bon::Builder;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;

#[macro_use]
extern crate tracing;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Primary,
    Alternate,
}

impl Role {
    /// `alternate` (any case) is the alternate role; anything else is primary.
    pub fn from_name(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("alternate") {
            Role::Alternate
        } else {
            Role::Primary
        }
    }
}

#[derive(Clone, Debug, Builder)]
pub struct SimSettings {
    #[builder(into)]
    pub service_name: String,
    #[builder(default)]
    pub role: Role,
    #[builder(default = 80)]
    pub primary_delay_ms: u64,
    #[builder(default = 40)]
    pub alternate_delay_ms: u64,
    #[builder(default = 450)]
    pub degraded_penalty_ms: u64,
    #[builder(default = 30)]
    pub jitter_ms: u64,
    #[builder(default = 0.0)]
    pub error_rate: f64,
}

impl SimSettings {
    /// Reads `SERVICE_NAME`, `SERVICE_ROLE`, `PRIMARY_DELAY_MS`,
    /// `ALTERNATE_DELAY_MS`, `DEGRADED_PENALTY_MS`, `JITTER_MS` and
    /// `ERROR_RATE` from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str, default: u64| -> u64 {
            match lookup(key) {
                Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                    warn!(key, value = %raw, default, "Ignoring unparsable setting");
                    default
                }),
                None => default,
            }
        };
        let error_rate: f64 = match lookup("ERROR_RATE") {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(key = "ERROR_RATE", value = %raw, "Ignoring unparsable setting");
                0.0
            }),
            None => 0.0,
        };

        Self::builder()
            .service_name(lookup("SERVICE_NAME").unwrap_or_else(|| "accounts".to_string()))
            .role(lookup("SERVICE_ROLE").map_or(Role::Primary, |role| Role::from_name(&role)))
            .primary_delay_ms(number("PRIMARY_DELAY_MS", 80))
            .alternate_delay_ms(number("ALTERNATE_DELAY_MS", 40))
            .degraded_penalty_ms(number("DEGRADED_PENALTY_MS", 450))
            .jitter_ms(number("JITTER_MS", 30))
            .error_rate(error_rate.clamp(0.0, 1.0))
            .build()
    }

    pub fn base_delay_ms(&self) -> u64 {
        match self.role {
            Role::Primary => self.primary_delay_ms,
            Role::Alternate => self.alternate_delay_ms,
        }
    }
}

#[derive(Debug)]
struct Knobs {
    degraded: bool,
    error_rate: f64,
}

/// One request's worth of simulated behavior.
#[derive(Clone, Copy, Debug)]
struct Draw {
    delay_ms: u64,
    degraded: bool,
    fail: bool,
}

#[derive(Debug)]
pub struct SimState {
    settings: SimSettings,
    knobs: Mutex<Knobs>,
}

impl SimState {
    pub fn new(settings: SimSettings) -> Self {
        let knobs = Knobs {
            degraded: false,
            error_rate: settings.error_rate,
        };
        Self {
            settings,
            knobs: Mutex::new(knobs),
        }
    }

    pub fn settings(&self) -> &SimSettings {
        &self.settings
    }

    pub fn is_degraded(&self) -> bool {
        self.knobs.lock().degraded
    }

    pub fn error_rate(&self) -> f64 {
        self.knobs.lock().error_rate
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.knobs.lock().degraded = degraded;
        info!(service = %self.settings.service_name, degraded, "Degraded mode changed");
    }

    /// Sets the failure probability from a whole percentage, clamped to `[0, 1]`.
    pub fn set_error_percent(&self, percent: i64) -> f64 {
        let rate = (percent as f64 / 100.0).clamp(0.0, 1.0);
        self.knobs.lock().error_rate = rate;
        info!(service = %self.settings.service_name, error_rate = rate, "Error rate changed");
        rate
    }

    fn draw(&self) -> Draw {
        let knobs = self.knobs.lock();
        let jitter = match self.settings.jitter_ms {
            0 => 0,
            jitter => rand::random::<u64>() % jitter,
        };
        let mut delay_ms = self.settings.base_delay_ms() + jitter;
        if knobs.degraded {
            delay_ms += self.settings.degraded_penalty_ms;
        }
        Draw {
            delay_ms,
            degraded: knobs.degraded,
            fail: rand::random::<f64>() < knobs.error_rate,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Payload<'a> {
    service: &'a str,
    role: Role,
    degraded: bool,
    delay_ms: u64,
    /// Milliseconds since the Unix epoch.
    timestamp: u64,
}

pub fn router(state: Arc<SimState>) -> Router {
    let service_path = format!("/{}", state.settings.service_name);
    Router::new()
        .route(&service_path, get(serve))
        .route("/control/degrade/:mode", post(set_degraded))
        .route("/control/error/:percent", post(set_error_rate))
        .route("/__health", get(|| async { (StatusCode::OK, "OK") }))
        .with_state(state)
}

async fn serve(State(state): State<Arc<SimState>>) -> Response {
    let draw = state.draw();
    if draw.delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(draw.delay_ms)).await;
    }

    if draw.fail {
        debug!(service = %state.settings.service_name, delay_ms = draw.delay_ms, "Injected failure");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since| since.as_millis() as u64);
    Json(Payload {
        service: &state.settings.service_name,
        role: state.settings.role,
        degraded: draw.degraded,
        delay_ms: draw.delay_ms,
        timestamp,
    })
    .into_response()
}

async fn set_degraded(State(state): State<Arc<SimState>>, Path(mode): Path<String>) -> Response {
    state.set_degraded(mode.eq_ignore_ascii_case("on"));
    Json(json!({ "degraded": state.is_degraded() })).into_response()
}

async fn set_error_rate(
    State(state): State<Arc<SimState>>,
    Path(percent): Path<i64>,
) -> Response {
    let rate = state.set_error_percent(percent);
    Json(json!({ "errorRate": rate })).into_response()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::body::{Body, to_bytes};
    use http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;

    fn state(role: Role) -> Arc<SimState> {
        Arc::new(SimState::new(
            SimSettings::builder()
                .service_name("accounts")
                .role(role)
                .jitter_ms(0)
                .build(),
        ))
    }

    async fn call(state: &Arc<SimState>, method: &str, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = router(Arc::clone(state)).oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[test]
    fn settings_from_lookup() {
        let env = HashMap::from([
            ("SERVICE_NAME", "recs"),
            ("SERVICE_ROLE", "Alternate"),
            ("ALTERNATE_DELAY_MS", "25"),
            ("JITTER_MS", "lots"),
            ("ERROR_RATE", "1.5"),
        ]);

        let settings =
            SimSettings::from_lookup(|key| env.get(key).map(|value| value.to_string()));

        assert_eq!(settings.service_name, "recs");
        assert_eq!(settings.role, Role::Alternate);
        assert_eq!(settings.base_delay_ms(), 25);
        assert_eq!(settings.primary_delay_ms, 80);
        assert_eq!(settings.degraded_penalty_ms, 450);
        assert_eq!(settings.jitter_ms, 30);
        assert_eq!(settings.error_rate, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn serves_payload_after_role_delay() {
        let state = state(Role::Alternate);
        let started = tokio::time::Instant::now();

        let (status, body) = call(&state, "GET", "/accounts").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "accounts");
        assert_eq!(body["role"], "alternate");
        assert_eq!(body["degraded"], false);
        assert_eq!(body["delayMs"], 40);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_mode_adds_penalty() {
        let state = state(Role::Primary);

        let (status, body) = call(&state, "POST", "/control/degrade/ON").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "degraded": true }));

        let (_, body) = call(&state, "GET", "/accounts").await;
        assert_eq!(body["degraded"], true);
        assert_eq!(body["delayMs"], 80 + 450);

        call(&state, "POST", "/control/degrade/off").await;
        assert!(!state.is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn error_rate_is_clamped_and_applied() {
        let state = state(Role::Primary);

        let (_, body) = call(&state, "POST", "/control/error/250").await;
        assert_eq!(body, json!({ "errorRate": 1.0 }));

        let (status, _) = call(&state, "GET", "/accounts").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (_, body) = call(&state, "POST", "/control/error/-5").await;
        assert_eq!(body, json!({ "errorRate": 0.0 }));

        let (status, _) = call(&state, "GET", "/accounts").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn rejects_non_numeric_error_rate() {
        let state = state(Role::Primary);

        let (status, _) = call(&state, "POST", "/control/error/half").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(state.error_rate(), 0.0);
    }
}
