// Transit arrival sign server with embedded signage frontend
// Proxies the 511.org regional transit API (operators, lines, patterns,
// stops, stop monitoring), keeps the API key server-side, and polls arrival
// predictions for the selected stop every 30 seconds.

use actix_cors::Cors;
use actix_web::http::StatusCode;
use actix_web::{middleware, web, App, HttpResponse, HttpServer};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

mod arrival_board;
mod selection;
mod siri_api_models;

use arrival_board::BoardState;
use selection::{Selection, SelectionStore, SharedStopQuery};
use siri_api_models::{FiveOneOneApi, SignError};

// Embed static files at compile time
const INDEX_HTML: &str = include_str!("../static/sign.html");
const SIGN_JS: &str = include_str!("../static/transit-sign.js");

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone)]
struct SignConfig {
    api_key: Option<String>,
}

impl SignConfig {
    fn from_env() -> Self {
        // The 511 token is accepted under both historical casings
        let api_key = std::env::var("FIVEONEONE_TOKEN")
            .or_else(|_| std::env::var("fiveoneone_token"))
            .ok();
        SignConfig { api_key }
    }

    fn require_key(&self) -> Result<String, SignError> {
        self.api_key.clone().ok_or(SignError::ConfigError)
    }
}

#[derive(Clone)]
struct AppState {
    config: SignConfig,
    store: Arc<SelectionStore>,
    board: Arc<Mutex<BoardState>>,
    poller: Arc<Mutex<Option<arrival_board::PollHandle>>>,
}

// ============================================================================
// Poll Lifecycle
// ============================================================================

fn restart_poll(state: &AppState, selection: Selection) {
    let Ok(key) = state.config.require_key() else {
        eprintln!("⚠️  Cannot start arrival polling without an API key");
        return;
    };

    match state.poller.lock() {
        Ok(mut slot) => {
            if let Some(handle) = slot.take() {
                handle.cancel();
            }
            println!(
                "🔄 Polling arrivals for stop {} ({})",
                selection.stop.code, selection.stop.name
            );
            *slot = Some(arrival_board::spawn_poll(key, selection, state.board.clone()));
        }
        Err(e) => eprintln!("❌ Failed to lock poller slot: {}", e),
    }
}

fn stop_poll(state: &AppState) {
    if let Ok(mut slot) = state.poller.lock() {
        if let Some(handle) = slot.take() {
            handle.cancel();
        }
    }
    if let Ok(mut board) = state.board.lock() {
        *board = BoardState::idle();
    }
}

// ============================================================================
// Error Mapping
// ============================================================================

fn error_response(context: &str, err: SignError) -> HttpResponse {
    match err {
        SignError::ConfigError => HttpResponse::InternalServerError().json(json!({
            "error": "API key not configured"
        })),
        SignError::UpstreamError { status, details } => {
            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            HttpResponse::build(status).json(json!({
                "error": format!("511 API error: {}", status.as_u16()),
                "details": details,
            }))
        }
        SignError::ShapeError(details) => HttpResponse::InternalServerError().json(json!({
            "error": "Invalid API response structure",
            "details": details,
        })),
        other => HttpResponse::InternalServerError().json(json!({
            "error": context,
            "details": other.to_string(),
        })),
    }
}

fn task_panic_response(context: &str, e: tokio::task::JoinError) -> HttpResponse {
    eprintln!("❌ {} task panicked: {}", context, e);
    HttpResponse::InternalServerError().json(json!({ "error": context }))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn object_keys(value: &Value) -> Vec<String> {
    match value {
        Value::Object(map) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

// ============================================================================
// Frontend Routes
// ============================================================================

async fn serve_index() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(INDEX_HTML)
}

async fn serve_js() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("application/javascript; charset=utf-8")
        .body(SIGN_JS)
}

// ============================================================================
// Proxy Endpoints
// ============================================================================

async fn get_operators(state: web::Data<AppState>) -> HttpResponse {
    let key = match state.config.require_key() {
        Ok(key) => key,
        Err(e) => return error_response("Failed to fetch operators", e),
    };

    let fetched = tokio::task::spawn_blocking(move || {
        let raw = FiveOneOneApi::operators(&key)?;
        siri_api_models::normalize_operators(&raw)
    })
    .await;

    match fetched {
        Ok(Ok(operators)) => {
            println!("🏢 Operators requested: {} monitored", operators.len());
            HttpResponse::Ok().json(json!({ "operators": operators }))
        }
        Ok(Err(e)) => error_response("Failed to fetch operators", e),
        Err(e) => task_panic_response("Failed to fetch operators", e),
    }
}

#[derive(Debug, Deserialize)]
struct PatternsQuery {
    operator_id: Option<String>,
    line_id: Option<String>,
}

// Without line_id this lists an operator's lines; with line_id it lists the
// journey patterns (directions) of that line.
async fn get_patterns(
    state: web::Data<AppState>,
    query: web::Query<PatternsQuery>,
) -> HttpResponse {
    let Some(operator_id) = query.operator_id.clone() else {
        return HttpResponse::BadRequest().json(json!({ "error": "operator_id is required" }));
    };

    let key = match state.config.require_key() {
        Ok(key) => key,
        Err(e) => return error_response("Failed to fetch patterns", e),
    };

    match query.line_id.clone() {
        None => {
            let fetched =
                tokio::task::spawn_blocking(move || FiveOneOneApi::lines(&key, &operator_id))
                    .await;

            match fetched {
                Ok(Ok(raw)) => {
                    let lines = siri_api_models::normalize_lines(&raw);
                    println!("🚌 Lines requested: {} found", lines.len());
                    HttpResponse::Ok().json(json!({
                        "lines": lines,
                        "debug": {
                            "responseKeys": object_keys(&raw),
                            "sampleLine": lines.first(),
                        },
                    }))
                }
                Ok(Err(e)) => error_response("Failed to fetch lines", e),
                Err(e) => task_panic_response("Failed to fetch lines", e),
            }
        }
        Some(line_id) => {
            let fetched = tokio::task::spawn_blocking(move || {
                FiveOneOneApi::patterns(&key, &operator_id, &line_id)
            })
            .await;

            match fetched {
                Ok(Ok(raw)) => {
                    let patterns = siri_api_models::normalize_patterns(&raw);
                    println!("🧭 Patterns requested: {} found", patterns.len());
                    HttpResponse::Ok().json(json!({
                        "patterns": patterns,
                        "debug": {
                            "responseType": json_type_name(&raw),
                            "hasDirections": raw.get("directions").is_some(),
                            "hasJourneyPatterns": raw.get("journeyPatterns").is_some(),
                            "patternCount": patterns.len(),
                            "samplePattern": patterns.first(),
                        },
                    }))
                }
                Ok(Err(e)) => error_response("Failed to fetch patterns", e),
                Err(e) => task_panic_response("Failed to fetch patterns", e),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct StopsQuery {
    operator_id: Option<String>,
    agency: Option<String>,
    pattern_id: Option<String>,
}

async fn get_stops(state: web::Data<AppState>, query: web::Query<StopsQuery>) -> HttpResponse {
    let operator_id = query
        .operator_id
        .clone()
        .or_else(|| query.agency.clone())
        .unwrap_or_else(|| "SF".to_string());

    let key = match state.config.require_key() {
        Ok(key) => key,
        Err(e) => return error_response("Failed to fetch stops", e),
    };

    let pattern_id = query.pattern_id.clone();
    let fetched = tokio::task::spawn_blocking(move || {
        match pattern_id {
            // Stop sequence of one pattern, in travel order
            Some(pattern_id) => {
                let raw = FiveOneOneApi::pattern_stops(&key, &operator_id, &pattern_id)?;
                Ok(siri_api_models::normalize_pattern_stops(&raw, &pattern_id))
            }
            // Full stop inventory of the operator
            None => {
                let raw = FiveOneOneApi::stop_inventory(&key, &operator_id)?;
                Ok(siri_api_models::normalize_stop_inventory(&raw))
            }
        }
    })
    .await;

    match fetched {
        Ok(Ok(stops)) => {
            println!("📍 Stops requested: {} found", stops.len());
            HttpResponse::Ok().json(json!({ "stops": stops }))
        }
        Ok(Err(e)) => error_response("Failed to fetch stops", e),
        Err(e) => task_panic_response("Failed to fetch stops", e),
    }
}

#[derive(Debug, Deserialize)]
struct TransitQuery {
    agency: Option<String>,
    #[serde(rename = "stopCode")]
    stop_code: Option<String>,
    line: Option<String>,
}

// Raw stop-monitoring passthrough, optionally narrowed to one line. The
// envelope is validated but otherwise returned as the upstream sent it.
async fn get_transit(state: web::Data<AppState>, query: web::Query<TransitQuery>) -> HttpResponse {
    let agency = query.agency.clone().unwrap_or_else(|| "SF".to_string());

    let key = match state.config.require_key() {
        Ok(key) => key,
        Err(e) => return error_response("Failed to fetch transit data", e),
    };

    let stop_code = query.stop_code.clone();
    let line = query.line.clone();
    let fetched = tokio::task::spawn_blocking(move || {
        let mut data = FiveOneOneApi::stop_monitoring(&key, &agency, stop_code.as_deref())?;

        if data.pointer("/ServiceDelivery/StopMonitoringDelivery").is_none() {
            return Err(SignError::ShapeError(siri_api_models::excerpt(
                &data.to_string(),
                500,
            )));
        }

        if let Some(line) = line.as_deref() {
            siri_api_models::filter_visits_by_line(&mut data, line);
        }

        Ok(data)
    })
    .await;

    match fetched {
        Ok(Ok(data)) => {
            println!("🚏 Stop monitoring delivered");
            HttpResponse::Ok().json(data)
        }
        Ok(Err(e)) => error_response("Failed to fetch transit data", e),
        Err(e) => task_panic_response("Failed to fetch transit data", e),
    }
}

#[derive(Debug, Deserialize)]
struct TestPatternsQuery {
    operator_id: Option<String>,
    line_id: Option<String>,
}

// Raw patterns response wrapped in shape metadata, for debugging operators
// whose pattern feeds misbehave.
async fn get_test_patterns(
    state: web::Data<AppState>,
    query: web::Query<TestPatternsQuery>,
) -> HttpResponse {
    let (Some(operator_id), Some(line_id)) = (query.operator_id.clone(), query.line_id.clone())
    else {
        return HttpResponse::BadRequest()
            .json(json!({ "error": "operator_id and line_id are required" }));
    };

    let key = match state.config.require_key() {
        Ok(key) => key,
        Err(e) => return error_response("Failed to fetch patterns", e),
    };

    let fetched = tokio::task::spawn_blocking(move || {
        FiveOneOneApi::patterns(&key, &operator_id, &line_id)
    })
    .await;

    match fetched {
        Ok(Ok(raw)) => {
            let first_item_keys = raw
                .as_array()
                .and_then(|list| list.first())
                .map(object_keys);
            HttpResponse::Ok().json(json!({
                "responseType": json_type_name(&raw),
                "isArray": raw.is_array(),
                "responseKeys": object_keys(&raw),
                "firstItemKeys": first_item_keys,
                "sampleData": raw,
            }))
        }
        Ok(Err(e)) => error_response("Failed to fetch patterns", e),
        Err(e) => task_panic_response("Failed to fetch patterns", e),
    }
}

// ============================================================================
// Selection & Board Endpoints
// ============================================================================

async fn get_selection(state: web::Data<AppState>) -> HttpResponse {
    match state.store.load() {
        Some(selection) => HttpResponse::Ok().json(json!({ "selection": selection })),
        None => HttpResponse::Ok().json(json!({ "selection": null })),
    }
}

async fn put_selection(state: web::Data<AppState>, body: web::Json<Selection>) -> HttpResponse {
    let selection = body.into_inner();

    if let Err(e) = state.store.save(&selection) {
        return error_response("Failed to save selection", e);
    }

    println!(
        "📍 Selection updated: {} / {} → {}",
        selection.operator.name, selection.line.name, selection.stop.name
    );
    restart_poll(&state, selection.clone());

    HttpResponse::Ok().json(json!({ "selection": selection }))
}

async fn delete_selection(state: web::Data<AppState>) -> HttpResponse {
    stop_poll(&state);
    state.store.clear();
    println!("🗑️  Selection cleared");
    HttpResponse::Ok().json(json!({ "selection": null }))
}

// One-shot deep-link resolution: a fully resolved link replaces the stored
// selection, a miss falls back to it.
async fn resolve_selection(
    state: web::Data<AppState>,
    query: web::Query<SharedStopQuery>,
) -> HttpResponse {
    let key = match state.config.require_key() {
        Ok(key) => key,
        Err(e) => return error_response("Failed to resolve selection", e),
    };

    let q = query.into_inner();
    let resolved =
        tokio::task::spawn_blocking(move || selection::resolve_shared_stop(&key, &q)).await;

    match resolved {
        Ok(Ok(Some(selection))) => {
            if let Err(e) = state.store.save(&selection) {
                eprintln!("⚠️  Could not persist resolved selection: {}", e);
            }
            println!("🔗 Shared stop resolved: {}", selection.stop.name);
            restart_poll(&state, selection.clone());
            HttpResponse::Ok().json(json!({ "selection": selection, "resolved": true }))
        }
        Ok(other) => {
            if let Err(e) = other {
                eprintln!("⚠️  Shared stop resolution failed: {}", e);
            }
            match state.store.load() {
                Some(selection) => {
                    HttpResponse::Ok().json(json!({ "selection": selection, "resolved": false }))
                }
                None => HttpResponse::Ok().json(json!({ "selection": null, "resolved": false })),
            }
        }
        Err(e) => task_panic_response("Failed to resolve selection", e),
    }
}

async fn get_board(state: web::Data<AppState>) -> HttpResponse {
    match state.board.lock() {
        Ok(board) => HttpResponse::Ok().json(&*board),
        Err(e) => {
            eprintln!("❌ Failed to lock board state: {}", e);
            HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to read board state" }))
        }
    }
}

async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "511 Transit Arrival Sign",
        "version": env!("CARGO_PKG_VERSION"),
        "upstream": FiveOneOneApi::BASE_URL,
        "api_key_configured": state.config.api_key.is_some(),
        "timestamp": chrono::Utc::now().timestamp(),
        "embedded_frontend": true
    }))
}

// ============================================================================
// Server Setup
// ============================================================================

async fn run_server(state: AppState) -> std::io::Result<()> {
    println!("\n🌐 Server running on: http://0.0.0.0:8080");
    println!("📺 Signage UI available at: http://localhost:8080");
    println!(
        "🔄 Auto-refresh: Every {} seconds once a stop is selected\n",
        arrival_board::POLL_INTERVAL_SECS
    );

    println!("📍 Available Routes:");
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│ Frontend:                                                   │");
    println!("│   GET  /                        - Signage UI (embedded)     │");
    println!("│   GET  /transit-sign.js         - JavaScript (embedded)     │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ API - 511 Proxy:                                            │");
    println!("│   GET  /api/operators           - Monitored operators       │");
    println!("│   GET  /api/patterns            - Lines / patterns of line  │");
    println!("│   GET  /api/stops               - Stops (operator/pattern)  │");
    println!("│   GET  /api/transit             - Raw stop monitoring       │");
    println!("│   GET  /api/test-patterns       - Raw patterns (debug)      │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ API - Sign State:                                           │");
    println!("│   GET  /api/selection           - Stored selection          │");
    println!("│   PUT  /api/selection           - Save selection            │");
    println!("│   DEL  /api/selection           - Clear selection           │");
    println!("│   GET  /api/selection/resolve   - Resolve a shared link     │");
    println!("│   GET  /api/board               - Live arrival board        │");
    println!("│   GET  /health                  - Health check              │");
    println!("└─────────────────────────────────────────────────────────────┘\n");

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            // Frontend routes
            .route("/", web::get().to(serve_index))
            .route("/transit-sign.js", web::get().to(serve_js))
            // Health check
            .route("/health", web::get().to(health_check))
            // API routes
            .service(
                web::scope("/api")
                    .route("/operators", web::get().to(get_operators))
                    .route("/patterns", web::get().to(get_patterns))
                    .route("/stops", web::get().to(get_stops))
                    .route("/transit", web::get().to(get_transit))
                    .route("/test-patterns", web::get().to(get_test_patterns))
                    .route("/selection", web::get().to(get_selection))
                    .route("/selection", web::put().to(put_selection))
                    .route("/selection", web::delete().to(delete_selection))
                    .route("/selection/resolve", web::get().to(resolve_selection))
                    .route("/board", web::get().to(get_board)),
            )
    })
    .bind(("0.0.0.0", 8080))?
    .run()
    .await
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║   🚏 511 Transit Arrival Sign Server                       ║");
    println!("╚════════════════════════════════════════════════════════════╝\n");

    let config = SignConfig::from_env();
    match &config.api_key {
        Some(_) => println!("🔑 511 API key loaded"),
        None => {
            eprintln!("⚠️  No 511 API key found (set FIVEONEONE_TOKEN)");
            eprintln!("   The server will start, but proxy routes will answer 500");
        }
    }

    let state = AppState {
        config,
        store: Arc::new(SelectionStore::open_default()),
        board: Arc::new(Mutex::new(BoardState::idle())),
        poller: Arc::new(Mutex::new(None)),
    };

    actix_web::rt::System::new().block_on(async {
        match state.store.load() {
            Some(saved) => {
                println!(
                    "✓ Restored saved selection: {} at {}",
                    saved.line.name, saved.stop.name
                );
                restart_poll(&state, saved);
            }
            None => println!("ℹ️  No saved selection yet; open the web UI to pick a stop"),
        }

        run_server(state).await
    })
}
