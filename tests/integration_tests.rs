use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use chrono::{Local, NaiveDate, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

use agenda::config::AppConfig;
use agenda::db::{self, queries};
use agenda::handlers;
use agenda::models::{Barbershop, BarbershopService, ChatMessage, OpeningHours, User};
use agenda::services::ai::rules::PolicyProvider;
use agenda::services::ai::{GenerationRequest, LlmProvider, ModelChunk, ModelStream, ToolCall};
use agenda::services::availability::{AvailabilityError, AvailabilityProvider};
use agenda::services::checkout::{CheckoutError, CheckoutProvider, CheckoutRequest, CheckoutSession};
use agenda::services::idempotency::IdempotencyCache;
use agenda::services::orchestrator::{Orchestrator, DEFAULT_MAX_STEPS};
use agenda::services::redirect::CheckoutRedirects;
use agenda::services::tools::{ToolContext, Toolbox};
use agenda::state::AppState;

// ── Mock Providers ──

/// Requests a tool on every step and never answers.
struct LoopingLlm;

#[async_trait]
impl LlmProvider for LoopingLlm {
    async fn stream(&self, _request: GenerationRequest<'_>) -> anyhow::Result<ModelStream> {
        let call = ModelChunk::ToolCall(ToolCall {
            id: format!("call_{}", uuid::Uuid::new_v4().simple()),
            name: "searchBarbershops".to_string(),
            arguments: json!({}),
        });
        Ok(Box::pin(tokio_stream::iter(vec![Ok(call)])))
    }
}

struct MockAvailability {
    slots: HashMap<String, Vec<String>>,
}

impl MockAvailability {
    fn new(slots: &[(&str, &[&str])]) -> Self {
        Self {
            slots: slots
                .iter()
                .map(|(shop, s)| (shop.to_string(), s.iter().map(|t| t.to_string()).collect()))
                .collect(),
        }
    }
}

#[async_trait]
impl AvailabilityProvider for MockAvailability {
    async fn available_time_slots(
        &self,
        barbershop_id: &str,
        _date: NaiveDate,
    ) -> Result<Vec<String>, AvailabilityError> {
        self.slots
            .get(barbershop_id)
            .cloned()
            .ok_or_else(|| AvailabilityError::Validation("Barbearia não encontrada".to_string()))
    }
}

#[derive(Default)]
struct MockCheckout {
    calls: AtomicUsize,
    requests: Mutex<Vec<(String, CheckoutRequest)>>,
}

#[async_trait]
impl CheckoutProvider for MockCheckout {
    async fn create_session(
        &self,
        caller: Option<&User>,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, CheckoutError> {
        let caller = caller.ok_or(CheckoutError::Unauthorized)?;
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests
            .lock()
            .unwrap()
            .push((caller.id.clone(), request.clone()));
        Ok(CheckoutSession {
            id: format!("cs_{n}"),
            url: format!("https://pay/cs_{n}"),
        })
    }
}

// ── Helpers ──

const TOKEN: &str = "session-ana";

fn test_config() -> AppConfig {
    AppConfig {
        port: 3000,
        database_url: ":memory:".to_string(),
        llm_provider: "rules".to_string(),
        groq_api_key: "".to_string(),
        groq_model: "".to_string(),
        ollama_url: "http://localhost:11434".to_string(),
        ollama_model: "llama3.2".to_string(),
        stripe_secret_key: "".to_string(),
        app_url: "http://localhost:3000".to_string(),
        chat_max_steps: DEFAULT_MAX_STEPS,
        checkout_retention_minutes: 10,
        checkout_sweep_minutes: 5,
        slot_interval_minutes: 30,
        seed_demo_data: false,
        dev_login: true,
    }
}

fn service(id: &str, shop: &str, name: &str, price_in_cents: i64) -> BarbershopService {
    BarbershopService {
        id: id.to_string(),
        barbershop_id: shop.to_string(),
        name: name.to_string(),
        description: String::new(),
        price_in_cents,
    }
}

fn seeded_db() -> Arc<Mutex<rusqlite::Connection>> {
    let conn = db::init_db(":memory:").unwrap();
    queries::insert_barbershop(
        &conn,
        &Barbershop {
            id: "b1".to_string(),
            name: "Vintage Barber".to_string(),
            address: "Rua das Flores, 10".to_string(),
            description: "Cortes clássicos".to_string(),
            image_url: String::new(),
            phones: vec!["(11) 3333-0001".to_string()],
            opening_hours: OpeningHours::from_json(
                r#"{"slots":[{"day":"mon","start":"09:00","end":"18:00"}]}"#,
            )
            .unwrap(),
            services: vec![
                service("svc-barba-b1", "b1", "Barba", 3000),
                service("svc-corte-b1", "b1", "Corte de Cabelo", 5000),
            ],
        },
    )
    .unwrap();
    queries::insert_barbershop(
        &conn,
        &Barbershop {
            id: "b2".to_string(),
            name: "Barbearia do Matuto".to_string(),
            address: "Av. Central, 200".to_string(),
            description: String::new(),
            image_url: String::new(),
            phones: vec![],
            opening_hours: OpeningHours::default(),
            services: vec![service("svc-corte-b2", "b2", "Corte de Cabelo", 4000)],
        },
    )
    .unwrap();

    queries::create_user(
        &conn,
        &User {
            id: "u1".to_string(),
            name: "Ana".to_string(),
            email: "ana@example.com".to_string(),
        },
    )
    .unwrap();
    queries::create_session(&conn, TOKEN, "u1", &(Utc::now().naive_utc() + chrono::Duration::hours(1))).unwrap();

    Arc::new(Mutex::new(conn))
}

fn test_state(llm: Arc<dyn LlmProvider>, checkout: Arc<MockCheckout>) -> Arc<AppState> {
    test_state_with(test_config(), llm, checkout)
}

fn test_state_with(config: AppConfig, llm: Arc<dyn LlmProvider>, checkout: Arc<MockCheckout>) -> Arc<AppState> {
    let db = seeded_db();
    let availability = MockAvailability::new(&[
        ("b1", &["09:00", "10:00", "11:00"][..]),
        ("b2", &["14:00", "15:00"][..]),
    ]);
    let toolbox = Toolbox::new(
        db.clone(),
        Arc::new(availability),
        checkout,
        Arc::new(IdempotencyCache::default()),
    );
    Arc::new(AppState {
        db,
        orchestrator: Orchestrator::new(llm, Arc::new(toolbox), config.chat_max_steps),
        config,
    })
}

fn test_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/api/chat", post(handlers::chat::chat))
        .route("/api/barbershops", get(handlers::barbershops::list_barbershops))
        .route("/api/barbershops/:id", get(handlers::barbershops::get_barbershop))
        .route("/api/dev/session", post(handlers::dev::create_session))
        .with_state(state)
}

async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let res = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = res.status();
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let res = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = res.status();
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

/// Streamed chat response, split into its `data:` payloads.
struct ChatReply {
    status: StatusCode,
    stream_header: Option<String>,
    events: Vec<Value>,
    done: bool,
}

impl ChatReply {
    fn of_type(&self, kind: &str) -> Vec<&Value> {
        self.events.iter().filter(|e| e["type"] == kind).collect()
    }

    fn text(&self) -> String {
        self.of_type("text-delta")
            .iter()
            .filter_map(|e| e["delta"].as_str())
            .collect()
    }

    fn tool_outputs(&self, tool_name: &str) -> Vec<Value> {
        let ids: Vec<&Value> = self
            .of_type("tool-input-available")
            .into_iter()
            .filter(|e| e["toolName"] == tool_name)
            .map(|e| &e["toolCallId"])
            .collect();
        self.of_type("tool-output-available")
            .into_iter()
            .filter(|e| ids.contains(&&e["toolCallId"]))
            .map(|e| e["output"].clone())
            .collect()
    }

    /// The assistant message a UI client would append to its history.
    fn assistant_message(&self) -> Value {
        let mut inputs = HashMap::new();
        let mut parts = vec![];
        for event in &self.events {
            match event["type"].as_str() {
                Some("tool-input-available") => {
                    inputs.insert(
                        event["toolCallId"].as_str().unwrap().to_string(),
                        (event["toolName"].as_str().unwrap().to_string(), event["input"].clone()),
                    );
                }
                Some("tool-output-available") => {
                    let id = event["toolCallId"].as_str().unwrap();
                    let (name, input) = inputs[id].clone();
                    parts.push(json!({
                        "type": format!("tool-{name}"),
                        "toolCallId": id,
                        "state": "output-available",
                        "input": input,
                        "output": event["output"],
                    }));
                }
                _ => {}
            }
        }
        let text = self.text();
        if !text.is_empty() {
            parts.push(json!({ "type": "text", "text": text }));
        }
        let id = self.of_type("start")[0]["messageId"].clone();
        json!({ "id": id, "role": "assistant", "parts": parts })
    }
}

async fn post_chat(app: Router, messages: &[Value], token: Option<&str>) -> ChatReply {
    let mut req = Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header("Content-Type", "application/json");
    if let Some(token) = token {
        req = req.header("Authorization", format!("Bearer {token}"));
    }
    let res = app
        .oneshot(req.body(Body::from(json!({ "messages": messages }).to_string())).unwrap())
        .await
        .unwrap();

    let status = res.status();
    let stream_header = res
        .headers()
        .get("x-vercel-ai-ui-message-stream")
        .map(|v| v.to_str().unwrap().to_string());
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let body = String::from_utf8(body.to_vec()).unwrap();

    let mut events = vec![];
    let mut done = false;
    for data in body.lines().filter_map(|l| l.strip_prefix("data: ")) {
        if data == "[DONE]" {
            done = true;
        } else {
            events.push(serde_json::from_str(data).unwrap());
        }
    }

    ChatReply {
        status,
        stream_header,
        events,
        done,
    }
}

fn user(text: &str) -> Value {
    json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
        "role": "user",
        "parts": [{ "type": "text", "text": text }],
    })
}

fn today() -> String {
    Local::now().date_naive().format("%Y-%m-%d").to_string()
}

// ── Catalog API Tests ──

#[tokio::test]
async fn test_health_check() {
    let app = test_app(test_state(Arc::new(LoopingLlm), Arc::default()));
    let (status, json) = get_json(app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_list_and_search_barbershops() {
    let state = test_state(Arc::new(LoopingLlm), Arc::default());

    let (status, all) = get_json(test_app(state.clone()), "/api/barbershops").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all.as_array().unwrap().len(), 2);
    assert_eq!(all[0]["name"], "Barbearia do Matuto");
    assert_eq!(all[0]["services"][0]["price"], 40.0);

    let (_, some) = get_json(test_app(state.clone()), "/api/barbershops?search=VINTAGE").await;
    assert_eq!(some.as_array().unwrap().len(), 1);
    assert_eq!(some[0]["barbershopId"], "b1");

    let (_, blank) = get_json(test_app(state.clone()), "/api/barbershops?search=%20").await;
    assert_eq!(blank.as_array().unwrap().len(), 2);

    let (_, none) = get_json(test_app(state), "/api/barbershops?search=xyz").await;
    assert!(none.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_barbershop_detail() {
    let state = test_state(Arc::new(LoopingLlm), Arc::default());

    let (status, shop) = get_json(test_app(state.clone()), "/api/barbershops/b1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(shop["name"], "Vintage Barber");
    assert_eq!(shop["services"].as_array().unwrap().len(), 2);
    assert!(shop["openingHours"].as_str().unwrap().contains("09:00-18:00"));
    assert_eq!(shop["phones"], json!(["(11) 3333-0001"]));

    let (status, err) = get_json(test_app(state), "/api/barbershops/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(err["error"].as_str().unwrap().contains("missing"));
}

// ── Chat Endpoint Tests ──

#[tokio::test]
async fn test_chat_rejects_empty_history() {
    let app = test_app(test_state(Arc::new(LoopingLlm), Arc::default()));
    let reply = post_chat(app, &[], None).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_chat_stops_at_step_cap() {
    let app = test_app(test_state(Arc::new(LoopingLlm), Arc::default()));
    let reply = post_chat(app, &[user("oi")], None).await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.stream_header.as_deref(), Some("v1"));
    assert!(reply.done);
    assert_eq!(reply.of_type("start-step").len(), 10);
    assert_eq!(reply.of_type("tool-output-available").len(), 10);

    let finish = reply.of_type("finish");
    assert_eq!(finish.len(), 1);
    assert_eq!(finish[0]["messageMetadata"]["finishReason"], "step-limit");
    assert_eq!(finish[0]["messageMetadata"]["steps"], 10);
}

#[tokio::test]
async fn test_booking_conversation_end_to_end() {
    let checkout = Arc::new(MockCheckout::default());
    let state = test_state(Arc::new(PolicyProvider::new()), checkout.clone());
    let mut history = vec![user("quero cortar o cabelo hoje às 10h")];

    // Turn 1: search, then slots for every barbershop, then only the one
    // offering 10:00 is presented.
    let first = post_chat(test_app(state.clone()), &history, Some(TOKEN)).await;
    assert_eq!(first.status, StatusCode::OK);
    let search = first.tool_outputs("searchBarbershops");
    assert_eq!(search.len(), 1);
    assert_eq!(search[0].as_array().unwrap().len(), 2);

    let slot_inputs: Vec<&Value> = first
        .of_type("tool-input-available")
        .into_iter()
        .filter(|e| e["toolName"] == "getAvailableTimeSlotsForBarbershop")
        .collect();
    assert_eq!(slot_inputs.len(), 2);
    assert!(slot_inputs.iter().all(|e| e["input"]["date"] == today()));

    let text = first.text();
    assert!(text.contains("Vintage Barber"), "{text}");
    assert!(!text.contains("Matuto"), "{text}");
    assert!(!text.contains("svc-"), "{text}");
    assert_eq!(first.of_type("finish")[0]["messageMetadata"]["finishReason"], "stop");
    assert_eq!(checkout.calls.load(Ordering::SeqCst), 0);

    // Turn 2: explicit confirmation creates exactly one checkout.
    history.push(first.assistant_message());
    history.push(user("confirmo"));
    let second = post_chat(test_app(state.clone()), &history, Some(TOKEN)).await;

    let outputs = second.tool_outputs("createCheckoutSession");
    assert_eq!(
        outputs,
        vec![json!({"success": true, "url": "https://pay/cs_1", "checkoutSessionId": "cs_1"})]
    );
    assert!(second.text().contains("redirecionando"));
    assert!(!second.text().contains("https://"));
    {
        let requests = checkout.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "u1");
        assert_eq!(requests[0].1.service_id, "svc-corte-b1");
        assert_eq!(requests[0].1.date.format("%Y-%m-%dT%H:%M:%S").to_string(), format!("{}T10:00:00", today()));
    }

    // Turn 3: repeating the confirmation is blocked by the idempotency cache.
    history.push(second.assistant_message());
    history.push(user("confirmo"));
    let third = post_chat(test_app(state), &history, Some(TOKEN)).await;

    assert_eq!(
        third.tool_outputs("createCheckoutSession"),
        vec![json!({"success": false, "error": "Duplicate booking"})]
    );
    assert!(third.text().contains("Já foi criado"));
    assert_eq!(checkout.calls.load(Ordering::SeqCst), 1);

    // The client navigates once for the successful checkout only.
    history.push(third.assistant_message());
    let messages: Vec<ChatMessage> = serde_json::from_value(Value::Array(history)).unwrap();
    let mut redirects = CheckoutRedirects::new();
    assert_eq!(redirects.pending(&messages), vec!["https://pay/cs_1"]);
    assert!(redirects.pending(&messages).is_empty());
}

#[tokio::test]
async fn test_anonymous_checkout_is_unauthorized_then_retry_succeeds() {
    let checkout = Arc::new(MockCheckout::default());
    let state = test_state(Arc::new(PolicyProvider::new()), checkout.clone());
    let mut history = vec![user("quero cortar o cabelo hoje às 10h")];

    let first = post_chat(test_app(state.clone()), &history, None).await;
    history.push(first.assistant_message());
    history.push(user("pode agendar"));

    let anonymous = post_chat(test_app(state.clone()), &history, Some("unknown-token")).await;
    assert_eq!(
        anonymous.tool_outputs("createCheckoutSession"),
        vec![json!({"success": false, "error": "Unauthorized"})]
    );
    assert!(anonymous.text().contains("login"));

    // The failed attempt did not reserve the slot.
    history.push(anonymous.assistant_message());
    history.push(user("fiz login, confirmo"));
    let retry = post_chat(test_app(state), &history, Some(TOKEN)).await;
    assert_eq!(retry.tool_outputs("createCheckoutSession")[0]["success"], true);
    assert_eq!(checkout.calls.load(Ordering::SeqCst), 1);
}

// ── Dev Login Tests ──

#[tokio::test]
async fn test_dev_login_creates_user_once() {
    let state = test_state(Arc::new(PolicyProvider::new()), Arc::new(MockCheckout::default()));

    let (status, first) = post_json(
        test_app(state.clone()),
        "/api/dev/session",
        json!({"email": " Bruno@Example.com ", "name": "Bruno"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!first["token"].as_str().unwrap().is_empty());
    assert!(first["expiresAt"].as_str().unwrap().ends_with('Z'));

    let (status, second) =
        post_json(test_app(state.clone()), "/api/dev/session", json!({"email": "bruno@example.com"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["userId"], first["userId"]);
    assert_ne!(second["token"], first["token"]);

    let db = state.db.lock().unwrap();
    let user = queries::get_user_by_email(&db, "bruno@example.com").unwrap().unwrap();
    assert_eq!(user.name, "Bruno");
    assert_eq!(json!(user.id), first["userId"]);
}

#[tokio::test]
async fn test_dev_login_existing_user_and_bad_email() {
    let state = test_state(Arc::new(PolicyProvider::new()), Arc::new(MockCheckout::default()));

    let (status, body) =
        post_json(test_app(state.clone()), "/api/dev/session", json!({"email": "ana@example.com"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["userId"], "u1");

    let (status, body) = post_json(test_app(state), "/api/dev/session", json!({"email": "ana"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_dev_login_token_books_a_checkout() {
    let checkout = Arc::new(MockCheckout::default());
    let state = test_state(Arc::new(PolicyProvider::new()), checkout.clone());

    let (_, login) =
        post_json(test_app(state.clone()), "/api/dev/session", json!({"email": "carla@example.com"})).await;
    let token = login["token"].as_str().unwrap().to_string();

    let mut history = vec![user("quero cortar o cabelo hoje às 10h")];
    let first = post_chat(test_app(state.clone()), &history, Some(&token)).await;
    history.push(first.assistant_message());
    history.push(user("confirmo"));
    let second = post_chat(test_app(state), &history, Some(&token)).await;

    assert_eq!(second.tool_outputs("createCheckoutSession")[0]["success"], true);
    let requests = checkout.requests.lock().unwrap();
    assert_eq!(json!(requests[0].0), login["userId"]);
}

#[tokio::test]
async fn test_dev_login_disabled_is_not_found() {
    let config = AppConfig {
        dev_login: false,
        ..test_config()
    };
    let state = test_state_with(config, Arc::new(PolicyProvider::new()), Arc::new(MockCheckout::default()));

    let (status, _) = post_json(test_app(state), "/api/dev/session", json!({"email": "ana@example.com"})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ── Tool Contract Tests ──

#[tokio::test]
async fn test_checkout_tool_guards() {
    let checkout = Arc::new(MockCheckout::default());
    let toolbox = Toolbox::new(
        seeded_db(),
        Arc::new(MockAvailability::new(&[])),
        checkout.clone(),
        Arc::new(IdempotencyCache::default()),
    );
    let ctx = ToolContext {
        caller: Some(User {
            id: "u1".to_string(),
            name: "Ana".to_string(),
            email: "ana@example.com".to_string(),
        }),
    };

    let invalid = toolbox
        .execute(&ctx, "createCheckoutSession", &json!({"serviceId": "svc-corte-b1", "date": "sexta às 10h"}))
        .await;
    assert_eq!(invalid, json!({"success": false, "error": "Data inválida"}));
    assert_eq!(checkout.calls.load(Ordering::SeqCst), 0);

    let args = json!({"serviceId": "svc-corte-b1", "date": "2030-01-07T10:00:00"});
    let first = toolbox.execute(&ctx, "createCheckoutSession", &args).await;
    let second = toolbox.execute(&ctx, "createCheckoutSession", &args).await;
    assert_eq!(first["success"], true);
    assert_eq!(second, json!({"success": false, "error": "Duplicate booking"}));
    assert_eq!(checkout.calls.load(Ordering::SeqCst), 1);

    let extra = toolbox
        .execute(&ctx, "createCheckoutSession", &json!({"serviceId": "x", "date": "2030-01-07T10:00:00", "price": 1}))
        .await;
    assert_eq!(extra["success"], false);
    assert!(extra["error"].as_str().unwrap().starts_with("Parâmetros inválidos"));
}
