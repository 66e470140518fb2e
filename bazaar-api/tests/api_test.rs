use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use bazaar_api::{
    app,
    middleware::{issue_token, Claims, Role},
    state::{AuthConfig, Repositories},
    AppState,
};
use bazaar_core::payout_rail::MockPayoutRail;
use bazaar_core::{EventRole, FixedClock};
use bazaar_shared::models::events::DomainEvent;
use bazaar_store::BroadcastEventPublisher;
use bazaar_wallet::{PayoutFrequency, PayoutSchedule, WeeklyWindow};
use chrono::{TimeZone, Utc, Weekday};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower::ServiceExt;
use uuid::Uuid;

const SECRET: &str = "test-secret";

struct Harness {
    app: Router,
    events: broadcast::Receiver<DomainEvent>,
}

fn harness() -> Harness {
    let schedule = PayoutSchedule::new(
        PayoutFrequency::Weekly,
        WeeklyWindow::new(Weekday::Sun, 23).unwrap(),
        WeeklyWindow::new(Weekday::Wed, 10).unwrap(),
        "Asia/Manila",
    )
    .unwrap();
    let publisher = Arc::new(BroadcastEventPublisher::new(64));
    let events = publisher.subscribe();
    let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 5, 4, 0, 0).unwrap()));

    let state = AppState::new(
        Repositories::in_memory(),
        publisher,
        Arc::new(MockPayoutRail::new()),
        clock,
        schedule,
        AuthConfig {
            secret: SECRET.into(),
            expiration: 3600,
        },
    )
    .unwrap();

    Harness {
        app: app(state),
        events,
    }
}

fn bearer(claims: Claims) -> String {
    format!("Bearer {}", issue_token(&claims, SECRET).unwrap())
}

fn vendor(id: &str) -> String {
    bearer(Claims::new(id, Role::Vendor, 3600))
}

fn system() -> String {
    bearer(Claims::new("payments", Role::System, 3600))
}

fn payment(order_id: Uuid) -> Value {
    json!({
        "header": {
            "id": order_id,
            "buyer_id": "buyer-1",
            "event_id": "evt-1",
            "currency": "PHP",
            "status": "paid",
            "amount": { "items_subtotal_minor": 7000, "fees_minor": 0, "total_minor": 7500 },
            "provider": "mockpay",
            "provider_ref": "pi_123",
            "created_at": "2024-03-05T04:00:00Z"
        },
        "line_items": [
            {
                "line_key": "merch-1",
                "vendor_id": "vendor-x",
                "name": "Tour shirt",
                "qty": 2,
                "unit_price_minor": 1000,
                "subtotal_minor": 2000,
                "kind": { "type": "merch", "merch_item_id": "shirt-01", "variant": "L" }
            },
            {
                "line_key": "ticket-1",
                "vendor_id": "vendor-y",
                "name": "General admission",
                "qty": 1,
                "unit_price_minor": 5000,
                "subtotal_minor": 5000,
                "kind": { "type": "ticket", "ticket_type_id": "ga" }
            }
        ],
        "shipping": [
            {
                "line_key": "merch-1",
                "vendor_id": "vendor-x",
                "qty_ordered": 2,
                "method": { "type": "delivery", "address": "12 Mabini St, Manila" },
                "fee_minor": 500
            },
            {
                "line_key": "ticket-1",
                "vendor_id": "vendor-y",
                "qty_ordered": 1,
                "method": { "type": "digital" }
            }
        ]
    })
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, headers, body)
}

fn get(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, token)
        .body(Body::empty())
        .unwrap()
}

fn post(uri: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, token)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn confirmed_order(app: &Router) -> Uuid {
    let order_id = Uuid::new_v4();
    let (status, _, body) = send(app, post("/v1/payments/confirmed", &system(), payment(order_id))).await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    order_id
}

#[tokio::test]
async fn test_confirm_payment_creates_order_and_holds() {
    let mut h = harness();
    let order_id = Uuid::new_v4();

    let (status, _, body) = send(&h.app, post("/v1/payments/confirmed", &system(), payment(order_id))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["order"]["id"], json!(order_id));
    assert_eq!(body["holds"].as_array().unwrap().len(), 2);

    let event = h.events.recv().await.unwrap();
    assert_eq!(event.name(), "order_created");
}

#[tokio::test]
async fn test_repeated_confirmation_writes_nothing_new() {
    let h = harness();
    let order_id = confirmed_order(&h.app).await;

    let (status, _, body) = send(&h.app, post("/v1/payments/confirmed", &system(), payment(order_id))).await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    assert_eq!(body["holds"].as_array().unwrap().len(), 2);

    let (_, _, summary) = send(&h.app, get("/v1/wallet", &vendor("vendor-x"))).await;
    assert_eq!(summary["on_hold_minor"], 2000);
}

#[tokio::test]
async fn test_only_system_may_confirm_payments() {
    let h = harness();
    let (status, _, body) = send(
        &h.app,
        post("/v1/payments/confirmed", &vendor("vendor-x"), payment(Uuid::new_v4())),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "forbidden");
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let h = harness();
    let req = Request::builder().uri("/v1/orders").body(Body::empty()).unwrap();
    let (status, _, _) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_vendor_ships_own_line_with_etag() {
    let h = harness();
    let order_id = confirmed_order(&h.app).await;

    let (status, _, view) = send(&h.app, get(&format!("/v1/orders/{}", order_id), &vendor("vendor-x"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["visibility_reason"], "vendor");
    let version = view["lines"][0]["fulfillment"]["version"].as_u64().unwrap();

    let mut req = post(
        &format!("/v1/orders/{}/lines/merch-1/fulfillment", order_id),
        &vendor("vendor-x"),
        json!({ "status": "shipped", "qty_fulfilled": 2, "tracking_number": "LBC-778" }),
    );
    req.headers_mut()
        .insert(header::IF_MATCH, format!("\"{}\"", version).parse().unwrap());
    let (status, headers, line) = send(&h.app, req).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(line["shipping"]["status"], "shipped");
    assert_eq!(line["shipping"]["tracking_number"], "LBC-778");
    assert_eq!(headers[header::ETAG], format!("\"{}\"", version + 1).as_str());

    // The same precondition is now stale.
    let mut retry = post(
        &format!("/v1/orders/{}/lines/merch-1/fulfillment", order_id),
        &vendor("vendor-x"),
        json!({ "status": "delivered" }),
    );
    retry
        .headers_mut()
        .insert(header::IF_MATCH, format!("\"{}\"", version).parse().unwrap());
    let (status, _, body) = send(&h.app, retry).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["retryable"], true);
}

#[tokio::test]
async fn test_other_vendor_cannot_touch_line() {
    let h = harness();
    let order_id = confirmed_order(&h.app).await;

    let (status, _, body) = send(
        &h.app,
        post(
            &format!("/v1/orders/{}/lines/merch-1/fulfillment", order_id),
            &vendor("vendor-y"),
            json!({ "status": "shipped" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "not_owner");
}

#[tokio::test]
async fn test_backwards_transition_is_conflict() {
    let h = harness();
    let order_id = confirmed_order(&h.app).await;
    let uri = format!("/v1/orders/{}/lines/ticket-1/fulfillment", order_id);

    let (status, _, _) = send(&h.app, post(&uri, &vendor("vendor-y"), json!({ "status": "fulfilled" }))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = send(&h.app, post(&uri, &vendor("vendor-y"), json!({ "status": "shipped" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "terminal_state_violation");
}

#[tokio::test]
async fn test_malformed_if_match_is_bad_request() {
    let h = harness();
    let order_id = confirmed_order(&h.app).await;

    let mut req = post(
        &format!("/v1/orders/{}/lines/merch-1/fulfillment", order_id),
        &vendor("vendor-x"),
        json!({ "status": "shipped" }),
    );
    req.headers_mut().insert(header::IF_MATCH, "\"latest\"".parse().unwrap());
    let (status, _, _) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_organizer_gets_coarse_view() {
    let h = harness();
    let order_id = confirmed_order(&h.app).await;
    let organizer = bearer(Claims::new("organizer-1", Role::Vendor, 3600).with_event_role("evt-1", EventRole::Manager));

    let (status, _, view) = send(&h.app, get(&format!("/v1/orders/{}", order_id), &organizer)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["visibility_reason"], "organizer");

    let lines = view["lines"].as_array().unwrap();
    assert_eq!(lines.len(), 2);
    for line in lines {
        assert_eq!(line["owned"], false);
        assert!(line.get("fulfillment").is_none());
    }
}

#[tokio::test]
async fn test_stranger_is_forbidden() {
    let h = harness();
    let order_id = confirmed_order(&h.app).await;

    let (status, _, _) = send(&h.app, get(&format!("/v1/orders/{}", order_id), &vendor("vendor-z"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, list) = send(&h.app, get("/v1/orders", &vendor("vendor-z"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list, json!([]));
}

#[tokio::test]
async fn test_timeline_merges_events_and_notes() {
    let h = harness();
    let order_id = confirmed_order(&h.app).await;

    let (status, _, note) = send(
        &h.app,
        post(
            &format!("/v1/orders/{}/notes", order_id),
            &vendor("vendor-x"),
            json!({ "body": "Packed and waiting for courier" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(note["body"], "Packed and waiting for courier");

    let (status, _, entries) = send(
        &h.app,
        get(&format!("/v1/orders/{}/timeline", order_id), &vendor("vendor-x")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let entries = entries.as_array().unwrap();
    assert!(entries.iter().any(|e| e["stream"] == "event" && e["kind"] == "order_created"));
    assert_eq!(entries.last().unwrap()["stream"], "note");
}

#[tokio::test]
async fn test_wallet_summary_shows_holds() {
    let h = harness();
    confirmed_order(&h.app).await;

    let (status, _, summary) = send(&h.app, get("/v1/wallet", &vendor("vendor-x"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["on_hold_minor"], 2000);
    assert_eq!(summary["eligible_balance_minor"], 0);

    let (status, _, entries) = send(&h.app, get("/v1/wallet/ledger?source=store", &vendor("vendor-x"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entries.as_array().unwrap().len(), 1);

    let (status, _, check) = send(&h.app, get("/v1/wallet/verify", &vendor("vendor-x"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(check["consistent"], true);
}

#[tokio::test]
async fn test_manual_payout_with_nothing_eligible() {
    let h = harness();
    confirmed_order(&h.app).await;

    let (status, _, _) = send(&h.app, post("/v1/wallet/payouts", &vendor("vendor-x"), json!({}))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_payout_settings_reject_unknown_timezone() {
    let h = harness();
    let req = Request::builder()
        .method("PUT")
        .uri("/v1/wallet/payout-settings")
        .header(header::AUTHORIZATION, vendor("vendor-x"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({
                "frequency": "weekly",
                "cutoff": { "weekday": "Sun", "hour": 23 },
                "payout": { "weekday": "Wed", "hour": 10 },
                "timezone": "Mars/Olympus"
            })
            .to_string(),
        ))
        .unwrap();
    let (status, _, body) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "invalid");
}

#[tokio::test]
async fn test_metrics_endpoint_is_public() {
    let h = harness();
    let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let response = h.app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
