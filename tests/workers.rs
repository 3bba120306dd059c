//! Worker lifecycle through the full stack: hot reload by version,
//! load-failure recovery, body caps in both directions, selection across
//! a custom worker pool, and admission limits.

mod common;

use axum::http::{Method, StatusCode};
use common::{assert_status, body_json, body_string, serve};
use fluxion::config::{ExecutorOptions, WorkerSpec, WorkerStrategy};

#[tokio::test]
async fn rewriting_a_handler_reloads_it_with_one_restart() {
    let server = serve(&[("cc.mjs", "export default () => 'v1';")], |_| {}).await;

    assert_eq!(body_string(server.get("/cc").await).await, "v1");

    // Different length guarantees a different version token even when the
    // mtime granularity is coarse.
    server.write("cc.mjs", "export default () => 'v2-longer';");
    assert_eq!(body_string(server.get("/cc").await).await, "v2-longer");

    let workers = body_json(server.get("/_fluxion/workers").await).await;
    assert_eq!(workers["workers"][0]["restartCount"], 1);
    assert_eq!(
        workers["workers"][0]["lastRestartReason"],
        "handler version changed"
    );
}

#[tokio::test]
async fn broken_default_export_recovers_after_a_fix() {
    let server = serve(&[("h.mjs", "export default { broken: true };")], |_| {}).await;

    let response = server.get("/h").await;
    assert_status(&response, StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert_eq!(body["message"], "Internal Server Error");

    server.write("h.mjs", "export default () => 'fixed now';");
    let response = server.get("/h").await;
    assert_status(&response, StatusCode::OK);
    assert_eq!(body_string(response).await, "fixed now");
}

#[tokio::test]
async fn request_bodies_are_capped_and_echoed() {
    let echo = "export default (req) => String(req.bodyText ? req.bodyText.length : 0);";
    let server = serve(&[("echo.mjs", echo)], |config| {
        config.max_request_bytes = 8;
    })
    .await;

    let over = server.request(Method::POST, "/echo", b"123456789").await;
    assert_status(&over, StatusCode::PAYLOAD_TOO_LARGE);
    let body = body_json(over).await;
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("request body too large"));

    let under = server.request(Method::POST, "/echo", b"12345").await;
    assert_status(&under, StatusCode::OK);
    assert_eq!(body_string(under).await, "5");
}

#[tokio::test]
async fn oversized_responses_fail_with_the_cap_message() {
    let server = serve(
        &[(
            "big.mjs",
            "export default (req, res) => { res.write('x'.repeat(400)); };",
        )],
        |config| {
            config.worker_options = ExecutorOptions {
                max_response_bytes: Some(128),
                ..Default::default()
            };
        },
    )
    .await;

    let response = server.get("/big").await;
    assert_status(&response, StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("worker response too large"));
    assert_eq!(body["code"], "WORKER_RESPONSE_TOO_LARGE");
}

#[tokio::test]
async fn handlers_route_to_the_minimal_satisfying_worker() {
    let small = "export default { handler: (req, res, ctx) => ctx.worker.id, db: ['db1'] };";
    let wide =
        "export default { handler: (req, res, ctx) => ctx.worker.id, db: ['db1', 'db2'] };";
    let server = serve(&[("small.mjs", small), ("wide.mjs", wide)], |config| {
        config.databases = vec!["db1".to_string(), "db2".to_string()];
        config.worker_strategy = WorkerStrategy::Custom(vec![WorkerSpec {
            id: "w1".to_string(),
            db: vec!["db1".to_string()],
            overrides: ExecutorOptions::default(),
        }]);
    })
    .await;

    let workers = body_json(server.get("/_fluxion/workers").await).await;
    let list = workers["workers"].as_array().unwrap();
    assert_eq!(list.len(), 2);
    assert!(list
        .iter()
        .any(|w| w["id"] == "fluxion-worker-all" && w["isFallbackAllDb"] == true));

    // The handler replies with the id of the worker that ran it.
    assert_eq!(body_string(server.get("/small").await).await, "w1");
    assert_eq!(
        body_string(server.get("/wide").await).await,
        "fluxion-worker-all"
    );
}

#[tokio::test]
async fn admission_cap_returns_worker_overloaded() {
    let slow = "export default () => { \
                const end = Date.now() + 400; while (Date.now() < end) {} \
                return 'slow-done'; };";
    let server = serve(&[("slow.mjs", slow)], |config| {
        config.worker_options = ExecutorOptions {
            max_inflight: Some(1),
            request_timeout_ms: Some(5_000),
            ..Default::default()
        };
    })
    .await;

    // Populate the metadata cache so both requests dispatch directly.
    assert_status(&server.get("/slow").await, StatusCode::OK);

    let (first, second) = tokio::join!(server.get("/slow"), server.get("/slow"));
    let statuses = [first.status(), second.status()];
    assert!(statuses.contains(&StatusCode::OK));
    assert!(statuses.contains(&StatusCode::SERVICE_UNAVAILABLE));

    let overloaded = if first.status() == StatusCode::SERVICE_UNAVAILABLE {
        first
    } else {
        second
    };
    let body = body_json(overloaded).await;
    assert_eq!(body["code"], "WORKER_OVERLOADED");
}

#[tokio::test]
async fn stuck_handlers_time_out_and_the_worker_recovers() {
    let server = serve(
        &[
            ("stuck.mjs", "export default () => { for (;;) {} };"),
            ("ok.mjs", "export default () => 'alive';"),
        ],
        |config| {
            config.worker_options = ExecutorOptions {
                request_timeout_ms: Some(300),
                ..Default::default()
            };
        },
    )
    .await;

    let response = server.get("/stuck").await;
    assert_status(&response, StatusCode::GATEWAY_TIMEOUT);
    let body = body_json(response).await;
    assert_eq!(body["code"], "WORKER_TIMEOUT");

    // The pool auto-recovered; the next request succeeds.
    assert_eq!(body_string(server.get("/ok").await).await, "alive");
}

#[tokio::test]
async fn handler_exceptions_are_contained() {
    let server = serve(
        &[("boom.mjs", "export default () => { throw new Error('kaput'); };")],
        |_| {},
    )
    .await;

    let response = server.get("/boom").await;
    assert_status(&response, StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert_eq!(body["message"], "Internal Server Error");
    assert_eq!(body["error"], "HandlerError");

    // The worker keeps running: same handler, same failure, no crash.
    assert_status(&server.get("/boom").await, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn handler_can_shape_the_full_response() {
    let source = "export default (req, res) => { \
                  res.status(418); \
                  res.setHeader('x-kind', 'teapot'); \
                  res.json({ short: true, stout: true }); };";
    let server = serve(&[("pot.mjs", source)], |_| {}).await;

    let response = server.get("/pot").await;
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    assert_eq!(response.headers().get("x-kind").unwrap(), "teapot");
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/json"
    );
    let body = body_json(response).await;
    assert_eq!(body["short"], true);
}

#[tokio::test]
async fn worker_snapshot_tracks_loaded_handlers() {
    let server = serve(&[("a.mjs", "export default () => 'a';")], |_| {}).await;
    assert_status(&server.get("/a").await, StatusCode::OK);

    let workers = body_json(server.get("/_fluxion/workers").await).await;
    let worker = &workers["workers"][0];
    assert_eq!(worker["status"], "running");
    assert_eq!(worker["trackedHandlers"], 1);
    assert!(worker["handlers"][0]["filePath"]
        .as_str()
        .unwrap()
        .ends_with("a.mjs"));
    assert_eq!(worker["limits"]["maxInflight"], 64);
    assert_eq!(worker["dbSet"].as_array().unwrap().len(), 0);
}
