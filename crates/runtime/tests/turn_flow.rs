//! End-to-end turn scenarios: SQL-then-summary, time-travel rebinding,
//! loop-limit terminals, duplicate-call stops, and the shrinking tool
//! set after a successful python run.

mod common;

use std::sync::Arc;

use common::{harness, EchoRunner, KeyedClient, Step};
use wl_domain::event::EventType;
use wl_domain::job::TurnRequest;
use wl_providers::scripted::ScriptedClient;
use wl_providers::LlmResponse;

fn sql_call(call_id: &str, sql: &str) -> LlmResponse {
    LlmResponse::with_tool_call(call_id, "run_sql", serde_json::json!({"sql": sql}))
}

#[tokio::test]
async fn simple_sql_then_summary() {
    let client = Arc::new(ScriptedClient::new(vec![
        sql_call("call_1", "SELECT 1 AS x"),
        LlmResponse::text_only("one row"),
    ]));
    let h = harness(client);

    let outcome = h
        .service
        .run(&h.worldline_id, TurnRequest::new("how many?"))
        .await
        .unwrap();

    assert_eq!(outcome.worldline_id, h.worldline_id);
    let types: Vec<EventType> = outcome.events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![
            EventType::UserMessage,
            EventType::ToolCallSql,
            EventType::ToolResultSql,
            EventType::AssistantMessage,
        ]
    );

    let result = &outcome.events[2];
    assert_eq!(result.payload["rows"][0][0], 1);
    assert_eq!(result.payload["row_count"], 1);
    assert_eq!(outcome.events[3].text(), Some("one row"));

    // Head moved with each append: the final assistant event is the head
    // and the chain links back through the whole turn.
    let worldline = h.service.store().worldline(&h.worldline_id).unwrap();
    assert_eq!(
        worldline.head_event_id.as_deref(),
        Some(outcome.events[3].id.as_str())
    );
    for pair in outcome.events.windows(2) {
        assert_eq!(pair[1].parent_event_id.as_deref(), Some(pair[0].id.as_str()));
    }
}

#[tokio::test]
async fn time_travel_rebinds_the_turn() {
    // Seed an anchor event to branch from.
    let seed = Arc::new(ScriptedClient::new(vec![LlmResponse::text_only("anchor")]));
    let h = harness(seed);
    let anchor_outcome = h
        .service
        .run(&h.worldline_id, TurnRequest::new("seed"))
        .await
        .unwrap();
    let anchor_event = anchor_outcome.events.last().unwrap();

    // New service turn: time travel from the anchor, then finish.
    let client = Arc::new(ScriptedClient::new(vec![
        LlmResponse::with_tool_call(
            "call_tt",
            "time_travel",
            serde_json::json!({"from_event_id": anchor_event.id, "name": "alt"}),
        ),
        LlmResponse::text_only("done"),
    ]));
    let h2 = {
        let providers = Arc::new(wl_providers::ProviderRegistry::new());
        providers.register("test", client);
        // Reuse the same data dir so the seeded worldline is visible.
        let runner = Arc::new(EchoRunner::new(h.service.store().datadb().data_dir()));
        common::Harness {
            service: wl_runtime::ChatService::new(
                wl_domain::config::RuntimeConfig {
                    data_dir: h.service.store().datadb().data_dir().to_path_buf(),
                    ..wl_domain::config::RuntimeConfig::default()
                },
                providers,
                runner.clone(),
            )
            .unwrap(),
            runner,
            _tmp: h._tmp,
            thread_id: h.thread_id.clone(),
            worldline_id: h.worldline_id.clone(),
        }
    };

    let outcome = h2
        .service
        .run(&h2.worldline_id, TurnRequest::new("try an alternate path"))
        .await
        .unwrap();

    // The turn ended on a different worldline.
    assert_ne!(outcome.worldline_id, h2.worldline_id);
    let branched = h2.service.store().worldline(&outcome.worldline_id).unwrap();
    assert_eq!(branched.parent_worldline_id.as_deref(), Some(h2.worldline_id.as_str()));
    assert_eq!(branched.forked_from_event_id.as_deref(), Some(anchor_event.id.as_str()));
    assert_eq!(branched.name, "alt");

    // Prologue on the new worldline, then the final assistant message.
    let types: Vec<EventType> = outcome.events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![
            EventType::WorldlineCreated,
            EventType::TimeTravel,
            EventType::UserMessage,
            EventType::AssistantMessage,
        ]
    );
    assert_eq!(outcome.events[2].text(), Some("try an alternate path"));
    assert_eq!(outcome.events[3].text(), Some("done"));
    assert_eq!(
        outcome.events[0].parent_event_id.as_deref(),
        Some(anchor_event.id.as_str())
    );
}

#[tokio::test]
async fn loop_limit_records_state_trace() {
    // Every iteration asks for another (distinct) SQL call; the cap is
    // max_iterations, so the turn ends with the loop-limit terminal.
    let client = Arc::new(ScriptedClient::looping(vec![
        sql_call("call_1", "SELECT 1"),
        sql_call("call_2", "SELECT 2"),
    ]));
    let h = harness(client);

    let mut request = TurnRequest::new("keep going");
    request.max_iterations = 2;
    let outcome = h.service.run(&h.worldline_id, request).await.unwrap();

    let assistant = outcome.events.last().unwrap();
    assert!(assistant
        .text()
        .unwrap()
        .to_lowercase()
        .contains("i reached the tool-loop limit"));
    let trace = assistant.payload["state_trace"].as_array().unwrap();
    assert!(trace
        .iter()
        .any(|step| step["reason"] == "max_iterations_reached"));
}

#[tokio::test]
async fn duplicate_tool_call_stops_the_turn() {
    // The same normalized arguments twice (aliased the second time, with
    // a different call id) — the dedup signature must still match.
    let client = Arc::new(ScriptedClient::new(vec![
        sql_call("call_1", "SELECT 42"),
        LlmResponse::with_tool_call("call_2", "run_sql", serde_json::json!({"query": "SELECT 42"})),
        LlmResponse::text_only("never reached"),
    ]));
    let h = harness(client);

    let outcome = h
        .service
        .run(&h.worldline_id, TurnRequest::new("again"))
        .await
        .unwrap();

    let assistant = outcome.events.last().unwrap();
    assert!(assistant.text().unwrap().contains("repeated the same tool call"));

    // Only one call/result pair was executed.
    let sql_calls = outcome
        .events
        .iter()
        .filter(|e| e.event_type == EventType::ToolCallSql)
        .count();
    assert_eq!(sql_calls, 1);
}

#[tokio::test]
async fn python_success_shrinks_the_offered_tools() {
    let client = Arc::new(KeyedClient::new().route(
        "plot this",
        vec![
            Step::Respond(LlmResponse::with_tool_call(
                "call_py",
                "run_python",
                serde_json::json!({"code": "print('hi')"}),
            )),
            Step::Respond(LlmResponse::text_only("plotted")),
        ],
    ));
    let h = harness(client.clone());

    let outcome = h
        .service
        .run(&h.worldline_id, TurnRequest::new("plot this"))
        .await
        .unwrap();
    assert_eq!(outcome.events.last().unwrap().text(), Some("plotted"));

    let requests = client.requests.lock();
    assert_eq!(requests.len(), 2);
    let first_tools: Vec<&str> = requests[0].tools.iter().map(|t| t.name.as_str()).collect();
    assert!(first_tools.contains(&"run_python"));
    let second_tools: Vec<&str> = requests[1].tools.iter().map(|t| t.name.as_str()).collect();
    assert!(!second_tools.contains(&"run_python"));
    assert!(second_tools.contains(&"run_sql"));
}

#[tokio::test]
async fn empty_message_is_rejected_before_side_effects() {
    let client = Arc::new(ScriptedClient::new(vec![]));
    let h = harness(client);

    let err = h
        .service
        .run(&h.worldline_id, TurnRequest::new("   "))
        .await
        .unwrap_err();
    assert!(matches!(err, wl_domain::Error::BadRequest(_)));
    assert!(h
        .service
        .store()
        .events_since_rowid(&h.worldline_id, 0)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn unknown_worldline_is_not_found() {
    let client = Arc::new(ScriptedClient::new(vec![]));
    let h = harness(client);
    let err = h
        .service
        .run("worldline_missing", TurnRequest::new("hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, wl_domain::Error::NotFound(_)));
}
