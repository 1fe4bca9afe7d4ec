use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tempfile::tempdir;

use crate::backend::{
    ChatBackend, ChatCompletion, ChatRequest, Role, ToolCallRequest, parse_completion,
};
use crate::cli::{Cli, Commands, EmbedDevice};
use crate::config::{
    RuntimeConfig, ToolServerConfig, load_profiles, resolve_runtime_config,
};
use crate::markers::{GRAD_TAG, MarkerBlock, PLAN_TAG, extract_tagged, parse_planner_turn};
use crate::orchestrator::{Orchestrator, PlanExtract, inject_requirements};
use crate::rag::{
    HashEmbedder, IndexOrigin, RagConfig, RagService, cache_signature, cosine, split_into_chunks,
};
use crate::refine::gradient_is_zero;
use crate::session::Session;
use crate::telemetry::TelemetrySink;
use crate::tool_agent::{ToolAgent, ToolInvoker, parse_tool_arguments};
use crate::transport::{ToolDescriptor, qualified_tool_name};

fn base_cfg() -> RuntimeConfig {
    RuntimeConfig {
        profile: "default".to_string(),
        config_path: ".scantree/config.toml".to_string(),
        backend_url: "http://localhost/unused".to_string(),
        model: Some("mock-model".to_string()),
        service: Some("mqtt".to_string()),
        docs: Vec::new(),
        temperature: 0.0,
        max_plan_iterations: 10,
        max_tool_iterations: 3,
        embed_model: "feature-hash-256".to_string(),
        embed_device: EmbedDevice::Cpu,
        chunk_size: 16,
        chunk_overlap: 4,
        default_top_k: 2,
        persist_dir: ".scantree/test-index".to_string(),
        telemetry_enabled: false,
        telemetry_path: ".scantree/test-telemetry.jsonl".to_string(),
        tool_servers: Vec::new(),
    }
}

fn test_telemetry(cfg: &RuntimeConfig) -> TelemetrySink {
    TelemetrySink::new(cfg, "test".to_string())
}

fn rag_cfg(docs: Vec<String>, persist_dir: &str) -> RagConfig {
    RagConfig {
        docs,
        embed_model: "feature-hash-256".to_string(),
        embed_device: EmbedDevice::Cpu,
        chunk_size: 8,
        chunk_overlap: 2,
        default_top_k: 2,
        persist_dir: persist_dir.to_string(),
    }
}

fn text_reply(text: &str) -> ScriptStep {
    ScriptStep::Reply(ChatCompletion {
        content: Some(text.to_string()),
        tool_calls: Vec::new(),
    })
}

fn tool_reply(content: Option<&str>, calls: Vec<ToolCallRequest>) -> ScriptStep {
    ScriptStep::Reply(ChatCompletion {
        content: content.map(str::to_string),
        tool_calls: calls,
    })
}

#[derive(Clone)]
enum ScriptStep {
    Reply(ChatCompletion),
    Fail(String),
}

/// Scripted backend: replays steps in order (repeating the last one when the
/// script runs out) and records every request it saw.
struct MockBackend {
    script: Vec<ScriptStep>,
    cursor: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockBackend {
    fn new(script: Vec<ScriptStep>) -> Arc<Self> {
        Arc::new(Self {
            script,
            cursor: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    fn request(&self, index: usize) -> ChatRequest {
        self.requests.lock().expect("requests lock")[index].clone()
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .get(index)
            .or_else(|| self.script.last())
            .expect("script must not be empty");
        match step {
            ScriptStep::Reply(completion) => Ok(completion.clone()),
            ScriptStep::Fail(message) => Err(anyhow::anyhow!("model backend error: {message}")),
        }
    }
}

enum ScriptedOutcome {
    Reply { text: String, delay_ms: u64 },
    Fail(String),
}

/// Scripted tool invoker keyed by raw tool name; records invocations.
struct ScriptedInvoker {
    outcomes: HashMap<String, ScriptedOutcome>,
    calls: Mutex<Vec<(String, Map<String, Value>)>>,
}

impl ScriptedInvoker {
    fn new(outcomes: Vec<(&str, ScriptedOutcome)>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: outcomes
                .into_iter()
                .map(|(name, outcome)| (name.to_string(), outcome))
                .collect(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn recorded(&self) -> Vec<(String, Map<String, Value>)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl ToolInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        _server_id: &str,
        raw_name: &str,
        arguments: Map<String, Value>,
    ) -> Result<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((raw_name.to_string(), arguments));
        match self.outcomes.get(raw_name) {
            Some(ScriptedOutcome::Reply { text, delay_ms }) => {
                if *delay_ms > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(*delay_ms)).await;
                }
                Ok(text.clone())
            }
            Some(ScriptedOutcome::Fail(message)) => Err(anyhow::anyhow!("{message}")),
            None => Ok("(no scripted outcome)".to_string()),
        }
    }
}

fn retrieval_descriptor(server_id: &str) -> (String, ToolDescriptor) {
    (
        server_id.to_string(),
        ToolDescriptor {
            qualified_name: qualified_tool_name(server_id, "retrieve_document_chunks"),
            description: "retrieve chunks".to_string(),
            input_schema: json!({ "type": "object", "properties": { "query": { "type": "string" } } }),
        },
    )
}

fn test_agent(
    backend: Arc<MockBackend>,
    invoker: Arc<ScriptedInvoker>,
    tools: Vec<(String, ToolDescriptor)>,
) -> ToolAgent {
    let cfg = base_cfg();
    ToolAgent::with_invoker(
        backend,
        invoker,
        tools,
        "mock-model".to_string(),
        0.0,
        cfg.max_tool_iterations,
        test_telemetry(&cfg),
    )
}

// --- cache signature -------------------------------------------------------

#[test]
fn cache_signature_is_deterministic() {
    let dir = tempdir().expect("temp directory should create");
    let doc = dir.path().join("a.txt");
    std::fs::write(&doc, "mqtt connect packet layout").expect("doc should write");
    let docs = vec![doc.to_string_lossy().to_string()];

    let first = cache_signature(&docs, "feature-hash-256", 64, 8).expect("signature");
    let second = cache_signature(&docs, "feature-hash-256", 64, 8).expect("signature");
    assert_eq!(first, second);
}

#[test]
fn cache_signature_changes_when_content_changes() {
    let dir = tempdir().expect("temp directory should create");
    let doc = dir.path().join("a.txt");
    std::fs::write(&doc, "mqtt connect packet layout").expect("doc should write");
    let docs = vec![doc.to_string_lossy().to_string()];

    let before = cache_signature(&docs, "feature-hash-256", 64, 8).expect("signature");
    std::fs::write(&doc, "mqtt connect packet layoux").expect("doc should rewrite");
    let after = cache_signature(&docs, "feature-hash-256", 64, 8).expect("signature");
    assert_ne!(before, after);
}

#[test]
fn cache_signature_ignores_path_order() {
    let dir = tempdir().expect("temp directory should create");
    let a = dir.path().join("a.txt");
    let b = dir.path().join("b.txt");
    std::fs::write(&a, "alpha doc").expect("doc should write");
    std::fs::write(&b, "beta doc").expect("doc should write");
    let a = a.to_string_lossy().to_string();
    let b = b.to_string_lossy().to_string();

    let forward =
        cache_signature(&[a.clone(), b.clone()], "feature-hash-256", 64, 8).expect("signature");
    let reverse = cache_signature(&[b, a], "feature-hash-256", 64, 8).expect("signature");
    assert_eq!(forward, reverse);
}

#[test]
fn cache_signature_sensitive_to_chunk_parameters() {
    let dir = tempdir().expect("temp directory should create");
    let doc = dir.path().join("a.txt");
    std::fs::write(&doc, "mqtt connect packet layout").expect("doc should write");
    let docs = vec![doc.to_string_lossy().to_string()];

    let base = cache_signature(&docs, "feature-hash-256", 64, 8).expect("signature");
    let other_chunk = cache_signature(&docs, "feature-hash-256", 32, 8).expect("signature");
    let other_model = cache_signature(&docs, "feature-hash-512", 64, 8).expect("signature");
    assert_ne!(base, other_chunk);
    assert_ne!(base, other_model);
}

// --- retrieval service -----------------------------------------------------

#[test]
fn initialize_reuses_persisted_index_when_signature_matches() {
    let dir = tempdir().expect("temp directory should create");
    let doc = dir.path().join("proto.txt");
    std::fs::write(&doc, "the connect packet starts with a fixed header byte")
        .expect("doc should write");
    let persist = dir.path().join("index");
    let cfg = rag_cfg(
        vec![doc.to_string_lossy().to_string()],
        &persist.to_string_lossy(),
    );

    let built = RagService::initialize(&cfg).expect("first initialize should build");
    assert_eq!(built.origin(), IndexOrigin::Rebuilt);

    // Second startup over the same documents must not re-run the build.
    let reused = RagService::initialize(&cfg).expect("second initialize should load");
    assert_eq!(reused.origin(), IndexOrigin::Loaded);
    assert_eq!(reused.chunk_count(), built.chunk_count());
}

#[test]
fn initialize_rebuilds_when_a_document_changes() {
    let dir = tempdir().expect("temp directory should create");
    let doc = dir.path().join("proto.txt");
    std::fs::write(&doc, "the connect packet starts with a fixed header byte")
        .expect("doc should write");
    let persist = dir.path().join("index");
    let cfg = rag_cfg(
        vec![doc.to_string_lossy().to_string()],
        &persist.to_string_lossy(),
    );

    RagService::initialize(&cfg).expect("first initialize should build");
    std::fs::write(&doc, "the connect packet now starts with a different byte")
        .expect("doc should rewrite");
    let rebuilt = RagService::initialize(&cfg).expect("changed docs should rebuild");
    assert_eq!(rebuilt.origin(), IndexOrigin::Rebuilt);
}

#[test]
fn initialize_fails_on_missing_document() {
    let dir = tempdir().expect("temp directory should create");
    let persist = dir.path().join("index");
    let cfg = rag_cfg(
        vec![dir.path().join("absent.txt").to_string_lossy().to_string()],
        &persist.to_string_lossy(),
    );

    let err = RagService::initialize(&cfg).expect_err("missing document must be fatal");
    assert!(err.to_string().contains("document file not found"));
}

#[test]
fn initialize_fails_on_empty_document_set() {
    let dir = tempdir().expect("temp directory should create");
    let doc = dir.path().join("empty.txt");
    std::fs::write(&doc, "   \n  \n").expect("doc should write");
    let persist = dir.path().join("index");
    let cfg = rag_cfg(
        vec![doc.to_string_lossy().to_string()],
        &persist.to_string_lossy(),
    );

    let err = RagService::initialize(&cfg).expect_err("empty document set must be fatal");
    assert!(err.to_string().contains("no document content"));
}

#[test]
fn retrieve_falls_back_to_default_top_k() {
    let dir = tempdir().expect("temp directory should create");
    let doc = dir.path().join("proto.txt");
    let body = (0..10)
        .map(|i| format!("section {i} describes the connect packet header field {i}"))
        .collect::<Vec<String>>()
        .join("\n");
    std::fs::write(&doc, body).expect("doc should write");
    let persist = dir.path().join("index");
    let cfg = rag_cfg(
        vec![doc.to_string_lossy().to_string()],
        &persist.to_string_lossy(),
    );

    let service = RagService::initialize(&cfg).expect("initialize should build");
    assert!(service.chunk_count() > 2, "need more chunks than the default top-k");

    let with_none = service.retrieve("connect packet header", None);
    let with_zero = service.retrieve("connect packet header", Some(0));
    let with_negative = service.retrieve("connect packet header", Some(-3));
    assert_eq!(with_none.len(), 2);
    assert_eq!(with_zero.len(), 2);
    assert_eq!(with_negative.len(), 2);
}

#[test]
fn retrieve_orders_chunks_by_score_descending() {
    let dir = tempdir().expect("temp directory should create");
    let doc = dir.path().join("proto.txt");
    std::fs::write(
        &doc,
        "connect packet header flags described here in detail for handshakes\n\
         totally unrelated prose about gardening and weather patterns today\n\
         another unrelated passage describing culinary techniques at length",
    )
    .expect("doc should write");
    let persist = dir.path().join("index");
    let cfg = rag_cfg(
        vec![doc.to_string_lossy().to_string()],
        &persist.to_string_lossy(),
    );

    let service = RagService::initialize(&cfg).expect("initialize should build");
    let chunks = service.retrieve("connect packet header flags", Some(3));
    assert!(!chunks.is_empty());
    for pair in chunks.windows(2) {
        assert!(pair[0].score >= pair[1].score, "scores must be descending");
    }
    assert!(chunks[0].text.contains("connect packet header"));
}

#[test]
fn retrieve_returns_empty_for_no_match_query() {
    let dir = tempdir().expect("temp directory should create");
    let doc = dir.path().join("proto.txt");
    std::fs::write(&doc, "connect packet header flags").expect("doc should write");
    let persist = dir.path().join("index");
    let cfg = rag_cfg(
        vec![doc.to_string_lossy().to_string()],
        &persist.to_string_lossy(),
    );

    let service = RagService::initialize(&cfg).expect("initialize should build");
    // A query with no tokens embeds to the zero vector; everything scores
    // zero but the call still succeeds.
    let chunks = service.retrieve("!!", Some(1));
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].score, 0.0);
}

#[test]
fn hash_embedder_is_deterministic_and_normalized() {
    let embedder = HashEmbedder::new("feature-hash-256");
    let a = embedder.embed("connect packet header");
    let b = embedder.embed("connect packet header");
    assert_eq!(a, b);
    let self_similarity = cosine(&a, &b);
    assert!((self_similarity - 1.0).abs() < 1e-5);
}

#[test]
fn split_into_chunks_overlaps_windows() {
    let text = "a b c d e f g h i j";
    let chunks = split_into_chunks(text, 4, 2);
    assert_eq!(chunks[0], "a b c d");
    assert_eq!(chunks[1], "c d e f");
    assert!(chunks.last().expect("chunks not empty").contains('j'));

    assert!(split_into_chunks("   ", 4, 2).is_empty());
}

// --- marker parsing --------------------------------------------------------

#[test]
fn extract_tagged_requires_closing_marker() {
    assert_eq!(
        extract_tagged("<Plan>1 root</Plan>", PLAN_TAG),
        MarkerBlock::Present("1 root".to_string())
    );
    assert!(extract_tagged("<Plan>1 root", PLAN_TAG).is_absent());
    assert!(extract_tagged("no markers at all", PLAN_TAG).is_absent());
    // A closing tag with no opening tag is absence too, not a slice from 0.
    assert!(extract_tagged("1 root</Plan>", PLAN_TAG).is_absent());
}

#[test]
fn planner_turn_extracts_plan_and_clarification_independently() {
    let both = parse_planner_turn(
        "<Plan>1 connect\n1.1 send probe</Plan>\n<Task>What is the magic byte?</Task>",
    );
    assert_eq!(
        both.plan.as_deref(),
        Some("1 connect\n1.1 send probe")
    );
    assert_eq!(both.clarification.as_deref(), Some("What is the magic byte?"));

    let plan_only = parse_planner_turn("<Plan>1 connect</Plan> no task this round");
    assert!(plan_only.clarification.is_absent());
    assert!(!plan_only.plan.is_absent());
}

#[test]
fn gradient_zero_detection_handles_labelled_sections() {
    let zero = "Packet Construction Gradient:\nZero\n\nPacket Sending Gradient:\n[Zero]\n\nResponse Parsing Gradient:\nzero";
    assert!(gradient_is_zero(zero));

    let nonzero = "Packet Construction Gradient:\nZero\n\nPacket Sending Gradient:\nUse a longer client id";
    assert!(!gradient_is_zero(nonzero));

    assert!(!gradient_is_zero(""), "an empty gradient is not zero");
    assert!(extract_tagged("<Grad> Zero </Grad>", GRAD_TAG).as_deref() == Some("Zero"));
}

// --- session ---------------------------------------------------------------

#[test]
fn session_keeps_single_system_turn_first() {
    let mut session = Session::new("persona");
    session.push_user("question");
    session.push_assistant(Some("draft".to_string()), Vec::new());
    session.push_tool("call-1", "docs_retrieve_document_chunks", "result");
    session.push_assistant(None, Vec::new());

    assert_eq!(session.turns()[0].role, Role::System);
    let system_turns = session
        .turns()
        .iter()
        .filter(|turn| turn.role == Role::System)
        .count();
    assert_eq!(system_turns, 1);
    assert_eq!(session.last_assistant_text(), Some("draft"));
}

// --- backend parsing -------------------------------------------------------

#[test]
fn parse_completion_branches_on_choices_vs_error() {
    let ok = json!({
        "choices": [{ "message": { "role": "assistant", "content": "hello" } }]
    });
    let completion = parse_completion(&ok).expect("choices body should parse");
    assert_eq!(completion.content.as_deref(), Some("hello"));
    assert!(completion.tool_calls.is_empty());

    let with_calls = json!({
        "choices": [{ "message": {
            "role": "assistant",
            "tool_calls": [{
                "id": "call-1",
                "type": "function",
                "function": { "name": "docs_retrieve_document_chunks", "arguments": "{\"query\":\"x\"}" }
            }]
        } }]
    });
    let completion = parse_completion(&with_calls).expect("tool-call body should parse");
    assert_eq!(completion.tool_calls.len(), 1);
    assert_eq!(
        completion.tool_calls[0].function.name,
        "docs_retrieve_document_chunks"
    );

    let error = json!({ "error": { "message": "quota exhausted" } });
    let err = parse_completion(&error).expect_err("error body must fail");
    assert!(err.to_string().contains("quota exhausted"));

    let neither = json!({ "unexpected": true });
    assert!(parse_completion(&neither).is_err());
}

#[test]
fn parse_tool_arguments_degrades_to_empty_on_non_objects() {
    let object = parse_tool_arguments("t", "{\"query\": \"connect\", \"top_k\": 3}");
    assert_eq!(object.get("query"), Some(&json!("connect")));

    assert!(parse_tool_arguments("t", "").is_empty());
    assert!(parse_tool_arguments("t", "[1, 2]").is_empty());
    assert!(parse_tool_arguments("t", "not json at all").is_empty());
    assert!(parse_tool_arguments("t", "\"quoted\"").is_empty());
}

// --- tool agent ------------------------------------------------------------

#[tokio::test]
async fn tool_agent_terminates_within_budget_when_model_always_calls_tools() {
    let call = ToolCallRequest::function_call(
        "call-1",
        "docs_retrieve_document_chunks",
        "{\"query\": \"header\"}",
    );
    let backend = MockBackend::new(vec![tool_reply(None, vec![call])]);
    let invoker = ScriptedInvoker::new(vec![(
        "retrieve_document_chunks",
        ScriptedOutcome::Reply {
            text: "[\"chunk\"]".to_string(),
            delay_ms: 0,
        },
    )]);
    let agent = test_agent(backend.clone(), invoker, vec![retrieval_descriptor("docs")]);

    let answer = agent.answer("what is the header?").await.expect("answer");
    assert!(!answer.is_empty(), "budget exhaustion must yield a result");
    assert_eq!(backend.calls(), 3, "one model call per round, bounded by the budget");
}

#[tokio::test]
async fn tool_agent_returns_plain_content_as_final_answer() {
    let backend = MockBackend::new(vec![text_reply("The header is 0x10.")]);
    let invoker = ScriptedInvoker::new(Vec::new());
    let agent = test_agent(backend.clone(), invoker, vec![retrieval_descriptor("docs")]);

    let answer = agent.answer("what is the header?").await.expect("answer");
    assert_eq!(answer, "The header is 0x10.");
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn tool_round_appends_results_in_request_order_even_when_first_fails() {
    let first = ToolCallRequest::function_call(
        "call-1",
        "docs_retrieve_document_chunks",
        "{\"query\": \"a\"}",
    );
    let second =
        ToolCallRequest::function_call("call-2", "docs_lookup_defaults", "{\"query\": \"b\"}");
    let backend = MockBackend::new(vec![
        tool_reply(None, vec![first, second]),
        text_reply("done"),
    ]);
    let invoker = ScriptedInvoker::new(vec![
        (
            "retrieve_document_chunks",
            ScriptedOutcome::Fail("index unavailable".to_string()),
        ),
        (
            "lookup_defaults",
            // Finishes after the failed call would have; order must still be
            // the request order.
            ScriptedOutcome::Reply {
                text: "[\"defaults\"]".to_string(),
                delay_ms: 25,
            },
        ),
    ]);
    let agent = test_agent(
        backend.clone(),
        invoker,
        vec![
            retrieval_descriptor("docs"),
            (
                "docs".to_string(),
                ToolDescriptor {
                    qualified_name: qualified_tool_name("docs", "lookup_defaults"),
                    description: "lookup defaults".to_string(),
                    input_schema: json!({ "type": "object" }),
                },
            ),
        ],
    );

    let answer = agent.answer("question").await.expect("answer");
    assert_eq!(answer, "done");
    assert_eq!(backend.calls(), 2, "next model call only after the full round");

    let second_request = backend.request(1);
    let tool_turns = second_request
        .messages
        .iter()
        .filter(|turn| turn.role == Role::Tool)
        .collect::<Vec<_>>();
    assert_eq!(tool_turns.len(), 2, "both calls must appear as tool turns");
    assert_eq!(tool_turns[0].tool_call_id.as_deref(), Some("call-1"));
    assert_eq!(tool_turns[1].tool_call_id.as_deref(), Some("call-2"));
    assert!(
        tool_turns[0]
            .content
            .as_deref()
            .unwrap_or_default()
            .contains("index unavailable"),
        "the failure must surface as an error tool turn"
    );
    assert_eq!(tool_turns[1].content.as_deref(), Some("[\"defaults\"]"));
}

#[tokio::test]
async fn tool_agent_synthesizes_error_turn_for_unknown_tool() {
    let unknown =
        ToolCallRequest::function_call("call-9", "ghost_server_missing_tool", "{}");
    let backend = MockBackend::new(vec![tool_reply(None, vec![unknown]), text_reply("recovered")]);
    let invoker = ScriptedInvoker::new(Vec::new());
    let agent = test_agent(backend.clone(), invoker.clone(), vec![retrieval_descriptor("docs")]);

    let answer = agent.answer("question").await.expect("answer");
    assert_eq!(answer, "recovered", "the loop must continue past the unknown tool");
    assert!(invoker.recorded().is_empty(), "nothing reaches the transport");

    let second_request = backend.request(1);
    let tool_turn = second_request
        .messages
        .iter()
        .find(|turn| turn.role == Role::Tool)
        .expect("error tool turn must be present");
    assert_eq!(tool_turn.tool_call_id.as_deref(), Some("call-9"));
    assert!(
        tool_turn
            .content
            .as_deref()
            .unwrap_or_default()
            .contains("not registered")
    );
}

#[tokio::test]
async fn tool_agent_passes_empty_arguments_for_malformed_payloads() {
    let call = ToolCallRequest::function_call(
        "call-1",
        "docs_retrieve_document_chunks",
        "not an object",
    );
    let backend = MockBackend::new(vec![tool_reply(None, vec![call]), text_reply("ok")]);
    let invoker = ScriptedInvoker::new(vec![(
        "retrieve_document_chunks",
        ScriptedOutcome::Reply {
            text: "[]".to_string(),
            delay_ms: 0,
        },
    )]);
    let agent = test_agent(backend, invoker.clone(), vec![retrieval_descriptor("docs")]);

    let answer = agent.answer("question").await.expect("answer");
    assert_eq!(answer, "ok");

    let recorded = invoker.recorded();
    assert_eq!(recorded.len(), 1, "the call is still dispatched");
    assert!(recorded[0].1.is_empty(), "malformed arguments degrade to empty");
}

// --- orchestrator ----------------------------------------------------------

fn agent_answering(text: &str) -> (Arc<MockBackend>, ToolAgent) {
    let backend = MockBackend::new(vec![text_reply(text)]);
    let invoker = ScriptedInvoker::new(Vec::new());
    let agent = test_agent(backend.clone(), invoker, Vec::new());
    (backend, agent)
}

#[tokio::test]
async fn orchestrator_returns_plan_when_no_clarification_is_raised() {
    let cfg = base_cfg();
    let planner = MockBackend::new(vec![text_reply("<Plan>1 verify service</Plan>")]);
    let (_, agent) = agent_answering("unused");
    let orchestrator = Orchestrator::new(
        planner.clone(),
        "mock-model".to_string(),
        0.0,
        test_telemetry(&cfg),
    );

    let run = orchestrator
        .run(&agent, "build the plan for {service}", Some("mqtt"), None, 10)
        .await
        .expect("run should succeed");

    assert_eq!(run.plan, PlanExtract::Plan("1 verify service".to_string()));
    assert_eq!(run.rounds_used, 1);
    assert_eq!(run.clarifications, 0);
    assert_eq!(planner.calls(), 1);
}

#[tokio::test]
async fn orchestrator_folds_clarification_answer_into_next_prompt() {
    let cfg = base_cfg();
    let planner = MockBackend::new(vec![
        text_reply("<Plan>1 connect</Plan><Task>What byte opens the handshake?</Task>"),
        text_reply("<Plan>1 connect\n1.1 send 0x10</Plan>"),
    ]);
    let (answer_backend, agent) = agent_answering("The opening byte is 0x10.");
    let orchestrator = Orchestrator::new(
        planner.clone(),
        "mock-model".to_string(),
        0.0,
        test_telemetry(&cfg),
    );

    let run = orchestrator
        .run(&agent, "build the plan", None, None, 10)
        .await
        .expect("run should succeed");

    assert_eq!(
        run.plan,
        PlanExtract::Plan("1 connect\n1.1 send 0x10".to_string())
    );
    assert_eq!(run.rounds_used, 2);
    assert_eq!(run.clarifications, 1);
    assert_eq!(answer_backend.calls(), 1, "one clarification answered");

    // The second planner prompt is the agent's answer plus the format
    // reminder.
    let second_prompt = planner.request(1);
    let last_user = second_prompt
        .messages
        .iter()
        .rev()
        .find(|turn| turn.role == Role::User)
        .and_then(|turn| turn.content.as_deref())
        .expect("second user prompt present");
    assert!(last_user.starts_with("The opening byte is 0x10."));
    assert!(last_user.contains("<Plan> ... </Plan>"));
}

#[tokio::test]
async fn orchestrator_stops_at_budget_and_returns_best_effort_plan() {
    let cfg = base_cfg();
    // The planner raises a clarification every round; only the budget stops
    // the loop.
    let planner = MockBackend::new(vec![tool_reply(
        Some("<Plan>1 connect</Plan><Task>one more thing?</Task>"),
        Vec::new(),
    )]);
    let (answer_backend, agent) = agent_answering("answer");
    let orchestrator = Orchestrator::new(
        planner.clone(),
        "mock-model".to_string(),
        0.0,
        test_telemetry(&cfg),
    );

    let run = orchestrator
        .run(&agent, "build the plan", None, None, 3)
        .await
        .expect("budget exhaustion is not an error");

    assert_eq!(run.rounds_used, 3);
    assert_eq!(planner.calls(), 3);
    assert_eq!(answer_backend.calls(), 2, "no clarification after the final round");
    assert_eq!(run.plan, PlanExtract::Plan("1 connect".to_string()));
}

#[tokio::test]
async fn orchestrator_aborts_on_backend_failure_without_retry() {
    let cfg = base_cfg();
    let planner = MockBackend::new(vec![ScriptStep::Fail("upstream quota".to_string())]);
    let (_, agent) = agent_answering("unused");
    let orchestrator = Orchestrator::new(
        planner.clone(),
        "mock-model".to_string(),
        0.0,
        test_telemetry(&cfg),
    );

    let err = orchestrator
        .run(&agent, "build the plan", None, None, 10)
        .await
        .expect_err("backend failure aborts the run");
    assert!(format!("{err:#}").contains("upstream quota"));
    assert_eq!(planner.calls(), 1, "no retry");
}

#[tokio::test]
async fn orchestrator_yields_absent_sentinel_when_plan_marker_is_unclosed() {
    let cfg = base_cfg();
    let planner = MockBackend::new(vec![text_reply("<Plan>1 connect without closing tag")]);
    let (_, agent) = agent_answering("unused");
    let orchestrator = Orchestrator::new(
        planner,
        "mock-model".to_string(),
        0.0,
        test_telemetry(&cfg),
    );

    let run = orchestrator
        .run(&agent, "build the plan", None, None, 10)
        .await
        .expect("marker absence is a sentinel, not an error");
    assert!(run.plan.is_absent());
}

#[test]
fn inject_requirements_fills_placeholders_or_appends() {
    let filled = inject_requirements(
        "Plan for {service}.\nRequirements:\n{requirements}",
        Some("mqtt"),
        Some("ipv4 only"),
    );
    assert!(filled.contains("Plan for mqtt."));
    assert!(filled.contains("ipv4 only"));
    assert!(!filled.contains("{requirements}"));

    let appended = inject_requirements("Plan for {service}.", Some("mqtt"), Some("ipv4 only"));
    assert!(appended.ends_with("Requirements:\nipv4 only"));

    let defaulted = inject_requirements("Reqs: {requirements}", None, None);
    assert_eq!(defaulted, "Reqs: No requirements");
}

// --- configuration ---------------------------------------------------------

fn tool_server_cfg() -> ToolServerConfig {
    ToolServerConfig {
        id: "service-docs".to_string(),
        command: None,
        docs: vec!["docs/mqtt.txt".to_string(), "docs/mqtt-v5.txt".to_string()],
        embed_model: "feature-hash-256".to_string(),
        embed_device: EmbedDevice::Cpu,
        chunk_size: 1024,
        chunk_overlap: 128,
        default_top_k: 5,
        persist_dir: ".scantree/index".to_string(),
        log_file: Some(".scantree/server.log".to_string()),
        enabled: true,
    }
}

#[test]
fn tool_server_argv_encoding_is_stable() {
    let argv = tool_server_cfg().to_argv();
    assert_eq!(
        argv,
        vec![
            "--server-name",
            "service-docs",
            "--docs",
            "docs/mqtt.txt",
            "docs/mqtt-v5.txt",
            "--embed-model",
            "feature-hash-256",
            "--embed-device",
            "cpu",
            "--chunk-size",
            "1024",
            "--chunk-overlap",
            "128",
            "--default-top-k",
            "5",
            "--persist-dir",
            ".scantree/index",
            "--log-file",
            ".scantree/server.log",
        ]
    );
}

#[test]
fn tool_server_validation_rejects_degenerate_configs() {
    let mut cfg = tool_server_cfg();
    cfg.chunk_overlap = cfg.chunk_size;
    assert!(cfg.validate().is_err(), "overlap must be below chunk size");

    let mut cfg = tool_server_cfg();
    cfg.docs.clear();
    assert!(cfg.validate().is_err(), "docs are required");

    let mut cfg = tool_server_cfg();
    cfg.id = "  ".to_string();
    assert!(cfg.validate().is_err(), "id is required");

    assert!(tool_server_cfg().validate().is_ok());
}

fn test_cli(config_path: &str, profile: &str) -> Cli {
    Cli {
        profile: profile.to_string(),
        config_path: config_path.to_string(),
        backend_url: None,
        model: None,
        service: None,
        docs: Vec::new(),
        temperature: None,
        max_plan_iterations: None,
        max_tool_iterations: None,
        embed_model: None,
        embed_device: None,
        chunk_size: None,
        chunk_overlap: None,
        default_top_k: None,
        persist_dir: None,
        telemetry_enabled: None,
        telemetry_path: None,
        log_filter: "warn".to_string(),
        command: Commands::Doctor,
    }
}

#[test]
fn resolve_runtime_config_applies_defaults_and_synthesizes_doc_server() {
    let dir = tempdir().expect("temp directory should create");
    let config_path = dir.path().join("config.toml");
    std::fs::write(
        &config_path,
        "[profiles.mqtt]\n\
         model = \"test-model\"\n\
         service = \"mqtt\"\n\
         docs = [\"docs/mqtt.txt\"]\n",
    )
    .expect("config should write");
    let config_path = config_path.to_string_lossy().to_string();

    let profiles = load_profiles(&config_path).expect("profiles should load");
    let cli = test_cli(&config_path, "mqtt");
    let cfg = resolve_runtime_config(&cli, &profiles).expect("config should resolve");

    assert_eq!(cfg.model.as_deref(), Some("test-model"));
    assert_eq!(cfg.max_plan_iterations, 10);
    assert_eq!(cfg.max_tool_iterations, 5);
    assert_eq!(cfg.chunk_size, 1024);
    assert_eq!(cfg.chunk_overlap, 128);

    // Configured documents back a single synthesized retrieval server.
    assert_eq!(cfg.tool_servers.len(), 1);
    assert_eq!(cfg.tool_servers[0].id, "service-docs");
    assert_eq!(cfg.tool_servers[0].docs, vec!["docs/mqtt.txt".to_string()]);
    assert!(cfg.tool_servers[0].enabled);
}

#[test]
fn resolve_runtime_config_rejects_unknown_profiles() {
    let dir = tempdir().expect("temp directory should create");
    let config_path = dir.path().join("config.toml");
    std::fs::write(&config_path, "[profiles.known]\nservice = \"irc\"\n")
        .expect("config should write");
    let config_path = config_path.to_string_lossy().to_string();

    let profiles = load_profiles(&config_path).expect("profiles should load");
    let cli = test_cli(&config_path, "missing");
    let err = resolve_runtime_config(&cli, &profiles).expect_err("unknown profile must fail");
    assert!(err.to_string().contains("known"), "error lists available profiles");
}

#[test]
fn load_profiles_rejects_unknown_fields() {
    let dir = tempdir().expect("temp directory should create");
    let config_path = dir.path().join("config.toml");
    std::fs::write(&config_path, "[profiles.default]\nnot_a_field = 1\n")
        .expect("config should write");

    assert!(load_profiles(&config_path.to_string_lossy()).is_err());
}

#[test]
fn qualified_names_disambiguate_servers() {
    assert_eq!(
        qualified_tool_name("mqtt-docs", "retrieve_document_chunks"),
        "mqtt-docs_retrieve_document_chunks"
    );
    assert_ne!(
        qualified_tool_name("a", "retrieve_document_chunks"),
        qualified_tool_name("b", "retrieve_document_chunks")
    );
}

// --- telemetry -------------------------------------------------------------

#[test]
fn telemetry_sink_appends_jsonl_records_when_enabled() {
    let dir = tempdir().expect("temp directory should create");
    let mut cfg = base_cfg();
    cfg.telemetry_enabled = true;
    cfg.telemetry_path = dir
        .path()
        .join("telemetry.jsonl")
        .to_string_lossy()
        .to_string();

    let sink = TelemetrySink::new(&cfg, "test".to_string());
    sink.emit("plan.round", json!({ "round": 1 }));
    sink.emit("plan.completed", json!({ "rounds": 1 }));

    let content = std::fs::read_to_string(&cfg.telemetry_path).expect("telemetry file");
    let lines = content.lines().collect::<Vec<&str>>();
    assert_eq!(lines.len(), 2);
    let first: Value = serde_json::from_str(lines[0]).expect("line parses");
    assert_eq!(first.get("event"), Some(&json!("plan.round")));
    assert_eq!(first.get("round"), Some(&json!(1)));
}
