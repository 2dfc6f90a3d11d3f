//! Real adapters, fetcher and model client against a local axum server.

use answerpipe::core::EngineId;
use answerpipe::{Config, LoopState, Pipeline};
use axum::{
    response::Html,
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;

const ARTICLE: &str = "<html><head><title>USD to KRW</title></head><body>\
<nav><a href=\"/\">Markets</a> <a href=\"/fx\">FX</a></nav>\
<article><h1>USD to KRW</h1><p>One US dollar buys 1,382 South Korean won today according to the \
Seoul foreign exchange market close. Traders said the won weakened slightly against the dollar \
after exporters reduced their dollar sales late in the session. The rate is published daily \
and used as the reference for bank quotes.</p></article>\
<footer>Privacy policy</footer></body></html>";

fn chat_reply(system: &str) -> &'static str {
    if system.contains("route user questions") {
        "SEARCH: live exchange rate"
    } else if system.contains("rewrite user questions") {
        "USD KRW exchange rate"
    } else if system.contains("judge whether retrieved sources") {
        "SUFFICIENT"
    } else {
        "One US dollar buys 1,382 South Korean won today [1]."
    }
}

async fn serve() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let article_url = format!("http://{addr}/article");
    let app = Router::new()
        .route(
            "/serp",
            get(move || {
                let link = article_url.clone();
                async move {
                    Json(serde_json::json!({
                        "organic_results": [
                            {"link": link, "title": "USD to KRW rate", "snippet": "USD KRW"}
                        ]
                    }))
                }
            }),
        )
        .route("/article", get(|| async { Html(ARTICLE) }))
        .route(
            "/v1/chat/completions",
            post(|Json(body): Json<serde_json::Value>| async move {
                let system = body["messages"][0]["content"].as_str().unwrap_or("");
                Json(serde_json::json!({
                    "choices": [
                        {"message": {"role": "assistant", "content": chat_reply(system)}}
                    ]
                }))
            }),
        );
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn serpapi_fetch_and_openai_compat_wire_together() {
    let addr = serve().await;
    let mut cfg = Config::default();
    cfg.render.enabled = false;
    cfg.llm.base_url = Some(format!("http://{addr}"));
    cfg.llm.api_key = Some("test".to_string());
    cfg.search.serpapi.api_key = Some("k".to_string());
    cfg.search.serpapi.endpoint = Some(format!("http://{addr}/serp"));

    let pipeline = Pipeline::from_config(Arc::new(cfg)).unwrap();
    let report = pipeline
        .answer_with_report("current USD to KRW exchange rate")
        .await
        .unwrap();

    assert_eq!(report.state, LoopState::Done);
    assert_eq!(report.selection.as_ref().unwrap().as_slice(), &[EngineId::AnswerBox]);
    assert_eq!(report.statuses.len(), 1);
    assert_eq!(report.statuses[0].provider, "serpapi");
    assert!(report.statuses[0].ok);

    let actions: Vec<&str> = report.trace.iter().map(|t| t.action).collect();
    assert_eq!(actions, vec!["search", "extract", "synthesize"]);

    let answer = &report.answer;
    assert!(answer.verified, "answer: {answer:?}");
    assert_eq!(answer.citations.len(), 1);
    assert_eq!(answer.citations[0].url, format!("http://{addr}/article"));
    assert!(answer.text.ends_with("[1]."));
}
