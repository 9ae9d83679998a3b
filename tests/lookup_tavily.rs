//! Tavily lookup adapter and context gathering against a mock HTTP server.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use voxrelay::config::LookupConfig;
use voxrelay::lookup::{ContextLookup, LOOKUP_UNAVAILABLE_NOTE, TavilyLookup, gather_context};

fn config(server: &MockServer) -> LookupConfig {
    LookupConfig {
        url: format!("{}/search", server.uri()),
        max_results: 2,
        snippet_chars: 20,
        ..LookupConfig::default()
    }
}

#[tokio::test]
async fn search_sends_query_and_truncates_results() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .and(header("authorization", "Bearer tavily-key"))
        .and(body_partial_json(json!({
            "query": "weather in Paris today",
            "max_results": 2,
            "search_depth": "basic"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                {"title": "Forecast", "url": "https://a.example", "content": "Sunny, 24C"},
                {"title": "Radar", "url": "https://b.example", "content": "No rain"},
                {"title": "Extra", "url": "https://c.example", "content": "ignored"}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let lookup = TavilyLookup::new(&config(&server), "tavily-key").unwrap();
    let results = lookup.search("weather in Paris today").await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].title, "Forecast");
    assert_eq!(results[1].content, "No rain");
}

#[tokio::test]
async fn triggered_turn_gets_formatted_context() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{
                "title": "Headlines",
                "url": "https://news.example",
                "content": "A very long article body that will be cut short"
            }]
        })))
        .mount(&server)
        .await;

    let config = config(&server);
    let lookup = TavilyLookup::new(&config, "k").unwrap();
    let context = gather_context(&lookup, &config, "What's the latest news?")
        .await
        .unwrap();
    assert!(context.contains("Title: Headlines"));
    assert!(context.contains("Source: https://news.example"));
    assert!(!context.contains("cut short"));
}

#[tokio::test]
async fn server_error_degrades_to_note() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let config = config(&server);
    let lookup = TavilyLookup::new(&config, "k").unwrap();
    assert!(lookup.search("news").await.is_err());
    let context = gather_context(&lookup, &config, "any news today?").await;
    assert_eq!(context.as_deref(), Some(LOOKUP_UNAVAILABLE_NOTE));
}

#[tokio::test]
async fn slow_search_is_cut_off_by_client_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"results": []}))
                .set_delay(std::time::Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let config = LookupConfig {
        timeout_secs: 1,
        ..config(&server)
    };
    let lookup = TavilyLookup::new(&config, "k").unwrap();
    let started = std::time::Instant::now();
    let err = lookup.search("news").await.unwrap_err();
    assert!(started.elapsed() < std::time::Duration::from_secs(4));
    assert!(err.to_string().contains("request failed"), "{err}");
}

#[tokio::test]
async fn untriggered_turn_makes_no_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
        .expect(0)
        .mount(&server)
        .await;

    let config = config(&server);
    let lookup = TavilyLookup::new(&config, "k").unwrap();
    assert!(gather_context(&lookup, &config, "Tell me a joke").await.is_none());
}
