use anyhow::Result;
use async_trait::async_trait;
use feed_etl::app::ports::{HttpClientPort, HttpGetResult, TransportError};
use feed_etl::config::Config;
use feed_etl::infra::{ManualClock, SqliteDocumentStore};
use feed_etl::pipeline::{PipelineOrchestrator, PipelineState};
use feed_etl::storage::{DocumentStore, InMemoryDocumentStore};
use feed_etl::types::RecordProfile;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

/// Replays canned responses in order, then answers with an empty page
struct ScriptedHttp {
    responses: Mutex<VecDeque<Result<HttpGetResult, TransportError>>>,
    empty_page: Value,
}

impl ScriptedHttp {
    fn new(responses: Vec<Result<HttpGetResult, TransportError>>, empty_page: Value) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            empty_page,
        })
    }
}

#[async_trait]
impl HttpClientPort for ScriptedHttp {
    async fn get(&self, _url: &str, _query: &[(String, String)]) -> Result<HttpGetResult, TransportError> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(reply(200, self.empty_page.clone())))
    }
}

fn reply(status: u16, body: Value) -> HttpGetResult {
    HttpGetResult {
        status,
        bytes: body.to_string().into_bytes(),
        content_type: "application/json".to_string(),
        retry_after: None,
    }
}

fn cve(id: &str, description: &str, published: &str) -> Value {
    json!({
        "cve": {
            "id": id,
            "published": published,
            "lastModified": published,
            "vulnStatus": "Analyzed",
            "descriptions": [{"lang": "en", "value": description}],
            "metrics": {
                "cvssMetricV31": [{
                    "type": "Primary",
                    "cvssData": {"version": "3.1", "baseScore": 7.5, "baseSeverity": "HIGH"}
                }]
            },
            "references": [{"url": "https://example.test/advisory"}]
        }
    })
}

fn nvd_page(items: Vec<Value>, total: usize) -> Value {
    json!({"resultsPerPage": items.len(), "startIndex": 0, "totalResults": total, "vulnerabilities": items})
}

fn nvd_config() -> Config {
    let mut config = Config::default();
    config.api.base_url = Some("https://nvd.example.test/rest/json/cves/2.0".to_string());
    config.extract.page_size = 2;
    config.store.batch_size = 2;
    config
}

fn five_cves(description: &str) -> Vec<Value> {
    (1..=5)
        .map(|n| cve(&format!("CVE-2024-000{}", n), description, "2024-03-01T10:00:00.000"))
        .collect()
}

#[tokio::test]
async fn test_rerun_is_idempotent() -> Result<()> {
    let store = Arc::new(InMemoryDocumentStore::new());
    let empty = json!({"vulnerabilities": []});

    for (run, description) in ["A heap overflow in the parser", "A heap overflow in the parser (revised)"]
        .iter()
        .enumerate()
    {
        let http = ScriptedHttp::new(vec![Ok(reply(200, nvd_page(five_cves(description), 5)))], empty.clone());
        let orchestrator = PipelineOrchestrator::from_config(
            &nvd_config(),
            http,
            Arc::new(ManualClock::default()),
            Box::new(store.clone()),
        );
        let stats = orchestrator.run().await?;

        assert_eq!(stats.state, PipelineState::Completed);
        assert_eq!(stats.records_extracted, 5);
        if run == 0 {
            assert_eq!((stats.records_inserted, stats.records_updated), (5, 0));
        } else {
            assert_eq!((stats.records_inserted, stats.records_updated), (0, 5));
        }
    }

    assert_eq!(store.count().await?, 5);
    let doc = store.find("CVE-2024-0004").await?.unwrap();
    assert_eq!(doc["description"], "A heap overflow in the parser (revised)");
    assert_eq!(doc["etl_metadata"]["data_quality_score"], 1.0);
    Ok(())
}

#[tokio::test]
async fn test_sustained_rate_limiting_truncates_gracefully() -> Result<()> {
    let first = nvd_page(five_cves("Use after free in the renderer")[..2].to_vec(), 5);
    let http = ScriptedHttp::new(
        vec![
            Ok(reply(200, first)),
            Ok(reply(429, json!({"message": "slow down"}))),
            Ok(reply(429, json!({"message": "slow down"}))),
            Ok(reply(429, json!({"message": "slow down"}))),
        ],
        json!({"vulnerabilities": []}),
    );
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(InMemoryDocumentStore::new());

    let stats = PipelineOrchestrator::from_config(&nvd_config(), http, clock.clone(), Box::new(store.clone()))
        .run()
        .await?;

    assert_eq!(stats.state, PipelineState::Completed);
    assert!(stats.extraction_truncated);
    assert_eq!(stats.pages_fetched, 1);
    assert_eq!(stats.records_extracted, 2);
    assert_eq!(stats.records_inserted, 2);
    assert_eq!(store.count().await?, 2);
    // every request after the first waited at least the rate-limit delay
    assert!(clock.elapsed() >= Duration::from_secs(18));
    Ok(())
}

#[tokio::test]
async fn test_posts_profile_into_sqlite() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("etl.db");

    let mut config = Config::default();
    config.api.profile = RecordProfile::Posts;
    config.api.base_url = Some("https://posts.example.test/posts".to_string());
    config.extract.page_size = 3;
    config.extract.rate_limit_delay_secs = 0.0;
    config.store.path = db_path.display().to_string();
    config.store.collection = "posts".to_string();

    let posts = json!([
        {"userId": 1, "id": 1, "title": "sunt aut facere", "body": "quia et suscipit recusandae consequuntur"},
        {"userId": 1, "id": 2, "title": "qui est esse", "body": "est rerum tempore vitae sequi sint"},
        {"userId": 2, "title": "no id here", "body": "dropped"}
    ]);
    let http = ScriptedHttp::new(vec![Ok(reply(200, posts))], json!([]));
    let store = SqliteDocumentStore::open(&db_path, "posts")?;

    let stats = PipelineOrchestrator::from_config(&config, http, Arc::new(ManualClock::default()), Box::new(store))
        .run()
        .await?;

    assert_eq!(stats.records_extracted, 3);
    assert_eq!(stats.records_rejected, 1);
    assert_eq!(stats.records_inserted, 2);
    let summary = stats.collection.unwrap();
    assert_eq!(summary.total_records, 2);
    assert_eq!(summary.distinct_categories, 1);

    // the connection was released with the orchestrator; reopen and read back
    let reopened = SqliteDocumentStore::open(&db_path, "posts")?;
    let doc = reopened.find("2").await?.unwrap();
    assert_eq!(doc["etl_metadata"]["source"], "jsonplaceholder_api");
    assert_eq!(doc["original_data"]["title"], "qui est esse");
    Ok(())
}

#[tokio::test]
async fn test_malformed_response_is_fatal() -> Result<()> {
    let http = ScriptedHttp::new(
        vec![Ok(reply(200, json!({"unexpected": true})))],
        json!({"vulnerabilities": []}),
    );
    let failure = PipelineOrchestrator::from_config(
        &nvd_config(),
        http,
        Arc::new(ManualClock::default()),
        Box::new(InMemoryDocumentStore::new()),
    )
    .run()
    .await
    .unwrap_err();

    assert_eq!(failure.stage, PipelineState::Extracting);
    assert_eq!(failure.stats.records_extracted, 0);
    assert!(failure.stats.finished_at.is_some());
    Ok(())
}
