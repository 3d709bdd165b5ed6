mod common;

use common::{at, init_tracing, FakeSource, RecordingTransport};
use rss_broadcaster::lark::{build_request, render_post, Segment};
use rss_broadcaster::{
    load_marks, sign, Block, BroadcastError, BroadcastPipeline, BroadcastSource, Broadcaster, DeliveryMode, Item,
    LarkWebhook, OutboundMessage, RankedItem, Result, RunContext, WatermarkStore,
};
use std::sync::Arc;
use std::time::Duration;

fn message(header: &str, sources: &[&str]) -> OutboundMessage {
    OutboundMessage {
        header: header.to_string(),
        blocks: sources
            .iter()
            .map(|source| Block {
                source: source.to_string(),
                items: vec![RankedItem {
                    rank: 1,
                    title: format!("{} post", source),
                    link: format!("https://{}.example.com/1", source),
                }],
            })
            .collect(),
    }
}

#[test]
fn test_sign_known_vector() -> Result<()> {
    assert_eq!(sign(1700000000, "abc")?, "VIS10b0EBvzzSdFnuk4tznEmK5wHaruvf/WnViv2yR4=");
    assert_ne!(sign(1700000001, "abc")?, sign(1700000000, "abc")?);
    Ok(())
}

#[test]
fn test_render_post_lines() {
    let post = render_post(&message("Digest", &["alpha", "beta"]));

    assert_eq!(post.title, "Digest");
    assert_eq!(post.content.len(), 4);
    assert_eq!(post.content[0], vec![Segment::text("alpha")]);
    assert_eq!(
        post.content[1],
        vec![
            Segment::text(" 1: "),
            Segment::link("alpha post", "https://alpha.example.com/1")
        ]
    );
}

#[test]
fn test_per_source_post_skips_heading() {
    let post = render_post(&message("alpha", &["alpha"]));

    assert_eq!(post.title, "alpha");
    assert_eq!(post.content.len(), 1);
}

#[test]
fn test_request_wire_format() -> Result<()> {
    let request = build_request(&message("Digest", &["alpha"]), "zh_cn", 1700000000, "abc")?;
    let json = serde_json::to_value(&request)?;

    assert_eq!(
        json,
        serde_json::json!({
            "msg_type": "post",
            "content": {
                "post": {
                    "zh_cn": {
                        "title": "Digest",
                        "content": [
                            [{ "tag": "text", "un_escape": true, "lines": 1, "text": "alpha" }],
                            [
                                { "tag": "text", "un_escape": true, "lines": 1, "text": " 1: " },
                                { "tag": "a", "text": "alpha post", "href": "https://alpha.example.com/1" }
                            ]
                        ]
                    }
                }
            },
            "timestamp": "1700000000",
            "sign": "VIS10b0EBvzzSdFnuk4tznEmK5wHaruvf/WnViv2yR4="
        })
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_deliveries_are_spaced() -> Result<()> {
    init_tracing();

    let transport = Arc::new(RecordingTransport::ok());
    let webhook = LarkWebhook::new(transport.clone(), "https://hook.example/bot".to_string(), "abc".to_string());
    let ctx = RunContext::with_timeout(Duration::from_secs(60));

    let messages = vec![
        message("one", &["one"]),
        message("two", &["two"]),
        message("three", &["three"]),
    ];
    assert_eq!(webhook.deliver_all(&ctx, &messages).await, 3);

    let recorded = transport.recorded();
    assert_eq!(recorded.len(), 3);
    for pair in recorded.windows(2) {
        assert!(pair[1].at.duration_since(pair[0].at) >= Duration::from_secs(1));
    }
    assert_eq!(recorded[0].url, "https://hook.example/bot");
    assert_eq!(recorded[2].body["content"]["post"]["zh_cn"]["title"], "three");
    Ok(())
}

#[tokio::test]
async fn test_rejected_delivery_is_an_error() -> Result<()> {
    init_tracing();

    let transport = Arc::new(RecordingTransport::with_status(400));
    let webhook = LarkWebhook::new(transport.clone(), "https://hook.example/bot".to_string(), "abc".to_string())
        .with_min_spacing(Duration::ZERO);
    let ctx = RunContext::with_timeout(Duration::from_secs(10));

    match webhook.deliver(&ctx, &message("Digest", &["alpha"])).await {
        Err(BroadcastError::Delivery { status, .. }) => assert_eq!(status, 400),
        other => panic!("expected delivery error, got {:?}", other),
    }
    assert_eq!(webhook.deliver_all(&ctx, &[message("Digest", &["alpha"])]).await, 0);
    assert_eq!(transport.recorded().len(), 2);
    Ok(())
}

fn pipeline_parts(transport: Arc<RecordingTransport>) -> (Broadcaster, LarkWebhook) {
    let sources: Vec<Arc<dyn BroadcastSource>> = vec![
        Arc::new(FakeSource::new(
            "alpha",
            vec![
                Item::new("A2", "https://alpha.example.com/2").published(at(11, 0)),
                Item::new("A1", "https://alpha.example.com/1").published(at(10, 0)),
            ],
        )),
        Arc::new(FakeSource::new(
            "beta",
            vec![Item::new("B1", "https://beta.example.com/1").published(at(9, 0))],
        )),
    ];
    let broadcaster = Broadcaster::new(sources, Arc::new(WatermarkStore::new()), "Digest");
    let webhook = LarkWebhook::new(transport, "https://hook.example/bot".to_string(), "abc".to_string())
        .with_min_spacing(Duration::ZERO);
    (broadcaster, webhook)
}

#[tokio::test]
async fn test_pipeline_merged_run_persists_marks() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("x-mark.json");

    let transport = Arc::new(RecordingTransport::ok());
    let (broadcaster, webhook) = pipeline_parts(transport.clone());
    let pipeline = BroadcastPipeline::new(broadcaster, webhook, DeliveryMode::Merged).persist_to(path.clone());
    let ctx = RunContext::with_timeout(Duration::from_secs(30));

    let report = pipeline.run_once(&ctx).await;
    assert_eq!((report.new_items, report.messages, report.delivered), (3, 1, 1));

    let body = &transport.recorded()[0].body;
    assert_eq!(body["content"]["post"]["zh_cn"]["title"], "Digest");

    let saved = load_marks(&path)?;
    assert_eq!(saved.get("alpha"), Some(at(11, 0)));
    assert_eq!(saved.get("beta"), Some(at(9, 0)));

    let again = pipeline.run_once(&ctx).await;
    assert_eq!(again.messages, 0);
    assert_eq!(transport.recorded().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_pipeline_per_source_sends_one_post_each() -> Result<()> {
    init_tracing();

    let transport = Arc::new(RecordingTransport::ok());
    let (broadcaster, webhook) = pipeline_parts(transport.clone());
    let pipeline = BroadcastPipeline::new(broadcaster, webhook, DeliveryMode::PerSource);
    let ctx = RunContext::with_timeout(Duration::from_secs(30));

    let report = pipeline.run_once(&ctx).await;
    assert_eq!((report.new_items, report.messages, report.delivered), (3, 2, 2));

    let titles: Vec<String> = transport
        .recorded()
        .iter()
        .map(|r| r.body["content"]["post"]["zh_cn"]["title"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(titles, vec!["alpha", "beta"]);
    Ok(())
}

#[tokio::test]
async fn test_failed_delivery_still_advances_marks() -> Result<()> {
    init_tracing();

    let transport = Arc::new(RecordingTransport::with_status(500));
    let (broadcaster, webhook) = pipeline_parts(transport);
    let pipeline = BroadcastPipeline::new(broadcaster, webhook, DeliveryMode::Merged);
    let ctx = RunContext::with_timeout(Duration::from_secs(30));

    let report = pipeline.run_once(&ctx).await;
    assert_eq!(report.delivered, 0);
    assert_eq!(pipeline.marks().get("alpha"), Some(at(11, 0)));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_expired_run_does_not_post() -> Result<()> {
    init_tracing();

    let transport = Arc::new(RecordingTransport::ok());
    let webhook = LarkWebhook::new(transport.clone(), "https://hook.example/bot".to_string(), "abc".to_string());
    let ctx = RunContext::with_timeout(Duration::from_secs(1));
    tokio::time::advance(Duration::from_secs(2)).await;

    assert!(ctx.is_expired());
    assert!(matches!(
        webhook.deliver(&ctx, &message("Digest", &["alpha"])).await,
        Err(BroadcastError::Timeout(_))
    ));
    assert!(transport.recorded().is_empty());
    Ok(())
}
