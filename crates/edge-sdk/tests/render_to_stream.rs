//! End-to-end renders with scripted drivers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edge_sdk::prelude::*;
use tokio::sync::oneshot;

/// Page that suspends on one async value and renders it.
struct GreetingPage {
    resolver_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl RenderDriver for GreetingPage {
    async fn render(self, out: DriverOutput, cx: RenderContext) -> anyhow::Result<()> {
        out.on_head_write("<html><body>")?;

        let name = loop {
            let calls = self.resolver_calls.clone();
            let outcome = cx.use_async("user", "r1", move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok("Ada".to_string()) }
            });
            match outcome {
                Suspense::Done(name) => break name,
                Suspense::Pending(suspended) => suspended.await,
                Suspense::Error(err) => return Err(err.into()),
            }
        };

        out.on_renderer_write(format!("<p>{}</p>", name))?;
        out.on_renderer_write("</body></html>")?;
        Ok(())
    }
}

#[tokio::test]
async fn test_streamed_render_with_data_island() {
    let sink = BufferSink::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let page = GreetingPage {
        resolver_calls: calls.clone(),
    };

    let stream = render_to_stream(page, sink.clone(), RenderOptions::default())
        .await
        .unwrap();
    assert!(!stream.disabled());
    assert!(stream.stream_end().await.unwrap());

    let island = r#"<script class="edge-streaming_initData" type="application/json">{"key":"\"user\"","value":"Ada","elementId":"r1"}</script>"#;
    assert_eq!(
        sink.contents(),
        format!("<html><body>{}<p>Ada</p></body></html>", island)
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(sink.is_ended());
}

#[tokio::test]
async fn test_client_replay_reuses_delivered_value() {
    let sink = BufferSink::new();
    let page = GreetingPage {
        resolver_calls: Arc::new(AtomicUsize::new(0)),
    };
    let stream = render_to_stream(page, sink.clone(), RenderOptions::default())
        .await
        .unwrap();
    stream.stream_end().await.unwrap();

    let client = HydrationContext::from_html(&sink.contents(), &StreamConfig::default());
    let recomputed = Arc::new(AtomicUsize::new(0));
    let value = client.use_async("user", Deps::new(), {
        let recomputed = recomputed.clone();
        move || {
            recomputed.fetch_add(1, Ordering::SeqCst);
            async { Ok("someone else".to_string()) }
        }
    });

    assert_eq!(value.done().as_deref(), Some("Ada"));
    assert_eq!(recomputed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_injection_lands_between_renderer_writes() {
    let sink = BufferSink::new();
    let (proceed, wait) = oneshot::channel::<()>();

    let driver = move |out: DriverOutput, _cx: RenderContext| async move {
        out.on_head_write("A")?;
        wait.await?;
        out.on_renderer_write("B")?;
        anyhow::Ok(())
    };

    let stream = render_to_stream(driver, sink.clone(), RenderOptions::default())
        .await
        .unwrap();
    stream
        .inject_chunk("X", InjectOptions::default())
        .unwrap()
        .await
        .unwrap();
    proceed.send(()).unwrap();

    assert!(stream.stream_end().await.unwrap());
    assert_eq!(sink.contents(), "AXB");
}

#[tokio::test]
async fn test_late_injection_with_close_lease() {
    let sink = BufferSink::new();
    let (proceed, wait) = oneshot::channel::<()>();

    let driver = move |out: DriverOutput, _cx: RenderContext| async move {
        out.on_head_write("<html>")?;
        wait.await?;
        out.on_renderer_write("</html>")?;
        anyhow::Ok(())
    };

    let stream = render_to_stream(driver, sink.clone(), RenderOptions::default())
        .await
        .unwrap();
    let lease = stream.do_not_close();
    proceed.send(()).unwrap();

    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert!(!stream.has_stream_ended());

    stream
        .inject_chunk("<script>late()</script>", InjectOptions::with_flush())
        .unwrap()
        .await
        .unwrap();
    lease.release();

    assert!(stream.stream_end().await.unwrap());
    assert_eq!(sink.contents(), "<html></html><script>late()</script>");

    let err = stream
        .inject_chunk("<script>too_late()</script>", InjectOptions::default())
        .unwrap_err();
    assert!(matches!(err, StreamError::Usage(_)));
    assert!(err.to_string().contains("too_late()"));
}

async fn empty_page(out: DriverOutput, _cx: RenderContext) -> anyhow::Result<()> {
    out.on_head_write("<html>")?;
    out.on_renderer_write("<body></body>")?;
    out.on_renderer_write("</html>")?;
    Ok(())
}

async fn missing_template(_out: DriverOutput, _cx: RenderContext) -> anyhow::Result<()> {
    anyhow::bail!("template missing")
}

async fn crashing_page(out: DriverOutput, _cx: RenderContext) -> anyhow::Result<()> {
    out.on_head_write("<html>")?;
    tokio::task::yield_now().await;
    anyhow::bail!("renderer crashed")
}

async fn page_with_broken_widget(out: DriverOutput, _cx: RenderContext) -> anyhow::Result<()> {
    out.on_head_write("<html>")?;
    out.on_boundary_error(anyhow::anyhow!("widget failed"));
    out.on_renderer_write("<p>fallback</p></html>")?;
    Ok(())
}

async fn hanging_page(out: DriverOutput, _cx: RenderContext) -> anyhow::Result<()> {
    out.on_head_write("<html>")?;
    futures::future::pending::<()>().await;
    Ok(())
}

async fn tiny_page(out: DriverOutput, _cx: RenderContext) -> anyhow::Result<()> {
    out.on_head_write("<html>")?;
    out.on_renderer_write("</html>")?;
    Ok(())
}

#[tokio::test]
async fn test_disabled_streaming_delivers_one_chunk() {
    let sink = BufferSink::new();
    let options = RenderOptions::default()
        .with_user_agent("ExampleBot/1.0")
        .with_policy(|ua: Option<&str>| ua.is_some_and(|ua| ua.contains("Bot")));

    let stream = render_to_stream(empty_page, sink.clone(), options)
        .await
        .unwrap();

    assert!(stream.disabled());
    assert!(stream.has_stream_ended());
    assert_eq!(sink.writes(), vec!["<html><body></body></html>"]);
}

#[tokio::test]
async fn test_driver_failure_before_head_fails_render() {
    let err = render_to_stream(missing_template, BufferSink::new(), RenderOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::FatalDriver(ref m) if m.contains("template missing")));
}

#[tokio::test]
async fn test_driver_failure_after_head_fails_stream_end() {
    let sink = BufferSink::new();
    let stream = render_to_stream(crashing_page, sink.clone(), RenderOptions::default())
        .await
        .unwrap();
    let err = stream.stream_end().await.unwrap_err();

    assert!(err.is_fatal());
    assert_eq!(sink.contents(), "<html>");
}

#[tokio::test]
async fn test_boundary_error_marks_render_unclean() {
    let reported = Arc::new(AtomicUsize::new(0));
    let options = RenderOptions::default().on_boundary_error({
        let reported = reported.clone();
        move |_err| {
            reported.fetch_add(1, Ordering::SeqCst);
        }
    });

    let stream = render_to_stream(page_with_broken_widget, BufferSink::new(), options)
        .await
        .unwrap();

    assert!(!stream.stream_end().await.unwrap());
    assert_eq!(reported.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_aborts_render() {
    let sink = BufferSink::new();
    let config = StreamConfig::default().with_timeout(Some(Duration::from_millis(100)));

    let stream = render_to_stream(hanging_page, sink.clone(), RenderOptions::new(config))
        .await
        .unwrap();
    let pending = stream
        .inject_chunk(Chunk::deferred(futures::future::pending()), InjectOptions::default())
        .unwrap();

    assert!(stream.stream_end().await.unwrap());
    assert!(matches!(pending.await, Err(StreamError::Aborted(_))));
    assert_eq!(sink.contents(), "<html>");
    assert!(sink.is_ended());
}

#[tokio::test]
async fn test_abort_keeps_written_bytes() {
    let sink = BufferSink::new();

    let stream = render_to_stream(hanging_page, sink.clone(), RenderOptions::default())
        .await
        .unwrap();
    stream.abort("client went away");

    assert!(stream.has_stream_ended());
    assert!(stream.stream_end().await.unwrap());
    assert_eq!(sink.contents(), "<html>");
}

#[tokio::test]
async fn test_channel_sink_streams_bytes() {
    use futures::StreamExt;

    let (sink, body) = ChannelSink::new();
    let stream = render_to_stream(tiny_page, sink, RenderOptions::default())
        .await
        .unwrap();
    stream.stream_end().await.unwrap();

    let bytes: Vec<u8> = body.concat().await;
    assert_eq!(String::from_utf8(bytes).unwrap(), "<html></html>");
}
