mod support;

use std::sync::Arc;

use chrono::{FixedOffset, TimeZone};
use naistrip::config::Settings;
use naistrip::download::{
    DownloadDispatcher, DownloadPipeline, FileDownloadDispatcher, LogKind,
};
use naistrip::metadata::{extract, HistoryStore};
use naistrip::store::SqliteKvStore;
use naistrip::transcode::{Degradation, ImageFetcher, ImageSource, OutputFormat, Transcoder};
use pretty_assertions::assert_eq;
use serde_json::json;

use support::{novelai_png, png_with, sqlite_store, text, RecordingDispatcher};

#[tokio::test]
async fn local_png_is_recorded_stripped_and_written() {
    let work = tempfile::tempdir().expect("tempdir");
    let source_path = work.path().join("grid_0.png");
    std::fs::write(&source_path, novelai_png()).expect("write source png");
    let out_dir = work.path().join("out");

    let store = sqlite_store(work.path());
    let dispatcher = Arc::new(FileDownloadDispatcher::new(
        out_dir.as_path(),
        ImageFetcher::new().expect("client should build"),
    ));
    let pipeline = DownloadPipeline::new(
        Transcoder::new().expect("transcoder should build"),
        store,
        Arc::clone(&dispatcher) as Arc<dyn DownloadDispatcher>,
    );
    let settings = Settings {
        filename: String::from("{seed}_{index}"),
        sub_dir: String::from("nai/{model}"),
        format: OutputFormat::Png,
        quality: 0.2,
        ..Settings::default()
    }
    .normalized();
    assert_eq!(settings.quality, 1.0);

    let now = FixedOffset::east_opt(9 * 3600)
        .expect("offset")
        .with_ymd_and_hms(2024, 1, 15, 8, 0, 0)
        .single()
        .expect("time");
    let outcome = pipeline
        .download_item_at(ImageSource::File(source_path.clone()), 1, &settings, now)
        .await;
    let saved = outcome.saved().expect("image should be dispatched");
    assert_eq!(saved.filename, "nai/NovelAI Diffusion V4/3141592653_01.png");
    assert_eq!(saved.degradation, None);

    let flushed = dispatcher.flush().await;
    assert_eq!(flushed.written, 1);
    let written = std::fs::read(
        out_dir
            .join("nai")
            .join("NovelAI Diffusion V4")
            .join("3141592653_01.png"),
    )
    .expect("stripped png written");
    assert!(extract(&written).is_empty());
    assert!(!extract(&std::fs::read(&source_path).expect("source")).is_empty());

    let reopened = HistoryStore::new(Arc::new(SqliteKvStore::new(work.path().join("store.db"))));
    let records = reopened.list().expect("history should load");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.prompt, "artist:kuro, 1girl, beach");
    assert_eq!(record.characters, vec![String::from("girl, red hair")]);
    assert_eq!(record.artist_tags, vec![String::from("kuro")]);
    assert_eq!(record.model, "NovelAI Diffusion V4");
    assert_eq!(record.uc.as_deref(), Some("lowres"));
    assert_eq!(record.mime_type, "image/png");
    assert!(record.source_url.starts_with("file://"));
    assert_eq!(
        serde_json::to_value(record).expect("record json")["seed"],
        json!(3141592653u64)
    );
}

#[tokio::test]
async fn batch_of_visible_images_uses_one_based_indices() {
    let work = tempfile::tempdir().expect("tempdir");
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let pipeline = Arc::new(DownloadPipeline::new(
        Transcoder::new().expect("transcoder should build"),
        sqlite_store(work.path()),
        Arc::clone(&dispatcher) as Arc<dyn DownloadDispatcher>,
    ));

    let plain = naistrip::transcode::codec::to_data_url("image/png", &png_with(3, 3, &[]));
    let described = naistrip::transcode::codec::to_data_url(
        "image/png",
        &png_with(3, 3, &[text("Description", "a cat")]),
    );
    let settings = Settings {
        filename: String::from("shot_{index}"),
        format: OutputFormat::Webp,
        ..Settings::default()
    };
    let batch = pipeline
        .download_visible(Some(vec![plain, described, String::from("  ")]), &settings)
        .await
        .expect("batch expected");
    assert_eq!(batch.len(), 2);
    let outcomes = batch.wait().await;
    assert_eq!(outcomes.len(), 2);

    assert_eq!(
        dispatcher.filenames(),
        vec![String::from("shot_01.webp"), String::from("shot_02.webp")]
    );
    let records = pipeline.history().list().expect("history");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].prompt, "a cat");
    assert_eq!(records[0].filename, "shot_02.webp");

    let kinds = pipeline
        .activity()
        .entries()
        .expect("activity")
        .into_iter()
        .map(|entry| entry.kind)
        .collect::<Vec<_>>();
    assert_eq!(kinds.iter().filter(|k| **k == LogKind::Success).count(), 3);
}

#[tokio::test]
async fn unreachable_remote_source_falls_back_to_its_url() {
    let work = tempfile::tempdir().expect("tempdir");
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let pipeline = DownloadPipeline::new(
        Transcoder::new().expect("transcoder should build"),
        sqlite_store(work.path()),
        Arc::clone(&dispatcher) as Arc<dyn DownloadDispatcher>,
    );
    let settings = Settings {
        filename: String::from("remote_{index}"),
        ..Settings::default()
    };

    let outcome = pipeline
        .download_item(
            ImageSource::parse("http://127.0.0.1:9/grid/image.webp?token=1"),
            4,
            &settings,
        )
        .await;
    let saved = outcome.saved().expect("original should still be dispatched");
    assert_eq!(saved.degradation, Some(Degradation::FetchFailed));
    assert_eq!(saved.filename, "remote_04.webp");
    let requests = dispatcher.requests.lock().expect("requests lock").clone();
    assert_eq!(requests[0].url, "http://127.0.0.1:9/grid/image.webp?token=1");
    assert_eq!(
        pipeline.activity().entries().expect("activity").last().map(|e| e.kind),
        Some(LogKind::Warn)
    );
}
