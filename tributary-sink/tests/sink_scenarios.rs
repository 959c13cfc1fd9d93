use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tributary_sink::bucket::BucketStatus;
use tributary_sink::{
    BucketId, BucketSink, CheckpointRollingPolicy, FileMetadata, LocalPartStore, LocalPipeline,
    ObjectPartStore, PipelineOptions, SinkConfig, TwoPhaseCommitter,
};
use tributary_state::CheckpointStore;
use tributary_storage::StorageProvider;
use tributary_types::{from_millis, DataType, Field, FieldValue, Record, Schema, TaskInfo};

fn schema() -> Schema {
    Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("name", DataType::Utf8, true),
        Field::new("p", DataType::Int64, true),
    ])
}

fn record(id: i64, p: i64) -> Record {
    Record::new(
        from_millis(id as u64),
        vec![
            FieldValue::Int64(id),
            FieldValue::Utf8("alpha".to_string()),
            FieldValue::Int64(p),
        ],
    )
}

fn config(path: &str) -> SinkConfig {
    let mut config = SinkConfig::new(path);
    config.partition_fields = vec!["p".to_string()];
    config
}

fn rows(metadata: &[FileMetadata]) -> u64 {
    metadata.iter().map(|m| m.row_count).sum()
}

#[tokio::test]
async fn one_checkpoint_produces_one_file_per_partition() {
    let dir = tempfile::tempdir().unwrap();
    let task_info = TaskInfo::for_test("scenario-one-file-per-partition", "sink");
    let mut sink = BucketSink::new(
        &task_info,
        config(&dir.path().to_string_lossy()),
        &schema(),
        Arc::new(LocalPartStore::new(dir.path())),
    )
    .unwrap();
    sink.init(&task_info, None).await.unwrap();

    for (id, p) in [(1, 1), (2, 2), (3, 1), (4, 1), (5, 2)] {
        sink.insert_record(&record(id, p)).await.unwrap();
    }

    let (_, pre_commits) = sink.checkpoint(&task_info, 1, false).await.unwrap();
    assert_eq!(pre_commits.len(), 2);

    let committed = sink.commit(&task_info, 1).await.unwrap();
    let by_bucket: HashMap<_, _> = committed
        .iter()
        .map(|m| (m.bucket_id.as_str(), m.row_count))
        .collect();
    assert_eq!(by_bucket, HashMap::from([("p=1", 3), ("p=2", 2)]));
    for metadata in &committed {
        assert!(dir.path().join(&metadata.relative_path).is_file());
    }

    // confirming the same checkpoint again publishes nothing new
    assert!(sink.commit(&task_info, 1).await.unwrap().is_empty());
    let files: Vec<_> = std::fs::read_dir(dir.path().join("p=1"))
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(files.len(), 1);
}

#[tokio::test]
async fn size_roll_is_published_at_the_next_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let task_info = TaskInfo::for_test("scenario-size-roll", "sink");
    let mut config = config(&dir.path().to_string_lossy());
    // each encoded row is `{"id":N,"name":"alpha"}\n`, 24 bytes
    config.rolling_policy.file_size_bytes = Some(40);
    let mut sink = BucketSink::new(
        &task_info,
        config,
        &schema(),
        Arc::new(LocalPartStore::new(dir.path())),
    )
    .unwrap();
    sink.init(&task_info, None).await.unwrap();

    sink.insert_record(&record(1, 1)).await.unwrap();
    sink.insert_record(&record(2, 1)).await.unwrap();

    let bucket = sink.writer().bucket(&BucketId::new("p=1")).unwrap();
    assert_eq!(bucket.status(), BucketStatus::Pending);
    assert!(bucket.open_file().is_none());

    sink.insert_record(&record(3, 1)).await.unwrap();
    let bucket = sink.writer().bucket(&BucketId::new("p=1")).unwrap();
    assert_eq!(bucket.open_file().unwrap().part_counter, 1);

    // the rolled file is not reported before a checkpoint covers it
    assert!(sink.commit(&task_info, 1).await.unwrap().is_empty());
    assert!(!dir.path().join("p=1/part-00000-000.json").exists());

    sink.checkpoint(&task_info, 1, false).await.unwrap();
    let committed = sink.commit(&task_info, 1).await.unwrap();
    let files: Vec<_> = committed
        .iter()
        .map(|m| (m.part_counter, m.row_count))
        .collect();
    assert_eq!(files, vec![(0, 2), (1, 1)]);
    assert_eq!(committed[0].size_bytes, 48);
}

#[tokio::test]
async fn restart_never_reuses_published_counters() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().to_string_lossy().to_string();
    let checkpoints = CheckpointStore::new(Arc::new(StorageProvider::in_memory()), "restart");
    let store = Arc::new(LocalPartStore::new(dir.path()));

    let mut options = PipelineOptions::new("restart", 2);
    options.rolling_policy = Some(Arc::new(CheckpointRollingPolicy));

    let mut first = LocalPipeline::start(
        options.clone(),
        config(&base),
        &schema(),
        checkpoints.clone(),
        store.clone(),
    )
    .await
    .unwrap();
    for id in 0..6 {
        first.send(record(id, id % 3)).await.unwrap();
    }
    assert_eq!(first.checkpoint().await.unwrap(), 1);
    let before = first.take_committed();
    assert_eq!(rows(&before), 6);

    // these never reach a checkpoint and are dropped with the writers
    for id in 6..9 {
        first.send(record(id, id % 3)).await.unwrap();
    }
    first.abort().await.unwrap();

    let mut second = LocalPipeline::start(
        options,
        config(&base),
        &schema(),
        checkpoints,
        store,
    )
    .await
    .unwrap();
    assert_eq!(second.next_epoch(), 2);
    for id in 9..12 {
        second.send(record(id, id % 3)).await.unwrap();
    }
    let reported = second.finish().await.unwrap();

    // the restored checkpoint is confirmed again on startup; its files are reported unchanged
    let (replayed, after): (Vec<_>, Vec<_>) =
        reported.into_iter().partition(|m| m.checkpoint_id == 1);
    for m in &replayed {
        assert!(before.contains(m));
    }
    assert_eq!(rows(&after), 3);

    let router = tributary_sink::BucketRouter::new(2).unwrap();
    let mut triples = HashSet::new();
    for m in before.iter().chain(after.iter()) {
        assert!(triples.insert((m.subtask_index, m.bucket_id.clone(), m.part_counter)));
        assert_eq!(
            m.subtask_index as usize,
            router.route(&BucketId::new(m.bucket_id.clone()))
        );
    }
    for m in &after {
        let max_before = before
            .iter()
            .filter(|b| b.subtask_index == m.subtask_index && b.bucket_id == m.bucket_id)
            .map(|b| b.part_counter)
            .max();
        if let Some(max_before) = max_before {
            assert!(m.part_counter > max_before);
        }
    }

    // nothing in progress is left behind
    for m in before.iter().chain(after.iter()) {
        let bucket_dir = dir.path().join(&m.bucket_id);
        for entry in std::fs::read_dir(bucket_dir).unwrap() {
            let name = entry.unwrap().file_name().to_string_lossy().to_string();
            assert!(!name.ends_with(".inprogress"), "{} left behind", name);
        }
    }
}

#[tokio::test]
async fn object_store_pipeline() {
    let storage = Arc::new(StorageProvider::in_memory());
    let checkpoints = CheckpointStore::new(Arc::new(StorageProvider::in_memory()), "objects");

    let mut options = PipelineOptions::new("objects", 3);
    options.checkpoint_every = Some(4);

    let mut pipeline = LocalPipeline::start(
        options,
        config("memory://"),
        &schema(),
        checkpoints.clone(),
        Arc::new(ObjectPartStore::new(storage.clone())),
    )
    .await
    .unwrap();
    for id in 0..10 {
        pipeline.send(record(id, id % 4)).await.unwrap();
    }
    let mut committed = pipeline.take_committed();
    committed.extend(pipeline.finish().await.unwrap());
    assert_eq!(rows(&committed), 10);

    for m in &committed {
        assert!(m.path.starts_with("memory:///p="));
        let body = storage.get(m.relative_path.as_str()).await.unwrap();
        assert_eq!(body.len() as u64, m.size_bytes);
        let lines = body.split(|b| *b == b'\n').filter(|l| !l.is_empty()).count();
        assert_eq!(lines as u64, m.row_count);
    }

    let leftovers: Vec<_> = storage
        .list("")
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.to_string())
        .filter(|p| p.ends_with(".inprogress"))
        .collect();
    assert!(leftovers.is_empty(), "{:?}", leftovers);

    // two automatic checkpoints plus the final one
    assert_eq!(
        checkpoints.latest_metadata().await.unwrap().unwrap().epoch,
        3
    );
}

#[tokio::test]
async fn escaped_partition_values_point_at_real_objects() {
    let storage = Arc::new(StorageProvider::in_memory());
    let task_info = TaskInfo::for_test("scenario-escaped-objects", "sink");
    let mut config = SinkConfig::new("memory://");
    config.partition_fields = vec!["name".to_string()];
    let mut sink = BucketSink::new(
        &task_info,
        config,
        &schema(),
        Arc::new(ObjectPartStore::new(storage.clone())),
    )
    .unwrap();
    sink.init(&task_info, None).await.unwrap();

    for (id, name) in [(1, "a/b"), (2, "12:30"), (3, "a/b")] {
        let record = Record::new(
            from_millis(0),
            vec![
                FieldValue::Int64(id),
                FieldValue::Utf8(name.to_string()),
                FieldValue::Int64(0),
            ],
        );
        sink.insert_record(&record).await.unwrap();
    }
    sink.checkpoint(&task_info, 1, false).await.unwrap();
    let committed = sink.commit(&task_info, 1).await.unwrap();

    let mut reported: Vec<_> = committed.iter().map(|m| m.relative_path.clone()).collect();
    reported.sort();
    assert_eq!(
        reported,
        vec![
            "name=12%3A30/part-00000-000.json".to_string(),
            "name=a%2Fb/part-00000-000.json".to_string(),
        ]
    );

    let mut stored: Vec<String> = storage
        .list("")
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.to_string())
        .collect();
    stored.sort();
    assert_eq!(stored, reported);

    for m in &committed {
        assert_eq!(m.path, format!("memory:///{}", m.relative_path));
        let body = storage.get(m.relative_path.as_str()).await.unwrap();
        assert_eq!(body.len() as u64, m.size_bytes);
    }
}
