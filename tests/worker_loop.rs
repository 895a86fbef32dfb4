mod common;

use std::{
    sync::{atomic::Ordering, Arc, Mutex},
    time::Duration,
};
use async_trait::async_trait;
use serde_json::{json, Value};

use common::{message, MemoryStream};
use testrun_worker::error::StageError;
use testrun_worker::job::JobContext;
use testrun_worker::pipeline::{JobOutcome, Pipeline};
use testrun_worker::stage::{NoopStage, Stage, StageId};
use testrun_worker::stream::StreamMessage;
use testrun_worker::worker::Worker;

// execute stage that blows up for job `boom` and records the others
struct Volatile {
    ran: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Stage for Volatile {
    fn stage_id(&self) -> StageId {
        StageId::Execute
    }

    fn name(&self) -> &str {
        "volatile"
    }

    async fn execute(&self, ctx: &mut JobContext) -> Result<(), StageError> {
        if ctx.job_id() == "boom" {
            panic!("launcher crashed");
        }
        self.ran.lock().unwrap().push(ctx.job_id().to_string());
        Ok(())
    }
}

fn worker(stream: &MemoryStream) -> (Worker<MemoryStream>, Arc<Mutex<Vec<String>>>) {
    let ran = Arc::new(Mutex::new(Vec::new()));
    let stages: Vec<Box<dyn Stage>> = StageId::ALL
        .into_iter()
        .map(|id| match id {
            StageId::Execute => Box::new(Volatile { ran: ran.clone() }) as Box<dyn Stage>,
            other => Box::new(NoopStage::new(other)),
        })
        .collect();
    let pipeline = Pipeline::from_stages(stages).unwrap();
    let worker = Worker::new("w1".to_string(), stream.clone(), pipeline, Duration::from_millis(5));
    (worker, ran)
}

fn job(id: &str) -> Value {
    json!({
        "id": id,
        "mode": "upload",
        "algorithmGID": "g",
        "algorithmCID": "c",
        "testDataset": "d.csv",
        "modelFile": "m.sav",
    })
}

fn raw(id: &str, task: &[u8]) -> StreamMessage {
    let mut message = message(id, &json!({}));
    message
        .fields
        .insert("task".to_string(), task.to_vec());
    message
}

#[tokio::test]
async fn malformed_entries_are_acknowledged_and_dropped() {
    let stream = MemoryStream::default();
    let (mut worker, ran) = worker(&stream);

    let mut no_task = message("1-0", &json!({}));
    no_task.fields.clear();
    stream.push(no_task);
    stream.push(raw("2-0", b"{not json"));
    stream.push(message("3-0", &json!({"id": "x"})));
    stream.push(message("4-0", &job("ok")));

    assert_eq!(worker.poll_once().await, 4);
    assert_eq!(stream.acked(), vec!["1-0", "2-0", "3-0", "4-0"]);
    assert_eq!(*ran.lock().unwrap(), vec!["ok"]);
}

#[tokio::test]
async fn panicking_stage_does_not_stop_the_loop() {
    let stream = MemoryStream::default();
    let (mut worker, ran) = worker(&stream);

    let outcome = worker.handle(message("1-0", &job("boom"))).await;
    match outcome {
        Some(JobOutcome::Failed { stage, message, .. }) => {
            assert_eq!(stage, Some(StageId::Execute));
            assert!(message.contains("launcher crashed"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let outcome = worker.handle(message("2-0", &job("next"))).await;
    assert_eq!(outcome, Some(JobOutcome::Succeeded));
    assert_eq!(stream.acked(), vec!["1-0", "2-0"]);
    assert_eq!(*ran.lock().unwrap(), vec!["next"]);
}

#[tokio::test]
async fn stale_entries_are_taken_before_new_ones() {
    let stream = MemoryStream::default();
    let (worker, ran) = worker(&stream);
    let mut worker = worker.with_reclaim(Some(Duration::from_secs(60)));

    stream.broker.lock().unwrap().stale.push(message("1-0", &job("orphan")));
    stream.push(message("2-0", &job("fresh")));

    assert_eq!(worker.poll_once().await, 1);
    assert_eq!(*ran.lock().unwrap(), vec!["orphan"]);
    assert_eq!(worker.poll_once().await, 1);
    assert_eq!(*ran.lock().unwrap(), vec!["orphan", "fresh"]);
    assert_eq!(stream.acked(), vec!["1-0", "2-0"]);
}

#[tokio::test]
async fn empty_claim_handles_nothing() {
    let stream = MemoryStream::default();
    let (mut worker, _) = worker(&stream);
    assert_eq!(worker.poll_once().await, 0);
    assert!(stream.acked().is_empty());
}

#[tokio::test]
async fn raised_shutdown_flag_stops_after_startup() {
    let stream = MemoryStream::default();
    let (mut worker, ran) = worker(&stream);
    stream.push(message("1-0", &job("never")));

    worker.shutdown_handle().store(true, Ordering::SeqCst);
    worker.run().await.unwrap();

    assert_eq!(stream.broker.lock().unwrap().groups_created, 1);
    assert!(ran.lock().unwrap().is_empty());
    assert!(stream.acked().is_empty());
}
