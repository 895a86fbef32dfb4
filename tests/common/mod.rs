#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use async_trait::async_trait;
use serde_json::Value;
use zip::write::SimpleFileOptions;

use testrun_worker::error::{GatewayError, StreamError};
use testrun_worker::gateway::{FetchedFile, Gateway};
use testrun_worker::stream::{JobStream, StreamMessage, TASK_FIELD};

pub fn write_zip(path: &Path, entries: &[(&str, &str)]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
    for (name, content) in entries {
        writer
            .start_file(name.to_string(), SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap();
}

pub fn message(id: &str, task: &Value) -> StreamMessage {
    let mut fields = HashMap::new();
    fields.insert(TASK_FIELD.to_string(), task.to_string().into_bytes());
    StreamMessage {
        id: id.to_string(),
        fields: fields,
    }
}

#[derive(Default)]
pub struct Broker {
    pub pending: VecDeque<StreamMessage>,

    // entries left behind by a dead consumer
    pub stale: Vec<StreamMessage>,

    pub acked: Vec<String>,

    pub groups_created: usize,
}

/// In-memory stand-in for the redis consumer group.
#[derive(Clone, Default)]
pub struct MemoryStream {
    pub broker: Arc<Mutex<Broker>>,
}

impl MemoryStream {
    pub fn push(&self, message: StreamMessage) {
        self.broker.lock().unwrap().pending.push_back(message);
    }

    pub fn acked(&self) -> Vec<String> {
        self.broker.lock().unwrap().acked.clone()
    }
}

#[async_trait]
impl JobStream for MemoryStream {
    async fn ensure_group(&mut self) -> Result<(), StreamError> {
        self.broker.lock().unwrap().groups_created += 1;
        Ok(())
    }

    async fn claim(&mut self, _block: Duration) -> Result<Vec<StreamMessage>, StreamError> {
        Ok(self.broker.lock().unwrap().pending.drain(..).collect())
    }

    async fn ack(&mut self, id: &str) -> Result<(), StreamError> {
        self.broker.lock().unwrap().acked.push(id.to_string());
        Ok(())
    }

    async fn reclaim_stale(&mut self, _min_idle: Duration) -> Result<Vec<StreamMessage>, StreamError> {
        Ok(std::mem::take(&mut self.broker.lock().unwrap().stale))
    }
}

/// Gateway serving an algorithm zip and plain files, recording every call.
#[derive(Default)]
pub struct MockGateway {
    // files of the algorithm bundle
    pub algorithm: Vec<(String, String)>,

    pub fetched: Mutex<Vec<String>>,

    pub progress: Mutex<Vec<(String, u8)>>,

    pub errors: Mutex<Vec<(String, String)>>,

    pub uploads: Mutex<Vec<PathBuf>>,
}

impl MockGateway {
    pub fn with_algorithm(entries: &[(&str, &str)]) -> Self {
        Self {
            algorithm: entries
                .iter()
                .map(|(name, content)| (name.to_string(), content.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<(String, String)> {
        self.errors.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<PathBuf> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn fetch(&self, resource: &str) -> Result<FetchedFile, GatewayError> {
        self.fetched.lock().unwrap().push(resource.to_string());
        let fetched = FetchedFile::new(tempfile::tempdir()?, "payload");
        if resource.starts_with("/plugins/") {
            let entries: Vec<(&str, &str)> = self
                .algorithm
                .iter()
                .map(|(name, content)| (name.as_str(), content.as_str()))
                .collect();
            write_zip(fetched.path(), &entries);
        } else {
            fs::write(fetched.path(), format!("contents of {resource}"))?;
        }
        Ok(fetched)
    }

    async fn patch_progress(&self, job_id: &str, percent: u8) {
        self.progress.lock().unwrap().push((job_id.to_string(), percent));
    }

    async fn patch_error(&self, job_id: &str, message: &str) {
        self.errors
            .lock()
            .unwrap()
            .push((job_id.to_string(), message.to_string()));
    }

    async fn upload_bundle(&self, bundle: &Path) -> Result<(), GatewayError> {
        assert!(bundle.is_file(), "uploaded bundle must exist");
        self.uploads.lock().unwrap().push(bundle.to_path_buf());
        Ok(())
    }
}
