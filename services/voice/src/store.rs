//! JSON-file task and appointment stores.

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use focus_core::schedule::{
    Appointment, AppointmentStore, ContextSnapshot, NewTask, Priority, Task, TaskStore,
};
use serde::{Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

const TASKS_FILE: &str = "tasks.json";
const APPOINTMENTS_FILE: &str = "appointments.json";
const DEFAULT_ESTIMATED_MINUTES: u32 = 30;

/// Keeps `tasks.json` and `appointments.json` in one data directory.
pub struct JsonStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles on both files.
    write_lock: Mutex<()>,
}

impl JsonStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub async fn tasks(&self) -> anyhow::Result<Vec<Task>> {
        read_list(&self.dir.join(TASKS_FILE)).await
    }

    pub async fn appointments(&self) -> anyhow::Result<Vec<Appointment>> {
        read_list(&self.dir.join(APPOINTMENTS_FILE)).await
    }

    /// Reads the user's day for a new session.
    pub async fn snapshot(
        &self,
        user_name: impl Into<String>,
        now: NaiveDateTime,
    ) -> anyhow::Result<ContextSnapshot> {
        Ok(ContextSnapshot {
            user_name: user_name.into(),
            now,
            tasks: self.tasks().await?,
            appointments: self.appointments().await?,
        })
    }

    async fn append<T>(&self, file: &str, item: T) -> anyhow::Result<()>
    where
        T: Serialize + DeserializeOwned,
    {
        let _guard = self.write_lock.lock().await;
        let path = self.dir.join(file);
        let mut items: Vec<T> = read_list(&path).await?;
        items.push(item);

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", self.dir.display()))?;
        let json = serde_json::to_vec_pretty(&items)?;
        // Write then rename so a crash never leaves a truncated file.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

async fn read_list<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

#[async_trait]
impl TaskStore for JsonStore {
    async fn create(&self, task: NewTask) -> anyhow::Result<()> {
        let task = Task {
            id: Uuid::new_v4().to_string(),
            title: task.title,
            priority: task.priority.unwrap_or(Priority::Medium),
            estimated_minutes: task.estimated_minutes.unwrap_or(DEFAULT_ESTIMATED_MINUTES),
            is_due_today: true,
            completed: false,
            notes: None,
        };
        info!(task_id = %task.id, title = %task.title, "Creating task");
        self.append(TASKS_FILE, task).await
    }
}

#[async_trait]
impl AppointmentStore for JsonStore {
    async fn create(&self, appointment: Appointment) -> anyhow::Result<()> {
        info!(title = %appointment.title, time = %appointment.time, "Scheduling appointment");
        self.append(APPOINTMENTS_FILE, appointment).await
    }
}
