//! Task and appointment types shared with the host application, plus the
//! narrow store interfaces the tool handlers write through.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// A task as the host application stores it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub priority: Priority,
    pub estimated_minutes: u32,
    #[serde(default)]
    pub is_due_today: bool,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// The partial task the assistant is allowed to create.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    /// The description of the task.
    pub title: String,
    /// Urgency level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// How long the task will take, in minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_minutes: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    /// Title of the appointment.
    pub title: String,
    /// Start time in HH:MM format.
    pub time: String,
    /// Duration in minutes.
    pub duration_minutes: u32,
}

/// Write access to the host's task list.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, task: NewTask) -> anyhow::Result<()>;
}

/// Write access to the host's calendar.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn create(&self, appointment: Appointment) -> anyhow::Result<()>;
}

/// Read-only view of the user's day, taken once when a session opens.
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshot {
    pub user_name: String,
    pub now: NaiveDateTime,
    pub tasks: Vec<Task>,
    pub appointments: Vec<Appointment>,
}

impl ContextSnapshot {
    /// Fills `{user_name}`, `{current_time}`, `{tasks}` and `{appointments}`
    /// in a prompt template. Completed tasks are left out.
    pub fn render(&self, template: &str) -> String {
        let active: Vec<&Task> = self.tasks.iter().filter(|t| !t.completed).collect();
        let tasks = serde_json::to_string(&active).unwrap_or_else(|_| "[]".to_string());
        let appointments =
            serde_json::to_string(&self.appointments).unwrap_or_else(|_| "[]".to_string());
        template
            .replace("{user_name}", &self.user_name)
            .replace("{current_time}", &self.now.format("%H:%M").to_string())
            .replace("{tasks}", &tasks)
            .replace("{appointments}", &appointments)
    }
}
