//! Tool-call dispatch.
//!
//! The remote model emits function calls by name with free-form JSON
//! arguments. They are parsed into [`Tool`], a closed set of typed variants,
//! executed against the host stores, and always answered with a
//! [`ToolResponse`] carrying the caller's correlation id.

use crate::{
    error::ToolError,
    generic_types::FunctionDeclaration,
    schedule::{Appointment, AppointmentStore, NewTask, TaskStore},
};
use chrono::NaiveTime;
use futures::FutureExt;
use schemars::{JsonSchema, generate::SchemaSettings};
use serde::Deserialize;
use serde_json::{Value, json};
use std::{panic::AssertUnwindSafe, sync::Arc};
use tracing::{info, warn};

pub const CREATE_TASK: &str = "createTask";
pub const SCHEDULE_APPOINTMENT: &str = "scheduleAppointment";
pub const END_SESSION: &str = "endSession";

/// A function call received from the remote side.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// The answer to exactly one [`ToolCall`].
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    pub id: String,
    pub name: String,
    pub outcome: Result<String, String>,
}

impl ToolResponse {
    pub fn success(id: String, name: String, result: impl Into<String>) -> Self {
        Self {
            id,
            name,
            outcome: Ok(result.into()),
        }
    }

    pub fn failure(id: String, name: String, error: impl Into<String>) -> Self {
        Self {
            id,
            name,
            outcome: Err(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }

    /// The response object as the provider expects it.
    pub fn payload(&self) -> Value {
        match &self.outcome {
            Ok(result) => json!({ "result": result }),
            Err(error) => json!({ "error": error }),
        }
    }
}

/// Arguments of `endSession`; it takes none.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct EndSessionArgs {}

/// Every tool the assistant knows, with typed arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Tool {
    CreateTask(NewTask),
    ScheduleAppointment(Appointment),
    EndSession,
}

impl Tool {
    /// Parses a call into a known variant, validating its arguments.
    pub fn parse(name: &str, args: &Value) -> Result<Self, ToolError> {
        // Calls without parameters may arrive with no args object at all.
        let args = if args.is_null() { json!({}) } else { args.clone() };
        let invalid = |reason: String| ToolError::InvalidArguments {
            name: name.to_string(),
            reason,
        };

        match name {
            CREATE_TASK => {
                let task: NewTask =
                    serde_json::from_value(args).map_err(|e| invalid(e.to_string()))?;
                if task.title.trim().is_empty() {
                    return Err(invalid("title must not be empty".to_string()));
                }
                Ok(Tool::CreateTask(task))
            }
            SCHEDULE_APPOINTMENT => {
                let appointment: Appointment =
                    serde_json::from_value(args).map_err(|e| invalid(e.to_string()))?;
                if appointment.title.trim().is_empty() {
                    return Err(invalid("title must not be empty".to_string()));
                }
                NaiveTime::parse_from_str(&appointment.time, "%H:%M").map_err(|_| {
                    invalid(format!("time '{}' is not HH:MM", appointment.time))
                })?;
                if appointment.duration_minutes == 0 {
                    return Err(invalid("durationMinutes must be positive".to_string()));
                }
                Ok(Tool::ScheduleAppointment(appointment))
            }
            END_SESSION => {
                let _: EndSessionArgs =
                    serde_json::from_value(args).map_err(|e| invalid(e.to_string()))?;
                Ok(Tool::EndSession)
            }
            other => Err(ToolError::Unknown(other.to_string())),
        }
    }
}

/// Result of dispatching one call.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub response: ToolResponse,
    /// Set for `endSession`: the caller closes the session once the response
    /// has been sent.
    pub end_session: bool,
}

/// Routes tool calls to the host stores.
#[derive(Clone)]
pub struct ToolDispatcher {
    tasks: Arc<dyn TaskStore>,
    appointments: Arc<dyn AppointmentStore>,
}

impl ToolDispatcher {
    pub fn new(tasks: Arc<dyn TaskStore>, appointments: Arc<dyn AppointmentStore>) -> Self {
        Self {
            tasks,
            appointments,
        }
    }

    /// The declarations advertised to the remote model at connect time.
    pub fn declarations() -> Vec<FunctionDeclaration> {
        vec![
            FunctionDeclaration {
                name: CREATE_TASK.to_string(),
                description: "Add a single new task to the user list. Call this once per task \
                              if the user mentions several."
                    .to_string(),
                parameters: schema_for::<NewTask>(),
            },
            FunctionDeclaration {
                name: SCHEDULE_APPOINTMENT.to_string(),
                description: "Set a new appointment for the user.".to_string(),
                parameters: schema_for::<Appointment>(),
            },
            FunctionDeclaration {
                name: END_SESSION.to_string(),
                description: "Call this when the user is done and every request has been \
                              handled. This closes the voice assistant."
                    .to_string(),
                parameters: schema_for::<EndSessionArgs>(),
            },
        ]
    }

    /// Executes one call. Never fails: unknown tools, bad arguments, store
    /// errors and handler panics all come back as an error response with the
    /// call's id.
    pub async fn dispatch(&self, call: ToolCall) -> Dispatched {
        let ToolCall { id, name, args } = call;
        let outcome = AssertUnwindSafe(self.run(&name, &args))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(ToolError::Handler {
                    name: name.clone(),
                    reason: "handler panicked".to_string(),
                })
            });

        match outcome {
            Ok((result, end_session)) => {
                info!(tool = %name, call_id = %id, "Tool call succeeded");
                Dispatched {
                    response: ToolResponse::success(id, name, result),
                    end_session,
                }
            }
            Err(e) => {
                warn!(tool = %name, call_id = %id, error = %e, "Tool call failed");
                Dispatched {
                    response: ToolResponse::failure(id, name, e.to_string()),
                    end_session: false,
                }
            }
        }
    }

    async fn run(&self, name: &str, args: &Value) -> Result<(&'static str, bool), ToolError> {
        let handler_error = |e: anyhow::Error| ToolError::Handler {
            name: name.to_string(),
            reason: format!("{e:#}"),
        };

        match Tool::parse(name, args)? {
            Tool::CreateTask(task) => {
                info!(title = %task.title, "Executing tool 'createTask'");
                self.tasks.create(task).await.map_err(handler_error)?;
                Ok(("Task added to your list.", false))
            }
            Tool::ScheduleAppointment(appointment) => {
                info!(title = %appointment.title, time = %appointment.time, "Executing tool 'scheduleAppointment'");
                self.appointments
                    .create(appointment)
                    .await
                    .map_err(handler_error)?;
                Ok(("Appointment scheduled.", false))
            }
            Tool::EndSession => {
                info!("Executing tool 'endSession'");
                Ok(("Closing assistant.", true))
            }
        }
    }
}

fn schema_for<T: JsonSchema>() -> Value {
    let schema = SchemaSettings::draft2020_12()
        .with(|s| s.inline_subschemas = true)
        .into_generator()
        .into_root_schema_for::<T>();
    let mut value = serde_json::to_value(schema).unwrap_or_else(|_| json!({ "type": "object" }));
    if let Some(object) = value.as_object_mut() {
        object.remove("$schema");
        object.remove("title");
    }
    value
}
