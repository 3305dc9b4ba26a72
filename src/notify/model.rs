//! Notification events and WebSocket wire frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorInfo, codes};
use crate::jobs::model::{Job, JobStatus};

/// A lifecycle event published for one job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    StatusUpdate {
        job_id: Uuid,
        status: JobStatus,
        progress: Option<f32>,
    },
    Completed {
        job_id: Uuid,
        result: serde_json::Value,
    },
    Failed {
        job_id: Uuid,
        error: ErrorInfo,
    },
    Cancelled {
        job_id: Uuid,
        error: ErrorInfo,
    },
}

impl JobEvent {
    /// Event describing the job's current state.
    pub fn from_job(job: &Job) -> Self {
        let job_id = job.job_id;
        match job.status {
            JobStatus::Queued | JobStatus::Processing => Self::StatusUpdate {
                job_id,
                status: job.status,
                progress: job.progress,
            },
            JobStatus::Completed => Self::Completed {
                job_id,
                result: job.result.clone().unwrap_or(serde_json::Value::Null),
            },
            JobStatus::Failed => Self::Failed {
                job_id,
                error: job.error.clone().unwrap_or_else(|| {
                    ErrorInfo::new(codes::EXECUTION_FAILED, "Job failed", false)
                }),
            },
            JobStatus::Cancelled => Self::Cancelled {
                job_id,
                error: job
                    .error
                    .clone()
                    .unwrap_or_else(|| ErrorInfo::cancelled(job_id)),
            },
        }
    }

    pub fn job_id(&self) -> Uuid {
        match self {
            Self::StatusUpdate { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Cancelled { job_id, .. } => *job_id,
        }
    }

    /// Terminal events end every subscription for the job.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::StatusUpdate { .. })
    }

    pub fn to_frame(&self) -> ServerFrame {
        match self {
            Self::StatusUpdate {
                job_id,
                status,
                progress,
            } => ServerFrame::StatusUpdate {
                job_id: *job_id,
                status: *status,
                progress: *progress,
                timestamp: Utc::now(),
            },
            Self::Completed { job_id, result } => ServerFrame::JobCompleted {
                job_id: *job_id,
                result: result.clone(),
            },
            Self::Failed { job_id, error } | Self::Cancelled { job_id, error } => {
                ServerFrame::JobError {
                    job_id: *job_id,
                    error: error.clone(),
                }
            }
        }
    }
}

/// Frames sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ConnectionEstablished {
        job_id: Uuid,
        client_id: Uuid,
    },
    StatusUpdate {
        job_id: Uuid,
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<f32>,
        timestamp: DateTime<Utc>,
    },
    JobCompleted {
        job_id: Uuid,
        result: serde_json::Value,
    },
    /// Failure or cancellation; cancellation carries `error.code = "cancelled"`.
    JobError {
        job_id: Uuid,
        error: ErrorInfo,
    },
    Pong,
    Error {
        message: String,
    },
}

/// Actions sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientAction {
    Ping,
    /// Re-send the current status snapshot.
    Status,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextCarrier;
    use crate::jobs::model::{JobType, JobUpdate};

    fn job() -> Job {
        let ctx = ContextCarrier::new("t1").unwrap();
        Job::new(&ctx, JobType::EmbeddingRequest, serde_json::json!({}), None)
    }

    #[test]
    fn status_update_frame_shape() {
        let job = job();
        let frame = JobEvent::from_job(&job).to_frame();
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "status_update");
        assert_eq!(json["status"], "queued");
        assert!(json.get("progress").is_none());
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn cancellation_is_a_job_error_frame() {
        let mut job = job();
        job.apply(JobUpdate::cancelled(ErrorInfo::cancelled(job.job_id)))
            .unwrap();
        let event = JobEvent::from_job(&job);
        assert!(event.is_terminal());

        let json = serde_json::to_value(event.to_frame()).unwrap();
        assert_eq!(json["type"], "job_error");
        assert_eq!(json["error"]["code"], "cancelled");
    }

    #[test]
    fn completed_frame_carries_result() {
        let mut job = job();
        job.apply(JobUpdate::processing()).unwrap();
        job.apply(JobUpdate::completed(serde_json::json!({"dims": 3})))
            .unwrap();
        let json = serde_json::to_value(JobEvent::from_job(&job).to_frame()).unwrap();
        assert_eq!(json["type"], "job_completed");
        assert_eq!(json["result"]["dims"], 3);
    }

    #[test]
    fn client_actions_parse() {
        let ping: ClientAction = serde_json::from_str(r#"{"action":"ping"}"#).unwrap();
        assert_eq!(ping, ClientAction::Ping);
        assert!(serde_json::from_str::<ClientAction>(r#"{"action":"dance"}"#).is_err());
        assert_eq!(
            serde_json::to_string(&ServerFrame::Pong).unwrap(),
            r#"{"type":"pong"}"#
        );
    }
}
