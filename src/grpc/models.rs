use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::grpc::models::run_update::Update;

tonic::include_proto!("lessonrunnerapi");

impl RunUpdate {
    pub fn status(status: EngineStatus) -> Self {
        Self {
            update: Some(Update::Status(status.into())),
        }
    }

    pub fn result(result: ExecutionResult) -> Self {
        Self {
            update: Some(Update::Result(result)),
        }
    }
}

pub fn chrono_to_prost(dt: DateTime<Utc>) -> prost_types::Timestamp {
    let dt: SystemTime = dt.into();
    let dt: prost_types::Timestamp = dt.into();
    dt
}
