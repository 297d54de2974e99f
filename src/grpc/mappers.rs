use crate::core::domain;
use crate::grpc::models;

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(i32),
}

impl TryFrom<models::RunRequest> for domain::ExecutionRequest {
    type Error = ConversionError;

    fn try_from(req: models::RunRequest) -> Result<Self, ConversionError> {
        let language = match models::Language::try_from(req.language) {
            Ok(models::Language::Typescript) => domain::Language::TypeScript,
            Ok(models::Language::Python) => domain::Language::Python,
            Ok(models::Language::Unspecified) | Err(_) => {
                return Err(ConversionError::UnsupportedLanguage(req.language));
            }
        };

        let test_cases = req
            .test_cases
            .into_iter()
            .map(TryInto::try_into)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            source_code: req.source_code,
            language,
            test_cases,
            timeout_ms: req.timeout_ms,
        })
    }
}

impl TryFrom<models::TestSpec> for domain::TestSpec {
    type Error = ConversionError;

    fn try_from(spec: models::TestSpec) -> Result<Self, ConversionError> {
        if spec.id.is_empty() {
            return Err(ConversionError::MissingField {
                field: "test_cases.id".to_string(),
            });
        }

        Ok(Self {
            id: spec.id,
            description: spec.description,
            snippet: spec.snippet,
            hidden: spec.hidden,
        })
    }
}

impl From<domain::EngineStatus> for models::EngineStatus {
    fn from(status: domain::EngineStatus) -> Self {
        match status {
            domain::EngineStatus::Idle => models::EngineStatus::Idle,
            domain::EngineStatus::Provisioning => models::EngineStatus::Provisioning,
            domain::EngineStatus::WarmingUp => models::EngineStatus::WarmingUp,
            domain::EngineStatus::Running => models::EngineStatus::Running,
        }
    }
}

impl From<domain::ErrorKind> for models::ErrorKind {
    fn from(kind: domain::ErrorKind) -> Self {
        match kind {
            domain::ErrorKind::CompileError => models::ErrorKind::CompileError,
            domain::ErrorKind::RuntimeError => models::ErrorKind::RuntimeError,
            domain::ErrorKind::Timeout => models::ErrorKind::Timeout,
            domain::ErrorKind::HostFault => models::ErrorKind::HostFault,
        }
    }
}

impl From<domain::SourceLocation> for models::SourceLocation {
    fn from(location: domain::SourceLocation) -> Self {
        Self {
            line: location.line,
            column: location.column,
        }
    }
}

impl From<domain::ExecutionError> for models::ExecutionError {
    fn from(error: domain::ExecutionError) -> Self {
        Self {
            kind: Into::<models::ErrorKind>::into(error.kind) as i32,
            message: error.message,
            raw: error.raw,
            location: error.location.map(Into::into),
        }
    }
}

impl From<domain::TestOutcome> for models::TestOutcome {
    fn from(outcome: domain::TestOutcome) -> Self {
        Self {
            id: outcome.id,
            passed: outcome.passed,
            message: outcome.message,
            ran: outcome.ran,
        }
    }
}

impl From<domain::ExecutionResult> for models::ExecutionResult {
    fn from(result: domain::ExecutionResult) -> Self {
        Self {
            success: result.success,
            logs: result.logs,
            error: result.error.map(Into::into),
            test_results: result.test_results.into_iter().map(Into::into).collect(),
            duration_ms: result.duration_ms,
            finished_at: Some(models::chrono_to_prost(result.finished_at)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(language: models::Language) -> models::RunRequest {
        models::RunRequest {
            session_id: "learner-1".to_string(),
            source_code: "print('hi')".to_string(),
            language: language as i32,
            test_cases: vec![models::TestSpec {
                id: "t1".to_string(),
                description: "prints".to_string(),
                snippet: "assert True".to_string(),
                hidden: true,
            }],
            timeout_ms: 1500,
        }
    }

    #[test]
    fn test_run_request_conversion() {
        let req: domain::ExecutionRequest = request(models::Language::Python).try_into().unwrap();

        assert_eq!(req.language, domain::Language::Python);
        assert_eq!(req.source_code, "print('hi')");
        assert_eq!(req.timeout_ms, 1500);
        assert_eq!(req.test_cases.len(), 1);
        assert!(req.test_cases[0].hidden);
        assert_eq!(req.test_cases[0].description, "prints");
    }

    #[test]
    fn test_unspecified_language_is_rejected() {
        let err = domain::ExecutionRequest::try_from(request(models::Language::Unspecified))
            .unwrap_err();

        assert!(matches!(err, ConversionError::UnsupportedLanguage(0)));
    }

    #[test]
    fn test_unknown_language_value_is_rejected() {
        let mut req = request(models::Language::Typescript);
        req.language = 42;

        let err = domain::ExecutionRequest::try_from(req).unwrap_err();

        assert_eq!(err.to_string(), "Unsupported language: 42");
    }

    #[test]
    fn test_test_case_without_id_is_rejected() {
        let mut req = request(models::Language::Typescript);
        req.test_cases[0].id.clear();

        let err = domain::ExecutionRequest::try_from(req).unwrap_err();

        assert!(matches!(err, ConversionError::MissingField { ref field } if field == "test_cases.id"));
    }

    #[test]
    fn test_execution_result_conversion() {
        let result = domain::ExecutionResult {
            success: false,
            logs: vec!["3".to_string()],
            error: Some(
                domain::ExecutionError::new(domain::ErrorKind::RuntimeError, "Error: boom")
                    .with_location(Some(domain::SourceLocation {
                        line: 4,
                        column: Some(7),
                    })),
            ),
            test_results: vec![domain::TestOutcome::not_run("t1")],
            duration_ms: 12,
            finished_at: chrono::Utc::now(),
        };

        let grpc: models::ExecutionResult = result.into();

        assert!(!grpc.success);
        assert_eq!(grpc.logs, vec!["3"]);
        let error = grpc.error.unwrap();
        assert_eq!(error.kind(), models::ErrorKind::RuntimeError);
        assert_eq!(error.location.unwrap().column, Some(7));
        assert!(!grpc.test_results[0].ran);
        assert!(grpc.finished_at.is_some());
    }

    #[test]
    fn test_status_conversion() {
        let update = models::RunUpdate::status(domain::EngineStatus::WarmingUp.into());

        assert_eq!(
            update.update,
            Some(models::run_update::Update::Status(
                models::EngineStatus::WarmingUp as i32
            ))
        );
    }
}
