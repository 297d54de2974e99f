use crate::core::{
    domain::ExecutionRequest,
    traits::runner::{CompileError, Runner},
};

#[derive(Debug, Clone)]
pub struct CompiledSubmission {
    pub code: String,
    /// One entry per test case, in request order.
    pub snippets: Vec<Result<String, CompileError>>,
}

/// Prepares learner code and snippets in-process. A failure in the learner
/// code stops here, before any realm is requested.
#[tracing::instrument(skip_all, fields(language = %runner.language()))]
pub fn compile_submission(
    runner: &dyn Runner,
    request: &ExecutionRequest,
) -> Result<CompiledSubmission, CompileError> {
    tracing::debug!("Start compiling");
    let code = runner.prepare(&request.source_code).inspect_err(|e| {
        tracing::debug!("Compilation failed: {:?}", e);
    })?;

    let snippets = request
        .test_cases
        .iter()
        .map(|test| {
            runner.prepare(&test.snippet).inspect_err(|e| {
                tracing::debug!("Snippet {} failed to compile: {:?}", test.id, e);
            })
        })
        .collect();

    Ok(CompiledSubmission { code, snippets })
}
