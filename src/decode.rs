use crate::{
    wire, HranaError, Result, ResultKind, StepOutput, StepResult, StmtResult,
};

/// Shapes a statement result into the form the step asked for.
pub(crate) fn shape_step_output(result: StmtResult, kind: ResultKind) -> StepOutput {
    match kind {
        ResultKind::Rows => StepOutput::Rows(result),
        ResultKind::Row => StepOutput::Row(result.into_rows().into_iter().next()),
        ResultKind::Value => StepOutput::Value(
            result
                .rows
                .into_iter()
                .next()
                .and_then(|row| row.into_iter().next()),
        ),
        ResultKind::Run => StepOutput::Run {
            affected_row_count: result.affected_row_count,
            last_insert_rowid: result.last_insert_rowid,
        },
    }
}

/// Maps a regular batch result onto one outcome per step.
///
/// A step present in neither map was skipped.
pub(crate) fn decode_batch_result(
    mut result: wire::BatchResult,
    kinds: &[ResultKind],
) -> Result<Vec<StepResult>> {
    let step_count = kinds.len() as u32;
    if let Some(step) = result
        .step_results
        .keys()
        .chain(result.step_errors.keys())
        .find(|step| **step >= step_count)
    {
        return Err(HranaError::proto(format!(
            "batch result references step {step}, but the batch has {step_count} steps"
        )));
    }

    kinds
        .iter()
        .enumerate()
        .map(|(index, kind)| {
            let step = index as u32;
            match (
                result.step_results.remove(&step),
                result.step_errors.remove(&step),
            ) {
                (Some(_), Some(_)) => Err(HranaError::proto(format!(
                    "batch step {step} has both a result and an error"
                ))),
                (Some(stmt_result), None) => {
                    Ok(StepResult::Ok(shape_step_output(stmt_result, *kind)))
                }
                (None, Some(error)) => Ok(StepResult::Error(HranaError::response(error))),
                (None, None) => Ok(StepResult::Skipped),
            }
        })
        .collect()
}
