use crate::{
    pipeline::{PipelineError, PullContext, Stage, state::StageState},
    row::Row,
};
use async_trait::async_trait;

///
/// SkipTakeStage
///
/// Offset/limit window. Counts are what remains, so a resumed stage
/// continues the window rather than restarting it.
///

pub(crate) struct SkipTakeStage {
    input: Box<dyn Stage>,
    skip_remaining: u64,
    take_remaining: Option<u64>,
}

impl SkipTakeStage {
    pub(crate) fn new(
        input: Box<dyn Stage>,
        skip_remaining: u64,
        take_remaining: Option<u64>,
    ) -> Self {
        Self {
            input,
            skip_remaining,
            take_remaining,
        }
    }
}

#[async_trait]
impl Stage for SkipTakeStage {
    fn has_more_results(&self) -> bool {
        self.take_remaining != Some(0) && self.input.has_more_results()
    }

    async fn pull_next(&mut self, cx: &PullContext<'_>) -> Result<Option<Vec<Row>>, PipelineError> {
        loop {
            if self.take_remaining == Some(0) {
                return Ok(None);
            }
            let Some(mut rows) = self.input.pull_next(cx).await? else {
                return Ok(None);
            };

            let skipped = usize::try_from(self.skip_remaining)
                .unwrap_or(usize::MAX)
                .min(rows.len());
            rows.drain(..skipped);
            self.skip_remaining -= skipped as u64;

            if let Some(take) = self.take_remaining {
                rows.truncate(usize::try_from(take).unwrap_or(usize::MAX));
                self.take_remaining = Some(take - rows.len() as u64);
            }
            if !rows.is_empty() {
                return Ok(Some(rows));
            }
        }
    }

    fn snapshot(&self) -> StageState {
        StageState::SkipTake {
            input: Box::new(self.input.snapshot()),
            skip_remaining: self.skip_remaining,
            take_remaining: self.take_remaining,
        }
    }
}
