use crate::{
    pipeline::{
        PipelineError, PullContext, Stage,
        state::{DistinctSeen, StageState},
    },
    row::Row,
};
use async_trait::async_trait;

///
/// DistinctStage
///
/// Drops rows whose distinct key was already emitted. The key is the named
/// fields, or every field when none are named. Ordered mode only compares
/// against the previous key and relies on sorted input.
///

pub(crate) struct DistinctStage {
    input: Box<dyn Stage>,
    fields: Vec<String>,
    seen: DistinctSeen,
}

impl DistinctStage {
    pub(crate) fn new(input: Box<dyn Stage>, fields: Vec<String>, seen: DistinctSeen) -> Self {
        Self {
            input,
            fields,
            seen,
        }
    }

    fn admit(&mut self, row: &Row) -> bool {
        let key = row.project(&self.fields);

        match &mut self.seen {
            DistinctSeen::Unordered(seen) => seen.insert(key),
            DistinctSeen::Ordered(last) => {
                if last.as_ref() == Some(&key) {
                    false
                } else {
                    *last = Some(key);
                    true
                }
            }
        }
    }
}

#[async_trait]
impl Stage for DistinctStage {
    fn has_more_results(&self) -> bool {
        self.input.has_more_results()
    }

    async fn pull_next(&mut self, cx: &PullContext<'_>) -> Result<Option<Vec<Row>>, PipelineError> {
        while let Some(page) = self.input.pull_next(cx).await? {
            let rows: Vec<Row> = page.into_iter().filter(|row| self.admit(row)).collect();
            if !rows.is_empty() {
                return Ok(Some(rows));
            }
        }

        Ok(None)
    }

    fn snapshot(&self) -> StageState {
        StageState::Distinct {
            input: Box::new(self.input.snapshot()),
            seen: self.seen.clone(),
        }
    }
}
