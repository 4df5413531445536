use crate::stats::StatsPipeline;

#[derive(Clone)]
pub struct AppState {
    pipeline: StatsPipeline,
}

impl AppState {
    pub fn new(pipeline: StatsPipeline) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &StatsPipeline {
        &self.pipeline
    }
}
