//! Pipeline descriptors and the DAG scheduler
//!
//! A pipeline is a unit of emitted code the scheduler treats atomically:
//! a body entry point plus optional init/reset/size entry points, and a
//! predecessor list forming a DAG. Split pipelines expose a `(start, end)`
//! body and a size function so the scheduler can partition the range across
//! worker threads; pipelines whose consume chains write shared buffers stay
//! non-split.

use veld_common::{VeldError, VeldResult};

#[derive(Debug, Clone)]
pub struct Pipeline {
    pub id: usize,
    /// Body entry point name (`fn()`, or `fn(i32, i32)` when split).
    pub body: String,
    pub init: Option<String>,
    pub reset: Option<String>,
    /// Cardinality entry point (`fn() -> i32`); present only when split.
    pub size: Option<String>,
    pub split: bool,
    pub predecessors: Vec<usize>,
}

#[derive(Default)]
pub struct PipelineBuilder {
    pipelines: Vec<Pipeline>,
    stack: Vec<usize>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new pipeline and makes it current; the translator emits its
    /// body into the function named after it.
    pub fn create_pipeline(&mut self) -> &Pipeline {
        let id = self.pipelines.len();
        self.pipelines.push(Pipeline {
            id,
            body: format!("pipeline_{id}"),
            init: None,
            reset: None,
            size: None,
            split: false,
            predecessors: Vec::new(),
        });
        self.stack.push(id);
        &self.pipelines[id]
    }

    pub fn current(&mut self) -> &mut Pipeline {
        let &id = self.stack.last().expect("no open pipeline");
        &mut self.pipelines[id]
    }

    /// Closes the current pipeline, returning its id.
    pub fn finish_pipeline(&mut self) -> usize {
        self.stack.pop().expect("no open pipeline")
    }

    pub fn add_predecessor(&mut self, predecessor: usize) {
        let current = self.current().id;
        self.pipelines[current].predecessors.push(predecessor);
    }

    pub fn build(self) -> Vec<Pipeline> {
        assert!(self.stack.is_empty(), "unfinished pipelines remain");
        self.pipelines
    }
}

/// Topological order of the pipeline DAG (predecessors first).
pub fn topological_order(pipelines: &[Pipeline]) -> VeldResult<Vec<usize>> {
    let n = pipelines.len();
    let mut state = vec![0u8; n]; // 0 unvisited, 1 in progress, 2 done
    let mut order = Vec::with_capacity(n);

    fn visit(
        id: usize,
        pipelines: &[Pipeline],
        state: &mut [u8],
        order: &mut Vec<usize>,
    ) -> VeldResult<()> {
        match state[id] {
            2 => return Ok(()),
            1 => return Err(VeldError::codegen_error("pipeline DAG has a cycle")),
            _ => {}
        }
        state[id] = 1;
        for &pred in &pipelines[id].predecessors {
            visit(pred, pipelines, state, order)?;
        }
        state[id] = 2;
        order.push(id);
        Ok(())
    }

    for id in 0..n {
        visit(id, pipelines, &mut state, &mut order)?;
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_pipelines_and_topo_order() {
        let mut builder = PipelineBuilder::new();
        builder.create_pipeline(); // 0 (outer)
        builder.create_pipeline(); // 1 (build)
        let build = builder.finish_pipeline();
        builder.add_predecessor(build);
        builder.create_pipeline(); // 2 (another build)
        let second = builder.finish_pipeline();
        builder.add_predecessor(second);
        builder.finish_pipeline();

        let pipelines = builder.build();
        let order = topological_order(&pipelines).unwrap();
        let pos =
            |id: usize| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(1) < pos(0));
        assert!(pos(2) < pos(0));
    }
}
