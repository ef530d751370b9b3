//! Query compilation and execution
//!
//! `compile_query` walks the operator tree through the translators into one
//! program, runs the backend, and returns a `CompiledQuery` holding the
//! executable code, the pipeline DAG, and every host object the emitted
//! code points into. `execute` runs the DAG topologically; split pipelines
//! fan their `(start, end)` ranges across scoped worker threads.

use veld_catalog::Database;
use veld_common::{EngineConfig, VeldError, VeldResult};
use veld_plan::OperatorNode;

use crate::pipeline::{topological_order, Pipeline};
use crate::translators::{skinner_join_recompiling::RecompilingJoinState, CompileContext, TranslatorTree};

pub struct CompiledQuery {
    program: veld_backend::CompiledProgram,
    pipelines: Vec<Pipeline>,
    // Host objects referenced by baked pointers; dropped with the query.
    #[allow(dead_code)]
    regexes: Vec<Box<regex::bytes::Regex>>,
    #[allow(dead_code)]
    recompile_states: Vec<Box<RecompilingJoinState>>,
}

pub fn compile_query(
    plan: &OperatorNode,
    db: &Database,
    config: &EngineConfig,
) -> VeldResult<CompiledQuery> {
    let mut ctx = CompileContext::new(db, config);

    // The root pipeline hosts everything the translators leave inline.
    ctx.pipelines.create_pipeline();
    let name = ctx.pipelines.current().body.clone();
    let void = ctx.program.void_type();
    ctx.program.create_public_function(void, &[], &name)?;

    let (mut tree, root) = TranslatorTree::build(plan, &ctx)?;
    tree.produce(root, &mut ctx)?;
    ctx.program.ret()?;
    ctx.pipelines.finish_pipeline();

    let pipelines = ctx.pipelines.build();
    log::debug!("compiled {} pipelines", pipelines.len());
    let program = veld_backend::compile(ctx.program.build())?;

    Ok(CompiledQuery {
        program,
        pipelines,
        regexes: ctx.regexes,
        recompile_states: ctx.recompile_states,
    })
}

impl CompiledQuery {
    /// Runs the pipeline DAG to completion: topological order, split bodies
    /// partitioned across worker threads, resets in reverse order once the
    /// DAG has drained.
    pub fn execute(&self) -> VeldResult<()> {
        let order = topological_order(&self.pipelines)?;

        for &id in &order {
            let pipeline = &self.pipelines[id];
            if let Some(init) = &pipeline.init {
                self.invoke_unit(init)?;
            }

            if pipeline.split {
                self.run_split(pipeline)?;
            } else {
                self.invoke_unit(&pipeline.body)?;
            }
        }

        for &id in order.iter().rev() {
            if let Some(reset) = &self.pipelines[id].reset {
                self.invoke_unit(reset)?;
            }
        }
        Ok(())
    }

    fn symbol(&self, name: &str) -> VeldResult<*const u8> {
        self.program.function(name).ok_or_else(|| {
            VeldError::exec_error(format!("missing pipeline entry point '{name}'"))
        })
    }

    fn invoke_unit(&self, name: &str) -> VeldResult<()> {
        let addr = self.symbol(name)?;
        let f: extern "C" fn() = unsafe { std::mem::transmute(addr) };
        f();
        Ok(())
    }

    fn run_split(&self, pipeline: &Pipeline) -> VeldResult<()> {
        let size_name = pipeline
            .size
            .as_ref()
            .ok_or_else(|| VeldError::exec_error("split pipeline without a size"))?;
        let size_addr = self.symbol(size_name)?;
        let size: extern "C" fn() -> i32 = unsafe { std::mem::transmute(size_addr) };
        let total = size();

        let body_addr = self.symbol(&pipeline.body)? as usize;
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(8)
            .min(total.max(1) as usize);
        let chunk = (total as usize).div_ceil(workers).max(1) as i32;

        std::thread::scope(|scope| {
            for w in 0..workers as i32 {
                let start = w * chunk;
                let end = ((w + 1) * chunk).min(total);
                if start >= end {
                    break;
                }
                scope.spawn(move || {
                    let f: extern "C" fn(i32, i32) =
                        unsafe { std::mem::transmute(body_addr) };
                    f(start, end);
                });
            }
        });
        Ok(())
    }
}
