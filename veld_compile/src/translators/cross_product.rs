//! Cartesian product
//!
//! Children produce in order; each tuple of child `i` triggers child `i+1`'s
//! scan, and the innermost child pushes the combined tuple upward.

use veld_common::VeldResult;
use veld_plan::OperatorSchema;

use crate::translators::{CompileContext, OperatorTranslator, TranslatorTree};

pub struct CrossProductTranslator {
    schema: OperatorSchema,
}

impl CrossProductTranslator {
    pub fn new(schema: &OperatorSchema) -> Self {
        Self { schema: schema.clone() }
    }
}

impl OperatorTranslator for CrossProductTranslator {
    fn produce(
        &self,
        this: usize,
        tree: &mut TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<()> {
        let first = tree.nodes[this].children[0];
        tree.produce(first, ctx)
    }

    fn consume(
        &self,
        this: usize,
        src: usize,
        tree: &mut TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<()> {
        let children = tree.nodes[this].children.clone();
        let position = children.iter().position(|&c| c == src).expect("unknown child");

        if position + 1 < children.len() {
            // Nest the next child's scan inside this tuple.
            tree.produce(children[position + 1], ctx)
        } else {
            tree.fill_values(this, &self.schema, ctx)?;
            tree.consume_parent(this, ctx)
        }
    }
}
