//! Panoptikon Query Language: the typed AST (C7), the CTE-stacking compiler
//! (C8), and the vector-similarity planner (C9).

pub mod ast;
pub mod compiler;
pub mod similarity;

pub use ast::*;
pub use compiler::{compile_search_query, CompiledQuery, QueryState};
