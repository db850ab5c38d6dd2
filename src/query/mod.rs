//! Query expressions and their evaluation.
//!
//! Expressions are built as [`ast::Expr`] trees, typed against the function
//! table in [`functions`], and evaluated by [`engine::Engine`].

pub mod ast;
pub mod engine;
pub mod functions;
