//! Compiler and executor contracts
//!
//! Each backend supplies one [`Compiler`] and one [`Executor`]. The
//! compiler's output type is the executor's input type, so a Flux query can
//! only ever be handed to the InfluxDB executor.
//!
//! # Execution Pipeline
//!
//! ```text
//! Query → Compiler::compile → CompiledQuery → Executor::execute → QueryResult
//! ```

use crate::error::TimeseriesResult;
use crate::query::ast::Query;
use crate::query::error::CompileResult;
use crate::query::result::QueryResult;
use async_trait::async_trait;

/// Backend-specific compiled form of a query
pub trait CompiledQuery: std::fmt::Display + std::fmt::Debug + Send + Sync {
    /// Name of the backend that produced it
    fn backend(&self) -> &'static str;
}

/// Lowers a [`Query`] into a backend artifact
pub trait Compiler {
    type Output: CompiledQuery;

    fn compile(&self, query: &Query) -> CompileResult<Self::Output>;
}

/// Runs a compiled query against its backend
#[async_trait]
pub trait Executor: Send + Sync {
    type Query: CompiledQuery;

    async fn execute(&self, query: &Self::Query) -> TimeseriesResult<QueryResult>;
}
