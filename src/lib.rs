//! # tsbridge
//!
//! One query model over several time-series databases. A [`Query`] is
//! built fluently (or parsed from text), compiled into the backend's own
//! language, executed, and the answer comes back as a uniform
//! [`QueryResult`].
//!
//! ## Backends
//!
//! - **InfluxDB 2.x**: Flux over HTTP, annotated CSV responses, line protocol writes
//! - **Graphite**: render-API targets, JSON responses, carbon plaintext writes
//! - **RRDtool**: `xport`/`fetch` commands against local files, lazy file creation
//! - **Prometheus**: PromQL range queries (read-only)
//!
//! ## Modules
//!
//! - [`query`]: AST, text parser, compiler/executor contracts, result model
//! - [`drivers`]: backend compilers, parsers, clients and the driver registry
//! - [`point`]: write-side data points
//! - [`schema`]: optional per-measurement write validation
//! - [`config`]: TOML configuration with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tsbridge::{AggregateFunction, Config, DriverRegistry, Query};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_default();
//!     let registry = DriverRegistry::with_builtin()?;
//!     let driver = registry.create("influxdb", &config)?;
//!
//!     let query = Query::new("cpu")
//!         .and_where("host", "=", "server01")
//!         .latest("1h")?
//!         .interval("5m")
//!         .aggregate(AggregateFunction::Mean, "usage");
//!
//!     println!("{}", driver.compile(&query)?);
//!     let result = driver.query(&query).await?;
//!     println!("{} series", result.as_time_series().map(|r| r.series.len()).unwrap_or(0));
//!
//!     driver.close().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod drivers;
pub mod error;
pub mod point;
pub mod query;
pub mod schema;

pub use config::{generate_default_config, Config, ConfigError};

pub use drivers::{BatchFailure, BatchWriteReport, DriverRegistry, TimeSeriesDriver};

pub use error::{TimeseriesError, TimeseriesResult};

pub use point::{DataPoint, FieldValue, Sample};

pub use query::{
    parse_query, AggregateFunction, CompileResult, CompiledQuery, Compiler, Condition, Executor,
    FillPolicy, LabelResult, MetadataQuery, Operator, Query, QueryError, QueryResult, Series,
    SortDirection, TimeSeriesResult,
};

pub use schema::{FieldKind, MeasurementSchema, SchemaRegistry};
