//! Structured rrdtool commands
//!
//! Commands are kept as data until they are run. Colon-delimited statements
//! (`DEF:`, `CDEF:`, `XPORT:`, `DS:`, `RRA:`) escape colons inside file
//! paths as `\:`.

use crate::query::AggregateFunction;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// RRDtool consolidation function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConsolidationFunction {
    #[default]
    Average,
    Min,
    Max,
    Last,
}

impl ConsolidationFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Average => "AVERAGE",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Last => "LAST",
        }
    }

    /// CF matching an aggregation, if RRDtool archives one
    pub fn for_aggregation(function: AggregateFunction) -> Option<Self> {
        match function {
            AggregateFunction::Mean => Some(Self::Average),
            AggregateFunction::Min => Some(Self::Min),
            AggregateFunction::Max => Some(Self::Max),
            AggregateFunction::Last => Some(Self::Last),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConsolidationFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConsolidationFunction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "AVERAGE" => Ok(Self::Average),
            "MIN" => Ok(Self::Min),
            "MAX" => Ok(Self::Max),
            "LAST" => Ok(Self::Last),
            other => Err(format!("unknown consolidation function '{}'", other)),
        }
    }
}

/// `DS:<name>:GAUGE:<heartbeat>:U:U`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSource {
    pub name: String,
    pub heartbeat: u64,
}

impl DataSource {
    pub fn gauge(name: impl Into<String>, heartbeat: u64) -> Self {
        Self {
            name: name.into(),
            heartbeat,
        }
    }

    fn statement(&self) -> String {
        format!("DS:{}:GAUGE:{}:U:U", self.name, self.heartbeat)
    }
}

/// `RRA:<cf>:0.5:<steps>:<rows>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    pub cf: ConsolidationFunction,
    pub steps: u64,
    pub rows: u64,
}

impl Archive {
    fn statement(&self) -> String {
        format!("RRA:{}:0.5:{}:{}", self.cf, self.steps, self.rows)
    }
}

/// One rrdtool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RrdCommand {
    Create {
        path: PathBuf,
        step: u64,
        start: i64,
        data_sources: Vec<DataSource>,
        archives: Vec<Archive>,
    },
    /// `update <path> -t a:b <ts>:<a>:<b>`
    Update {
        path: PathBuf,
        template: Vec<String>,
        rows: Vec<String>,
    },
    Fetch {
        path: PathBuf,
        cf: ConsolidationFunction,
        start: String,
        end: String,
        resolution: Option<u64>,
    },
    /// `xport --json` over DEF/CDEF/XPORT statements
    Xport {
        start: String,
        end: String,
        step: Option<u64>,
        max_rows: Option<usize>,
        statements: Vec<String>,
    },
    Info {
        path: PathBuf,
    },
    Last {
        path: PathBuf,
    },
}

impl RrdCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Fetch { .. } => "fetch",
            Self::Xport { .. } => "xport",
            Self::Info { .. } => "info",
            Self::Last { .. } => "last",
        }
    }

    /// Commands that go through rrdcached when one is configured
    pub fn supports_daemon(&self) -> bool {
        matches!(
            self,
            Self::Update { .. } | Self::Fetch { .. } | Self::Info { .. } | Self::Last { .. }
        )
    }

    /// Argument vector, subcommand first
    pub fn to_args(&self, daemon: Option<&str>) -> Vec<String> {
        let mut args = vec![self.name().to_string()];
        let daemon = daemon.filter(|_| self.supports_daemon());

        match self {
            Self::Create {
                path,
                step,
                start,
                data_sources,
                archives,
            } => {
                args.push(path_arg(path));
                args.extend(["--step".to_string(), step.to_string()]);
                args.extend(["--start".to_string(), start.to_string()]);
                args.extend(data_sources.iter().map(DataSource::statement));
                args.extend(archives.iter().map(Archive::statement));
            }
            Self::Update {
                path,
                template,
                rows,
            } => {
                push_daemon(&mut args, daemon);
                args.push(path_arg(path));
                if !template.is_empty() {
                    args.extend(["-t".to_string(), template.join(":")]);
                }
                args.extend(rows.iter().cloned());
            }
            Self::Fetch {
                path,
                cf,
                start,
                end,
                resolution,
            } => {
                push_daemon(&mut args, daemon);
                args.push(path_arg(path));
                args.push(cf.to_string());
                args.extend(["--start".to_string(), start.clone()]);
                args.extend(["--end".to_string(), end.clone()]);
                if let Some(resolution) = resolution {
                    args.extend(["--resolution".to_string(), resolution.to_string()]);
                }
            }
            Self::Xport {
                start,
                end,
                step,
                max_rows,
                statements,
            } => {
                args.push("--json".to_string());
                args.extend(["--start".to_string(), start.clone()]);
                args.extend(["--end".to_string(), end.clone()]);
                if let Some(step) = step {
                    args.extend(["--step".to_string(), step.to_string()]);
                }
                if let Some(max_rows) = max_rows {
                    args.extend(["--maxrows".to_string(), max_rows.to_string()]);
                }
                args.extend(statements.iter().cloned());
            }
            Self::Info { path } | Self::Last { path } => {
                push_daemon(&mut args, daemon);
                args.push(path_arg(path));
            }
        }
        args
    }

    /// One line for the `rrdtool -` pipe
    pub fn to_line(&self, daemon: Option<&str>) -> String {
        self.to_args(daemon)
            .iter()
            .map(|arg| {
                if arg.is_empty() || arg.chars().any(char::is_whitespace) {
                    format!("\"{}\"", arg.replace('"', "\\\""))
                } else {
                    arg.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl std::fmt::Display for RrdCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_line(None))
    }
}

fn push_daemon(args: &mut Vec<String>, daemon: Option<&str>) {
    if let Some(address) = daemon {
        args.extend(["--daemon".to_string(), address.to_string()]);
    }
}

fn path_arg(path: &std::path::Path) -> String {
    path.to_string_lossy().to_string()
}

/// Escape colons for use inside a colon-delimited statement
pub fn escape_colons(s: &str) -> String {
    s.replace(':', "\\:")
}

/// Data source names are limited to 19 characters of `[A-Za-z0-9_]`
pub fn ds_name(field: &str) -> String {
    let name: String = field
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .take(19)
        .collect();
    if name.is_empty() {
        "value".to_string()
    } else {
        name
    }
}

/// `DEF:<vname>=<path>:<ds>:<cf>`
pub fn def_statement(vname: &str, path: &std::path::Path, ds: &str, cf: ConsolidationFunction) -> String {
    format!(
        "DEF:{}={}:{}:{}",
        vname,
        escape_colons(&path.to_string_lossy()),
        ds,
        cf
    )
}
