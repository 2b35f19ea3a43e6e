// Copyright 2025 Sense Dispatch Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! sense-dispatch - sends templated notifications for database changes
//!
//! Watches a MongoDB database, renders the configured template for every
//! change in the domain view and posts one message per recipient to the
//! notification gateway.
//!
//! ```bash
//! sense-dispatch --database sense --gateway http://localhost:8080/send
//! ```
//!
//! Exit status: `0` after Ctrl-C, `1` on a startup failure or panic, `2` when
//! the domain change feed stops on its own.

use bson::{Bson, Document};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use sense_dispatch_core::metrics::{self, FeedKind};
use sense_dispatch_core::pipeline::{
    Pipeline, PipelineConfig, PipelineError, DEFAULT_CONFIGURATION_ID, DEFAULT_VIEW,
};
use sense_dispatch_core::reporter::ErrorReporter;
use sense_dispatch_gateway::{GatewayConfig, GatewaySender, WebhookSink};
use sense_dispatch_stores::mongo::{MongoStore, MongoStoreConfig};
use serde_json::json;
use std::error::Error;
use std::net::SocketAddr;
use std::process;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// How long a fatal report may take to leave the process.
const FATAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Stages registered for the domain view unless `--view-pipeline` is given.
const DEFAULT_VIEW_PIPELINE: &str =
    r#"[{"$match":{"operationType":{"$in":["insert","update","replace"]}}}]"#;

#[derive(Debug, Parser)]
#[command(name = "sense-dispatch")]
#[command(version, about = "Sends templated notifications for database changes", long_about = None)]
struct Cli {
    /// Database to watch
    #[arg(long, env = "SENSE_DATABASE")]
    database: String,

    /// MongoDB connection string
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    mongodb_uri: String,

    /// Notification gateway URL
    #[arg(long, env = "SENSE_GATEWAY")]
    gateway: String,

    /// Error-tracking webhook receiving every report as JSON
    #[arg(long, env = "SENSE_REPORT_URL")]
    report_url: Option<String>,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(long, env = "SENSE_DEBUG")]
    debug: bool,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "SENSE_METRICS_LISTEN")]
    metrics_listen: Option<SocketAddr>,

    /// Id of the configuration document
    #[arg(long, env = "SENSE_CONFIGURATION_ID", default_value = DEFAULT_CONFIGURATION_ID)]
    configuration_id: String,

    /// Name of the view selecting domain changes
    #[arg(long, env = "SENSE_VIEW", default_value = DEFAULT_VIEW)]
    view: String,

    /// JSON array of aggregation stages implementing the view
    #[arg(long, env = "SENSE_VIEW_PIPELINE", default_value = DEFAULT_VIEW_PIPELINE)]
    view_pipeline: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let reporter = match build_reporter(cli.report_url.as_deref()) {
        Ok(reporter) => reporter,
        Err(e) => {
            error!(error = %e, "Invalid report URL");
            process::exit(1);
        }
    };
    install_panic_hook(reporter.clone());

    match run(cli, reporter).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!(error = %e, "Startup failed");
            process::exit(1);
        }
    }
}

/// Runs until Ctrl-C or until the domain feed stops. Returns the exit status.
async fn run(cli: Cli, reporter: ErrorReporter) -> Result<i32, Box<dyn Error>> {
    let mut pipeline = match build_pipeline(&cli, reporter.clone()).await {
        Ok(pipeline) => pipeline,
        Err(e) => {
            reporter.capture_error(e.as_ref());
            reporter.flush(FATAL_FLUSH_TIMEOUT);
            return Err(e);
        }
    };

    if let Err(e) = pipeline.start().await {
        // Subscription failures were reported by the listener.
        if !matches!(e, PipelineError::Subscribe(_)) {
            reporter.capture_error(&e);
        }
        reporter.flush(FATAL_FLUSH_TIMEOUT);
        return Err(e.into());
    }

    info!(database = %cli.database, view = %cli.view, "sense-dispatch running");

    let code = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break 0;
            }
            stopped = pipeline.next_termination() => match stopped {
                Some(stopped) if stopped.feed == FeedKind::Domain => {
                    error!(error = %stopped.termination, "Domain feed stopped, exiting");
                    break 2;
                }
                Some(stopped) => {
                    warn!(
                        error = %stopped.termination,
                        "Configuration feed stopped, keeping the last configuration"
                    );
                }
                None => break 2,
            }
        }
    };

    pipeline.stop().await?;
    reporter.flush(FATAL_FLUSH_TIMEOUT);

    Ok(code)
}

/// Installs metrics and wires the store, gateway and pipeline together.
async fn build_pipeline(
    cli: &Cli,
    reporter: ErrorReporter,
) -> Result<Pipeline<MongoStore, GatewaySender>, Box<dyn Error>> {
    if let Some(addr) = cli.metrics_listen {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        metrics::init_metrics();
        info!(%addr, "Prometheus metrics available");
    }

    let view_pipeline = parse_view_pipeline(&cli.view_pipeline)?;

    let gateway_config = GatewayConfig::builder().url(cli.gateway.as_str()).build()?;
    let sender = GatewaySender::new(gateway_config)?;

    let config = PipelineConfig::builder()
        .database(cli.database.as_str())
        .configuration_id(cli.configuration_id.as_str())
        .view(cli.view.as_str())
        .build()?;

    let store_config = MongoStoreConfig::builder()
        .uri(cli.mongodb_uri.as_str())
        .database(cli.database.as_str())
        .view(cli.view.as_str(), view_pipeline)
        .build()?;
    let store = MongoStore::connect(store_config).await?;

    Ok(Pipeline::new(config, store, sender, reporter))
}

/// Initialize structured logging
fn init_logging(debug: bool) {
    let default = if debug {
        "info,sense_dispatch=debug,sense_dispatch_core=debug,sense_dispatch_stores=debug,sense_dispatch_gateway=debug"
    } else {
        "info,sense_dispatch_core=info,sense_dispatch_stores=info,sense_dispatch_gateway=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_line_number(true)
        .init();
}

fn build_reporter(report_url: Option<&str>) -> Result<ErrorReporter, Box<dyn Error>> {
    let reporter = ErrorReporter::new();
    Ok(match report_url {
        Some(url) => reporter.with_sink(WebhookSink::new(url)?),
        None => reporter,
    })
}

/// Reports any panic as fatal and terminates the process.
fn install_panic_hook(reporter: ErrorReporter) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);

        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_default();
        let location = info.location().map(ToString::to_string);

        reporter.capture_fatal(
            "Uncaught exception, terminating",
            json!({ "panic": payload, "location": location }),
        );
        reporter.flush(FATAL_FLUSH_TIMEOUT);
        process::exit(1);
    }));
}

/// Parses a JSON array of aggregation stages.
fn parse_view_pipeline(source: &str) -> Result<Vec<Document>, Box<dyn Error>> {
    let value: serde_json::Value = serde_json::from_str(source)?;
    match Bson::try_from(value)? {
        Bson::Array(stages) => stages
            .into_iter()
            .map(|stage| match stage {
                Bson::Document(doc) => Ok(doc),
                other => Err(Box::<dyn Error>::from(format!(
                    "view pipeline stage is not an object: {other}"
                ))),
            })
            .collect(),
        other => Err(Box::<dyn Error>::from(format!(
            "view pipeline must be a JSON array, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sense_dispatch_core::reporter::MemorySink;

    fn cli(extra: &[&str]) -> Cli {
        let mut args = vec![
            "sense-dispatch",
            "--database",
            "sense",
            "--gateway",
            "http://localhost:8080/send",
        ];
        args.extend_from_slice(extra);
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from([
            "sense-dispatch",
            "--database",
            "sense",
            "--gateway",
            "http://localhost:8080/send",
        ])
        .unwrap();

        assert_eq!(cli.configuration_id, DEFAULT_CONFIGURATION_ID);
        assert_eq!(cli.view, DEFAULT_VIEW);
        assert!(cli.report_url.is_none());
        assert!(cli.metrics_listen.is_none());
    }

    #[tokio::test]
    async fn test_invalid_view_pipeline_is_reported() {
        let sink = MemorySink::new();
        let reporter = ErrorReporter::new().with_sink(sink.clone());

        let result = run(cli(&["--view-pipeline", "not json"]), reporter).await;

        assert!(result.is_err());
        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].message, result.unwrap_err().to_string());
    }

    #[tokio::test]
    async fn test_invalid_gateway_is_reported() {
        let sink = MemorySink::new();
        let reporter = ErrorReporter::new().with_sink(sink.clone());
        let mut cli = cli(&[]);
        cli.gateway = "mailto:ops@example.org".to_string();

        assert!(run(cli, reporter).await.is_err());
        assert_eq!(sink.reports().len(), 1);
    }

    #[test]
    fn test_cli_requires_database() {
        assert!(Cli::try_parse_from(["sense-dispatch", "--gateway", "http://x/send"]).is_err());
    }

    #[test]
    fn test_default_view_pipeline_parses() {
        let stages = parse_view_pipeline(DEFAULT_VIEW_PIPELINE).unwrap();
        assert_eq!(stages.len(), 1);
        assert!(stages[0].contains_key("$match"));
    }

    #[test]
    fn test_view_pipeline_must_be_array_of_objects() {
        assert!(parse_view_pipeline(r#"{"$match":{}}"#).is_err());
        assert!(parse_view_pipeline("[1]").is_err());
        assert!(parse_view_pipeline("not json").is_err());
    }
}
