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

//! Error-tracking webhook sink.
//!
//! Posts every [`Report`] as JSON to an external error-tracking endpoint.
//! Capture never blocks: error reports run on a runtime task. Fatal reports,
//! and reports captured outside a runtime, are posted from a dedicated
//! thread with its own runtime so they leave even when the capturing worker
//! is about to block in [`ErrorSink::flush`]. A failed post is logged at
//! `warn` and dropped, never reported again.

use crate::config::parse_http_url;
use reqwest::Url;
use sense_dispatch_core::pipeline::ConfigError;
use sense_dispatch_core::reporter::{ErrorSink, Report, ReportLevel};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Handle, RuntimeFlavor};
use tracing::{trace, warn};

/// Timeout for one report post.
const REPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval at which [`WebhookSink::flush`] checks for pending posts.
const FLUSH_POLL: Duration = Duration::from_millis(10);

/// [`ErrorSink`] posting reports to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: Url,
    pending: Arc<AtomicUsize>,
}

impl WebhookSink {
    /// Creates a sink for the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if `url` is not an `http`/`https` URL or the HTTP
    /// client cannot be built.
    pub fn new(url: &str) -> Result<Self, ConfigError> {
        let url = parse_http_url("report_url", url)?;
        let client =
            build_client().map_err(|e| ConfigError::invalid("report_url", e.to_string()))?;

        Ok(Self {
            client,
            url,
            pending: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Number of posts still in flight.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Posts from a new thread driving its own current-thread runtime.
    ///
    /// The pooled client is bound to the caller's runtime, so the thread
    /// builds its own.
    fn post_detached(&self, report: Report) {
        let url = self.url.clone();
        let pending = Arc::clone(&self.pending);
        self.pending.fetch_add(1, Ordering::SeqCst);

        let spawned = thread::Builder::new()
            .name("sense-dispatch-report".to_string())
            .spawn(move || {
                let runtime = Builder::new_current_thread().enable_all().build();
                match (runtime, build_client()) {
                    (Ok(runtime), Ok(client)) => runtime.block_on(post(&client, url, &report)),
                    (Err(e), _) => warn!(error = %e, "Could not start report runtime"),
                    (_, Err(e)) => warn!(error = %e, "Could not build report client"),
                }
                pending.fetch_sub(1, Ordering::SeqCst);
            });

        if let Err(e) = spawned {
            warn!(error = %e, "Could not start report thread, error report dropped");
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(FLUSH_POLL);
        }
        true
    }
}

fn build_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder().timeout(REPORT_TIMEOUT).build()
}

async fn post(client: &reqwest::Client, url: Url, report: &Report) {
    match client.post(url).json(report).send().await {
        Ok(response) if response.status().is_success() => {
            trace!(message = %report.message, "Delivered error report");
        }
        Ok(response) => {
            warn!(status = %response.status(), "Error report rejected");
        }
        Err(e) => {
            warn!(error = %e, "Could not deliver error report");
        }
    }
}

impl ErrorSink for WebhookSink {
    fn capture(&self, report: &Report) {
        let handle = match Handle::try_current() {
            Ok(handle) if report.level != ReportLevel::Fatal => handle,
            _ => {
                self.post_detached(report.clone());
                return;
            }
        };

        let client = self.client.clone();
        let url = self.url.clone();
        let report = report.clone();
        let pending = Arc::clone(&self.pending);
        pending.fetch_add(1, Ordering::SeqCst);

        handle.spawn(async move {
            post(&client, url, &report).await;
            pending.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Waits for pending posts. On a multi-thread runtime the wait hands the
    /// worker's queued tasks to another thread first.
    fn flush(&self, timeout: Duration) -> bool {
        match Handle::try_current() {
            Ok(handle) if matches!(handle.runtime_flavor(), RuntimeFlavor::MultiThread) => {
                tokio::task::block_in_place(|| self.wait_idle(timeout))
            }
            _ => self.wait_idle(timeout),
        }
    }
}
