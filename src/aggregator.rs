//! Coalesces per-chart metric requests into one bulk call per request name.
//!
//! Callers [`LoadAggregator::enqueue`] a named request. The first request of
//! an idle aggregator arms a one-shot timer; when it fires, everything
//! buffered so far is grouped by name, each group is sent as a single
//! [`BulkCall`], and the response (or error) is handed to every caller in
//! that group.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::Utc;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    time_range::DEFAULT_TIME_UNIT_SECONDS,
    transport::{BulkCall, Transport, TransportError, format_fields},
};

/// Length of one collection window.
pub const BULK_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregatorError {
    #[error("invalid request spec: {0}")]
    InvalidRequestSpec(String),
}

/// What a caller contributes to the outbound call besides its fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryContext {
    pub host_name: String,
    pub time_unit_seconds: u64,
}

impl Default for QueryContext {
    fn default() -> Self {
        Self {
            host_name: String::new(),
            time_unit_seconds: DEFAULT_TIME_UNIT_SECONDS,
        }
    }
}

/// Receives the shared outcome of the bulk call its request ended up in.
pub trait Subscriber: Send + Sync {
    fn on_success(&self, response: Arc<Value>);

    fn on_failure(&self, error: Arc<TransportError>);

    fn query_context(&self) -> QueryContext {
        QueryContext::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSpec {
    pub name: String,
    pub fields: Vec<String>,
}

impl RequestSpec {
    pub fn new(name: impl Into<String>, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn validate(&self) -> Result<(), AggregatorError> {
        if self.name.trim().is_empty() {
            return Err(AggregatorError::InvalidRequestSpec("missing request name".into()));
        }
        if self.fields.is_empty() {
            return Err(AggregatorError::InvalidRequestSpec(format!(
                "request `{}` has no fields",
                self.name
            )));
        }
        if self.fields.iter().any(|f| f.trim().is_empty()) {
            return Err(AggregatorError::InvalidRequestSpec(format!(
                "request `{}` has a blank field",
                self.name
            )));
        }
        Ok(())
    }
}

pub struct PendingRequest {
    pub name: String,
    pub fields: Vec<String>,
    pub caller: Arc<dyn Subscriber>,
}

pub struct RequestGroup {
    pub name: String,
    pub merged_fields: IndexSet<String>,
    pub subscribers: Vec<Arc<dyn Subscriber>>,
    /// Taken from the first caller; later callers' host and window are ignored.
    pub context: QueryContext,
}

impl RequestGroup {
    fn bulk_call(&self, to_seconds: i64) -> BulkCall {
        let fields: Vec<String> = self.merged_fields.iter().cloned().collect();
        let params = format_fields(&fields, to_seconds, self.context.time_unit_seconds);
        BulkCall {
            name: self.name.clone(),
            fields,
            params,
            host_name: self.context.host_name.clone(),
        }
    }

    fn fan_out(self, result: Result<Value, TransportError>) {
        match result {
            Ok(response) => {
                debug!(name = %self.name, subscribers = self.subscribers.len(), "bulk call succeeded");
                let response = Arc::new(response);
                for s in &self.subscribers {
                    s.on_success(Arc::clone(&response));
                }
            }
            Err(e) => {
                warn!(name = %self.name, subscribers = self.subscribers.len(), error = %e, "bulk call failed");
                let e = Arc::new(e);
                for s in &self.subscribers {
                    s.on_failure(Arc::clone(&e));
                }
            }
        }
    }
}

/// Partition a flushed buffer by request name.
///
/// Fields are unioned in first-seen order; subscribers keep enqueue order.
/// Groups come out in the order their name was first seen.
pub fn group(pending: Vec<PendingRequest>) -> Vec<RequestGroup> {
    let mut groups: IndexMap<String, RequestGroup> = IndexMap::new();
    for req in pending {
        let group = groups.entry(req.name.clone()).or_insert_with(|| RequestGroup {
            name: req.name.clone(),
            merged_fields: IndexSet::new(),
            subscribers: Vec::new(),
            context: req.caller.query_context(),
        });
        group.merged_fields.extend(req.fields);
        group.subscribers.push(req.caller);
    }
    groups.into_values().collect()
}

#[derive(Default)]
struct Buffer {
    requests: Vec<PendingRequest>,
    timer_armed: bool,
}

struct Inner {
    transport: Arc<dyn Transport>,
    buffer: Mutex<Buffer>,
}

/// One per process; clone it to hand out to callers.
#[derive(Clone)]
pub struct LoadAggregator {
    inner: Arc<Inner>,
}

impl LoadAggregator {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                buffer: Mutex::new(Buffer::default()),
            }),
        }
    }

    fn buffer(&self) -> MutexGuard<'_, Buffer> {
        self.inner.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffer a request for the current window, opening one if needed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, caller: Arc<dyn Subscriber>, spec: RequestSpec) -> Result<(), AggregatorError> {
        spec.validate()?;

        let mut buf = self.buffer();
        debug!(name = %spec.name, fields = spec.fields.len(), "enqueue");
        buf.requests.push(PendingRequest {
            name: spec.name,
            fields: spec.fields,
            caller,
        });

        if !buf.timer_armed {
            buf.timer_armed = true;
            let this = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(BULK_INTERVAL).await;
                this.flush();
            });
        }
        Ok(())
    }

    /// Send a request on its own right away, outside any window.
    pub fn dispatch_now(&self, caller: Arc<dyn Subscriber>, spec: RequestSpec) -> Result<(), AggregatorError> {
        spec.validate()?;
        let pending = PendingRequest {
            name: spec.name,
            fields: spec.fields,
            caller,
        };
        self.dispatch(group(vec![pending]));
        Ok(())
    }

    pub fn pending_len(&self) -> usize {
        self.buffer().requests.len()
    }

    pub fn is_collecting(&self) -> bool {
        self.buffer().timer_armed
    }

    fn flush(&self) {
        let snapshot = {
            let mut buf = self.buffer();
            buf.timer_armed = false;
            std::mem::take(&mut buf.requests)
        };
        if snapshot.is_empty() {
            return;
        }

        let requests = snapshot.len();
        let groups = group(snapshot);
        info!(requests, calls = groups.len(), "flushing collection window");
        self.dispatch(groups);
    }

    fn dispatch(&self, groups: Vec<RequestGroup>) {
        let to_seconds = (Utc::now().timestamp_millis() as f64 / 1000.0).round() as i64;
        for g in groups {
            let call = g.bulk_call(to_seconds);
            let transport = Arc::clone(&self.inner.transport);
            tokio::spawn(async move {
                let result = transport.send(call).await;
                g.fan_out(result);
            });
        }
    }
}
