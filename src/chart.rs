use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{
    aggregator::{AggregatorError, LoadAggregator, QueryContext, RequestSpec, Subscriber},
    series::{Series, check_series, display_name, lookup, transform_data},
    time_range::{TimeRange, TimeRangeError, TimeRangeView},
    transport::TransportError,
};

#[derive(Debug, Clone, Deserialize)]
pub struct ChartConfig {
    pub id: String,
    pub title: String,
    pub load_group: RequestSpec,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub time_index: usize,
    /// Popup charts skip the collection window.
    #[serde(default)]
    pub popup: bool,
}

#[derive(Debug, Error)]
pub enum ChartError {
    #[error(transparent)]
    TimeRange(#[from] TimeRangeError),
    #[error(transparent)]
    Aggregator(#[from] AggregatorError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChartMessage {
    /// Nothing in the default one-hour window.
    NoData,
    NoDataAtTime { seconds: u64 },
    Failed { status: String, cause: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChartState {
    pub series: Vec<Series>,
    pub has_data: bool,
    pub is_ready: bool,
    pub message: Option<ChartMessage>,
    /// Bumped on every delivered response or error.
    pub generation: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChartSummary {
    pub id: String,
    pub title: String,
    pub popup: bool,
    pub time_range: TimeRangeView,
    pub has_data: bool,
    pub is_ready: bool,
    pub generation: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChartSnapshot {
    #[serde(flatten)]
    pub summary: ChartSummary,
    pub load_group: RequestSpec,
    pub host_name: String,
    pub state: ChartState,
}

/// A chart fed by the aggregator.
pub struct ChartView {
    id: String,
    title: String,
    load_group: RequestSpec,
    host_name: String,
    tz_offset: i64,
    popup: AtomicBool,
    destroyed: AtomicBool,
    time_range: Mutex<TimeRange>,
    state: Mutex<ChartState>,
    updates: watch::Sender<u64>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChartView {
    pub fn new(config: ChartConfig, tz_offset: i64) -> Result<Self, ChartError> {
        let time_range = TimeRange::new(config.time_index)?;
        let (updates, _) = watch::channel(0);
        Ok(Self {
            id: config.id,
            title: config.title,
            load_group: config.load_group,
            host_name: config.host_name,
            tz_offset,
            popup: AtomicBool::new(config.popup),
            destroyed: AtomicBool::new(false),
            time_range: Mutex::new(time_range),
            state: Mutex::new(ChartState::default()),
            updates,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_popup(&self) -> bool {
        self.popup.load(Ordering::Relaxed)
    }

    pub fn set_popup(&self, popup: bool) {
        self.popup.store(popup, Ordering::Relaxed);
    }

    /// Ignore any response still in flight.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Relaxed);
    }

    pub fn time_range(&self) -> TimeRange {
        *lock(&self.time_range)
    }

    pub fn state(&self) -> ChartState {
        lock(&self.state).clone()
    }

    /// Receiver that sees the generation change after every callback.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.updates.subscribe()
    }

    pub fn summary(&self) -> ChartSummary {
        let state = lock(&self.state);
        ChartSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            popup: self.is_popup(),
            time_range: self.time_range().into(),
            has_data: state.has_data,
            is_ready: state.is_ready,
            generation: state.generation,
        }
    }

    pub fn snapshot(&self) -> ChartSnapshot {
        ChartSnapshot {
            summary: self.summary(),
            load_group: self.load_group.clone(),
            host_name: self.host_name.clone(),
            state: self.state(),
        }
    }

    /// Popups fetch on their own; everything else joins the current window.
    pub fn load(self: &Arc<Self>, aggregator: &LoadAggregator) -> Result<(), ChartError> {
        let caller: Arc<dyn Subscriber> = self.clone();
        let spec = self.load_group.clone();
        if self.is_popup() {
            aggregator.dispatch_now(caller, spec)?;
        } else {
            aggregator.enqueue(caller, spec)?;
        }
        Ok(())
    }

    pub fn set_time_index(self: &Arc<Self>, index: usize, aggregator: &LoadAggregator) -> Result<(), ChartError> {
        let range = TimeRange::new(index)?;
        *lock(&self.time_range) = range;
        self.load(aggregator)
    }

    /// Step to the next longer window. Returns false if already at the last one.
    pub fn page_back(self: &Arc<Self>, aggregator: &LoadAggregator) -> Result<bool, ChartError> {
        let current = self.time_range();
        if !current.can_go_back() {
            return Ok(false);
        }
        self.set_time_index(current.back().index(), aggregator)?;
        Ok(true)
    }

    pub fn page_forward(self: &Arc<Self>, aggregator: &LoadAggregator) -> Result<bool, ChartError> {
        let current = self.time_range();
        if !current.can_go_forward() {
            return Ok(false);
        }
        self.set_time_index(current.forward().index(), aggregator)?;
        Ok(true)
    }

    fn update(&self, f: impl FnOnce(&mut ChartState)) {
        let generation = {
            let mut state = lock(&self.state);
            f(&mut state);
            state.is_ready = true;
            state.generation += 1;
            state.generation
        };
        self.updates.send_replace(generation);
    }

    fn to_series(&self, response: &Value) -> Vec<Series> {
        let now = Utc::now().timestamp();
        self.load_group
            .fields
            .iter()
            .filter_map(|f| {
                let value = lookup(response, f)?;
                transform_data(value, display_name(f), now, self.tz_offset)
            })
            .collect()
    }
}

impl Subscriber for ChartView {
    fn on_success(&self, response: Arc<Value>) {
        if self.destroyed.load(Ordering::Relaxed) {
            return;
        }
        let series = self.to_series(&response);
        let range = self.time_range();
        debug!(chart = %self.id, series = series.len(), "refresh");

        self.update(|state| {
            if check_series(&series) {
                state.series = series;
                state.has_data = true;
                state.message = None;
            } else {
                state.series.clear();
                state.has_data = false;
                state.message = Some(if range.is_default() {
                    ChartMessage::NoData
                } else {
                    ChartMessage::NoDataAtTime {
                        seconds: range.seconds(),
                    }
                });
            }
        });
    }

    fn on_failure(&self, error: Arc<TransportError>) {
        if self.destroyed.load(Ordering::Relaxed) {
            return;
        }
        warn!(chart = %self.id, error = %error, "chart load failed");
        self.update(|state| {
            state.series.clear();
            state.has_data = false;
            state.message = Some(ChartMessage::Failed {
                status: error.status_line(),
                cause: error.cause.clone(),
            });
        });
    }

    fn query_context(&self) -> QueryContext {
        QueryContext {
            host_name: self.host_name.clone(),
            time_unit_seconds: self.time_range().seconds(),
        }
    }
}

/// Build every configured chart, keyed by id in config order.
pub fn build_charts(
    configs: &[ChartConfig],
    tz_offset: i64,
) -> Result<IndexMap<String, Arc<ChartView>>, ChartError> {
    configs
        .iter()
        .map(|c| -> Result<_, ChartError> {
            Ok((c.id.clone(), Arc::new(ChartView::new(c.clone(), tz_offset)?)))
        })
        .collect()
}

/// Queue a load for every chart; bad specs are logged and skipped.
pub fn load_all(charts: &IndexMap<String, Arc<ChartView>>, aggregator: &LoadAggregator) {
    for chart in charts.values() {
        if let Err(e) = chart.load(aggregator) {
            warn!(chart = %chart.id(), error = %e, "skipping chart");
        }
    }
}
