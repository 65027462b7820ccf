//! Windowed metric history
//!
//! Each metric keeps the most recent `window` steps. Values submitted for the
//! same step are summed into one bucket; mean-mode metrics also accumulate a
//! count and store `value * count`, so reading divides the two back out.

use collective::{CollectiveChannel, PendingReduce};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use runtime_core::{Codec, Error, ItemType, MetricsConfig, Numeric, ReduceMode, Result, Step};
use std::collections::VecDeque;
use tracing::{debug, instrument};

/// Storage settings fixed on a metric's first submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricOptions {
    pub reduction: ReduceMode,
    pub item_type: ItemType,
    /// Number of retained steps; `None` uses the store default
    pub window: Option<usize>,
}

impl MetricOptions {
    pub fn new(reduction: ReduceMode) -> Self {
        Self {
            reduction,
            ..Self::default()
        }
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = Some(window);
        self
    }

    pub fn transient(mut self) -> Self {
        self.item_type = ItemType::Transient;
        self
    }
}

/// Resolved settings of a stored metric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricSettings {
    pub reduction: ReduceMode,
    pub item_type: ItemType,
    pub window: usize,
}

/// Accumulated contributions for one step
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub value: Numeric,
    pub count: Option<Numeric>,
}

#[derive(Debug)]
struct MetricSeries {
    settings: MetricSettings,
    /// Whether counts are supplied explicitly; fixed by the first mean-mode submission
    explicit_count: Option<bool>,
    buckets: VecDeque<(Step, Bucket)>,
}

impl MetricSeries {
    fn new(settings: MetricSettings) -> Self {
        Self {
            settings,
            explicit_count: None,
            buckets: VecDeque::with_capacity(settings.window.min(64)),
        }
    }

    fn latest_step(&self) -> Option<Step> {
        self.buckets.back().map(|(step, _)| *step)
    }

    fn bucket(&self, step: Option<Step>) -> Option<(Step, &Bucket)> {
        match step {
            None => self.buckets.back().map(|(s, b)| (*s, b)),
            Some(step) => self
                .buckets
                .binary_search_by_key(&step, |(s, _)| *s)
                .ok()
                .map(|i| (step, &self.buckets[i].1)),
        }
    }

    fn bucket_mut(&mut self, step: Step) -> Option<&mut Bucket> {
        let index = self.buckets.binary_search_by_key(&step, |(s, _)| *s).ok()?;
        self.buckets.get_mut(index).map(|(_, bucket)| bucket)
    }

    fn check_settings(&self, name: &str, settings: &MetricSettings) -> Result<()> {
        let current = &self.settings;
        let mismatch = if current.reduction != settings.reduction {
            Some(format!(
                "reduction {} != {}",
                current.reduction, settings.reduction
            ))
        } else if current.item_type != settings.item_type {
            Some(format!(
                "item type {:?} != {:?}",
                current.item_type, settings.item_type
            ))
        } else if current.window != settings.window {
            Some(format!("window {} != {}", current.window, settings.window))
        } else {
            None
        };

        match mismatch {
            Some(detail) => Err(Error::ConfigConflict {
                name: name.to_string(),
                detail,
            }),
            None => Ok(()),
        }
    }

    fn record(
        &mut self,
        name: &str,
        value: Numeric,
        count: Option<Numeric>,
        step: Step,
    ) -> Result<()> {
        if let Some(last) = self.latest_step() {
            if step < last {
                return Err(Error::OutOfOrderStep {
                    name: name.to_string(),
                    step,
                    last,
                });
            }
        }

        let (value, count) = if self.settings.reduction.is_mean() {
            let explicit = count.is_some();
            match self.explicit_count {
                Some(expected) if expected != explicit => {
                    return Err(Error::InconsistentCount {
                        name: name.to_string(),
                    });
                }
                _ => {}
            }
            let count = count.unwrap_or(Numeric::Int(1));
            let weighted = value.checked_mul(&count)?;
            self.explicit_count = Some(explicit);
            (weighted, Some(count))
        } else {
            (value, count)
        };

        match self.buckets.back_mut() {
            Some((last, bucket)) if *last == step => {
                let merged_value = bucket.value.checked_add(&value)?;
                let merged_count = match &bucket.count {
                    Some(acc) => Some(acc.checked_add(&count.unwrap_or(Numeric::Int(1)))?),
                    None => None,
                };
                bucket.value = merged_value;
                bucket.count = merged_count;
            }
            _ => {
                self.buckets.push_back((step, Bucket { value, count }));
                while self.buckets.len() > self.settings.window {
                    self.buckets.pop_front();
                }
            }
        }
        Ok(())
    }
}

/// Per-rank store of named, step-indexed metrics
pub struct MetricStore {
    history: DashMap<String, MetricSeries>,
    default_window: usize,
}

impl Default for MetricStore {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MetricStore {
    pub fn new(default_window: usize) -> Self {
        Self {
            history: DashMap::new(),
            default_window: default_window.max(1),
        }
    }

    pub fn from_config(config: &MetricsConfig) -> Self {
        Self::new(config.default_window)
    }

    pub fn default_window(&self) -> usize {
        self.default_window
    }

    /// Record a contribution to `name` at `step`.
    ///
    /// The first submission fixes the metric's settings; later submissions
    /// with different settings fail with [`Error::ConfigConflict`]. Steps must
    /// be non-decreasing per metric.
    #[instrument(skip(self, value, count), fields(reduction = %options.reduction))]
    pub fn submit_metric(
        &self,
        name: &str,
        value: impl Into<Numeric>,
        count: Option<Numeric>,
        step: Step,
        options: MetricOptions,
    ) -> Result<()> {
        let settings = self.resolve(&options)?;
        let value = value.into();
        value.ensure_reducible()?;
        if let Some(count) = &count {
            count.ensure_reducible()?;
        }

        let result = match self.history.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                let series = entry.get_mut();
                series.check_settings(name, &settings)?;
                series.record(name, value, count, step)
            }
            // A metric only exists once its first contribution has been recorded
            Entry::Vacant(entry) => {
                let mut series = MetricSeries::new(settings);
                series.record(name, value, count, step).map(|()| {
                    debug!(name, window = settings.window, "Registered metric");
                    entry.insert(series);
                })
            }
        };
        result.map_err(|err| match err {
            Error::NumericOverflow { context } => Error::NumericOverflow {
                context: format!("{} (metric {}, step {})", context, name, step),
            },
            other => other,
        })
    }

    /// Read the value at `step`, or at the latest retained step.
    ///
    /// Mean-mode metrics return the count-weighted mean.
    pub fn get_value(&self, name: &str, step: Option<Step>) -> Result<Numeric> {
        let series = self.series(name)?;
        let (_, bucket) = series
            .bucket(step)
            .ok_or_else(|| step_not_found(name, step))?;

        if series.settings.reduction.is_mean() {
            let count = bucket.count.as_ref().ok_or_else(|| Error::Internal {
                message: format!("mean metric {} has no count", name),
            })?;
            bucket.value.checked_div(count)
        } else {
            Ok(bucket.value.clone())
        }
    }

    /// Raw accumulated bucket at `step`, before any division
    pub fn bucket(&self, name: &str, step: Option<Step>) -> Result<Bucket> {
        let series = self.series(name)?;
        series
            .bucket(step)
            .map(|(_, bucket)| bucket.clone())
            .ok_or_else(|| step_not_found(name, step))
    }

    /// Reduce the bucket at `step` across ranks and write the result back.
    ///
    /// Every rank must call this for the same metrics in the same order.
    pub fn synchronize<C: Codec>(
        &self,
        channel: &CollectiveChannel<C>,
        name: &str,
        step: Option<Step>,
    ) -> Result<()> {
        self.synchronize_async(channel, name, step)?.wait()
    }

    /// Issue the reductions for [`MetricStore::synchronize`] without waiting.
    ///
    /// Contributions made to the same step before [`PendingSync::wait`] are
    /// replaced by the reduced value.
    pub fn synchronize_async<C: Codec>(
        &self,
        channel: &CollectiveChannel<C>,
        name: &str,
        step: Option<Step>,
    ) -> Result<PendingSync<'_>> {
        let (step, bucket) = {
            let series = self.series(name)?;
            if series.settings.reduction == ReduceMode::None {
                return Ok(PendingSync::noop(self, name));
            }
            let (step, bucket) = series
                .bucket(step)
                .ok_or_else(|| step_not_found(name, step))?;
            (step, bucket.clone())
        };

        debug!(name, step, "Synchronizing metric");
        let value = channel.all_reduce_async(bucket.value)?.pop();
        let count = match bucket.count {
            Some(count) => channel.all_reduce_async(count)?.pop(),
            None => None,
        };

        Ok(PendingSync {
            store: self,
            name: name.to_string(),
            step: Some(step),
            value,
            count,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.history.contains_key(name)
    }

    /// Names of every recorded metric, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.history.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Retained steps of `name`, oldest first
    pub fn steps(&self, name: &str) -> Result<Vec<Step>> {
        Ok(self.series(name)?.buckets.iter().map(|(s, _)| *s).collect())
    }

    /// Number of retained steps of `name`
    pub fn len(&self, name: &str) -> Result<usize> {
        Ok(self.series(name)?.buckets.len())
    }

    pub fn latest_step(&self, name: &str) -> Result<Option<Step>> {
        Ok(self.series(name)?.latest_step())
    }

    pub fn settings(&self, name: &str) -> Result<MetricSettings> {
        Ok(self.series(name)?.settings)
    }

    fn series(&self, name: &str) -> Result<dashmap::mapref::one::Ref<'_, String, MetricSeries>> {
        self.history.get(name).ok_or_else(|| Error::MetricNotFound {
            name: name.to_string(),
        })
    }

    fn resolve(&self, options: &MetricOptions) -> Result<MetricSettings> {
        let window = options.window.unwrap_or(self.default_window);
        if window == 0 {
            return Err(Error::InvalidConfig {
                message: "metric window must be at least 1".to_string(),
            });
        }
        Ok(MetricSettings {
            reduction: options.reduction,
            item_type: options.item_type,
            window,
        })
    }
}

fn step_not_found(name: &str, step: Option<Step>) -> Error {
    Error::StepNotFound {
        name: name.to_string(),
        step: step.map_or_else(|| "latest".to_string(), |s| s.to_string()),
    }
}

/// In-flight synchronization of one metric step
#[must_use = "the reduced value is only written back by wait()"]
pub struct PendingSync<'a> {
    store: &'a MetricStore,
    name: String,
    step: Option<Step>,
    value: Option<PendingReduce>,
    count: Option<PendingReduce>,
}

impl<'a> PendingSync<'a> {
    fn noop(store: &'a MetricStore, name: &str) -> Self {
        Self {
            store,
            name: name.to_string(),
            step: None,
            value: None,
            count: None,
        }
    }

    /// Wait for the reductions and store the results
    pub fn wait(self) -> Result<()> {
        let value = self.value.map(PendingReduce::wait).transpose()?;
        let count = self.count.map(PendingReduce::wait).transpose()?;
        let Some(step) = self.step else {
            return Ok(());
        };
        if value.is_none() && count.is_none() {
            return Ok(());
        }

        let mut series = self
            .store
            .history
            .get_mut(&self.name)
            .ok_or_else(|| Error::MetricNotFound {
                name: self.name.clone(),
            })?;
        let bucket = series
            .bucket_mut(step)
            .ok_or_else(|| step_not_found(&self.name, Some(step)))?;

        if let Some(value) = value {
            bucket.value = value;
        }
        if let Some(count) = count {
            bucket.count = Some(count);
        }
        Ok(())
    }
}
