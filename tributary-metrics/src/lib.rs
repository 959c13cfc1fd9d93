use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec,
};
use tributary_types::TaskInfo;

pub const TASK_METRIC_LABELS: [&str; 3] = ["job_id", "operator_id", "subtask_idx"];

fn with_task_labels<T>(task_info: &TaskInfo, f: impl FnOnce(&[&str]) -> T) -> T {
    let values = task_info.metric_label_values();
    let values: Vec<&str> = values.iter().map(String::as_str).collect();
    f(&values)
}

/// The counter `name` for this task. Each name is registered once per process as a vec keyed by
/// [`TASK_METRIC_LABELS`]; asking again for the same task returns the same counter. `None` if
/// the name is already taken by a metric registered elsewhere.
pub fn counter_for_task(
    task_info: &TaskInfo,
    name: &'static str,
    help: &'static str,
) -> Option<IntCounter> {
    static COUNTERS: OnceLock<Mutex<HashMap<&'static str, IntCounterVec>>> = OnceLock::new();
    let mut counters = COUNTERS.get_or_init(Default::default).lock().ok()?;
    let vec = match counters.entry(name) {
        Entry::Occupied(e) => e.into_mut(),
        Entry::Vacant(e) => {
            e.insert(register_int_counter_vec!(name, help, &TASK_METRIC_LABELS).ok()?)
        }
    };
    Some(with_task_labels(task_info, |values| {
        vec.with_label_values(values)
    }))
}

pub fn gauge_for_task(
    task_info: &TaskInfo,
    name: &'static str,
    help: &'static str,
) -> Option<IntGauge> {
    static GAUGES: OnceLock<Mutex<HashMap<&'static str, IntGaugeVec>>> = OnceLock::new();
    let mut gauges = GAUGES.get_or_init(Default::default).lock().ok()?;
    let vec = match gauges.entry(name) {
        Entry::Occupied(e) => e.into_mut(),
        Entry::Vacant(e) => {
            e.insert(register_int_gauge_vec!(name, help, &TASK_METRIC_LABELS).ok()?)
        }
    };
    Some(with_task_labels(task_info, |values| {
        vec.with_label_values(values)
    }))
}
