//! Scope-based timing of layer calls, primitive executions and layout conversions.
//!
//! Guards are free when the `profiler` feature is disabled. With the feature on,
//! every guard records inclusive time and exclusive time (inclusive minus nested
//! guards on the same thread) into a process-wide table.

#[cfg(feature = "profiler")]
use std::cell::RefCell;
#[cfg(feature = "profiler")]
use std::collections::HashMap;
#[cfg(feature = "profiler")]
use std::sync::{Mutex, OnceLock, PoisonError};
#[cfg(feature = "profiler")]
use std::time::{Duration, Instant};

#[cfg(feature = "profiler")]
use serde::Serialize;

#[cfg_attr(not(feature = "profiler"), allow(dead_code))]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum ProfilerKey {
    Layer(&'static str),
    Primitive(&'static str),
    Conversion(&'static str),
}

#[cfg(feature = "profiler")]
#[derive(Default, Clone)]
struct Stat {
    calls: u64,
    exclusive_ns: u128,
    inclusive_ns: u128,
    elements: u64,
}

#[cfg(feature = "profiler")]
struct Profiler {
    stats: Mutex<HashMap<ProfilerKey, Stat>>,
}

#[cfg(feature = "profiler")]
impl Profiler {
    fn instance() -> &'static Self {
        static INSTANCE: OnceLock<Profiler> = OnceLock::new();
        INSTANCE.get_or_init(|| Profiler {
            stats: Mutex::new(HashMap::new()),
        })
    }

    fn record(&self, key: ProfilerKey, exclusive: Duration, inclusive: Duration, elements: u64) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = stats.entry(key).or_default();
        entry.calls = entry.calls.saturating_add(1);
        entry.exclusive_ns = entry.exclusive_ns.saturating_add(exclusive.as_nanos());
        entry.inclusive_ns = entry.inclusive_ns.saturating_add(inclusive.as_nanos());
        entry.elements = entry.elements.saturating_add(elements);
    }

    fn take(&self) -> HashMap<ProfilerKey, Stat> {
        std::mem::take(&mut *self.stats.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[cfg(feature = "profiler")]
struct GuardFrame {
    key: ProfilerKey,
    start: Instant,
    child_time: Duration,
    elements: u64,
}

#[cfg(feature = "profiler")]
thread_local! {
    static ACTIVE_GUARDS: RefCell<Vec<GuardFrame>> = const { RefCell::new(Vec::new()) };
}

pub struct ScopeGuard {
    #[cfg(feature = "profiler")]
    key: ProfilerKey,
}

impl ScopeGuard {
    #[inline(always)]
    fn new(key: ProfilerKey, elements: u64) -> Self {
        #[cfg(feature = "profiler")]
        {
            ACTIVE_GUARDS.with(|stack| {
                stack.borrow_mut().push(GuardFrame {
                    key,
                    start: Instant::now(),
                    child_time: Duration::ZERO,
                    elements,
                });
            });
            ScopeGuard { key }
        }
        #[cfg(not(feature = "profiler"))]
        {
            let _ = (key, elements);
            ScopeGuard {}
        }
    }
}

#[cfg(feature = "profiler")]
impl Drop for ScopeGuard {
    fn drop(&mut self) {
        ACTIVE_GUARDS.with(|stack| {
            let mut stack = stack.borrow_mut();
            let Some(frame) = stack.pop() else {
                return;
            };
            debug_assert!(frame.key == self.key, "scope guard stack corrupted");
            let elapsed = frame.start.elapsed();
            let exclusive = elapsed.saturating_sub(frame.child_time);
            Profiler::instance().record(frame.key, exclusive, elapsed, frame.elements);
            if let Some(parent) = stack.last_mut() {
                parent.child_time = parent.child_time.saturating_add(elapsed);
            }
        });
    }
}

#[inline(always)]
pub fn layer_scope(name: &'static str) -> ScopeGuard {
    ScopeGuard::new(ProfilerKey::Layer(name), 0)
}

#[inline(always)]
pub fn primitive_scope(name: &'static str) -> ScopeGuard {
    ScopeGuard::new(ProfilerKey::Primitive(name), 0)
}

/// Times one layout conversion of `elements` values.
#[inline(always)]
pub fn conversion_scope(name: &'static str, elements: usize) -> ScopeGuard {
    ScopeGuard::new(ProfilerKey::Conversion(name), elements as u64)
}

#[cfg(feature = "profiler")]
#[derive(Debug, Clone, Serialize)]
pub struct TableRow {
    pub name: String,
    pub calls: u64,
    pub excl_ms: f64,
    pub incl_ms: f64,
    pub percent: f64,
    pub elements: u64,
}

#[cfg(feature = "profiler")]
#[derive(Debug, Default, Clone, Serialize)]
pub struct ProfilerTables {
    pub layers: Vec<TableRow>,
    pub primitives: Vec<TableRow>,
    pub conversions: Vec<TableRow>,
}

#[cfg(not(feature = "profiler"))]
#[derive(Debug, Default, Clone)]
pub struct ProfilerTables {
    _private: (),
}

#[cfg(feature = "profiler")]
fn build_rows(entries: Vec<(&'static str, Stat)>) -> Vec<TableRow> {
    let total_ns: u128 = entries.iter().map(|(_, stat)| stat.exclusive_ns).sum();
    let mut rows: Vec<TableRow> = entries
        .into_iter()
        .map(|(name, stat)| TableRow {
            name: name.to_string(),
            calls: stat.calls,
            excl_ms: stat.exclusive_ns as f64 / 1.0e6,
            incl_ms: stat.inclusive_ns as f64 / 1.0e6,
            percent: if total_ns == 0 {
                0.0
            } else {
                stat.exclusive_ns as f64 * 100.0 / total_ns as f64
            },
            elements: stat.elements,
        })
        .collect();
    rows.sort_by(|a, b| b.excl_ms.total_cmp(&a.excl_ms));
    rows
}

/// Drains the recorded statistics. `None` when profiling is compiled out.
pub fn take_tables() -> Option<ProfilerTables> {
    #[cfg(feature = "profiler")]
    {
        let mut layers = Vec::new();
        let mut primitives = Vec::new();
        let mut conversions = Vec::new();
        for (key, stat) in Profiler::instance().take() {
            match key {
                ProfilerKey::Layer(name) => layers.push((name, stat)),
                ProfilerKey::Primitive(name) => primitives.push((name, stat)),
                ProfilerKey::Conversion(name) => conversions.push((name, stat)),
            }
        }
        Some(ProfilerTables {
            layers: build_rows(layers),
            primitives: build_rows(primitives),
            conversions: build_rows(conversions),
        })
    }
    #[cfg(not(feature = "profiler"))]
    {
        None
    }
}

/// Drains the recorded statistics as JSON.
pub fn take_tables_json() -> Option<String> {
    #[cfg(feature = "profiler")]
    {
        take_tables().and_then(|tables| serde_json::to_string_pretty(&tables).ok())
    }
    #[cfg(not(feature = "profiler"))]
    {
        None
    }
}

pub fn reset() {
    #[cfg(feature = "profiler")]
    {
        let _ = Profiler::instance().take();
    }
}

#[cfg(feature = "profiler")]
pub fn format_tables(tables: &ProfilerTables) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    for (title, rows) in [
        ("layers", &tables.layers),
        ("primitives", &tables.primitives),
        ("conversions", &tables.conversions),
    ] {
        if rows.is_empty() {
            continue;
        }
        let _ = writeln!(out, "== {title} ==");
        let _ = writeln!(
            out,
            "{:<40} {:>8} {:>12} {:>12} {:>7}",
            "name", "calls", "excl_ms", "incl_ms", "%"
        );
        for row in rows {
            let _ = writeln!(
                out,
                "{:<40} {:>8} {:>12.3} {:>12.3} {:>6.1}%",
                row.name, row.calls, row.excl_ms, row.incl_ms, row.percent
            );
        }
    }
    out
}

#[cfg(not(feature = "profiler"))]
pub fn format_tables(_tables: &ProfilerTables) -> String {
    String::new()
}
