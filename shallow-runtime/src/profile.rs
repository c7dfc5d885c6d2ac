//! The shallow profiler.
//!
//! `#[profile(time_limit = ..)]` wraps each call in the function with
//! [`time`] and opens the body with an [`Invocation`] guard. Every invocation
//! owns a fresh [`Recorder`], which is on a thread-local stack exactly while
//! the invocation's own code runs, so recursive and concurrent invocations
//! never share call records.
//!
//! A synchronous body runs start to finish on one thread, so its recorder is
//! entered once for the whole call. An `async fn` body is handed to [`scope`]
//! instead, which enters the recorder around every poll: invocations
//! interleaved on one thread, or moved between worker threads, each see only
//! their own calls.
//!
//! Calls made on other threads (inside spawned closures) find no recorder
//! there and are not recorded.

use std::cell::RefCell;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::CallSite;

/// Receives the report of one finished invocation.
pub type Callback = fn(&Report);

/// Per-function profiler settings, emitted as a `static` by the rewrite.
#[derive(Debug)]
pub struct Profile {
    function: &'static str,
    limit: Duration,
    below: Option<Callback>,
    above: Option<Callback>,
}

impl Profile {
    #[doc(hidden)]
    pub const fn new(
        function: &'static str,
        limit: Duration,
        below: Option<Callback>,
        above: Option<Callback>,
    ) -> Self {
        Self {
            function,
            limit,
            below,
            above,
        }
    }

    pub fn function(&self) -> &'static str {
        self.function
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    fn dispatch(&self, report: &Report) {
        let callback = match report.outcome {
            Outcome::Below => self.below,
            Outcome::Above => self.above,
        };
        if let Some(callback) = callback {
            callback(report);
        }
    }
}

/// One timed call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub name: &'static str,
    pub site: &'static CallSite,
    /// Wall time from the start of the call expression to its end.
    pub elapsed: Duration,
    /// Time spent in timed calls evaluated inside this one (receiver and
    /// arguments).
    pub nested: Duration,
}

impl CallRecord {
    /// Self time: `elapsed` minus `nested`.
    ///
    /// The timer starts before the receiver and arguments are evaluated, and
    /// only timed calls are subtracted. Work in the arguments that is not
    /// itself timed (plain computation, or calls skipped by
    /// `ignore_builtins` or a blacklist) counts toward this call, so the
    /// figure is an upper bound on the time spent in the callee.
    pub fn duration(&self) -> Duration {
        self.elapsed.saturating_sub(self.nested)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Total time was under the limit.
    Below,
    /// Total time reached or exceeded the limit.
    Above,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Below => "below",
            Outcome::Above => "above",
        })
    }
}

/// What a profiled invocation reports when it finishes.
#[derive(Debug, Clone)]
pub struct Report {
    pub function: &'static str,
    pub total: Duration,
    pub limit: Duration,
    pub outcome: Outcome,
    /// In completion order, unaggregated.
    pub calls: Vec<CallRecord>,
}

impl Report {
    /// Self time summed per call name, longest first. Ties keep first-seen
    /// order.
    pub fn summarize(&self) -> Vec<(&'static str, Duration)> {
        let mut sums: Vec<(&'static str, Duration)> = Vec::new();
        for call in &self.calls {
            match sums.iter_mut().find(|(name, _)| *name == call.name) {
                Some((_, total)) => *total += call.duration(),
                None => sums.push((call.name, call.duration())),
            }
        }
        sums.sort_by(|a, b| b.1.cmp(&a.1));
        sums
    }
}

/// Default below-limit callback: logs the total.
pub fn log_below(report: &Report) {
    tracing::info!(
        function = report.function,
        total = ?report.total,
        limit = ?report.limit,
        "{} finished in {:?}, below limit of {:?}",
        report.function,
        report.total,
        report.limit,
    );
}

/// Default above-limit callback: logs the total, then the time per call name.
pub fn log_above(report: &Report) {
    tracing::info!(
        function = report.function,
        total = ?report.total,
        limit = ?report.limit,
        "{} finished in {:?}, above limit of {:?}",
        report.function,
        report.total,
        report.limit,
    );
    for (name, duration) in report.summarize() {
        tracing::info!(function = report.function, call = name, duration = ?duration, "  {name}: {duration:?}");
    }
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<CallRecord>,
    /// Nested time of each open call timer, innermost last.
    open: Vec<Duration>,
    closed: bool,
}

/// Call records of one invocation.
///
/// Shared with the call timers started during it. A timer whose arguments
/// await outlives the poll that started it, and the next poll may run on
/// another thread, so the state sits behind a lock.
#[derive(Debug, Clone, Default)]
struct Recorder(Arc<Mutex<State>>);

impl Recorder {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self) {
        let _ = ACTIVE.try_with(|active| active.borrow_mut().push(self.clone()));
    }

    fn exit(&self) {
        let _ = ACTIVE.try_with(|active| {
            let mut active = active.borrow_mut();
            if let Some(pos) = active.iter().rposition(|r| Arc::ptr_eq(&r.0, &self.0)) {
                active.remove(pos);
            }
        });
    }
}

thread_local! {
    static ACTIVE: RefCell<Vec<Recorder>> = const { RefCell::new(Vec::new()) };
}

/// Guard for one run of a profiled function. Dispatches the report on drop,
/// including during unwinding and when an `async fn` future is cancelled.
#[must_use = "the invocation is reported when the guard drops"]
pub struct Invocation {
    profile: &'static Profile,
    start: Instant,
    recorder: Recorder,
    entered: bool,
}

impl Invocation {
    /// Open an invocation without entering it. Its calls are recorded only
    /// inside [`scope`].
    pub fn new(profile: &'static Profile) -> Self {
        Self {
            profile,
            start: Instant::now(),
            recorder: Recorder::default(),
            entered: false,
        }
    }

    /// Open an invocation and enter it on this thread until the guard drops.
    pub fn start(profile: &'static Profile) -> Self {
        let mut invocation = Self::new(profile);
        invocation.recorder.enter();
        invocation.entered = true;
        invocation
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        let total = self.start.elapsed();
        let calls = {
            let mut state = self.recorder.lock();
            state.closed = true;
            std::mem::take(&mut state.calls)
        };
        if self.entered {
            self.recorder.exit();
        }

        let outcome = if total < self.profile.limit {
            Outcome::Below
        } else {
            Outcome::Above
        };
        let report = Report {
            function: self.profile.function,
            total,
            limit: self.profile.limit,
            outcome,
            calls,
        };
        self.profile.dispatch(&report);
    }
}

/// Run `future` with `invocation` entered during each of its polls.
pub fn scope<F: Future>(invocation: &Invocation, future: F) -> Scoped<F> {
    Scoped {
        recorder: invocation.recorder.clone(),
        future: Box::pin(future),
    }
}

/// Future returned by [`scope`].
#[must_use = "futures do nothing unless polled"]
pub struct Scoped<F> {
    recorder: Recorder,
    future: Pin<Box<F>>,
}

/// Leaves the entered recorder when dropped, so a panicking poll unwinds
/// with the stack intact.
struct Entered<'a>(&'a Recorder);

impl Drop for Entered<'_> {
    fn drop(&mut self) {
        self.0.exit();
    }
}

impl<F: Future> Future for Scoped<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let this = self.get_mut();
        this.recorder.enter();
        let _entered = Entered(&this.recorder);
        this.future.as_mut().poll(cx)
    }
}

/// Wrapper used by `#[profile]`: times the call at `site` into the innermost
/// entered invocation on this thread.
pub fn time(site: &'static CallSite) -> CallTimer {
    let recorder = ACTIVE
        .try_with(|active| active.borrow().last().cloned())
        .ok()
        .flatten();
    if let Some(recorder) = &recorder {
        recorder.lock().open.push(Duration::ZERO);
    }
    CallTimer {
        site,
        recorder,
        start: Instant::now(),
    }
}

/// Records one [`CallRecord`] when dropped.
#[must_use = "the call is timed until the timer drops"]
pub struct CallTimer {
    site: &'static CallSite,
    recorder: Option<Recorder>,
    start: Instant,
}

impl Drop for CallTimer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let Some(recorder) = &self.recorder else {
            return;
        };
        let mut state = recorder.lock();
        let nested = state.open.pop().unwrap_or_default();
        if let Some(parent) = state.open.last_mut() {
            *parent += elapsed;
        }
        if !state.closed {
            state.calls.push(CallRecord {
                name: self.site.name(),
                site: self.site,
                elapsed,
                nested,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static SITE_A: CallSite = CallSite::new("a", "f", "lib.rs", 1, 1, 1, "a()");
    static SITE_B: CallSite = CallSite::new("b", "f", "lib.rs", 2, 2, 1, "b()");

    static REPORTS: Mutex<Vec<Report>> = Mutex::new(Vec::new());

    fn keep(report: &Report) {
        REPORTS.lock().unwrap().push(report.clone());
    }

    fn take_report(function: &str) -> Report {
        let mut reports = REPORTS.lock().unwrap();
        let index = reports.iter().position(|r| r.function == function).unwrap();
        reports.remove(index)
    }

    fn record(name: &'static str, site: &'static CallSite, millis: u64, nested: u64) -> CallRecord {
        CallRecord {
            name,
            site,
            elapsed: Duration::from_millis(millis),
            nested: Duration::from_millis(nested),
        }
    }

    #[test]
    fn summarize_sums_self_time_by_name() {
        let report = Report {
            function: "f",
            total: Duration::from_millis(30),
            limit: Duration::from_millis(10),
            outcome: Outcome::Above,
            calls: vec![
                record("a", &SITE_A, 4, 0),
                record("b", &SITE_B, 9, 2),
                record("a", &SITE_A, 5, 0),
            ],
        };
        assert_eq!(
            report.summarize(),
            [
                ("a", Duration::from_millis(9)),
                ("b", Duration::from_millis(7)),
            ]
        );
    }

    #[test]
    fn default_callbacks_accept_empty_reports() {
        let report = Report {
            function: "f",
            total: Duration::ZERO,
            limit: Duration::ZERO,
            outcome: Outcome::Above,
            calls: Vec::new(),
        };
        log_below(&report);
        log_above(&report);
        assert!(report.summarize().is_empty());
    }

    #[test]
    fn timers_outside_an_invocation_record_nothing() {
        let timer = time(&SITE_A);
        assert!(timer.recorder.is_none());
    }

    #[test]
    fn nested_timers_split_self_time() {
        static PROFILE: Profile = Profile::new("nested", Duration::from_secs(60), Some(keep), None);
        {
            let _invocation = Invocation::start(&PROFILE);
            let outer = time(&SITE_A);
            {
                let _inner = time(&SITE_B);
                std::thread::sleep(Duration::from_millis(5));
            }
            drop(outer);
        }
        let report = take_report("nested");
        assert_eq!(report.outcome, Outcome::Below);
        let names: Vec<&str> = report.calls.iter().map(|c| c.name).collect();
        assert_eq!(names, ["b", "a"]);
        assert_eq!(report.calls[1].nested, report.calls[0].elapsed);
        assert!(report.calls[1].duration() < report.calls[0].duration());
    }

    #[test]
    fn unentered_invocation_records_only_inside_scope() {
        static PROFILE: Profile = Profile::new("scoped", Duration::from_secs(60), Some(keep), None);
        {
            let invocation = Invocation::new(&PROFILE);
            drop(time(&SITE_A));
            let mut scoped = std::pin::pin!(scope(&invocation, async { drop(time(&SITE_B)) }));
            let mut cx = Context::from_waker(std::task::Waker::noop());
            assert!(scoped.as_mut().poll(&mut cx).is_ready());
            drop(time(&SITE_A));
        }
        let report = take_report("scoped");
        let names: Vec<&str> = report.calls.iter().map(|c| c.name).collect();
        assert_eq!(names, ["b"]);
        assert!(ACTIVE.with(|active| active.borrow().is_empty()));
    }

    #[test]
    fn timer_outliving_its_invocation_is_dropped_silently() {
        static PROFILE: Profile = Profile::new("outlived", Duration::ZERO, None, Some(keep));
        let invocation = Invocation::start(&PROFILE);
        let timer = time(&SITE_A);
        drop(invocation);
        drop(timer);
        let report = take_report("outlived");
        assert_eq!(report.outcome, Outcome::Above);
        assert!(report.calls.is_empty());
    }
}
