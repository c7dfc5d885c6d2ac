//! Rewritten functions compile cleanly under `deny(warnings)`, including
//! those whose calls never return.
#![deny(warnings)]

use std::cell::RefCell;
use std::pin::pin;
use std::task::{Context, Poll, Waker};

use shallow_runtime::profile::Report;
use shallow_runtime::{CallSite, profile, wrap_calls};

thread_local! {
    static LOG: RefCell<Vec<&'static str>> = const { RefCell::new(Vec::new()) };
}

fn record(site: &'static CallSite) {
    LOG.with(|log| log.borrow_mut().push(site.name()));
}

fn take_log() -> Vec<&'static str> {
    LOG.with(|log| std::mem::take(&mut *log.borrow_mut()))
}

fn fail(reason: &str) -> ! {
    panic!("{reason}");
}

fn half(v: u32) -> u32 {
    v / 2
}

#[wrap_calls(wrapper = record)]
fn always_fails() -> u32 {
    fail("always");
}

#[test]
fn diverging_tail_call_is_wrapped() {
    assert!(std::panic::catch_unwind(always_fails).is_err());
    assert_eq!(take_log(), ["fail"]);
}

#[wrap_calls(wrapper = record)]
fn halve_even(v: u32) -> u32 {
    if v % 2 == 0 { half(v) } else { fail("odd") }
}

#[test]
fn diverging_branch_is_wrapped() {
    assert_eq!(halve_even(8), 4);
    assert_eq!(take_log(), ["half"]);
    assert!(std::panic::catch_unwind(|| halve_even(3)).is_err());
    assert_eq!(take_log(), ["fail"]);
}

fn note(report: &Report) {
    LOG.with(|log| log.borrow_mut().push(report.function));
}

#[profile(time_limit = 60, below = note, above = note)]
async fn first_even(values: Vec<u32>) -> u32 {
    for v in values {
        if v % 2 == 0 {
            return half(v);
        }
    }
    fail("no even value");
}

#[test]
fn async_profile_with_early_return() {
    let mut cx = Context::from_waker(Waker::noop());
    let mut fut = pin!(first_even(vec![3, 6]));
    assert_eq!(fut.as_mut().poll(&mut cx), Poll::Ready(3));
    assert_eq!(take_log(), ["first_even"]);
}
