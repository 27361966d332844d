use std::cell::{Cell, RefCell};
use std::rc::Rc;

use thiserror::Error;
use tideloop::{runtime, BadCast, Promise, PromiseStatus, TaskLoop};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("boom")]
struct Boom;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("other")]
struct Other;

fn ticks(n: usize) {
    let task_loop = TaskLoop::thread_loop();
    for _ in 0..n {
        task_loop.run_once().expect("loop tick failed");
    }
}

#[test]
fn continuations_fire_in_microtask_order() {
    runtime::init().expect("runtime init failed");
    let task_loop = TaskLoop::thread_loop();
    let log: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

    let (promise, ctx) = Promise::<i32>::with_ctx();

    let entry = log.clone();
    promise.then(move |value| {
        entry.borrow_mut().push(format!("A {value}"));
    });

    let late_attach = promise.clone();
    let entry = log.clone();
    task_loop.oneshot(move || {
        ctx.resolve(42);
        late_attach.then(move |value| {
            entry.borrow_mut().push(format!("B {value}"));
        });
        Ok(())
    });

    ticks(2);
    assert_eq!(*log.borrow(), ["A 42", "B 42"]);
}

#[test]
fn a_promise_settles_exactly_once() {
    runtime::init().expect("runtime init failed");

    let (promise, ctx) = Promise::<i32>::with_ctx();
    ctx.resolve(1);
    ctx.resolve(2);
    ctx.reject(Boom);

    assert_eq!(promise.status(), PromiseStatus::Resolved);

    let observed = Rc::new(Cell::new(0));
    let sink = observed.clone();
    promise.then(move |value| sink.set(value));

    ticks(2);
    assert_eq!(observed.get(), 1);
}

#[test]
fn continuations_never_run_synchronously() {
    runtime::init().expect("runtime init failed");

    let promise = Promise::resolved(5);
    let fired = Rc::new(Cell::new(false));

    let flag = fired.clone();
    promise.then(move |_| flag.set(true));
    assert!(!fired.get(), "the continuation must wait for the drain");

    ticks(1);
    assert!(fired.get());
}

#[test]
fn continuations_on_one_promise_run_in_attachment_order() {
    runtime::init().expect("runtime init failed");
    let log: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

    let (promise, ctx) = Promise::<i32>::with_ctx();
    for index in 0..3 {
        let entry = log.clone();
        promise.then(move |_| entry.borrow_mut().push(index));
    }
    ctx.resolve(0);

    ticks(2);
    assert_eq!(*log.borrow(), [0, 1, 2]);
}

#[test]
fn adoption_forwards_the_inner_state_through_a_chain() {
    runtime::init().expect("runtime init failed");

    let (inner, inner_ctx) = Promise::<i32>::with_ctx();
    let (middle, middle_ctx) = Promise::<i32>::with_ctx();
    let (outer, outer_ctx) = Promise::<i32>::with_ctx();

    outer_ctx.adopt(middle.clone());
    middle_ctx.adopt(inner.clone());

    let observed = Rc::new(Cell::new(0));
    let sink = observed.clone();
    outer.then(move |value| sink.set(value));

    inner_ctx.resolve(7);
    ticks(4);

    assert_eq!(middle.status(), PromiseStatus::Resolved);
    assert_eq!(outer.status(), PromiseStatus::Resolved);
    assert_eq!(observed.get(), 7);
}

#[test]
fn adopting_a_settled_promise_copies_its_state_immediately() {
    runtime::init().expect("runtime init failed");

    let (outer, outer_ctx) = Promise::<i32>::with_ctx();
    outer_ctx.adopt(Promise::resolved(11));
    assert_eq!(outer.status(), PromiseStatus::Resolved);
}

#[test]
fn then_chains_map_values() {
    runtime::init().expect("runtime init failed");

    let (promise, ctx) = Promise::<i32>::with_ctx();
    let observed = Rc::new(Cell::new(0));

    let sink = observed.clone();
    promise
        .then(|value| value + 1)
        .then(|value| value * 2)
        .then(move |value| sink.set(value));

    ctx.resolve(10);
    ticks(5);
    assert_eq!(observed.get(), 22);
}

#[test]
fn a_callback_returning_a_promise_is_adopted() {
    runtime::init().expect("runtime init failed");

    let (promise, ctx) = Promise::<i32>::with_ctx();
    let observed = Rc::new(Cell::new(0));

    let sink = observed.clone();
    promise
        .then::<i32, _, _>(|value| Promise::resolved(value + 5))
        .then(move |value| sink.set(value));

    ctx.resolve(1);
    ticks(5);
    assert_eq!(observed.get(), 6);
}

#[test]
fn a_callback_returning_err_rejects_downstream() {
    runtime::init().expect("runtime init failed");

    let (promise, ctx) = Promise::<i32>::with_ctx();
    let observed = Rc::new(Cell::new(false));

    let flag = observed.clone();
    promise
        .then(|_value| -> Result<i32, Boom> { Err(Boom) })
        .catch(move |_error: &Boom| {
            flag.set(true);
            0
        });

    ctx.resolve(1);
    ticks(4);
    assert!(observed.get());
}

#[test]
fn rejections_flow_past_then_into_catch() {
    runtime::init().expect("runtime init failed");

    let (promise, ctx) = Promise::<i32>::with_ctx();
    let observed = Rc::new(Cell::new(0));

    let sink = observed.clone();
    promise
        .then(|value| value + 1)
        .catch(move |_error: &Boom| {
            sink.set(-1);
            0
        });

    ctx.reject(Boom);
    ticks(4);
    assert_eq!(observed.get(), -1);
}

#[test]
fn catch_forwards_values_when_the_promise_resolves() {
    runtime::init().expect("runtime init failed");

    let (promise, ctx) = Promise::<i32>::with_ctx();
    let observed = Rc::new(Cell::new(0));

    let sink = observed.clone();
    promise
        .catch(|_error: &Boom| 0)
        .then(move |value| sink.set(value));

    ctx.resolve(9);
    ticks(4);
    assert_eq!(observed.get(), 9);
}

#[test]
fn a_mismatched_catch_rejects_with_bad_cast() {
    runtime::init().expect("runtime init failed");

    let (promise, ctx) = Promise::<i32>::with_ctx();
    let observed = Rc::new(Cell::new(false));

    let flag = observed.clone();
    promise
        .catch(|_error: &Other| 0)
        .catch_all(move |error| {
            flag.set(error.is::<BadCast>());
            0
        });

    ctx.reject(Boom);
    ticks(4);
    assert!(observed.get(), "the mismatch must surface as BadCast");
}

#[test]
fn then_catch_composes_both_paths() {
    runtime::init().expect("runtime init failed");

    let (success, success_ctx) = Promise::<i32>::with_ctx();
    let (failure, failure_ctx) = Promise::<i32>::with_ctx();
    let fulfilled = Rc::new(Cell::new(0));
    let recovered = Rc::new(Cell::new(0));

    let sink = fulfilled.clone();
    success
        .then_catch(|value| value * 2, |_error: &Boom| -1)
        .then(move |value| sink.set(value));

    let sink = recovered.clone();
    failure
        .then_catch(|value| value * 2, |_error: &Boom| -1)
        .then(move |value| sink.set(value));

    success_ctx.resolve(4);
    failure_ctx.reject(Boom);
    ticks(6);

    assert_eq!(fulfilled.get(), 8);
    assert_eq!(recovered.get(), -1);
}

#[test]
fn rejected_errors_keep_their_dynamic_type() {
    runtime::init().expect("runtime init failed");

    let promise = Promise::<i32>::rejected(Boom);
    let observed = Rc::new(Cell::new(false));

    let flag = observed.clone();
    promise.catch_all(move |error| {
        flag.set(error.is::<Boom>());
        0
    });

    ticks(2);
    assert!(observed.get());
}
