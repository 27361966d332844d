use thiserror::Error;
use tideloop::{GenStatus, Generator, GeneratorError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("boom")]
struct Boom;

#[test]
fn bidirectional_value_passing() {
    let generator = Generator::new(|ctx| {
        ctx.suspend(1)?;
        let x = ctx.suspend(2)?;
        Ok(x + 10)
    });

    assert_eq!(generator.status(), GenStatus::Pending);
    assert_eq!(generator.next(0).expect("first resume failed"), 1);
    assert_eq!(generator.next(100).expect("second resume failed"), 2);
    assert_eq!(generator.next(5).expect("third resume failed"), 15);
    assert_eq!(generator.status(), GenStatus::Done);
}

#[test]
fn next_after_done_returns_the_cached_result() {
    let generator: Generator<i32, i32> = Generator::new(|_ctx| Ok(21));

    assert_eq!(generator.next(0).expect("resume failed"), 21);
    assert_eq!(generator.next(0).expect("repeat resume failed"), 21);
    assert_eq!(generator.status(), GenStatus::Done);
}

#[test]
fn suspend_observes_status_transitions() {
    let generator: Generator<i32, i32> = Generator::new(|ctx| {
        ctx.suspend(1)?;
        Ok(2)
    });

    generator.next(0).expect("resume failed");
    assert_eq!(generator.status(), GenStatus::Suspended);
    generator.next(0).expect("resume failed");
    assert_eq!(generator.status(), GenStatus::Done);
}

#[test]
fn throw_in_suspended_raises_at_the_suspension_point() {
    let generator: Generator<i32, i32> = Generator::new(|ctx| match ctx.suspend(1) {
        Ok(_) => Ok(0),
        Err(error) => {
            assert!(
                error.downcast_ref::<Boom>().is_some(),
                "the injected error must surface inside the body"
            );
            Ok(99)
        }
    });

    assert_eq!(generator.next(0).expect("first resume failed"), 1);
    let value = generator.throw_in(Boom).expect("resume after injection failed");
    assert_eq!(value, 99);
    assert_eq!(generator.status(), GenStatus::Done);
}

#[test]
fn throw_in_pending_raises_in_the_caller() {
    let generator: Generator<i32, i32> = Generator::new(|_ctx| Ok(0));

    let error = generator
        .throw_in(Boom)
        .expect_err("a pending generator has no body to inject into");
    assert!(error.downcast_ref::<Boom>().is_some());
    assert_eq!(generator.status(), GenStatus::Pending);
}

#[test]
fn throw_in_done_raises_in_the_caller() {
    let generator: Generator<i32, i32> = Generator::new(|_ctx| Ok(0));
    generator.next(0).expect("resume failed");

    let error = generator
        .throw_in(Boom)
        .expect_err("a finished generator has no body to inject into");
    assert!(error.downcast_ref::<Boom>().is_some());
    assert_eq!(generator.status(), GenStatus::Done);
}

#[test]
fn body_errors_surface_on_the_resume_that_observes_completion() {
    let generator: Generator<i32, i32> = Generator::new(|ctx| {
        ctx.suspend(1)?;
        Err(anyhow::Error::new(Boom))
    });

    assert_eq!(generator.next(0).expect("first resume failed"), 1);
    let error = generator
        .next(0)
        .expect_err("the body error must reach the caller");
    assert!(error.downcast_ref::<Boom>().is_some());
    assert_eq!(generator.status(), GenStatus::Done);

    let error = generator
        .next(0)
        .expect_err("a failed generator keeps reporting its error");
    assert!(error.downcast_ref::<Boom>().is_some());
}

#[test]
fn reentrant_resume_fails_with_already_running() {
    let generator: Generator<i32, i32> = Generator::new(|ctx| {
        let this = ctx.handle();
        let error = this
            .next(0)
            .expect_err("resuming from inside the body must fail");
        assert!(matches!(
            error.downcast_ref::<GeneratorError>(),
            Some(GeneratorError::AlreadyRunning)
        ));
        Ok(7)
    });

    assert_eq!(generator.next(0).expect("resume failed"), 7);
}

#[test]
fn suspend_from_delegates_until_the_inner_generator_finishes() {
    let inner: Generator<i32, i32> = Generator::new(|ctx| {
        ctx.suspend(1)?;
        ctx.suspend(2)?;
        Ok(3)
    });

    let outer: Generator<i32, i32> = Generator::new(move |ctx| {
        let last = ctx.suspend_from(&inner, 0)?;
        Ok(last)
    });

    assert_eq!(outer.next(10).expect("resume failed"), 1);
    assert_eq!(outer.next(20).expect("resume failed"), 2);
    assert_eq!(outer.next(30).expect("resume failed"), 3);
    assert_eq!(outer.next(40).expect("resume failed"), 40);
    assert_eq!(outer.status(), GenStatus::Done);
}

#[test]
fn dropping_a_suspended_generator_reclaims_its_state() {
    let generator: Generator<i32, i32> = Generator::new(|ctx| {
        ctx.suspend(1)?;
        Ok(2)
    });

    generator.next(0).expect("resume failed");
    assert_eq!(generator.status(), GenStatus::Suspended);
    drop(generator);
}
