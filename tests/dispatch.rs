mod common;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
};

use common::*;
use pledge::{config, prelude::*};

/// Installs a foreground executor for the duration of a test.
struct Foreground {
    executor: Arc<ManualExecutor>,
    previous: Option<Arc<dyn Executor>>,
    _lock: parking_lot::MutexGuard<'static, ()>,
}

impl Foreground {
    fn install() -> Foreground {
        init_test_logging();
        let lock = config_lock();
        let executor = Arc::new(ManualExecutor::new());
        let previous = config::set_foreground_executor(Some(executor.clone()));
        Foreground {
            executor,
            previous,
            _lock: lock,
        }
    }
}

impl Drop for Foreground {
    fn drop(&mut self) {
        config::set_foreground_executor(self.previous.take());
    }
}

#[test]
fn foreground_callbacks_wait_for_the_host_loop() {
    let foreground = Foreground::install();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let promise = Promise::resolved(1)
        .on(SyncOption::Foreground)
        .then(move |x| {
            flag.store(true, Ordering::Relaxed);
            x + 1
        });
    assert!(!ran.load(Ordering::Relaxed));
    assert_eq!(foreground.executor.run_pending(), 1);
    assert!(ran.load(Ordering::Relaxed));
    assert_eq!(promise.wait().resolved(), Some(2));
}

#[test]
fn missing_foreground_executor_rejects_the_link() {
    let _lock = config_lock();
    let previous = config::set_foreground_executor(None);
    let outcome = Promise::resolved(1)
        .on(SyncOption::Foreground)
        .then(|x| x + 1)
        .wait();
    config::set_foreground_executor(previous);
    let reason = outcome.rejected().unwrap();
    assert_eq!(
        reason.downcast_ref::<PromiseError>(),
        Some(&PromiseError::NoForegroundExecutor)
    );
}

#[test]
fn background_callbacks_run_off_the_calling_thread() {
    let _lock = config_lock();
    let caller = thread::current().id();
    let worker: ThreadId = Promise::resolved(())
        .on(SyncOption::Background)
        .then(|()| thread::current().id())
        .wait()
        .resolved()
        .unwrap();
    assert_ne!(caller, worker);
}

#[test]
fn switch_to_moves_the_rest_of_the_chain() {
    let foreground = Foreground::install();
    let promise = Promise::switch_to(SyncOption::Foreground).then(|()| "on main");
    assert!(promise.is_pending());
    foreground.executor.run_until_empty();
    assert_eq!(promise.wait().resolved(), Some("on main"));
}

#[test]
fn run_executes_on_the_requested_target() {
    let executor = Arc::new(ManualExecutor::new());
    let promise = Promise::run(|| 5, SyncOption::Explicit(executor.clone()));
    assert!(promise.is_pending());
    executor.run_pending();
    assert_eq!(promise.wait().resolved(), Some(5));

    let adopted = Promise::run_promise(|| Promise::resolved(6), SyncOption::Synchronous);
    assert_eq!(adopted.wait().resolved(), Some(6));
}

#[test]
fn synchronous_callbacks_run_on_the_settling_thread() {
    let (deferred, promise) = Deferred::<()>::new();
    let link = promise.then(|()| thread::current().id());
    let settler = thread::spawn(move || {
        deferred.resolve(()).unwrap();
        thread::current().id()
    });
    let settler_id = settler.join().unwrap();
    assert_eq!(link.wait().resolved(), Some(settler_id));
}

#[test]
fn custom_background_executors_replace_the_pool() {
    let _lock = config_lock();
    let executor = Arc::new(ManualExecutor::new());
    let previous = config::set_background_executor(Some(executor.clone()));
    let promise = Promise::resolved(1).on(SyncOption::Background).then(|x| x * 3);
    assert_eq!(executor.len(), 1);
    executor.run_pending();
    config::set_background_executor(previous);
    assert_eq!(promise.wait().resolved(), Some(3));
}
