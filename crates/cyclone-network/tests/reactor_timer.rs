//! Smoke test for the reactor's timer channel from outside the crate,
//! exercising only the public `Looper`/`LooperHandle` surface: a timer
//! with interval T should fire approximately `elapsed/T` times (spec.md
//! §8's reactor testable property).

use std::sync::mpsc;
use std::time::Duration;

use cyclone_network::Looper;

#[test]
fn timer_fires_approximately_elapsed_over_interval() {
    let mut looper = Looper::new().unwrap();
    let (tx, rx) = mpsc::channel::<()>();
    looper.register_timer(Duration::from_millis(10), Box::new(move |_, _| {
        let _ = tx.send(());
    }));

    let handle = looper.handle();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(500));
        handle.push_stop_request();
    });
    looper.run().unwrap();

    let fires = rx.try_iter().count();
    // ~50 fires expected over 500ms at a 10ms interval; generous bounds
    // to absorb scheduling jitter in CI.
    assert!(fires >= 30, "expected at least 30 timer fires, got {fires}");
    assert!(fires <= 70, "expected at most 70 timer fires, got {fires}");
}
