//! Shared helpers for the end-to-end scenario tests.

use std::rc::Rc;
use std::sync::Once;

use gyre::LoopHandle;
use gyre_loop::LocalLoop;

/// A fresh loop plus its port handle.
pub fn fresh_loop() -> (Rc<LocalLoop>, LoopHandle) {
    let lp = LocalLoop::new();
    let handle = lp.handle();
    (lp, handle)
}

/// One-time logger init so `RUST_LOG=warn` surfaces runtime warnings (for
/// example never-observed task errors) while the scenarios run.
pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}
