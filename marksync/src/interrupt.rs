use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::Notify;

#[derive(Clone, Debug)]
pub struct InterruptState {
    interrupted: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl InterruptState {
    pub fn new() -> Self {
        Self {
            interrupted: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn set_interrupted(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Resolves once interrupted. Meant for a single waiter.
    pub async fn interrupted(&self) {
        if self.is_interrupted() {
            return;
        }
        self.notify.notified().await;
    }
}

fn set_process_interrupt_handler(interrupted: &InterruptState) {
    let interrupted = interrupted.clone();
    ctrlc::set_handler(move || {
        interrupted.set_interrupted();
    })
    .expect("Error setting interrupt handler");
}

pub fn set_up_process_interrupt_handler() -> InterruptState {
    let interrupt_state = InterruptState::new();
    set_process_interrupt_handler(&interrupt_state);
    interrupt_state
}
