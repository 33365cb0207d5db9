use std::sync::{Arc, Mutex};

/// An append-only record of what the kernel threads of a test did, in order.
pub struct Journal<T>(Mutex<Vec<T>>);

impl<T: Clone> Journal<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Journal(Mutex::new(Vec::new())))
    }

    pub fn push(&self, entry: T) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<T> {
        self.0.lock().unwrap().clone()
    }
}
