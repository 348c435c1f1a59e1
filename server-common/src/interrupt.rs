use std::sync::{Mutex, Once, OnceLock};

/**
A process-wide fan-out from OS termination signals to registered
callbacks.

The first [`InterruptListener::register`] call arms a watcher thread
subscribed to SIGINT, SIGTERM and SIGQUIT; on the first such signal
the callbacks run once, in registration order, and the list is
cleared. [`InterruptListener::fire_now`] runs and clears them
manually, making a later signal-borne invocation a no-op.

Test harnesses can construct their own instance instead of going
through the [`interrupt`] global.
*/
#[derive(Default)]
pub struct InterruptListener {
    once: Once,
    on_interrupt: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl std::fmt::Debug for InterruptListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptListener")
            .field(
                "registered",
                &self.on_interrupt.lock().map(|cbs| cbs.len()).unwrap_or(0),
            )
            .finish()
    }
}

impl InterruptListener {
    /// Construct a standalone listener. Most callers want the
    /// process-wide [`interrupt`] instance instead.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback to run once when the process is
    /// interrupted. The first registration arms the signal watcher.
    pub fn register(&'static self, cb: impl FnOnce() + Send + 'static) {
        self.listen_once();
        self.register_callback(cb);
    }

    /// Add a callback without arming the signal watcher; it will only
    /// run through [`InterruptListener::fire_now`]. Useful for test
    /// instances.
    pub fn register_callback(&self, cb: impl FnOnce() + Send + 'static) {
        if let Ok(mut on_interrupt) = self.on_interrupt.lock() {
            on_interrupt.push(Box::new(cb));
        }
    }

    /// Run every registered callback now, in registration order, and
    /// clear the list. Safe to call any number of times.
    pub fn fire_now(&self) {
        let callbacks = match self.on_interrupt.lock() {
            Ok(mut on_interrupt) => std::mem::take(&mut *on_interrupt),
            Err(_) => return,
        };
        for cb in callbacks {
            cb();
        }
    }

    fn listen_once(&'static self) {
        self.once.call_once(|| {
            if let Err(error) = std::thread::Builder::new()
                .name(String::from("trellis-interrupt"))
                .spawn(move || self.watch())
            {
                log::error!("could not spawn the interrupt watcher: {error}");
            }
        });
    }

    fn watch(&self) {
        use signal_hook::consts::signal::{SIGINT, SIGQUIT, SIGTERM};

        // SIGKILL is not interceptable by design, terminate covers
        // the catchable set
        let mut signals = match signal_hook::iterator::Signals::new([SIGINT, SIGTERM, SIGQUIT]) {
            Ok(signals) => signals,
            Err(error) => {
                log::error!("could not subscribe to signals: {error}");
                return;
            }
        };

        if let Some(signal) = signals.forever().next() {
            log::debug!("received signal {signal}, firing interrupt callbacks");
            self.fire_now();
        }
    }
}

/// The process-wide interrupt listener, created on first use.
pub fn interrupt() -> &'static InterruptListener {
    static INTERRUPT: OnceLock<InterruptListener> = OnceLock::new();
    INTERRUPT.get_or_init(InterruptListener::new)
}

/// Register a callback on the process-wide [`interrupt`] listener.
pub fn register_on_interrupt(cb: impl FnOnce() + Send + 'static) {
    interrupt().register(cb);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn fire_now_runs_each_callback_once() {
        let listener = InterruptListener::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = count.clone();
            listener.register_callback(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        listener.fire_now();
        assert_eq!(count.load(Ordering::SeqCst), 3);

        // a second fire has nothing left to run
        listener.fire_now();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn fire_now_preserves_registration_order() {
        let listener = InterruptListener::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for index in 0..4 {
            let order = order.clone();
            listener.register_callback(move || {
                if let Ok(mut order) = order.lock() {
                    order.push(index);
                }
            });
        }

        listener.fire_now();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }
}
