use std::sync::Arc;
use trellis::{handler, BoxFuture, Context, Handler, Handlers};

/**
Per-list behavior for [`ExecutionRules`]. With `force` set, every
handler in the list is wrapped so that completing without a
[`Context::next`] call advances the chain anyway; only
[`Context::stop_execution`] stops it.
*/
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecutionOptions {
    /// wrap handlers to auto-advance the chain
    pub force: bool,
}

impl ExecutionOptions {
    pub(crate) fn build_handler(&self, wrapped: Arc<dyn Handler>) -> Arc<dyn Handler> {
        if !self.force {
            return wrapped;
        }

        handler(move |ctx: &mut Context| -> BoxFuture<'_, ()> {
            let wrapped = wrapped.clone();
            Box::pin(async move {
                // proceed reports whether the handler advanced the
                // cursor itself; if not, advance for it
                if !ctx.proceed(&wrapped).await {
                    ctx.next().await;
                }
            })
        })
    }

    fn apply(&self, handlers: &mut Handlers) -> bool {
        if !self.force {
            return false;
        }

        for entry in handlers.iter_mut() {
            *entry = self.build_handler(entry.clone());
        }

        true
    }
}

/**
Opt-in control over chain advancement, applied once per route at build
time: `begin` covers the route's middleware list, `main` its main
handlers, `done` its cleanup handlers.

When `main` is not forced itself, a forced `begin` splices auto-advance
in front of every main handler except the last, and a forced `done`
wraps the last main handler so the done chain runs even when no main
handler called [`Context::next`].
*/
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecutionRules {
    /// applies to the route's begin (middleware) handlers
    pub begin: ExecutionOptions,
    /// applies to the route's main handlers
    pub main: ExecutionOptions,
    /// applies to the route's done handlers
    pub done: ExecutionOptions,
}

impl ExecutionRules {
    /// Rules with every list forced.
    pub fn forced() -> Self {
        let force = ExecutionOptions { force: true };
        Self {
            begin: force,
            main: force,
            done: force,
        }
    }
}

pub(crate) fn apply_execution_rules(
    rules: &ExecutionRules,
    begin: &mut Handlers,
    done: &mut Handlers,
    main: &mut Handlers,
) {
    if !rules.begin.force && !rules.done.force && !rules.main.force {
        return;
    }

    let begin_ok = rules.begin.apply(begin);
    let main_ok = rules.main.apply(main);
    let done_ok = rules.done.apply(done);

    if !main_ok && !main.is_empty() {
        let last = main.len() - 1;

        if begin_ok && main.len() > 1 {
            for index in 0..last {
                main[index] = rules.begin.build_handler(main[index].clone());
            }
        }

        if done_ok {
            main[last] = rules.done.build_handler(main[last].clone());
        }
    }
}
