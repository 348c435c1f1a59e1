use crate::path::{clean_path, format_path, parse_template, Template, PARAM_START, WILDCARD_PARAM_START};
use http_types::Method;
use std::fmt::{self, Display, Formatter};
use trellis::{FrameworkError, Handlers, RouteInfo};

/**
A registered route.

Identity is `(method, subdomain, path)`. A route carries three handler
lists: `begin` (middleware registered up-front), the main `handlers`
(never empty), and `done` (cleanup); [`Route::build_handlers`] splices
them into one chain at build time.

The method is `None` while the route is offline; offline routes are
excluded from the search trees on the next router build, but stay
reachable through [`Context::exec`](trellis::Context::exec).
*/
pub struct Route {
    /// the stable route name, defaulting to `METHOD + subdomain + path`
    pub name: String,
    method: Option<Method>,
    method_backup: Option<Method>,
    /// the subdomain this route is keyed under, including its
    /// trailing dot (`admin.`), or empty
    pub subdomain: String,
    tmpl: Template,
    begin_handlers: Handlers,
    /// the main handler chain, executed in order; never empty
    pub handlers: Handlers,
    /// the name of the first main handler, for traces
    pub main_handler_name: String,
    done_handlers: Handlers,
    /// the cleaned path this route matches
    pub path: String,
    /// the path with parameter positions replaced by `%v`
    pub formatted_path: String,
    prepared: bool,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("method", &self.method)
            .field("subdomain", &self.subdomain)
            .field("path", &self.path)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl Route {
    /**
    Construct a route from its method, subdomain, raw path and main
    handler chain. The path is parsed into a template; parsing
    failures and an empty chain are build errors.
    */
    pub fn new(
        method: Method,
        subdomain: &str,
        unparsed_path: &str,
        handlers: Handlers,
    ) -> Result<Self, FrameworkError> {
        if handlers.is_empty() {
            return Err(FrameworkError::new(format!(
                "route {method} {subdomain}{unparsed_path}: main handlers cannot be empty"
            )));
        }

        let tmpl = parse_template(unparsed_path)?;
        let path = clean_path(unparsed_path);
        let name = format!("{}{}{}", method, subdomain, tmpl.src);
        let formatted_path = format_path(&path);
        let main_handler_name = handlers[0].name().into_owned();

        Ok(Self {
            name,
            method: Some(method),
            method_backup: Some(method),
            subdomain: String::from(subdomain),
            tmpl,
            begin_handlers: Vec::new(),
            handlers,
            main_handler_name,
            done_handlers: Vec::new(),
            path,
            formatted_path,
            prepared: false,
        })
    }

    /// The route's method; `None` when the route is offline.
    pub fn method(&self) -> Option<Method> {
        self.method
    }

    /// The parsed path template.
    pub fn tmpl(&self) -> &Template {
        &self.tmpl
    }

    /// Add begin handlers (middleware) to this route. They run before
    /// the main chain once [`Route::build_handlers`] has spliced them.
    pub fn use_handlers(&mut self, handlers: Handlers) {
        if handlers.is_empty() {
            return;
        }
        self.begin_handlers.extend(handlers);
    }

    /// Add done handlers to this route. They run after the main chain
    /// once [`Route::build_handlers`] has spliced them.
    pub fn done(&mut self, handlers: Handlers) {
        if handlers.is_empty() {
            return;
        }
        self.done_handlers.extend(handlers);
    }

    /**
    One-time build preparation: apply the execution rules to the three
    handler lists, then splice them. Subsequent router rebuilds leave
    an already prepared route untouched, so refreshes do not wrap the
    chain twice.
    */
    pub(crate) fn prepare(&mut self, rules: &crate::execution_rules::ExecutionRules) {
        if self.prepared {
            return;
        }
        self.prepared = true;

        crate::execution_rules::apply_execution_rules(
            rules,
            &mut self.begin_handlers,
            &mut self.done_handlers,
            &mut self.handlers,
        );
        self.build_handlers();
    }

    /**
    Splice `begin ++ main ++ done` into the main chain and clear the
    temporary lists. Executed by the router at build time; idempotent
    afterwards.
    */
    pub fn build_handlers(&mut self) {
        if !self.begin_handlers.is_empty() {
            let mut combined = std::mem::take(&mut self.begin_handlers);
            combined.extend(std::mem::take(&mut self.handlers));
            self.handlers = combined;
        }

        if !self.done_handlers.is_empty() {
            self.handlers.extend(std::mem::take(&mut self.done_handlers));
        }
    }

    /**
    Change this route's method, preserving the previous one so
    [`Route::restore_status`] can undo the change. `None` marks the
    route offline. A router refresh is required for the change to take
    effect. Returns whether anything changed.
    */
    pub fn change_method(&mut self, method: Option<Method>) -> bool {
        if method != self.method {
            self.method_backup = self.method;
            self.method = method;
            true
        } else {
            false
        }
    }

    /// Mark this route offline. A router refresh is required for the
    /// change to take effect.
    pub fn set_status_offline(&mut self) -> bool {
        self.change_method(None)
    }

    /// Restore the method this route had before the last
    /// [`Route::change_method`]. A router refresh is required for the
    /// change to take effect.
    pub fn restore_status(&mut self) -> bool {
        self.change_method(self.method_backup)
    }

    /// Whether this route participates in request matching.
    pub fn is_online(&self) -> bool {
        self.method.is_some()
    }

    /// The static portion of the registered path, up to the first
    /// dynamic segment.
    pub fn static_path(&self) -> &str {
        let src = &self.tmpl.src;
        let dynamic = src
            .find(PARAM_START)
            .into_iter()
            .chain(src.find(WILDCARD_PARAM_START))
            .min();

        match dynamic {
            Some(0) | None => src,
            Some(index) => src[..index].trim_end_matches('/'),
        }
    }

    /**
    Substitute `args` into the formatted path. A trailing wildcard
    consumes all remaining args, joined by `/`.

    Feeding the result back as a request path matches this route and
    binds the same values.
    */
    pub fn resolve_path(&self, args: &[&str]) -> String {
        if self.path == self.formatted_path {
            // static, nothing to substitute
            return self.path.clone();
        }

        let mut resolved = self.formatted_path.clone();
        let placeholders = resolved.matches("%v").count();

        for (index, arg) in args.iter().enumerate() {
            if index + 1 == placeholders && self.tmpl.has_wildcard() {
                let tail = args[index..].join("/");
                resolved = resolved.replacen("%v", &tail, 1);
                break;
            }
            resolved = resolved.replacen("%v", arg, 1);
        }

        resolved
    }

    /// A read-only view of this route for contexts.
    pub fn info(&self) -> RouteInfo {
        RouteInfo {
            name: self.name.clone(),
            method: self.method,
            subdomain: self.subdomain.clone(),
            path: self.path.clone(),
            formatted_path: self.formatted_path.clone(),
        }
    }

    /// A one-line debug trace of this route.
    pub fn trace(&self) -> String {
        let mut trace = match self.method {
            Some(method) => format!("{method}:"),
            None => String::from("offline:"),
        };
        if !self.subdomain.is_empty() {
            trace.push_str(&format!(" {}", self.subdomain));
        }
        trace.push_str(&format!(" {} ", self.tmpl.src));

        if self.handlers.len() > 1 {
            trace.push_str(&format!(
                "-> {}() and {} more",
                self.main_handler_name,
                self.handlers.len() - 1
            ));
        } else {
            trace.push_str(&format!("-> {}()", self.main_handler_name));
        }
        trace
    }
}

impl Display for Route {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.method {
            Some(method) => write!(f, "{} {}{}", method, self.subdomain, self.tmpl.src),
            None => write!(f, "NONE {}{}", self.subdomain, self.tmpl.src),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use trellis::{handler, Context, Handler};

    fn noop() -> Arc<dyn Handler> {
        handler(|_ctx: &mut Context| -> trellis::BoxFuture<'_, ()> { Box::pin(async {}) })
    }

    #[test]
    fn build_handlers_splices_once() {
        let mut route = Route::new(Method::Get, "", "/x", vec![noop()]).unwrap();
        route.use_handlers(vec![noop(), noop()]);
        route.done(vec![noop()]);

        route.build_handlers();
        assert_eq!(route.handlers.len(), 4);

        // idempotent after build
        route.build_handlers();
        assert_eq!(route.handlers.len(), 4);
    }

    #[test]
    fn method_toggling() {
        let mut route = Route::new(Method::Get, "", "/x", vec![noop()]).unwrap();
        assert!(route.is_online());

        assert!(route.set_status_offline());
        assert!(!route.is_online());

        assert!(route.restore_status());
        assert_eq!(route.method(), Some(Method::Get));

        assert!(route.change_method(Some(Method::Post)));
        assert!(route.restore_status());
        assert_eq!(route.method(), Some(Method::Get));
    }

    #[test]
    fn resolve_static_and_named() {
        let route = Route::new(Method::Get, "", "/users/:id/files/:name", vec![noop()]).unwrap();
        assert_eq!(route.resolve_path(&["42", "report"]), "/users/42/files/report");

        let fixed = Route::new(Method::Get, "", "/about", vec![noop()]).unwrap();
        assert_eq!(fixed.resolve_path(&[]), "/about");
    }

    #[test]
    fn resolve_wildcard_joins_remaining() {
        let route = Route::new(Method::Get, "", "/files/*path", vec![noop()]).unwrap();
        assert_eq!(route.resolve_path(&["a", "b", "c"]), "/files/a/b/c");

        let mixed = Route::new(Method::Get, "", "/u/:id/*rest", vec![noop()]).unwrap();
        assert_eq!(mixed.resolve_path(&["7", "x", "y"]), "/u/7/x/y");
    }

    #[test]
    fn static_path() {
        let route = Route::new(Method::Get, "", "/user/:id/friend", vec![noop()]).unwrap();
        assert_eq!(route.static_path(), "/user");

        let fixed = Route::new(Method::Get, "", "/assets", vec![noop()]).unwrap();
        assert_eq!(fixed.static_path(), "/assets");
    }
}
